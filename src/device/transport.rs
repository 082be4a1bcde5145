//! The seam between a [`ConnectionSession`](super::ConnectionSession) and the
//! platform's wireless stack.
//!
//! Requests are fire-and-forget: every call returns as soon as the request is
//! queued, and the outcome arrives later as a [`TransportSignal`] on the
//! channel handed to [`Transport::connect`].

use crate::device::types::DeviceAddress;
use crossbeam_channel::Sender;
use std::fmt;
use uuid::Uuid;

/// Opaque identifier for one link. Handles are never reused by a transport,
/// so a signal carrying an old handle can always be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkHandle(pub u64);

impl fmt::Display for LinkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// Completion status reported by the stack (0 = success, as in ATT).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattStatus(pub u8);

impl GattStatus {
    pub const SUCCESS: GattStatus = GattStatus(0x00);
    /// Generic failure, used when the backend does not report an ATT code.
    pub const FAILURE: GattStatus = GattStatus(0x85);

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }
}

/// A characteristic found during service discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub descriptors: Vec<Uuid>,
}

/// A primary service found during service discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristic>,
}

impl GattService {
    pub fn characteristic(&self, uuid: Uuid) -> Option<&GattCharacteristic> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }
}

/// Asynchronous completion delivered by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalKind {
    /// The link is established.
    LinkUp,
    /// The link dropped (peer went away, out of range, adapter off).
    LinkLost,
    ServicesDiscovered {
        status: GattStatus,
        services: Vec<GattService>,
    },
    DescriptorWritten {
        status: GattStatus,
        characteristic: Uuid,
        descriptor: Uuid,
    },
    CharacteristicRead {
        status: GattStatus,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    CharacteristicChanged {
        characteristic: Uuid,
        value: Vec<u8>,
    },
}

/// A signal tagged with the link it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportSignal {
    pub link: LinkHandle,
    pub kind: SignalKind,
}

impl TransportSignal {
    pub fn new(link: LinkHandle, kind: SignalKind) -> Self {
        Self { link, kind }
    }
}

/// Errors raised synchronously when a request cannot even be queued.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("bluetooth adapter unavailable: {0}")]
    AdapterUnavailable(String),
    #[error("unknown link {0}")]
    UnknownLink(LinkHandle),
    #[error("request rejected: {0}")]
    Rejected(String),
}

/// Platform wireless stack, as seen by a session.
pub trait Transport: Send {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Start connecting to `address`. Completions for the returned handle are
    /// sent on `signals`, starting with [`SignalKind::LinkUp`].
    fn connect(
        &mut self,
        address: &DeviceAddress,
        signals: Sender<TransportSignal>,
    ) -> Result<LinkHandle, TransportError>;

    fn discover_services(&mut self, link: LinkHandle) -> Result<(), TransportError>;

    /// Turn on notifications by writing the enable value to the
    /// characteristic's configuration descriptor.
    fn enable_notifications(
        &mut self,
        link: LinkHandle,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), TransportError>;

    fn read(
        &mut self,
        link: LinkHandle,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), TransportError>;

    /// Disconnect and free the link. The handle must not be used afterwards.
    fn release(&mut self, link: LinkHandle);
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn connect(
        &mut self,
        address: &DeviceAddress,
        signals: Sender<TransportSignal>,
    ) -> Result<LinkHandle, TransportError> {
        (**self).connect(address, signals)
    }

    fn discover_services(&mut self, link: LinkHandle) -> Result<(), TransportError> {
        (**self).discover_services(link)
    }

    fn enable_notifications(
        &mut self,
        link: LinkHandle,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), TransportError> {
        (**self).enable_notifications(link, service, characteristic)
    }

    fn read(
        &mut self,
        link: LinkHandle,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), TransportError> {
        (**self).read(link, service, characteristic)
    }

    fn release(&mut self, link: LinkHandle) {
        (**self).release(link)
    }
}
