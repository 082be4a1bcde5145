//! A single connection to one posture peripheral.

use crate::activity::SharedActivityLog;
use crate::device::protocol::{Effect, Input, LinkPhase, Protocol, Refusal, Step};
use crate::device::transport::{LinkHandle, SignalKind, Transport, TransportError, TransportSignal};
use crate::device::types::{
    AddressParseError, ConnectionState, DeviceAddress, PostureEvent, POSTURE_CHARACTERISTIC_UUID,
    POSTURE_SERVICE_UUID,
};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Errors returned by [`ConnectionSession::connect`].
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    InvalidAddress(#[from] AddressParseError),
    #[error("bluetooth adapter unavailable: {0}")]
    AdapterUnavailable(String),
    #[error("a session is already active")]
    AlreadyActive,
    #[error("transport error: {0}")]
    Transport(TransportError),
}

impl From<TransportError> for SessionError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::AdapterUnavailable(reason) => SessionError::AdapterUnavailable(reason),
            other => SessionError::Transport(other),
        }
    }
}

/// Cloneable, thread-safe view of a session's [`ConnectionState`].
#[derive(Debug, Clone, Default)]
pub struct StateHandle(Arc<AtomicU8>);

impl StateHandle {
    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::SeqCst))
    }

    fn set(&self, state: ConnectionState) {
        self.0.store(state.to_u8(), Ordering::SeqCst);
    }
}

/// Drives one peripheral through connect, discovery, subscription and read,
/// and forwards decoded posture events to a sink.
///
/// Transport completions are queued on an internal channel and applied by
/// [`pump`](Self::pump), so every state transition happens on the thread that
/// owns the session.
pub struct ConnectionSession<T: Transport> {
    transport: T,
    protocol: Protocol,
    link: Option<LinkHandle>,
    address: Option<DeviceAddress>,
    sink: Option<Sender<PostureEvent>>,
    signal_tx: Sender<TransportSignal>,
    signal_rx: Receiver<TransportSignal>,
    state: StateHandle,
    activity: Option<SharedActivityLog>,
}

impl<T: Transport> ConnectionSession<T> {
    pub fn new(transport: T) -> Self {
        let (signal_tx, signal_rx) = unbounded();
        Self {
            transport,
            protocol: Protocol::new(),
            link: None,
            address: None,
            sink: None,
            signal_tx,
            signal_rx,
            state: StateHandle::default(),
            activity: None,
        }
    }

    /// Record payload and session counters in `log`.
    pub fn with_activity_log(mut self, log: SharedActivityLog) -> Self {
        self.activity = Some(log);
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.protocol.state()
    }

    pub fn state_handle(&self) -> StateHandle {
        self.state.clone()
    }

    pub fn link_phase(&self) -> Option<LinkPhase> {
        self.protocol.phase()
    }

    pub fn is_degraded(&self) -> bool {
        self.protocol.phase() == Some(LinkPhase::Degraded)
    }

    pub fn address(&self) -> Option<DeviceAddress> {
        self.address
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Start connecting to the peripheral at `address`.
    ///
    /// Returns once the connect request is queued; progress is reported on
    /// `sink`, beginning with [`PostureEvent::Connected`]. On error the session
    /// stays Disconnected and `sink` is dropped.
    pub fn connect(
        &mut self,
        address: &str,
        sink: Sender<PostureEvent>,
    ) -> Result<(), SessionError> {
        let address: DeviceAddress = address.parse()?;

        match self.protocol.handle(Input::ConnectRequested) {
            Ok(_) => {}
            Err(Refusal::AlreadyActive) => return Err(SessionError::AlreadyActive),
        }
        self.sink = Some(sink);
        self.address = Some(address);
        self.publish_state();

        info!(%address, transport = self.transport.name(), "connecting to posture corrector");
        match self.transport.connect(&address, self.signal_tx.clone()) {
            Ok(link) => {
                debug!(%link, "connect request queued");
                self.link = Some(link);
                if let Some(ref activity) = self.activity {
                    activity.record_session_started();
                }
                Ok(())
            }
            Err(err) => {
                warn!(%address, error = %err, "connect request failed");
                self.apply(Input::ConnectFailed);
                Err(err.into())
            }
        }
    }

    /// Tear the session down. Safe to call at any time; only the first call
    /// on an active session has any effect.
    pub fn disconnect(&mut self) {
        if self.protocol.state() != ConnectionState::Disconnected {
            info!("disconnecting from posture corrector");
        }
        self.apply(Input::DisconnectRequested);
    }

    /// Apply queued transport signals, waiting up to `timeout` for the first.
    /// Returns the number of signals processed.
    pub fn pump(&mut self, timeout: Duration) -> usize {
        let first = match self.signal_rx.recv_timeout(timeout) {
            Ok(signal) => signal,
            // The session holds a sender, so the channel never disconnects.
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => return 0,
        };

        let mut processed = 1;
        self.process_signal(first);
        while let Ok(signal) = self.signal_rx.try_recv() {
            self.process_signal(signal);
            processed += 1;
        }
        processed
    }

    /// Apply one transport signal.
    pub fn process_signal(&mut self, signal: TransportSignal) {
        if self.link != Some(signal.link) {
            debug!(link = %signal.link, "dropping signal for a released link");
            return;
        }

        let payload = matches!(
            signal.kind,
            SignalKind::CharacteristicChanged { .. } | SignalKind::CharacteristicRead { .. }
        );
        if matches!(signal.kind, SignalKind::LinkLost) {
            info!(link = %signal.link, "link lost");
        }

        let decoded = self.apply(Input::Signal(signal.kind));
        if payload {
            if let Some(ref activity) = self.activity {
                activity.record_payload(decoded);
            }
            if !decoded {
                debug!("ignoring unrecognised posture payload");
            }
        }
    }

    /// Run `input` and every follow-up it causes. Returns whether a posture
    /// was emitted.
    fn apply(&mut self, input: Input) -> bool {
        let mut pending = VecDeque::from([input]);
        let mut emitted_posture = false;

        while let Some(input) = pending.pop_front() {
            let effects = match self.protocol.handle(input) {
                Ok(effects) => effects,
                Err(Refusal::AlreadyActive) => Vec::new(),
            };
            for effect in effects {
                if matches!(effect, Effect::Emit(PostureEvent::PostureChanged(_))) {
                    emitted_posture = true;
                }
                if let Some(next) = self.execute(effect) {
                    pending.push_back(next);
                }
            }
        }

        self.publish_state();
        emitted_posture
    }

    fn execute(&mut self, effect: Effect) -> Option<Input> {
        match effect {
            Effect::Emit(event) => {
                self.emit(event);
                None
            }
            Effect::DiscoverServices => self.request(Step::Discovery, |transport, link| {
                transport.discover_services(link)
            }),
            Effect::EnableNotifications => self.request(Step::Subscription, |transport, link| {
                transport.enable_notifications(link, POSTURE_SERVICE_UUID, POSTURE_CHARACTERISTIC_UUID)
            }),
            Effect::ReadCharacteristic => self.request(Step::Read, |transport, link| {
                transport.read(link, POSTURE_SERVICE_UUID, POSTURE_CHARACTERISTIC_UUID)
            }),
            Effect::ReleaseLink => {
                if let Some(link) = self.link.take() {
                    debug!(%link, "releasing link");
                    self.transport.release(link);
                }
                None
            }
            Effect::DetachSink => {
                self.sink = None;
                None
            }
            Effect::Degraded {
                step: Step::Read,
                reason,
            } => {
                debug!(%reason, "initial posture read failed, waiting for notifications");
                None
            }
            Effect::Degraded { step, reason } => {
                warn!(
                    step = step.as_str(),
                    %reason,
                    "posture characteristic unavailable, link stays connected without posture updates"
                );
                None
            }
        }
    }

    fn request<F>(&mut self, step: Step, send: F) -> Option<Input>
    where
        F: FnOnce(&mut T, LinkHandle) -> Result<(), TransportError>,
    {
        let link = self.link?;
        match send(&mut self.transport, link) {
            Ok(()) => None,
            Err(err) => {
                warn!(step = step.as_str(), error = %err, "transport rejected request");
                Some(Input::RequestRejected(step))
            }
        }
    }

    fn emit(&self, event: PostureEvent) {
        match event {
            PostureEvent::Connected => info!("posture corrector connected"),
            PostureEvent::Disconnected => info!("posture corrector disconnected"),
            PostureEvent::PostureChanged(posture) => debug!(%posture, "posture reported"),
            PostureEvent::SessionEnded => debug!("flushing open posture interval"),
        }

        if let Some(ref sink) = self.sink {
            if sink.send(event).is_err() {
                debug!(?event, "event sink closed, dropping event");
            }
        }
    }

    fn publish_state(&self) {
        self.state.set(self.protocol.state());
    }
}

impl<T: Transport> Drop for ConnectionSession<T> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::simulated::{PeripheralHandle, PeripheralProfile, SimulatedTransport};
    use crate::device::types::Posture;
    use uuid::Uuid;

    const ADDRESS: &str = "D4:D4:DA:44:28:86";

    fn drain(rx: &Receiver<PostureEvent>) -> Vec<PostureEvent> {
        rx.try_iter().collect()
    }

    /// Simulated peripheral whose transport refuses selected requests.
    struct RefusingTransport {
        inner: SimulatedTransport,
        refuse: Step,
    }

    impl RefusingTransport {
        fn new(refuse: Step) -> Self {
            Self {
                inner: SimulatedTransport::new(PeripheralProfile::default()),
                refuse,
            }
        }

        fn check(&self, step: Step) -> Result<(), TransportError> {
            if step == self.refuse {
                return Err(TransportError::Rejected(format!("{} refused", step.as_str())));
            }
            Ok(())
        }
    }

    impl Transport for RefusingTransport {
        fn name(&self) -> &'static str {
            "refusing"
        }

        fn connect(
            &mut self,
            address: &DeviceAddress,
            signals: Sender<TransportSignal>,
        ) -> Result<LinkHandle, TransportError> {
            self.inner.connect(address, signals)
        }

        fn discover_services(&mut self, link: LinkHandle) -> Result<(), TransportError> {
            self.check(Step::Discovery)?;
            self.inner.discover_services(link)
        }

        fn enable_notifications(
            &mut self,
            link: LinkHandle,
            service: Uuid,
            characteristic: Uuid,
        ) -> Result<(), TransportError> {
            self.check(Step::Subscription)?;
            self.inner.enable_notifications(link, service, characteristic)
        }

        fn read(
            &mut self,
            link: LinkHandle,
            service: Uuid,
            characteristic: Uuid,
        ) -> Result<(), TransportError> {
            self.check(Step::Read)?;
            self.inner.read(link, service, characteristic)
        }

        fn release(&mut self, link: LinkHandle) {
            self.inner.release(link)
        }
    }

    fn refusing_session(
        refuse: Step,
    ) -> (ConnectionSession<RefusingTransport>, PeripheralHandle, Receiver<PostureEvent>) {
        let transport = RefusingTransport::new(refuse);
        let peripheral = transport.inner.peripheral();
        peripheral.set_value(b"bad");

        let mut session = ConnectionSession::new(transport);
        let (tx, rx) = unbounded();
        session.connect(ADDRESS, tx).unwrap();
        while session.pump(Duration::from_millis(10)) > 0 {}
        (session, peripheral, rx)
    }

    #[test]
    fn test_refused_discovery_degrades_link() {
        let (session, peripheral, rx) = refusing_session(Step::Discovery);
        peripheral.notify(b"bad");

        assert_eq!(session.state(), ConnectionState::Connected);
        assert!(session.is_degraded());
        assert_eq!(drain(&rx), vec![PostureEvent::Connected]);
    }

    #[test]
    fn test_refused_subscription_degrades_link() {
        let (mut session, peripheral, rx) = refusing_session(Step::Subscription);
        peripheral.notify(b"bad");
        while session.pump(Duration::from_millis(10)) > 0 {}

        assert_eq!(session.state(), ConnectionState::Connected);
        assert!(session.is_degraded());
        assert!(!peripheral.is_subscribed());
        assert_eq!(drain(&rx), vec![PostureEvent::Connected]);
    }

    #[test]
    fn test_refused_read_keeps_subscription() {
        let (mut session, peripheral, rx) = refusing_session(Step::Read);

        assert_eq!(session.link_phase(), Some(LinkPhase::Subscribed));
        assert_eq!(drain(&rx), vec![PostureEvent::Connected]);

        peripheral.notify(b"ok");
        while session.pump(Duration::from_millis(10)) > 0 {}
        assert_eq!(
            drain(&rx),
            vec![PostureEvent::PostureChanged(Posture::Stretched)]
        );
    }

    #[test]
    fn test_malformed_address_fails_immediately() {
        let mut session = ConnectionSession::new(SimulatedTransport::new(PeripheralProfile::default()));
        let (tx, rx) = unbounded();

        let err = session.connect("not-an-address", tx).unwrap_err();
        assert!(matches!(err, SessionError::InvalidAddress(_)));
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(drain(&rx).is_empty());
    }

    #[test]
    fn test_unavailable_adapter_fails_immediately() {
        let profile = PeripheralProfile {
            adapter_available: false,
            ..PeripheralProfile::default()
        };
        let mut session = ConnectionSession::new(SimulatedTransport::new(profile));
        let (tx, rx) = unbounded();

        let err = session.connect(ADDRESS, tx).unwrap_err();
        assert!(matches!(err, SessionError::AdapterUnavailable(_)));
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(session.state_handle().get(), ConnectionState::Disconnected);
        // The sink was dropped with the failed attempt.
        assert!(rx.recv_timeout(Duration::from_millis(10)).is_err());
    }

    #[test]
    fn test_second_connect_is_refused() {
        let mut session = ConnectionSession::new(SimulatedTransport::new(PeripheralProfile::default()));
        let (tx, _rx) = unbounded();
        session.connect(ADDRESS, tx.clone()).unwrap();

        let err = session.connect(ADDRESS, tx).unwrap_err();
        assert!(matches!(err, SessionError::AlreadyActive));
    }

    #[test]
    fn test_handshake_reads_initial_value() {
        let transport = SimulatedTransport::new(PeripheralProfile::default());
        let peripheral = transport.peripheral();
        peripheral.set_value(b"bad");

        let mut session = ConnectionSession::new(transport);
        let (tx, rx) = unbounded();
        session.connect(ADDRESS, tx).unwrap();
        assert_eq!(session.state(), ConnectionState::Connecting);

        while session.pump(Duration::from_millis(10)) > 0 {}

        assert_eq!(session.state(), ConnectionState::Connected);
        assert_eq!(session.link_phase(), Some(LinkPhase::Subscribed));
        assert_eq!(
            drain(&rx),
            vec![
                PostureEvent::Connected,
                PostureEvent::PostureChanged(Posture::Hunched)
            ]
        );
    }

    #[test]
    fn test_disconnect_with_step_in_flight() {
        let transport = SimulatedTransport::new(PeripheralProfile::default());
        let peripheral = transport.peripheral();
        let mut session = ConnectionSession::new(transport);
        let (tx, rx) = unbounded();
        session.connect(ADDRESS, tx).unwrap();

        // Process LinkUp only; discovery completion stays queued.
        let link_up = session.signal_rx.recv().unwrap();
        session.process_signal(link_up);
        session.disconnect();

        while session.pump(Duration::from_millis(10)) > 0 {}

        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(
            drain(&rx),
            vec![PostureEvent::Connected, PostureEvent::Disconnected]
        );
        assert_eq!(peripheral.release_count(), 1);
    }

    #[test]
    fn test_link_loss_then_disconnect_releases_once() {
        let transport = SimulatedTransport::new(PeripheralProfile::default());
        let peripheral = transport.peripheral();
        let mut session = ConnectionSession::new(transport);
        let (tx, rx) = unbounded();
        session.connect(ADDRESS, tx).unwrap();
        while session.pump(Duration::from_millis(10)) > 0 {}

        peripheral.notify(b"ok");
        peripheral.drop_link();
        while session.pump(Duration::from_millis(10)) > 0 {}
        session.disconnect();
        session.disconnect();

        let events = drain(&rx);
        assert_eq!(
            &events[events.len() - 2..],
            &[PostureEvent::SessionEnded, PostureEvent::Disconnected]
        );
        assert_eq!(peripheral.release_count(), 1);
    }
}
