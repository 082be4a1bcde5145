//! Connection/subscription state machine for the posture peripheral.
//!
//! [`Protocol::handle`] maps `(state, input)` to a new state plus a list of
//! [`Effect`]s. It never touches a transport or a channel, which keeps the
//! whole handshake testable with plain values.

use crate::device::transport::{GattService, GattStatus, SignalKind};
use crate::device::types::{
    ConnectionState, Posture, PostureEvent, CCCD_UUID, POSTURE_CHARACTERISTIC_UUID,
    POSTURE_SERVICE_UUID,
};

/// Where a connected link is in the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPhase {
    /// Waiting for the stack to report the link as established.
    AwaitingLink,
    Discovering,
    /// Descriptor write issued, waiting for its completion.
    Subscribing,
    /// Notifications enabled; posture tokens are decoded.
    Subscribed,
    /// Connected, but the posture characteristic could not be subscribed.
    /// No posture events will arrive on this link.
    Degraded,
}

/// Handshake step that can fail without tearing the link down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Discovery,
    Subscription,
    Read,
}

impl Step {
    pub fn as_str(self) -> &'static str {
        match self {
            Step::Discovery => "discovery",
            Step::Subscription => "subscription",
            Step::Read => "read",
        }
    }
}

/// Everything the state machine reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    ConnectRequested,
    /// The transport refused the connect request.
    ConnectFailed,
    DisconnectRequested,
    /// A request for `Step` was rejected before reaching the peer.
    RequestRejected(Step),
    Signal(SignalKind),
}

/// Side effects the session must carry out, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Emit(PostureEvent),
    DiscoverServices,
    EnableNotifications,
    ReadCharacteristic,
    ReleaseLink,
    DetachSink,
    /// A step failed; the link stays up but is degraded.
    Degraded { step: Step, reason: String },
}

/// Reasons a request to connect is refused by the state machine itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refusal {
    AlreadyActive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Protocol {
    phase: Option<LinkPhase>,
    posture_seen: bool,
}

impl Protocol {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConnectionState {
        match self.phase {
            None => ConnectionState::Disconnected,
            Some(LinkPhase::AwaitingLink) => ConnectionState::Connecting,
            Some(_) => ConnectionState::Connected,
        }
    }

    pub fn phase(&self) -> Option<LinkPhase> {
        self.phase
    }

    /// Whether a posture has been decoded since the link came up.
    pub fn posture_seen(&self) -> bool {
        self.posture_seen
    }

    /// Advance the state machine.
    ///
    /// `ConnectRequested` on an active session is the only input that is
    /// refused; every other input in a state where it makes no sense is
    /// ignored and yields no effects.
    pub fn handle(&mut self, input: Input) -> Result<Vec<Effect>, Refusal> {
        match input {
            Input::ConnectRequested => {
                if self.phase.is_some() {
                    return Err(Refusal::AlreadyActive);
                }
                self.phase = Some(LinkPhase::AwaitingLink);
                self.posture_seen = false;
                Ok(Vec::new())
            }
            Input::ConnectFailed => {
                if self.phase != Some(LinkPhase::AwaitingLink) {
                    return Ok(Vec::new());
                }
                self.phase = None;
                Ok(vec![Effect::DetachSink])
            }
            Input::DisconnectRequested => Ok(self.teardown()),
            Input::RequestRejected(step) => Ok(self.degrade(step, "request rejected by transport")),
            Input::Signal(kind) => Ok(self.on_signal(kind)),
        }
    }

    fn on_signal(&mut self, kind: SignalKind) -> Vec<Effect> {
        match (self.phase, kind) {
            (None, _) => Vec::new(),
            (Some(_), SignalKind::LinkLost) => self.teardown(),
            (Some(LinkPhase::AwaitingLink), SignalKind::LinkUp) => {
                self.phase = Some(LinkPhase::Discovering);
                vec![
                    Effect::Emit(PostureEvent::Connected),
                    Effect::DiscoverServices,
                ]
            }
            (Some(LinkPhase::Discovering), SignalKind::ServicesDiscovered { status, services }) => {
                self.on_services_discovered(status, &services)
            }
            (
                Some(LinkPhase::Subscribing),
                SignalKind::DescriptorWritten {
                    status,
                    characteristic,
                    descriptor,
                },
            ) => {
                if characteristic != POSTURE_CHARACTERISTIC_UUID || descriptor != CCCD_UUID {
                    return Vec::new();
                }
                if !status.is_success() {
                    return self.degrade(
                        Step::Subscription,
                        &format!("descriptor write failed with status {:#04x}", status.0),
                    );
                }
                self.phase = Some(LinkPhase::Subscribed);
                vec![Effect::ReadCharacteristic]
            }
            (
                Some(LinkPhase::Subscribed),
                SignalKind::CharacteristicRead {
                    status,
                    characteristic,
                    value,
                },
            ) => {
                if characteristic != POSTURE_CHARACTERISTIC_UUID || !status.is_success() {
                    return Vec::new();
                }
                self.decode(&value)
            }
            (
                Some(LinkPhase::Subscribing | LinkPhase::Subscribed),
                SignalKind::CharacteristicChanged {
                    characteristic,
                    value,
                },
            ) => {
                if characteristic != POSTURE_CHARACTERISTIC_UUID {
                    return Vec::new();
                }
                self.decode(&value)
            }
            _ => Vec::new(),
        }
    }

    fn on_services_discovered(&mut self, status: GattStatus, services: &[GattService]) -> Vec<Effect> {
        if !status.is_success() {
            return self.degrade(
                Step::Discovery,
                &format!("service discovery failed with status {:#04x}", status.0),
            );
        }

        let Some(service) = services.iter().find(|s| s.uuid == POSTURE_SERVICE_UUID) else {
            return self.degrade(Step::Discovery, "posture service not found");
        };
        let Some(characteristic) = service.characteristic(POSTURE_CHARACTERISTIC_UUID) else {
            return self.degrade(Step::Discovery, "posture characteristic not found");
        };
        if !characteristic.descriptors.contains(&CCCD_UUID) {
            return self.degrade(Step::Discovery, "notification descriptor not found");
        }

        self.phase = Some(LinkPhase::Subscribing);
        vec![Effect::EnableNotifications]
    }

    fn decode(&mut self, value: &[u8]) -> Vec<Effect> {
        match Posture::decode(value) {
            Some(posture) => {
                self.posture_seen = true;
                vec![Effect::Emit(PostureEvent::PostureChanged(posture))]
            }
            None => Vec::new(),
        }
    }

    fn degrade(&mut self, step: Step, reason: &str) -> Vec<Effect> {
        let phase_matches = matches!(
            (self.phase, step),
            (Some(LinkPhase::Discovering), Step::Discovery)
                | (Some(LinkPhase::Subscribing), Step::Subscription)
                | (Some(LinkPhase::Subscribed), Step::Read)
        );
        if !phase_matches {
            return Vec::new();
        }

        // A failed read only loses the initial value; notifications still work.
        if step != Step::Read {
            self.phase = Some(LinkPhase::Degraded);
        }
        vec![Effect::Degraded {
            step,
            reason: reason.to_string(),
        }]
    }

    /// Runs only on the transition into Disconnected.
    fn teardown(&mut self) -> Vec<Effect> {
        if self.phase.take().is_none() {
            return Vec::new();
        }

        let mut effects = Vec::with_capacity(4);
        if std::mem::take(&mut self.posture_seen) {
            effects.push(Effect::Emit(PostureEvent::SessionEnded));
        }
        effects.push(Effect::Emit(PostureEvent::Disconnected));
        effects.push(Effect::ReleaseLink);
        effects.push(Effect::DetachSink);
        effects
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::transport::GattCharacteristic;

    fn posture_services() -> Vec<GattService> {
        vec![GattService {
            uuid: POSTURE_SERVICE_UUID,
            characteristics: vec![GattCharacteristic {
                uuid: POSTURE_CHARACTERISTIC_UUID,
                descriptors: vec![CCCD_UUID],
            }],
        }]
    }

    fn signal(protocol: &mut Protocol, kind: SignalKind) -> Vec<Effect> {
        protocol.handle(Input::Signal(kind)).unwrap()
    }

    fn subscribed() -> Protocol {
        let mut protocol = Protocol::new();
        protocol.handle(Input::ConnectRequested).unwrap();
        signal(&mut protocol, SignalKind::LinkUp);
        signal(
            &mut protocol,
            SignalKind::ServicesDiscovered {
                status: GattStatus::SUCCESS,
                services: posture_services(),
            },
        );
        signal(
            &mut protocol,
            SignalKind::DescriptorWritten {
                status: GattStatus::SUCCESS,
                characteristic: POSTURE_CHARACTERISTIC_UUID,
                descriptor: CCCD_UUID,
            },
        );
        protocol
    }

    #[test]
    fn test_happy_path_handshake() {
        let mut protocol = Protocol::new();
        assert_eq!(protocol.state(), ConnectionState::Disconnected);

        assert!(protocol.handle(Input::ConnectRequested).unwrap().is_empty());
        assert_eq!(protocol.state(), ConnectionState::Connecting);

        let effects = signal(&mut protocol, SignalKind::LinkUp);
        assert_eq!(
            effects,
            vec![
                Effect::Emit(PostureEvent::Connected),
                Effect::DiscoverServices
            ]
        );
        assert_eq!(protocol.state(), ConnectionState::Connected);

        let effects = signal(
            &mut protocol,
            SignalKind::ServicesDiscovered {
                status: GattStatus::SUCCESS,
                services: posture_services(),
            },
        );
        assert_eq!(effects, vec![Effect::EnableNotifications]);
        assert_eq!(protocol.phase(), Some(LinkPhase::Subscribing));

        let effects = signal(
            &mut protocol,
            SignalKind::DescriptorWritten {
                status: GattStatus::SUCCESS,
                characteristic: POSTURE_CHARACTERISTIC_UUID,
                descriptor: CCCD_UUID,
            },
        );
        assert_eq!(effects, vec![Effect::ReadCharacteristic]);
        assert_eq!(protocol.phase(), Some(LinkPhase::Subscribed));

        let effects = signal(
            &mut protocol,
            SignalKind::CharacteristicRead {
                status: GattStatus::SUCCESS,
                characteristic: POSTURE_CHARACTERISTIC_UUID,
                value: b"bad".to_vec(),
            },
        );
        assert_eq!(
            effects,
            vec![Effect::Emit(PostureEvent::PostureChanged(Posture::Hunched))]
        );
    }

    #[test]
    fn test_connect_refused_while_active() {
        let mut protocol = Protocol::new();
        protocol.handle(Input::ConnectRequested).unwrap();
        assert_eq!(
            protocol.handle(Input::ConnectRequested),
            Err(Refusal::AlreadyActive)
        );
    }

    #[test]
    fn test_connect_failure_returns_to_disconnected() {
        let mut protocol = Protocol::new();
        protocol.handle(Input::ConnectRequested).unwrap();
        let effects = protocol.handle(Input::ConnectFailed).unwrap();
        assert_eq!(effects, vec![Effect::DetachSink]);
        assert_eq!(protocol.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_missing_characteristic_degrades_but_stays_connected() {
        let mut protocol = Protocol::new();
        protocol.handle(Input::ConnectRequested).unwrap();
        signal(&mut protocol, SignalKind::LinkUp);

        let services = vec![GattService {
            uuid: POSTURE_SERVICE_UUID,
            characteristics: Vec::new(),
        }];
        let effects = signal(
            &mut protocol,
            SignalKind::ServicesDiscovered {
                status: GattStatus::SUCCESS,
                services,
            },
        );
        assert!(matches!(
            effects.as_slice(),
            [Effect::Degraded {
                step: Step::Discovery,
                ..
            }]
        ));
        assert_eq!(protocol.state(), ConnectionState::Connected);
        assert_eq!(protocol.phase(), Some(LinkPhase::Degraded));

        // Late notifications on a degraded link are never decoded.
        let effects = signal(
            &mut protocol,
            SignalKind::CharacteristicChanged {
                characteristic: POSTURE_CHARACTERISTIC_UUID,
                value: b"ok".to_vec(),
            },
        );
        assert!(effects.is_empty());
    }

    #[test]
    fn test_missing_service_and_failed_status_degrade() {
        for (status, services) in [
            (GattStatus::SUCCESS, Vec::new()),
            (GattStatus::FAILURE, posture_services()),
        ] {
            let mut protocol = Protocol::new();
            protocol.handle(Input::ConnectRequested).unwrap();
            signal(&mut protocol, SignalKind::LinkUp);
            signal(
                &mut protocol,
                SignalKind::ServicesDiscovered { status, services },
            );
            assert_eq!(protocol.phase(), Some(LinkPhase::Degraded));
        }
    }

    #[test]
    fn test_rejected_descriptor_write_degrades() {
        let mut protocol = Protocol::new();
        protocol.handle(Input::ConnectRequested).unwrap();
        signal(&mut protocol, SignalKind::LinkUp);
        signal(
            &mut protocol,
            SignalKind::ServicesDiscovered {
                status: GattStatus::SUCCESS,
                services: posture_services(),
            },
        );
        let effects = signal(
            &mut protocol,
            SignalKind::DescriptorWritten {
                status: GattStatus(0x03),
                characteristic: POSTURE_CHARACTERISTIC_UUID,
                descriptor: CCCD_UUID,
            },
        );
        assert!(matches!(
            effects.as_slice(),
            [Effect::Degraded {
                step: Step::Subscription,
                ..
            }]
        ));
        assert_eq!(protocol.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_unrecognised_payloads_produce_nothing() {
        let mut protocol = subscribed();
        for value in [b"OK".to_vec(), Vec::new(), vec![0xde, 0xad, 0xbe, 0xef]] {
            let effects = signal(
                &mut protocol,
                SignalKind::CharacteristicChanged {
                    characteristic: POSTURE_CHARACTERISTIC_UUID,
                    value,
                },
            );
            assert!(effects.is_empty());
        }
        assert!(!protocol.posture_seen());
    }

    #[test]
    fn test_failed_read_is_ignored() {
        let mut protocol = subscribed();
        let effects = signal(
            &mut protocol,
            SignalKind::CharacteristicRead {
                status: GattStatus::FAILURE,
                characteristic: POSTURE_CHARACTERISTIC_UUID,
                value: b"ok".to_vec(),
            },
        );
        assert!(effects.is_empty());
        assert_eq!(protocol.phase(), Some(LinkPhase::Subscribed));
    }

    #[test]
    fn test_teardown_flushes_only_after_a_posture() {
        let mut protocol = subscribed();
        let effects = protocol.handle(Input::DisconnectRequested).unwrap();
        assert_eq!(
            effects,
            vec![
                Effect::Emit(PostureEvent::Disconnected),
                Effect::ReleaseLink,
                Effect::DetachSink
            ]
        );

        let mut protocol = subscribed();
        signal(
            &mut protocol,
            SignalKind::CharacteristicChanged {
                characteristic: POSTURE_CHARACTERISTIC_UUID,
                value: b"ok".to_vec(),
            },
        );
        let effects = signal(&mut protocol, SignalKind::LinkLost);
        assert_eq!(
            effects,
            vec![
                Effect::Emit(PostureEvent::SessionEnded),
                Effect::Emit(PostureEvent::Disconnected),
                Effect::ReleaseLink,
                Effect::DetachSink
            ]
        );
        assert_eq!(protocol.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_teardown_runs_once() {
        let mut protocol = subscribed();
        assert!(!protocol.handle(Input::DisconnectRequested).unwrap().is_empty());
        assert!(signal(&mut protocol, SignalKind::LinkLost).is_empty());
        assert!(protocol.handle(Input::DisconnectRequested).unwrap().is_empty());
    }

    #[test]
    fn test_signals_after_disconnect_are_ignored() {
        let mut protocol = Protocol::new();
        protocol.handle(Input::ConnectRequested).unwrap();
        signal(&mut protocol, SignalKind::LinkUp);
        protocol.handle(Input::DisconnectRequested).unwrap();

        let effects = signal(
            &mut protocol,
            SignalKind::ServicesDiscovered {
                status: GattStatus::SUCCESS,
                services: posture_services(),
            },
        );
        assert!(effects.is_empty());
        assert_eq!(protocol.state(), ConnectionState::Disconnected);
    }
}
