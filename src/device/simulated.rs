//! In-process stand-in for the posture corrector.
//!
//! Used for `--simulate` runs and tests, and on hosts built without the `ble`
//! feature. Every request completes immediately by pushing the matching
//! signal onto the session's channel.

use crate::device::transport::{
    GattCharacteristic, GattService, GattStatus, LinkHandle, SignalKind, Transport,
    TransportError, TransportSignal,
};
use crate::device::types::{
    DeviceAddress, CCCD_UUID, ENABLE_NOTIFICATION_VALUE, POSTURE_CHARACTERISTIC_UUID,
    POSTURE_SERVICE_UUID,
};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use uuid::Uuid;

/// How the simulated peripheral behaves.
#[derive(Debug, Clone)]
pub struct PeripheralProfile {
    /// When false, `connect` fails as if the radio were off.
    pub adapter_available: bool,
    /// GATT table returned by discovery.
    pub services: Vec<GattService>,
    pub discovery_status: GattStatus,
    pub descriptor_write_status: GattStatus,
}

impl Default for PeripheralProfile {
    fn default() -> Self {
        Self {
            adapter_available: true,
            services: vec![posture_service()],
            discovery_status: GattStatus::SUCCESS,
            descriptor_write_status: GattStatus::SUCCESS,
        }
    }
}

impl PeripheralProfile {
    /// A peripheral that advertises the posture service without its
    /// characteristic.
    pub fn without_characteristic() -> Self {
        Self {
            services: vec![GattService {
                uuid: POSTURE_SERVICE_UUID,
                characteristics: Vec::new(),
            }],
            ..Self::default()
        }
    }
}

/// GATT service exposed by the real firmware.
pub fn posture_service() -> GattService {
    GattService {
        uuid: POSTURE_SERVICE_UUID,
        characteristics: vec![GattCharacteristic {
            uuid: POSTURE_CHARACTERISTIC_UUID,
            descriptors: vec![CCCD_UUID],
        }],
    }
}

#[derive(Debug, Default)]
struct PeripheralState {
    value: Vec<u8>,
    link: Option<(LinkHandle, Sender<TransportSignal>)>,
    /// Client characteristic configuration value.
    cccd: [u8; 2],
    next_link: u64,
    release_count: usize,
}

/// Test/driver side of the simulated peripheral.
#[derive(Debug, Clone, Default)]
pub struct PeripheralHandle(Arc<Mutex<PeripheralState>>);

impl PeripheralHandle {
    fn lock(&self) -> MutexGuard<'_, PeripheralState> {
        match self.0.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Set the characteristic value without notifying.
    pub fn set_value(&self, value: &[u8]) {
        self.lock().value = value.to_vec();
    }

    /// Set the characteristic value and notify a subscribed central.
    pub fn notify(&self, value: &[u8]) {
        let mut state = self.lock();
        state.value = value.to_vec();
        if state.cccd != ENABLE_NOTIFICATION_VALUE {
            return;
        }
        if let Some((link, ref signals)) = state.link {
            let _ = signals.send(TransportSignal::new(
                link,
                SignalKind::CharacteristicChanged {
                    characteristic: POSTURE_CHARACTERISTIC_UUID,
                    value: value.to_vec(),
                },
            ));
        }
    }

    /// Simulate the peripheral going out of range.
    pub fn drop_link(&self) {
        let mut state = self.lock();
        state.cccd = [0, 0];
        if let Some((link, signals)) = state.link.take() {
            let _ = signals.send(TransportSignal::new(link, SignalKind::LinkLost));
        }
    }

    pub fn is_connected(&self) -> bool {
        self.lock().link.is_some()
    }

    pub fn is_subscribed(&self) -> bool {
        self.lock().cccd == ENABLE_NOTIFICATION_VALUE
    }

    /// Number of times a central released a link.
    pub fn release_count(&self) -> usize {
        self.lock().release_count
    }
}

/// [`Transport`] backed by a [`PeripheralHandle`].
pub struct SimulatedTransport {
    profile: PeripheralProfile,
    peripheral: PeripheralHandle,
}

impl SimulatedTransport {
    pub fn new(profile: PeripheralProfile) -> Self {
        Self {
            profile,
            peripheral: PeripheralHandle::default(),
        }
    }

    pub fn peripheral(&self) -> PeripheralHandle {
        self.peripheral.clone()
    }

    fn send(&self, link: LinkHandle, kind: SignalKind) -> Result<(), TransportError> {
        let state = self.peripheral.lock();
        match state.link {
            Some((current, ref signals)) if current == link => {
                let _ = signals.send(TransportSignal::new(link, kind));
                Ok(())
            }
            _ => Err(TransportError::UnknownLink(link)),
        }
    }

    fn has_characteristic(&self, service: Uuid, characteristic: Uuid) -> bool {
        self.profile
            .services
            .iter()
            .filter(|s| s.uuid == service)
            .any(|s| s.characteristic(characteristic).is_some())
    }
}

impl Transport for SimulatedTransport {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn connect(
        &mut self,
        _address: &DeviceAddress,
        signals: Sender<TransportSignal>,
    ) -> Result<LinkHandle, TransportError> {
        if !self.profile.adapter_available {
            return Err(TransportError::AdapterUnavailable(
                "simulated adapter is powered off".to_string(),
            ));
        }

        let mut state = self.peripheral.lock();
        if state.link.is_some() {
            return Err(TransportError::Rejected(
                "peripheral already has a central".to_string(),
            ));
        }
        state.next_link += 1;
        let link = LinkHandle(state.next_link);
        let _ = signals.send(TransportSignal::new(link, SignalKind::LinkUp));
        state.link = Some((link, signals));
        Ok(link)
    }

    fn discover_services(&mut self, link: LinkHandle) -> Result<(), TransportError> {
        self.send(
            link,
            SignalKind::ServicesDiscovered {
                status: self.profile.discovery_status,
                services: self.profile.services.clone(),
            },
        )
    }

    fn enable_notifications(
        &mut self,
        link: LinkHandle,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), TransportError> {
        if !self.has_characteristic(service, characteristic) {
            return Err(TransportError::Rejected(format!(
                "no characteristic {characteristic} in service {service}"
            )));
        }

        let status = self.profile.descriptor_write_status;
        self.send(
            link,
            SignalKind::DescriptorWritten {
                status,
                characteristic,
                descriptor: CCCD_UUID,
            },
        )?;
        if status.is_success() {
            self.peripheral.lock().cccd = ENABLE_NOTIFICATION_VALUE;
        }
        Ok(())
    }

    fn read(
        &mut self,
        link: LinkHandle,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), TransportError> {
        if !self.has_characteristic(service, characteristic) {
            return Err(TransportError::Rejected(format!(
                "no characteristic {characteristic} in service {service}"
            )));
        }

        let value = self.peripheral.lock().value.clone();
        self.send(
            link,
            SignalKind::CharacteristicRead {
                status: GattStatus::SUCCESS,
                characteristic,
                value,
            },
        )
    }

    fn release(&mut self, link: LinkHandle) {
        let mut state = self.peripheral.lock();
        state.release_count += 1;
        if matches!(state.link, Some((current, _)) if current == link) {
            state.link = None;
            state.cccd = [0, 0];
        }
    }
}

/// Shortest interval between scripted notifications.
const MIN_SCRIPT_TICK: Duration = Duration::from_millis(10);

/// Background driver that makes a simulated peripheral change posture on a
/// fixed cycle of ten ticks.
pub struct PostureScript {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl PostureScript {
    /// Start notifying every `tick`. `hunched_ratio` (0.0 to 1.0) is the share
    /// of each cycle spent hunched.
    pub fn start(peripheral: PeripheralHandle, tick: Duration, hunched_ratio: f64) -> Self {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let tick = tick.max(MIN_SCRIPT_TICK);
        let cycle = script_cycle(hunched_ratio);

        let handle = thread::spawn(move || {
            for token in cycle.iter().cycle() {
                peripheral.notify(token);
                match stop_rx.recv_timeout(tick) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        });

        Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        }
    }

    /// Stop the script and wait for its thread to exit.
    pub fn stop(&mut self) {
        // Dropping the sender wakes the thread even if it is mid-wait.
        self.stop_tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PostureScript {
    fn drop(&mut self) {
        self.stop();
    }
}

fn script_cycle(hunched_ratio: f64) -> Vec<&'static [u8]> {
    const TICKS: usize = 10;
    let hunched = (hunched_ratio.clamp(0.0, 1.0) * TICKS as f64).round() as usize;
    (0..TICKS)
        .map(|tick| if tick < TICKS - hunched { &b"ok"[..] } else { &b"bad"[..] })
        .collect()
}
