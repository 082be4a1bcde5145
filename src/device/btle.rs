//! Native BLE transport built on `btleplug`.
//!
//! btleplug is async; this transport owns a tokio runtime and turns every
//! request into a spawned task that reports back through the session's
//! signal channel, so the session sees the same callback-style completions it
//! gets from any other [`Transport`].

use crate::device::transport::{
    GattCharacteristic, GattService, GattStatus, LinkHandle, SignalKind, Transport,
    TransportError, TransportSignal,
};
use crate::device::types::{DeviceAddress, CCCD_UUID};
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use crossbeam_channel::Sender;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};
use uuid::Uuid;

const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(200);
const RELEASE_TIMEOUT: Duration = Duration::from_secs(2);

/// Settings for the native transport.
#[derive(Debug, Clone)]
pub struct BtleSettings {
    /// Adapter name or address; the first adapter when `None`.
    pub adapter: Option<String>,
    /// How long to scan for the peripheral before giving up.
    pub scan_timeout: Duration,
}

impl Default for BtleSettings {
    fn default() -> Self {
        Self {
            adapter: None,
            scan_timeout: Duration::from_secs(15),
        }
    }
}

struct LinkEntry {
    signals: Sender<TransportSignal>,
    peripheral: Option<Peripheral>,
    tasks: Vec<JoinHandle<()>>,
}

type CentralEvents = Pin<Box<dyn Stream<Item = CentralEvent> + Send>>;

type Links = Arc<Mutex<HashMap<LinkHandle, LinkEntry>>>;

fn lock(links: &Links) -> MutexGuard<'_, HashMap<LinkHandle, LinkEntry>> {
    match links.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub struct BtleTransport {
    runtime: Runtime,
    settings: BtleSettings,
    links: Links,
    next_link: u64,
}

impl BtleTransport {
    pub fn new(settings: BtleSettings) -> Result<Self, TransportError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .map_err(|err| TransportError::AdapterUnavailable(format!("start BLE runtime: {err}")))?;

        Ok(Self {
            runtime,
            settings,
            links: Arc::new(Mutex::new(HashMap::new())),
            next_link: 0,
        })
    }

    fn peripheral(&self, link: LinkHandle) -> Result<(Peripheral, Sender<TransportSignal>), TransportError> {
        let links = lock(&self.links);
        let entry = links.get(&link).ok_or(TransportError::UnknownLink(link))?;
        let peripheral = entry
            .peripheral
            .clone()
            .ok_or_else(|| TransportError::Rejected(format!("{link} is not connected yet")))?;
        Ok((peripheral, entry.signals.clone()))
    }

    fn characteristic(
        peripheral: &Peripheral,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Characteristic, TransportError> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic && c.service_uuid == service)
            .ok_or_else(|| {
                TransportError::Rejected(format!(
                    "characteristic {characteristic} not found in service {service}"
                ))
            })
    }

    fn track(&self, link: LinkHandle, task: JoinHandle<()>) {
        if let Some(entry) = lock(&self.links).get_mut(&link) {
            entry.tasks.push(task);
        } else {
            task.abort();
        }
    }
}

impl Transport for BtleTransport {
    fn name(&self) -> &'static str {
        "btleplug"
    }

    fn connect(
        &mut self,
        address: &DeviceAddress,
        signals: Sender<TransportSignal>,
    ) -> Result<LinkHandle, TransportError> {
        let adapter = self.runtime.block_on(select_adapter(&self.settings))?;

        self.next_link += 1;
        let link = LinkHandle(self.next_link);
        lock(&self.links).insert(
            link,
            LinkEntry {
                signals: signals.clone(),
                peripheral: None,
                tasks: Vec::new(),
            },
        );

        let links = self.links.clone();
        let address = *address;
        let scan_timeout = self.settings.scan_timeout;
        let task = self.runtime.spawn(async move {
            match establish(&adapter, &address, scan_timeout).await {
                Ok((peripheral, events)) => {
                    let watched_id = peripheral.id();
                    let attached = match lock(&links).get_mut(&link) {
                        Some(entry) => {
                            entry.peripheral = Some(peripheral.clone());
                            true
                        }
                        None => false,
                    };
                    if !attached {
                        // Released while we were connecting.
                        let _ = peripheral.disconnect().await;
                        return;
                    }
                    let _ = signals.send(TransportSignal::new(link, SignalKind::LinkUp));

                    // The event stream was opened before connecting, so a drop
                    // in between is either buffered or visible here.
                    let still_connected = peripheral.is_connected().await.unwrap_or(false);
                    let disconnects = events.filter_map(|event| async move {
                        match event {
                            CentralEvent::DeviceDisconnected(id) => Some(id),
                            _ => None,
                        }
                    });
                    wait_for_loss(Box::pin(disconnects), &watched_id, still_connected).await;
                    let _ = signals.send(TransportSignal::new(link, SignalKind::LinkLost));
                }
                Err(reason) => {
                    warn!(%address, %reason, "could not establish link");
                    let _ = signals.send(TransportSignal::new(link, SignalKind::LinkLost));
                }
            }
        });
        self.track(link, task);
        Ok(link)
    }

    fn discover_services(&mut self, link: LinkHandle) -> Result<(), TransportError> {
        let (peripheral, signals) = self.peripheral(link)?;
        let task = self.runtime.spawn(async move {
            let kind = match peripheral.discover_services().await {
                Ok(()) => SignalKind::ServicesDiscovered {
                    status: GattStatus::SUCCESS,
                    services: peripheral.services().into_iter().map(to_gatt_service).collect(),
                },
                Err(err) => {
                    debug!(error = %err, "service discovery failed");
                    SignalKind::ServicesDiscovered {
                        status: GattStatus::FAILURE,
                        services: Vec::new(),
                    }
                }
            };
            let _ = signals.send(TransportSignal::new(link, kind));
        });
        self.track(link, task);
        Ok(())
    }

    fn enable_notifications(
        &mut self,
        link: LinkHandle,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), TransportError> {
        let (peripheral, signals) = self.peripheral(link)?;
        let target = Self::characteristic(&peripheral, service, characteristic)?;

        let task = self.runtime.spawn(async move {
            // Open the stream first so no notification slips in between.
            let stream = match peripheral.notifications().await {
                Ok(stream) => Some(stream),
                Err(err) => {
                    debug!(error = %err, "opening notification stream failed");
                    None
                }
            };
            let status = match peripheral.subscribe(&target).await {
                Ok(()) if stream.is_some() => GattStatus::SUCCESS,
                Ok(()) => GattStatus::FAILURE,
                Err(err) => {
                    debug!(error = %err, "enabling notifications failed");
                    GattStatus::FAILURE
                }
            };
            let _ = signals.send(TransportSignal::new(
                link,
                SignalKind::DescriptorWritten {
                    status,
                    characteristic: target.uuid,
                    descriptor: CCCD_UUID,
                },
            ));

            let Some(mut stream) = stream else { return };
            if !status.is_success() {
                return;
            }
            while let Some(notification) = stream.next().await {
                if notification.uuid != target.uuid {
                    continue;
                }
                let signal = TransportSignal::new(
                    link,
                    SignalKind::CharacteristicChanged {
                        characteristic: notification.uuid,
                        value: notification.value,
                    },
                );
                if signals.send(signal).is_err() {
                    break;
                }
            }
        });
        self.track(link, task);
        Ok(())
    }

    fn read(
        &mut self,
        link: LinkHandle,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), TransportError> {
        let (peripheral, signals) = self.peripheral(link)?;
        let target = Self::characteristic(&peripheral, service, characteristic)?;

        let task = self.runtime.spawn(async move {
            let kind = match peripheral.read(&target).await {
                Ok(value) => SignalKind::CharacteristicRead {
                    status: GattStatus::SUCCESS,
                    characteristic: target.uuid,
                    value,
                },
                Err(err) => {
                    debug!(error = %err, "characteristic read failed");
                    SignalKind::CharacteristicRead {
                        status: GattStatus::FAILURE,
                        characteristic: target.uuid,
                        value: Vec::new(),
                    }
                }
            };
            let _ = signals.send(TransportSignal::new(link, kind));
        });
        self.track(link, task);
        Ok(())
    }

    fn release(&mut self, link: LinkHandle) {
        let Some(entry) = lock(&self.links).remove(&link) else {
            return;
        };
        for task in entry.tasks {
            task.abort();
        }
        if let Some(peripheral) = entry.peripheral {
            let result = self
                .runtime
                .block_on(async { timeout(RELEASE_TIMEOUT, peripheral.disconnect()).await });
            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(%link, error = %err, "disconnect failed"),
                Err(_) => warn!(%link, "disconnect timed out"),
            }
        }
    }
}

async fn select_adapter(settings: &BtleSettings) -> Result<Adapter, TransportError> {
    let manager = Manager::new()
        .await
        .map_err(|err| TransportError::AdapterUnavailable(format!("create BLE manager: {err}")))?;
    let adapters = manager
        .adapters()
        .await
        .map_err(|err| TransportError::AdapterUnavailable(format!("enumerate BLE adapters: {err}")))?;

    let Some(requested) = settings.adapter.as_deref() else {
        return adapters
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::AdapterUnavailable("no BLE adapters on host".to_string()));
    };

    for adapter in adapters {
        let info = adapter.adapter_info().await.map_err(|err| {
            TransportError::AdapterUnavailable(format!("read adapter info: {err}"))
        })?;
        if identifiers_match(requested, &info) || info.contains(requested.trim()) {
            return Ok(adapter);
        }
    }
    Err(TransportError::AdapterUnavailable(format!(
        "configured adapter '{requested}' not found"
    )))
}

async fn establish(
    adapter: &Adapter,
    address: &DeviceAddress,
    scan_timeout: Duration,
) -> Result<(Peripheral, CentralEvents), String> {
    let events = adapter
        .events()
        .await
        .map_err(|err| format!("watch adapter events: {err}"))?;

    adapter
        .start_scan(ScanFilter::default())
        .await
        .map_err(|err| format!("start BLE scan: {err}"))?;

    let deadline = Instant::now() + scan_timeout;
    let peripheral = loop {
        let peripherals = adapter
            .peripherals()
            .await
            .map_err(|err| format!("list peripherals: {err}"))?;
        if let Some(found) = peripherals
            .into_iter()
            .find(|p| peripheral_matches(p, address))
        {
            break found;
        }
        if Instant::now() >= deadline {
            let _ = adapter.stop_scan().await;
            return Err(format!("scan timeout waiting for {address}"));
        }
        sleep(SCAN_POLL_INTERVAL).await;
    };

    let _ = adapter.stop_scan().await;
    peripheral
        .connect()
        .await
        .map_err(|err| format!("connect peripheral: {err}"))?;
    Ok((peripheral, events))
}

/// Resolves once `watched` shows up on `disconnects`, or at once when the
/// link was already gone before watching started.
async fn wait_for_loss<S, I>(mut disconnects: S, watched: &I, still_connected: bool)
where
    S: Stream<Item = I> + Unpin,
    I: PartialEq,
{
    if !still_connected {
        return;
    }
    while let Some(id) = disconnects.next().await {
        if &id == watched {
            return;
        }
    }
}

fn peripheral_matches(peripheral: &Peripheral, address: &DeviceAddress) -> bool {
    peripheral.address().into_inner() == address.octets()
        || identifiers_match(&address.to_string(), &peripheral.id().to_string())
}

fn to_gatt_service(service: btleplug::api::Service) -> GattService {
    GattService {
        uuid: service.uuid,
        characteristics: service
            .characteristics
            .into_iter()
            .map(|c| GattCharacteristic {
                uuid: c.uuid,
                descriptors: c.descriptors.into_iter().map(|d| d.uuid).collect(),
            })
            .collect(),
    }
}

fn identifiers_match(configured: &str, discovered: &str) -> bool {
    normalize_identifier(configured) == normalize_identifier(discovered)
}

fn normalize_identifier(value: &str) -> String {
    value
        .trim()
        .chars()
        .filter(|ch| !matches!(ch, ':' | '-'))
        .flat_map(|ch| ch.to_lowercase())
        .collect()
}
