//! Connection to the posture corrector peripheral.
//!
//! The session runs a fixed handshake against the peripheral's GATT server
//! and turns its `ok` / `bad` notifications into [`PostureEvent`]s:
//!
//! ```text
//!  Disconnected ──connect()──▶ Connecting ──LinkUp──▶ Connected
//!                                                      │ discover services
//!                                                      │ enable notifications (CCCD)
//!                                                      │ read current value
//!                                                      ▼
//!  Disconnected ◀──disconnect() / LinkLost── Subscribed (or Degraded)
//! ```

pub mod protocol;
pub mod session;
pub mod simulated;
pub mod transport;
pub mod types;

#[cfg(feature = "ble")]
pub mod btle;

// Re-export commonly used types
pub use protocol::{LinkPhase, Protocol};
pub use session::{ConnectionSession, SessionError, StateHandle};
pub use simulated::{PeripheralHandle, PeripheralProfile, PostureScript, SimulatedTransport};
pub use transport::{
    GattCharacteristic, GattService, GattStatus, LinkHandle, SignalKind, Transport,
    TransportError, TransportSignal,
};
pub use types::{
    ConnectionState, DeviceAddress, Posture, PostureEvent, CCCD_UUID,
    POSTURE_CHARACTERISTIC_UUID, POSTURE_SERVICE_UUID,
};

#[cfg(feature = "ble")]
pub use btle::{BtleSettings, BtleTransport};
