//! Wire-level types for the posture corrector peripheral.
//!
//! The peripheral classifies posture itself and only ever sends one of two
//! ASCII tokens over a single notify characteristic.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Service advertised by the posture corrector.
pub const POSTURE_SERVICE_UUID: Uuid = Uuid::from_u128(0x4fafc201_1fb5_459e_8fcc_c5c9c331914b);

/// Characteristic carrying the posture token.
pub const POSTURE_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0xbeb5483e_36e1_4688_b7f5_ea07361b26a8);

/// Client characteristic configuration descriptor (0x2902).
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// Value written to the CCCD to enable notifications.
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

/// Token sent while the wearer is sitting straight.
const STRETCHED_TOKEN: &[u8] = b"ok";
/// Token sent while the wearer is hunched.
const HUNCHED_TOKEN: &[u8] = b"bad";

/// Posture classification reported by the peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Posture {
    Stretched,
    Hunched,
}

impl Posture {
    /// Decode a notification or read payload.
    ///
    /// Only the exact tokens `ok` and `bad` are recognised. Anything else,
    /// including different casing, padding or an empty payload, yields `None`.
    pub fn decode(payload: &[u8]) -> Option<Self> {
        match payload {
            STRETCHED_TOKEN => Some(Posture::Stretched),
            HUNCHED_TOKEN => Some(Posture::Hunched),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Posture::Stretched => "stretched",
            Posture::Hunched => "hunched",
        }
    }
}

impl fmt::Display for Posture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Externally visible connection state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(label)
    }
}

/// Events delivered by a [`ConnectionSession`](crate::device::ConnectionSession)
/// to its sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PostureEvent {
    /// The link to the peripheral is up.
    Connected,
    /// The peripheral reported a posture.
    PostureChanged(Posture),
    /// The session is tearing down after at least one posture was seen.
    /// Consumers must close any open interval.
    SessionEnded,
    /// The link is gone; no further events follow.
    Disconnected,
}

/// A Bluetooth device address, e.g. `D4:D4:DA:44:28:86`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceAddress([u8; 6]);

impl DeviceAddress {
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl FromStr for DeviceAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let parts: Vec<&str> = trimmed.split([':', '-']).collect();
        if parts.len() != 6 {
            return Err(AddressParseError(s.to_string()));
        }

        let mut octets = [0u8; 6];
        for (octet, part) in octets.iter_mut().zip(&parts) {
            if part.len() != 2 || !part.chars().all(|ch| ch.is_ascii_hexdigit()) {
                return Err(AddressParseError(s.to_string()));
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| AddressParseError(s.to_string()))?;
        }
        Ok(Self(octets))
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

/// Returned when a string is not a six-octet device address.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed device address '{0}'")]
pub struct AddressParseError(pub String);
