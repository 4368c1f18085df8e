//! Note and device type definitions
//!
//! This module defines the decoded note event handed to downstream consumers
//! and the device/configuration summaries reported while a device is brought up.

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A decoded Note On, the unit of data forwarded to consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NoteEvent {
    /// MIDI note number (0-127)
    pub pitch: u8,
}

impl NoteEvent {
    /// Create a note event, rejecting values outside the MIDI data range
    pub fn new(pitch: u8) -> Result<Self> {
        if pitch > 0x7F {
            return Err(ProtocolError::InvalidPitch(pitch));
        }
        Ok(Self { pitch })
    }
}

impl fmt::Display for NoteEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [&str; 12] = [
            "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
        ];
        let name = NAMES[(self.pitch % 12) as usize];
        let octave = (self.pitch / 12) as i8 - 1;
        write!(f, "{}{} ({})", name, octave, self.pitch)
    }
}

/// USB device speed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeviceSpeed {
    /// Low speed - 1.5 Mbps (USB 1.0)
    Low,
    /// Full speed - 12 Mbps (USB 1.1)
    Full,
    /// High speed - 480 Mbps (USB 2.0)
    High,
    /// SuperSpeed - 5 Gbps (USB 3.0)
    Super,
    /// SuperSpeed+ - 10 Gbps (USB 3.1)
    SuperPlus,
    /// Reported speed not known to the host stack
    Unknown,
}

/// Device information queried after open
///
/// Used for diagnostics only; nothing in the bring-up sequence depends on
/// these values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Device address on the bus
    pub address: u8,
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
    /// Device speed
    pub speed: DeviceSpeed,
    /// bConfigurationValue of the active configuration
    pub configuration_value: u8,
}

/// Endpoint entry of a configuration summary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSummary {
    /// Endpoint address (includes direction bit)
    pub address: u8,
    /// wMaxPacketSize
    pub max_packet_size: u16,
}

/// Flattened view of the active configuration descriptor
///
/// Only what is useful in a log line: interface numbers with their class
/// triple and endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConfigSummary {
    /// bConfigurationValue
    pub configuration_value: u8,
    /// bMaxPower in milliamps
    pub max_power_ma: u16,
    /// (interface number, class, subclass, endpoints)
    pub interfaces: Vec<(u8, u8, u8, Vec<EndpointSummary>)>,
}

impl ConfigSummary {
    /// Whether the configuration exposes the given interface/endpoint pair
    pub fn has_endpoint(&self, interface: u8, endpoint: u8) -> bool {
        self.interfaces
            .iter()
            .filter(|(number, ..)| *number == interface)
            .flat_map(|(.., endpoints)| endpoints.iter())
            .any(|ep| ep.address == endpoint)
    }
}
