//! Protocol library for usb-midi-host
//!
//! This crate defines the data that flows out of a USB-MIDI streaming endpoint:
//! the 4-byte USB-MIDI event packet, the decoded note events handed to
//! downstream consumers, and the descriptor summaries logged while a device
//! is brought up.
//!
//! # Example
//!
//! ```
//! use protocol::{NoteEvent, decode_note_events};
//!
//! // One Note On packet on cable 0
//! let payload = [0x09, 0x00, 0x3C, 0x00];
//!
//! let notes: Vec<NoteEvent> = decode_note_events(&payload).collect();
//! assert_eq!(notes, vec![NoteEvent { pitch: 60 }]);
//! ```

pub mod error;
pub mod packet;
pub mod types;

pub use error::{ProtocolError, Result};
pub use packet::{CodeIndex, PACKET_SIZE, UsbMidiPacket, decode_note_events, packets};
pub use types::{ConfigSummary, DeviceInfo, DeviceSpeed, EndpointSummary, NoteEvent};
