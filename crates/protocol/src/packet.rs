//! USB-MIDI event packets
//!
//! A USB-MIDI streaming endpoint delivers its payload as a sequence of 4-byte
//! event packets. Byte 0 carries the virtual cable number in the high nibble
//! and the Code Index Number (CIN) in the low nibble; bytes 1..4 carry the
//! MIDI message itself.
//!
//! ```text
//! byte 0            byte 1      byte 2      byte 3
//! ┌────────┬──────┬───────────┬───────────┬───────────┐
//! │ cable  │ CIN  │  MIDI_0   │  MIDI_1   │  MIDI_2   │
//! └────────┴──────┴───────────┴───────────┴───────────┘
//! ```
//!
//! Only Note On packets are turned into [`NoteEvent`]s. A payload that is not
//! a whole number of packets has its trailing partial packet ignored.

use crate::error::{ProtocolError, Result};
use crate::types::NoteEvent;

/// Size of one USB-MIDI event packet in bytes
pub const PACKET_SIZE: usize = 4;

/// Code Index Number, the low nibble of the packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodeIndex {
    Misc,
    CableEvent,
    SystemCommon2,
    SystemCommon3,
    SysExStart,
    SysExEnd1,
    SysExEnd2,
    SysExEnd3,
    NoteOff,
    NoteOn,
    PolyKeyPressure,
    ControlChange,
    ProgramChange,
    ChannelPressure,
    PitchBend,
    SingleByte,
}

impl CodeIndex {
    /// Decode the low nibble of a packet header (high nibble is ignored)
    pub fn from_header(header: u8) -> Self {
        match header & 0x0F {
            0x0 => Self::Misc,
            0x1 => Self::CableEvent,
            0x2 => Self::SystemCommon2,
            0x3 => Self::SystemCommon3,
            0x4 => Self::SysExStart,
            0x5 => Self::SysExEnd1,
            0x6 => Self::SysExEnd2,
            0x7 => Self::SysExEnd3,
            0x8 => Self::NoteOff,
            0x9 => Self::NoteOn,
            0xA => Self::PolyKeyPressure,
            0xB => Self::ControlChange,
            0xC => Self::ProgramChange,
            0xD => Self::ChannelPressure,
            0xE => Self::PitchBend,
            _ => Self::SingleByte,
        }
    }
}

/// A single 4-byte USB-MIDI event packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbMidiPacket([u8; PACKET_SIZE]);

impl UsbMidiPacket {
    pub fn new(bytes: [u8; PACKET_SIZE]) -> Self {
        Self(bytes)
    }

    /// Virtual cable number (0-15)
    pub fn cable(&self) -> u8 {
        self.0[0] >> 4
    }

    pub fn code_index(&self) -> CodeIndex {
        CodeIndex::from_header(self.0[0])
    }

    /// The three MIDI bytes following the header
    pub fn midi_bytes(&self) -> &[u8] {
        &self.0[1..]
    }

    pub fn as_bytes(&self) -> &[u8; PACKET_SIZE] {
        &self.0
    }

    /// Extract a note from a Note On packet
    ///
    /// The pitch is taken from byte 2. A zero byte 2 yields nothing, and
    /// neither does a byte 2 with the high bit set, since that cannot be a
    /// MIDI data byte.
    pub fn note_on(&self) -> Option<NoteEvent> {
        if self.code_index() != CodeIndex::NoteOn {
            return None;
        }

        match self.0[2] {
            0 => None,
            pitch => NoteEvent::new(pitch).ok(),
        }
    }
}

impl TryFrom<&[u8]> for UsbMidiPacket {
    type Error = ProtocolError;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; PACKET_SIZE] =
            bytes
                .try_into()
                .map_err(|_| ProtocolError::InvalidPacketLength {
                    expected: PACKET_SIZE,
                    actual: bytes.len(),
                })?;
        Ok(Self(bytes))
    }
}

/// Split a transfer payload into whole event packets
pub fn packets(payload: &[u8]) -> impl Iterator<Item = UsbMidiPacket> + '_ {
    payload.chunks_exact(PACKET_SIZE).map(|chunk| {
        let mut bytes = [0u8; PACKET_SIZE];
        bytes.copy_from_slice(chunk);
        UsbMidiPacket(bytes)
    })
}

/// Decode every note in a transfer payload, in packet order
pub fn decode_note_events(payload: &[u8]) -> impl Iterator<Item = NoteEvent> + '_ {
    packets(payload).filter_map(|packet| packet.note_on())
}
