//! Protocol error types

use thiserror::Error;

/// Protocol-level errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// A USB-MIDI event packet must be exactly four bytes
    #[error("Invalid packet length: expected {expected} bytes, got {actual}")]
    InvalidPacketLength { expected: usize, actual: usize },

    /// MIDI data bytes have the high bit clear
    #[error("Invalid pitch {0}: must be in 0..=127")]
    InvalidPitch(u8),
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;
