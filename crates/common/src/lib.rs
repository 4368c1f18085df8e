//! Common utilities for usb-midi-host
//!
//! This crate provides functionality shared between the host driver and its
//! downstream consumers: error handling, logging setup, and the bounded note
//! channel that carries decoded events out of the USB callback context.

pub mod channel;
pub mod error;
pub mod logging;

pub use channel::{EventSink, NoteReceiver, NoteSender, SendOutcome, create_note_channel};
pub use error::{Error, Result};
pub use logging::setup_logging;
