//! USB-MIDI host driver
//!
//! Discovers USB devices, walks each one through open, descriptor queries
//! and interface claim, then streams USB-MIDI note events from its IN
//! endpoint into a bounded channel for downstream consumers.
//!
//! ```no_run
//! use std::sync::Arc;
//! use host::config::HostConfig;
//! use host::usb::{Driver, RusbSession, spawn_poller};
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = HostConfig::default();
//! let session = Arc::new(RusbSession::new(config.profile.bus)?);
//! let driver = Arc::new(Driver::new(session, config.driver, config.profile)?);
//!
//! let (tx, rx) = common::create_note_channel(config.sink.capacity);
//! driver.set_note_sender(tx);
//! let poller = spawn_poller(driver.clone())?;
//!
//! while let Ok(note) = rx.recv_blocking() {
//!     println!("{}", note);
//! }
//! # driver.stop();
//! # let _ = poller.join();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod monitor;
pub mod usb;
