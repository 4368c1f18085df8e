//! USB subsystem
//!
//! Brings attached devices up to a streaming state and tears them down
//! again. The pieces, leaves first:
//!
//! - [`session`]: the host stack as a trait, plus its value types
//! - [`slots`]: the fixed-capacity device slot table
//! - `lifecycle`: the per-slot action pipeline (Open → FetchInfo →
//!   FetchConfig → ClaimInterface, and Close)
//! - `stream`: completion and disconnect callbacks
//! - [`driver`]: discovery poller owning all of the above
//!
//! [`rusb_session`] talks to real hardware through libusb; [`mock`] is an
//! in-memory session for tests.

mod lifecycle;
mod stream;

pub mod driver;
pub mod mock;
pub mod rusb_session;
pub mod session;
pub mod slots;
pub mod stats;

pub use driver::{Driver, DriverError, spawn_poller};
pub use rusb_session::RusbSession;
pub use session::{
    ClientEvents, Completion, DeviceHandle, HostError, HostSession, TransferId, TransferKind,
    TransferRequest, TransferStatus,
};
pub use slots::{Action, ActionSet, DeviceSlot, SlotId, SlotTable, TrackOutcome};
pub use stats::{DriverStats, StatsSnapshot};
