//! Host session interface
//!
//! The driver never talks to a USB stack directly. Everything it needs from
//! the host controller goes through [`HostSession`]: enumeration, open/close,
//! descriptor queries, interface claiming, and the streaming transfer
//! primitives. Asynchronous notifications flow back through the registered
//! [`ClientEvents`] implementation, from whatever thread the session uses to
//! run its event processing.

use crate::usb::slots::SlotId;
use protocol::{ConfigSummary, DeviceInfo};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Opaque handle to an opened device (session-assigned)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub u32);

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev#{}", self.0)
    }
}

/// Identifier of an allocated streaming transfer (session-assigned)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferId(pub u32);

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "xfer#{}", self.0)
    }
}

/// Endpoint transfer type used for the streaming read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferKind {
    #[default]
    Bulk,
    Interrupt,
}

/// Terminal state of one submission of a streaming transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Data arrived (possibly zero bytes)
    Completed,
    /// Generic transfer failure
    Error,
    /// Endpoint halted
    Stall,
    /// Device sent more data than requested
    Overflow,
    /// Device is gone
    NoDevice,
    /// Transfer was cancelled by the host
    Canceled,
}

impl TransferStatus {
    /// Whether the stream has ended for good and must not be resubmitted
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::NoDevice | Self::Canceled)
    }
}

/// Parameters for allocating a streaming transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferRequest {
    /// Device the transfer reads from
    pub device: DeviceHandle,
    /// IN endpoint address
    pub endpoint: u8,
    /// Bulk or interrupt
    pub kind: TransferKind,
    /// Buffer size in bytes (the endpoint's max packet size)
    pub length: usize,
    /// Slot the transfer belongs to, echoed back in every completion
    pub context: SlotId,
}

/// A finished submission, handed to [`ClientEvents::transfer_completed`]
#[derive(Debug, Clone, Copy)]
pub struct Completion<'a> {
    pub transfer: TransferId,
    pub context: SlotId,
    pub status: TransferStatus,
    /// Received bytes (empty unless `status` is `Completed`)
    pub data: &'a [u8],
}

/// Errors reported by a host session
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HostError {
    #[error("device is gone")]
    NoDevice,

    #[error("entity not found")]
    NotFound,

    #[error("resource busy")]
    Busy,

    #[error("access denied")]
    Access,

    #[error("invalid parameter")]
    InvalidParam,

    #[error("I/O error")]
    Io,

    #[error("operation timed out")]
    Timeout,

    #[error("endpoint stalled")]
    Pipe,

    #[error("out of memory")]
    NoMem,

    #[error("operation not supported")]
    NotSupported,

    #[error("interrupted")]
    Interrupted,

    #[error("host stack error: {0}")]
    Other(String),
}

/// Asynchronous notifications from a host session
///
/// Implementations are invoked from the session's own event context and may
/// run concurrently with the poller. They must not block.
pub trait ClientEvents: Send + Sync {
    /// An opened device has been removed from the bus
    fn device_gone(&self, handle: DeviceHandle);

    /// A submitted streaming transfer reached a terminal state
    ///
    /// Invoked at most once per submission; the session does not call it
    /// again for the same transfer until it is resubmitted.
    fn transfer_completed(&self, completion: Completion<'_>);
}

/// The USB host stack as seen by the driver
pub trait HostSession: Send + Sync {
    /// Register the client receiving asynchronous notifications
    fn register_client(&self, client: Arc<dyn ClientEvents>);

    /// Drop the registered client; no notifications are delivered afterwards
    fn deregister_client(&self);

    /// Addresses of the devices currently on the bus whose VID:PID passes
    /// `filters` (see [`check_filter`]), at most `max` of them
    ///
    /// [`check_filter`]: crate::config::check_filter
    fn list_device_addresses(&self, max: usize, filters: &[String])
    -> Result<Vec<u8>, HostError>;

    fn open(&self, address: u8) -> Result<DeviceHandle, HostError>;

    fn close(&self, handle: DeviceHandle) -> Result<(), HostError>;

    fn device_info(&self, handle: DeviceHandle) -> Result<DeviceInfo, HostError>;

    fn active_config_descriptor(&self, handle: DeviceHandle) -> Result<ConfigSummary, HostError>;

    fn claim_interface(&self, handle: DeviceHandle, interface: u8) -> Result<(), HostError>;

    fn release_interface(&self, handle: DeviceHandle, interface: u8) -> Result<(), HostError>;

    fn alloc_transfer(&self, request: TransferRequest) -> Result<TransferId, HostError>;

    /// Arm a transfer; its completion is delivered to the registered client
    fn submit(&self, transfer: TransferId) -> Result<(), HostError>;

    /// Release a transfer
    ///
    /// Once this returns, no further completion for `transfer` is delivered.
    fn free(&self, transfer: TransferId);

    /// Process pending notifications, waiting at most `timeout`
    fn pump_events(&self, timeout: Duration) -> Result<(), HostError>;
}
