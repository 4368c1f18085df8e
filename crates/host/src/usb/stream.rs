//! Asynchronous notifications from the host session
//!
//! [`StreamClient`] is what the driver registers with its session. It runs
//! in the session's event context, never on the poller thread:
//!
//! - a device-gone notification marks the owning slot for `Close` and
//!   leaves the actual teardown to the next poll
//! - a completed stream transfer is decoded into notes, forwarded to the
//!   sink without blocking, and re-armed
//!
//! Neither path calls into the session while holding the table lock.

use crate::usb::driver::Shared;
use crate::usb::session::{ClientEvents, Completion, DeviceHandle, HostSession, TransferStatus};
use crate::usb::slots::lock_table;
use common::SendOutcome;
use protocol::decode_note_events;
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

pub(crate) struct StreamClient<S: HostSession> {
    /// Weak so the session's client registration does not keep it alive
    session: Weak<S>,
    shared: Arc<Shared>,
}

impl<S: HostSession> StreamClient<S> {
    pub fn new(session: Weak<S>, shared: Arc<Shared>) -> Self {
        Self { session, shared }
    }

    fn forward_notes(&self, completion: &Completion<'_>) {
        for note in decode_note_events(completion.data) {
            match self.shared.sink.try_send(note) {
                SendOutcome::Sent => {
                    trace!("{}: note {}", completion.context, note);
                    self.shared.stats.note_forwarded();
                }
                outcome => {
                    trace!("{}: dropped note {} ({:?})", completion.context, note, outcome);
                    self.shared.stats.note_dropped();
                }
            }
        }
    }

    fn resubmit(&self, completion: &Completion<'_>) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        match session.submit(completion.transfer) {
            Ok(()) => self.shared.stats.resubmitted(),
            Err(e) => warn!(
                "{}: failed to resubmit {}: {}",
                completion.context, completion.transfer, e
            ),
        }
    }
}

impl<S: HostSession> ClientEvents for StreamClient<S> {
    fn device_gone(&self, handle: DeviceHandle) {
        let mut table = lock_table(&self.shared.table);
        match table.mark_gone(handle) {
            Some(id) => debug!("{}: device {} gone, close scheduled", id, handle),
            None => debug!("Device {} gone but not tracked", handle),
        }
    }

    fn transfer_completed(&self, completion: Completion<'_>) {
        match completion.status {
            TransferStatus::Completed => {
                self.forward_notes(&completion);
                self.resubmit(&completion);
            }
            status if status.is_terminal() => {
                debug!(
                    "{}: {} ended ({:?})",
                    completion.context, completion.transfer, completion.status
                );
            }
            status => {
                warn!(
                    "{}: transfer {} failed with {:?}",
                    completion.context, completion.transfer, status
                );
                self.shared.stats.stream_error();
                self.resubmit(&completion);
            }
        }
    }
}
