//! Note channel between the USB callback context and downstream consumers
//!
//! The producer side lives inside the host driver and is pushed to from USB
//! completion callbacks, which must never block. The consumer side is handed
//! to whatever renders or scores the notes and may be async or blocking.
//!
//! The sink starts unbound: a completion that fires before a consumer has
//! registered simply drops its notes.

use async_channel::{Receiver, Sender, TrySendError, bounded};
use protocol::NoteEvent;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Producer half of a note channel
pub type NoteSender = Sender<NoteEvent>;

/// What happened to a note pushed into an [`EventSink`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Queued for the consumer
    Sent,
    /// Channel full, note dropped
    Full,
    /// No consumer registered yet, note dropped
    Unbound,
    /// Consumer went away, note dropped
    Closed,
}

/// Settable, non-blocking producer handle for note events
///
/// Cloning shares the binding: binding a sender through one clone is visible
/// to every other clone, including ones already captured by callbacks.
#[derive(Clone, Default)]
pub struct EventSink {
    sender: Arc<RwLock<Option<NoteSender>>>,
}

impl EventSink {
    /// Create an unbound sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind (or rebind) the consumer channel
    pub fn bind(&self, sender: NoteSender) {
        *self.sender.write().unwrap_or_else(PoisonError::into_inner) = Some(sender);
        debug!("Note sink bound");
    }

    /// Drop the consumer channel, returning the sink to the unbound state
    pub fn unbind(&self) {
        let previous = self
            .sender
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if previous.is_some() {
            debug!("Note sink unbound");
        }
    }

    pub fn is_bound(&self) -> bool {
        self.sender
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Push a note without blocking
    pub fn try_send(&self, note: NoteEvent) -> SendOutcome {
        let guard = self.sender.read().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = guard.as_ref() else {
            return SendOutcome::Unbound;
        };

        match sender.try_send(note) {
            Ok(()) => SendOutcome::Sent,
            Err(TrySendError::Full(_)) => SendOutcome::Full,
            Err(TrySendError::Closed(_)) => SendOutcome::Closed,
        }
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("bound", &self.is_bound())
            .finish()
    }
}

/// Consumer half of a note channel
pub struct NoteReceiver {
    rx: Receiver<NoteEvent>,
}

impl NoteReceiver {
    /// Receive the next note (async)
    pub async fn recv(&self) -> crate::Result<NoteEvent> {
        self.rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Receive the next note (blocking)
    pub fn recv_blocking(&self) -> crate::Result<NoteEvent> {
        self.rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Try to receive a note without blocking
    pub fn try_recv(&self) -> Option<NoteEvent> {
        self.rx.try_recv().ok()
    }

    /// Number of notes waiting
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Create a bounded note channel
///
/// Returns (sender to bind into an [`EventSink`], receiver for the consumer)
pub fn create_note_channel(capacity: usize) -> (NoteSender, NoteReceiver) {
    let (tx, rx) = bounded(capacity.max(1));
    (tx, NoteReceiver { rx })
}
