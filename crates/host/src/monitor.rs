//! Downstream note monitor
//!
//! Minimal consumer of the note channel: logs every note together with the
//! key it maps to on the attached keyboard.

use common::NoteReceiver;
use protocol::NoteEvent;
use tracing::{debug, info, warn};

/// Physical key range of a keyboard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyboardLayout {
    /// MIDI note of the leftmost key
    pub lowest_note: u8,
    pub keys: u8,
}

impl Default for KeyboardLayout {
    /// 61 keys starting at C2
    fn default() -> Self {
        Self {
            lowest_note: 36,
            keys: 61,
        }
    }
}

impl KeyboardLayout {
    /// Zero-based key index of `note`, if it lies on the keyboard
    pub fn key_index(&self, note: NoteEvent) -> Option<u8> {
        let index = note.pitch.checked_sub(self.lowest_note)?;
        (index < self.keys).then_some(index)
    }
}

/// Log notes until every sender is gone; returns how many were seen
pub async fn run_monitor(rx: NoteReceiver, layout: KeyboardLayout) -> u64 {
    let mut seen = 0;
    while let Ok(note) = rx.recv().await {
        seen += 1;
        match layout.key_index(note) {
            Some(key) => info!("Note {} -> key {}", note, key),
            None => warn!("Note {} is outside the keyboard range", note),
        }
    }
    debug!("Note channel closed after {} notes", seen);
    seen
}
