//! Device slot table
//!
//! A fixed number of slots, each tracking one attached device through its
//! bring-up and teardown. The table lives behind a single mutex owned by the
//! driver; every method here is O(capacity) bookkeeping and never calls into
//! the host session.

use crate::usb::session::{DeviceHandle, TransferId};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Work owed to a slot
///
/// Variants are declared in execution priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Action {
    Open,
    FetchInfo,
    FetchConfig,
    ClaimInterface,
    Close,
}

impl Action {
    /// All actions, in the order a snapshot executes them
    pub const PRIORITY: [Action; 5] = [
        Action::Open,
        Action::FetchInfo,
        Action::FetchConfig,
        Action::ClaimInterface,
        Action::Close,
    ];

    /// Action scheduled after this one succeeds
    pub fn next(self) -> Option<Action> {
        match self {
            Action::Open => Some(Action::FetchInfo),
            Action::FetchInfo => Some(Action::FetchConfig),
            Action::FetchConfig => Some(Action::ClaimInterface),
            Action::ClaimInterface | Action::Close => None,
        }
    }

    fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

/// Unordered set of pending actions
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct ActionSet(u8);

impl ActionSet {
    pub const EMPTY: ActionSet = ActionSet(0);

    /// A set holding exactly one action
    pub fn only(action: Action) -> Self {
        Self(action.bit())
    }

    pub fn insert(&mut self, action: Action) {
        self.0 |= action.bit();
    }

    pub fn remove(&mut self, action: Action) {
        self.0 &= !action.bit();
    }

    pub fn contains(&self, action: Action) -> bool {
        self.0 & action.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// Take the current contents, leaving the set empty
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }

    /// Iterate in execution priority order, regardless of insertion order
    pub fn iter(&self) -> impl Iterator<Item = Action> + '_ {
        Action::PRIORITY
            .into_iter()
            .filter(move |action| self.contains(*action))
    }
}

impl FromIterator<Action> for ActionSet {
    fn from_iter<I: IntoIterator<Item = Action>>(iter: I) -> Self {
        let mut set = ActionSet::EMPTY;
        for action in iter {
            set.insert(action);
        }
        set
    }
}

impl fmt::Debug for ActionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Index of a slot in the table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub usize);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot {}", self.0)
    }
}

/// One tracked device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceSlot {
    /// Bus address, 0 when the slot is free
    pub address: u8,
    /// Session handle once opened
    pub handle: Option<DeviceHandle>,
    /// Work still owed to this slot
    pub pending: ActionSet,
    /// Streaming transfer once the interface is claimed and the first
    /// submission succeeded
    pub stream_transfer: Option<TransferId>,
    /// Interface claimed on `handle`
    pub claimed_interface: Option<u8>,
    /// Parked after a fatal error; keeps `address` so discovery skips it
    pub quarantined: bool,
}

impl DeviceSlot {
    pub fn is_occupied(&self) -> bool {
        self.address != 0
    }

    /// Whether the device is claimed and streaming
    pub fn is_streaming(&self) -> bool {
        self.stream_transfer.is_some()
    }

    /// Return to the unoccupied state
    pub fn reset(&mut self) {
        *self = DeviceSlot::default();
    }
}

/// Result of offering a live address to the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackOutcome {
    /// Address already occupies a slot
    AlreadyTracked(SlotId),
    /// A free slot was taken and `Open` scheduled
    Allocated(SlotId),
    /// No free slot; the address is ignored
    Full,
    /// Address 0 is never assigned to a device
    Invalid,
}

/// Fixed-capacity table of device slots
#[derive(Debug)]
pub struct SlotTable {
    slots: Box<[DeviceSlot]>,
    /// Set whenever a producer schedules work for any slot
    unhandled: bool,
    /// Failed claim attempts per address, kept across Close/Open cycles
    claim_failures: HashMap<u8, u32>,
}

impl SlotTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![DeviceSlot::default(); capacity].into_boxed_slice(),
            unhandled: false,
            claim_failures: HashMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Borrow a slot
    ///
    /// # Panics
    /// If `id` is out of range. Ids only come from this table.
    pub fn slot(&self, id: SlotId) -> &DeviceSlot {
        &self.slots[id.0]
    }

    pub fn slot_mut(&mut self, id: SlotId) -> &mut DeviceSlot {
        &mut self.slots[id.0]
    }

    pub fn iter(&self) -> impl Iterator<Item = (SlotId, &DeviceSlot)> {
        self.slots
            .iter()
            .enumerate()
            .map(|(index, slot)| (SlotId(index), slot))
    }

    pub fn occupied_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_occupied()).count()
    }

    pub fn find_by_address(&self, address: u8) -> Option<SlotId> {
        if address == 0 {
            return None;
        }
        self.iter()
            .find(|(_, slot)| slot.address == address)
            .map(|(id, _)| id)
    }

    pub fn find_by_handle(&self, handle: DeviceHandle) -> Option<SlotId> {
        self.iter()
            .find(|(_, slot)| slot.handle == Some(handle))
            .map(|(id, _)| id)
    }

    /// Offer a live address: allocate the first free slot if untracked
    pub fn track_address(&mut self, address: u8) -> TrackOutcome {
        if address == 0 {
            return TrackOutcome::Invalid;
        }
        if let Some(id) = self.find_by_address(address) {
            return TrackOutcome::AlreadyTracked(id);
        }

        let Some(index) = self.slots.iter().position(|slot| !slot.is_occupied()) else {
            return TrackOutcome::Full;
        };

        let slot = &mut self.slots[index];
        slot.address = address;
        slot.pending.insert(Action::Open);
        self.unhandled = true;
        TrackOutcome::Allocated(SlotId(index))
    }

    /// Union an action into a slot's pending set and flag the table
    pub fn schedule(&mut self, id: SlotId, action: Action) {
        self.slots[id.0].pending.insert(action);
        self.unhandled = true;
    }

    /// Disconnect path: replace the pending set of the slot owning `handle`
    /// with exactly `Close`
    pub fn mark_gone(&mut self, handle: DeviceHandle) -> Option<SlotId> {
        let id = self.find_by_handle(handle)?;
        self.slots[id.0].pending = ActionSet::only(Action::Close);
        self.unhandled = true;
        Some(id)
    }

    /// Schedule `Close` on every occupied slot
    pub fn close_all(&mut self) -> usize {
        let mut count = 0;
        for slot in self.slots.iter_mut().filter(|slot| slot.is_occupied()) {
            slot.pending = ActionSet::only(Action::Close);
            count += 1;
        }
        if count > 0 {
            self.unhandled = true;
        }
        count
    }

    /// Read and clear the unhandled-work flag
    pub fn take_unhandled(&mut self) -> bool {
        std::mem::take(&mut self.unhandled)
    }

    pub fn has_unhandled(&self) -> bool {
        self.unhandled
    }

    /// Slots with pending work, in slot order
    pub fn pending_slots(&self) -> Vec<SlotId> {
        self.iter()
            .filter(|(_, slot)| !slot.pending.is_empty())
            .map(|(id, _)| id)
            .collect()
    }

    /// Snapshot and clear a slot's pending set
    pub fn take_actions(&mut self, id: SlotId) -> ActionSet {
        self.slots[id.0].pending.take()
    }

    /// Free quarantined slots whose device is no longer on the bus
    ///
    /// `live` must be every device on the bus, not a truncated prefix.
    pub fn release_vanished(&mut self, live: &[u8]) -> Vec<SlotId> {
        let mut released = Vec::new();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.quarantined && !live.contains(&slot.address) {
                slot.reset();
                released.push(SlotId(index));
            }
        }
        self.claim_failures
            .retain(|address, _| live.contains(address));
        released
    }

    /// Count a failed claim for `address`, returning the new total
    pub fn record_claim_failure(&mut self, address: u8) -> u32 {
        let count = self.claim_failures.entry(address).or_insert(0);
        *count += 1;
        *count
    }

    pub fn clear_claim_failures(&mut self, address: u8) {
        self.claim_failures.remove(&address);
    }
}

/// Lock the shared table
///
/// A panic while the lock was held cannot leave a slot half-written (every
/// mutation is a plain field store), so a poisoned lock is recovered.
pub(crate) fn lock_table(table: &Mutex<SlotTable>) -> MutexGuard<'_, SlotTable> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}
