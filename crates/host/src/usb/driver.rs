//! Device driver and discovery poller
//!
//! [`Driver`] owns the slot table and the note sink and drives every slot
//! through its lifecycle. One thread calls [`Driver::poll_once`] (or
//! [`Driver::run`], which loops over it); the host session calls back into
//! the driver from its own event context through the registered
//! [`StreamClient`].
//!
//! ```text
//! poller ──► discover ──► SlotTable ──► Lifecycle ──► HostSession
//!                            ▲                            │
//!                            └──── device_gone ◄──────────┤
//!                     EventSink ◄── transfer_completed ◄──┘
//! ```

use crate::config::{ConfigError, DeviceProfile, DriverSettings};
use crate::usb::lifecycle::Lifecycle;
use crate::usb::session::{HostError, HostSession};
use crate::usb::slots::{Action, DeviceSlot, SlotId, SlotTable, TrackOutcome, lock_table};
use crate::usb::stats::{DriverStats, StatsSnapshot};
use crate::usb::stream::StreamClient;
use common::{EventSink, NoteSender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Device addresses a bus can hand out (1..=127)
const USB_ADDRESS_SPACE: usize = 127;

/// Longest uninterrupted sleep between polls, so a stop request is noticed
const STOP_CHECK_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Host session error: {0}")]
    Session(HostError),

    #[error("{slot}: {operation} failed: {source}")]
    Fatal {
        slot: SlotId,
        operation: &'static str,
        source: HostError,
    },
}

/// State reachable from both the poller and the session's event context
pub(crate) struct Shared {
    pub table: Mutex<SlotTable>,
    pub sink: EventSink,
    pub stats: DriverStats,
}

pub struct Driver<S: HostSession + 'static> {
    session: Arc<S>,
    shared: Arc<Shared>,
    settings: DriverSettings,
    profile: DeviceProfile,
    stop: AtomicBool,
}

impl<S: HostSession + 'static> Driver<S> {
    /// Create a driver and register it as the session's client
    pub fn new(
        session: Arc<S>,
        settings: DriverSettings,
        profile: DeviceProfile,
    ) -> Result<Self, DriverError> {
        settings.validate()?;
        profile.validate()?;

        let shared = Arc::new(Shared {
            table: Mutex::new(SlotTable::new(settings.slot_capacity)),
            sink: EventSink::new(),
            stats: DriverStats::new(),
        });

        let client = StreamClient::new(Arc::downgrade(&session), shared.clone());
        session.register_client(Arc::new(client));

        info!(
            "Driver ready: {} slots, interface {} endpoint {:#04x}",
            settings.slot_capacity, profile.interface, profile.endpoint
        );

        Ok(Self {
            session,
            shared,
            settings,
            profile,
            stop: AtomicBool::new(false),
        })
    }

    /// Bind the consumer channel; may be called at any time
    pub fn set_note_sender(&self, sender: NoteSender) {
        self.shared.sink.bind(sender);
    }

    /// The producer handle completions push into
    pub fn sink(&self) -> EventSink {
        self.shared.sink.clone()
    }

    pub fn session(&self) -> &Arc<S> {
        &self.session
    }

    pub fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Copy of every slot, in slot order
    pub fn slots(&self) -> Vec<DeviceSlot> {
        lock_table(&self.shared.table)
            .iter()
            .map(|(_, slot)| slot.clone())
            .collect()
    }

    fn lifecycle(&self) -> Lifecycle<'_, S> {
        Lifecycle {
            session: self.session.as_ref(),
            table: &self.shared.table,
            profile: &self.profile,
            settings: &self.settings,
        }
    }

    /// Allocate slots for addresses not yet tracked
    ///
    /// The whole filtered bus is listed so a quarantined device is only
    /// released once it is really gone; allocation stops at capacity.
    /// Fails only if the session cannot list devices.
    pub fn discover(&self) -> Result<(), DriverError> {
        let live = self
            .session
            .list_device_addresses(USB_ADDRESS_SPACE, &self.profile.filters)
            .map_err(DriverError::Session)?;

        let mut table = lock_table(&self.shared.table);
        for id in table.release_vanished(&live) {
            info!("{}: quarantined device left the bus, slot released", id);
        }

        for address in live {
            match table.track_address(address) {
                TrackOutcome::Allocated(id) => {
                    info!("New device at address {} in {}", address, id)
                }
                TrackOutcome::Full => {
                    debug!("No free slot for address {}, ignoring", address)
                }
                TrackOutcome::AlreadyTracked(_) | TrackOutcome::Invalid => {}
            }
        }
        Ok(())
    }

    /// Drain every slot with pending work, in slot order
    pub fn process_pending(&self) -> Result<(), DriverError> {
        let pending = {
            let mut table = lock_table(&self.shared.table);
            if !table.take_unhandled() {
                return Ok(());
            }
            table.pending_slots()
        };

        let lifecycle = self.lifecycle();
        for id in pending {
            lifecycle.drain(id)?;
        }
        Ok(())
    }

    /// One poll cycle: discovery, lifecycle, then host events
    pub fn poll_once(&self) -> Result<(), DriverError> {
        self.discover()?;
        self.process_pending()?;

        match self
            .session
            .pump_events(self.settings.event_pump_timeout())
        {
            Ok(()) => {}
            Err(HostError::Interrupted) => {
                debug!("Host event handling interrupted");
            }
            Err(e) => warn!("Error handling host events: {}", e),
        }
        Ok(())
    }

    /// Poll until [`Driver::stop`] is called, then tear everything down
    pub fn run(&self) -> Result<(), DriverError> {
        info!(
            "Discovery poller started ({} ms period)",
            self.settings.poll_interval_ms
        );

        let result = loop {
            if self.is_stopping() {
                break Ok(());
            }
            if let Err(e) = self.poll_once() {
                error!("Poller failed: {}", e);
                break Err(e);
            }
            self.sleep_interval();
        };

        if let Err(e) = self.shutdown() {
            warn!("Shutdown incomplete: {}", e);
        }
        info!("Discovery poller stopped");
        result
    }

    fn sleep_interval(&self) {
        let mut remaining = self.settings.poll_interval();
        while !remaining.is_zero() && !self.is_stopping() {
            let step = remaining.min(STOP_CHECK_INTERVAL);
            thread::sleep(step);
            remaining -= step;
        }
    }

    /// Ask [`Driver::run`] to return after the current cycle
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Schedule `Close` for the device at `address`
    pub fn request_close(&self, address: u8) -> bool {
        let mut table = lock_table(&self.shared.table);
        match table.find_by_address(address) {
            Some(id) => {
                table.schedule(id, Action::Close);
                true
            }
            None => false,
        }
    }

    /// Close every tracked device and deregister from the session
    ///
    /// Every slot is drained even if one fails; the first error is returned.
    pub fn shutdown(&self) -> Result<(), DriverError> {
        let ids = {
            let mut table = lock_table(&self.shared.table);
            let count = table.close_all();
            if count > 0 {
                info!("Closing {} device(s)", count);
            }
            table.take_unhandled();
            table.pending_slots()
        };

        let lifecycle = self.lifecycle();
        let mut result = Ok(());
        for id in ids {
            if let Err(e) = lifecycle.drain(id)
                && result.is_ok()
            {
                result = Err(e);
            }
        }

        self.session.deregister_client();
        info!("Driver stats: {}", self.stats());
        result
    }
}

/// Run the poller on a dedicated thread
pub fn spawn_poller<S: HostSession + 'static>(
    driver: Arc<Driver<S>>,
) -> std::io::Result<JoinHandle<Result<(), DriverError>>> {
    thread::Builder::new()
        .name("usb-poller".to_string())
        .spawn(move || driver.run())
}
