//! Device lifecycle state machine
//!
//! Drains a slot's pending actions: snapshot the set under the table lock,
//! clear it, then run each action in priority order with the lock released
//! for the duration of every host call. A successful action schedules the
//! next one (Open → FetchInfo → FetchConfig → ClaimInterface), so the loop
//! keeps snapshotting until the set stays empty.
//!
//! `Close` preempts: a snapshot containing it runs nothing else, and a
//! `Close` scheduled by the disconnect path while a snapshot is in flight
//! stops that snapshot before its next action.

use crate::config::{DeviceProfile, DriverSettings, FatalPolicy};
use crate::usb::driver::DriverError;
use crate::usb::session::{DeviceHandle, HostError, HostSession, TransferRequest};
use crate::usb::slots::{Action, SlotId, SlotTable, lock_table};
use std::sync::Mutex;
use tracing::{debug, error, info, warn};

pub(crate) struct Lifecycle<'a, S: HostSession + ?Sized> {
    pub session: &'a S,
    pub table: &'a Mutex<SlotTable>,
    pub profile: &'a DeviceProfile,
    pub settings: &'a DriverSettings,
}

impl<S: HostSession + ?Sized> Lifecycle<'_, S> {
    /// Run the slot's pending actions until none are left
    pub fn drain(&self, id: SlotId) -> Result<(), DriverError> {
        loop {
            let snapshot = lock_table(self.table).take_actions(id);
            if snapshot.is_empty() {
                return Ok(());
            }
            debug!("{}: handling {:?}", id, snapshot);

            if snapshot.contains(Action::Close) {
                self.close(id)?;
                continue;
            }

            for action in snapshot.iter() {
                if lock_table(self.table).slot(id).pending.contains(Action::Close) {
                    debug!("{}: close requested, dropping rest of {:?}", id, snapshot);
                    break;
                }

                match action {
                    Action::Open => self.open(id)?,
                    Action::FetchInfo => self.fetch_info(id),
                    Action::FetchConfig => self.fetch_config(id),
                    Action::ClaimInterface => self.claim_interface(id),
                    Action::Close => unreachable!("close handled above"),
                }
            }
        }
    }

    fn schedule(&self, id: SlotId, action: Action) {
        lock_table(self.table).slot_mut(id).pending.insert(action);
    }

    fn open(&self, id: SlotId) -> Result<(), DriverError> {
        let address = lock_table(self.table).slot(id).address;
        if address == 0 {
            error!("{}: open requested on an unoccupied slot", id);
            return Ok(());
        }

        info!("Opening device at address {}", address);
        match self.session.open(address) {
            Ok(handle) => {
                let mut table = lock_table(self.table);
                let slot = table.slot_mut(id);
                slot.handle = Some(handle);
                slot.pending.insert(Action::FetchInfo);
                debug!("{}: address {} opened as {}", id, address, handle);
                Ok(())
            }
            Err(HostError::NoDevice) => {
                info!("Device at address {} left before it could be opened", address);
                self.schedule(id, Action::Close);
                Ok(())
            }
            Err(e) => self.fatal(id, "open", e),
        }
    }

    fn fetch_info(&self, id: SlotId) {
        let Some(handle) = lock_table(self.table).slot(id).handle else {
            warn!("{}: device info requested without an open handle", id);
            return;
        };

        info!("Getting device information");
        match self.session.device_info(handle) {
            Ok(info) => {
                info!(
                    "\t{:04x}:{:04x} {:?} speed",
                    info.vendor_id, info.product_id, info.speed
                );
                info!("\tbConfigurationValue {}", info.configuration_value);
            }
            Err(HostError::NoDevice) => {
                self.schedule(id, Action::Close);
                return;
            }
            Err(e) => {
                error!("{}: failed to get device info: {}; abandoning device", id, e);
                return;
            }
        }
        self.schedule(id, Action::FetchConfig);
    }

    fn fetch_config(&self, id: SlotId) {
        let Some(handle) = lock_table(self.table).slot(id).handle else {
            warn!("{}: config descriptor requested without an open handle", id);
            return;
        };

        info!("Getting config descriptor");
        match self.session.active_config_descriptor(handle) {
            Ok(config) => {
                info!(
                    "\tbConfigurationValue {}, {} interface(s), {} mA",
                    config.configuration_value,
                    config.interfaces.len(),
                    config.max_power_ma
                );
                for (number, class, subclass, endpoints) in &config.interfaces {
                    let addresses: Vec<String> = endpoints
                        .iter()
                        .map(|ep| format!("{:#04x}/{}", ep.address, ep.max_packet_size))
                        .collect();
                    debug!(
                        "\tinterface {} class {:#04x}/{:#04x} endpoints [{}]",
                        number,
                        class,
                        subclass,
                        addresses.join(", ")
                    );
                }
                if !config.has_endpoint(self.profile.interface, self.profile.endpoint) {
                    warn!(
                        "Active configuration has no endpoint {:#04x} on interface {}; claiming anyway",
                        self.profile.endpoint, self.profile.interface
                    );
                }
            }
            Err(HostError::NoDevice) => {
                self.schedule(id, Action::Close);
                return;
            }
            Err(e) => {
                error!(
                    "{}: failed to get config descriptor: {}; abandoning device",
                    id, e
                );
                return;
            }
        }
        self.schedule(id, Action::ClaimInterface);
    }

    fn claim_interface(&self, id: SlotId) {
        let (handle, address, streaming) = {
            let table = lock_table(self.table);
            let slot = table.slot(id);
            (slot.handle, slot.address, slot.is_streaming())
        };
        let Some(handle) = handle else {
            warn!("{}: claim requested without an open handle", id);
            return;
        };
        if streaming {
            debug!("{}: already streaming", id);
            return;
        }

        let interface = self.profile.interface;
        info!(
            "Claiming MIDI interface (num={}, EP={:#04x})",
            interface, self.profile.endpoint
        );
        if let Err(e) = self.session.claim_interface(handle, interface) {
            error!("Failed to claim interface: {}", e);
            self.claim_failed(id, address, e);
            return;
        }
        lock_table(self.table).slot_mut(id).claimed_interface = Some(interface);

        let request = TransferRequest {
            device: handle,
            endpoint: self.profile.endpoint,
            kind: self.profile.transfer_kind,
            length: self.profile.max_packet_size,
            context: id,
        };
        let transfer = match self.session.alloc_transfer(request) {
            Ok(transfer) => transfer,
            Err(e) => {
                error!("Failed to allocate transfer: {}", e);
                self.release_interface(id, handle, interface);
                self.claim_failed(id, address, e);
                return;
            }
        };

        info!("Submitting first MIDI IN transfer");
        if let Err(e) = self.session.submit(transfer) {
            error!("Failed to submit transfer: {}", e);
            self.session.free(transfer);
            self.release_interface(id, handle, interface);
            self.claim_failed(id, address, e);
            return;
        }

        let mut table = lock_table(self.table);
        table.slot_mut(id).stream_transfer = Some(transfer);
        table.clear_claim_failures(address);
        info!("Streaming MIDI from address {} on {}", address, transfer);
    }

    fn release_interface(&self, id: SlotId, handle: DeviceHandle, interface: u8) {
        if let Err(e) = self.session.release_interface(handle, interface) {
            debug!("{}: failed to release interface {}: {}", id, interface, e);
        }
        lock_table(self.table).slot_mut(id).claimed_interface = None;
    }

    /// Abandon the claim; retry through Close/Open when configured to
    fn claim_failed(&self, id: SlotId, address: u8, err: HostError) {
        if err == HostError::NoDevice {
            self.schedule(id, Action::Close);
            return;
        }

        let limit = self.settings.claim_retry_limit;
        if limit == 0 {
            return;
        }

        let attempts = lock_table(self.table).record_claim_failure(address);
        if attempts <= limit {
            warn!(
                "Retrying address {} through close/open (attempt {}/{})",
                address, attempts, limit
            );
            self.schedule(id, Action::Close);
        } else {
            error!(
                "Giving up on address {} after {} failed claims",
                address, limit
            );
        }
    }

    fn close(&self, id: SlotId) -> Result<(), DriverError> {
        let (address, handle, transfer, interface) = {
            let mut table = lock_table(self.table);
            let slot = table.slot_mut(id);
            (
                slot.address,
                slot.handle,
                slot.stream_transfer.take(),
                slot.claimed_interface.take(),
            )
        };

        if address == 0 && handle.is_none() {
            debug!("{}: close on unoccupied slot", id);
            lock_table(self.table).slot_mut(id).reset();
            return Ok(());
        }

        info!("Closing device addr {}", address);
        if let Some(transfer) = transfer {
            self.session.free(transfer);
        }

        let mut result = Ok(());
        if let Some(handle) = handle {
            if let Some(interface) = interface
                && let Err(e) = self.session.release_interface(handle, interface)
            {
                debug!("{}: failed to release interface {}: {}", id, interface, e);
            }
            if let Err(e) = self.session.close(handle) {
                result = self.fatal(id, "close", e);
            }
        }

        lock_table(self.table).slot_mut(id).reset();
        result
    }

    /// A host call that must not fail did fail
    fn fatal(&self, id: SlotId, operation: &'static str, source: HostError) -> Result<(), DriverError> {
        match self.settings.fatal_policy {
            FatalPolicy::Abort => {
                error!("{}: {} failed: {}; aborting", id, operation, source);
                Err(DriverError::Fatal {
                    slot: id,
                    operation,
                    source,
                })
            }
            FatalPolicy::Quarantine => {
                error!("{}: {} failed: {}; quarantining slot", id, operation, source);
                let mut table = lock_table(self.table);
                let slot = table.slot_mut(id);
                slot.quarantined = true;
                slot.pending.take();
                Ok(())
            }
        }
    }
}
