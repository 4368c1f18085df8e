//! In-memory host session
//!
//! A scriptable [`HostSession`] for exercising the driver without hardware.
//! Devices are attached and detached by address, failures are injected per
//! operation with [`MockSession::fail_next`], and stream completions are
//! delivered on demand with [`MockSession::complete`]. Every call the driver
//! makes is recorded so tests can assert on ordering.
//!
//! Notifications are delivered the way a real stack does it: from outside
//! the session's own lock, so the client is free to call back in.

use crate::config::check_filter;
use crate::usb::session::{
    ClientEvents, Completion, DeviceHandle, HostError, HostSession, TransferId, TransferRequest,
    TransferStatus,
};
use crate::usb::slots::SlotId;
use protocol::{ConfigSummary, DeviceInfo, DeviceSpeed, EndpointSummary};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Vendor id reported for devices plugged in with [`MockSession::attach`]
pub const MOCK_VENDOR_ID: u16 = 0x0499;
/// Product id reported for devices plugged in with [`MockSession::attach`]
pub const MOCK_PRODUCT_ID: u16 = 0x1617;

/// Session operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockOp {
    List,
    Open,
    Close,
    DeviceInfo,
    ConfigDescriptor,
    Claim,
    Release,
    Alloc,
    Submit,
    Pump,
}

/// A call made by the driver, in the order it was made
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockCall {
    Open(u8),
    Close(DeviceHandle),
    DeviceInfo(DeviceHandle),
    ConfigDescriptor(DeviceHandle),
    Claim(DeviceHandle, u8),
    Release(DeviceHandle, u8),
    Alloc(TransferId),
    Submit(TransferId),
    Free(TransferId),
}

#[derive(Debug)]
struct MockTransfer {
    request: TransferRequest,
    armed: bool,
}

#[derive(Default)]
struct State {
    client: Option<Arc<dyn ClientEvents>>,
    attached: Vec<u8>,
    /// VID:PID of attached devices not using the canned keyboard ids
    ids: HashMap<u8, (u16, u16)>,
    open: HashMap<DeviceHandle, u8>,
    claimed: Vec<(DeviceHandle, u8)>,
    transfers: HashMap<TransferId, MockTransfer>,
    next_handle: u32,
    next_transfer: u32,
    failures: VecDeque<(MockOp, HostError)>,
    detach_triggers: Vec<(MockOp, u8)>,
    queued_gone: Vec<DeviceHandle>,
    queued_completions: Vec<(TransferId, SlotId, TransferStatus)>,
    calls: Vec<MockCall>,
    submit_count: usize,
    free_count: usize,
}

impl State {
    fn take_failure(&mut self, op: MockOp) -> Result<(), HostError> {
        let index = self.failures.iter().position(|(o, _)| *o == op);
        match index.and_then(|i| self.failures.remove(i)) {
            Some((_, err)) => Err(err),
            None => Ok(()),
        }
    }

    fn ids_of(&self, address: u8) -> (u16, u16) {
        self.ids
            .get(&address)
            .copied()
            .unwrap_or((MOCK_VENDOR_ID, MOCK_PRODUCT_ID))
    }

    fn address_of(&self, handle: DeviceHandle) -> Result<u8, HostError> {
        let address = *self.open.get(&handle).ok_or(HostError::NotFound)?;
        if !self.attached.contains(&address) {
            return Err(HostError::NoDevice);
        }
        Ok(address)
    }

    /// Remove `address` from the bus; returns the handles that were open on it
    fn unplug(&mut self, address: u8) -> Vec<DeviceHandle> {
        self.attached.retain(|a| *a != address);
        self.ids.remove(&address);

        let handles: Vec<DeviceHandle> = self
            .open
            .iter()
            .filter(|(_, a)| **a == address)
            .map(|(h, _)| *h)
            .collect();

        for (id, transfer) in self.transfers.iter_mut() {
            if transfer.armed && handles.contains(&transfer.request.device) {
                transfer.armed = false;
                self.queued_completions
                    .push((*id, transfer.request.context, TransferStatus::NoDevice));
            }
        }
        handles
    }

    fn fire_triggers(&mut self, op: MockOp) -> Vec<DeviceHandle> {
        let (fired, kept): (Vec<_>, Vec<_>) = self
            .detach_triggers
            .drain(..)
            .partition(|(o, _)| *o == op);
        self.detach_triggers = kept;

        fired
            .into_iter()
            .flat_map(|(_, address)| self.unplug(address))
            .collect()
    }
}

/// Scriptable host session backed by plain data
#[derive(Default)]
pub struct MockSession {
    state: Mutex<State>,
}

impl MockSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// A session with the given addresses already on the bus
    pub fn with_devices(addresses: &[u8]) -> Self {
        let session = Self::new();
        for address in addresses {
            session.attach(*address);
        }
        session
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify_gone(&self, client: Option<Arc<dyn ClientEvents>>, handles: Vec<DeviceHandle>) {
        if let Some(client) = client {
            for handle in handles {
                client.device_gone(handle);
            }
        }
    }

    /// Plug the canned keyboard in at `address`
    pub fn attach(&self, address: u8) {
        self.attach_device(address, MOCK_VENDOR_ID, MOCK_PRODUCT_ID);
    }

    /// Plug a device with the given VID:PID in at `address`
    pub fn attach_device(&self, address: u8, vendor_id: u16, product_id: u16) {
        let mut state = self.state();
        if !state.attached.contains(&address) {
            state.attached.push(address);
        }
        if (vendor_id, product_id) == (MOCK_VENDOR_ID, MOCK_PRODUCT_ID) {
            state.ids.remove(&address);
        } else {
            state.ids.insert(address, (vendor_id, product_id));
        }
    }

    /// Unplug a device; the gone notification is delivered by the next
    /// `pump_events`, as a real stack would
    pub fn detach(&self, address: u8) {
        let mut state = self.state();
        let handles = state.unplug(address);
        state.queued_gone.extend(handles);
    }

    /// Unplug a device and deliver the gone notification immediately, as if
    /// the event context ran concurrently with the caller
    pub fn detach_now(&self, address: u8) {
        let (client, handles) = {
            let mut state = self.state();
            let handles = state.unplug(address);
            (state.client.clone(), handles)
        };
        self.notify_gone(client, handles);
    }

    /// Unplug `address` right after the next successful `op`, notifying
    /// the client before that call returns
    pub fn detach_on(&self, op: MockOp, address: u8) {
        self.state().detach_triggers.push((op, address));
    }

    /// Make the next `op` fail with `err`
    pub fn fail_next(&self, op: MockOp, err: HostError) {
        self.state().failures.push_back((op, err));
    }

    /// Finish the current submission of `transfer`
    ///
    /// Returns false (and delivers nothing) if the transfer is not armed.
    pub fn complete(&self, transfer: TransferId, status: TransferStatus, data: &[u8]) -> bool {
        let (client, context) = {
            let mut state = self.state();
            let Some(entry) = state.transfers.get_mut(&transfer) else {
                return false;
            };
            if !entry.armed {
                return false;
            }
            entry.armed = false;
            let context = entry.request.context;
            (state.client.clone(), context)
        };

        if let Some(client) = client {
            client.transfer_completed(Completion {
                transfer,
                context,
                status,
                data,
            });
        }
        true
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn submit_count(&self) -> usize {
        self.state().submit_count
    }

    pub fn free_count(&self) -> usize {
        self.state().free_count
    }

    pub fn has_client(&self) -> bool {
        self.state().client.is_some()
    }

    /// Handles currently open
    pub fn open_handles(&self) -> Vec<DeviceHandle> {
        let mut handles: Vec<_> = self.state().open.keys().copied().collect();
        handles.sort_by_key(|h| h.0);
        handles
    }

    /// Interfaces currently claimed, as (handle, interface)
    pub fn claimed_interfaces(&self) -> Vec<(DeviceHandle, u8)> {
        self.state().claimed.clone()
    }

    /// Transfers allocated and not yet freed
    pub fn live_transfers(&self) -> Vec<TransferId> {
        let mut ids: Vec<_> = self.state().transfers.keys().copied().collect();
        ids.sort_by_key(|id| id.0);
        ids
    }

    /// Transfers with a submission in flight
    pub fn armed_transfers(&self) -> Vec<TransferId> {
        let mut ids: Vec<_> = self
            .state()
            .transfers
            .iter()
            .filter(|(_, t)| t.armed)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_by_key(|id| id.0);
        ids
    }

    pub fn transfer_request(&self, transfer: TransferId) -> Option<TransferRequest> {
        self.state().transfers.get(&transfer).map(|t| t.request)
    }

    /// Run `call` and then any detach trigger registered for `op`
    fn with_triggers<T>(
        &self,
        op: MockOp,
        call: impl FnOnce(&mut State) -> Result<T, HostError>,
    ) -> Result<T, HostError> {
        let (result, client, gone) = {
            let mut state = self.state();
            let result = call(&mut state);
            let gone = if result.is_ok() {
                state.fire_triggers(op)
            } else {
                Vec::new()
            };
            (result, state.client.clone(), gone)
        };
        self.notify_gone(client, gone);
        result
    }
}

impl HostSession for MockSession {
    fn register_client(&self, client: Arc<dyn ClientEvents>) {
        self.state().client = Some(client);
    }

    fn deregister_client(&self) {
        self.state().client = None;
    }

    fn list_device_addresses(
        &self,
        max: usize,
        filters: &[String],
    ) -> Result<Vec<u8>, HostError> {
        let mut state = self.state();
        state.take_failure(MockOp::List)?;
        Ok(state
            .attached
            .iter()
            .copied()
            .filter(|address| {
                let (vid, pid) = state.ids_of(*address);
                check_filter(vid, pid, filters)
            })
            .take(max)
            .collect())
    }

    fn open(&self, address: u8) -> Result<DeviceHandle, HostError> {
        self.with_triggers(MockOp::Open, |state| {
            state.calls.push(MockCall::Open(address));
            state.take_failure(MockOp::Open)?;
            if !state.attached.contains(&address) {
                return Err(HostError::NoDevice);
            }
            state.next_handle += 1;
            let handle = DeviceHandle(state.next_handle);
            state.open.insert(handle, address);
            Ok(handle)
        })
    }

    fn close(&self, handle: DeviceHandle) -> Result<(), HostError> {
        self.with_triggers(MockOp::Close, |state| {
            state.calls.push(MockCall::Close(handle));
            state.take_failure(MockOp::Close)?;
            if state.open.remove(&handle).is_none() {
                return Err(HostError::NotFound);
            }
            state.claimed.retain(|(h, _)| *h != handle);
            Ok(())
        })
    }

    fn device_info(&self, handle: DeviceHandle) -> Result<DeviceInfo, HostError> {
        self.with_triggers(MockOp::DeviceInfo, |state| {
            state.calls.push(MockCall::DeviceInfo(handle));
            state.take_failure(MockOp::DeviceInfo)?;
            let address = state.address_of(handle)?;
            let (vendor_id, product_id) = state.ids_of(address);
            Ok(DeviceInfo {
                address,
                vendor_id,
                product_id,
                speed: DeviceSpeed::Full,
                configuration_value: 1,
            })
        })
    }

    fn active_config_descriptor(&self, handle: DeviceHandle) -> Result<ConfigSummary, HostError> {
        self.with_triggers(MockOp::ConfigDescriptor, |state| {
            state.calls.push(MockCall::ConfigDescriptor(handle));
            state.take_failure(MockOp::ConfigDescriptor)?;
            state.address_of(handle)?;
            Ok(ConfigSummary {
                configuration_value: 1,
                max_power_ma: 100,
                interfaces: vec![
                    (0, 0x01, 0x01, vec![]),
                    (
                        3,
                        0x01,
                        0x03,
                        vec![
                            EndpointSummary {
                                address: 0x02,
                                max_packet_size: 64,
                            },
                            EndpointSummary {
                                address: 0x82,
                                max_packet_size: 64,
                            },
                        ],
                    ),
                ],
            })
        })
    }

    fn claim_interface(&self, handle: DeviceHandle, interface: u8) -> Result<(), HostError> {
        self.with_triggers(MockOp::Claim, |state| {
            state.calls.push(MockCall::Claim(handle, interface));
            state.take_failure(MockOp::Claim)?;
            state.address_of(handle)?;
            if state.claimed.contains(&(handle, interface)) {
                return Err(HostError::Busy);
            }
            state.claimed.push((handle, interface));
            Ok(())
        })
    }

    fn release_interface(&self, handle: DeviceHandle, interface: u8) -> Result<(), HostError> {
        self.with_triggers(MockOp::Release, |state| {
            state.calls.push(MockCall::Release(handle, interface));
            state.take_failure(MockOp::Release)?;
            let before = state.claimed.len();
            state.claimed.retain(|c| *c != (handle, interface));
            if state.claimed.len() == before {
                return Err(HostError::NotFound);
            }
            Ok(())
        })
    }

    fn alloc_transfer(&self, request: TransferRequest) -> Result<TransferId, HostError> {
        self.with_triggers(MockOp::Alloc, |state| {
            state.take_failure(MockOp::Alloc)?;
            if !state.open.contains_key(&request.device) {
                return Err(HostError::NotFound);
            }
            state.next_transfer += 1;
            let id = TransferId(state.next_transfer);
            state.transfers.insert(
                id,
                MockTransfer {
                    request,
                    armed: false,
                },
            );
            state.calls.push(MockCall::Alloc(id));
            Ok(id)
        })
    }

    fn submit(&self, transfer: TransferId) -> Result<(), HostError> {
        self.with_triggers(MockOp::Submit, |state| {
            state.calls.push(MockCall::Submit(transfer));
            state.take_failure(MockOp::Submit)?;
            let device = state
                .transfers
                .get(&transfer)
                .ok_or(HostError::NotFound)?
                .request
                .device;
            state.address_of(device)?;

            let entry = state
                .transfers
                .get_mut(&transfer)
                .ok_or(HostError::NotFound)?;
            if entry.armed {
                return Err(HostError::Busy);
            }
            entry.armed = true;
            state.submit_count += 1;
            Ok(())
        })
    }

    fn free(&self, transfer: TransferId) {
        let mut state = self.state();
        state.calls.push(MockCall::Free(transfer));
        if state.transfers.remove(&transfer).is_some() {
            state.free_count += 1;
        }
        state
            .queued_completions
            .retain(|(id, _, _)| *id != transfer);
    }

    fn pump_events(&self, _timeout: Duration) -> Result<(), HostError> {
        let (client, completions, gone) = {
            let mut state = self.state();
            state.take_failure(MockOp::Pump)?;
            (
                state.client.clone(),
                std::mem::take(&mut state.queued_completions),
                std::mem::take(&mut state.queued_gone),
            )
        };

        if let Some(client) = client.as_ref() {
            for (transfer, context, status) in completions {
                client.transfer_completed(Completion {
                    transfer,
                    context,
                    status,
                    data: &[],
                });
            }
        }
        self.notify_gone(client, gone);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::session::TransferKind;

    #[derive(Default)]
    struct Recorder {
        gone: Mutex<Vec<DeviceHandle>>,
        completions: Mutex<Vec<(TransferId, TransferStatus, Vec<u8>)>>,
    }

    impl ClientEvents for Recorder {
        fn device_gone(&self, handle: DeviceHandle) {
            self.gone.lock().unwrap().push(handle);
        }

        fn transfer_completed(&self, completion: Completion<'_>) {
            self.completions.lock().unwrap().push((
                completion.transfer,
                completion.status,
                completion.data.to_vec(),
            ));
        }
    }

    fn request(device: DeviceHandle) -> TransferRequest {
        TransferRequest {
            device,
            endpoint: 0x82,
            kind: TransferKind::Bulk,
            length: 64,
            context: SlotId(0),
        }
    }

    #[test]
    fn test_open_requires_attached_device() {
        let session = MockSession::with_devices(&[5]);
        assert!(session.open(5).is_ok());
        assert_eq!(session.open(6), Err(HostError::NoDevice));
    }

    #[test]
    fn test_fail_next_is_consumed_once() {
        let session = MockSession::with_devices(&[5]);
        session.fail_next(MockOp::Open, HostError::Access);
        assert_eq!(session.open(5), Err(HostError::Access));
        assert!(session.open(5).is_ok());
    }

    #[test]
    fn test_completion_is_single_flight() {
        let session = MockSession::with_devices(&[5]);
        let recorder = Arc::new(Recorder::default());
        session.register_client(recorder.clone());

        let handle = session.open(5).unwrap();
        let transfer = session.alloc_transfer(request(handle)).unwrap();

        assert!(!session.complete(transfer, TransferStatus::Completed, &[]));
        session.submit(transfer).unwrap();
        assert_eq!(session.submit(transfer), Err(HostError::Busy));

        assert!(session.complete(transfer, TransferStatus::Completed, &[1, 2, 3, 4]));
        assert!(!session.complete(transfer, TransferStatus::Completed, &[]));
        assert_eq!(recorder.completions.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_detach_queues_notifications_until_pump() {
        let session = MockSession::with_devices(&[5]);
        let recorder = Arc::new(Recorder::default());
        session.register_client(recorder.clone());

        let handle = session.open(5).unwrap();
        let transfer = session.alloc_transfer(request(handle)).unwrap();
        session.submit(transfer).unwrap();

        session.detach(5);
        assert!(recorder.gone.lock().unwrap().is_empty());

        session.pump_events(Duration::ZERO).unwrap();
        assert_eq!(*recorder.gone.lock().unwrap(), vec![handle]);
        let completions = recorder.completions.lock().unwrap();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].1, TransferStatus::NoDevice);
    }

    #[test]
    fn test_free_drops_queued_completion() {
        let session = MockSession::with_devices(&[5]);
        let recorder = Arc::new(Recorder::default());
        session.register_client(recorder.clone());

        let handle = session.open(5).unwrap();
        let transfer = session.alloc_transfer(request(handle)).unwrap();
        session.submit(transfer).unwrap();
        session.detach(5);
        session.free(transfer);

        session.pump_events(Duration::ZERO).unwrap();
        assert!(recorder.completions.lock().unwrap().is_empty());
        assert_eq!(session.free_count(), 1);
    }

    #[test]
    fn test_detach_on_fires_after_call() {
        let session = MockSession::with_devices(&[5]);
        let recorder = Arc::new(Recorder::default());
        session.register_client(recorder.clone());

        let handle = session.open(5).unwrap();
        session.detach_on(MockOp::DeviceInfo, 5);

        assert!(session.device_info(handle).is_ok());
        assert_eq!(*recorder.gone.lock().unwrap(), vec![handle]);
        assert_eq!(session.device_info(handle), Err(HostError::NoDevice));
    }

    #[test]
    fn test_list_respects_max() {
        let session = MockSession::with_devices(&[1, 2, 3]);
        assert_eq!(session.list_device_addresses(2, &[]).unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_list_applies_filters() {
        let session = MockSession::with_devices(&[1, 3]);
        session.attach_device(2, 0x046d, 0x0825);
        let yamaha = vec!["0x0499:*".to_string()];

        assert_eq!(session.list_device_addresses(8, &yamaha).unwrap(), vec![1, 3]);
        assert_eq!(session.list_device_addresses(8, &[]).unwrap(), vec![1, 3, 2]);

        let handle = session.open(2).unwrap();
        let info = session.device_info(handle).unwrap();
        assert_eq!((info.vendor_id, info.product_id), (0x046d, 0x0825));
    }
}
