//! libusb host session
//!
//! [`HostSession`] over `rusb`. libusb has no notion of a resubmittable
//! transfer object in its safe API, so each allocated streaming transfer is
//! backed by a reader thread: a submission wakes the thread, which performs
//! short-timeout bulk or interrupt reads until one finishes and then hands
//! the result to the registered client from that thread.
//!
//! Device removal is reported through libusb hotplug callbacks, which fire
//! inside `pump_events`. Platforms without hotplug support fall back to
//! diffing the open handles against the bus on every pump.

use crate::config::check_filter;
use crate::usb::session::{
    ClientEvents, Completion, DeviceHandle, HostError, HostSession, TransferId, TransferKind,
    TransferRequest, TransferStatus,
};
use protocol::{ConfigSummary, DeviceInfo, DeviceSpeed, EndpointSummary};
use rusb::{Context, Device, Hotplug, HotplugBuilder, Registration, UsbContext};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Read timeout inside a submission; bounds how long `free` waits
const READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Pause after a failed read before reporting it, so a broken endpoint
/// cannot spin the reader
const ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Vendor id of the Linux Foundation root hubs
const ROOT_HUB_VENDOR: u16 = 0x1d6b;

/// bDeviceClass of hubs
const HUB_CLASS: u8 = 0x09;

impl From<rusb::Error> for HostError {
    fn from(err: rusb::Error) -> Self {
        match err {
            rusb::Error::Timeout => HostError::Timeout,
            rusb::Error::Pipe => HostError::Pipe,
            rusb::Error::NoDevice => HostError::NoDevice,
            rusb::Error::NotFound => HostError::NotFound,
            rusb::Error::Busy => HostError::Busy,
            rusb::Error::Io => HostError::Io,
            rusb::Error::InvalidParam => HostError::InvalidParam,
            rusb::Error::Access => HostError::Access,
            rusb::Error::NoMem => HostError::NoMem,
            rusb::Error::NotSupported => HostError::NotSupported,
            rusb::Error::Interrupted => HostError::Interrupted,
            _ => HostError::Other(err.to_string()),
        }
    }
}

/// Map rusb device speed to protocol DeviceSpeed
fn map_device_speed(speed: rusb::Speed) -> DeviceSpeed {
    match speed {
        rusb::Speed::Low => DeviceSpeed::Low,
        rusb::Speed::Full => DeviceSpeed::Full,
        rusb::Speed::High => DeviceSpeed::High,
        rusb::Speed::Super => DeviceSpeed::Super,
        rusb::Speed::SuperPlus => DeviceSpeed::SuperPlus,
        _ => DeviceSpeed::Unknown,
    }
}

/// Terminal status of a read that did not time out
fn read_status(err: rusb::Error) -> TransferStatus {
    match err {
        rusb::Error::NoDevice => TransferStatus::NoDevice,
        rusb::Error::Pipe => TransferStatus::Stall,
        rusb::Error::Overflow => TransferStatus::Overflow,
        _ => TransferStatus::Error,
    }
}

fn is_root_hub<T: UsbContext>(device: &Device<T>) -> bool {
    match device.device_descriptor() {
        Ok(desc) => {
            desc.vendor_id() == ROOT_HUB_VENDOR
                || (desc.class_code() == HUB_CLASS && device.port_number() == 0)
        }
        Err(_) => false,
    }
}

struct OpenDevice {
    bus: u8,
    address: u8,
    handle: Arc<rusb::DeviceHandle<Context>>,
    /// Interfaces whose kernel driver we detached
    detached: Vec<u8>,
}

struct Reader {
    device: DeviceHandle,
    submit_tx: mpsc::Sender<()>,
    cancel: Arc<AtomicBool>,
    armed: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Reader {
    /// Stop the thread and wait for it, unless called from the thread itself
    fn stop(mut self) {
        self.cancel.store(true, Ordering::Release);
        drop(self.submit_tx);
        if let Some(thread) = self.thread.take()
            && thread.thread().id() != thread::current().id()
            && thread.join().is_err()
        {
            warn!("Transfer reader for {} panicked", self.device);
        }
    }
}

#[derive(Default)]
struct Inner {
    client: Option<Arc<dyn ClientEvents>>,
    devices: HashMap<DeviceHandle, OpenDevice>,
    readers: HashMap<TransferId, Reader>,
    /// Handles already reported gone by the polling fallback
    reported_gone: HashSet<DeviceHandle>,
    next_handle: u32,
    next_transfer: u32,
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Hot-plug callback handler
///
/// Maps a departed libusb device back to the handles opened on it and
/// forwards the removal to the registered client.
struct HotplugCallback {
    inner: Weak<Mutex<Inner>>,
}

impl<T: UsbContext> Hotplug<T> for HotplugCallback {
    fn device_arrived(&mut self, device: Device<T>) {
        debug!(
            "Hot-plug callback: device arrived (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
    }

    fn device_left(&mut self, device: Device<T>) {
        let (bus, address) = (device.bus_number(), device.address());
        debug!("Hot-plug callback: device left (bus={}, addr={})", bus, address);

        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let (client, gone) = {
            let inner = lock(&inner);
            let gone: Vec<DeviceHandle> = inner
                .devices
                .iter()
                .filter(|(_, d)| d.bus == bus && d.address == address)
                .map(|(h, _)| *h)
                .collect();
            (inner.client.clone(), gone)
        };

        if let Some(client) = client {
            for handle in gone {
                client.device_gone(handle);
            }
        }
    }
}

/// Host session backed by libusb
pub struct RusbSession {
    context: Context,
    /// Only devices on this bus are listed (None = all buses)
    bus: Option<u8>,
    inner: Arc<Mutex<Inner>>,
    hotplug: Mutex<Option<Registration<Context>>>,
}

impl RusbSession {
    pub fn new(bus: Option<u8>) -> Result<Self, HostError> {
        let context = Context::new()?;
        let inner = Arc::new(Mutex::new(Inner::default()));

        let hotplug = if rusb::has_hotplug() {
            let callback = HotplugCallback {
                inner: Arc::downgrade(&inner),
            };
            let registration = HotplugBuilder::new()
                .enumerate(false)
                .register(&context, Box::new(callback))?;
            debug!("Hot-plug callbacks registered");
            Some(registration)
        } else {
            info!("libusb has no hot-plug support, polling for removals");
            None
        };

        Ok(Self {
            context,
            bus,
            inner,
            hotplug: Mutex::new(hotplug),
        })
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        lock(&self.inner)
    }

    fn has_hotplug(&self) -> bool {
        self.hotplug
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Devices visible through the bus filter, root hubs excluded
    fn bus_devices(&self) -> Result<Vec<Device<Context>>, HostError> {
        let devices = self.context.devices()?;
        Ok(devices
            .iter()
            .filter(|d| self.bus.is_none_or(|bus| d.bus_number() == bus))
            .filter(|d| !is_root_hub(d))
            .collect())
    }

    fn handle(&self, handle: DeviceHandle) -> Result<Arc<rusb::DeviceHandle<Context>>, HostError> {
        self.inner()
            .devices
            .get(&handle)
            .map(|d| d.handle.clone())
            .ok_or(HostError::NotFound)
    }

    /// Describe every device on the bus, for listing
    pub fn enumerate(&self) -> Result<Vec<(u8, DeviceInfo)>, HostError> {
        let mut list = Vec::new();
        for device in self.bus_devices()? {
            let desc = match device.device_descriptor() {
                Ok(desc) => desc,
                Err(e) => {
                    warn!("Failed to read device descriptor: {}", e);
                    continue;
                }
            };
            let configuration_value = device
                .active_config_descriptor()
                .map(|c| c.number())
                .unwrap_or(0);
            list.push((
                device.bus_number(),
                DeviceInfo {
                    address: device.address(),
                    vendor_id: desc.vendor_id(),
                    product_id: desc.product_id(),
                    speed: map_device_speed(device.speed()),
                    configuration_value,
                },
            ));
        }
        Ok(list)
    }

    /// Report open handles whose device is no longer on the bus
    fn poll_removals(&self) -> Result<(), HostError> {
        let present: HashSet<(u8, u8)> = self
            .bus_devices()?
            .iter()
            .map(|d| (d.bus_number(), d.address()))
            .collect();

        let (client, gone) = {
            let mut inner = self.inner();
            let gone: Vec<DeviceHandle> = inner
                .devices
                .iter()
                .filter(|(_, d)| !present.contains(&(d.bus, d.address)))
                .map(|(h, _)| *h)
                .filter(|h| !inner.reported_gone.contains(h))
                .collect();
            inner.reported_gone.extend(gone.iter().copied());
            (inner.client.clone(), gone)
        };

        if let Some(client) = client {
            for handle in gone {
                debug!("{} no longer on the bus", handle);
                client.device_gone(handle);
            }
        }
        Ok(())
    }
}

impl Drop for RusbSession {
    fn drop(&mut self) {
        let readers: Vec<Reader> = self.inner().readers.drain().map(|(_, r)| r).collect();
        for reader in readers {
            reader.stop();
        }
    }
}

impl HostSession for RusbSession {
    fn register_client(&self, client: Arc<dyn ClientEvents>) {
        self.inner().client = Some(client);
    }

    fn deregister_client(&self) {
        self.inner().client = None;
    }

    fn list_device_addresses(
        &self,
        max: usize,
        filters: &[String],
    ) -> Result<Vec<u8>, HostError> {
        let mut addresses = Vec::new();
        for device in self.bus_devices()? {
            let address = device.address();
            let allowed = device
                .device_descriptor()
                .is_ok_and(|desc| check_filter(desc.vendor_id(), desc.product_id(), filters));
            if !allowed {
                trace!("Address {} filtered out", address);
                continue;
            }
            if addresses.contains(&address) {
                debug!(
                    "Address {} seen on more than one bus; set profile.bus to pick one",
                    address
                );
                continue;
            }
            addresses.push(address);
            if addresses.len() == max {
                break;
            }
        }
        Ok(addresses)
    }

    fn open(&self, address: u8) -> Result<DeviceHandle, HostError> {
        let device = self
            .bus_devices()?
            .into_iter()
            .find(|d| d.address() == address)
            .ok_or(HostError::NoDevice)?;

        let bus = device.bus_number();
        let handle = device.open()?;
        debug!("Opened device at bus {} address {}", bus, address);

        let mut inner = self.inner();
        inner.next_handle += 1;
        let id = DeviceHandle(inner.next_handle);
        inner.devices.insert(
            id,
            OpenDevice {
                bus,
                address,
                handle: Arc::new(handle),
                detached: Vec::new(),
            },
        );
        Ok(id)
    }

    fn close(&self, handle: DeviceHandle) -> Result<(), HostError> {
        let device = {
            let mut inner = self.inner();
            inner.reported_gone.remove(&handle);
            inner.devices.remove(&handle).ok_or(HostError::NotFound)?
        };

        // Reattach kernel drivers to restore the device to kernel control
        for interface in &device.detached {
            if let Err(e) = device.handle.attach_kernel_driver(*interface) {
                debug!(
                    "Could not reattach kernel driver to interface {}: {}",
                    interface, e
                );
            }
        }
        debug!("Closed {} (address {})", handle, device.address);
        Ok(())
    }

    fn device_info(&self, handle: DeviceHandle) -> Result<DeviceInfo, HostError> {
        let usb = self.handle(handle)?;
        let device = usb.device();
        let desc = device.device_descriptor()?;
        let configuration_value = usb.active_configuration()?;

        Ok(DeviceInfo {
            address: device.address(),
            vendor_id: desc.vendor_id(),
            product_id: desc.product_id(),
            speed: map_device_speed(device.speed()),
            configuration_value,
        })
    }

    fn active_config_descriptor(&self, handle: DeviceHandle) -> Result<ConfigSummary, HostError> {
        let usb = self.handle(handle)?;
        let config = usb.device().active_config_descriptor()?;

        let interfaces = config
            .interfaces()
            .filter_map(|interface| interface.descriptors().next())
            .map(|desc| {
                let endpoints = desc
                    .endpoint_descriptors()
                    .map(|ep| EndpointSummary {
                        address: ep.address(),
                        max_packet_size: ep.max_packet_size(),
                    })
                    .collect();
                (
                    desc.interface_number(),
                    desc.class_code(),
                    desc.sub_class_code(),
                    endpoints,
                )
            })
            .collect();

        Ok(ConfigSummary {
            configuration_value: config.number(),
            max_power_ma: config.max_power(),
            interfaces,
        })
    }

    fn claim_interface(&self, handle: DeviceHandle, interface: u8) -> Result<(), HostError> {
        let usb = self.handle(handle)?;

        let mut detached = false;
        match usb.kernel_driver_active(interface) {
            Ok(true) => {
                debug!("Detaching kernel driver from interface {}", interface);
                match usb.detach_kernel_driver(interface) {
                    Ok(()) => detached = true,
                    Err(e) => warn!(
                        "Failed to detach kernel driver from interface {}: {}",
                        interface, e
                    ),
                }
            }
            Ok(false) => {}
            Err(e) => debug!(
                "Could not check kernel driver status for interface {}: {}",
                interface, e
            ),
        }

        if detached && let Some(device) = self.inner().devices.get_mut(&handle) {
            device.detached.push(interface);
        }

        usb.claim_interface(interface)?;
        debug!("Claimed interface {} on {}", interface, handle);
        Ok(())
    }

    fn release_interface(&self, handle: DeviceHandle, interface: u8) -> Result<(), HostError> {
        let usb = self.handle(handle)?;
        usb.release_interface(interface)?;
        debug!("Released interface {} on {}", interface, handle);
        Ok(())
    }

    fn alloc_transfer(&self, request: TransferRequest) -> Result<TransferId, HostError> {
        let usb = self.handle(request.device)?;

        let mut inner = self.inner();
        inner.next_transfer += 1;
        let id = TransferId(inner.next_transfer);

        let (submit_tx, submit_rx) = mpsc::channel();
        let cancel = Arc::new(AtomicBool::new(false));
        let armed = Arc::new(AtomicBool::new(false));
        let reader = ReaderThread {
            id,
            request,
            usb,
            submit_rx,
            cancel: cancel.clone(),
            armed: armed.clone(),
            inner: Arc::downgrade(&self.inner),
        };

        let thread = thread::Builder::new()
            .name(format!("usb-{}", id))
            .spawn(move || reader.run())
            .map_err(|e| HostError::Other(format!("Failed to spawn transfer reader: {}", e)))?;

        inner.readers.insert(
            id,
            Reader {
                device: request.device,
                submit_tx,
                cancel,
                armed,
                thread: Some(thread),
            },
        );
        debug!(
            "Allocated {} ({:?} endpoint {:#04x}, {} bytes)",
            id, request.kind, request.endpoint, request.length
        );
        Ok(id)
    }

    fn submit(&self, transfer: TransferId) -> Result<(), HostError> {
        let inner = self.inner();
        let reader = inner.readers.get(&transfer).ok_or(HostError::NotFound)?;
        if inner.reported_gone.contains(&reader.device) {
            return Err(HostError::NoDevice);
        }
        if reader.armed.swap(true, Ordering::AcqRel) {
            return Err(HostError::Busy);
        }
        if reader.submit_tx.send(()).is_err() {
            reader.armed.store(false, Ordering::Release);
            return Err(HostError::Other(format!("{} reader has stopped", transfer)));
        }
        Ok(())
    }

    fn free(&self, transfer: TransferId) {
        let reader = self.inner().readers.remove(&transfer);
        if let Some(reader) = reader {
            reader.stop();
            debug!("Freed {}", transfer);
        }
    }

    fn pump_events(&self, timeout: Duration) -> Result<(), HostError> {
        self.context.handle_events(Some(timeout))?;
        if !self.has_hotplug() {
            self.poll_removals()?;
        }
        Ok(())
    }
}

/// Body of a transfer's reader thread
struct ReaderThread {
    id: TransferId,
    request: TransferRequest,
    usb: Arc<rusb::DeviceHandle<Context>>,
    submit_rx: mpsc::Receiver<()>,
    cancel: Arc<AtomicBool>,
    armed: Arc<AtomicBool>,
    inner: Weak<Mutex<Inner>>,
}

impl ReaderThread {
    fn run(self) {
        let mut buf = vec![0u8; self.request.length];

        while self.submit_rx.recv().is_ok() {
            let Some((status, len)) = self.read_once(&mut buf) else {
                break;
            };
            self.armed.store(false, Ordering::Release);

            if self.cancel.load(Ordering::Acquire) {
                break;
            }

            let client = self
                .inner
                .upgrade()
                .and_then(|inner| lock(&inner).client.clone());
            if let Some(client) = client {
                client.transfer_completed(Completion {
                    transfer: self.id,
                    context: self.request.context,
                    status,
                    data: &buf[..len],
                });
            }
        }
        trace!("{} reader exiting", self.id);
    }

    /// Read until something other than a timeout happens; None if cancelled
    fn read_once(&self, buf: &mut [u8]) -> Option<(TransferStatus, usize)> {
        let endpoint = self.request.endpoint;
        loop {
            if self.cancel.load(Ordering::Acquire) {
                return None;
            }

            let result = match self.request.kind {
                TransferKind::Bulk => self.usb.read_bulk(endpoint, buf, READ_TIMEOUT),
                TransferKind::Interrupt => self.usb.read_interrupt(endpoint, buf, READ_TIMEOUT),
            };

            match result {
                Ok(len) => return Some((TransferStatus::Completed, len)),
                Err(rusb::Error::Timeout) => continue,
                Err(e) => {
                    let status = read_status(e);
                    if status == TransferStatus::Stall
                        && let Err(e) = self.usb.clear_halt(endpoint)
                    {
                        debug!("Failed to clear halt on {:#04x}: {}", endpoint, e);
                    }
                    if status != TransferStatus::NoDevice {
                        thread::sleep(ERROR_BACKOFF);
                    }
                    return Some((status, 0));
                }
            }
        }
    }
}
