use std::borrow::{Borrow, BorrowMut};
use std::convert::{TryFrom, TryInto};
use std::sync::{Arc, Mutex};

use event_manager::{MutEventSubscriber, RemoteEndpoint, SubscriberId};
use kvm_ioctls::{IoEventAddress, VmFd};
use libc::EFD_NONBLOCK;
use tracing::debug;
use virtio_device::{VirtioConfig, VirtioDeviceActions, VirtioDeviceType, VirtioMmioDevice};
use virtio_queue::Queue;
use vm_allocator::RangeInclusive;
use vm_device::MutDeviceMmio;
use vm_device::bus::MmioAddress;
use vm_memory::{GuestMemoryMmap, GuestUsize};
use vmm_sys_util::eventfd::EventFd;

use super::VIRTIO_NET_HDR_SIZE;
use super::queue_handler::QueueHandler;
use super::simple_handler::SimpleHandler;
use super::tap::Tap;
use crate::devices::virtio::{
    SingleFdSignalQueue, VIRTIO_MMIO_QUEUE_NOTIFY_OFFSET, VirtioError,
};

pub const VIRTIO_F_RING_EVENT_IDX: u64 = 29;
pub const VIRTIO_F_VERSION_1: u64 = 32;
pub const VIRTIO_F_IN_ORDER: u64 = 35;

pub const VIRTIO_NET_F_CSUM: u64 = 0;
pub const VIRTIO_NET_F_GUEST_CSUM: u64 = 1;
pub const VIRTIO_NET_F_GUEST_TSO4: u64 = 7;
pub const VIRTIO_NET_F_GUEST_TSO6: u64 = 8;
pub const VIRTIO_NET_F_GUEST_UFO: u64 = 10;
pub const VIRTIO_NET_F_HOST_TSO4: u64 = 11;
pub const VIRTIO_NET_F_HOST_TSO6: u64 = 12;
pub const VIRTIO_NET_F_HOST_UFO: u64 = 14;

pub const VIRTIO_NET_DEVICE_FEATURES: u64 = (1 << VIRTIO_F_VERSION_1)
    | (1 << VIRTIO_F_RING_EVENT_IDX)
    | (1 << VIRTIO_F_IN_ORDER)
    | (1 << VIRTIO_NET_F_CSUM)
    | (1 << VIRTIO_NET_F_GUEST_CSUM)
    | (1 << VIRTIO_NET_F_GUEST_TSO4)
    | (1 << VIRTIO_NET_F_GUEST_TSO6)
    | (1 << VIRTIO_NET_F_GUEST_UFO)
    | (1 << VIRTIO_NET_F_HOST_TSO4)
    | (1 << VIRTIO_NET_F_HOST_TSO6)
    | (1 << VIRTIO_NET_F_HOST_UFO);

pub const VIRTIO_NET_QUEUE_SIZE: u16 = 256;

// TUN offload flags from linux/if_tun.h, mirroring the feature bits above.
pub const TUN_F_CSUM: ::std::os::raw::c_uint = 1;
pub const TUN_F_TSO4: ::std::os::raw::c_uint = 2;
pub const TUN_F_TSO6: ::std::os::raw::c_uint = 4;
pub const TUN_F_UFO: ::std::os::raw::c_uint = 16;

const NET_DEVICE_ID: u32 = 1;

type Subscriber = Arc<Mutex<dyn MutEventSubscriber>>;
type NetVirtioConfig = VirtioConfig<Arc<GuestMemoryMmap>>;

/// virtio-net over MMIO, backed by a host TAP interface.
pub struct NetDevice {
    vm_fd: Arc<VmFd>,
    guest_memory: Arc<GuestMemoryMmap>,
    tap_name: String,
    /// Addresses where the device registers live in the guest.
    pub mmio_range: RangeInclusive,
    /// IRQ line the guest sees.
    irq: u32,
    /// Eventfd behind that IRQ line, registered as an irqfd.
    irqfd: Arc<EventFd>,
    virtio_cfg: NetVirtioConfig,
    /// Data-path handler; present once the driver activates the device.
    pub handler: Option<Arc<Mutex<QueueHandler<Arc<GuestMemoryMmap>>>>>,
    endpoint: RemoteEndpoint<Subscriber>,
}

impl NetDevice {
    pub fn new(
        vm_fd: Arc<VmFd>,
        irq: u32,
        tap_name: String,
        guest_memory: Arc<GuestMemoryMmap>,
        mmio_range: RangeInclusive,
        endpoint: RemoteEndpoint<Subscriber>,
    ) -> Result<Self, VirtioError> {
        let queues = vec![
            Queue::new(guest_memory.clone(), VIRTIO_NET_QUEUE_SIZE),
            Queue::new(guest_memory.clone(), VIRTIO_NET_QUEUE_SIZE),
        ];

        let irqfd = Arc::new(EventFd::new(EFD_NONBLOCK).map_err(VirtioError::Io)?);
        vm_fd
            .register_irqfd(&irqfd, irq)
            .map_err(VirtioError::RegisterIrqfd)?;

        let virtio_cfg = VirtioConfig::new(VIRTIO_NET_DEVICE_FEATURES, queues, Vec::new());

        Ok(NetDevice {
            vm_fd,
            guest_memory,
            irq,
            irqfd,
            tap_name,
            mmio_range,
            virtio_cfg,
            handler: None,
            endpoint,
        })
    }

    /// The `virtio_mmio.device=` fragment the kernel needs to discover this
    /// device on its command line.
    pub fn cmdline_string(&self) -> String {
        format!(
            "virtio_mmio.device={}@{:#x}:{}",
            size_suffix(self.mmio_range.len()),
            self.mmio_range.start(),
            self.irq
        )
    }

    fn setup_tap(&mut self) -> Result<Tap, VirtioError> {
        let tap = Tap::open_named(self.tap_name.as_str()).map_err(VirtioError::Tap)?;

        // Offloads must match the features negotiated with the driver.
        tap.set_offload(TUN_F_CSUM | TUN_F_UFO | TUN_F_TSO4 | TUN_F_TSO6)
            .map_err(VirtioError::Tap)?;

        tap.set_vnet_hdr_size(VIRTIO_NET_HDR_SIZE as i32)
            .map_err(VirtioError::Tap)?;

        Ok(tap)
    }

    fn setup_handler(
        &mut self,
        tap: Tap,
        queue_eventfds: [EventFd; 2],
    ) -> QueueHandler<Arc<GuestMemoryMmap>> {
        let driver_notify = SingleFdSignalQueue {
            irqfd: self.irqfd.clone(),
            interrupt_status: self.virtio_cfg.interrupt_status.clone(),
        };

        let [rx_ioevent, tx_ioevent] = queue_eventfds;

        let rxq = self.virtio_cfg.queues.remove(0);
        let txq = self.virtio_cfg.queues.remove(0);
        let inner = SimpleHandler::new(driver_notify, rxq, txq, tap);

        QueueHandler {
            inner,
            rx_ioevent,
            tx_ioevent,
        }
    }

    fn register_handler(
        &mut self,
        handler: Arc<Mutex<QueueHandler<Arc<GuestMemoryMmap>>>>,
    ) -> Result<(), VirtioError> {
        self.endpoint
            .call_blocking(|mgr| -> event_manager::Result<SubscriberId> {
                Ok(mgr.add_subscriber(handler))
            })
            .map_err(VirtioError::Endpoint)?;
        Ok(())
    }

    fn register_queue_events(&self) -> Result<Vec<EventFd>, VirtioError> {
        let mut ioevents = Vec::new();

        for i in 0..self.virtio_cfg.queues.len() {
            let fd = EventFd::new(EFD_NONBLOCK).map_err(VirtioError::Io)?;

            self.vm_fd
                .register_ioevent(
                    &fd,
                    &IoEventAddress::Mmio(
                        self.mmio_range.start() + VIRTIO_MMIO_QUEUE_NOTIFY_OFFSET,
                    ),
                    // The queue count fits in a u16 per the standard.
                    u32::try_from(i).unwrap(),
                )
                .map_err(VirtioError::Kvm)?;

            ioevents.push(fd);
        }

        Ok(ioevents)
    }
}

/// Concise `<n>[K|M|G]` rendering of an MMIO slot size, as the kernel's
/// `virtio_mmio.device=` parameter expects.
fn size_suffix(size: GuestUsize) -> String {
    const KB_MULT: u64 = 1 << 10;
    const MB_MULT: u64 = KB_MULT << 10;
    const GB_MULT: u64 = MB_MULT << 10;

    if size % GB_MULT == 0 {
        return format!("{}G", size / GB_MULT);
    }
    if size % MB_MULT == 0 {
        return format!("{}M", size / MB_MULT);
    }
    if size % KB_MULT == 0 {
        return format!("{}K", size / KB_MULT);
    }
    size.to_string()
}

impl VirtioDeviceType for NetDevice {
    fn device_type(&self) -> u32 {
        NET_DEVICE_ID
    }
}

impl Borrow<NetVirtioConfig> for NetDevice {
    fn borrow(&self) -> &NetVirtioConfig {
        &self.virtio_cfg
    }
}

impl BorrowMut<NetVirtioConfig> for NetDevice {
    fn borrow_mut(&mut self) -> &mut NetVirtioConfig {
        &mut self.virtio_cfg
    }
}

impl VirtioDeviceActions for NetDevice {
    type E = VirtioError;

    fn activate(&mut self) -> Result<(), VirtioError> {
        let tap = self.setup_tap()?;

        let queue_eventfds = self.register_queue_events()?;
        let handler = self.setup_handler(
            tap,
            queue_eventfds
                .try_into()
                .expect("net device always has two queues"),
        );
        let handler = Arc::new(Mutex::new(handler));
        self.handler = Some(handler.clone());

        self.register_handler(handler)
    }

    fn reset(&mut self) -> Result<(), VirtioError> {
        Ok(())
    }
}

impl VirtioMmioDevice<Arc<GuestMemoryMmap>> for NetDevice {
    fn queue_notify(&mut self, val: u32) {
        // Notifications arrive through the registered ioeventfds; a direct
        // MMIO exit landing here means the ioeventfd is not wired up.
        debug!(queue = val, "unexpected queue notify via MMIO exit");
    }
}

impl MutDeviceMmio for NetDevice {
    fn mmio_read(&mut self, _base: MmioAddress, offset: u64, data: &mut [u8]) {
        self.read(offset, data);
    }

    fn mmio_write(&mut self, _base: MmioAddress, offset: u64, data: &[u8]) {
        self.write(offset, data);
    }
}

#[cfg(test)]
mod tests {
    use super::size_suffix;

    #[test]
    fn size_suffix_picks_largest_exact_unit() {
        assert_eq!(size_suffix(0x1000), "4K");
        assert_eq!(size_suffix(2 << 20), "2M");
        assert_eq!(size_suffix(1 << 30), "1G");
    }

    #[test]
    fn size_suffix_falls_back_to_bytes() {
        assert_eq!(size_suffix(1000), "1000");
        assert_eq!(size_suffix(4097), "4097");
    }

    #[test]
    fn device_features_include_version_1() {
        assert_ne!(super::VIRTIO_NET_DEVICE_FEATURES & (1 << super::VIRTIO_F_VERSION_1), 0);
    }
}
