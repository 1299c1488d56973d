pub mod net;

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use thiserror::Error;
use tracing::warn;
use vmm_sys_util::eventfd::EventFd;

/// Offset of the queue notify register within a virtio MMIO slot.
pub const VIRTIO_MMIO_QUEUE_NOTIFY_OFFSET: u64 = 0x50;

/// "Used buffer notification" bit of the interrupt status register.
pub const VIRTIO_MMIO_INT_VRING: u8 = 0x01;

#[derive(Debug, Error)]
pub enum VirtioError {
    #[error("i/o error")]
    Io(#[source] io::Error),
    #[error("kvm ioctl failed")]
    Kvm(#[source] kvm_ioctls::Error),
    #[error("failed to register the device irqfd")]
    RegisterIrqfd(#[source] kvm_ioctls::Error),
    #[error("tap device error")]
    Tap(#[source] io::Error),
    #[error("guest memory access failed")]
    GuestMemory(#[source] vm_memory::GuestMemoryError),
    #[error("virtio queue error")]
    Queue(#[from] virtio_queue::Error),
    #[error("descriptor chain does not fit in the frame buffer")]
    FrameTooLarge,
    #[error("failed to hand the queue handler to the event loop")]
    Endpoint(event_manager::Error),
}

/// How a device tells the driver that used descriptors are available.
pub trait SignalUsedQueue {
    fn signal_used_queue(&self, index: u16);
}

/// Single-irqfd signalling: every queue shares one interrupt line, which is
/// all the MMIO transport supports without MSI.
pub struct SingleFdSignalQueue {
    pub irqfd: Arc<EventFd>,
    pub interrupt_status: Arc<AtomicU8>,
}

impl SignalUsedQueue for SingleFdSignalQueue {
    fn signal_used_queue(&self, _index: u16) {
        self.interrupt_status
            .fetch_or(VIRTIO_MMIO_INT_VRING, Ordering::SeqCst);
        if let Err(e) = self.irqfd.write(1) {
            warn!(error = %e, "failed to signal the used queue");
        }
    }
}
