//! A small KVM-based virtual machine monitor for x86_64 Linux guests.
//!
//! The machine model is deliberately minimal: guest RAM, a 16550A serial
//! console wired to the caller's input/output, and an optional virtio-net
//! device bridged to a host TAP interface.

#![cfg(target_arch = "x86_64")]

use std::io;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use event_manager::{EventManager, MutEventSubscriber, SubscriberOps};
use kvm_bindings::{KVM_MAX_CPUID_ENTRIES, kvm_userspace_memory_region};
use kvm_ioctls::{Kvm, VmFd};
use thiserror::Error;
use tracing::{info, warn};
use vm_allocator::{AddressAllocator, AllocPolicy, RangeInclusive};
use vm_memory::{Address, GuestAddress, GuestMemory, GuestMemoryMmap, GuestMemoryRegion};

pub mod cpu;
pub mod devices;
mod irq;
mod kernel;

use cpu::Vcpu;
use devices::serial::SerialConsole;
use devices::stdin::StdinForwarder;
use devices::virtio::net::device::NetDevice;
use irq::IrqAllocator;

pub use devices::serial::TeeWriter;

/// End of the MMIO gap, at the 4 GiB boundary.
pub(crate) const MMIO_GAP_END: u64 = 1 << 32;
/// Size of the MMIO gap.
pub(crate) const MMIO_GAP_SIZE: u64 = 768 << 20;
/// Start of the memory area reserved for MMIO devices.
pub(crate) const MMIO_GAP_START: u64 = MMIO_GAP_END - MMIO_GAP_SIZE;

/// IRQ line of the serial console.
const SERIAL_IRQ: u32 = 4;
/// First IRQ line handed to MMIO devices.
const MMIO_IRQ_BASE: u32 = 5;

#[derive(Debug, Error)]
pub enum VmmError {
    #[error("failed to write boot data into guest memory")]
    BootConfigure(#[source] linux_loader::configurator::Error),
    #[error("invalid kernel command line")]
    Cmdline(#[source] linux_loader::cmdline::Error),
    #[error("failed to load the kernel image")]
    KernelLoad(#[source] linux_loader::loader::Error),
    #[error("the initramfs does not fit into guest memory")]
    InitramfsLoad,
    #[error("too many E820 entries")]
    E820Configuration,
    #[error("guest memory ends below the start of high memory")]
    HimemStartPastMemEnd,
    #[error("i/o error")]
    Io(#[source] io::Error),
    #[error("kvm ioctl failed")]
    KvmIoctl(#[source] kvm_ioctls::Error),
    #[error("vcpu setup failed")]
    Vcpu(#[source] cpu::CpuError),
    #[error("failed to set up guest memory")]
    Memory(#[source] vm_memory::Error),
    #[error("guest memory access failed")]
    GuestMemory(#[source] vm_memory::GuestMemoryError),
    #[error("failed to create the serial console")]
    SerialCreation(#[source] io::Error),
    #[error("failed to register an irqfd")]
    IrqRegister(#[source] io::Error),
    #[error("failed to create the event loop")]
    EventManager(event_manager::Error),
    #[error("mmio address allocation failed")]
    AddressAllocation(#[source] vm_allocator::Error),
    #[error("virtio-net device error")]
    VirtioNet(#[source] devices::virtio::VirtioError),
}

pub type Result<T> = std::result::Result<T, VmmError>;

/// Host-side source of guest console input.
pub trait GuestInput: io::Read + AsRawFd {}
impl<T: io::Read + AsRawFd> GuestInput for T {}

/// The virtual machine: KVM fds, guest memory, devices and vCPUs.
pub struct Vmm {
    vm_fd: Arc<VmFd>,
    kvm: Kvm,
    guest_memory: Arc<GuestMemoryMmap>,
    vcpus: Vec<Vcpu>,
    serial: Arc<Mutex<SerialConsole>>,
    net: Option<Arc<Mutex<NetDevice>>>,
    cmdline_extra: Vec<String>,
    event_manager: EventManager<Arc<Mutex<dyn MutEventSubscriber>>>,
    mmio_allocator: AddressAllocator,
    irq_allocator: IrqAllocator,
    running: Arc<AtomicBool>,
    vcpu_handles: Vec<thread::JoinHandle<()>>,
    vcpu_tids: Arc<Mutex<Vec<libc::pthread_t>>>,
}

impl Vmm {
    /// Create a stopped machine with `memory_size` bytes of guest RAM. The
    /// serial console reads from `input` and writes to `output`.
    pub fn new(
        input: Box<dyn GuestInput>,
        output: Box<dyn io::Write + Send>,
        memory_size: usize,
    ) -> Result<Self> {
        let kvm = Kvm::new().map_err(VmmError::KvmIoctl)?;
        let vm_fd = kvm.create_vm().map_err(VmmError::KvmIoctl)?;

        let mut event_manager: EventManager<Arc<Mutex<dyn MutEventSubscriber>>> =
            EventManager::new().map_err(VmmError::EventManager)?;

        let mmio_allocator =
            AddressAllocator::new(MMIO_GAP_START, 0x2000).map_err(VmmError::AddressAllocation)?;

        let guest_memory = Self::configure_memory(&vm_fd, memory_size)?;

        let serial = Arc::new(Mutex::new(
            SerialConsole::new(output).map_err(VmmError::SerialCreation)?,
        ));

        let stdin_forwarder: Arc<Mutex<dyn MutEventSubscriber>> =
            Arc::new(Mutex::new(StdinForwarder::new(input, serial.clone())));
        event_manager.add_subscriber(stdin_forwarder);

        let mut vmm = Vmm {
            vm_fd: Arc::new(vm_fd),
            kvm,
            guest_memory: Arc::new(guest_memory),
            vcpus: Vec::new(),
            serial,
            net: None,
            cmdline_extra: Vec::new(),
            event_manager,
            mmio_allocator,
            irq_allocator: IrqAllocator::new(MMIO_IRQ_BASE),
            running: Arc::new(AtomicBool::new(true)),
            vcpu_handles: Vec::new(),
            vcpu_tids: Arc::new(Mutex::new(Vec::new())),
        };

        vmm.configure_irqs()?;

        Ok(vmm)
    }

    fn configure_memory(vm_fd: &VmFd, memory_size: usize) -> Result<GuestMemoryMmap> {
        let guest_memory = GuestMemoryMmap::from_ranges(&[(GuestAddress(0), memory_size)])
            .map_err(VmmError::Memory)?;

        for (index, region) in guest_memory.iter().enumerate() {
            let kvm_memory_region = kvm_userspace_memory_region {
                slot: index as u32,
                guest_phys_addr: region.start_addr().raw_value(),
                memory_size: region.len(),
                // The region was just created from this mapping, so the
                // address lookup cannot fail.
                userspace_addr: guest_memory.get_host_address(region.start_addr()).unwrap()
                    as u64,
                flags: 0,
            };

            // Safe: the region points at owned, mapped memory that outlives
            // the VM fd.
            unsafe { vm_fd.set_user_memory_region(kvm_memory_region) }
                .map_err(VmmError::KvmIoctl)?;
        }

        Ok(guest_memory)
    }

    fn configure_irqs(&mut self) -> Result<()> {
        // The irqchip must exist before the vCPUs: it sets up the virtual
        // IOAPIC and PIC that the local APICs attach to.
        self.vm_fd.create_irq_chip().map_err(VmmError::KvmIoctl)?;

        self.vm_fd
            .register_irqfd(
                &self
                    .serial
                    .lock()
                    .unwrap()
                    .eventfd()
                    .map_err(VmmError::IrqRegister)?,
                SERIAL_IRQ,
            )
            .map_err(VmmError::KvmIoctl)?;

        Ok(())
    }

    /// Add a virtio-net device backed by the named host TAP interface.
    pub fn add_net_device(&mut self, tap_name: &str) -> Result<()> {
        let mmio_range: RangeInclusive = self
            .mmio_allocator
            .allocate(0x1000, 0x1000, AllocPolicy::FirstMatch)
            .map_err(VmmError::AddressAllocation)?;

        let irq = self.irq_allocator.allocate();
        let endpoint = self.event_manager.remote_endpoint();

        let net = NetDevice::new(
            self.vm_fd.clone(),
            irq,
            tap_name.to_string(),
            self.guest_memory.clone(),
            mmio_range,
            endpoint,
        )
        .map_err(VmmError::VirtioNet)?;

        self.cmdline_extra.push(net.cmdline_string());
        self.net = Some(Arc::new(Mutex::new(net)));

        Ok(())
    }

    /// Load the kernel (and initramfs, if any) and bring up `num_vcpus`
    /// configured processors.
    pub fn configure(
        &mut self,
        num_vcpus: u8,
        kernel_path: &Path,
        initramfs_path: Option<&Path>,
    ) -> Result<()> {
        let loaded = kernel::kernel_setup(
            &self.guest_memory,
            kernel_path,
            initramfs_path,
            &self.cmdline_extra,
        )?;

        cpu::setup_mptable(&self.guest_memory, num_vcpus)
            .map_err(|e| VmmError::Vcpu(cpu::CpuError::Mptable(e)))?;

        let base_cpuid = self
            .kvm
            .get_supported_cpuid(KVM_MAX_CPUID_ENTRIES)
            .map_err(VmmError::KvmIoctl)?;

        for index in 0..num_vcpus {
            let vcpu = Vcpu::new(
                &self.vm_fd,
                index.into(),
                Arc::clone(&self.serial),
                self.net.clone(),
                Arc::clone(&self.running),
            )
            .map_err(VmmError::Vcpu)?;

            let mut vcpu_cpuid = base_cpuid.clone();
            cpu::cpuid::filter_cpuid(index as usize, num_vcpus as usize, &mut vcpu_cpuid);
            vcpu.configure_cpuid(&vcpu_cpuid).map_err(VmmError::Vcpu)?;

            vcpu.configure_msrs().map_err(VmmError::Vcpu)?;
            vcpu.configure_regs(loaded.entry).map_err(VmmError::Vcpu)?;
            vcpu.configure_sregs(&self.guest_memory)
                .map_err(VmmError::Vcpu)?;
            vcpu.configure_fpu().map_err(VmmError::Vcpu)?;
            vcpu.configure_lapic().map_err(VmmError::Vcpu)?;

            self.vcpus.push(vcpu);
        }

        Ok(())
    }

    fn start_vcpus(&mut self) -> Result<()> {
        for mut vcpu in self.vcpus.drain(..) {
            info!(vcpu = vcpu.index, "starting vcpu");
            let running = Arc::clone(&self.running);
            let tids = Arc::clone(&self.vcpu_tids);
            let handle = thread::Builder::new()
                .name(format!("vcpu{}", vcpu.index))
                .spawn(move || {
                    tids.lock().unwrap().push(unsafe { libc::pthread_self() });

                    while running.load(Ordering::SeqCst) {
                        vcpu.run();
                    }
                })
                .map_err(VmmError::Io)?;
            self.vcpu_handles.push(handle);
        }
        Ok(())
    }

    /// Interrupt vCPU threads blocked in `KVM_RUN` and wait for them.
    fn join_vcpus(&mut self) {
        let tids = self.vcpu_tids.lock().unwrap();
        for &tid in tids.iter() {
            unsafe {
                libc::pthread_kill(tid, libc::SIGUSR1);
            }
        }
        drop(tids);

        for handle in self.vcpu_handles.drain(..) {
            let _ = handle.join();
        }
        self.vcpu_tids.lock().unwrap().clear();
    }

    /// Run the machine: start the vCPUs and drive the device event loop
    /// until the guest stops or [`Vmm::stop`] is called.
    pub fn run(&mut self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);

        // A no-op SIGUSR1 handler, so pthread_kill interrupts KVM_RUN with
        // EINTR instead of killing the process.
        unsafe {
            let mut sa: libc::sigaction = std::mem::zeroed();
            sa.sa_sigaction = empty_signal_handler as usize;
            sa.sa_flags = 0;
            libc::sigaction(libc::SIGUSR1, &sa, std::ptr::null_mut());
        }

        self.start_vcpus()?;

        let running = Arc::clone(&self.running);
        while running.load(Ordering::SeqCst) {
            if let Err(e) = self.event_manager.run_with_timeout(100) {
                warn!(error = ?e, "device event loop failed");
                self.running.store(false, Ordering::SeqCst);
            }
        }

        self.join_vcpus();
        Ok(())
    }

    /// Signal every loop to exit; `run` returns once they have.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// No-op handler installed for SIGUSR1, see [`Vmm::run`].
extern "C" fn empty_signal_handler(_: libc::c_int) {}
