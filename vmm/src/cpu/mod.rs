pub(crate) mod cpuid;
mod gdt;
pub(crate) mod mptable;

pub use mptable::MptableError;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use kvm_bindings::{
    CpuId, Msrs, kvm_fpu, kvm_lapic_state, kvm_msr_entry, kvm_regs, kvm_sregs,
};
use kvm_ioctls::{VcpuExit, VcpuFd, VmFd};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use vm_device::MutDeviceMmio;
use vm_device::bus::MmioAddress;
use vm_memory::{Address, Bytes, GuestAddress, GuestMemoryMmap};

use crate::devices::serial::{SERIAL_PORT_BASE, SERIAL_PORT_LAST, SerialConsole};
use crate::devices::virtio::net::device::NetDevice;
use gdt::{gdt_entry, kvm_segment_from_gdt};

pub(crate) use mptable::setup_mptable;

/// Address of the zero page, which also lands in `rsi` at boot.
pub(crate) const ZEROPG_START: u64 = 0x7000;

const BOOT_GDT_OFFSET: u64 = 0x500;
const BOOT_IDT_OFFSET: u64 = 0x520;
const BOOT_STACK_POINTER: u64 = 0x8ff0;

// Identity-mapped page tables covering the first GiB with 2 MiB pages.
const PML4_START: u64 = 0x9000;
const PDPTE_START: u64 = 0xa000;
const PDE_START: u64 = 0xb000;

const X86_CR0_PE: u64 = 0x1;
const X86_CR0_PG: u64 = 0x8000_0000;
const X86_CR4_PAE: u64 = 0x20;
const X86_EFER_LME: u64 = 0x100;
const X86_EFER_LMA: u64 = 0x400;

// MSRs initialized to zero before the kernel takes over.
const MSR_IA32_SYSENTER_CS: u32 = 0x174;
const MSR_IA32_SYSENTER_ESP: u32 = 0x175;
const MSR_IA32_SYSENTER_EIP: u32 = 0x176;
const MSR_IA32_TSC: u32 = 0x10;
const MSR_IA32_MISC_ENABLE: u32 = 0x1a0;
const MSR_STAR: u32 = 0xc000_0081;
const MSR_LSTAR: u32 = 0xc000_0082;
const MSR_CSTAR: u32 = 0xc000_0083;
const MSR_SYSCALL_MASK: u32 = 0xc000_0084;
const MSR_KERNEL_GS_BASE: u32 = 0xc000_0102;

const MSR_IA32_MISC_ENABLE_FAST_STRING: u64 = 0x1;

// Byte offsets of the LINT registers inside `kvm_lapic_state`.
const APIC_LVT0_OFFSET: usize = 0x350;
const APIC_LVT1_OFFSET: usize = 0x360;
const APIC_MODE_EXTINT: u32 = 0x7;
const APIC_MODE_NMI: u32 = 0x4;

#[derive(Debug, Error)]
pub enum CpuError {
    #[error("kvm ioctl failed")]
    KvmIoctl(#[source] kvm_ioctls::Error),
    #[error("failed to build the MP table")]
    Mptable(#[source] mptable::MptableError),
    #[error("guest memory access failed")]
    GuestMemory(#[source] vm_memory::GuestMemoryError),
    #[error("failed to build the boot MSR list")]
    BootMsrs(vmm_sys_util::fam::Error),
}

type Result<T> = std::result::Result<T, CpuError>;

/// One guest processor: the KVM vCPU fd plus the devices its exits touch.
pub struct Vcpu {
    vcpu_fd: VcpuFd,
    pub index: u64,
    serial: Arc<Mutex<SerialConsole>>,
    net: Option<Arc<Mutex<NetDevice>>>,
    running: Arc<AtomicBool>,
}

impl Vcpu {
    pub(crate) fn new(
        vm_fd: &VmFd,
        index: u64,
        serial: Arc<Mutex<SerialConsole>>,
        net: Option<Arc<Mutex<NetDevice>>>,
        running: Arc<AtomicBool>,
    ) -> Result<Self> {
        Ok(Vcpu {
            vcpu_fd: vm_fd.create_vcpu(index).map_err(CpuError::KvmIoctl)?,
            index,
            serial,
            net,
            running,
        })
    }

    pub(crate) fn configure_cpuid(&self, cpuid: &CpuId) -> Result<()> {
        self.vcpu_fd.set_cpuid2(cpuid).map_err(CpuError::KvmIoctl)
    }

    pub(crate) fn configure_msrs(&self) -> Result<()> {
        let entries = [
            kvm_msr_entry {
                index: MSR_IA32_SYSENTER_CS,
                ..Default::default()
            },
            kvm_msr_entry {
                index: MSR_IA32_SYSENTER_ESP,
                ..Default::default()
            },
            kvm_msr_entry {
                index: MSR_IA32_SYSENTER_EIP,
                ..Default::default()
            },
            kvm_msr_entry {
                index: MSR_STAR,
                ..Default::default()
            },
            kvm_msr_entry {
                index: MSR_CSTAR,
                ..Default::default()
            },
            kvm_msr_entry {
                index: MSR_KERNEL_GS_BASE,
                ..Default::default()
            },
            kvm_msr_entry {
                index: MSR_SYSCALL_MASK,
                ..Default::default()
            },
            kvm_msr_entry {
                index: MSR_LSTAR,
                ..Default::default()
            },
            kvm_msr_entry {
                index: MSR_IA32_TSC,
                ..Default::default()
            },
            kvm_msr_entry {
                index: MSR_IA32_MISC_ENABLE,
                data: MSR_IA32_MISC_ENABLE_FAST_STRING,
                ..Default::default()
            },
        ];
        let msrs = Msrs::from_entries(&entries).map_err(CpuError::BootMsrs)?;
        self.vcpu_fd
            .set_msrs(&msrs)
            .map_err(CpuError::KvmIoctl)
            .map(|_| ())
    }

    pub(crate) fn configure_regs(&self, entry_point: GuestAddress) -> Result<()> {
        let regs = kvm_regs {
            // Bit 1 of RFLAGS is always set.
            rflags: 0x0000_0000_0000_0002,
            rip: entry_point.raw_value(),
            rsp: BOOT_STACK_POINTER,
            rbp: BOOT_STACK_POINTER,
            // The boot protocol wants the zero page address in rsi.
            rsi: ZEROPG_START,
            ..Default::default()
        };
        self.vcpu_fd.set_regs(&regs).map_err(CpuError::KvmIoctl)
    }

    pub(crate) fn configure_sregs(&self, guest_memory: &GuestMemoryMmap) -> Result<()> {
        let mut sregs: kvm_sregs = self.vcpu_fd.get_sregs().map_err(CpuError::KvmIoctl)?;

        let gdt_table: [u64; 4] = [
            gdt_entry(0, 0, 0),            // NULL
            gdt_entry(0xa09b, 0, 0xfffff), // CODE
            gdt_entry(0xc093, 0, 0xfffff), // DATA
            gdt_entry(0x808b, 0, 0xfffff), // TSS
        ];

        let code_seg = kvm_segment_from_gdt(gdt_table[1], 1);
        let data_seg = kvm_segment_from_gdt(gdt_table[2], 2);
        let tss_seg = kvm_segment_from_gdt(gdt_table[3], 3);

        for (i, entry) in gdt_table.iter().enumerate() {
            let addr = GuestAddress(BOOT_GDT_OFFSET + (i * 8) as u64);
            guest_memory
                .write_obj(*entry, addr)
                .map_err(CpuError::GuestMemory)?;
        }
        guest_memory
            .write_obj(0u64, GuestAddress(BOOT_IDT_OFFSET))
            .map_err(CpuError::GuestMemory)?;

        sregs.gdt.base = BOOT_GDT_OFFSET;
        sregs.gdt.limit = (std::mem::size_of_val(&gdt_table) - 1) as u16;
        sregs.idt.base = BOOT_IDT_OFFSET;
        sregs.idt.limit = (std::mem::size_of::<u64>() - 1) as u16;

        sregs.cs = code_seg;
        sregs.ds = data_seg;
        sregs.es = data_seg;
        sregs.fs = data_seg;
        sregs.gs = data_seg;
        sregs.ss = data_seg;
        sregs.tr = tss_seg;

        sregs.cr0 |= X86_CR0_PE;
        sregs.efer = X86_EFER_LME | X86_EFER_LMA;

        // Identity map the first GiB so the kernel can enable paging.
        guest_memory
            .write_obj(PDPTE_START | 0x03, GuestAddress(PML4_START))
            .map_err(CpuError::GuestMemory)?;
        guest_memory
            .write_obj(PDE_START | 0x03, GuestAddress(PDPTE_START))
            .map_err(CpuError::GuestMemory)?;
        for i in 0..512u64 {
            // Present, writable, huge page.
            guest_memory
                .write_obj((i << 21) | 0x83, GuestAddress(PDE_START + i * 8))
                .map_err(CpuError::GuestMemory)?;
        }

        sregs.cr3 = PML4_START;
        sregs.cr4 |= X86_CR4_PAE;
        sregs.cr0 |= X86_CR0_PG;

        self.vcpu_fd.set_sregs(&sregs).map_err(CpuError::KvmIoctl)
    }

    pub(crate) fn configure_fpu(&self) -> Result<()> {
        let fpu = kvm_fpu {
            fcw: 0x37f,
            mxcsr: 0x1f80,
            ..Default::default()
        };
        self.vcpu_fd.set_fpu(&fpu).map_err(CpuError::KvmIoctl)
    }

    pub(crate) fn configure_lapic(&self) -> Result<()> {
        let mut klapic: kvm_lapic_state = self.vcpu_fd.get_lapic().map_err(CpuError::KvmIoctl)?;

        // LINT0 delivers external interrupts, LINT1 delivers NMIs.
        set_klapic_delivery_mode(&mut klapic, APIC_LVT0_OFFSET, APIC_MODE_EXTINT);
        set_klapic_delivery_mode(&mut klapic, APIC_LVT1_OFFSET, APIC_MODE_NMI);

        self.vcpu_fd
            .set_lapic(&klapic)
            .map_err(CpuError::KvmIoctl)
    }

    /// One `KVM_RUN` iteration: run until the next exit and dispatch it.
    ///
    /// The exit data borrows the vcpu fd, so the dispatch stays inline here
    /// and touches only the device fields.
    pub fn run(&mut self) {
        let Vcpu {
            vcpu_fd,
            index,
            serial,
            net,
            running,
        } = self;
        let index = *index;

        match vcpu_fd.run() {
            Ok(VcpuExit::IoOut(addr, data))
                if (SERIAL_PORT_BASE..=SERIAL_PORT_LAST).contains(&addr) =>
            {
                let offset = (addr - SERIAL_PORT_BASE) as u8;
                if let Err(e) = serial.lock().unwrap().serial.write(offset, data[0]) {
                    warn!(vcpu = index, error = ?e, "serial write failed");
                }
            }
            Ok(VcpuExit::IoIn(addr, data))
                if (SERIAL_PORT_BASE..=SERIAL_PORT_LAST).contains(&addr) =>
            {
                let offset = (addr - SERIAL_PORT_BASE) as u8;
                data[0] = serial.lock().unwrap().serial.read(offset);
            }
            Ok(VcpuExit::MmioRead(addr, data)) => {
                if let Some(net) = net {
                    let mut device = net.lock().unwrap();
                    if device.mmio_range.start() <= addr && addr <= device.mmio_range.end() {
                        let base = MmioAddress(device.mmio_range.start());
                        let offset = addr - device.mmio_range.start();
                        device.mmio_read(base, offset, data);
                    }
                }
            }
            Ok(VcpuExit::MmioWrite(addr, data)) => {
                if let Some(net) = net {
                    let mut device = net.lock().unwrap();
                    if device.mmio_range.start() <= addr && addr <= device.mmio_range.end() {
                        let base = MmioAddress(device.mmio_range.start());
                        let offset = addr - device.mmio_range.start();
                        device.mmio_write(base, offset, data);
                    }
                }
            }
            Ok(VcpuExit::Hlt) => {
                info!(vcpu = index, "guest halted");
                running.store(false, Ordering::SeqCst);
            }
            Ok(VcpuExit::Shutdown) => {
                info!(vcpu = index, "guest shut down");
                running.store(false, Ordering::SeqCst);
            }
            Ok(VcpuExit::InternalError) => {
                error!(vcpu = index, "KVM internal error");
                running.store(false, Ordering::SeqCst);
            }
            Ok(other) => {
                debug!(vcpu = index, exit = ?other, "unhandled vcpu exit");
            }
            Err(e) if e.errno() == libc::EINTR => {
                // Interrupted by the shutdown signal; the caller re-checks
                // the running flag.
            }
            Err(e) => {
                error!(vcpu = index, error = %e, "KVM_RUN failed");
                running.store(false, Ordering::SeqCst);
            }
        }
    }
}

fn get_klapic_reg(klapic: &kvm_lapic_state, offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    for (i, b) in klapic.regs[offset..offset + 4].iter().enumerate() {
        bytes[i] = *b as u8;
    }
    u32::from_le_bytes(bytes)
}

fn set_klapic_reg(klapic: &mut kvm_lapic_state, offset: usize, value: u32) {
    for (i, b) in value.to_le_bytes().iter().enumerate() {
        klapic.regs[offset + i] = *b as i8;
    }
}

fn set_klapic_delivery_mode(klapic: &mut kvm_lapic_state, offset: usize, mode: u32) {
    let reg = get_klapic_reg(klapic, offset);
    set_klapic_reg(klapic, offset, (reg & !0x700) | (mode << 8));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn klapic_reg_round_trips() {
        let mut klapic = kvm_lapic_state::default();
        set_klapic_reg(&mut klapic, APIC_LVT0_OFFSET, 0xdead_beef);
        assert_eq!(get_klapic_reg(&klapic, APIC_LVT0_OFFSET), 0xdead_beef);
    }

    #[test]
    fn delivery_mode_replaces_only_mode_bits() {
        let mut klapic = kvm_lapic_state::default();
        set_klapic_reg(&mut klapic, APIC_LVT1_OFFSET, 0x0000_ffff);
        set_klapic_delivery_mode(&mut klapic, APIC_LVT1_OFFSET, APIC_MODE_NMI);

        let reg = get_klapic_reg(&klapic, APIC_LVT1_OFFSET);
        assert_eq!(reg & 0x700, APIC_MODE_NMI << 8);
        assert_eq!(reg & !0x700, 0x0000_f8ff & !0x700);
    }
}
