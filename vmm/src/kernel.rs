use std::cmp;
use std::fs::File;
use std::io::Seek;
use std::path::Path;

use linux_loader::bootparam::boot_params;
use linux_loader::cmdline::Cmdline;
use linux_loader::configurator::linux::LinuxBootConfigurator;
use linux_loader::configurator::{BootConfigurator, BootParams};
use linux_loader::loader::bzimage::BzImage;
use linux_loader::loader::elf::Elf;
use linux_loader::loader::{KernelLoader, KernelLoaderResult, load_cmdline};
use tracing::debug;
use vm_memory::{Address, Bytes, GuestAddress, GuestMemory, GuestMemoryMmap};

use crate::cpu::ZEROPG_START;
use crate::{MMIO_GAP_END, MMIO_GAP_START, Result, VmmError};

/// Start of high memory, where the kernel image is loaded.
const HIMEM_START: u64 = 0x0010_0000;
/// Where the command line is written.
const CMDLINE_START: u64 = 0x0002_0000;
const CMDLINE_CAPACITY: usize = 4096;
/// End of the usable low-memory range, per convention.
const EBDA_START: u64 = 0x0009_fc00;

const KERNEL_BOOT_FLAG_MAGIC: u16 = 0xaa55;
const KERNEL_HDR_MAGIC: u32 = 0x5372_6448;
const KERNEL_LOADER_OTHER: u8 = 0xff;
const KERNEL_MIN_ALIGNMENT_BYTES: u32 = 0x0100_0000;

const E820_RAM: u32 = 1;
const PAGE_SIZE: u64 = 4096;

const DEFAULT_KERNEL_CMDLINE: &str = "console=ttyS0 i8042.nokbd reboot=k panic=1 pci=off";

/// Where execution starts once the vCPUs come up.
pub(crate) struct LoadedKernel {
    pub entry: GuestAddress,
}

/// Load the kernel and optional initramfs, write the command line and the
/// zero page, and return the boot entry point.
pub(crate) fn kernel_setup(
    guest_memory: &GuestMemoryMmap,
    kernel_path: &Path,
    initramfs_path: Option<&Path>,
    cmdline_extra: &[String],
) -> Result<LoadedKernel> {
    if guest_memory.last_addr().raw_value() < HIMEM_START {
        return Err(VmmError::HimemStartPastMemEnd);
    }

    let mut kernel_image = File::open(kernel_path).map_err(VmmError::Io)?;
    let himem_start = GuestAddress(HIMEM_START);

    // Uncompressed ELF vmlinux first; fall back to a bzImage.
    let (load_result, entry) =
        match Elf::load(guest_memory, None, &mut kernel_image, Some(himem_start)) {
            Ok(res) => {
                let entry = res.kernel_load;
                (res, entry)
            }
            Err(elf_err) => {
                debug!(error = %elf_err, "not an ELF image, trying bzImage");
                kernel_image.rewind().map_err(VmmError::Io)?;
                let res = BzImage::load(guest_memory, None, &mut kernel_image, Some(himem_start))
                    .map_err(VmmError::KernelLoad)?;
                // The 64-bit entry point of a bzImage sits 0x200 past the
                // start of the loaded protected-mode code.
                let entry = GuestAddress(res.kernel_load.raw_value() + 0x200);
                (res, entry)
            }
        };

    let mut params = build_bootparams(guest_memory, &load_result)?;

    let cmdline = assemble_cmdline(cmdline_extra)?;
    load_cmdline(guest_memory, GuestAddress(CMDLINE_START), &cmdline)
        .map_err(VmmError::KernelLoad)?;
    params.hdr.cmd_line_ptr = CMDLINE_START as u32;
    params.hdr.cmdline_size = cmdline.as_str().len() as u32 + 1;

    if let Some(path) = initramfs_path {
        let (addr, size) = load_initramfs(guest_memory, path)?;
        params.hdr.ramdisk_image = addr as u32;
        params.hdr.ramdisk_size = size as u32;
        debug!(addr = format_args!("{addr:#x}"), size, "initramfs loaded");
    }

    LinuxBootConfigurator::write_bootparams::<GuestMemoryMmap>(
        &BootParams::new::<boot_params>(&params, GuestAddress(ZEROPG_START)),
        guest_memory,
    )
    .map_err(VmmError::BootConfigure)?;

    Ok(LoadedKernel { entry })
}

/// The default command line plus whatever the devices contributed.
fn assemble_cmdline(extra: &[String]) -> Result<Cmdline> {
    let mut cmdline = Cmdline::new(CMDLINE_CAPACITY);
    cmdline
        .insert_str(DEFAULT_KERNEL_CMDLINE)
        .map_err(VmmError::Cmdline)?;
    for component in extra {
        cmdline.insert_str(component).map_err(VmmError::Cmdline)?;
    }
    Ok(cmdline)
}

fn build_bootparams(
    guest_memory: &GuestMemoryMmap,
    load_result: &KernelLoaderResult,
) -> Result<boot_params> {
    let mut params = boot_params::default();

    if let Some(hdr) = load_result.setup_header {
        params.hdr = hdr;
    } else {
        params.hdr.boot_flag = KERNEL_BOOT_FLAG_MAGIC;
        params.hdr.header = KERNEL_HDR_MAGIC;
        params.hdr.kernel_alignment = KERNEL_MIN_ALIGNMENT_BYTES;
    }
    params.hdr.type_of_loader = KERNEL_LOADER_OTHER;

    // Low memory below the EBDA.
    add_e820_entry(&mut params, 0, EBDA_START, E820_RAM)?;

    // High memory, with the MMIO gap carved out.
    let last_addr = guest_memory.last_addr().raw_value();
    if last_addr < MMIO_GAP_START {
        add_e820_entry(&mut params, HIMEM_START, last_addr - HIMEM_START + 1, E820_RAM)?;
    } else {
        add_e820_entry(&mut params, HIMEM_START, MMIO_GAP_START - HIMEM_START, E820_RAM)?;
        if last_addr >= MMIO_GAP_END {
            add_e820_entry(&mut params, MMIO_GAP_END, last_addr - MMIO_GAP_END + 1, E820_RAM)?;
        }
    }

    Ok(params)
}

fn add_e820_entry(params: &mut boot_params, addr: u64, size: u64, mem_type: u32) -> Result<()> {
    let index = params.e820_entries as usize;
    if index >= params.e820_table.len() {
        return Err(VmmError::E820Configuration);
    }

    params.e820_table[index].addr = addr;
    params.e820_table[index].size = size;
    params.e820_table[index].type_ = mem_type;
    params.e820_entries += 1;

    Ok(())
}

/// Place the initramfs as high as possible below the MMIO gap, page-aligned.
fn load_initramfs(guest_memory: &GuestMemoryMmap, path: &Path) -> Result<(u64, usize)> {
    let mut image = File::open(path).map_err(VmmError::Io)?;
    let size = image.metadata().map_err(VmmError::Io)?.len() as usize;
    if size == 0 {
        return Err(VmmError::InitramfsLoad);
    }

    let mem_end = cmp::min(guest_memory.last_addr().raw_value() + 1, MMIO_GAP_START);
    let addr = mem_end
        .checked_sub(size as u64)
        .ok_or(VmmError::InitramfsLoad)?
        & !(PAGE_SIZE - 1);
    if addr < HIMEM_START {
        return Err(VmmError::InitramfsLoad);
    }

    guest_memory
        .read_exact_from(GuestAddress(addr), &mut image, size)
        .map_err(VmmError::GuestMemory)?;

    Ok((addr, size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn memory_with_size(size: usize) -> GuestMemoryMmap {
        GuestMemoryMmap::from_ranges(&[(GuestAddress(0), size)]).unwrap()
    }

    fn empty_load_result() -> KernelLoaderResult {
        KernelLoaderResult {
            kernel_load: GuestAddress(HIMEM_START),
            ..Default::default()
        }
    }

    #[test]
    fn e820_without_gap_has_two_entries() {
        let mem = memory_with_size(128 << 20);
        let params = build_bootparams(&mem, &empty_load_result()).unwrap();

        assert_eq!(params.e820_entries, 2);
        assert_eq!(params.e820_table[0].addr, 0);
        assert_eq!(params.e820_table[0].size, EBDA_START);
        assert_eq!(params.e820_table[1].addr, HIMEM_START);
        assert_eq!(params.e820_table[1].size, (128 << 20) - HIMEM_START);
    }

    #[test]
    fn e820_with_memory_above_the_gap_has_three_entries() {
        // Two regions: one below the MMIO gap, one above 4 GiB.
        let mem = GuestMemoryMmap::from_ranges(&[
            (GuestAddress(0), 128 << 20),
            (GuestAddress(MMIO_GAP_END), 64 << 20),
        ])
        .unwrap();
        let params = build_bootparams(&mem, &empty_load_result()).unwrap();

        assert_eq!(params.e820_entries, 3);
        assert_eq!(params.e820_table[2].addr, MMIO_GAP_END);
        assert_eq!(params.e820_table[2].size, 64 << 20);
    }

    #[test]
    fn e820_table_overflow_is_an_error() {
        let mut params = boot_params::default();
        let capacity = params.e820_table.len();
        for i in 0..capacity {
            add_e820_entry(&mut params, i as u64, 1, E820_RAM).unwrap();
        }
        assert!(matches!(
            add_e820_entry(&mut params, 0, 1, E820_RAM),
            Err(VmmError::E820Configuration)
        ));
    }

    #[test]
    fn cmdline_includes_device_fragments() {
        let extra = vec!["virtio_mmio.device=4K@0xd0000000:5".to_string()];
        let cmdline = assemble_cmdline(&extra).unwrap();
        let s = cmdline.as_str();
        assert!(s.starts_with(DEFAULT_KERNEL_CMDLINE));
        assert!(s.contains("virtio_mmio.device=4K@0xd0000000:5"));
    }

    #[test]
    fn initramfs_lands_page_aligned_below_memory_end() {
        let mem = memory_with_size(32 << 20);
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0xabu8; 8192]).unwrap();

        let (addr, size) = load_initramfs(&mem, file.path()).unwrap();
        assert_eq!(size, 8192);
        assert_eq!(addr % PAGE_SIZE, 0);
        assert!(addr + size as u64 <= 32 << 20);

        let first: u8 = mem.read_obj(GuestAddress(addr)).unwrap();
        assert_eq!(first, 0xab);
    }

    #[test]
    fn empty_initramfs_is_rejected() {
        let mem = memory_with_size(32 << 20);
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(matches!(
            load_initramfs(&mem, file.path()),
            Err(VmmError::InitramfsLoad)
        ));
    }
}
