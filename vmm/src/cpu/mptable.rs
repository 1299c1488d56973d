//! MP table generation.
//!
//! Without ACPI, the guest kernel discovers its processors and the IOAPIC by
//! scanning low memory for an Intel MultiProcessor floating pointer. This
//! module writes that structure plus the configuration table into the EBDA.

use std::mem;

use thiserror::Error;
use vm_memory::{Address, ByteValued, Bytes, GuestAddress, GuestMemory, GuestMemoryMmap};

/// Start of the EBDA, where the kernel looks for the floating pointer.
const MPTABLE_START: u64 = 0x9fc00;

/// APIC ids must stay below the 0xff broadcast id, and one id is taken by
/// the IOAPIC.
pub const MAX_SUPPORTED_CPUS: u8 = 254;

const SMP_MAGIC_IDENT: [u8; 4] = *b"_MP_";
const MPC_SIGNATURE: [u8; 4] = *b"PCMP";
const MPC_SPEC: u8 = 4;
const MPC_OEM: [u8; 8] = *b"CLOUDE  ";
const MPC_PRODUCT_ID: [u8; 12] = *b"000000000000";

const APIC_DEFAULT_PHYS_BASE: u32 = 0xfee0_0000;
const IO_APIC_DEFAULT_PHYS_BASE: u32 = 0xfec0_0000;
const APIC_VERSION: u8 = 0x14;

const MP_PROCESSOR: u8 = 0;
const MP_BUS: u8 = 1;
const MP_IOAPIC: u8 = 2;
const MP_INTSRC: u8 = 3;
const MP_LINTSRC: u8 = 4;

const CPU_ENABLED: u8 = 1;
const CPU_BOOTPROCESSOR: u8 = 2;
const CPU_STEPPING: u32 = 0x600;
const CPU_FEATURE_APIC: u32 = 0x200;
const CPU_FEATURE_FPU: u32 = 0x001;

const BUS_TYPE_ISA: [u8; 6] = *b"ISA   ";
const MPC_APIC_USABLE: u8 = 0x1;

// mp_irq_source_types from the spec.
const MP_IRQ_INT: u8 = 0;
const MP_IRQ_NMI: u8 = 1;
const MP_IRQ_EXTINT: u8 = 3;

/// Legacy ISA IRQ lines routed through the IOAPIC.
const ISA_IRQ_LINES: u8 = 16;

#[derive(Debug, Error)]
pub enum MptableError {
    #[error("at most {MAX_SUPPORTED_CPUS} vcpus are supported")]
    TooManyCpus,
    #[error("the MP table does not fit below the end of the EBDA")]
    NotEnoughMemory,
    #[error("failed to write an MP table structure to guest memory")]
    WriteTable(#[source] vm_memory::GuestMemoryError),
}

type Result<T> = std::result::Result<T, MptableError>;

#[derive(Clone, Copy, Debug, Default)]
#[repr(C, packed)]
struct MpfIntel {
    signature: [u8; 4],
    physptr: u32,
    length: u8,
    specification: u8,
    checksum: u8,
    feature1: u8,
    feature2: u8,
    feature3: u8,
    feature4: u8,
    feature5: u8,
}

// Safe: plain-old-data with no implicit padding (repr packed).
unsafe impl ByteValued for MpfIntel {}

#[derive(Clone, Copy, Debug, Default)]
#[repr(C, packed)]
struct MpcTable {
    signature: [u8; 4],
    length: u16,
    spec: u8,
    checksum: u8,
    oem: [u8; 8],
    productid: [u8; 12],
    oemptr: u32,
    oemsize: u16,
    oemcount: u16,
    lapic: u32,
    reserved: u32,
}

unsafe impl ByteValued for MpcTable {}

#[derive(Clone, Copy, Debug, Default)]
#[repr(C, packed)]
struct MpcCpu {
    type_: u8,
    apicid: u8,
    apicver: u8,
    cpuflag: u8,
    cpufeature: u32,
    featureflag: u32,
    reserved: [u32; 2],
}

unsafe impl ByteValued for MpcCpu {}

#[derive(Clone, Copy, Debug, Default)]
#[repr(C, packed)]
struct MpcBus {
    type_: u8,
    busid: u8,
    bustype: [u8; 6],
}

unsafe impl ByteValued for MpcBus {}

#[derive(Clone, Copy, Debug, Default)]
#[repr(C, packed)]
struct MpcIoapic {
    type_: u8,
    apicid: u8,
    apicver: u8,
    flags: u8,
    apicaddr: u32,
}

unsafe impl ByteValued for MpcIoapic {}

#[derive(Clone, Copy, Debug, Default)]
#[repr(C, packed)]
struct MpcIntsrc {
    type_: u8,
    irqtype: u8,
    irqflag: u16,
    srcbus: u8,
    srcbusirq: u8,
    dstapic: u8,
    dstirq: u8,
}

unsafe impl ByteValued for MpcIntsrc {}

#[derive(Clone, Copy, Debug, Default)]
#[repr(C, packed)]
struct MpcLintsrc {
    type_: u8,
    irqtype: u8,
    irqflag: u16,
    srcbusid: u8,
    srcbusirq: u8,
    destapic: u8,
    destapiclint: u8,
}

unsafe impl ByteValued for MpcLintsrc {}

fn byte_sum<T: ByteValued>(v: &T) -> u8 {
    v.as_slice().iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Two's complement of the byte sum, so the whole structure sums to zero.
fn balancing_checksum<T: ByteValued>(v: &T) -> u8 {
    (!byte_sum(v)).wrapping_add(1)
}

fn table_size(num_cpus: u8) -> usize {
    mem::size_of::<MpfIntel>()
        + mem::size_of::<MpcTable>()
        + mem::size_of::<MpcCpu>() * usize::from(num_cpus)
        + mem::size_of::<MpcBus>()
        + mem::size_of::<MpcIoapic>()
        + mem::size_of::<MpcIntsrc>() * usize::from(ISA_IRQ_LINES)
        + mem::size_of::<MpcLintsrc>() * 2
}

/// Write the MP floating pointer and configuration table for `num_cpus`
/// processors at the conventional EBDA location.
pub fn setup_mptable(mem: &GuestMemoryMmap, num_cpus: u8) -> Result<()> {
    if num_cpus > MAX_SUPPORTED_CPUS {
        return Err(MptableError::TooManyCpus);
    }

    let base = GuestAddress(MPTABLE_START);
    if mem
        .checked_offset(base, table_size(num_cpus))
        .is_none()
    {
        return Err(MptableError::NotEnoughMemory);
    }

    let ioapic_id = num_cpus + 1;
    let mut next = base;

    let mut mpf = MpfIntel {
        signature: SMP_MAGIC_IDENT,
        physptr: (base.raw_value() + mem::size_of::<MpfIntel>() as u64) as u32,
        // Length in 16-byte paragraphs.
        length: 1,
        specification: MPC_SPEC,
        ..Default::default()
    };
    mpf.checksum = balancing_checksum(&mpf);
    mem.write_obj(mpf, next).map_err(MptableError::WriteTable)?;
    next = next.unchecked_add(mem::size_of::<MpfIntel>() as u64);

    // The configuration table header is written last, once the entry bytes
    // have been summed into the checksum.
    let table_base = next;
    next = next.unchecked_add(mem::size_of::<MpcTable>() as u64);

    let mut checksum: u8 = 0;

    for cpu_id in 0..num_cpus {
        let cpu = MpcCpu {
            type_: MP_PROCESSOR,
            apicid: cpu_id,
            apicver: APIC_VERSION,
            cpuflag: CPU_ENABLED
                | if cpu_id == 0 { CPU_BOOTPROCESSOR } else { 0 },
            cpufeature: CPU_STEPPING,
            featureflag: CPU_FEATURE_APIC | CPU_FEATURE_FPU,
            ..Default::default()
        };
        checksum = checksum.wrapping_add(byte_sum(&cpu));
        mem.write_obj(cpu, next).map_err(MptableError::WriteTable)?;
        next = next.unchecked_add(mem::size_of::<MpcCpu>() as u64);
    }

    let bus = MpcBus {
        type_: MP_BUS,
        busid: 0,
        bustype: BUS_TYPE_ISA,
    };
    checksum = checksum.wrapping_add(byte_sum(&bus));
    mem.write_obj(bus, next).map_err(MptableError::WriteTable)?;
    next = next.unchecked_add(mem::size_of::<MpcBus>() as u64);

    let ioapic = MpcIoapic {
        type_: MP_IOAPIC,
        apicid: ioapic_id,
        apicver: APIC_VERSION,
        flags: MPC_APIC_USABLE,
        apicaddr: IO_APIC_DEFAULT_PHYS_BASE,
    };
    checksum = checksum.wrapping_add(byte_sum(&ioapic));
    mem.write_obj(ioapic, next)
        .map_err(MptableError::WriteTable)?;
    next = next.unchecked_add(mem::size_of::<MpcIoapic>() as u64);

    for irq in 0..ISA_IRQ_LINES {
        let intsrc = MpcIntsrc {
            type_: MP_INTSRC,
            irqtype: MP_IRQ_INT,
            irqflag: 0,
            srcbus: 0,
            srcbusirq: irq,
            dstapic: ioapic_id,
            dstirq: irq,
        };
        checksum = checksum.wrapping_add(byte_sum(&intsrc));
        mem.write_obj(intsrc, next)
            .map_err(MptableError::WriteTable)?;
        next = next.unchecked_add(mem::size_of::<MpcIntsrc>() as u64);
    }

    let lint0 = MpcLintsrc {
        type_: MP_LINTSRC,
        irqtype: MP_IRQ_EXTINT,
        irqflag: 0,
        srcbusid: 0,
        srcbusirq: 0,
        destapic: 0,
        destapiclint: 0,
    };
    checksum = checksum.wrapping_add(byte_sum(&lint0));
    mem.write_obj(lint0, next)
        .map_err(MptableError::WriteTable)?;
    next = next.unchecked_add(mem::size_of::<MpcLintsrc>() as u64);

    let lint1 = MpcLintsrc {
        type_: MP_LINTSRC,
        irqtype: MP_IRQ_NMI,
        irqflag: 0,
        srcbusid: 0,
        srcbusirq: 0,
        destapic: 0xff,
        destapiclint: 1,
    };
    checksum = checksum.wrapping_add(byte_sum(&lint1));
    mem.write_obj(lint1, next)
        .map_err(MptableError::WriteTable)?;
    next = next.unchecked_add(mem::size_of::<MpcLintsrc>() as u64);

    let mut table = MpcTable {
        signature: MPC_SIGNATURE,
        length: (next.raw_value() - table_base.raw_value()) as u16,
        spec: MPC_SPEC,
        oem: MPC_OEM,
        productid: MPC_PRODUCT_ID,
        lapic: APIC_DEFAULT_PHYS_BASE,
        ..Default::default()
    };
    checksum = checksum.wrapping_add(byte_sum(&table));
    table.checksum = (!checksum).wrapping_add(1);
    mem.write_obj(table, table_base)
        .map_err(MptableError::WriteTable)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_memory() -> GuestMemoryMmap {
        GuestMemoryMmap::from_ranges(&[(GuestAddress(0), 1 << 20)]).unwrap()
    }

    #[test]
    fn writes_floating_pointer_magic() {
        let mem = test_memory();
        setup_mptable(&mem, 4).unwrap();

        let mpf: MpfIntel = mem.read_obj(GuestAddress(MPTABLE_START)).unwrap();
        assert_eq!(mpf.signature, SMP_MAGIC_IDENT);
        // The structure itself must sum to zero.
        assert_eq!(byte_sum(&mpf), 0);
    }

    #[test]
    fn config_table_checksum_balances() {
        let mem = test_memory();
        setup_mptable(&mem, 2).unwrap();

        let mpf: MpfIntel = mem.read_obj(GuestAddress(MPTABLE_START)).unwrap();
        let table_addr = GuestAddress(u64::from(mpf.physptr));
        let table: MpcTable = mem.read_obj(table_addr).unwrap();
        assert_eq!(table.signature, MPC_SIGNATURE);

        let mut bytes = vec![0u8; usize::from(table.length)];
        mem.read_slice(&mut bytes, table_addr).unwrap();
        let sum = bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
        assert_eq!(sum, 0);
    }

    #[test]
    fn cpu_entries_match_requested_count() {
        let mem = test_memory();
        let cpus = 7u8;
        setup_mptable(&mem, cpus).unwrap();

        let mpf: MpfIntel = mem.read_obj(GuestAddress(MPTABLE_START)).unwrap();
        let mut addr = GuestAddress(u64::from(mpf.physptr))
            .unchecked_add(mem::size_of::<MpcTable>() as u64);

        for expected_id in 0..cpus {
            let cpu: MpcCpu = mem.read_obj(addr).unwrap();
            assert_eq!(cpu.type_, MP_PROCESSOR);
            assert_eq!(cpu.apicid, expected_id);
            addr = addr.unchecked_add(mem::size_of::<MpcCpu>() as u64);
        }
    }

    #[test]
    fn rejects_too_many_cpus() {
        let mem = test_memory();
        assert!(matches!(
            setup_mptable(&mem, u8::MAX),
            Err(MptableError::TooManyCpus)
        ));
    }
}
