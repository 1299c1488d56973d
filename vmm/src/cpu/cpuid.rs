use kvm_bindings::CpuId;

// Leaves we patch before handing the host-supported CPUID to a vCPU.
const LEAF_VERSION_INFO: u32 = 0x1;
const LEAF_EXT_TOPOLOGY: u32 = 0xb;

const EBX_CLFLUSH_CACHELINE: u32 = 8;
const ECX_HYPERVISOR_SHIFT: u32 = 31;
const EDX_HTT_SHIFT: u32 = 28;

/// Patch the identification leaves so each vCPU reports its own APIC id and
/// the guest sees a plausible topology.
pub fn filter_cpuid(vcpu_index: usize, num_vcpus: usize, cpuid: &mut CpuId) {
    for entry in cpuid.as_mut_slice().iter_mut() {
        match entry.function {
            LEAF_VERSION_INFO => {
                // Tell the guest it runs under a hypervisor.
                entry.ecx |= 1 << ECX_HYPERVISOR_SHIFT;
                // Initial APIC id in EBX[31:24], CLFLUSH line size in
                // EBX[15:8] (units of 8 bytes).
                entry.ebx = ((vcpu_index as u32) << 24) | (EBX_CLFLUSH_CACHELINE << 8);
                if num_vcpus > 1 {
                    entry.ebx |= (num_vcpus as u32) << 16;
                    entry.edx |= 1 << EDX_HTT_SHIFT;
                }
            }
            LEAF_EXT_TOPOLOGY => {
                // EDX carries the x2APIC id of the querying logical cpu.
                entry.edx = vcpu_index as u32;
            }
            _ => (),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvm_bindings::kvm_cpuid_entry2;

    fn cpuid_with(function: u32) -> CpuId {
        CpuId::from_entries(&[kvm_cpuid_entry2 {
            function,
            ..Default::default()
        }])
        .unwrap()
    }

    #[test]
    fn version_leaf_carries_apic_id() {
        let mut cpuid = cpuid_with(LEAF_VERSION_INFO);
        filter_cpuid(3, 4, &mut cpuid);

        let entry = cpuid.as_slice()[0];
        assert_eq!(entry.ebx >> 24, 3);
        assert_ne!(entry.ecx & (1 << ECX_HYPERVISOR_SHIFT), 0);
        assert_ne!(entry.edx & (1 << EDX_HTT_SHIFT), 0);
    }

    #[test]
    fn single_vcpu_does_not_set_htt() {
        let mut cpuid = cpuid_with(LEAF_VERSION_INFO);
        filter_cpuid(0, 1, &mut cpuid);

        let entry = cpuid.as_slice()[0];
        assert_eq!(entry.edx & (1 << EDX_HTT_SHIFT), 0);
    }

    #[test]
    fn topology_leaf_reports_index() {
        let mut cpuid = cpuid_with(LEAF_EXT_TOPOLOGY);
        filter_cpuid(2, 4, &mut cpuid);
        assert_eq!(cpuid.as_slice()[0].edx, 2);
    }
}
