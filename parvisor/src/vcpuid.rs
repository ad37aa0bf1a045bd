//! CPUID virtualization.
//!
//! The leaves the guest may see are captured from the host once per VM and
//! sanitized: virtualization, monitoring and power management features are
//! hidden, the topology is rewritten to the VM's vCPUs and the hypervisor
//! leaves are added. A few bits that follow guest state (APIC id, OSXSAVE)
//! are patched at query time.

use crate::{config::VmConfig, vcpu::VCpuContext, VmError};
use abyss::{
    platform::{CpuidResult, Platform},
    x86_64::Cr4,
};
use alloc::vec::Vec;

/// Highest basic leaf offered to guests.
const MAX_BASIC_LEAF: u32 = 0x1f;
/// Highest extended leaf offered to guests.
const MAX_EXTENDED_LEAF: u32 = 0x8000_0008;
/// Hypervisor leaves.
pub const CPUID_HV_BASE: u32 = 0x4000_0000;
const CPUID_HV_LAST: u32 = 0x4000_0001;
/// Vendor signature in EBX, ECX, EDX of leaf 0x4000_0000.
pub const HV_SIGNATURE: &[u8; 12] = b"ParvisorHV\0\0";

mod leaf1 {
    // ECX
    pub const DTES64: u32 = 1 << 2;
    pub const MONITOR: u32 = 1 << 3;
    pub const DS_CPL: u32 = 1 << 4;
    pub const VMX: u32 = 1 << 5;
    pub const SMX: u32 = 1 << 6;
    pub const EST: u32 = 1 << 7;
    pub const TM2: u32 = 1 << 8;
    pub const PDCM: u32 = 1 << 15;
    pub const X2APIC: u32 = 1 << 21;
    pub const TSC_DEADLINE: u32 = 1 << 24;
    pub const OSXSAVE: u32 = 1 << 27;
    pub const HYPERVISOR: u32 = 1 << 31;
    // EDX
    pub const DS: u32 = 1 << 21;
    pub const ACPI: u32 = 1 << 22;
    pub const TM: u32 = 1 << 29;
    pub const PBE: u32 = 1 << 31;
}

mod leaf7 {
    // EBX
    pub const SGX: u32 = 1 << 2;
    // ECX
    pub const WAITPKG: u32 = 1 << 5;
    pub const SGX_LC: u32 = 1 << 30;
    // EDX: IBRS/IBPB, STIBP, ARCH_CAPABILITIES, SSBD.
    pub const HIDDEN_EDX: u32 = (1 << 26) | (1 << 27) | (1 << 29) | (1 << 31);
}

/// One captured leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    leaf: u32,
    subleaf: u32,
    result: CpuidResult,
}

/// Whether the output of `leaf` depends on ECX.
fn is_indexed(leaf: u32) -> bool {
    matches!(leaf, 0x4 | 0x7 | 0xb | 0xd | 0xf | 0x10 | 0x12 | 0x14 | 0x17 | 0x18 | 0x1f)
}

/// Number of ECX values captured for an indexed leaf.
fn subleaf_count(p: &dyn Platform, leaf: u32) -> u32 {
    match leaf {
        // Until the cache type is null.
        0x4 => (0..16)
            .find(|&i| p.cpuid(0x4, i).eax & 0x1f == 0)
            .unwrap_or(16),
        0x7 => (p.cpuid(0x7, 0).eax + 1).min(4),
        0xd => 64,
        0xb | 0x1f => 3,
        _ => 1,
    }
}

/// The CPUID leaves a VM sees.
#[derive(Debug, Clone)]
pub struct CpuidCache {
    entries: Vec<Entry>,
    max_basic: u32,
    max_extended: u32,
    vcpu_num: u32,
}

impl CpuidCache {
    /// Capture and sanitize the host leaves for `config`.
    pub fn new(p: &dyn Platform, config: &VmConfig) -> Self {
        let vcpu_num = config.vcpu_num() as u32;
        let max_basic = p.cpuid(0, 0).eax.min(MAX_BASIC_LEAF);
        let max_extended = p.cpuid(0x8000_0000, 0).eax.min(MAX_EXTENDED_LEAF);
        let mut entries = Vec::new();
        let leaves = (0..=max_basic).chain(0x8000_0000..=max_extended.max(0x8000_0000));
        for leaf in leaves {
            let subleaves = if is_indexed(leaf) { subleaf_count(p, leaf) } else { 1 };
            for subleaf in 0..subleaves {
                let result = sanitize(leaf, subleaf, p.cpuid(leaf, subleaf), vcpu_num);
                entries.push(Entry { leaf, subleaf, result });
            }
        }
        // Leaf 0 reports the clamped range.
        if let Some(e) = entries.first_mut() {
            e.result.eax = max_basic;
        }
        if let Some(e) = entries.iter_mut().find(|e| e.leaf == 0x8000_0000) {
            e.result.eax = max_extended.max(0x8000_0000);
        }
        Self {
            entries,
            max_basic,
            max_extended,
            vcpu_num,
        }
    }

    /// The captured value of `leaf`/`subleaf`, before per-vCPU patches.
    ///
    /// Leaves past the offered ranges read as zero.
    pub fn lookup(&self, leaf: u32, subleaf: u32) -> CpuidResult {
        match leaf {
            CPUID_HV_BASE => {
                let sig = |i: usize| {
                    u32::from_le_bytes([HV_SIGNATURE[i], HV_SIGNATURE[i + 1], HV_SIGNATURE[i + 2], HV_SIGNATURE[i + 3]])
                };
                return CpuidResult {
                    eax: CPUID_HV_LAST,
                    ebx: sig(0),
                    ecx: sig(4),
                    edx: sig(8),
                };
            }
            l if l > self.max_basic && l < 0x8000_0000 => return CpuidResult::default(),
            l if l > self.max_extended && l >= 0x8000_0000 => return CpuidResult::default(),
            _ => (),
        }
        let subleaf = if is_indexed(leaf) { subleaf } else { 0 };
        self.entries
            .iter()
            .find(|e| e.leaf == leaf && e.subleaf == subleaf)
            .map(|e| e.result)
            .unwrap_or_default()
    }

    /// CPUID as executed by vCPU `vcpu_id` with guest CR4 `cr4`.
    pub fn query(&self, leaf: u32, subleaf: u32, vcpu_id: u32, cr4: u64) -> CpuidResult {
        let mut r = self.lookup(leaf, subleaf);
        match leaf {
            0x1 => {
                r.ebx = (r.ebx & 0x00ff_ffff) | (vcpu_id << 24);
                if cr4 & Cr4::OSXSAVE.bits() != 0 && r.ecx & (1 << 26) != 0 {
                    r.ecx |= leaf1::OSXSAVE;
                } else {
                    r.ecx &= !leaf1::OSXSAVE;
                }
            }
            0xb | 0x1f => {
                // ECX[7:0] echoes the level asked for, valid or not.
                r.ecx = (r.ecx & !0xff) | (subleaf & 0xff);
                r.edx = vcpu_id;
            }
            _ => (),
        }
        r
    }
}

fn topology_shift(vcpu_num: u32) -> u32 {
    32 - vcpu_num.saturating_sub(1).leading_zeros()
}

/// Hide what a guest must not see in the host value of a leaf.
fn sanitize(leaf: u32, subleaf: u32, mut r: CpuidResult, vcpu_num: u32) -> CpuidResult {
    use leaf1::*;
    match leaf {
        0x1 => {
            r.ecx &= !(DTES64 | MONITOR | DS_CPL | VMX | SMX | EST | TM2 | PDCM);
            r.ecx |= X2APIC | TSC_DEADLINE | HYPERVISOR;
            r.edx &= !(DS | ACPI | TM | PBE);
            // Logical processors per package.
            r.ebx = (r.ebx & !0x00ff_0000) | (vcpu_num << 16);
        }
        0x4 => {
            // Cores per package; one thread shares each cache.
            r.eax = (r.eax & 0x3fff) | ((vcpu_num - 1) << 26);
        }
        // Thermal/power management, MONITOR/MWAIT, performance monitoring.
        0x5 | 0x6 | 0xa => r = CpuidResult::default(),
        0x7 if subleaf == 0 => {
            r.ebx &= !leaf7::SGX;
            r.ecx &= !(leaf7::SGX_LC | leaf7::WAITPKG);
            r.edx &= !leaf7::HIDDEN_EDX;
        }
        0x7 => (),
        0xb | 0x1f => {
            r = match subleaf {
                // SMT level: one thread per core.
                0 => CpuidResult {
                    eax: 0,
                    ebx: 1,
                    ecx: 1 << 8,
                    edx: 0,
                },
                // Core level.
                1 => CpuidResult {
                    eax: topology_shift(vcpu_num),
                    ebx: vcpu_num,
                    ecx: (2 << 8) | 1,
                    edx: 0,
                },
                n => CpuidResult {
                    ecx: n,
                    ..Default::default()
                },
            }
        }
        // SGX and processor trace.
        0x12 | 0x14 => r = CpuidResult::default(),
        _ => (),
    }
    r
}

/// CPUID exit.
pub fn cpuid_vmexit_handler(ctx: &mut VCpuContext) -> Result<(), VmError> {
    let (leaf, subleaf) = {
        let gprs = ctx.gprs();
        (gprs.rax as u32, gprs.rcx as u32)
    };
    let cr4 = ctx.cr4()?;
    let r = ctx
        .arch
        .cpuid
        .query(leaf, subleaf, ctx.vcpu.vcpu_id as u32, cr4);
    let gprs = ctx.gprs();
    gprs.rax = r.eax as usize;
    gprs.rbx = r.ebx as usize;
    gprs.rcx = r.ecx as usize;
    gprs.rdx = r.edx as usize;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VM_CONFIGS;
    use abyss::mock::MockPlatform;

    fn host() -> MockPlatform {
        let p = MockPlatform::new();
        p.set_cpuid(0, 0, CpuidResult { eax: 0x20, ..Default::default() });
        p.set_cpuid(
            1,
            0,
            CpuidResult {
                eax: 0x906ea,
                ebx: 0x0710_0800,
                ecx: leaf1::VMX | leaf1::MONITOR | (1 << 26) | (1 << 0),
                edx: leaf1::ACPI | 1,
            },
        );
        p.set_cpuid(6, 0, CpuidResult { eax: 0x77, ..Default::default() });
        p.set_cpuid(7, 0, CpuidResult { eax: 0, ebx: leaf7::SGX | 1, ecx: 0, edx: 1 << 26 | 1 << 4 });
        p.set_cpuid(0x16, 0, CpuidResult { eax: 2400, ..Default::default() });
        p.set_cpuid(0x8000_0000, 0, CpuidResult { eax: 0x8000_0008, ..Default::default() });
        p
    }

    #[test]
    fn features_are_sanitized() {
        let cache = CpuidCache::new(&host(), &VM_CONFIGS[0]);
        let r = cache.query(1, 0, 1, 0);
        assert_eq!(r.ecx & (leaf1::VMX | leaf1::MONITOR | leaf1::OSXSAVE), 0);
        assert_ne!(r.ecx & leaf1::X2APIC, 0);
        assert_ne!(r.ecx & leaf1::TSC_DEADLINE, 0);
        assert_ne!(r.ecx & leaf1::HYPERVISOR, 0);
        assert_eq!(r.edx, 1);
        assert_eq!(r.ebx >> 24, 1);
        assert_eq!((r.ebx >> 16) & 0xff, 2);
        assert_eq!(cache.query(6, 0, 0, 0), CpuidResult::default());
        let r = cache.query(7, 0, 0, 0);
        assert_eq!((r.ebx, r.edx), (1, 1 << 4));
        assert_eq!(cache.lookup(0x16, 0).eax, 2400);
    }

    #[test]
    fn osxsave_follows_guest_cr4() {
        let cache = CpuidCache::new(&host(), &VM_CONFIGS[1]);
        assert_eq!(cache.query(1, 0, 0, 0).ecx & leaf1::OSXSAVE, 0);
        assert_ne!(cache.query(1, 0, 0, Cr4::OSXSAVE.bits()).ecx & leaf1::OSXSAVE, 0);
    }

    #[test]
    fn ranges_and_topology() {
        let cache = CpuidCache::new(&host(), &VM_CONFIGS[0]);
        assert_eq!(cache.lookup(0, 0).eax, MAX_BASIC_LEAF);
        assert_eq!(cache.lookup(0x21, 0), CpuidResult::default());
        assert_eq!(cache.lookup(0x8000_0009, 0), CpuidResult::default());
        let r = cache.query(0xb, 1, 1, 0);
        assert_eq!((r.eax, r.ebx, r.ecx, r.edx), (1, 2, 0x201, 1));
        let r = cache.query(0xb, 5, 3, 0);
        assert_eq!((r.eax, r.ebx, r.ecx, r.edx), (0, 0, 5, 3));
        assert_eq!(cache.query(0x1f, 0x107, 0, 0).ecx, 0x07);

        let hv = cache.lookup(CPUID_HV_BASE, 0);
        let mut sig = [0u8; 12];
        sig[0..4].copy_from_slice(&hv.ebx.to_le_bytes());
        sig[4..8].copy_from_slice(&hv.ecx.to_le_bytes());
        sig[8..12].copy_from_slice(&hv.edx.to_le_bytes());
        assert_eq!(&sig, HV_SIGNATURE);
    }
}
