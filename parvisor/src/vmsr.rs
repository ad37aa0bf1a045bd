//! Model-specific register virtualization.
//!
//! The guest's RDMSR/WRMSR exit unless the MSR bitmap lets them through.
//! An MSR that is neither passed through nor emulated here raises #GP in
//! the guest.
//!
//! The value of the RDMSR is stored in EDX:EAX (high 32 bits in EDX, low 32
//! bits in EAX, upper halves of RDX and RAX cleared). The WRMSR takes its
//! value from EDX:EAX in the same layout; ECX selects the MSR.

use crate::{
    vcpu::VCpuContext,
    virq::inject_gp,
    vlapic::{x2apic_read, x2apic_write},
    vmx::vmcs::Field,
    VmError,
};
use abyss::x86_64::Efer;

pub const MSR_IA32_TSC: u32 = 0x10;
pub const MSR_IA32_PLATFORM_ID: u32 = 0x17;
pub const MSR_IA32_APIC_BASE: u32 = 0x1b;
pub const MSR_IA32_FEATURE_CONTROL: u32 = 0x3a;
pub const MSR_IA32_TSC_ADJUST: u32 = 0x3b;
pub const MSR_IA32_BIOS_SIGN_ID: u32 = 0x8b;
pub const MSR_IA32_MTRRCAP: u32 = 0xfe;
pub const MSR_IA32_SYSENTER_CS: u32 = 0x174;
pub const MSR_IA32_SYSENTER_ESP: u32 = 0x175;
pub const MSR_IA32_SYSENTER_EIP: u32 = 0x176;
pub const MSR_IA32_MCG_CAP: u32 = 0x179;
pub const MSR_IA32_MCG_STATUS: u32 = 0x17a;
pub const MSR_IA32_MISC_ENABLE: u32 = 0x1a0;
pub const MSR_IA32_MTRR_FIX64K_00000: u32 = 0x250;
pub const MSR_IA32_MTRR_FIX16K_80000: u32 = 0x258;
pub const MSR_IA32_MTRR_FIX16K_A0000: u32 = 0x259;
pub const MSR_IA32_MTRR_FIX4K_C0000: u32 = 0x268;
pub const MSR_IA32_MTRR_FIX4K_F8000: u32 = 0x26f;
pub const MSR_IA32_PAT: u32 = 0x277;
pub const MSR_IA32_MTRR_DEF_TYPE: u32 = 0x2ff;
pub const MSR_IA32_TSC_DEADLINE: u32 = 0x6e0;
pub const MSR_X2APIC_FIRST: u32 = 0x800;
pub const MSR_X2APIC_LAST: u32 = 0x8ff;
pub const MSR_IA32_EFER: u32 = 0xc000_0080;
pub const MSR_IA32_STAR: u32 = 0xc000_0081;
pub const MSR_IA32_LSTAR: u32 = 0xc000_0082;
pub const MSR_IA32_CSTAR: u32 = 0xc000_0083;
pub const MSR_IA32_FMASK: u32 = 0xc000_0084;
pub const MSR_IA32_FS_BASE: u32 = 0xc000_0100;
pub const MSR_IA32_GS_BASE: u32 = 0xc000_0101;
pub const MSR_IA32_KERNEL_GS_BASE: u32 = 0xc000_0102;
pub const MSR_IA32_TSC_AUX: u32 = 0xc000_0103;

/// FEATURE_CONTROL as the guest sees it: locked, VMX off.
const FEATURE_CONTROL_LOCKED: u64 = 1;
/// MTRRCAP: fixed ranges and write-combining, no variable ranges.
const MTRRCAP_VALUE: u64 = (1 << 8) | (1 << 10);
/// MISC_ENABLE bits the guest may toggle: fast strings.
const MISC_ENABLE_WRITABLE: u64 = 1;
const EFER_WRITABLE: u64 = Efer::SCE.bits() | Efer::LME.bits() | Efer::NXE.bits();

/// The VMX MSR bitmap: four 1 KiB maps (read low, read high, write low,
/// write high). A set bit makes the access exit.
#[repr(C, align(4096))]
pub struct MsrBitmap([u8; 4096]);

impl MsrBitmap {
    /// A bitmap intercepting every MSR.
    pub fn new() -> Self {
        Self([0xff; 4096])
    }

    fn locate(msr: u32) -> Option<(usize, u8)> {
        let base = match msr {
            0..=0x1fff => 0,
            0xc000_0000..=0xc000_1fff => 1024,
            _ => return None,
        };
        let off = (msr & 0x1fff) as usize;
        Some((base + off / 8, 1 << (off % 8)))
    }

    fn set(&mut self, msr: u32, write: bool, intercept: bool) {
        if let Some((idx, bit)) = Self::locate(msr) {
            let idx = idx + if write { 2048 } else { 0 };
            if intercept {
                self.0[idx] |= bit;
            } else {
                self.0[idx] &= !bit;
            }
        }
    }

    /// Choose whether RDMSR of `msr` exits.
    pub fn set_read(&mut self, msr: u32, intercept: bool) {
        self.set(msr, false, intercept)
    }

    /// Choose whether WRMSR of `msr` exits.
    pub fn set_write(&mut self, msr: u32, intercept: bool) {
        self.set(msr, true, intercept)
    }

    /// Whether the access exits. MSRs outside both ranges always do.
    pub fn intercepts(&self, msr: u32, write: bool) -> bool {
        match Self::locate(msr) {
            Some((idx, bit)) => self.0[idx + if write { 2048 } else { 0 }] & bit != 0,
            None => true,
        }
    }
}

impl Default for MsrBitmap {
    fn default() -> Self {
        Self::new()
    }
}

/// MSRs that are switched by the VMCS or never touched by the hypervisor.
const PASSTHROUGH_MSRS: [u32; 10] = [
    MSR_IA32_SYSENTER_CS,
    MSR_IA32_SYSENTER_ESP,
    MSR_IA32_SYSENTER_EIP,
    MSR_IA32_STAR,
    MSR_IA32_LSTAR,
    MSR_IA32_CSTAR,
    MSR_IA32_FMASK,
    MSR_IA32_FS_BASE,
    MSR_IA32_GS_BASE,
    MSR_IA32_KERNEL_GS_BASE,
];

/// Let the guest access the MSRs it owns without exits.
pub fn init_msr_bitmap(bitmap: &mut MsrBitmap) {
    for msr in PASSTHROUGH_MSRS.into_iter().chain([MSR_IA32_TSC_AUX]) {
        bitmap.set_read(msr, false);
        bitmap.set_write(msr, false);
    }
}

/// Emulated MSR state of one vCPU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestMsrs {
    pub pat: u64,
    pub misc_enable: u64,
    pub tsc_adjust: u64,
    pub mtrr_def_type: u64,
    /// FIX64K_00000, FIX16K_80000, FIX16K_A0000, FIX4K_C0000..FIX4K_F8000.
    pub mtrr_fixed: [u64; 11],
}

impl Default for GuestMsrs {
    fn default() -> Self {
        Self {
            pat: crate::vmx::setup::PAT_POWER_ON_VALUE,
            misc_enable: 1,
            tsc_adjust: 0,
            mtrr_def_type: 0,
            mtrr_fixed: [0; 11],
        }
    }
}

fn fixed_mtrr_index(msr: u32) -> Option<usize> {
    match msr {
        MSR_IA32_MTRR_FIX64K_00000 => Some(0),
        MSR_IA32_MTRR_FIX16K_80000 => Some(1),
        MSR_IA32_MTRR_FIX16K_A0000 => Some(2),
        MSR_IA32_MTRR_FIX4K_C0000..=MSR_IA32_MTRR_FIX4K_F8000 => {
            Some(3 + (msr - MSR_IA32_MTRR_FIX4K_C0000) as usize)
        }
        _ => None,
    }
}

/// Memory types valid in PAT and MTRR entries: UC, WC, WT, WP, WB, UC-.
#[inline]
fn is_valid_memtype(ty: u8, pat: bool) -> bool {
    matches!(ty, 0 | 1 | 4 | 5 | 6) || (pat && ty == 7)
}

fn is_valid_pat(v: u64) -> bool {
    v.to_le_bytes().iter().all(|&b| is_valid_memtype(b, true))
}

fn is_valid_fixed_mtrr(v: u64) -> bool {
    v.to_le_bytes().iter().all(|&b| is_valid_memtype(b, false))
}

/// Emulate RDMSR of `msr`. `None` means the guest takes a #GP.
fn read_msr(ctx: &mut VCpuContext, msr: u32) -> Result<Option<u64>, VmError> {
    let msrs = &ctx.arch.msrs;
    Ok(Some(match msr {
        MSR_IA32_TSC => ctx.hv.platform.rdtsc().wrapping_add(msrs.tsc_adjust),
        MSR_IA32_TSC_ADJUST => msrs.tsc_adjust,
        MSR_IA32_PLATFORM_ID | MSR_IA32_BIOS_SIGN_ID => 0,
        MSR_IA32_APIC_BASE => ctx.vcpu.vlapic.get_apicbase(),
        MSR_IA32_FEATURE_CONTROL => FEATURE_CONTROL_LOCKED,
        MSR_IA32_MTRRCAP => MTRRCAP_VALUE,
        MSR_IA32_MTRR_DEF_TYPE => msrs.mtrr_def_type,
        MSR_IA32_MCG_CAP | MSR_IA32_MCG_STATUS => 0,
        MSR_IA32_MISC_ENABLE => msrs.misc_enable,
        MSR_IA32_PAT => msrs.pat,
        MSR_IA32_EFER => ctx.efer()?,
        MSR_IA32_TSC_DEADLINE => ctx.vcpu.vlapic.get_tsc_deadline_msr(),
        MSR_X2APIC_FIRST..=MSR_X2APIC_LAST => match x2apic_read(&ctx.vcpu.vlapic, msr) {
            Ok(v) => v,
            Err(_) => return Ok(None),
        },
        msr => match fixed_mtrr_index(msr) {
            Some(i) => msrs.mtrr_fixed[i],
            None => return Ok(None),
        },
    }))
}

/// Emulate WRMSR of `msr`. `false` means the guest takes a #GP.
fn write_msr(ctx: &mut VCpuContext, msr: u32, v: u64) -> Result<bool, VmError> {
    match msr {
        // Writing the TSC moves the guest view by the difference.
        MSR_IA32_TSC => {
            ctx.arch.msrs.tsc_adjust = v.wrapping_sub(ctx.hv.platform.rdtsc());
        }
        MSR_IA32_TSC_ADJUST => ctx.arch.msrs.tsc_adjust = v,
        MSR_IA32_BIOS_SIGN_ID => (),
        MSR_IA32_APIC_BASE => return Ok(ctx.vcpu.vlapic.set_apicbase(v).is_ok()),
        MSR_IA32_MCG_STATUS if v == 0 => (),
        MSR_IA32_MISC_ENABLE => {
            let msrs = &mut ctx.arch.msrs;
            msrs.misc_enable = (msrs.misc_enable & !MISC_ENABLE_WRITABLE) | (v & MISC_ENABLE_WRITABLE);
        }
        MSR_IA32_MTRR_DEF_TYPE => {
            // Type plus FE (bit 10) and E (bit 11).
            if v & !0xcff != 0 || !is_valid_memtype(v as u8, false) {
                return Ok(false);
            }
            ctx.arch.msrs.mtrr_def_type = v;
        }
        MSR_IA32_PAT => {
            if !is_valid_pat(v) {
                return Ok(false);
            }
            ctx.arch.msrs.pat = v;
            ctx.vmcs.write(Field::GuestIa32Pat, v)?;
        }
        MSR_IA32_EFER => {
            if v & !(EFER_WRITABLE | Efer::LMA.bits()) != 0 {
                return Ok(false);
            }
            let old = ctx.efer()?;
            // LME can not change while paging is on; LMA follows CR0.PG.
            let paging = ctx.cr0()? & abyss::x86_64::Cr0::PG.bits() != 0;
            if paging && (old ^ v) & Efer::LME.bits() != 0 {
                return Ok(false);
            }
            ctx.set_efer((v & EFER_WRITABLE) | (old & Efer::LMA.bits()));
        }
        MSR_IA32_TSC_DEADLINE => ctx.vcpu.vlapic.set_tsc_deadline_msr(v),
        MSR_X2APIC_FIRST..=MSR_X2APIC_LAST => {
            return Ok(x2apic_write(ctx.hv, ctx.vm, ctx.vcpu, msr, v).is_ok())
        }
        msr => match fixed_mtrr_index(msr) {
            Some(i) if is_valid_fixed_mtrr(v) => ctx.arch.msrs.mtrr_fixed[i] = v,
            _ => return Ok(false),
        },
    }
    Ok(true)
}

/// RDMSR exit.
pub fn rdmsr_vmexit_handler(ctx: &mut VCpuContext) -> Result<(), VmError> {
    let msr = ctx.gprs().rcx as u32;
    match read_msr(ctx, msr)? {
        Some(v) => {
            let gprs = ctx.gprs();
            gprs.rax = (v & 0xffff_ffff) as usize;
            gprs.rdx = (v >> 32) as usize;
        }
        None => {
            log::debug!(
                "vm{} vcpu{}: rdmsr {:#x} not handled",
                ctx.vm.vm_id,
                ctx.vcpu.vcpu_id,
                msr
            );
            inject_gp(ctx, 0);
        }
    }
    Ok(())
}

/// WRMSR exit.
pub fn wrmsr_vmexit_handler(ctx: &mut VCpuContext) -> Result<(), VmError> {
    let gprs = ctx.gprs();
    let msr = gprs.rcx as u32;
    let v = ((gprs.rdx as u64 & 0xffff_ffff) << 32) | (gprs.rax as u64 & 0xffff_ffff);
    if !write_msr(ctx, msr, v)? {
        log::debug!(
            "vm{} vcpu{}: wrmsr {:#x} <- {:#x} not handled",
            ctx.vm.vm_id,
            ctx.vcpu.vcpu_id,
            msr,
            v
        );
        inject_gp(ctx, 0);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{tests::Harness, vcpu::PendingException};

    #[test]
    fn bitmap_layout() {
        let mut b = MsrBitmap::new();
        init_msr_bitmap(&mut b);
        assert!(!b.intercepts(MSR_IA32_LSTAR, false));
        assert!(!b.intercepts(MSR_IA32_SYSENTER_EIP, true));
        assert!(b.intercepts(MSR_IA32_EFER, false));
        assert!(b.intercepts(MSR_IA32_PAT, true));
        assert!(b.intercepts(0x4000_0000, false));
        // LSTAR is bit 2 of byte 16 of the high read map.
        assert_eq!(b.0[1024 + 16] & 0b100, 0);
        b.set_write(0x808, false);
        assert!(!b.intercepts(0x808, true));
        assert!(b.intercepts(0x808, false));
    }

    fn rdmsr(ctx: &mut VCpuContext, msr: u32) -> u64 {
        ctx.gprs().rcx = msr as usize;
        rdmsr_vmexit_handler(ctx).unwrap();
        ((ctx.gprs().rdx as u64) << 32) | ctx.gprs().rax as u64
    }

    fn wrmsr(ctx: &mut VCpuContext, msr: u32, v: u64) {
        let gprs = ctx.gprs();
        gprs.rcx = msr as usize;
        gprs.rax = v as u32 as usize;
        gprs.rdx = (v >> 32) as usize;
        wrmsr_vmexit_handler(ctx).unwrap();
    }

    #[test]
    fn emulated_registers() {
        let h = Harness::new();
        let vm = h.vm(0);
        h.with_vcpu(&vm, 0, |ctx| {
            assert_eq!(rdmsr(ctx, MSR_IA32_FEATURE_CONTROL), 1);
            assert_eq!(rdmsr(ctx, MSR_IA32_PAT), 0x0007_0406_0007_0406);
            wrmsr(ctx, MSR_IA32_PAT, 0x0007_0406_0007_0106);
            assert_eq!(rdmsr(ctx, MSR_IA32_PAT), 0x0007_0406_0007_0106);
            assert_eq!(ctx.vmcs.read(Field::GuestIa32Pat).unwrap(), 0x0007_0406_0007_0106);
            assert_eq!(
                rdmsr(ctx, MSR_IA32_APIC_BASE),
                crate::vlapic::DEFAULT_APIC_BASE | (1 << 11) | (1 << 8)
            );
            wrmsr(ctx, MSR_IA32_EFER, (Efer::LME | Efer::SCE).bits());
            assert_eq!(ctx.efer().unwrap(), (Efer::LME | Efer::SCE).bits());
            wrmsr(ctx, MSR_IA32_MTRR_FIX4K_C0000 + 2, 0x0606_0606_0606_0606);
            assert_eq!(ctx.arch.msrs.mtrr_fixed[5], 0x0606_0606_0606_0606);
            assert!(ctx.arch.exception.is_none());
        });
    }

    #[test]
    fn rejected_accesses_raise_gp() {
        let h = Harness::new();
        let vm = h.vm(0);
        let gp = Some(PendingException {
            vector: 13,
            error_code: Some(0),
        });
        h.with_vcpu(&vm, 0, |ctx| {
            rdmsr(ctx, 0x1234);
            assert_eq!(ctx.arch.exception.take(), gp);
            // Memory type 2 is reserved.
            wrmsr(ctx, MSR_IA32_PAT, 0x0202);
            assert_eq!(ctx.arch.exception.take(), gp);
            assert_eq!(ctx.arch.msrs.pat, 0x0007_0406_0007_0406);
            wrmsr(ctx, MSR_IA32_FEATURE_CONTROL, 5);
            assert_eq!(ctx.arch.exception.take(), gp);
            // x2APIC registers are absent in xAPIC mode.
            rdmsr(ctx, 0x802);
            assert_eq!(ctx.arch.exception.take(), gp);
        });
    }

    #[test]
    fn tsc_write_adjusts_the_guest_view() {
        let h = Harness::new();
        let vm = h.vm(1);
        h.p.set_tsc_step(0);
        h.p.set_tsc(10_000);
        h.with_vcpu(&vm, 0, |ctx| {
            wrmsr(ctx, MSR_IA32_TSC, 50_000);
            assert_eq!(ctx.arch.msrs.tsc_adjust, 40_000);
            h.p.advance_tsc(5);
            assert_eq!(rdmsr(ctx, MSR_IA32_TSC), 50_005);
        });
    }
}
