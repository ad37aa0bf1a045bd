//! VMCS initialization of a vCPU.

use super::{control::*, vmcs::Field};
use crate::{
    vcpu::{StartupState, VCpuContext},
    VmError,
};
use abyss::{
    addressing::Va,
    x86_64::{Cr0, Cr4, Rflags},
};

/// CR0 bits owned by the hypervisor; guest reads see the read shadow.
pub const CR0_GUEST_HOST_MASK: u64 = Cr0::PE.bits()
    | Cr0::ET.bits()
    | Cr0::NE.bits()
    | Cr0::NW.bits()
    | Cr0::CD.bits()
    | Cr0::PG.bits();
/// CR4 bits owned by the hypervisor.
pub const CR4_GUEST_HOST_MASK: u64 = Cr4::PSE.bits()
    | Cr4::PAE.bits()
    | Cr4::PGE.bits()
    | Cr4::VMXE.bits()
    | Cr4::SMXE.bits()
    | Cr4::SMEP.bits()
    | Cr4::SMAP.bits()
    | Cr4::PKE.bits()
    | Cr4::LA57.bits();

/// Value of the guest PAT after reset.
pub const PAT_POWER_ON_VALUE: u64 = 0x0007_0406_0007_0406;

/// Activity state: wait-for-SIPI.
pub const ACTIVITY_WAIT_FOR_SIPI: u64 = 3;

/// Program every area of the current VMCS for `ctx.vcpu` and load the guest
/// state selected by `ctx.arch.startup`.
pub fn init_vmcs(ctx: &mut VCpuContext) -> Result<(), VmError> {
    let p = &*ctx.hv.platform;
    let vmcs = ctx.vmcs;
    let apicv = ctx.vcpu.vlapic.ops();
    // 26.2.1.1 VM-Execution Control Fields
    {
        // Reserved bits in the pin-based VM-execution controls must be set properly. Software may consult the VMX
        // capability MSRs to determine the proper settings (see Appendix A.3.1).
        let wanted = VmcsPinBasedVmexecCtl::EXTERNAL_INTERRUPT_EXITING
            | VmcsPinBasedVmexecCtl::NMI_EXITING
            | VmcsPinBasedVmexecCtl::VIRTUAL_NMIS
            | VmcsPinBasedVmexecCtl::ACTIVE_VMX_PREEMPTION_TIMER
            | apicv.pin_ctls();
        vmcs.write(
            Field::PinBasedExecControls,
            adjust_controls(p, IA32_VMX_PINBASED_CTLS, wanted.bits()) as u64,
        )?;

        // Reserved bits in the primary processor-based VM-execution controls must be set properly. Software may
        // consult the VMX capability MSRs to determine the proper settings (see Appendix A.3.2).
        if !is_supported(p, IA32_VMX_PROC_BASED_CTLS, 31) {
            return Err(VmError::VCpuError("secondary controls are not supported"));
        }
        let wanted = VmcsProcBasedVmexecCtl::ACTIVATE_SECONDARY_CTL
            | VmcsProcBasedVmexecCtl::UNCONDIOEXIT
            | VmcsProcBasedVmexecCtl::USEMSRBMP
            | VmcsProcBasedVmexecCtl::MOVDREXIT
            | VmcsProcBasedVmexecCtl::RDPMCEXIT
            | VmcsProcBasedVmexecCtl::MWAITEXIT
            | VmcsProcBasedVmexecCtl::MONITOREXIT
            | apicv.proc_ctls();
        vmcs.write(
            Field::ProcessorBasedVmexecControls,
            adjust_controls(p, IA32_VMX_PROC_BASED_CTLS, wanted.bits()) as u64,
        )?;

        // If the “activate secondary controls” primary processor-based VM-execution control is 1, reserved bits in the
        // secondary processor-based VM-execution controls must be cleared. Software may consult the VMX capability
        // MSRs to determine which bits are reserved (see Appendix A.3.3).
        let wanted = VmcsProcBasedSecondaryVmexecCtl::ENABLE_EPT
            | VmcsProcBasedSecondaryVmexecCtl::UNRESTRICTED_GUEST
            | VmcsProcBasedSecondaryVmexecCtl::ENABLE_RDTSCP
            | VmcsProcBasedSecondaryVmexecCtl::ENABLE_INVPCID
            | VmcsProcBasedSecondaryVmexecCtl::ENABLE_XSAVES_XRSTORS
            | VmcsProcBasedSecondaryVmexecCtl::WBINVD_EXITING
            | apicv.proc_ctls2();
        vmcs.write(
            Field::SecondaryVmexecControls,
            adjust_controls(p, IA32_VMX_PROC_BASED_CTLS2, wanted.bits()) as u64,
        )?;

        vmcs.write(Field::ExceptionBitmap, 0)?;
        vmcs.write(Field::PageFaultErrCodeMask, 0)?;
        vmcs.write(Field::PageFaultErrCodeMatch, 0)?;
        vmcs.write(Field::Cr3TargetCount, 0)?;
        vmcs.write(Field::TscOffset, 0)?;
        vmcs.write(Field::Cr0GuestHostMask, CR0_GUEST_HOST_MASK)?;
        vmcs.write(Field::Cr4GuestHostMask, CR4_GUEST_HOST_MASK)?;
        vmcs.write(Field::Eptptr, ctx.vm.ept.read().eptp())?;
        vmcs.write(
            Field::MsrBitmaps,
            Va::of(&*ctx.arch.msr_bitmap).into_pa().into_usize() as u64,
        )?;
        apicv.init_vmcs(&ctx.vcpu.vlapic, &vmcs, ctx.hv.posted_intr_vector())?;
    }
    // 26.2.1.2 VM-Exit Control Fields
    {
        // Reserved bits in the primary VM-exit controls must be set properly.
        // Software may consult the VMX capability MSRs to determine the proper settings (see Appendix A.4.1).
        let wanted = VmcsExitCtl::HOST_ADDRESS_SPACE_SIZE
            | VmcsExitCtl::ACK_INTR_ON_EXIT
            | VmcsExitCtl::SAVE_IA32_PAT
            | VmcsExitCtl::LOAD_IA32_PAT
            | VmcsExitCtl::SAVE_IA32_EFER
            | VmcsExitCtl::LOAD_IA32_EFER;
        vmcs.write(
            Field::VmexitControls,
            adjust_controls(p, IA32_VMX_EXIT_CTLS, wanted.bits()) as u64,
        )?;
        vmcs.write(Field::VmexitMsrStoreCount, 0)?;
        vmcs.write(Field::VmexitMsrLoadCount, 0)?;
    }
    // 26.2.1.3 VM-Entry Control Fields
    {
        // Reserved bits in the VM-entry controls must be set properly.
        // Software may consult the VMX capability MSRs to determine the proper settings (see Appendix A.5).
        let wanted = VmcsEntryCtl::LOAD_IA32_PAT | VmcsEntryCtl::LOAD_IA32_EFER;
        vmcs.write(
            Field::VmentryControls,
            adjust_controls(p, IA32_VMX_ENTRY_CTLS, wanted.bits()) as u64,
        )?;
        vmcs.write(Field::VmentryMsrLoadCount, 0)?;
        vmcs.write(Field::VmentryInterruptionInfo, 0)?;
    }
    init_host_state(ctx)?;
    init_guest_state(ctx)
}

// 26.2.2 Checks on Host Control Registers, MSRs, and SSP
// 26.2.3 Checks on Host Segment and Descriptor-Table Registers
// 26.2.4 Checks Related to Address-Space Size
fn init_host_state(ctx: &mut VCpuContext) -> Result<(), VmError> {
    let vmcs = ctx.vmcs;
    let host = ctx.hv.vmx.host_state();
    // The CR0 field must not set any bit to a value not supported in VMX operation (see Section 23.8).
    vmcs.write(Field::HostCr0, host.cr0)?;
    // The CR4 field must not set any bit to a value not supported in VMX operation (see Section 23.8).
    vmcs.write(Field::HostCr4, host.cr4)?;
    vmcs.write(Field::HostCr3, host.cr3)?;

    // Load segments
    let [cs, ss, ds, es, fs, gs, tr] = host.selectors;
    vmcs.write(Field::HostCsSelector, cs as u64)?;
    vmcs.write(Field::HostSsSelector, ss as u64)?;
    vmcs.write(Field::HostDsSelector, ds as u64)?;
    vmcs.write(Field::HostEsSelector, es as u64)?;
    vmcs.write(Field::HostFsSelector, fs as u64)?;
    vmcs.write(Field::HostGsSelector, gs as u64)?;
    vmcs.write(Field::HostTrSelector, tr as u64)?;

    // Load gdt, Idt
    vmcs.write(Field::HostGdtrBase, host.gdtr_base)?;
    vmcs.write(Field::HostIdtrBase, host.idtr_base)?;

    // Load gs, fs, tr
    vmcs.write(Field::HostFsBase, host.fs_base)?;
    vmcs.write(Field::HostGsBase, host.gs_base)?;
    vmcs.write(Field::HostTrBase, host.tr_base)?;

    vmcs.write(Field::HostIa32Pat, host.pat)?;
    vmcs.write(Field::HostIa32Efer, host.efer)?;
    vmcs.write(Field::HostIa32SysenterCsMsr, 0)?;
    vmcs.write(Field::HostIa32SysenterEspMsr, 0)?;
    vmcs.write(Field::HostIa32SysenterEipMsr, 0)?;

    // Vmexit location
    vmcs.write(Field::HostRip, ctx.hv.vmx.host_rip())
}

/// Segment register image: selector, base, limit, access rights.
#[derive(Debug, Clone, Copy)]
struct Segment(u16, u64, u32, u32);

const SEG_UNUSABLE: u32 = 1 << 16;

// 26.3.1 Checks on the Guest State Area
fn init_guest_state(ctx: &mut VCpuContext) -> Result<(), VmError> {
    let vmcs = ctx.vmcs;
    let (cs, data, cr0, rip, activity) = match ctx.arch.startup {
        // Flat 4 GiB code and data, as the 32-bit boot protocol expects
        // (__BOOT_CS = 0x10, __BOOT_DS = 0x18).
        StartupState::Protected32 { entry } => (
            Segment(0x10, 0, 0xffff_ffff, 0xc09b),
            Segment(0x18, 0, 0xffff_ffff, 0xc093),
            Cr0::PE | Cr0::ET | Cr0::NE,
            entry,
            0,
        ),
        StartupState::Sipi { vector } => (
            Segment((vector as u16) << 8, (vector as u64) << 12, 0xffff, 0x9b),
            Segment(0, 0, 0xffff, 0x93),
            Cr0::ET | Cr0::NE,
            0,
            0,
        ),
        StartupState::WaitForSipi => (
            Segment(0, 0, 0xffff, 0x9b),
            Segment(0, 0, 0xffff, 0x93),
            Cr0::ET | Cr0::NE,
            0,
            ACTIVITY_WAIT_FOR_SIPI,
        ),
    };

    let segs = [
        (Field::GuestCsSelector, Field::GuestCsBase, Field::GuestCsLimit, Field::GuestCsAccessRights, cs),
        (Field::GuestSsSelector, Field::GuestSsBase, Field::GuestSsLimit, Field::GuestSsAccessRights, data),
        (Field::GuestDsSelector, Field::GuestDsBase, Field::GuestDsLimit, Field::GuestDsAccessRights, data),
        (Field::GuestEsSelector, Field::GuestEsBase, Field::GuestEsLimit, Field::GuestEsAccessRights, data),
        (Field::GuestFsSelector, Field::GuestFsBase, Field::GuestFsLimit, Field::GuestFsAccessRights, data),
        (Field::GuestGsSelector, Field::GuestGsBase, Field::GuestGsLimit, Field::GuestGsAccessRights, data),
        (
            Field::GuestTrSelector,
            Field::GuestTrBase,
            Field::GuestTrLimit,
            Field::GuestTrAccessRights,
            // Busy 32-bit TSS.
            Segment(0, 0, 0xff, 0x8b),
        ),
        (
            Field::GuestLdtrSelector,
            Field::GuestLdtrBase,
            Field::GuestLdtrLimit,
            Field::GuestLdtrAccessRights,
            Segment(0, 0, 0xffff, SEG_UNUSABLE | 0x82),
        ),
    ];
    for (sel, base, limit, ar, Segment(s, b, l, a)) in segs {
        vmcs.write(sel, s as u64)?;
        vmcs.write(base, b)?;
        vmcs.write(limit, l as u64)?;
        vmcs.write(ar, a as u64)?;
    }
    vmcs.write(Field::GuestGdtrBase, 0)?;
    vmcs.write(Field::GuestGdtrLimit, 0xffff)?;
    vmcs.write(Field::GuestIdtrBase, 0)?;
    vmcs.write(Field::GuestIdtrLimit, 0xffff)?;

    // CR4.VMXE must stay set in VMX non-root operation; the guest reads zero.
    vmcs.write(Field::GuestCr0, cr0.bits())?;
    vmcs.write(Field::Cr0ReadShadow, (cr0 & !Cr0::NE).bits())?;
    vmcs.write(Field::GuestCr3, 0)?;
    vmcs.write(Field::GuestCr4, Cr4::VMXE.bits())?;
    vmcs.write(Field::Cr4ReadShadow, 0)?;
    vmcs.write(Field::GuestIa32Efer, 0)?;
    vmcs.write(Field::GuestIa32Pat, PAT_POWER_ON_VALUE)?;
    vmcs.write(Field::GuestIa32Debugctl, 0)?;
    vmcs.write(Field::GuestDr7, 0x400)?;
    vmcs.write(Field::GuestRsp, 0)?;
    vmcs.write(Field::GuestRip, rip)?;
    vmcs.write(Field::GuestRflags, Rflags::_1.bits())?;
    vmcs.write(Field::GuestPendingDbgExceptions, 0)?;
    vmcs.write(Field::GuestIa32SysenterCsMsr, 0)?;
    vmcs.write(Field::GuestIa32SysenterEspMsr, 0)?;
    vmcs.write(Field::GuestIa32SysenterEipMsr, 0)?;
    vmcs.write(Field::GuestInterruptibilityState, 0)?;
    vmcs.write(Field::GuestActivityState, activity)?;
    // If the “VMCS shadowing” VM-execution control is 0, the link pointer must be all ones.
    vmcs.write(Field::GuestLinkPointer, u64::MAX)?;
    vmcs.write(Field::GuestPreemptionTimerValue, u32::MAX as u64)?;

    ctx.arch.msrs.pat = PAT_POWER_ON_VALUE;
    ctx.invalidate();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::Harness;

    #[test]
    fn protected_mode_bsp() {
        let h = Harness::new();
        let vm = h.vm(0);
        h.with_vcpu(&vm, 0, |ctx| {
            ctx.arch.startup = StartupState::Protected32 { entry: 0x100_0000 };
            init_vmcs(ctx).unwrap();
            assert_eq!(ctx.rip().unwrap(), 0x100_0000);
            assert_eq!(ctx.vmcs.read(Field::GuestCsSelector).unwrap(), 0x10);
            assert_eq!(ctx.vmcs.read(Field::Cr0ReadShadow).unwrap(), 0x11);
            assert_eq!(ctx.vmcs.read(Field::GuestLinkPointer).unwrap(), u64::MAX);
            let eptp = ctx.vm.ept.read().eptp();
            assert_eq!(ctx.vmcs.read(Field::Eptptr).unwrap(), eptp);
            let ctl2 = ctx.vmcs.read(Field::SecondaryVmexecControls).unwrap() as u32;
            assert!(VmcsProcBasedSecondaryVmexecCtl::from_bits_truncate(ctl2)
                .contains(VmcsProcBasedSecondaryVmexecCtl::ENABLE_EPT
                    | VmcsProcBasedSecondaryVmexecCtl::UNRESTRICTED_GUEST));
        });
    }

    #[test]
    fn startup_ipi_real_mode() {
        let h = Harness::new();
        let vm = h.vm(0);
        h.with_vcpu(&vm, 1, |ctx| {
            ctx.arch.startup = StartupState::Sipi { vector: 0x9f };
            init_vmcs(ctx).unwrap();
            assert_eq!(ctx.vmcs.read(Field::GuestCsSelector).unwrap(), 0x9f00);
            assert_eq!(ctx.vmcs.read(Field::GuestCsBase).unwrap(), 0x9_f000);
            assert_eq!(ctx.rip().unwrap(), 0);
            assert_eq!(ctx.cr0().unwrap() & Cr0::PE.bits(), 0);
            assert_eq!(ctx.vmcs.read(Field::GuestActivityState).unwrap(), 0);
        });
    }
}
