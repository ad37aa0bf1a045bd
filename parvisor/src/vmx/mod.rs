//! VMX operation.
//!
//! The VMX instructions are reached through the [`Vmx`] trait. The native
//! backend in [`native`] executes them; [`mock`] replays scripted VM exits for
//! tests.

pub mod control;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
#[cfg(target_arch = "x86_64")]
pub mod native;
pub mod setup;
pub mod vmcs;

use crate::VmxError;
use abyss::{
    addressing::Pa,
    interrupt::GeneralPurposeRegisters,
    platform::Platform,
    x86_64::{Cr0, Cr4},
};
use control::*;
use vmcs::{InstructionError, Vmcs};

/// Host register image programmed into the host-state area of every VMCS.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostState {
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    /// cs, ss, ds, es, fs, gs and tr selectors.
    pub selectors: [u16; 7],
    pub fs_base: u64,
    pub gs_base: u64,
    pub tr_base: u64,
    pub gdtr_base: u64,
    pub idtr_base: u64,
    pub efer: u64,
    pub pat: u64,
}

/// The VMX instruction set.
///
/// Every method that names a VMCS expects that VMCS to be current on the
/// calling pCPU (see [`Vmcs::activate`]).
pub trait Vmx: Send + Sync {
    /// Set CR4.VMXE and return the resulting (CR0, CR4).
    fn enable_vmxe(&self) -> (u64, u64);

    /// Enter VMX operation with the VMXON region at `region`.
    fn vmxon(&self, region: Pa) -> Result<(), InstructionError>;

    /// Clear the VMCS at `vmcs`.
    fn vmclear(&self, vmcs: Pa) -> Result<(), InstructionError>;

    /// Make the VMCS at `vmcs` current.
    fn vmptrld(&self, vmcs: Pa) -> Result<(), InstructionError>;

    /// Read a field of the current VMCS.
    fn vmread(&self, vmcs: Pa, field: vmcs::Field) -> Result<u64, InstructionError>;

    /// Write a field of the current VMCS.
    fn vmwrite(&self, vmcs: Pa, field: vmcs::Field, value: u64) -> Result<(), InstructionError>;

    /// Enter the guest with `gprs` and return at its next VM exit with the
    /// guest registers saved back into `gprs`.
    ///
    /// `launched` selects VMRESUME over VMLAUNCH.
    ///
    /// # Safety
    /// The VMCS at `vmcs` must be current and fully initialized.
    unsafe fn vmentry(
        &self,
        vmcs: Pa,
        gprs: &mut GeneralPurposeRegisters,
        launched: bool,
    ) -> Result<(), InstructionError>;

    /// Invalidate single-context EPT translations derived from `eptp`.
    fn invept(&self, eptp: u64) -> Result<(), InstructionError>;

    /// The host state to return to on VM exits.
    fn host_state(&self) -> HostState;

    /// Address of the VM exit entry point.
    fn host_rip(&self) -> u64;
}

/// Enable the VM-eXtension on this cpu.
///
/// Checks the fixed CR0/CR4 bits, enables VMX outside SMX in
/// IA32_FEATURE_CONTROL if the BIOS left it unlocked, and executes VMXON on
/// `region`.
pub fn start_vmx_on_cpu(p: &dyn Platform, vmx: &dyn Vmx, region: &Vmcs) -> Result<(), VmxError> {
    // Intel® 64 and IA-32 Architectures Software Developer’s Manual.
    // 23.6 DISCOVERING SUPPORT FOR VMX
    if p.cpuid(1, 0).ecx & (1 << 5) == 0 {
        return Err(VmxError::VmxNotSupported);
    }
    if !is_supported(p, IA32_VMX_PROC_BASED_CTLS, 31)
        || !is_supported(p, IA32_VMX_PROC_BASED_CTLS2, 1)
    {
        return Err(VmxError::EptNotSupported);
    }

    // 6.2.1 Detecting and Enabling SMX
    let feature_control = p.rdmsr(IA32_FEATURE_CONTROL);
    if feature_control & (1 << 2) == 0 {
        if feature_control & 1 != 0 {
            return Err(VmxError::InvalidBiosConfig);
        }
        p.wrmsr(IA32_FEATURE_CONTROL, feature_control | (1 << 2) | 1);
    } else if feature_control & 1 == 0 {
        p.wrmsr(IA32_FEATURE_CONTROL, feature_control | 1);
    }

    let (cr0, cr4) = vmx.enable_vmxe();
    let (cr0, cr4) = (Cr0::from_bits_truncate(cr0), Cr4::from_bits_truncate(cr4));
    let (vmx_cr0_fixed_0, vmx_cr0_fixed_1, vmx_cr4_fixed_0, vmx_cr4_fixed_1) = (
        Cr0::from_bits_truncate(p.rdmsr(IA32_VMX_CR0_FIXED0)),
        Cr0::from_bits_truncate(p.rdmsr(IA32_VMX_CR0_FIXED1)),
        Cr4::from_bits_truncate(p.rdmsr(IA32_VMX_CR4_FIXED0)),
        Cr4::from_bits_truncate(p.rdmsr(IA32_VMX_CR4_FIXED1)),
    );
    // 23.8 RESTRICTIONS ON VMX OPERATION
    if (vmx_cr0_fixed_1 | cr0 != vmx_cr0_fixed_1) || !cr0 & vmx_cr0_fixed_0 != Cr0::empty() {
        return Err(VmxError::InvalidCr0);
    }
    if (vmx_cr4_fixed_1 | cr4 != vmx_cr4_fixed_1) || !cr4 & vmx_cr4_fixed_0 != Cr4::empty() {
        return Err(VmxError::InvalidCr4);
    }

    vmx.vmxon(region.pa()).map_err(VmxError::VmxOperationError)
}

/// Revision identifier for VMXON and VMCS regions.
pub fn vmcs_revision(p: &dyn Platform) -> u32 {
    p.rdmsr(IA32_VMX_BASIC) as u32 & 0x7fff_ffff
}

#[cfg(test)]
mod tests {
    use super::{mock::MockVmx, *};
    use abyss::mock::MockPlatform;

    #[test]
    fn vmx_start_checks() {
        let p = MockPlatform::new();
        let vmx = MockVmx::new();
        let region = alloc::boxed::Box::new(Vmcs::new(1));
        assert_eq!(
            start_vmx_on_cpu(&p, &vmx, &region),
            Err(VmxError::VmxNotSupported)
        );

        mock::vmx_capable(&p);
        p.set_msr(IA32_FEATURE_CONTROL, 1);
        assert_eq!(
            start_vmx_on_cpu(&p, &vmx, &region),
            Err(VmxError::InvalidBiosConfig)
        );

        p.set_msr(IA32_FEATURE_CONTROL, 0);
        p.set_msr(IA32_VMX_CR4_FIXED0, Cr4::PAE.bits() | Cr4::VMXE.bits() | Cr4::SMEP.bits());
        assert_eq!(start_vmx_on_cpu(&p, &vmx, &region), Err(VmxError::InvalidCr4));

        mock::vmx_capable(&p);
        assert_eq!(start_vmx_on_cpu(&p, &vmx, &region), Ok(()));
        assert_eq!(p.rdmsr(IA32_FEATURE_CONTROL), 0b101);
        assert!(vmx.is_on());
    }
}
