//! Flags and MSRs for VMX capabilities.

use abyss::platform::Platform;

// VMX Capability MSRs
/// MSR - IA32_VMX_BASIC
pub const IA32_VMX_BASIC: u32 = 0x480;
/// MSR - IA32_VMX_PINBASED_CTLS.
pub const IA32_VMX_PINBASED_CTLS: u32 = 0x481;
/// MSR - IA32_VMX_PROC_BASED_CTLS.
pub const IA32_VMX_PROC_BASED_CTLS: u32 = 0x482;
/// MSR - IA32_VMX_EXIT_CTLS.
pub const IA32_VMX_EXIT_CTLS: u32 = 0x483;
/// MSR - IA32_VMX_ENTRY_CTLS.
pub const IA32_VMX_ENTRY_CTLS: u32 = 0x484;
/// MSR - IA32_VMX_MISC.
pub const IA32_VMX_MISC: u32 = 0x485;
/// MSR - IA32_VMX_CR0_FIXED0.
pub const IA32_VMX_CR0_FIXED0: u32 = 0x486;
/// MSR - IA32_VMX_CR0_FIXED1.
pub const IA32_VMX_CR0_FIXED1: u32 = 0x487;
/// MSR - IA32_VMX_CR4_FIXED0.
pub const IA32_VMX_CR4_FIXED0: u32 = 0x488;
/// MSR - IA32_VMX_CR4_FIXED1.
pub const IA32_VMX_CR4_FIXED1: u32 = 0x489;
/// MSR - IA32_VMX_PROC_BASED_CTLS2.
pub const IA32_VMX_PROC_BASED_CTLS2: u32 = 0x48B;
/// MSR - IA32_VMX_EPT_VPID_CAP.
pub const IA32_VMX_EPT_VPID_CAP: u32 = 0x48C;
/// MSR - IA32_FEATURE_CONTROL.
pub const IA32_FEATURE_CONTROL: u32 = 0x03A;

bitflags::bitflags! {
    /// Table 24-5. Definitions of Pin-Based VM-Execution Controls.
    pub struct VmcsPinBasedVmexecCtl: u32 {
        /// If this control is 1, external interrupts cause VM exits.
        const EXTERNAL_INTERRUPT_EXITING = 1 << 0;
        /// If this control is 1, non-maskable interrupts (NMIs) cause VM exits.
        const NMI_EXITING = 1 << 3;
        /// If this control is 1, NMIs are never blocked and the “blocking by NMI” bit indicates “virtual-NMI blocking”.
        const VIRTUAL_NMIS = 1 << 5;
        /// If this control is 1, the VMX-preemption timer counts down in VMX non-root operation.
        const ACTIVE_VMX_PREEMPTION_TIMER = 1 << 6;
        /// If this control is 1, the processor treats interrupts with the posted-interrupt notification vector specially.
        const PROCESS_POSTED_INTERRUPT = 1 << 7;
    }
}

bitflags::bitflags! {
    /// Table 24-6. Definitions of Primary Processor-Based VM-Execution Controls.
    pub struct VmcsProcBasedVmexecCtl: u32 {
        /// If this control is 1, a VM exit occurs at the beginning of any instruction if RFLAGS.IF = 1 and
        /// there are no other blocking of interrupts.
        const INTRWINEXIT = 1 << 2;
        /// This control determines whether executions of RDTSC are offset.
        const USETSCOFF = 1 << 3;
        /// This control determines whether executions of HLT cause VM exits.
        const HLT_EXITING = 1 << 7;
        /// This control determines whether executions of INVLPG cause VM exits.
        const INVLPGEXIT = 1 << 9;
        /// This control determines whether executions of MWAIT cause VM exits.
        const MWAITEXIT = 1 << 10;
        /// This control determines whether executions of RDPMC cause VM exits.
        const RDPMCEXIT = 1 << 11;
        /// This control determines whether executions of RDTSC cause VM exits.
        const RDTSCEXIT = 1 << 12;
        /// MOV to CR3 exits.
        const CR3LOADEXIT = 1 << 15;
        /// MOV from CR3 exits.
        const CR3STOREXIT = 1 << 16;
        /// MOV to CR8 exits.
        const CR8LOADEXIT = 1 << 19;
        /// MOV from CR8 exits.
        const CR8STOREEXIT = 1 << 20;
        /// Setting this control to 1 enables TPR virtualization.
        const USETPRSHADOW = 1 << 21;
        /// If this control is 1, a VM exit occurs at the beginning of any instruction if there is no virtual NMI blocking.
        const NMIWINEXIT = 1 << 22;
        /// This control determines whether executions of MOV DR cause VM exits.
        const MOVDREXIT = 1 << 23;
        /// This control determines whether executions of I/O instructions cause VM exits.
        const UNCONDIOEXIT = 1 << 24;
        /// This control determines whether I/O bitmaps are used to restrict executions of I/O instructions.
        const USEIOBMP = 1 << 25;
        /// If this control is 1, the monitor trap flag debugging feature is enabled.
        const MTF = 1 << 27;
        /// This control determines whether MSR bitmaps are used to control execution of the RDMSR and WRMSR instructions.
        const USEMSRBMP = 1 << 28;
        /// This control determines whether executions of MONITOR cause VM exits.
        const MONITOREXIT = 1 << 29;
        /// This control determines whether executions of PAUSE cause VM exits.
        const PAUSEEXIT = 1 << 30;
        /// This control determines whether the secondary processor-based VM-execution controls are used.
        const ACTIVATE_SECONDARY_CTL = 1 << 31;
    }
}

bitflags::bitflags! {
    /// Table 24-7. Definitions of Secondary Processor-Based VM-Execution Controls.
    pub struct VmcsProcBasedSecondaryVmexecCtl: u32 {
        /// If this control is 1, the logical processor treats specially accesses to the page with the APIC-access address.
        const VIRTUALIZE_APIC_ACCESSES = 1 << 0;
        /// If this control is 1, extended page tables (EPT) are enabled.
        const ENABLE_EPT = 1 << 1;
        /// This control determines whether executions of LGDT, LIDT, LLDT, LTR, SGDT, SIDT, SLDT, and STR cause VM exits.
        const DESCRIPTOR_TABLE_EXITING = 1 << 2;
        /// If this control is 0, any execution of RDTSCP causes an invalid-opcode exception (#UD).
        const ENABLE_RDTSCP = 1 << 3;
        /// If this control is 1, the logical processor treats specially RDMSR and WRMSR to APIC MSRs.
        const VIRTUALIZED_X2APIC_MODE = 1 << 4;
        /// If this control is 1, cached translations of linear addresses are associated with a VPID.
        const ENABLE_VPID = 1 << 5;
        /// This control determines whether executions of WBINVD and WBNOINVD cause VM exits.
        const WBINVD_EXITING = 1 << 6;
        /// This control determines whether guest software may run in unpaged protected mode or in real-address mode.
        const UNRESTRICTED_GUEST = 1 << 7;
        /// If this control is 1, the logical processor virtualizes certain APIC accesses.
        const APIC_REGISTER_VIRTUALIZATION = 1 << 8;
        /// This controls enables the evaluation and delivery of pending virtual interrupts.
        const VIRTUAL_INTERRUPT_DELIVERY = 1 << 9;
        /// This control determines whether a series of executions of PAUSE can cause a VM exit.
        const PAUSE_LOOP_EXITING = 1 << 10;
        /// If this control is 0, any execution of INVPCID causes a #UD.
        const ENABLE_INVPCID = 1 << 12;
        /// If this control is 0, any execution of XSAVES or XRSTORS causes a #UD.
        const ENABLE_XSAVES_XRSTORS = 1 << 20;
    }
}

bitflags::bitflags! {
    /// Table 24-13. Definitions of VM-Entry Controls.
    pub struct VmcsEntryCtl: u32 {
        /// This control determines whether DR7 and the IA32_DEBUGCTL MSR are loaded on VM entry.
        const LOAD_DEBUG_CTL = 1 << 2;
        /// On processors that support Intel 64 architecture, this control determines whether the logical processor is in IA-32e
        /// mode after VM entry.
        const IA32E_MODE_GUEST = 1 << 9;
        /// This control determines whether the IA32_PAT MSR is loaded on VM entry.
        const LOAD_IA32_PAT = 1 << 14;
        /// This control determines whether the IA32_EFER MSR is loaded on VM entry.
        const LOAD_IA32_EFER = 1 << 15;
    }
}

bitflags::bitflags! {
    /// Table 24-11. Definitions of Primary VM-Exit Controls.
    pub struct VmcsExitCtl: u32 {
        /// This control determines whether DR7 and the IA32_DEBUGCTL MSR are saved on VM exit.
        const SAVE_DEBUG_CTLS = 1 << 2;
        /// On processors that support Intel 64 architecture, this control determines whether a logical processor is in 64-bit
        /// mode after the next VM exit.
        const HOST_ADDRESS_SPACE_SIZE = 1 << 9;
        /// This control affects VM exits due to external interrupts.
        const ACK_INTR_ON_EXIT = 1 << 15;
        /// This control determines whether the IA32_PAT MSR is saved on VM exit.
        const SAVE_IA32_PAT = 1 << 18;
        /// This control determines whether the IA32_PAT MSR is loaded on VM exit.
        const LOAD_IA32_PAT = 1 << 19;
        /// This control determines whether the IA32_EFER MSR is saved on VM exit.
        const SAVE_IA32_EFER = 1 << 20;
        /// This control determines whether the IA32_EFER MSR is loaded on VM exit.
        const LOAD_IA32_EFER = 1 << 21;
        /// This control determines whether the value of the VMX-preemption timer is saved on VM exit.
        const SAVE_VMX_PREEMPTION_TIMER_VALUE = 1 << 22;
    }
}

/// Resolve the value of a control field from its capability MSR.
///
/// The low doubleword of the capability MSR holds the bits that must be one
/// and the high doubleword the bits that may be one. Bits in `wanted` are
/// added to the required ones and the result is limited to what the
/// processor supports.
pub fn adjust_controls(p: &dyn Platform, cap_msr: u32, wanted: u32) -> u32 {
    let cap = p.rdmsr(cap_msr);
    let (supported, required) = ((cap >> 32) as u32, cap as u32);
    (required | wanted) & supported
}

/// Whether bit `bit` of the allowed-1 half of `cap_msr` is set.
pub fn is_supported(p: &dyn Platform, cap_msr: u32, bit: u32) -> bool {
    p.rdmsr(cap_msr) >> 32 & (1 << bit) != 0
}

/// Bits 5:0 of IA32_VMX_MISC: the preemption timer counts down by one every
/// `1 << rate` TSC ticks.
pub fn preemption_timer_rate(p: &dyn Platform) -> u32 {
    (p.rdmsr(IA32_VMX_MISC) & 0x1f) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use abyss::mock::MockPlatform;

    #[test]
    fn controls_follow_capabilities() {
        let p = MockPlatform::new();
        // Bit 1 required, bits 1..=7 allowed.
        p.set_msr(IA32_VMX_PINBASED_CTLS, (0xfe << 32) | 0x2);
        let v = adjust_controls(
            &p,
            IA32_VMX_PINBASED_CTLS,
            (VmcsPinBasedVmexecCtl::EXTERNAL_INTERRUPT_EXITING
                | VmcsPinBasedVmexecCtl::ACTIVE_VMX_PREEMPTION_TIMER)
                .bits(),
        );
        assert_eq!(v, 0x2 | (1 << 6));
        assert!(is_supported(&p, IA32_VMX_PINBASED_CTLS, 6));
        assert!(!is_supported(&p, IA32_VMX_PINBASED_CTLS, 0));
    }
}
