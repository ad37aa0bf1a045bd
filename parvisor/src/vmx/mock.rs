//! A VMX backend replaying scripted VM exits.
//!
//! Each VMCS gets its own field store and exit script. Entering a VMCS with
//! an empty script produces a HLT exit.

use super::{control::*, vmcs::Field, HostState, Vmx};
use crate::vmx::vmcs::InstructionError;
use abyss::{
    addressing::Pa,
    interrupt::GeneralPurposeRegisters,
    mock::MockPlatform,
    platform::CpuidResult,
    x86_64::{Cr0, Cr4},
};
use alloc::{
    collections::{BTreeMap, VecDeque},
    vec::Vec,
};
use spin_lock::SpinLock;

/// Basic exit reason of HLT.
pub const EXIT_HLT: u32 = 0xC;

/// One scripted VM exit.
#[derive(Debug, Clone, Default)]
pub struct ScriptedExit {
    reason: u32,
    qualification: u64,
    instruction_len: u64,
    guest_physical_addr: u64,
    interruption_info: u32,
    regs: Vec<(usize, usize)>,
    fields: Vec<(Field, u64)>,
    fail: Option<InstructionError>,
}

impl ScriptedExit {
    /// An exit with basic reason `reason`.
    pub fn new(reason: u32) -> Self {
        Self {
            reason,
            instruction_len: 1,
            ..Default::default()
        }
    }

    /// VM entry fails with `err` instead of exiting.
    pub fn entry_fails(err: InstructionError) -> Self {
        Self {
            fail: Some(err),
            ..Default::default()
        }
    }

    pub fn qualification(mut self, q: u64) -> Self {
        self.qualification = q;
        self
    }

    pub fn instruction_len(mut self, len: u64) -> Self {
        self.instruction_len = len;
        self
    }

    pub fn guest_physical_addr(mut self, gpa: u64) -> Self {
        self.guest_physical_addr = gpa;
        self
    }

    pub fn interruption_info(mut self, info: u32) -> Self {
        self.interruption_info = info;
        self
    }

    /// The guest left `v` in register `idx` (x86 encoding).
    pub fn reg(mut self, idx: usize, v: usize) -> Self {
        self.regs.push((idx, v));
        self
    }

    /// The guest left `v` in a VMCS guest-state field.
    pub fn field(mut self, f: Field, v: u64) -> Self {
        self.fields.push((f, v));
        self
    }
}

/// Mock VMX.
pub struct MockVmx {
    cr0: u64,
    cr4: SpinLock<u64>,
    /// VMXON regions, one per pCPU in VMX operation.
    vmxon: SpinLock<Vec<Pa>>,
    fields: SpinLock<BTreeMap<(usize, Field), u64>>,
    scripts: SpinLock<BTreeMap<usize, VecDeque<ScriptedExit>>>,
    entries: SpinLock<Vec<(Pa, bool)>>,
    injected: SpinLock<Vec<(Pa, u32)>>,
    invepts: SpinLock<Vec<u64>>,
}

impl MockVmx {
    /// A processor in long mode with VMX available.
    pub fn new() -> Self {
        Self {
            cr0: (Cr0::PE | Cr0::MP | Cr0::ET | Cr0::NE | Cr0::WP | Cr0::PG).bits(),
            cr4: SpinLock::new((Cr4::PAE | Cr4::PGE | Cr4::OSFXSR).bits()),
            vmxon: SpinLock::new(Vec::new()),
            fields: SpinLock::new(BTreeMap::new()),
            scripts: SpinLock::new(BTreeMap::new()),
            entries: SpinLock::new(Vec::new()),
            injected: SpinLock::new(Vec::new()),
            invepts: SpinLock::new(Vec::new()),
        }
    }

    /// Whether VMXON succeeded.
    pub fn is_on(&self) -> bool {
        !self.vmxon.lock().is_empty()
    }

    /// Regions that VMXON succeeded on.
    pub fn vmxon_regions(&self) -> Vec<Pa> {
        self.vmxon.lock().clone()
    }

    /// Queue an exit for the next entry into `vmcs`.
    pub fn script(&self, vmcs: Pa, exit: ScriptedExit) {
        self.scripts
            .lock()
            .entry(vmcs.into_usize())
            .or_default()
            .push_back(exit);
    }

    /// Number of exits still queued for `vmcs`.
    pub fn pending_script(&self, vmcs: Pa) -> usize {
        self.scripts
            .lock()
            .get(&vmcs.into_usize())
            .map_or(0, |q| q.len())
    }

    /// Read a field without going through the trait.
    pub fn field(&self, vmcs: Pa, f: Field) -> u64 {
        self.fields
            .lock()
            .get(&(vmcs.into_usize(), f))
            .copied()
            .unwrap_or(0)
    }

    /// VM entries so far, with the launched flag they used.
    pub fn entries(&self) -> Vec<(Pa, bool)> {
        self.entries.lock().clone()
    }

    /// Events delivered on VM entry into `vmcs`, as interruption information.
    pub fn injected(&self, vmcs: Pa) -> Vec<u32> {
        self.injected
            .lock()
            .iter()
            .filter(|(pa, _)| *pa == vmcs)
            .map(|(_, info)| *info)
            .collect()
    }

    /// EPTPs passed to INVEPT.
    pub fn invepts(&self) -> Vec<u64> {
        self.invepts.lock().clone()
    }
}

impl Default for MockVmx {
    fn default() -> Self {
        Self::new()
    }
}

impl Vmx for MockVmx {
    fn enable_vmxe(&self) -> (u64, u64) {
        let mut cr4 = self.cr4.lock();
        *cr4 |= Cr4::VMXE.bits();
        (self.cr0, *cr4)
    }

    fn vmxon(&self, region: Pa) -> Result<(), InstructionError> {
        let mut on = self.vmxon.lock();
        if on.contains(&region) {
            return Err(InstructionError::VmxonInVmxRoot);
        }
        on.push(region);
        Ok(())
    }

    fn vmclear(&self, _vmcs: Pa) -> Result<(), InstructionError> {
        Ok(())
    }

    fn vmptrld(&self, vmcs: Pa) -> Result<(), InstructionError> {
        if vmcs.into_usize() & 0xfff != 0 {
            Err(InstructionError::VmPtrLdWithInvAddr)
        } else {
            Ok(())
        }
    }

    fn vmread(&self, vmcs: Pa, field: Field) -> Result<u64, InstructionError> {
        Ok(self.field(vmcs, field))
    }

    fn vmwrite(&self, vmcs: Pa, field: Field, value: u64) -> Result<(), InstructionError> {
        self.fields.lock().insert((vmcs.into_usize(), field), value);
        Ok(())
    }

    unsafe fn vmentry(
        &self,
        vmcs: Pa,
        gprs: &mut GeneralPurposeRegisters,
        launched: bool,
    ) -> Result<(), InstructionError> {
        self.entries.lock().push((vmcs, launched));
        let exit = self
            .scripts
            .lock()
            .get_mut(&vmcs.into_usize())
            .and_then(|q| q.pop_front())
            .unwrap_or_else(|| ScriptedExit::new(EXIT_HLT));
        if let Some(err) = exit.fail {
            return Err(err);
        }

        let mut fields = self.fields.lock();
        let key = |f| (vmcs.into_usize(), f);
        let info = fields
            .get(&key(Field::VmentryInterruptionInfo))
            .copied()
            .unwrap_or(0) as u32;
        if info & (1 << 31) != 0 {
            self.injected.lock().push((vmcs, info));
            fields.insert(key(Field::VmentryInterruptionInfo), 0);
        }
        fields.insert(key(Field::VmexitReason), exit.reason as u64);
        fields.insert(key(Field::VmexitQualification), exit.qualification);
        fields.insert(key(Field::VmexitInstructionLength), exit.instruction_len);
        fields.insert(key(Field::GuestPhysicalAddr), exit.guest_physical_addr);
        fields.insert(key(Field::VmexitInterruptionInfo), exit.interruption_info as u64);
        for (f, v) in exit.fields {
            fields.insert(key(f), v);
        }
        for (idx, v) in exit.regs {
            gprs.set(idx, v);
        }
        Ok(())
    }

    fn invept(&self, eptp: u64) -> Result<(), InstructionError> {
        self.invepts.lock().push(eptp);
        Ok(())
    }

    fn host_state(&self) -> HostState {
        HostState {
            cr0: self.cr0,
            cr4: *self.cr4.lock(),
            selectors: [0x8, 0x10, 0x10, 0x10, 0x10, 0x10, 0x28],
            ..Default::default()
        }
    }

    fn host_rip(&self) -> u64 {
        0
    }
}

/// Script `p` as a processor supporting VMX with EPT and every control.
pub fn vmx_capable(p: &MockPlatform) {
    p.set_cpuid(
        1,
        0,
        CpuidResult {
            ecx: 1 << 5,
            ..Default::default()
        },
    );
    p.set_msr(IA32_VMX_BASIC, 1);
    p.set_msr(IA32_VMX_MISC, 5);
    for msr in [
        IA32_VMX_PINBASED_CTLS,
        IA32_VMX_PROC_BASED_CTLS,
        IA32_VMX_PROC_BASED_CTLS2,
        IA32_VMX_EXIT_CTLS,
        IA32_VMX_ENTRY_CTLS,
    ] {
        p.set_msr(msr, 0xffff_ffff << 32);
    }
    p.set_msr(IA32_VMX_CR0_FIXED0, (Cr0::PE | Cr0::NE | Cr0::PG).bits());
    p.set_msr(IA32_VMX_CR0_FIXED1, 0xffff_ffff);
    p.set_msr(IA32_VMX_CR4_FIXED0, Cr4::VMXE.bits());
    p.set_msr(IA32_VMX_CR4_FIXED1, 0xff_ffff);
}
