//! Virtual CPU.
//!
//! A [`VCpu`] is split in two halves:
//! * the shared half (state, request bits, the vLAPIC) is touched by any
//!   pCPU through atomics;
//! * [`VCpuArch`] holds the VMCS and the register context and is only locked
//!   by the pCPU the vCPU is pinned to, or by the lifecycle code while the
//!   vCPU is known not to run.
//!
//! Handlers see both through a [`VCpuContext`].

use crate::{
    config::VmId,
    hv::Hypervisor,
    vcpuid::CpuidCache,
    vlapic::VLapic,
    vm::Vm,
    vmsr::{GuestMsrs, MsrBitmap},
    vmx::vmcs::{ActiveVmcs, Field, Vmcs},
    VmError,
};
use abyss::{
    interrupt::GeneralPurposeRegisters,
    x86_64::{Cr0, Efer},
};
use alloc::boxed::Box;
use core::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicU8, Ordering};
use spin_lock::{SpinLock, SpinLockGuard};

/// Index of the normal world context.
pub const NORMAL_WORLD: usize = 0;
/// Index of the secure world context.
pub const SECURE_WORLD: usize = 1;

/// The state of a vCPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, num_enum::TryFromPrimitive, num_enum::IntoPrimitive)]
#[repr(u8)]
pub enum VCpuState {
    /// Created, waiting for its start.
    Init,
    Running,
    Paused,
    /// Stopped for good, its pCPU not yet released.
    Zombie,
    Offline,
}

bitflags::bitflags! {
    /// Requests posted to a vCPU, served before its next VM entry.
    pub struct VCpuRequest: u64 {
        /// Deliver the queued exception.
        const EXCP = 1 << 0;
        /// Deliver pending vLAPIC interrupts.
        const EVENT = 1 << 1;
        /// Deliver a pending vPIC interrupt.
        const EXTINT = 1 << 2;
        const NMI = 1 << 3;
        /// Invalidate the EPT derived translations.
        const EPT_FLUSH = 1 << 4;
        /// The guest triple faulted.
        const TRP_FAULT = 1 << 5;
        /// Drain the passthrough interrupt queue of the VM.
        const SOFTIRQ = 1 << 6;
        /// (Re-)initialize the VMCS before entering.
        const INIT_VMCS = 1 << 7;
    }
}

/// Execution mode of the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuMode {
    Real,
    Protected,
    Compatibility,
    Long,
}

/// Where the vCPU starts when its VMCS is initialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupState {
    /// 32-bit protected mode with flat segments, paging off.
    Protected32 { entry: u64 },
    /// Real mode at `vector << 12`, as after a STARTUP IPI.
    Sipi { vector: u8 },
    /// Halted until a STARTUP IPI arrives.
    WaitForSipi,
}

/// An exception waiting for injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingException {
    pub vector: u8,
    pub error_code: Option<u32>,
}

bitflags::bitflags! {
    /// Registers of a [`RunContext`] living in the VMCS.
    pub struct RegCache: u32 {
        const RIP = 1 << 0;
        const RSP = 1 << 1;
        const RFLAGS = 1 << 2;
        const CR0 = 1 << 3;
        const CR3 = 1 << 4;
        const CR4 = 1 << 5;
        const EFER = 1 << 6;
    }
}

/// Register context of one world.
///
/// GPRs are saved by the exit stub. The rest is read from the VMCS on first
/// use after an exit and written back before the next entry when dirty.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub gprs: GeneralPurposeRegisters,
    rip: u64,
    rsp: u64,
    rflags: u64,
    cr0: u64,
    cr3: u64,
    cr4: u64,
    efer: u64,
    cached: RegCache,
    dirty: RegCache,
}

impl Default for RegCache {
    fn default() -> Self {
        Self::empty()
    }
}

/// The part of a vCPU owned by its pCPU.
pub struct VCpuArch {
    pub vmcs: Box<Vmcs>,
    /// VMLAUNCH succeeded since the last VMCLEAR.
    pub launched: bool,
    pub contexts: [RunContext; 2],
    pub cur_context: usize,
    pub startup: StartupState,
    pub exception: Option<PendingException>,
    /// The handler asked not to move RIP past the exiting instruction.
    pub retain_rip: bool,
    pub cpuid: CpuidCache,
    pub msrs: GuestMsrs,
    pub msr_bitmap: Box<MsrBitmap>,
    /// Number of exits handled.
    pub nr_exits: u64,
}

impl VCpuArch {
    pub fn new(vmcs: Box<Vmcs>, cpuid: CpuidCache, msr_bitmap: Box<MsrBitmap>, startup: StartupState) -> Self {
        Self {
            vmcs,
            launched: false,
            contexts: [RunContext::default(), RunContext::default()],
            cur_context: NORMAL_WORLD,
            startup,
            exception: None,
            retain_rip: false,
            cpuid,
            msrs: GuestMsrs::default(),
            msr_bitmap,
            nr_exits: 0,
        }
    }

    /// The context of the current world.
    #[inline]
    pub fn context(&mut self) -> &mut RunContext {
        &mut self.contexts[self.cur_context]
    }

    /// Forget everything the previous run left behind.
    pub fn reset(&mut self, startup: StartupState) {
        self.launched = false;
        self.contexts = [RunContext::default(), RunContext::default()];
        self.cur_context = NORMAL_WORLD;
        self.startup = startup;
        self.exception = None;
        self.retain_rip = false;
        self.msrs = GuestMsrs::default();
    }
}

const NO_SIPI: u16 = 0xffff;

/// Virtual cpu.
pub struct VCpu {
    pub vcpu_id: u16,
    pub pcpu_id: usize,
    pub vm_id: VmId,
    state: AtomicU8,
    paused_from: AtomicU8,
    requests: AtomicU64,
    running: AtomicBool,
    sipi_vector: AtomicU16,
    pub vlapic: VLapic,
    arch: SpinLock<VCpuArch>,
}

impl VCpu {
    pub fn new(vm_id: VmId, vcpu_id: u16, pcpu_id: usize, vlapic: VLapic, arch: VCpuArch) -> Self {
        Self {
            vcpu_id,
            pcpu_id,
            vm_id,
            state: AtomicU8::new(VCpuState::Init.into()),
            paused_from: AtomicU8::new(VCpuState::Init.into()),
            requests: AtomicU64::new(VCpuRequest::INIT_VMCS.bits()),
            running: AtomicBool::new(false),
            sipi_vector: AtomicU16::new(NO_SIPI),
            vlapic,
            arch: SpinLock::new(arch),
        }
    }

    /// Whether this is the bootstrap processor of its VM.
    #[inline]
    pub fn is_bsp(&self) -> bool {
        self.vcpu_id == 0
    }

    pub fn state(&self) -> VCpuState {
        VCpuState::try_from(self.state.load(Ordering::Acquire)).unwrap_or(VCpuState::Offline)
    }

    pub fn set_state(&self, s: VCpuState) {
        self.state.store(s.into(), Ordering::Release);
    }

    /// Stop the vCPU at its next exit. The state it left is restored by
    /// [`VCpu::resume`].
    pub fn pause(&self) {
        let prev = self.state.swap(VCpuState::Paused.into(), Ordering::AcqRel);
        if prev != u8::from(VCpuState::Paused) {
            self.paused_from.store(prev, Ordering::Release);
        }
    }

    /// Undo [`VCpu::pause`].
    pub fn resume(&self) {
        let back = self.paused_from.load(Ordering::Acquire);
        let _ = self.state.compare_exchange(
            VCpuState::Paused.into(),
            back,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Post `req`. The owner serves it before its next entry.
    #[inline]
    pub fn make_request(&self, req: VCpuRequest) {
        self.requests.fetch_or(req.bits(), Ordering::AcqRel);
    }

    /// Consume `req`.
    #[inline]
    pub fn take_request(&self, req: VCpuRequest) -> bool {
        self.requests.fetch_and(!req.bits(), Ordering::AcqRel) & req.bits() != 0
    }

    #[inline]
    pub fn has_request(&self, req: VCpuRequest) -> bool {
        self.requests.load(Ordering::Acquire) & req.bits() != 0
    }

    pub fn requests(&self) -> VCpuRequest {
        VCpuRequest::from_bits_truncate(self.requests.load(Ordering::Acquire))
    }

    pub(crate) fn clear_requests(&self) {
        self.requests.store(0, Ordering::Release);
    }

    /// Whether the vCPU is between entering the guest and finishing the exit
    /// handling.
    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    /// Record a STARTUP IPI for this vCPU.
    pub fn post_sipi(&self, vector: u8) {
        self.sipi_vector.store(vector as u16, Ordering::Release);
    }

    /// Take the recorded STARTUP vector.
    pub fn take_sipi(&self) -> Option<u8> {
        match self.sipi_vector.swap(NO_SIPI, Ordering::AcqRel) {
            NO_SIPI => None,
            v => Some(v as u8),
        }
    }

    /// Lock the pCPU-owned half.
    pub fn arch(&self) -> SpinLockGuard<'_, VCpuArch> {
        self.arch.lock()
    }
}

impl core::fmt::Debug for VCpu {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VCpu")
            .field("vm_id", &self.vm_id)
            .field("vcpu_id", &self.vcpu_id)
            .field("pcpu_id", &self.pcpu_id)
            .field("state", &self.state())
            .finish()
    }
}

/// Everything an exit handler works on.
pub struct VCpuContext<'a> {
    pub hv: &'a Hypervisor,
    pub vm: &'a Vm,
    pub vcpu: &'a VCpu,
    pub arch: &'a mut VCpuArch,
    pub vmcs: ActiveVmcs<'a>,
}

macro_rules! cached_reg {
    ($get:ident, $set:ident, $reg:ident, $bit:ident, $field:ident) => {
        #[doc = concat!("Guest `", stringify!($reg), "`.")]
        pub fn $get(&mut self) -> Result<u64, VmError> {
            let vmcs = self.vmcs;
            let c = self.arch.context();
            if !c.cached.contains(RegCache::$bit) {
                c.$reg = vmcs.read(Field::$field)?;
                c.cached |= RegCache::$bit;
            }
            Ok(c.$reg)
        }

        #[doc = concat!("Set guest `", stringify!($reg), "`; written back before the next entry.")]
        pub fn $set(&mut self, v: u64) {
            let c = self.arch.context();
            c.$reg = v;
            c.cached |= RegCache::$bit;
            c.dirty |= RegCache::$bit;
        }
    };
}

impl<'a> VCpuContext<'a> {
    /// General purpose registers of the current world.
    #[inline]
    pub fn gprs(&mut self) -> &mut GeneralPurposeRegisters {
        &mut self.arch.context().gprs
    }

    cached_reg!(rip, set_rip, rip, RIP, GuestRip);
    cached_reg!(rsp, set_rsp, rsp, RSP, GuestRsp);
    cached_reg!(rflags, set_rflags, rflags, RFLAGS, GuestRflags);
    cached_reg!(cr0, set_cr0, cr0, CR0, GuestCr0);
    cached_reg!(cr3, set_cr3, cr3, CR3, GuestCr3);
    cached_reg!(cr4, set_cr4, cr4, CR4, GuestCr4);
    cached_reg!(efer, set_efer, efer, EFER, GuestIa32Efer);

    /// Read a GPR by its x86 encoding, rsp included.
    pub fn reg(&mut self, idx: usize) -> Result<u64, VmError> {
        match idx {
            4 => self.rsp(),
            i => self
                .gprs()
                .get(i)
                .map(|v| v as u64)
                .ok_or(VmError::VCpuError("invalid register index")),
        }
    }

    /// Write a GPR by its x86 encoding, rsp included.
    pub fn set_reg(&mut self, idx: usize, v: u64) -> Result<(), VmError> {
        match idx {
            4 => {
                self.set_rsp(v);
                Ok(())
            }
            i if self.gprs().set(i, v as usize) => Ok(()),
            _ => Err(VmError::VCpuError("invalid register index")),
        }
    }

    /// Write the dirty registers back to the VMCS.
    pub fn flush(&mut self) -> Result<(), VmError> {
        let vmcs = self.vmcs;
        let c = self.arch.context();
        let pairs = [
            (RegCache::RIP, Field::GuestRip, c.rip),
            (RegCache::RSP, Field::GuestRsp, c.rsp),
            (RegCache::RFLAGS, Field::GuestRflags, c.rflags),
            (RegCache::CR0, Field::GuestCr0, c.cr0),
            (RegCache::CR3, Field::GuestCr3, c.cr3),
            (RegCache::CR4, Field::GuestCr4, c.cr4),
            (RegCache::EFER, Field::GuestIa32Efer, c.efer),
        ];
        for (bit, field, v) in pairs {
            if c.dirty.contains(bit) {
                vmcs.write(field, v)?;
            }
        }
        c.dirty = RegCache::empty();
        Ok(())
    }

    /// Drop the cached registers; the guest ran since they were read.
    pub fn invalidate(&mut self) {
        let c = self.arch.context();
        c.cached = RegCache::empty();
        c.dirty = RegCache::empty();
    }

    /// Execution mode derived from CR0, EFER and the CS access rights.
    pub fn cpu_mode(&mut self) -> Result<CpuMode, VmError> {
        let cr0 = Cr0::from_bits_truncate(self.cr0()?);
        let efer = Efer::from_bits_truncate(self.efer()?);
        Ok(if !cr0.contains(Cr0::PE) {
            CpuMode::Real
        } else if efer.contains(Efer::LMA) {
            // CS.L
            if self.vmcs.read(Field::GuestCsAccessRights)? & (1 << 13) != 0 {
                CpuMode::Long
            } else {
                CpuMode::Compatibility
            }
        } else {
            CpuMode::Protected
        })
    }

    /// Keep RIP on the exiting instruction.
    #[inline]
    pub fn retain_rip(&mut self) {
        self.arch.retain_rip = true;
    }

    /// Move RIP past the exiting instruction.
    pub fn forward_rip(&mut self) -> Result<(), VmError> {
        let len = self.vmcs.read(Field::VmexitInstructionLength)?;
        let rip = self.rip()?;
        self.set_rip(rip.wrapping_add(len));
        Ok(())
    }

    /// Privilege level of the guest code that exited.
    pub fn cpl(&self) -> Result<u8, VmError> {
        // SS.DPL
        Ok(((self.vmcs.read(Field::GuestSsAccessRights)? >> 5) & 3) as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pause_and_resume_restore_state() {
        let vcpu = crate::tests::standalone_vcpu();
        vcpu.set_state(VCpuState::Running);
        vcpu.pause();
        vcpu.pause();
        assert_eq!(vcpu.state(), VCpuState::Paused);
        vcpu.resume();
        assert_eq!(vcpu.state(), VCpuState::Running);
    }

    #[test]
    fn requests_and_sipi() {
        let vcpu = crate::tests::standalone_vcpu();
        assert!(vcpu.take_request(VCpuRequest::INIT_VMCS));
        vcpu.make_request(VCpuRequest::EVENT | VCpuRequest::EPT_FLUSH);
        assert!(vcpu.take_request(VCpuRequest::EPT_FLUSH));
        assert_eq!(vcpu.requests(), VCpuRequest::EVENT);
        assert_eq!(vcpu.take_sipi(), None);
        vcpu.post_sipi(0x9d);
        assert_eq!(vcpu.take_sipi(), Some(0x9d));
        assert_eq!(vcpu.take_sipi(), None);
    }
}
