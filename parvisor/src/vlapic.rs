//! Virtual local APIC.
//!
//! Every vCPU owns one [`VLapic`]: a 4 KiB register page laid out like the
//! hardware xAPIC page (one 32-bit register every 16 bytes), a 64-byte
//! posted-interrupt descriptor and the APIC base and TSC-deadline MSRs.
//!
//! How interrupts reach the guest depends on the [`ApicvOps`] installed:
//! * [`SoftwareApicv`] keeps IRR/ISR in the page and injects through the
//!   VM-entry interruption field;
//! * [`HardwareApicv`] posts vectors to the descriptor and lets virtual
//!   interrupt delivery do the rest.

use crate::{
    config::VmId,
    hv::Hypervisor,
    vcpu::{VCpu, VCpuRequest, VCpuState},
    vm::Vm,
    vmsr::MsrBitmap,
    vmx::{
        control::{VmcsPinBasedVmexecCtl, VmcsProcBasedSecondaryVmexecCtl, VmcsProcBasedVmexecCtl},
        vmcs::{ActiveVmcs, Field, InterruptionInfo, InterruptionType},
    },
    VmError,
};
use abyss::{
    addressing::Va,
    dev::x86_64::apic::{
        ICR_DELIVERY_FIXED, ICR_DELIVERY_INIT, ICR_DELIVERY_MASK, ICR_DELIVERY_NMI,
        ICR_DELIVERY_STARTUP, ICR_DEST_LOGICAL, ICR_LEVEL_ASSERT, ICR_SHORTHAND_ALL,
        ICR_SHORTHAND_ALL_BUT_SELF, ICR_SHORTHAND_MASK, ICR_SHORTHAND_SELF, ICR_TRIGGER_LEVEL,
    },
};
use alloc::boxed::Box;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use spin_lock::SpinLock;

/// SVR: APIC software enable.
pub const DEFAULT_APIC_BASE: u64 = 0xfee0_0000;
/// IA32_APIC_BASE.BSP
pub const APICBASE_BSP: u64 = 1 << 8;
/// IA32_APIC_BASE.EXTD (x2APIC mode).
pub const APICBASE_X2APIC: u64 = 1 << 10;
/// IA32_APIC_BASE.EN
pub const APICBASE_ENABLED: u64 = 1 << 11;
const APICBASE_RESERVED: u64 = 0xfff0_0000_0000_02ff;

pub const APIC_OFFSET_ID: u32 = 0x20;
pub const APIC_OFFSET_VER: u32 = 0x30;
pub const APIC_OFFSET_TPR: u32 = 0x80;
pub const APIC_OFFSET_APR: u32 = 0x90;
pub const APIC_OFFSET_PPR: u32 = 0xa0;
pub const APIC_OFFSET_EOI: u32 = 0xb0;
pub const APIC_OFFSET_RRD: u32 = 0xc0;
pub const APIC_OFFSET_LDR: u32 = 0xd0;
pub const APIC_OFFSET_DFR: u32 = 0xe0;
pub const APIC_OFFSET_SVR: u32 = 0xf0;
pub const APIC_OFFSET_ISR0: u32 = 0x100;
pub const APIC_OFFSET_TMR0: u32 = 0x180;
pub const APIC_OFFSET_IRR0: u32 = 0x200;
pub const APIC_OFFSET_ESR: u32 = 0x280;
pub const APIC_OFFSET_CMCI_LVT: u32 = 0x2f0;
pub const APIC_OFFSET_ICR_LOW: u32 = 0x300;
pub const APIC_OFFSET_ICR_HI: u32 = 0x310;
pub const APIC_OFFSET_TIMER_LVT: u32 = 0x320;
pub const APIC_OFFSET_THERM_LVT: u32 = 0x330;
pub const APIC_OFFSET_PERF_LVT: u32 = 0x340;
pub const APIC_OFFSET_LINT0_LVT: u32 = 0x350;
pub const APIC_OFFSET_LINT1_LVT: u32 = 0x360;
pub const APIC_OFFSET_ERROR_LVT: u32 = 0x370;
pub const APIC_OFFSET_TIMER_ICR: u32 = 0x380;
pub const APIC_OFFSET_TIMER_CCR: u32 = 0x390;
pub const APIC_OFFSET_TIMER_DCR: u32 = 0x3e0;
pub const APIC_OFFSET_SELF_IPI: u32 = 0x3f0;

/// Version register: version 0x14, six LVT entries.
const APIC_VERSION: u32 = 0x0005_0014;
pub const LVT_MASKED: u32 = 1 << 16;
const LVT_TIMER_MODE_MASK: u32 = 0b11 << 17;
pub const LVT_TIMER_TSC_DEADLINE: u32 = 0b10 << 17;
const SVR_ENABLE: u32 = 1 << 8;
const DFR_FLAT: u32 = 0xf000_0000;
/// Lowest-priority delivery mode.
const ICR_DELIVERY_LOWPRI: u32 = 0x100;
/// ESR: illegal vector received.
const ESR_RECEIVE_ILLEGAL_VECTOR: u32 = 1 << 6;

/// The APIC register page.
#[repr(C, align(4096))]
pub struct ApicPage {
    regs: [AtomicU32; 1024],
}

impl ApicPage {
    fn new() -> Box<Self> {
        Box::new(Self {
            regs: [0; 1024].map(AtomicU32::new),
        })
    }

    #[inline]
    fn slot(&self, off: u32) -> &AtomicU32 {
        &self.regs[(off as usize >> 2) & 1023]
    }

    /// Read the register at byte offset `off`.
    #[inline]
    pub fn read(&self, off: u32) -> u32 {
        self.slot(off).load(Ordering::Acquire)
    }

    #[inline]
    pub fn write(&self, off: u32, v: u32) {
        self.slot(off).store(v, Ordering::Release)
    }

    /// Host physical address of the page.
    pub fn pa(&self) -> u64 {
        Va::of(self).into_pa().into_usize() as u64
    }

    #[inline]
    fn vec_slot(&self, base: u32, vector: u8) -> (&AtomicU32, u32) {
        (
            self.slot(base + ((vector as u32 >> 5) << 4)),
            1 << (vector as u32 & 31),
        )
    }

    /// Test `vector` in the 256-bit register group at `base`.
    pub fn test_vec(&self, base: u32, vector: u8) -> bool {
        let (slot, bit) = self.vec_slot(base, vector);
        slot.load(Ordering::Acquire) & bit != 0
    }

    /// Set `vector`, returning whether it was already set.
    pub fn set_vec(&self, base: u32, vector: u8) -> bool {
        let (slot, bit) = self.vec_slot(base, vector);
        slot.fetch_or(bit, Ordering::AcqRel) & bit != 0
    }

    pub fn clear_vec(&self, base: u32, vector: u8) {
        let (slot, bit) = self.vec_slot(base, vector);
        slot.fetch_and(!bit, Ordering::AcqRel);
    }

    /// Highest vector set in the group at `base`.
    pub fn highest_vec(&self, base: u32) -> Option<u8> {
        (0..8u32).rev().find_map(|i| match self.read(base + (i << 4)) {
            0 => None,
            v => Some((i * 32 + 31 - v.leading_zeros()) as u8),
        })
    }
}

/// Posted-interrupt descriptor.
///
/// See Intel® 64 and IA-32 Architectures Software Developer’s Manual, 29.6 POSTED-INTERRUPT PROCESSING.
#[repr(C, align(64))]
pub struct PostedInterruptDesc {
    /// Posted-interrupt requests, one bit per vector.
    pir: [AtomicU64; 4],
    /// Bit 0: outstanding notification.
    control: AtomicU64,
    _rsvd: [u64; 3],
}

impl PostedInterruptDesc {
    fn new() -> Box<Self> {
        Box::new(Self {
            pir: [0; 4].map(AtomicU64::new),
            control: AtomicU64::new(0),
            _rsvd: [0; 3],
        })
    }

    /// Post `vector`. Returns whether the outstanding-notification bit was
    /// clear, i.e. a notification has to be sent.
    pub fn post(&self, vector: u8) -> bool {
        self.pir[vector as usize >> 6].fetch_or(1 << (vector & 63), Ordering::AcqRel);
        self.control.fetch_or(1, Ordering::AcqRel) & 1 == 0
    }

    /// Whether a notification is outstanding.
    pub fn outstanding(&self) -> bool {
        self.control.load(Ordering::Acquire) & 1 != 0
    }

    /// Take every posted request.
    pub fn take(&self) -> [u64; 4] {
        self.control.fetch_and(!1, Ordering::AcqRel);
        [0, 1, 2, 3].map(|i| self.pir[i].swap(0, Ordering::AcqRel))
    }

    pub fn pa(&self) -> u64 {
        Va::of(self).into_pa().into_usize() as u64
    }
}

/// How the target of an accepted interrupt must be notified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notify {
    /// Nothing to do; a notification is already outstanding.
    None,
    /// Post [`VCpuRequest::EVENT`] and kick the pCPU.
    Event,
    /// Send the posted-interrupt notification vector to the pCPU.
    PostedInterrupt,
}

/// Result of evaluating pending interrupts before VM entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Injection {
    Nothing,
    Injected(u8),
    /// An interrupt is pending but the guest cannot take it now.
    NeedWindow,
}

/// APIC virtualization strategy.
pub trait ApicvOps: Send + Sync {
    fn name(&self) -> &'static str;

    /// Pin-based controls this strategy needs.
    fn pin_ctls(&self) -> VmcsPinBasedVmexecCtl {
        VmcsPinBasedVmexecCtl::empty()
    }

    /// Primary processor-based controls this strategy needs.
    fn proc_ctls(&self) -> VmcsProcBasedVmexecCtl;

    /// Secondary processor-based controls this strategy needs.
    fn proc_ctls2(&self) -> VmcsProcBasedSecondaryVmexecCtl {
        VmcsProcBasedSecondaryVmexecCtl::empty()
    }

    /// Program the APIC related VMCS fields.
    fn init_vmcs(&self, _vlapic: &VLapic, _vmcs: &ActiveVmcs, _pi_vector: u8) -> Result<(), VmError> {
        Ok(())
    }

    /// Stop intercepting the x2APIC MSRs the processor virtualizes.
    fn setup_msr_bitmap(&self, _bitmap: &mut MsrBitmap) {}

    /// Record `vector` as requested.
    fn accept_intr(&self, vlapic: &VLapic, vector: u8, level: bool) -> Notify;

    /// Deliver what is pending, right before VM entry.
    fn inject_intr(
        &self,
        vlapic: &VLapic,
        vmcs: &ActiveVmcs,
        interruptible: bool,
    ) -> Result<Injection, VmError>;

    /// Whether an interrupt is waiting for delivery.
    fn has_pending_intr(&self, vlapic: &VLapic) -> bool;
}

/// Full software emulation.
pub struct SoftwareApicv;

impl ApicvOps for SoftwareApicv {
    fn name(&self) -> &'static str {
        "software"
    }

    fn proc_ctls(&self) -> VmcsProcBasedVmexecCtl {
        VmcsProcBasedVmexecCtl::CR8LOADEXIT | VmcsProcBasedVmexecCtl::CR8STOREEXIT
    }

    fn accept_intr(&self, vlapic: &VLapic, vector: u8, level: bool) -> Notify {
        let page = &vlapic.page;
        if level {
            page.set_vec(APIC_OFFSET_TMR0, vector);
        } else {
            page.clear_vec(APIC_OFFSET_TMR0, vector);
        }
        page.set_vec(APIC_OFFSET_IRR0, vector);
        Notify::Event
    }

    fn inject_intr(
        &self,
        vlapic: &VLapic,
        vmcs: &ActiveVmcs,
        interruptible: bool,
    ) -> Result<Injection, VmError> {
        let Some(vector) = vlapic.pending_intr() else {
            return Ok(Injection::Nothing);
        };
        if !interruptible {
            return Ok(Injection::NeedWindow);
        }
        vmcs.write(
            Field::VmentryInterruptionInfo,
            InterruptionInfo {
                vector,
                interruption_type: InterruptionType::ExternalInt,
                error_code_valid: false,
                nmi_unblocked_by_iret: false,
            }
            .encode() as u64,
        )?;
        vlapic.intr_accepted(vector);
        Ok(Injection::Injected(vector))
    }

    fn has_pending_intr(&self, vlapic: &VLapic) -> bool {
        vlapic.pending_intr().is_some()
    }
}

/// APIC-register virtualization with virtual interrupt delivery and posted
/// interrupts.
pub struct HardwareApicv;

/// x2APIC MSRs read straight from the virtual-APIC page.
const X2APIC_PASSTHROUGH_READS: [u32; 5] = [0x802, 0x803, 0x808, 0x80a, 0x80d];
/// x2APIC MSRs whose writes the processor virtualizes: TPR, EOI, SELF IPI.
const X2APIC_PASSTHROUGH_WRITES: [u32; 3] = [0x808, 0x80b, 0x83f];

impl ApicvOps for HardwareApicv {
    fn name(&self) -> &'static str {
        "hardware"
    }

    fn pin_ctls(&self) -> VmcsPinBasedVmexecCtl {
        VmcsPinBasedVmexecCtl::PROCESS_POSTED_INTERRUPT
    }

    fn proc_ctls(&self) -> VmcsProcBasedVmexecCtl {
        VmcsProcBasedVmexecCtl::USETPRSHADOW
    }

    fn proc_ctls2(&self) -> VmcsProcBasedSecondaryVmexecCtl {
        VmcsProcBasedSecondaryVmexecCtl::VIRTUALIZED_X2APIC_MODE
            | VmcsProcBasedSecondaryVmexecCtl::APIC_REGISTER_VIRTUALIZATION
            | VmcsProcBasedSecondaryVmexecCtl::VIRTUAL_INTERRUPT_DELIVERY
    }

    fn init_vmcs(&self, vlapic: &VLapic, vmcs: &ActiveVmcs, pi_vector: u8) -> Result<(), VmError> {
        vmcs.write(Field::VirtualApicPageAddr, vlapic.page.pa())?;
        vmcs.write(Field::TprThreshold, 0)?;
        vmcs.write(Field::PostedInterruptVector, pi_vector as u64)?;
        vmcs.write(Field::PostedInterruptDescAddr, vlapic.pid.pa())?;
        for f in [
            Field::EoiExitBitmap0,
            Field::EoiExitBitmap1,
            Field::EoiExitBitmap2,
            Field::EoiExitBitmap3,
        ] {
            vmcs.write(f, 0)?;
        }
        vmcs.write(Field::GuestInterruptStatus, 0)
    }

    fn setup_msr_bitmap(&self, bitmap: &mut MsrBitmap) {
        for msr in X2APIC_PASSTHROUGH_READS {
            bitmap.set_read(msr, false);
        }
        for msr in X2APIC_PASSTHROUGH_WRITES {
            bitmap.set_write(msr, false);
        }
    }

    fn accept_intr(&self, vlapic: &VLapic, vector: u8, level: bool) -> Notify {
        if level {
            vlapic.page.set_vec(APIC_OFFSET_TMR0, vector);
        }
        if vlapic.pid.post(vector) {
            Notify::PostedInterrupt
        } else {
            Notify::None
        }
    }

    fn inject_intr(
        &self,
        vlapic: &VLapic,
        vmcs: &ActiveVmcs,
        _interruptible: bool,
    ) -> Result<Injection, VmError> {
        for (i, word) in vlapic.pid.take().into_iter().enumerate() {
            for half in 0..2u32 {
                let bits = (word >> (half * 32)) as u32;
                if bits != 0 {
                    vlapic
                        .page
                        .slot(APIC_OFFSET_IRR0 + ((i as u32 * 2 + half) << 4))
                        .fetch_or(bits, Ordering::AcqRel);
                }
            }
        }
        // RVI is the highest requested vector; the processor evaluates it
        // against the virtual PPR on entry.
        let Some(rvi) = vlapic.page.highest_vec(APIC_OFFSET_IRR0) else {
            return Ok(Injection::Nothing);
        };
        let status = vmcs.read(Field::GuestInterruptStatus)?;
        vmcs.write(Field::GuestInterruptStatus, (status & !0xff) | rvi as u64)?;
        Ok(Injection::Injected(rvi))
    }

    fn has_pending_intr(&self, vlapic: &VLapic) -> bool {
        vlapic.pid.outstanding() || vlapic.page.highest_vec(APIC_OFFSET_IRR0).is_some()
    }
}

pub static SOFTWARE_APICV: SoftwareApicv = SoftwareApicv;
pub static HARDWARE_APICV: HardwareApicv = HardwareApicv;

/// A register access the APIC refuses; the guest takes a #GP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidAccess;

/// Virtual local APIC of one vCPU.
pub struct VLapic {
    pub vm_id: VmId,
    pub vcpu_id: u16,
    page: Box<ApicPage>,
    pid: Box<PostedInterruptDesc>,
    apic_base: AtomicU64,
    tsc_deadline: AtomicU64,
    ops: SpinLock<&'static dyn ApicvOps>,
}

impl VLapic {
    /// A vLAPIC in its power-on state.
    pub fn create(vm_id: VmId, vcpu_id: u16, ops: &'static dyn ApicvOps) -> Self {
        let vlapic = Self {
            vm_id,
            vcpu_id,
            page: ApicPage::new(),
            pid: PostedInterruptDesc::new(),
            apic_base: AtomicU64::new(0),
            tsc_deadline: AtomicU64::new(0),
            ops: SpinLock::new(ops),
        };
        vlapic.init();
        vlapic
    }

    /// Load the power-on register state.
    pub fn init(&self) {
        for r in self.page.regs.iter() {
            r.store(0, Ordering::Relaxed);
        }
        self.pid.take();
        let mut base = DEFAULT_APIC_BASE | APICBASE_ENABLED;
        if self.vcpu_id == 0 {
            base |= APICBASE_BSP;
        }
        self.apic_base.store(base, Ordering::Release);
        self.page.write(APIC_OFFSET_ID, self.get_apicid() << 24);
        self.page.write(APIC_OFFSET_VER, APIC_VERSION);
        self.page.write(APIC_OFFSET_DFR, 0xffff_ffff);
        self.page.write(APIC_OFFSET_SVR, 0xff);
        for off in [
            APIC_OFFSET_CMCI_LVT,
            APIC_OFFSET_TIMER_LVT,
            APIC_OFFSET_THERM_LVT,
            APIC_OFFSET_PERF_LVT,
            APIC_OFFSET_LINT0_LVT,
            APIC_OFFSET_LINT1_LVT,
            APIC_OFFSET_ERROR_LVT,
        ] {
            self.page.write(off, LVT_MASKED);
        }
        self.tsc_deadline.store(0, Ordering::Release);
    }

    /// Switch to `ops` and reload the power-on state.
    pub fn reset(&self, ops: &'static dyn ApicvOps) {
        *self.ops.lock() = ops;
        self.init();
    }

    #[inline]
    pub fn ops(&self) -> &'static dyn ApicvOps {
        *self.ops.lock()
    }

    #[inline]
    pub fn page(&self) -> &ApicPage {
        &self.page
    }

    #[inline]
    pub fn pid(&self) -> &PostedInterruptDesc {
        &self.pid
    }

    /// The APIC id; equal to the vCPU id.
    #[inline]
    pub fn get_apicid(&self) -> u32 {
        self.vcpu_id as u32
    }

    pub fn get_apicbase(&self) -> u64 {
        self.apic_base.load(Ordering::Acquire)
    }

    /// Write IA32_APIC_BASE.
    ///
    /// The base cannot be relocated, and x2APIC mode is only left through
    /// the disabled state.
    pub fn set_apicbase(&self, new: u64) -> Result<(), InvalidAccess> {
        let old = self.get_apicbase();
        if new & APICBASE_RESERVED != 0
            || new & !0xfff != DEFAULT_APIC_BASE
            || (new & APICBASE_BSP) != (old & APICBASE_BSP)
        {
            return Err(InvalidAccess);
        }
        let mode = |v: u64| v & (APICBASE_ENABLED | APICBASE_X2APIC);
        match (mode(old), mode(new)) {
            // EXTD without EN.
            (_, APICBASE_X2APIC) => return Err(InvalidAccess),
            // x2APIC -> xAPIC.
            (o, APICBASE_ENABLED) if o == APICBASE_ENABLED | APICBASE_X2APIC => {
                return Err(InvalidAccess)
            }
            _ => (),
        }
        self.apic_base.store(new, Ordering::Release);
        if mode(new) == APICBASE_ENABLED | APICBASE_X2APIC {
            let id = self.get_apicid();
            self.page.write(APIC_OFFSET_ID, id);
            self.page
                .write(APIC_OFFSET_LDR, ((id >> 4) << 16) | (1 << (id & 0xf)));
        } else if mode(new) == APICBASE_ENABLED {
            self.page.write(APIC_OFFSET_ID, self.get_apicid() << 24);
        }
        Ok(())
    }

    #[inline]
    pub fn is_x2apic(&self) -> bool {
        self.get_apicbase() & (APICBASE_ENABLED | APICBASE_X2APIC)
            == APICBASE_ENABLED | APICBASE_X2APIC
    }

    /// Whether the APIC is globally and software enabled.
    pub fn is_enabled(&self) -> bool {
        self.get_apicbase() & APICBASE_ENABLED != 0
            && self.page.read(APIC_OFFSET_SVR) & SVR_ENABLE != 0
    }

    pub fn tpr(&self) -> u8 {
        self.page.read(APIC_OFFSET_TPR) as u8
    }

    pub fn set_tpr(&self, tpr: u8) {
        self.page.write(APIC_OFFSET_TPR, tpr as u32);
        self.update_ppr();
    }

    fn update_ppr(&self) {
        let tpr = self.tpr() as u32;
        let isrv = self.page.highest_vec(APIC_OFFSET_ISR0).unwrap_or(0) as u32;
        let ppr = if tpr & 0xf0 >= isrv & 0xf0 {
            tpr
        } else {
            isrv & 0xf0
        };
        self.page.write(APIC_OFFSET_PPR, ppr);
    }

    /// The highest requested vector the processor priority lets through.
    pub fn pending_intr(&self) -> Option<u8> {
        let vector = self.page.highest_vec(APIC_OFFSET_IRR0)?;
        let ppr = self.page.read(APIC_OFFSET_PPR);
        if vector as u32 & 0xf0 > ppr & 0xf0 {
            Some(vector)
        } else {
            None
        }
    }

    /// `vector` was delivered: move it from IRR to ISR.
    pub fn intr_accepted(&self, vector: u8) {
        self.page.clear_vec(APIC_OFFSET_IRR0, vector);
        self.page.set_vec(APIC_OFFSET_ISR0, vector);
        self.update_ppr();
    }

    /// Retire the highest in-service vector.
    pub fn eoi(&self) -> Option<u8> {
        let vector = self.page.highest_vec(APIC_OFFSET_ISR0)?;
        self.page.clear_vec(APIC_OFFSET_ISR0, vector);
        self.page.clear_vec(APIC_OFFSET_TMR0, vector);
        self.update_ppr();
        Some(vector)
    }

    fn timer_mode_deadline(&self) -> bool {
        self.page.read(APIC_OFFSET_TIMER_LVT) & LVT_TIMER_MODE_MASK == LVT_TIMER_TSC_DEADLINE
    }

    /// IA32_TSC_DEADLINE as the guest reads it; zero outside of TSC-deadline mode.
    pub fn get_tsc_deadline_msr(&self) -> u64 {
        if self.timer_mode_deadline() {
            self.tsc_deadline.load(Ordering::Acquire)
        } else {
            0
        }
    }

    /// Arm (or with zero, disarm) the one-shot deadline. Ignored unless the
    /// timer LVT selects TSC-deadline mode.
    pub fn set_tsc_deadline_msr(&self, deadline: u64) {
        if self.timer_mode_deadline() {
            self.tsc_deadline.store(deadline, Ordering::Release);
        }
    }

    /// The armed deadline, if it will fire.
    pub fn timer_deadline(&self) -> Option<u64> {
        match self.tsc_deadline.load(Ordering::Acquire) {
            0 => None,
            d if self.timer_mode_deadline() => Some(d),
            _ => None,
        }
    }

    /// Fire the deadline if `now` passed it. Returns the vector to raise,
    /// unless the LVT is masked.
    pub fn expire_timer(&self, now: u64) -> Option<u8> {
        let deadline = self.timer_deadline()?;
        if now < deadline {
            return None;
        }
        self.tsc_deadline.store(0, Ordering::Release);
        let lvt = self.page.read(APIC_OFFSET_TIMER_LVT);
        if lvt & LVT_MASKED != 0 {
            None
        } else {
            Some(lvt as u8)
        }
    }

    /// Whether logical destination `dest` selects this APIC.
    fn logical_match(&self, dest: u32) -> bool {
        let ldr = self.page.read(APIC_OFFSET_LDR);
        if self.is_x2apic() {
            return dest >> 16 == ldr >> 16 && dest & ldr & 0xffff != 0;
        }
        let dest = dest & 0xff;
        let ldr = ldr >> 24;
        if self.page.read(APIC_OFFSET_DFR) & 0xf000_0000 == DFR_FLAT {
            dest & ldr != 0
        } else {
            dest >> 4 == ldr >> 4 && dest & ldr & 0xf != 0
        }
    }

    fn write_lvt(&self, off: u32, v: u32) {
        let mut v = v;
        if self.page.read(APIC_OFFSET_SVR) & SVR_ENABLE == 0 {
            v |= LVT_MASKED;
        }
        if off == APIC_OFFSET_TIMER_LVT
            && (self.page.read(off) ^ v) & LVT_TIMER_MODE_MASK != 0
        {
            self.tsc_deadline.store(0, Ordering::Release);
        }
        self.page.write(off, v);
    }

    fn write_svr(&self, v: u32) {
        self.page.write(APIC_OFFSET_SVR, v & 0x1ff);
        if v & SVR_ENABLE == 0 {
            for off in [
                APIC_OFFSET_CMCI_LVT,
                APIC_OFFSET_TIMER_LVT,
                APIC_OFFSET_THERM_LVT,
                APIC_OFFSET_PERF_LVT,
                APIC_OFFSET_LINT0_LVT,
                APIC_OFFSET_LINT1_LVT,
                APIC_OFFSET_ERROR_LVT,
            ] {
                self.page.write(off, self.page.read(off) | LVT_MASKED);
            }
        }
    }
}

impl core::fmt::Debug for VLapic {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VLapic")
            .field("vm_id", &self.vm_id)
            .field("vcpu_id", &self.vcpu_id)
            .field("apic_base", &format_args!("{:#x}", self.get_apicbase()))
            .field("ops", &self.ops().name())
            .finish()
    }
}

/// Bitmask of the vCPUs of `vm` an interrupt addressed to `dest` reaches.
///
/// * `broadcast`: every vCPU.
/// * `phys`: the vCPU whose APIC id is `dest`.
/// * otherwise every vCPU whose logical destination matches `dest`.
///
/// With `lowprio` only the matching vCPU with the lowest TPR (then the
/// lowest id) stays. An empty mask means the interrupt is dropped.
pub fn calc_dest(vm: &Vm, broadcast: bool, dest: u32, phys: bool, lowprio: bool) -> u64 {
    let matches = |v: &&VCpu| {
        broadcast
            || if phys {
                v.vlapic.get_apicid() == dest
            } else {
                v.vlapic.logical_match(dest)
            }
    };
    if lowprio {
        vm.vcpus()
            .filter(matches)
            .min_by_key(|v| (v.vlapic.tpr(), v.vcpu_id))
            .map_or(0, |v| 1 << v.vcpu_id)
    } else {
        vm.vcpus().filter(matches).fold(0, |m, v| m | 1 << v.vcpu_id)
    }
}

/// Raise `vector` on `target`.
pub fn set_intr(hv: &Hypervisor, target: &VCpu, vector: u8, level: bool) {
    let vlapic = &target.vlapic;
    if vector < 16 {
        let esr = vlapic.page.read(APIC_OFFSET_ESR);
        vlapic.page.write(APIC_OFFSET_ESR, esr | ESR_RECEIVE_ILLEGAL_VECTOR);
        log::debug!("vlapic{}: illegal vector {}", target.vcpu_id, vector);
        return;
    }
    match vlapic.ops().accept_intr(vlapic, vector, level) {
        Notify::None => (),
        Notify::Event => {
            target.make_request(VCpuRequest::EVENT);
            hv.kick_vcpu(target);
        }
        Notify::PostedInterrupt => {
            target.make_request(VCpuRequest::EVENT);
            hv.notify_posted_intr(target);
        }
    }
}

/// Emulate a write to the interrupt command register of `vcpu`.
fn write_icr(hv: &Hypervisor, vm: &Vm, vcpu: &VCpu, icr: u64) {
    let lo = icr as u32;
    let x2apic = vcpu.vlapic.is_x2apic();
    let dest = if x2apic {
        (icr >> 32) as u32
    } else {
        (icr >> 56) as u32
    };
    let vector = lo as u8;
    let mode = lo & ICR_DELIVERY_MASK;
    let phys = lo & ICR_DEST_LOGICAL == 0;
    let self_bit = 1u64 << vcpu.vcpu_id;
    let all = vm.vcpu_mask();

    let dmask = match lo & ICR_SHORTHAND_MASK {
        ICR_SHORTHAND_SELF => self_bit,
        ICR_SHORTHAND_ALL => all,
        ICR_SHORTHAND_ALL_BUT_SELF => all & !self_bit,
        _ => {
            let broadcast = dest == if x2apic { 0xffff_ffff } else { 0xff };
            calc_dest(vm, broadcast, dest, phys, mode == ICR_DELIVERY_LOWPRI)
        }
    };
    log::trace!(
        "vm{} vcpu{}: icr {:#x} -> mask {:#x}",
        vm.vm_id,
        vcpu.vcpu_id,
        icr,
        dmask
    );

    for target in vm.vcpus().filter(|v| dmask & (1 << v.vcpu_id) != 0) {
        match mode {
            ICR_DELIVERY_FIXED | ICR_DELIVERY_LOWPRI => set_intr(hv, target, vector, false),
            ICR_DELIVERY_NMI => {
                target.make_request(VCpuRequest::NMI);
                hv.kick_vcpu(target);
            }
            ICR_DELIVERY_INIT => {
                // Level de-assert, obsolete.
                if lo & ICR_LEVEL_ASSERT == 0 && lo & ICR_TRIGGER_LEVEL != 0 {
                    continue;
                }
                if matches!(target.state(), VCpuState::Running | VCpuState::Init) {
                    target.set_state(VCpuState::Init);
                    target.make_request(VCpuRequest::INIT_VMCS);
                    hv.kick_vcpu(target);
                }
            }
            ICR_DELIVERY_STARTUP => {
                // Only the first STARTUP after INIT counts.
                if target.state() == VCpuState::Init && target.vcpu_id != vcpu.vcpu_id {
                    target.post_sipi(vector);
                    target.make_request(VCpuRequest::INIT_VMCS);
                    target.set_state(VCpuState::Running);
                    hv.kick_vcpu(target);
                }
            }
            _ => log::debug!("vlapic{}: unsupported delivery mode {:#x}", vcpu.vcpu_id, mode),
        }
    }
}

fn after_eoi(vcpu: &VCpu) {
    if vcpu.vlapic.eoi().is_some() && vcpu.vlapic.ops().has_pending_intr(&vcpu.vlapic) {
        vcpu.make_request(VCpuRequest::EVENT);
    }
}

fn is_readable(off: u32) -> bool {
    matches!(
        off,
        APIC_OFFSET_ID
            | APIC_OFFSET_VER
            | APIC_OFFSET_TPR
            | APIC_OFFSET_PPR
            | APIC_OFFSET_LDR
            | APIC_OFFSET_SVR
            | APIC_OFFSET_ESR
            | APIC_OFFSET_CMCI_LVT..=APIC_OFFSET_ERROR_LVT
            | APIC_OFFSET_TIMER_ICR
            | APIC_OFFSET_TIMER_CCR
            | APIC_OFFSET_TIMER_DCR
    ) || (APIC_OFFSET_ISR0..APIC_OFFSET_IRR0 + 0x80).contains(&off)
}

/// RDMSR of an x2APIC register (0x800..=0x8ff).
pub fn x2apic_read(vlapic: &VLapic, msr: u32) -> Result<u64, InvalidAccess> {
    if !vlapic.is_x2apic() || !(0x800..=0x8ff).contains(&msr) {
        return Err(InvalidAccess);
    }
    let off = (msr - 0x800) << 4;
    match off {
        APIC_OFFSET_ICR_LOW => Ok(((vlapic.page.read(APIC_OFFSET_ICR_HI) as u64) << 32)
            | vlapic.page.read(APIC_OFFSET_ICR_LOW) as u64),
        APIC_OFFSET_DFR | APIC_OFFSET_ICR_HI => Err(InvalidAccess),
        off if is_readable(off) && off & 0xf == 0 => Ok(vlapic.page.read(off) as u64),
        _ => Err(InvalidAccess),
    }
}

/// WRMSR of an x2APIC register.
pub fn x2apic_write(
    hv: &Hypervisor,
    vm: &Vm,
    vcpu: &VCpu,
    msr: u32,
    val: u64,
) -> Result<(), InvalidAccess> {
    let vlapic = &vcpu.vlapic;
    if !vlapic.is_x2apic() || !(0x800..=0x8ff).contains(&msr) {
        return Err(InvalidAccess);
    }
    let off = (msr - 0x800) << 4;
    if off != APIC_OFFSET_ICR_LOW && val >> 32 != 0 {
        return Err(InvalidAccess);
    }
    let v = val as u32;
    match off {
        APIC_OFFSET_TPR => vlapic.set_tpr(v as u8),
        APIC_OFFSET_EOI if v == 0 => after_eoi(vcpu),
        APIC_OFFSET_SVR => vlapic.write_svr(v),
        APIC_OFFSET_ESR if v == 0 => vlapic.page.write(APIC_OFFSET_ESR, 0),
        APIC_OFFSET_CMCI_LVT | APIC_OFFSET_TIMER_LVT..=APIC_OFFSET_ERROR_LVT => {
            vlapic.write_lvt(off, v)
        }
        APIC_OFFSET_ICR_LOW => {
            vlapic.page.write(APIC_OFFSET_ICR_LOW, v & !(1 << 12));
            vlapic.page.write(APIC_OFFSET_ICR_HI, (val >> 32) as u32);
            write_icr(hv, vm, vcpu, val);
        }
        APIC_OFFSET_TIMER_ICR | APIC_OFFSET_TIMER_DCR => vlapic.page.write(off, v),
        APIC_OFFSET_SELF_IPI => set_intr(hv, vcpu, v as u8, false),
        _ => return Err(InvalidAccess),
    }
    Ok(())
}

/// Read of the xAPIC page at byte offset `off`.
pub fn mmio_read(vlapic: &VLapic, off: u32) -> u32 {
    match off & !0x3 {
        off if off & 0xf == 0
            && (is_readable(off) || matches!(off, APIC_OFFSET_DFR | APIC_OFFSET_ICR_LOW | APIC_OFFSET_ICR_HI | APIC_OFFSET_APR | APIC_OFFSET_RRD)) =>
        {
            vlapic.page.read(off)
        }
        _ => 0,
    }
}

/// Write of the xAPIC page at byte offset `off`.
pub fn mmio_write(hv: &Hypervisor, vm: &Vm, vcpu: &VCpu, off: u32, v: u32) {
    let vlapic = &vcpu.vlapic;
    if vlapic.is_x2apic() || off & 0xf != 0 {
        return;
    }
    match off {
        APIC_OFFSET_TPR => vlapic.set_tpr(v as u8),
        APIC_OFFSET_EOI => after_eoi(vcpu),
        APIC_OFFSET_LDR => vlapic.page.write(off, v & 0xff00_0000),
        APIC_OFFSET_DFR => vlapic.page.write(off, (v & 0xf000_0000) | 0x0fff_ffff),
        APIC_OFFSET_SVR => vlapic.write_svr(v),
        APIC_OFFSET_ESR => vlapic.page.write(off, 0),
        APIC_OFFSET_CMCI_LVT | APIC_OFFSET_TIMER_LVT..=APIC_OFFSET_ERROR_LVT => {
            vlapic.write_lvt(off, v)
        }
        APIC_OFFSET_ICR_HI => vlapic.page.write(off, v),
        APIC_OFFSET_ICR_LOW => {
            vlapic.page.write(off, v & !(1 << 12));
            let hi = vlapic.page.read(APIC_OFFSET_ICR_HI) as u64;
            write_icr(hv, vm, vcpu, (hi << 32) | v as u64);
        }
        APIC_OFFSET_TIMER_ICR | APIC_OFFSET_TIMER_DCR => vlapic.page.write(off, v),
        _ => log::trace!("vlapic{}: write to {:#x} ignored", vcpu.vcpu_id, off),
    }
}
