//! I/O request emulation.
//!
//! Port I/O is dispatched through a fixed table of descriptors per VM, one
//! slot per emulated device region ([`PioIndex`]). A port that no descriptor
//! covers reads as all-ones of the access width and ignores writes.
//!
//! MMIO emulation lives in [`mmio`].

pub mod mmio;

use crate::{
    hv::Hypervisor,
    vcpu::{VCpu, VCpuContext},
    virq::inject_gp,
    vm::Vm,
    vmx::vmcs::{IoDirection, IoQualification},
    VmError,
};
use abyss::platform::IoWidth;
use alloc::sync::Arc;

/// Slots of the port I/O table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, num_enum::IntoPrimitive)]
#[repr(usize)]
pub enum PioIndex {
    PicMaster,
    PicSlave,
    PicElc,
    PciCfgAddr,
    PciCfgData,
    Uart0,
    Uart1,
    Pm1aEvt,
    Pm1aCnt,
    Pm1bEvt,
    Pm1bCnt,
    Rtc,
    VirtualPm1aCnt,
    Kb,
    Cf9,
    ResetReg,
}

impl PioIndex {
    /// Number of slots.
    pub const COUNT: usize = 16;
}

/// Half-open port range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PioRange {
    pub start: u16,
    pub end: u16,
}

impl PioRange {
    /// `len` ports from `start`.
    pub const fn new(start: u16, len: u16) -> Self {
        Self {
            start,
            end: start + len,
        }
    }

    #[inline]
    pub fn contains(&self, port: u16) -> bool {
        self.start <= port && port < self.end
    }
}

/// A port I/O access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PioRequest {
    pub port: u16,
    pub width: IoWidth,
    pub direction: IoDirection,
    /// Data written, or read back once the request completes.
    pub value: u32,
}

/// Trait that represent handlers for port-mapped devices.
///
/// A handler that does not override a direction behaves like an unclaimed
/// port in that direction.
pub trait PioHandler
where
    Self: Send + Sync,
{
    /// Handle an `in` of `width` from `port`.
    fn read(&self, _hv: &Hypervisor, _vm: &Vm, _vcpu: &VCpu, _port: u16, width: IoWidth) -> u32 {
        width.mask()
    }

    /// Handle an `out` of `value` to `port`.
    fn write(&self, _hv: &Hypervisor, _vm: &Vm, _vcpu: &VCpu, _port: u16, _width: IoWidth, _value: u32) {}
}

/// A registered port range.
#[derive(Clone)]
pub struct PioDesc {
    pub range: PioRange,
    pub handler: Arc<dyn PioHandler>,
}

impl core::fmt::Debug for PioDesc {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "PioDesc({:#x}..{:#x})", self.range.start, self.range.end)
    }
}

/// Per-VM port I/O handler table.
#[derive(Debug)]
pub struct PioTable {
    emul_pio: [Option<PioDesc>; PioIndex::COUNT],
}

impl PioTable {
    pub fn new() -> Self {
        const NONE: Option<PioDesc> = None;
        Self {
            emul_pio: [NONE; PioIndex::COUNT],
        }
    }

    /// The descriptor covering `port`.
    pub fn find(&self, port: u16) -> Option<&PioDesc> {
        self.emul_pio
            .iter()
            .flatten()
            .find(|d| d.range.contains(port))
    }

    #[inline]
    pub fn get(&self, idx: PioIndex) -> Option<&PioDesc> {
        self.emul_pio[usize::from(idx)].as_ref()
    }

    fn set(&mut self, idx: PioIndex, desc: PioDesc) {
        self.emul_pio[usize::from(idx)] = Some(desc);
    }

    /// Drop every registration.
    pub fn clear(&mut self) {
        self.emul_pio.iter_mut().for_each(|d| *d = None);
    }
}

impl Default for PioTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Register `handler` for `range` at slot `idx` of `vm`, replacing what was
/// there.
pub fn register_pio_emulation_handler(
    vm: &Vm,
    idx: PioIndex,
    range: PioRange,
    handler: Arc<dyn PioHandler>,
) {
    log::debug!(
        "vm{}: pio {:?} at {:#x}..{:#x}",
        vm.vm_id,
        idx,
        range.start,
        range.end
    );
    vm.pio.write().set(idx, PioDesc { range, handler });
}

/// Run `req` against the handlers of `vm`. On return `req.value` holds the
/// result of a read.
pub fn emulate_io(hv: &Hypervisor, vm: &Vm, vcpu: &VCpu, req: &mut PioRequest) {
    let handler = vm
        .pio
        .read()
        .find(req.port)
        .map(|d| d.handler.clone());
    let mask = req.width.mask();
    match (handler, req.direction) {
        (Some(h), IoDirection::In) => {
            req.value = h.read(hv, vm, vcpu, req.port, req.width) & mask;
        }
        (Some(h), IoDirection::Out) => h.write(hv, vm, vcpu, req.port, req.width, req.value & mask),
        (None, IoDirection::In) => {
            log::trace!("vm{}: unhandled in {:#x}", vm.vm_id, req.port);
            req.value = mask;
        }
        (None, IoDirection::Out) => {
            log::trace!("vm{}: unhandled out {:#x} <- {:#x}", vm.vm_id, req.port, req.value);
        }
    }
}

/// I/O instruction exit.
///
/// String forms are not emulated and raise #GP in the guest.
pub fn pio_instr_vmexit_handler(ctx: &mut VCpuContext, q: IoQualification) -> Result<(), VmError> {
    if q.string {
        log::debug!(
            "vm{} vcpu{}: string i/o on {:#x}",
            ctx.vm.vm_id,
            ctx.vcpu.vcpu_id,
            q.port
        );
        inject_gp(ctx, 0);
        return Ok(());
    }
    let width = IoWidth::from_bytes(q.bytes()).ok_or(VmError::VCpuError("invalid i/o width"))?;
    let mask = width.mask() as usize;
    let rax = ctx.gprs().rax;
    let mut req = PioRequest {
        port: q.port,
        width,
        direction: q.direction,
        value: (rax & mask) as u32,
    };
    emulate_io(ctx.hv, ctx.vm, ctx.vcpu, &mut req);
    if req.direction == IoDirection::In {
        let gprs = ctx.gprs();
        gprs.rax = (gprs.rax & !mask) | (req.value as usize & mask);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::Harness;
    use core::sync::atomic::{AtomicU32, Ordering};

    /// A plain register.
    struct Scratch(AtomicU32);

    impl PioHandler for Scratch {
        fn read(&self, _: &Hypervisor, _: &Vm, _: &VCpu, _: u16, _: IoWidth) -> u32 {
            self.0.load(Ordering::Relaxed)
        }

        fn write(&self, _: &Hypervisor, _: &Vm, _: &VCpu, _: u16, _: IoWidth, v: u32) {
            self.0.store(v, Ordering::Relaxed)
        }
    }

    /// Reads a constant, drops writes.
    struct Constant;

    impl PioHandler for Constant {
        fn read(&self, _: &Hypervisor, _: &Vm, _: &VCpu, port: u16, _: IoWidth) -> u32 {
            port as u32
        }
    }

    fn io(ctx: &mut VCpuContext, port: u16, size: u64, input: bool) {
        let q = IoQualification::decode(((port as u64) << 16) | (size - 1) | ((input as u64) << 3));
        pio_instr_vmexit_handler(ctx, q).unwrap();
    }

    #[test]
    fn defaults_and_completion() {
        let h = Harness::new();
        let vm = h.vm(1);
        h.with_vcpu(&vm, 0, |ctx| {
            ctx.gprs().rax = 0x1234_5678;
            io(ctx, 0x2f00, 1, true);
            assert_eq!(ctx.gprs().rax, 0x1234_56ff);
            io(ctx, 0x2f00, 2, true);
            assert_eq!(ctx.gprs().rax, 0x1234_ffff);
            io(ctx, 0x2f00, 4, false);
        });
    }

    #[test]
    fn register_round_trip() {
        let h = Harness::new();
        let vm = h.vm(1);
        register_pio_emulation_handler(
            &vm,
            PioIndex::Kb,
            PioRange::new(0x2f00, 2),
            Arc::new(Scratch(AtomicU32::new(0))),
        );
        h.with_vcpu(&vm, 0, |ctx| {
            ctx.gprs().rax = 0xab;
            io(ctx, 0x2f01, 1, false);
            ctx.gprs().rax = 0;
            io(ctx, 0x2f00, 1, true);
            assert_eq!(ctx.gprs().rax, 0xab);
            // The range is half-open.
            io(ctx, 0x2f02, 1, true);
            assert_eq!(ctx.gprs().rax, 0xff);
        });

        // Registration replaces the slot.
        register_pio_emulation_handler(&vm, PioIndex::Kb, PioRange::new(0x2f00, 2), Arc::new(Constant));
        h.with_vcpu(&vm, 0, |ctx| {
            ctx.gprs().rax = 0x55;
            io(ctx, 0x2f00, 1, false);
            io(ctx, 0x2f01, 2, true);
            assert_eq!(ctx.gprs().rax, 0x2f01);
        });
    }

    #[test]
    fn string_io_faults() {
        let h = Harness::new();
        let vm = h.vm(1);
        h.with_vcpu(&vm, 0, |ctx| {
            let q = IoQualification::decode((0x3f8 << 16) | (1 << 4));
            pio_instr_vmexit_handler(ctx, q).unwrap();
            assert_eq!(ctx.arch.exception.map(|e| e.vector), Some(13));
            assert!(ctx.arch.retain_rip);
        });
    }
}
