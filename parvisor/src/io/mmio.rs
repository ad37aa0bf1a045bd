//! MMIO emulation.
//!
//! An access to guest physical memory the EPT does not map exits with an EPT
//! violation. The faulting instruction is fetched from the guest, decoded
//! with iced-x86 and emulated against the device behind the address: the
//! xAPIC page of the vCPU, or nothing (reads return all-ones, writes are
//! dropped).
//!
//! Only the `mov` and `movzx` forms compilers emit for device registers are
//! emulated; anything else raises #UD in the guest.

use crate::{
    probe::{copy_from_gva, Access, ProbeError},
    vcpu::{CpuMode, VCpuContext},
    virq::{inject_pf, inject_ud},
    vlapic,
    vm::Gpa,
    vmx::vmcs::{EptViolationQualification, Field},
    VmError,
};
use iced_x86::{Code, Decoder, DecoderOptions, Instruction, Register};

/// Longest x86 instruction.
const MAX_INSN_LEN: usize = 15;

/// What the decoded instruction does with memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MmioOp {
    /// Load into the register; narrower loads are zero-extended when
    /// `zero_extend` is set.
    Read { reg: Register, zero_extend: bool },
    Write(u64),
}

/// A decoded MMIO access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MmioInsn {
    op: MmioOp,
    /// Access width in bytes.
    size: usize,
    len: usize,
}

const GPR8: [Register; 16] = [
    Register::AL,
    Register::CL,
    Register::DL,
    Register::BL,
    Register::SPL,
    Register::BPL,
    Register::SIL,
    Register::DIL,
    Register::R8L,
    Register::R9L,
    Register::R10L,
    Register::R11L,
    Register::R12L,
    Register::R13L,
    Register::R14L,
    Register::R15L,
];
const GPR8_HIGH: [Register; 4] = [Register::AH, Register::CH, Register::DH, Register::BH];
const GPR16: [Register; 16] = [
    Register::AX,
    Register::CX,
    Register::DX,
    Register::BX,
    Register::SP,
    Register::BP,
    Register::SI,
    Register::DI,
    Register::R8W,
    Register::R9W,
    Register::R10W,
    Register::R11W,
    Register::R12W,
    Register::R13W,
    Register::R14W,
    Register::R15W,
];
const GPR32: [Register; 16] = [
    Register::EAX,
    Register::ECX,
    Register::EDX,
    Register::EBX,
    Register::ESP,
    Register::EBP,
    Register::ESI,
    Register::EDI,
    Register::R8D,
    Register::R9D,
    Register::R10D,
    Register::R11D,
    Register::R12D,
    Register::R13D,
    Register::R14D,
    Register::R15D,
];
const GPR64: [Register; 16] = [
    Register::RAX,
    Register::RCX,
    Register::RDX,
    Register::RBX,
    Register::RSP,
    Register::RBP,
    Register::RSI,
    Register::RDI,
    Register::R8,
    Register::R9,
    Register::R10,
    Register::R11,
    Register::R12,
    Register::R13,
    Register::R14,
    Register::R15,
];

/// Encoding index, width in bytes and bit offset of a general purpose
/// register.
fn gpr(reg: Register) -> Option<(usize, usize, u32)> {
    let find = |t: &[Register]| t.iter().position(|r| *r == reg);
    if let Some(i) = find(&GPR64) {
        Some((i, 8, 0))
    } else if let Some(i) = find(&GPR32) {
        Some((i, 4, 0))
    } else if let Some(i) = find(&GPR16) {
        Some((i, 2, 0))
    } else if let Some(i) = find(&GPR8) {
        Some((i, 1, 0))
    } else {
        find(&GPR8_HIGH).map(|i| (i, 1, 8))
    }
}

fn width_mask(bytes: usize) -> u64 {
    match bytes {
        8 => u64::MAX,
        b => (1u64 << (b * 8)) - 1,
    }
}

fn read_gpr(ctx: &mut VCpuContext, reg: Register) -> Result<u64, VmError> {
    let (idx, size, shift) = gpr(reg).ok_or(VmError::FailedToDecodeInstruction)?;
    Ok((ctx.reg(idx)? >> shift) & width_mask(size))
}

/// Write `v` to `reg` with the merge rules of the register width.
fn write_gpr(ctx: &mut VCpuContext, reg: Register, v: u64) -> Result<(), VmError> {
    let (idx, size, shift) = gpr(reg).ok_or(VmError::FailedToDecodeInstruction)?;
    let new = match size {
        8 => v,
        // 32-bit destinations clear the upper half.
        4 => v & 0xffff_ffff,
        _ => {
            let mask = width_mask(size) << shift;
            (ctx.reg(idx)? & !mask) | ((v << shift) & mask)
        }
    };
    ctx.set_reg(idx, new)
}

fn decode(insn: &Instruction, ctx: &mut VCpuContext) -> Result<Option<MmioInsn>, VmError> {
    let len = insn.len();
    let (op, size) = match insn.code() {
        Code::Mov_rm8_r8 => (MmioOp::Write(read_gpr(ctx, insn.op1_register())?), 1),
        Code::Mov_rm16_r16 => (MmioOp::Write(read_gpr(ctx, insn.op1_register())?), 2),
        Code::Mov_rm32_r32 => (MmioOp::Write(read_gpr(ctx, insn.op1_register())?), 4),
        Code::Mov_rm64_r64 => (MmioOp::Write(read_gpr(ctx, insn.op1_register())?), 8),
        Code::Mov_rm8_imm8 => (MmioOp::Write(insn.immediate(1)), 1),
        Code::Mov_rm16_imm16 => (MmioOp::Write(insn.immediate(1)), 2),
        Code::Mov_rm32_imm32 => (MmioOp::Write(insn.immediate(1)), 4),
        Code::Mov_rm64_imm32 => (MmioOp::Write(insn.immediate(1)), 8),
        code @ (Code::Mov_r8_rm8 | Code::Mov_r16_rm16 | Code::Mov_r32_rm32 | Code::Mov_r64_rm64) => {
            let size = match code {
                Code::Mov_r8_rm8 => 1,
                Code::Mov_r16_rm16 => 2,
                Code::Mov_r32_rm32 => 4,
                _ => 8,
            };
            (
                MmioOp::Read {
                    reg: insn.op0_register(),
                    zero_extend: false,
                },
                size,
            )
        }
        code @ (Code::Movzx_r16_rm8
        | Code::Movzx_r32_rm8
        | Code::Movzx_r64_rm8
        | Code::Movzx_r16_rm16
        | Code::Movzx_r32_rm16
        | Code::Movzx_r64_rm16) => {
            let size = match code {
                Code::Movzx_r16_rm8 | Code::Movzx_r32_rm8 | Code::Movzx_r64_rm8 => 1,
                _ => 2,
            };
            (
                MmioOp::Read {
                    reg: insn.op0_register(),
                    zero_extend: true,
                },
                size,
            )
        }
        _ => return Ok(None),
    };
    let op = match op {
        MmioOp::Write(v) => MmioOp::Write(v & width_mask(size)),
        read => read,
    };
    Ok(Some(MmioInsn { op, size, len }))
}

/// Fetch and decode the instruction at guest RIP.
///
/// `Ok(None)` means a fault was queued for the guest instead.
fn fetch_insn(ctx: &mut VCpuContext) -> Result<Option<Instruction>, VmError> {
    let mode = ctx.cpu_mode()?;
    let bitness = match mode {
        CpuMode::Long => 64,
        CpuMode::Real => 16,
        _ if ctx.vmcs.read(Field::GuestCsAccessRights)? & (1 << 14) != 0 => 32,
        _ => 16,
    };
    let mut pc = ctx.vmcs.read(Field::GuestCsBase)?.wrapping_add(ctx.rip()?);
    if mode != CpuMode::Long {
        pc &= 0xffff_ffff;
    }

    let mut bytes = [0u8; MAX_INSN_LEN];
    let first = (0x1000 - (pc as usize & 0xfff)).min(MAX_INSN_LEN);
    match copy_from_gva(ctx, &mut bytes[..first], pc, Access::Fetch) {
        Ok(()) => (),
        Err(ProbeError::PageFault { addr, error_code }) => {
            inject_pf(ctx, addr, error_code);
            return Ok(None);
        }
        Err(ProbeError::Vm(e)) => return Err(e),
        Err(e) => {
            log::error!("fetch_insn: vm{} rip {:#x}: {:?}", ctx.vm.vm_id, pc, e);
            return Err(VmError::FailedToDecodeInstruction);
        }
    }
    // The tail may sit on a page the instruction does not reach.
    let avail = if first < MAX_INSN_LEN
        && copy_from_gva(ctx, &mut bytes[first..], pc + first as u64, Access::Fetch).is_err()
    {
        first
    } else {
        MAX_INSN_LEN
    };

    let mut decoder = Decoder::with_ip(bitness, &bytes[..avail], pc, DecoderOptions::NONE);
    let mut insn = Instruction::default();
    if decoder.can_decode() {
        decoder.decode_out(&mut insn);
    }
    if insn.is_invalid() {
        inject_ud(ctx);
        return Ok(None);
    }
    Ok(Some(insn))
}

/// Emulate the access of the current instruction to `gpa`.
pub fn emulate_mmio(ctx: &mut VCpuContext, gpa: u64) -> Result<(), VmError> {
    let Some(insn) = fetch_insn(ctx)? else {
        return Ok(());
    };
    let Some(m) = decode(&insn, ctx)? else {
        log::debug!(
            "vm{} vcpu{}: mmio at {:#x} by unsupported {:?}",
            ctx.vm.vm_id,
            ctx.vcpu.vcpu_id,
            gpa,
            insn.code()
        );
        inject_ud(ctx);
        return Ok(());
    };

    let apic_base = ctx.vcpu.vlapic.get_apicbase() & !0xfff;
    let is_apic = !ctx.vcpu.vlapic.is_x2apic() && gpa & !0xfff == apic_base;
    match m.op {
        MmioOp::Write(v) => {
            if is_apic {
                let off = (gpa & 0xfff) as u32;
                vlapic::mmio_write(ctx.hv, ctx.vm, ctx.vcpu, off, v as u32);
            } else {
                log::trace!("vm{}: mmio write {:#x} <- {:#x} dropped", ctx.vm.vm_id, gpa, v);
            }
        }
        MmioOp::Read { reg, zero_extend } => {
            let v = if is_apic {
                let off = (gpa & 0xffc) as u32;
                (vlapic::mmio_read(&ctx.vcpu.vlapic, off) as u64) >> ((gpa & 0x3) * 8)
            } else {
                u64::MAX
            } & width_mask(m.size);
            let (_, reg_size, _) = gpr(reg).ok_or(VmError::FailedToDecodeInstruction)?;
            if zero_extend || reg_size == m.size {
                write_gpr(ctx, reg, v)?;
            } else {
                return Err(VmError::FailedToDecodeInstruction);
            }
        }
    }
    let rip = ctx.rip()?;
    ctx.set_rip(rip.wrapping_add(m.len as u64));
    ctx.retain_rip();
    Ok(())
}

/// EPT violation exit.
pub fn ept_violation_vmexit_handler(
    ctx: &mut VCpuContext,
    qualification: EptViolationQualification,
    fault_addr: Option<Gpa>,
) -> Result<(), VmError> {
    let gpa = fault_addr
        .ok_or(VmError::VCpuError("ept violation without address"))?
        .into_usize() as u64;
    if qualification.contains(EptViolationQualification::FETCH) {
        log::error!(
            "ept_violation_vmexit_handler: vm{} vcpu{} executes {:#x}",
            ctx.vm.vm_id,
            ctx.vcpu.vcpu_id,
            gpa
        );
        return Err(VmError::VCpuError("instruction fetch from unmapped memory"));
    }
    emulate_mmio(ctx, gpa)
}

/// APIC-access exit of hardware assisted APIC virtualization.
pub fn apic_access_vmexit_handler(ctx: &mut VCpuContext) -> Result<(), VmError> {
    let q = ctx.vmcs.read(Field::VmexitQualification)?;
    // Linear reads and writes only.
    if (q >> 12) & 0xf > 1 {
        return Err(VmError::VCpuError("unsupported apic access"));
    }
    let gpa = (ctx.vcpu.vlapic.get_apicbase() & !0xfff) | (q & 0xfff);
    emulate_mmio(ctx, gpa)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        probe::copy_to_gpa,
        tests::Harness,
        vlapic::{APIC_OFFSET_SVR, APIC_OFFSET_TPR, DEFAULT_APIC_BASE},
    };

    /// Place `code` at guest RIP 0x1000 of a paging-off vCPU.
    fn with_code(h: &Harness, code: &[u8], f: impl FnOnce(&mut VCpuContext)) {
        let vm = h.vm(1);
        copy_to_gpa(&h.hv, &vm, code, 0x1000).unwrap();
        h.with_vcpu(&vm, 0, |ctx| {
            ctx.vmcs.write(Field::Cr0ReadShadow, 1).unwrap();
            ctx.set_cr0(0x31);
            ctx.vmcs.write(Field::GuestCsAccessRights, 1 << 14).unwrap();
            ctx.set_rip(0x1000);
            f(ctx)
        });
    }

    #[test]
    fn apic_register_write() {
        let h = Harness::new();
        // mov dword [rax], ebx
        with_code(&h, &[0x89, 0x18], |ctx| {
            ctx.gprs().rax = (DEFAULT_APIC_BASE + APIC_OFFSET_TPR as u64) as usize;
            ctx.gprs().rbx = 0x30;
            let gpa = Gpa::new(ctx.gprs().rax).unwrap();
            ept_violation_vmexit_handler(ctx, EptViolationQualification::WRITE, Some(gpa)).unwrap();
            assert_eq!(ctx.vcpu.vlapic.tpr(), 0x30);
            assert_eq!(ctx.rip().unwrap(), 0x1002);
            assert!(ctx.arch.retain_rip);
        });
    }

    #[test]
    fn apic_register_read() {
        let h = Harness::new();
        // mov ecx, dword [rax+0xf0]
        with_code(&h, &[0x8b, 0x88, 0xf0, 0x00, 0x00, 0x00], |ctx| {
            ctx.vcpu.vlapic.page().write(APIC_OFFSET_SVR, 0x1ff);
            ctx.gprs().rcx = usize::MAX;
            let gpa = Gpa::new((DEFAULT_APIC_BASE + APIC_OFFSET_SVR as u64) as usize).unwrap();
            ept_violation_vmexit_handler(ctx, EptViolationQualification::READ, Some(gpa)).unwrap();
            // A 32-bit load clears the upper half.
            assert_eq!(ctx.gprs().rcx, 0x1ff);
            assert_eq!(ctx.rip().unwrap(), 0x1006);
        });
    }

    #[test]
    fn unbacked_mmio_and_unknown_forms() {
        let h = Harness::new();
        // movzx eax, byte [rbx]
        with_code(&h, &[0x0f, 0xb6, 0x03], |ctx| {
            ctx.gprs().rax = 0x1234;
            let gpa = Gpa::new(0xd000_0000).unwrap();
            ept_violation_vmexit_handler(ctx, EptViolationQualification::READ, Some(gpa)).unwrap();
            assert_eq!(ctx.gprs().rax, 0xff);
        });
        // inc dword [rax]
        with_code(&h, &[0xff, 0x00], |ctx| {
            let gpa = Gpa::new(0xd000_0000).unwrap();
            ept_violation_vmexit_handler(ctx, EptViolationQualification::WRITE, Some(gpa)).unwrap();
            assert_eq!(ctx.arch.exception.map(|e| e.vector), Some(6));
            assert_eq!(ctx.rip().unwrap(), 0x1000);
        });
        with_code(&h, &[0x90], |ctx| {
            let gpa = Gpa::new(0xd000_0000).unwrap();
            assert!(ept_violation_vmexit_handler(ctx, EptViolationQualification::FETCH, Some(gpa)).is_err());
        });
    }

    #[test]
    fn partial_register_merge() {
        let h = Harness::new();
        // mov ah, byte [rbx]
        with_code(&h, &[0x8a, 0x23], |ctx| {
            ctx.gprs().rax = 0x1111_2233;
            let gpa = Gpa::new(0xd000_0000).unwrap();
            ept_violation_vmexit_handler(ctx, EptViolationQualification::READ, Some(gpa)).unwrap();
            assert_eq!(ctx.gprs().rax, 0x1111_ff33);
        });
    }
}
