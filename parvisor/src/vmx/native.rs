//! VMX instructions on the physical processor.

use super::{
    vmcs::{Field, InstructionError},
    HostState, Vmx,
};
use abyss::{
    addressing::Pa,
    interrupt::GeneralPurposeRegisters,
    x86_64::{
        intrinsics::{descriptor_base, read_cr0, read_cr3, read_cr4, selectors, sgdt, sidt, write_cr4},
        msr::rdmsr,
        Cr4,
    },
};
use core::arch::{asm, global_asm};

const MSR_IA32_PAT: u32 = 0x277;
const MSR_IA32_EFER: u32 = 0xc000_0080;
const MSR_IA32_FS_BASE: u32 = 0xc000_0100;
const MSR_IA32_GS_BASE: u32 = 0xc000_0101;

// parvisor_vmentry(gprs: *mut GeneralPurposeRegisters, launched: u64) -> u64
//
// Returns 0 after a VM exit and 1 if VM entry failed. The host stack pointer
// saved in the VMCS points at the pushed `gprs` pointer, which the exit stub
// uses to save the guest registers.
global_asm!(
    ".global parvisor_vmentry",
    "parvisor_vmentry:",
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "push rdi",
    "mov rax, 0x6c14", // HostRsp.
    "vmwrite rax, rsp",
    "jna 3f",
    // MOV to CR2 leaves the flags undefined; load it before testing `launched`.
    "mov rax, [rdi + 0x78]",
    "mov cr2, rax",
    "cmp rsi, 0",
    "mov rax, [rdi + 0x70]",
    "mov rbx, [rdi + 0x68]",
    "mov rcx, [rdi + 0x60]",
    "mov rdx, [rdi + 0x58]",
    "mov rbp, [rdi + 0x50]",
    "mov rsi, [rdi + 0x40]",
    "mov r8, [rdi + 0x38]",
    "mov r9, [rdi + 0x30]",
    "mov r10, [rdi + 0x28]",
    "mov r11, [rdi + 0x20]",
    "mov r12, [rdi + 0x18]",
    "mov r13, [rdi + 0x10]",
    "mov r14, [rdi + 0x8]",
    "mov r15, [rdi]",
    "mov rdi, [rdi + 0x48]",
    "je 2f",
    "vmresume",
    "jmp 3f",
    "2:",
    "vmlaunch",
    "3:",
    "pop rdi",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "mov rax, 1",
    "ret",
    "",
    ".global parvisor_vmexit",
    "parvisor_vmexit:",
    "push rdi",
    "mov rdi, [rsp + 8]",
    "mov [rdi + 0x70], rax",
    "mov rax, cr2",
    "mov [rdi + 0x78], rax",
    "mov [rdi + 0x68], rbx",
    "mov [rdi + 0x60], rcx",
    "mov [rdi + 0x58], rdx",
    "mov [rdi + 0x50], rbp",
    "mov [rdi + 0x40], rsi",
    "mov [rdi + 0x38], r8",
    "mov [rdi + 0x30], r9",
    "mov [rdi + 0x28], r10",
    "mov [rdi + 0x20], r11",
    "mov [rdi + 0x18], r12",
    "mov [rdi + 0x10], r13",
    "mov [rdi + 0x8], r14",
    "mov [rdi], r15",
    "pop rax",
    "mov [rdi + 0x48], rax",
    "add rsp, 8",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "xor rax, rax",
    "ret",
);

extern "C" {
    fn parvisor_vmentry(gprs: *mut GeneralPurposeRegisters, launched: u64) -> u64;
    fn parvisor_vmexit();
}

/// VMX on the physical processor.
pub struct NativeVmx {
    _p: (),
}

impl NativeVmx {
    /// # Safety
    /// Must only be used on bare metal in ring 0.
    pub const unsafe fn new() -> Self {
        Self { _p: () }
    }

    fn instruction_error() -> InstructionError {
        let v: u64;
        let err: u8;
        unsafe {
            asm!(
                "vmread {}, {}",
                "setna {}",
                out(reg) v,
                in(reg) Field::InstructionError as u64,
                out(reg_byte) err,
            );
        }
        if err != 0 {
            InstructionError::Unknown
        } else {
            InstructionError::from_raw(v)
        }
    }

    fn status(err: u8) -> Result<(), InstructionError> {
        if err != 0 {
            Err(Self::instruction_error())
        } else {
            Ok(())
        }
    }
}

impl Vmx for NativeVmx {
    fn enable_vmxe(&self) -> (u64, u64) {
        let cr4 = read_cr4() | Cr4::VMXE.bits();
        unsafe { write_cr4(cr4) };
        (read_cr0(), cr4)
    }

    fn vmxon(&self, region: Pa) -> Result<(), InstructionError> {
        let pa = region.into_usize() as u64;
        let err: u8;
        unsafe {
            asm!("vmxon [{}]", "setna {}", in(reg) &pa, out(reg_byte) err);
        }
        if err != 0 {
            // There is no current VMCS to read the error from.
            Err(InstructionError::Unknown)
        } else {
            Ok(())
        }
    }

    fn vmclear(&self, vmcs: Pa) -> Result<(), InstructionError> {
        let pa = vmcs.into_usize() as u64;
        let err: u8;
        unsafe {
            asm!("vmclear [{}]", "setna {}", in(reg) &pa, out(reg_byte) err);
        }
        Self::status(err)
    }

    fn vmptrld(&self, vmcs: Pa) -> Result<(), InstructionError> {
        let pa = vmcs.into_usize() as u64;
        let err: u8;
        unsafe {
            asm!("vmptrld [{}]", "setna {}", in(reg) &pa, out(reg_byte) err);
        }
        Self::status(err)
    }

    fn vmread(&self, _vmcs: Pa, field: Field) -> Result<u64, InstructionError> {
        let v: u64;
        let err: u8;
        unsafe {
            asm!(
                "vmread {}, {}",
                "setna {}",
                out(reg) v,
                in(reg) field as u64,
                out(reg_byte) err,
            );
        }
        Self::status(err).map(|_| v)
    }

    fn vmwrite(&self, _vmcs: Pa, field: Field, value: u64) -> Result<(), InstructionError> {
        let err: u8;
        unsafe {
            asm!(
                "vmwrite {}, {}",
                "setna {}",
                in(reg) field as u64,
                in(reg) value,
                out(reg_byte) err,
            );
        }
        Self::status(err)
    }

    unsafe fn vmentry(
        &self,
        _vmcs: Pa,
        gprs: &mut GeneralPurposeRegisters,
        launched: bool,
    ) -> Result<(), InstructionError> {
        match parvisor_vmentry(gprs as *mut _, launched as u64) {
            0 => Ok(()),
            _ => Err(Self::instruction_error()),
        }
    }

    fn invept(&self, eptp: u64) -> Result<(), InstructionError> {
        // Single-context invalidation.
        let desc: [u64; 2] = [eptp, 0];
        let err: u8;
        unsafe {
            asm!(
                "invept {}, [{}]",
                "setna {}",
                in(reg) 1u64,
                in(reg) &desc,
                out(reg_byte) err,
            );
        }
        Self::status(err)
    }

    fn host_state(&self) -> HostState {
        let sel = selectors();
        HostState {
            cr0: read_cr0(),
            cr3: read_cr3(),
            cr4: read_cr4(),
            selectors: sel,
            fs_base: unsafe { rdmsr(MSR_IA32_FS_BASE) },
            gs_base: unsafe { rdmsr(MSR_IA32_GS_BASE) },
            tr_base: descriptor_base(sel[6]),
            gdtr_base: sgdt().base,
            idtr_base: sidt().base,
            efer: unsafe { rdmsr(MSR_IA32_EFER) },
            pat: unsafe { rdmsr(MSR_IA32_PAT) },
        }
    }

    fn host_rip(&self) -> u64 {
        parvisor_vmexit as usize as u64
    }
}
