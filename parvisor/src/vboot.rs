//! Guest image loading.
//!
//! Kernels arrive as boot modules in host memory. A Linux bzImage is
//! started through the 32-bit boot protocol: its protected-mode part is
//! copied to the load address and a zero page carrying the setup header,
//! the E820 and the command line is handed over in `rsi`. A Zephyr raw
//! image is copied as is and entered at its entry address.

use crate::{
    config::OsKind,
    e820,
    hv::Hypervisor,
    probe::copy_to_gpa,
    util::string::strncpy_s,
    vm::{BootRegs, Vm},
    Errno, VmError,
};
use abyss::{
    addressing::{Pa, PAGE_SIZE},
    boot::{BootInfo, BootModule},
};

/// Guest physical address of the zero page.
pub const ZEROPAGE_GPA: u64 = 0x8000;
/// Guest physical address of the kernel command line.
pub const CMDLINE_GPA: u64 = 0x9000;

// Offsets into the zero page and the setup header of the image.
const ZP_E820_ENTRIES: usize = 0x1e8;
const ZP_SETUP_HEADER: usize = 0x1f1;
const ZP_E820_TABLE: usize = 0x2d0;
const HDR_SETUP_SECTS: usize = 0x1f1;
const HDR_SIGNATURE: usize = 0x202;
const HDR_VERSION: usize = 0x206;
const HDR_TYPE_OF_LOADER: usize = 0x210;
const HDR_LOADFLAGS: usize = 0x211;
const HDR_CODE32_START: usize = 0x214;
const HDR_CMD_LINE_PTR: usize = 0x228;
const HDR_CMDLINE_SIZE: usize = 0x238;

const HDRS_MAGIC: &[u8; 4] = b"HdrS";
/// 2.06 introduced `cmdline_size`.
const MIN_BOOT_PROTOCOL: u16 = 0x0206;
const LOADFLAGS_LOADED_HIGH: u8 = 1 << 0;
const LOADFLAGS_KEEP_SEGMENTS: u8 = 1 << 6;
const LOADER_UNDEFINED: u8 = 0xff;

fn le16(b: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([b[off], b[off + 1]])
}

fn le32(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

fn read_module(hv: &Hypervisor, module: &BootModule, off: usize, buf: &mut [u8]) {
    let Some(hpa) = Pa::new(module.start.into_usize() + off) else {
        return;
    };
    // SAFETY: boot modules are reserved host memory the loader handed over.
    unsafe { hv.platform.phys_read(hpa, buf) };
}

/// Copy `len` bytes at `off` of `module` to `gpa`.
fn copy_module(
    hv: &Hypervisor,
    vm: &Vm,
    module: &BootModule,
    off: usize,
    len: usize,
    gpa: u64,
) -> Result<(), Errno> {
    let mut buf = [0; PAGE_SIZE];
    let mut done = 0;
    while done < len {
        let n = (len - done).min(PAGE_SIZE);
        read_module(hv, module, off + done, &mut buf[..n]);
        copy_to_gpa(hv, vm, &buf[..n], gpa + done as u64)?;
        done += n;
    }
    Ok(())
}

fn load_bzimage(hv: &Hypervisor, vm: &Vm, module: &BootModule) -> Result<BootRegs, Errno> {
    let os = &vm.config.os;
    let mut zp = [0u8; PAGE_SIZE];
    if module.size < PAGE_SIZE {
        return Err(Errno::EINVAL);
    }
    read_module(hv, module, 0, &mut zp);
    if &zp[HDR_SIGNATURE..HDR_SIGNATURE + 4] != HDRS_MAGIC {
        log::error!("load_bzimage: vm{} kernel has no setup header", vm.vm_id);
        return Err(Errno::EINVAL);
    }
    let version = le16(&zp, HDR_VERSION);
    if version < MIN_BOOT_PROTOCOL {
        log::error!("load_bzimage: vm{} boot protocol {:#x} is too old", vm.vm_id, version);
        return Err(Errno::EINVAL);
    }
    let setup_sects = match zp[HDR_SETUP_SECTS] {
        0 => 4,
        n => n as usize,
    };
    let kernel_off = (setup_sects + 1) * 512;
    let kernel_len = module.size.checked_sub(kernel_off).ok_or(Errno::EINVAL)?;
    copy_module(hv, vm, module, kernel_off, kernel_len, os.load_addr)?;

    // The header ends where the jump at 0x200 lands.
    let hdr_end = (0x202 + zp[0x201] as usize).min(PAGE_SIZE);
    let mut page = [0u8; PAGE_SIZE];
    page[ZP_SETUP_HEADER..hdr_end].copy_from_slice(&zp[ZP_SETUP_HEADER..hdr_end]);

    page[HDR_TYPE_OF_LOADER] = LOADER_UNDEFINED;
    page[HDR_LOADFLAGS] |= LOADFLAGS_LOADED_HIGH | LOADFLAGS_KEEP_SEGMENTS;
    page[HDR_CODE32_START..HDR_CODE32_START + 4]
        .copy_from_slice(&(os.load_addr as u32).to_le_bytes());

    let room = (le32(&zp, HDR_CMDLINE_SIZE) as usize).min(PAGE_SIZE - 1);
    let mut line = [0u8; PAGE_SIZE];
    let n = strncpy_s(&mut line[..room + 1], os.bootargs.as_bytes());
    copy_to_gpa(hv, vm, &line[..n + 1], CMDLINE_GPA)?;
    page[HDR_CMD_LINE_PTR..HDR_CMD_LINE_PTR + 4].copy_from_slice(&(CMDLINE_GPA as u32).to_le_bytes());

    let entries = e820::encode(&vm.e820, &mut page[ZP_E820_TABLE..]);
    page[ZP_E820_ENTRIES] = entries as u8;
    copy_to_gpa(hv, vm, &page, ZEROPAGE_GPA)?;

    Ok(BootRegs {
        entry: os.load_addr,
        rsi: ZEROPAGE_GPA,
    })
}

fn load_zephyr(hv: &Hypervisor, vm: &Vm, module: &BootModule) -> Result<BootRegs, Errno> {
    let os = &vm.config.os;
    copy_module(hv, vm, module, 0, module.size, os.load_addr)?;
    Ok(BootRegs {
        entry: os.entry_addr,
        rsi: 0,
    })
}

/// Copy the kernel of `vm` into its memory and set the state the BSP
/// starts from.
pub fn load_guest(hv: &Hypervisor, vm: &Vm, boot: &BootInfo) -> Result<(), VmError> {
    let os = &vm.config.os;
    let module = boot.module(os.kernel_mod_tag).ok_or_else(|| {
        log::error!("load_guest: vm{} module {} not found", vm.vm_id, os.kernel_mod_tag);
        Errno::ENODEV
    })?;
    let regs = match os.kind {
        OsKind::BzImage => load_bzimage(hv, vm, module)?,
        OsKind::Zephyr => load_zephyr(hv, vm, module)?,
    };
    log::info!(
        "vm{}: {:?} loaded, {} bytes, entry {:#x}",
        vm.vm_id,
        os.kind,
        module.size,
        regs.entry
    );
    vm.set_boot_regs(regs);
    if let Some(bsp) = vm.bsp() {
        vm.init_arch(bsp, &mut bsp.arch());
    }
    Ok(())
}
