//! Register images saved across guest entries and exits.

/// X86_64 general purpose registers
///
/// The layout is fixed: the VM entry/exit stubs address each register by
/// its offset (`r15` at 0x0 up to `rax` at 0x70, `cr2` at 0x78).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GeneralPurposeRegisters {
    pub r15: usize,
    pub r14: usize,
    pub r13: usize,
    pub r12: usize,
    pub r11: usize,
    pub r10: usize,
    pub r9: usize,
    pub r8: usize,
    pub rsi: usize,
    pub rdi: usize,
    pub rbp: usize,
    pub rdx: usize,
    pub rcx: usize,
    pub rbx: usize,
    pub rax: usize,
    /// CR2 is not saved by VM exits, so it travels with the GPRs.
    pub cr2: usize,
}

impl GeneralPurposeRegisters {
    /// Read a register by its x86 encoding (0 = rax, 1 = rcx, ... 15 = r15).
    ///
    /// Encoding 4 (rsp) lives in the VMCS and is not part of this image;
    /// `None` is returned for it.
    pub fn get(&self, idx: usize) -> Option<usize> {
        Some(match idx {
            0 => self.rax,
            1 => self.rcx,
            2 => self.rdx,
            3 => self.rbx,
            5 => self.rbp,
            6 => self.rsi,
            7 => self.rdi,
            8 => self.r8,
            9 => self.r9,
            10 => self.r10,
            11 => self.r11,
            12 => self.r12,
            13 => self.r13,
            14 => self.r14,
            15 => self.r15,
            _ => return None,
        })
    }

    /// Write a register by its x86 encoding. Returns false for rsp or an
    /// invalid encoding.
    pub fn set(&mut self, idx: usize, v: usize) -> bool {
        let slot = match idx {
            0 => &mut self.rax,
            1 => &mut self.rcx,
            2 => &mut self.rdx,
            3 => &mut self.rbx,
            5 => &mut self.rbp,
            6 => &mut self.rsi,
            7 => &mut self.rdi,
            8 => &mut self.r8,
            9 => &mut self.r9,
            10 => &mut self.r10,
            11 => &mut self.r11,
            12 => &mut self.r12,
            13 => &mut self.r13,
            14 => &mut self.r14,
            15 => &mut self.r15,
            _ => return false,
        };
        *slot = v;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::GeneralPurposeRegisters;

    #[test]
    fn layout_matches_stub_offsets() {
        let g = GeneralPurposeRegisters::default();
        let base = &g as *const _ as usize;
        assert_eq!(&g.r15 as *const _ as usize - base, 0x0);
        assert_eq!(&g.rdi as *const _ as usize - base, 0x48);
        assert_eq!(&g.rax as *const _ as usize - base, 0x70);
        assert_eq!(&g.cr2 as *const _ as usize - base, 0x78);
    }

    #[test]
    fn rsp_is_not_in_the_image() {
        let mut g = GeneralPurposeRegisters::default();
        assert!(!g.set(4, 1));
        assert!(g.set(3, 0xdead));
        assert_eq!(g.get(3), Some(0xdead));
        assert_eq!(g.get(4), None);
    }
}
