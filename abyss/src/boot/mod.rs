//! Booting information handed over by the loader.

pub mod e820;
pub mod multiboot;

use crate::addressing::Pa;
use alloc::{string::String, vec::Vec};
use e820::E820Entry;

/// A boot module loaded next to the hypervisor (guest kernels, ramdisks).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootModule {
    /// Host physical address of the first byte.
    pub start: Pa,
    /// Size in bytes.
    pub size: usize,
    /// Loader-provided string used to look the module up.
    pub tag: String,
}

/// Everything the primary pCPU learns from the loader.
#[derive(Debug, Clone, Default)]
pub struct BootInfo {
    /// Raw physical memory map.
    pub memory_map: Vec<E820Entry>,
    /// Loaded modules.
    pub modules: Vec<BootModule>,
    /// Hypervisor command line.
    pub cmdline: String,
}

impl BootInfo {
    /// Find a module by its tag.
    pub fn module(&self, tag: &str) -> Option<&BootModule> {
        self.modules.iter().find(|m| m.tag == tag)
    }
}
