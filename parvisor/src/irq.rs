//! Host interrupt registry.
//!
//! Device vectors are owned exclusively between [`IrqRegistry::request_irq`]
//! and [`IrqRegistry::free_irq`]. Vectors reserved by the hypervisor for
//! kicks and posted interrupts are never handed out.

use crate::{errno::Errno, hv::Hypervisor};
use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicU64, Ordering};
use spin_lock::RwSpinLock;

/// First vector available to devices.
pub const VECTOR_DYNAMIC_START: u8 = 0x20;
/// One past the last vector available to devices.
pub const VECTOR_DYNAMIC_END: u8 = 0xe0;

bitflags::bitflags! {
    /// Properties of a registration.
    pub struct IrqFlags: u32 {
        /// The interrupt belongs to a passthrough device.
        const PT = 1 << 0;
    }
}

/// Something that services a host vector.
pub trait IrqHandler
where
    Self: Send + Sync,
{
    fn handle(&self, hv: &Hypervisor, vector: u8);
}

#[derive(Clone)]
struct IrqDesc {
    handler: Arc<dyn IrqHandler>,
    flags: IrqFlags,
}

/// Vector table of the host.
pub struct IrqRegistry {
    descs: RwSpinLock<Vec<Option<IrqDesc>>>,
    counts: Vec<AtomicU64>,
}

impl IrqRegistry {
    pub fn new() -> Self {
        Self {
            descs: RwSpinLock::new((0..256).map(|_| None).collect()),
            counts: (0..256).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// Register `handler` on `vector`, or on the first free device vector
    /// when `vector` is `None`. Returns the vector.
    pub fn request_irq(
        &self,
        vector: Option<u8>,
        handler: Arc<dyn IrqHandler>,
        flags: IrqFlags,
    ) -> Result<u8, Errno> {
        let mut descs = self.descs.write();
        let v = match vector {
            Some(v) if !(VECTOR_DYNAMIC_START..VECTOR_DYNAMIC_END).contains(&v) => {
                return Err(Errno::EINVAL)
            }
            Some(v) if descs[v as usize].is_some() => return Err(Errno::EBUSY),
            Some(v) => v,
            None => (VECTOR_DYNAMIC_START..VECTOR_DYNAMIC_END)
                .find(|&v| descs[v as usize].is_none())
                .ok_or(Errno::EBUSY)?,
        };
        descs[v as usize] = Some(IrqDesc { handler, flags });
        self.counts[v as usize].store(0, Ordering::Relaxed);
        log::debug!("irq: vector {:#x} registered ({:?})", v, flags);
        Ok(v)
    }

    /// Release `vector`.
    pub fn free_irq(&self, vector: u8) {
        if self.descs.write()[vector as usize].take().is_none() {
            log::warn!("free_irq: vector {:#x} was not registered", vector);
        }
    }

    /// Whether `vector` is registered.
    pub fn is_registered(&self, vector: u8) -> bool {
        self.descs.read()[vector as usize].is_some()
    }

    /// Flags of the registration on `vector`.
    pub fn flags(&self, vector: u8) -> Option<IrqFlags> {
        self.descs.read()[vector as usize].as_ref().map(|d| d.flags)
    }

    /// Number of interrupts taken on `vector` since it was registered.
    pub fn count(&self, vector: u8) -> u64 {
        self.counts[vector as usize].load(Ordering::Relaxed)
    }

    /// Run the handler of `vector`. Returns false for a spurious vector.
    pub fn dispatch(&self, hv: &Hypervisor, vector: u8) -> bool {
        // The handler may free its own vector.
        let desc = self.descs.read()[vector as usize].clone();
        match desc {
            Some(d) => {
                self.counts[vector as usize].fetch_add(1, Ordering::Relaxed);
                d.handler.handle(hv, vector);
                true
            }
            None => false,
        }
    }
}

impl Default for IrqRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::Harness;
    use core::sync::atomic::AtomicU8;

    struct Record(AtomicU8);

    impl IrqHandler for Record {
        fn handle(&self, _hv: &Hypervisor, vector: u8) {
            self.0.store(vector, Ordering::Relaxed);
        }
    }

    #[test]
    fn allocation_and_dispatch() {
        let h = Harness::new();
        let reg = IrqRegistry::new();
        let rec = Arc::new(Record(AtomicU8::new(0)));
        let a = reg.request_irq(None, rec.clone(), IrqFlags::PT).unwrap();
        let b = reg.request_irq(None, rec.clone(), IrqFlags::empty()).unwrap();
        assert_eq!((a, b), (VECTOR_DYNAMIC_START, VECTOR_DYNAMIC_START + 1));
        assert_eq!(reg.request_irq(Some(a), rec.clone(), IrqFlags::empty()), Err(Errno::EBUSY));
        assert_eq!(reg.request_irq(Some(0xf0), rec.clone(), IrqFlags::empty()), Err(Errno::EINVAL));
        assert_eq!(reg.flags(a), Some(IrqFlags::PT));

        assert!(reg.dispatch(&h.hv, b));
        assert_eq!(rec.0.load(Ordering::Relaxed), b);
        assert_eq!(reg.count(b), 1);

        reg.free_irq(a);
        assert!(!reg.is_registered(a));
        assert!(!reg.dispatch(&h.hv, a));
        assert_eq!(reg.request_irq(None, rec, IrqFlags::empty()), Ok(a));
    }

    #[test]
    fn exhaustion() {
        let reg = IrqRegistry::new();
        let rec = Arc::new(Record(AtomicU8::new(0)));
        for _ in VECTOR_DYNAMIC_START..VECTOR_DYNAMIC_END {
            reg.request_irq(None, rec.clone(), IrqFlags::empty()).unwrap();
        }
        assert_eq!(reg.request_irq(None, rec, IrqFlags::empty()), Err(Errno::EBUSY));
    }
}
