//! A scriptable [`Platform`] for host-side tests.

use crate::{
    addressing::{Pa, PAGE_MASK, PAGE_SIZE},
    dev::{ConsoleSink, ConsoleUart},
    platform::{CpuidResult, IoWidth, Platform},
};
use alloc::{
    boxed::Box,
    collections::{BTreeMap, VecDeque},
    sync::Arc,
    vec::Vec,
};
use core::sync::atomic::{AtomicU64, Ordering};
use spin_lock::SpinLock;

/// Callback observing ICR writes: `(dest, icr_low)`.
pub type IcrHook = Arc<dyn Fn(u32, u32) + Send + Sync>;

/// Mock hardware.
///
/// * Unset CPUID leaves read as zero.
/// * The TSC advances by a fixed step on every read.
/// * Ports read the scripted value or zero.
/// * Physical memory is sparse and zero-filled on first touch.
pub struct MockPlatform {
    cpuid: SpinLock<BTreeMap<(u32, u32), CpuidResult>>,
    tsc: AtomicU64,
    tsc_step: AtomicU64,
    ports: SpinLock<BTreeMap<u16, u32>>,
    pio_writes: SpinLock<Vec<(u16, IoWidth, u32)>>,
    msrs: SpinLock<BTreeMap<u32, u64>>,
    msr_writes: SpinLock<Vec<(u32, u64)>>,
    icrs: SpinLock<Vec<(u32, u32)>>,
    icr_hook: SpinLock<Option<IcrHook>>,
    xcrs: SpinLock<BTreeMap<u32, u64>>,
    memory: SpinLock<BTreeMap<usize, Box<[u8; PAGE_SIZE]>>>,
    rx: SpinLock<VecDeque<u8>>,
    tx: SpinLock<Vec<u8>>,
}

impl MockPlatform {
    /// A machine with nothing scripted.
    pub fn new() -> Self {
        Self {
            cpuid: SpinLock::new(BTreeMap::new()),
            tsc: AtomicU64::new(0),
            tsc_step: AtomicU64::new(100),
            ports: SpinLock::new(BTreeMap::new()),
            pio_writes: SpinLock::new(Vec::new()),
            msrs: SpinLock::new(BTreeMap::new()),
            msr_writes: SpinLock::new(Vec::new()),
            icrs: SpinLock::new(Vec::new()),
            icr_hook: SpinLock::new(None),
            xcrs: SpinLock::new(BTreeMap::new()),
            memory: SpinLock::new(BTreeMap::new()),
            rx: SpinLock::new(VecDeque::new()),
            tx: SpinLock::new(Vec::new()),
        }
    }

    /// Script a CPUID leaf.
    pub fn set_cpuid(&self, leaf: u32, subleaf: u32, r: CpuidResult) {
        self.cpuid.lock().insert((leaf, subleaf), r);
    }

    /// Set the current TSC value.
    pub fn set_tsc(&self, v: u64) {
        self.tsc.store(v, Ordering::SeqCst);
    }

    /// Move the TSC forward without reading it.
    pub fn advance_tsc(&self, delta: u64) {
        self.tsc.fetch_add(delta, Ordering::SeqCst);
    }

    /// Set how far the TSC moves on every read.
    pub fn set_tsc_step(&self, step: u64) {
        self.tsc_step.store(step, Ordering::SeqCst);
    }

    /// Script the value read from `port`.
    pub fn set_port(&self, port: u16, v: u32) {
        self.ports.lock().insert(port, v);
    }

    /// Port writes in order.
    pub fn pio_writes(&self) -> Vec<(u16, IoWidth, u32)> {
        self.pio_writes.lock().clone()
    }

    /// Preset an MSR.
    pub fn set_msr(&self, msr: u32, v: u64) {
        self.msrs.lock().insert(msr, v);
    }

    /// MSR writes in order.
    pub fn msr_writes(&self) -> Vec<(u32, u64)> {
        self.msr_writes.lock().clone()
    }

    /// ICR writes in order, as `(dest, icr_low)`.
    pub fn icr_log(&self) -> Vec<(u32, u32)> {
        self.icrs.lock().clone()
    }

    /// Run `hook` on every ICR write, after it is recorded.
    pub fn set_icr_hook(&self, hook: IcrHook) {
        *self.icr_hook.lock() = Some(hook);
    }

    /// Last value written to `xcr`.
    pub fn xcr(&self, xcr: u32) -> Option<u64> {
        self.xcrs.lock().get(&xcr).copied()
    }

    /// Queue bytes on the UART receive side.
    pub fn push_rx(&self, bytes: &[u8]) {
        self.rx.lock().extend(bytes.iter().copied());
    }

    /// Everything written to the UART so far, draining it.
    pub fn take_tx(&self) -> Vec<u8> {
        core::mem::take(&mut *self.tx.lock())
    }

    /// Whether the page containing `hpa` was ever touched.
    pub fn page_touched(&self, hpa: Pa) -> bool {
        self.memory.lock().contains_key(&(hpa.into_usize() & !PAGE_MASK))
    }

    fn for_each_page(&self, hpa: Pa, len: usize, mut f: impl FnMut(&mut [u8], usize)) {
        let mut memory = self.memory.lock();
        let mut addr = hpa.into_usize();
        let mut done = 0;
        while done < len {
            let off = addr & PAGE_MASK;
            let n = (PAGE_SIZE - off).min(len - done);
            let page = memory
                .entry(addr & !PAGE_MASK)
                .or_insert_with(|| Box::new([0; PAGE_SIZE]));
            f(&mut page[off..off + n], done);
            addr += n;
            done += n;
        }
    }
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for MockPlatform {
    fn rdtsc(&self) -> u64 {
        self.tsc
            .fetch_add(self.tsc_step.load(Ordering::SeqCst), Ordering::SeqCst)
    }

    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidResult {
        self.cpuid
            .lock()
            .get(&(leaf, subleaf))
            .copied()
            .unwrap_or_default()
    }

    fn pio_read(&self, port: u16, width: IoWidth) -> u32 {
        self.ports.lock().get(&port).copied().unwrap_or(0) & width.mask()
    }

    fn pio_write(&self, port: u16, width: IoWidth, value: u32) {
        self.pio_writes.lock().push((port, width, value & width.mask()));
    }

    fn rdmsr(&self, msr: u32) -> u64 {
        self.msrs.lock().get(&msr).copied().unwrap_or(0)
    }

    fn wrmsr(&self, msr: u32, value: u64) {
        self.msrs.lock().insert(msr, value);
        self.msr_writes.lock().push((msr, value));
    }

    fn send_icr(&self, dest: u32, icr_low: u32) {
        self.icrs.lock().push((dest, icr_low));
        let hook = self.icr_hook.lock().clone();
        if let Some(hook) = hook {
            hook(dest, icr_low);
        }
    }

    fn xsetbv(&self, xcr: u32, value: u64) {
        self.xcrs.lock().insert(xcr, value);
    }

    fn cpu_relax(&self) {
        core::hint::spin_loop();
    }

    unsafe fn phys_read(&self, hpa: Pa, buf: &mut [u8]) {
        let len = buf.len();
        self.for_each_page(hpa, len, |page, done| {
            buf[done..done + page.len()].copy_from_slice(page)
        });
    }

    unsafe fn phys_write(&self, hpa: Pa, data: &[u8]) {
        self.for_each_page(hpa, data.len(), |page, done| {
            let n = page.len();
            page.copy_from_slice(&data[done..done + n])
        });
    }
}

impl ConsoleSink for MockPlatform {
    fn write_bytes(&self, bytes: &[u8]) {
        self.tx.lock().extend_from_slice(bytes);
    }
}

impl ConsoleUart for MockPlatform {
    fn getc(&self) -> Option<u8> {
        self.rx.lock().pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_crosses_pages() {
        let p = MockPlatform::new();
        let hpa = Pa::new(0x1ffe).unwrap();
        unsafe { p.phys_write(hpa, &[1, 2, 3, 4]) };
        let mut buf = [0; 4];
        unsafe { p.phys_read(hpa, &mut buf) };
        assert_eq!(buf, [1, 2, 3, 4]);
        assert!(p.page_touched(Pa::new(0x2000).unwrap()));
        assert!(!p.page_touched(Pa::new(0x3000).unwrap()));
    }

    #[test]
    fn tsc_advances_on_read() {
        let p = MockPlatform::new();
        p.set_tsc_step(7);
        let a = p.rdtsc();
        assert_eq!(p.rdtsc() - a, 7);
    }
}
