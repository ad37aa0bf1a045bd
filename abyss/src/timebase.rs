//! TSC based timebase.
//!
//! The frequency is measured once on the primary pCPU and never changes
//! afterwards; every conversion between microseconds and TSC ticks goes
//! through [`Timebase`].

use crate::{dev::x86_64::timer, platform::Platform};
use core::sync::atomic::{AtomicU64, Ordering};

/// CPUID leaf reporting the processor base frequency in MHz.
pub const CPUID_LEAF_FREQUENCY: u32 = 0x16;

/// Failure to calibrate the TSC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalibrationError;

/// The TSC frequency of the machine.
pub struct Timebase {
    tsc_khz: AtomicU64,
}

impl Timebase {
    /// An uncalibrated timebase.
    pub const fn new() -> Self {
        Self {
            tsc_khz: AtomicU64::new(0),
        }
    }

    /// Measure the TSC frequency.
    ///
    /// CPUID leaf 0x16 is preferred; on processors that do not report it the
    /// PIT channel 2 is used. Calibrating twice keeps the first value.
    pub fn calibrate_tsc(&self, p: &dyn Platform) -> Result<u64, CalibrationError> {
        if let Some(khz) = self.get() {
            return Ok(khz);
        }
        let khz = match Self::cpuid_khz(p) {
            Some(khz) => khz,
            None => {
                log::warn!("calibrate_tsc: cpuid leaf 0x16 unavailable, falling back to PIT");
                timer::pit_calibrate(p).filter(|&khz| khz != 0).ok_or(CalibrationError)?
            }
        };
        match self
            .tsc_khz
            .compare_exchange(0, khz, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                log::info!("TSC frequency: {} kHz", khz);
                Ok(khz)
            }
            Err(prev) => Ok(prev),
        }
    }

    fn cpuid_khz(p: &dyn Platform) -> Option<u64> {
        if p.cpuid(0, 0).eax < CPUID_LEAF_FREQUENCY {
            return None;
        }
        match p.cpuid(CPUID_LEAF_FREQUENCY, 0).eax as u64 {
            0 => None,
            mhz => Some(mhz * 1000),
        }
    }

    fn get(&self) -> Option<u64> {
        match self.tsc_khz.load(Ordering::Acquire) {
            0 => None,
            khz => Some(khz),
        }
    }

    /// TSC frequency in kHz. Zero before calibration.
    #[inline]
    pub fn tsc_khz(&self) -> u64 {
        self.tsc_khz.load(Ordering::Acquire)
    }

    /// Convert microseconds into TSC ticks.
    #[inline]
    pub fn us_to_ticks(&self, us: u64) -> u64 {
        us * self.tsc_khz() / 1000
    }

    /// Convert TSC ticks into microseconds.
    #[inline]
    pub fn ticks_to_us(&self, ticks: u64) -> u64 {
        match self.tsc_khz() {
            0 => 0,
            khz => ticks * 1000 / khz,
        }
    }

    /// Microseconds elapsed since the TSC value `since`.
    pub fn elapsed_us(&self, p: &dyn Platform, since: u64) -> u64 {
        self.ticks_to_us(p.rdtsc().saturating_sub(since))
    }

    /// Busy-wait for `us` microseconds.
    pub fn udelay(&self, p: &dyn Platform, us: u64) {
        let end = p.rdtsc() + self.us_to_ticks(us);
        while p.rdtsc() < end {
            p.cpu_relax();
        }
    }
}

impl Default for Timebase {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mock::MockPlatform, platform::CpuidResult};
    use rand::Rng;

    fn platform(mhz: u32) -> MockPlatform {
        let p = MockPlatform::new();
        p.set_cpuid(0, 0, CpuidResult { eax: 0x16, ..Default::default() });
        p.set_cpuid(0x16, 0, CpuidResult { eax: mhz, ..Default::default() });
        p
    }

    #[test]
    fn cpuid_leaf_0x16() {
        let tb = Timebase::new();
        assert_eq!(tb.calibrate_tsc(&platform(2400)), Ok(2_400_000));
        assert_eq!(tb.tsc_khz(), 2_400_000);
        assert_eq!(tb.us_to_ticks(1_000_000), 2_400_000_000);
    }

    #[test]
    fn frequency_is_fixed_after_calibration() {
        let tb = Timebase::new();
        tb.calibrate_tsc(&platform(2400)).unwrap();
        assert_eq!(tb.calibrate_tsc(&platform(3000)), Ok(2_400_000));
    }

    #[test]
    fn no_frequency_source() {
        let tb = Timebase::new();
        // Neither leaf 0x16 nor a ticking PIT.
        assert_eq!(tb.calibrate_tsc(&MockPlatform::new()), Err(CalibrationError));
        assert_eq!(tb.tsc_khz(), 0);
    }

    #[test]
    fn conversion_round_trip() {
        let mut rng = rand::thread_rng();
        for _ in 0..64 {
            let tb = Timebase::new();
            tb.calibrate_tsc(&platform(rng.gen_range(1..=5000))).unwrap();
            let us = rng.gen_range(0..=1u64 << 31);
            let back = tb.ticks_to_us(tb.us_to_ticks(us));
            assert!(us - back <= 1, "{} -> {}", us, back);
        }
    }

    #[test]
    fn udelay_waits() {
        let p = platform(1000);
        let tb = Timebase::new();
        tb.calibrate_tsc(&p).unwrap();
        let start = p.rdtsc();
        tb.udelay(&p, 50);
        assert!(p.rdtsc() - start >= tb.us_to_ticks(50));
    }
}
