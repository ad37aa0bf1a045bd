//! Legacy PIT used to calibrate the TSC when CPUID does not report it.
use crate::platform::{IoWidth, Platform};

/// Frequency of the PIT input clock in Hz.
pub const PIT_TICK_RATE: u64 = 1193182;

const MAX_QUICK_PIT_ITERATIONS: u64 = 50 * PIT_TICK_RATE / 1000 / 256;

fn verify_msb(p: &dyn Platform, val: u8) -> bool {
    let _ = p.pio_read(0x42, IoWidth::Byte);
    p.pio_read(0x42, IoWidth::Byte) as u8 == val
}

fn expect_msb(p: &dyn Platform, val: u8) -> Option<(u64, u64)> {
    let (mut count, mut prev_tsc, mut tsc) = (0, 0, 0);

    while count < 50000 {
        if !verify_msb(p, val) {
            break;
        }
        prev_tsc = tsc;
        tsc = p.rdtsc();
        count += 1;
    }
    let delta = p.rdtsc().wrapping_sub(prev_tsc);
    if count > 5 {
        Some((tsc, delta))
    } else {
        None
    }
}

/// Measure the TSC frequency in kHz against PIT channel 2.
///
/// "Borrowed" from linux's quick_pit_calibrate() in /arch/x86/kernel/tsc.c
pub fn pit_calibrate(p: &dyn Platform) -> Option<u64> {
    // Set the Gate high, disable speaker
    let gate = p.pio_read(0x61, IoWidth::Byte);
    p.pio_write(0x61, IoWidth::Byte, (gate & !0x2) | 1);
    // Counter 2, mode 0 (one-shot), binary count
    p.pio_write(0x43, IoWidth::Byte, 0xb0);
    // Start at 0xffff
    p.pio_write(0x42, IoWidth::Byte, 0xff);
    p.pio_write(0x42, IoWidth::Byte, 0xff);

    // The PIT starts counting at the next edge; one read of the counter is
    // enough of a delay.
    verify_msb(p, 0);

    let (tsc, d1) = expect_msb(p, 0xff)?;
    for i in 1..=MAX_QUICK_PIT_ITERATIONS as u8 {
        let (end, d2) = expect_msb(p, 0xff - i)?;
        let delta = end.wrapping_sub(tsc);

        if i == 1 && d1 + d2 >= ((delta * MAX_QUICK_PIT_ITERATIONS) >> 11) {
            return None;
        }
        if d1 + d2 >= (delta >> 11) {
            continue;
        }
        if !verify_msb(p, 0xfe - i) {
            return None;
        }
        return Some(delta * PIT_TICK_RATE / (i as u64 * 256 * 1000));
    }
    None
}
