//! Atomic bitmaps over `u64` words.
//!
//! Bit `n` lives in word `n / 64` at position `n % 64`.

use core::sync::atomic::{AtomicU64, Ordering};

#[inline]
fn locate(bit: usize) -> (usize, u64) {
    (bit / 64, 1 << (bit % 64))
}

/// Set `bit` and return its previous value.
#[inline]
pub fn test_and_set(map: &[AtomicU64], bit: usize) -> bool {
    let (w, m) = locate(bit);
    map[w].fetch_or(m, Ordering::AcqRel) & m != 0
}

/// Clear `bit` and return its previous value.
#[inline]
pub fn test_and_clear(map: &[AtomicU64], bit: usize) -> bool {
    let (w, m) = locate(bit);
    map[w].fetch_and(!m, Ordering::AcqRel) & m != 0
}

/// Set `bit`.
#[inline]
pub fn set(map: &[AtomicU64], bit: usize) {
    test_and_set(map, bit);
}

/// Clear `bit` with release ordering.
#[inline]
pub fn clear(map: &[AtomicU64], bit: usize) {
    let (w, m) = locate(bit);
    map[w].fetch_and(!m, Ordering::Release);
}

/// Read `bit`.
#[inline]
pub fn test(map: &[AtomicU64], bit: usize) -> bool {
    let (w, m) = locate(bit);
    map[w].load(Ordering::Acquire) & m != 0
}

/// Index of the first zero bit below `limit`.
pub fn ffz(map: &[AtomicU64], limit: usize) -> Option<usize> {
    map.iter().enumerate().find_map(|(w, word)| {
        let inv = !word.load(Ordering::Acquire);
        if inv == 0 {
            return None;
        }
        Some(w * 64 + inv.trailing_zeros() as usize).filter(|&b| b < limit)
    })
}

/// Claim the first zero bit below `limit`.
///
/// Racing claimers never get the same bit; each retries on the next zero.
pub fn alloc_first_zero(map: &[AtomicU64], limit: usize) -> Option<usize> {
    loop {
        let bit = ffz(map, limit)?;
        if !test_and_set(map, bit) {
            return Some(bit);
        }
    }
}

/// Index of the lowest set bit of `v`.
#[inline]
pub fn ffs64(v: u64) -> Option<u32> {
    (v != 0).then(|| v.trailing_zeros())
}

/// Index of the highest set bit of `v`.
#[inline]
pub fn fls64(v: u64) -> Option<u32> {
    (v != 0).then(|| 63 - v.leading_zeros())
}

/// Iterator over the indices of set bits of `v`, lowest first.
pub fn iter_ones(mut v: u64) -> impl Iterator<Item = usize> {
    core::iter::from_fn(move || {
        let b = ffs64(v)?;
        v &= v - 1;
        Some(b as usize)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> [AtomicU64; 2] {
        [AtomicU64::new(0), AtomicU64::new(0)]
    }

    #[test]
    fn claim_in_order() {
        let m = map();
        for i in 0..100 {
            assert_eq!(alloc_first_zero(&m, 100), Some(i));
        }
        assert_eq!(alloc_first_zero(&m, 100), None);
        clear(&m, 42);
        assert!(!test(&m, 42));
        assert_eq!(alloc_first_zero(&m, 100), Some(42));
    }

    #[test]
    fn word_edges() {
        let m = map();
        assert!(!test_and_set(&m, 63));
        assert!(test_and_set(&m, 63));
        assert!(!test_and_set(&m, 64));
        assert!(test_and_clear(&m, 64));
        assert!(!test_and_clear(&m, 64));
    }

    #[test]
    fn scalar_helpers() {
        assert_eq!(ffs64(0), None);
        assert_eq!(ffs64(0b1000), Some(3));
        assert_eq!(fls64(0x8000_0000_0000_0001), Some(63));
        let v: alloc::vec::Vec<_> = iter_ones(0b1010_0001).collect();
        assert_eq!(v, [0, 5, 7]);
    }

    #[test]
    fn racing_claims_are_unique() {
        let m = map();
        let mut got: alloc::vec::Vec<usize> = std::thread::scope(|s| {
            let hs: alloc::vec::Vec<_> = (0..4)
                .map(|_| {
                    s.spawn(|| {
                        (0..32)
                            .filter_map(|_| alloc_first_zero(&m, 128))
                            .collect::<alloc::vec::Vec<_>>()
                    })
                })
                .collect();
            hs.into_iter().flat_map(|h| h.join().unwrap()).collect()
        });
        got.sort_unstable();
        assert_eq!(got, (0..128).collect::<alloc::vec::Vec<_>>());
    }
}
