//! Bounded string copies into fixed guest-visible buffers.

/// Copy `src` into `dst`, always leaving room for and writing a terminating
/// NUL. Copying stops at the first NUL of `src`.
///
/// Returns the number of bytes copied, excluding the terminator.
pub fn strncpy_s(dst: &mut [u8], src: &[u8]) -> usize {
    let Some(room) = dst.len().checked_sub(1) else {
        return 0;
    };
    let n = src
        .iter()
        .position(|&c| c == 0)
        .unwrap_or(src.len())
        .min(room);
    dst[..n].copy_from_slice(&src[..n]);
    dst[n] = 0;
    n
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_and_terminates() {
        let mut buf = [0xffu8; 6];
        assert_eq!(strncpy_s(&mut buf, b"console=ttyS0"), 5);
        assert_eq!(&buf, b"conso\0");
        assert_eq!(strncpy_s(&mut buf, b"ab\0cd"), 2);
        assert_eq!(&buf[..3], b"ab\0");
        assert_eq!(strncpy_s(&mut [], b"x"), 0);
    }
}
