//! Multiboot2 boot information parsing.
//!
//! The loader hands over a tag list: `total_size: u32, reserved: u32`
//! followed by 8-byte aligned tags `{ty: u32, size: u32, payload}`.

use super::{
    e820::{E820Entry, E820Type},
    BootInfo, BootModule,
};
use crate::addressing::Pa;
use alloc::{string::String, vec::Vec};

const TAG_END: u32 = 0;
const TAG_CMDLINE: u32 = 1;
const TAG_MODULE: u32 = 3;
const TAG_MMAP: u32 = 6;

/// Errors while parsing the boot information.
#[derive(Debug, PartialEq, Eq)]
pub enum MultibootError {
    /// The buffer is shorter than the advertised size.
    Truncated,
    /// No memory map tag.
    NoMemoryMap,
    /// A tag is malformed.
    BadTag(u32),
}

fn read_u32(b: &[u8], off: usize) -> Option<u32> {
    b.get(off..off + 4)
        .map(|s| u32::from_le_bytes([s[0], s[1], s[2], s[3]]))
}

fn read_u64(b: &[u8], off: usize) -> Option<u64> {
    Some(read_u32(b, off)? as u64 | (read_u32(b, off + 4)? as u64) << 32)
}

fn read_cstr(b: &[u8]) -> String {
    let end = b.iter().position(|&c| c == 0).unwrap_or(b.len());
    String::from_utf8_lossy(&b[..end]).into_owned()
}

/// Memory map entries from a type-6 tag payload.
fn parse_mmap(payload: &[u8]) -> Option<Vec<E820Entry>> {
    let stride = read_u32(payload, 0)? as usize;
    if stride < 20 {
        return None;
    }
    Some(
        payload[8..]
            .chunks_exact(stride)
            .filter_map(|en| {
                Some(E820Entry {
                    base_addr: read_u64(en, 0)?,
                    length: read_u64(en, 8)?,
                    ty: E820Type::from_raw(read_u32(en, 16)?) as u32,
                })
            })
            .collect(),
    )
}

/// Parse the multiboot2 information structure.
pub fn parse(info: &[u8]) -> Result<BootInfo, MultibootError> {
    let total = read_u32(info, 0).ok_or(MultibootError::Truncated)? as usize;
    if info.len() < total {
        return Err(MultibootError::Truncated);
    }

    let mut memory_map = None;
    let mut modules = Vec::new();
    let mut cmdline = String::new();

    let mut pos = 8;
    while pos + 8 <= total {
        let ty = read_u32(info, pos).ok_or(MultibootError::Truncated)?;
        let size = read_u32(info, pos + 4).ok_or(MultibootError::Truncated)? as usize;
        if size < 8 || pos + size > total {
            return Err(MultibootError::BadTag(ty));
        }
        let payload = &info[pos + 8..pos + size];
        match ty {
            TAG_END => break,
            TAG_CMDLINE => cmdline = read_cstr(payload),
            TAG_MODULE => {
                let (start, end) = (
                    read_u32(payload, 0).ok_or(MultibootError::BadTag(ty))?,
                    read_u32(payload, 4).ok_or(MultibootError::BadTag(ty))?,
                );
                modules.push(BootModule {
                    start: Pa::new(start as usize).ok_or(MultibootError::BadTag(ty))?,
                    size: end.saturating_sub(start) as usize,
                    tag: read_cstr(&payload[8..]),
                });
            }
            TAG_MMAP => memory_map = Some(parse_mmap(payload).ok_or(MultibootError::BadTag(ty))?),
            _ => (),
        }
        pos += (size + 7) & !7;
    }

    Ok(BootInfo {
        memory_map: memory_map.ok_or(MultibootError::NoMemoryMap)?,
        modules,
        cmdline,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(out: &mut Vec<u8>, ty: u32, payload: &[u8]) {
        out.extend_from_slice(&ty.to_le_bytes());
        out.extend_from_slice(&(payload.len() as u32 + 8).to_le_bytes());
        out.extend_from_slice(payload);
        while out.len() % 8 != 0 {
            out.push(0);
        }
    }

    fn build() -> Vec<u8> {
        let mut body = Vec::new();
        tag(&mut body, TAG_CMDLINE, b"loglevel=3\0");

        let mut mmap = Vec::new();
        mmap.extend_from_slice(&24u32.to_le_bytes());
        mmap.extend_from_slice(&0u32.to_le_bytes());
        for (base, len, ty) in [(0u64, 0x9_f000u64, 1u32), (0x10_0000, 0x3ff0_0000, 1), (0xfee0_0000, 0x1000, 2)] {
            mmap.extend_from_slice(&base.to_le_bytes());
            mmap.extend_from_slice(&len.to_le_bytes());
            mmap.extend_from_slice(&ty.to_le_bytes());
            mmap.extend_from_slice(&0u32.to_le_bytes());
        }
        tag(&mut body, TAG_MMAP, &mmap);

        let mut module = Vec::new();
        module.extend_from_slice(&0x200_0000u32.to_le_bytes());
        module.extend_from_slice(&0x280_0000u32.to_le_bytes());
        module.extend_from_slice(b"Linux_bzImage\0");
        tag(&mut body, TAG_MODULE, &module);
        tag(&mut body, TAG_END, &[]);

        let mut info = Vec::new();
        info.extend_from_slice(&(body.len() as u32 + 8).to_le_bytes());
        info.extend_from_slice(&0u32.to_le_bytes());
        info.extend_from_slice(&body);
        info
    }

    #[test]
    fn parse_tags() {
        let info = parse(&build()).unwrap();
        assert_eq!(info.cmdline, "loglevel=3");
        assert_eq!(info.memory_map.len(), 3);
        assert_eq!(info.memory_map[1].base_addr, 0x10_0000);
        assert_eq!(info.memory_map[2].kind(), E820Type::Reserved);
        assert_eq!(info.modules.len(), 1);
        assert_eq!(info.modules[0].tag, "Linux_bzImage");
        assert_eq!(info.modules[0].size, 0x80_0000);
    }

    #[test]
    fn truncated_info() {
        let mut raw = build();
        raw.truncate(raw.len() - 16);
        assert_eq!(parse(&raw).unwrap_err(), MultibootError::Truncated);
    }
}
