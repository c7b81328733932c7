//! Frame and packet integrity code: reflected CRC-32 with polynomial
//! 0xEDB88320, initial value 0xFFFFFFFF, final XOR 0xFFFFFFFF (the
//! zlib/Ethernet CRC).
//!
//! On AArch64 the ARMv8 `crc32x/w/h/b` instructions implement exactly this
//! polynomial and are used 8/4/2/1 bytes at a time after a one-time,
//! memoized feature probe. The x86-64 `crc32` instruction computes CRC-32C
//! (the Castagnoli polynomial) and cannot reproduce this checksum, so
//! x86-64 always takes the portable path. Both paths are bit-identical for
//! every input.

use once_cell::sync::Lazy;

const POLY: u32 = 0xedb8_8320;

static HAVE_HW: Lazy<bool> = Lazy::new(detect_hw);

#[cfg(target_arch = "aarch64")]
fn detect_hw() -> bool {
    std::arch::is_aarch64_feature_detected!("crc")
}

#[cfg(not(target_arch = "aarch64"))]
fn detect_hw() -> bool {
    false
}

/// Computes the CRC-32 of `data`, dispatching to the hardware path when
/// the CPU supports it. The empty input yields 0.
pub fn crc32(data: &[u8]) -> u32 {
    if *HAVE_HW {
        crc32_hw(data)
    } else {
        crc32_sw(data)
    }
}

/// Portable bit-serial reference implementation.
pub fn crc32_sw(data: &[u8]) -> u32 {
    !update_sw(0xffff_ffff, data)
}

fn update_sw(mut crc: u32, data: &[u8]) -> u32 {
    for &b in data {
        crc ^= u32::from(b);
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (POLY & mask);
        }
    }
    crc
}

/// Hardware-accelerated path. Falls back to [crc32_sw] when the CPU lacks
/// CRC instructions, so it is callable unconditionally.
#[cfg(target_arch = "aarch64")]
pub fn crc32_hw(data: &[u8]) -> u32 {
    if !*HAVE_HW {
        return crc32_sw(data);
    }
    // Safety: the `crc` target feature was confirmed by `detect_hw`.
    !unsafe { update_hw(0xffff_ffff, data) }
}

#[cfg(target_arch = "aarch64")]
#[target_feature(enable = "crc")]
unsafe fn update_hw(mut crc: u32, data: &[u8]) -> u32 {
    use core::arch::aarch64::{__crc32b, __crc32d, __crc32h, __crc32w};
    use std::convert::TryInto;

    let mut chunks = data.chunks_exact(8);
    for c in &mut chunks {
        crc = __crc32d(crc, u64::from_le_bytes(c.try_into().unwrap()));
    }
    let mut rest = chunks.remainder();
    if rest.len() >= 4 {
        crc = __crc32w(crc, u32::from_le_bytes(rest[..4].try_into().unwrap()));
        rest = &rest[4..];
    }
    if rest.len() >= 2 {
        crc = __crc32h(crc, u16::from_le_bytes(rest[..2].try_into().unwrap()));
        rest = &rest[2..];
    }
    if let [b] = rest {
        crc = __crc32b(crc, *b);
    }
    crc
}

#[cfg(not(target_arch = "aarch64"))]
pub fn crc32_hw(data: &[u8]) -> u32 {
    crc32_sw(data)
}
