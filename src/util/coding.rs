// Copyright 2019 Fullstop000 <fullstop1005@gmail.com>.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// See the License for the specific language governing permissions and
// limitations under the License.

//! Fixed-width big-endian integer coding.
//!
//! Every multi-byte unsigned integer on disk (§6) is big-endian, MSB
//! first, and most of them have a *configurable* byte width (`nobsRowRef`,
//! `nobsOutrowPtr`, `nobsRefCount` range 1..=8) rather than a fixed 4 or 8
//! bytes, so the primitives here are width-parameterized instead of the
//! `u32`/`u64`-shaped helpers a fixed-width format would use.

use crate::util::status::{AcdpError, Result, Status};

/// Largest value representable in `width` bytes, i.e. `256^width - 1`.
#[inline]
pub fn max_value_for_width(width: usize) -> u64 {
    if width >= 8 {
        u64::MAX
    } else {
        (1u64 << (width * 8)) - 1
    }
}

/// Encodes `value` into the first `width` bytes of `dst`, big-endian.
///
/// # Errors
/// Returns `Status::Capacity` if `value` does not fit in `width` bytes.
pub fn encode_uint_be(value: u64, width: usize, dst: &mut [u8]) -> Result<()> {
    debug_assert!(width >= 1 && width <= 8);
    if value > max_value_for_width(width) {
        return Err(AcdpError::new(
            Status::Capacity,
            Some("value does not fit in the configured byte width"),
        ));
    }
    let full = value.to_be_bytes();
    dst[..width].copy_from_slice(&full[8 - width..]);
    Ok(())
}

/// Decodes a big-endian unsigned integer of `width` bytes from `src`.
pub fn decode_uint_be(src: &[u8], width: usize) -> u64 {
    debug_assert!(width >= 1 && width <= 8);
    let mut buf = [0u8; 8];
    buf[8 - width..].copy_from_slice(&src[..width]);
    u64::from_be_bytes(buf)
}

#[inline]
pub fn put_fixed_u32(dst: &mut Vec<u8>, value: u32) {
    dst.extend_from_slice(&value.to_be_bytes());
}

#[inline]
pub fn decode_fixed_u32(src: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&src[..4]);
    u32::from_be_bytes(buf)
}

#[inline]
pub fn put_fixed_u64(dst: &mut Vec<u8>, value: u64) {
    dst.extend_from_slice(&value.to_be_bytes());
}

#[inline]
pub fn decode_fixed_u64(src: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&src[..8]);
    u64::from_be_bytes(buf)
}

/// Encodes `bytes` as lowercase hex. Used for the one textual layout-file
/// field that carries raw bytes, `cipherChallenge` (§6) — everything else
/// in the layout file is already a plain string.
pub fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Decodes a lowercase-or-uppercase hex string produced by `encode_hex`.
pub fn decode_hex(s: &str) -> Result<Vec<u8>> {
    if s.len() % 2 != 0 {
        return Err(AcdpError::new(Status::Corruption, Some("cipherChallenge has odd hex length")));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&s[i..i + 2], 16)
                .map_err(|_| AcdpError::new(Status::Corruption, Some("cipherChallenge is not valid hex")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trips() {
        let bytes = vec![0u8, 1, 0xab, 0xff];
        assert_eq!(decode_hex(&encode_hex(&bytes)).unwrap(), bytes);
    }

    #[test]
    fn round_trips_every_width() {
        for width in 1..=8usize {
            let value = max_value_for_width(width);
            let mut buf = vec![0u8; width];
            encode_uint_be(value, width, &mut buf).unwrap();
            assert_eq!(decode_uint_be(&buf, width), value);
        }
    }

    #[test]
    fn rejects_overflow_for_width() {
        let mut buf = vec![0u8; 1];
        assert!(encode_uint_be(256, 1, &mut buf).is_err());
        assert!(encode_uint_be(255, 1, &mut buf).is_ok());
    }

    #[test]
    fn fixed32_and_fixed64_round_trip() {
        let mut v = vec![];
        put_fixed_u32(&mut v, 0xdeadbeef);
        assert_eq!(decode_fixed_u32(&v), 0xdeadbeef);
        let mut v2 = vec![];
        put_fixed_u64(&mut v2, 0x0123456789abcdef);
        assert_eq!(decode_fixed_u64(&v2), 0x0123456789abcdef);
    }
}
