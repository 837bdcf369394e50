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

//! LEB128 variable-length integers, used for the recorder's record
//! lengths and unit ids (§6) where a value has no declared fixed width.

pub const MAX_VARINT_LEN_U64: usize = 10;

pub struct VarintU64;

impl VarintU64 {
    /// Appends the varint encoding of `v` to `dst`.
    pub fn put_varint(dst: &mut Vec<u8>, mut v: u64) {
        loop {
            if v < 0x80 {
                dst.push(v as u8);
                break;
            } else {
                dst.push((v & 0x7f) as u8 | 0x80);
                v >>= 7;
            }
        }
    }

    /// Reads a varint from the front of `src`, returning the decoded
    /// value and the number of bytes consumed, or `None` if `src` ends
    /// before a terminating byte is found.
    pub fn read(src: &[u8]) -> Option<(u64, usize)> {
        let mut result: u64 = 0;
        for (i, byte) in src.iter().enumerate().take(MAX_VARINT_LEN_U64) {
            result |= u64::from(byte & 0x7f) << (7 * i);
            if byte & 0x80 == 0 {
                return Some((result, i + 1));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_small_and_large_values() {
        for v in [0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            let mut buf = vec![];
            VarintU64::put_varint(&mut buf, v);
            let (decoded, n) = VarintU64::read(&buf).unwrap();
            assert_eq!(decoded, v);
            assert_eq!(n, buf.len());
        }
    }

    #[test]
    fn truncated_buffer_returns_none() {
        let mut buf = vec![];
        VarintU64::put_varint(&mut buf, u64::MAX);
        buf.truncate(buf.len() - 1);
        assert!(VarintU64::read(&buf).is_none());
    }
}
