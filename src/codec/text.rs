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

use crate::util::status::{AcdpError, Result, Status};

/// Character encodings a `string` column may declare. The codec only
/// needs to know how to turn a `&str` into bytes and back; it does not
/// attempt normalization or collation.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum TextEncoding {
    Ascii,
    Utf8,
}

impl TextEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            TextEncoding::Ascii => "ascii",
            TextEncoding::Utf8 => "utf8",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "ascii" => Ok(TextEncoding::Ascii),
            "utf8" => Ok(TextEncoding::Utf8),
            other => Err(AcdpError::new(
                Status::Usage,
                Some(&format!("unknown text encoding '{}'", other)),
            )),
        }
    }

    pub fn encode(&self, s: &str) -> Result<Vec<u8>> {
        match self {
            TextEncoding::Utf8 => Ok(s.as_bytes().to_vec()),
            TextEncoding::Ascii => {
                if !s.is_ascii() {
                    return Err(AcdpError::new(
                        Status::Usage,
                        Some("value is not ASCII-compatible with declared column encoding"),
                    ));
                }
                Ok(s.as_bytes().to_vec())
            }
        }
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<String> {
        match self {
            TextEncoding::Utf8 => String::from_utf8(bytes.to_vec()).map_err(|e| {
                AcdpError::with_source(Status::Corruption, "invalid utf8 in column payload", e)
            }),
            TextEncoding::Ascii => {
                if !bytes.is_ascii() {
                    return Err(AcdpError::new(
                        Status::Corruption,
                        Some("invalid ascii in column payload"),
                    ));
                }
                Ok(String::from_utf8_lossy(bytes).into_owned())
            }
        }
    }
}
