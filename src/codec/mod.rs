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

//! # Codec
//!
//! Total conversion between a typed [`Value`] and its byte representation
//! for a single column (§4.1). A `ColumnType` carries everything needed to
//! reconstruct its codec from a persisted [type descriptor](TypeDescriptor):
//! kind, nullability, storage scheme, and declared limit.
//!
//! ## Type descriptor grammar
//!
//! A descriptor is a colon-separated token sequence, round-trippable via
//! [`ColumnType::parse_descriptor`] / [`ColumnType::to_descriptor`]:
//!
//! ```text
//! <kind>:<null|notnull>:<scheme>:<limit>[:<encoding>][:(<element descriptor>)]
//! ```
//!
//! - `kind` is lowercase for built-in types (`bool`, `i1`/`i2`/`i4`/`i8`,
//!   `f4`/`f8`, `str`, `arr`, `ref`, `refarr`) and starts with an
//!   uppercase letter for a custom type name (e.g. `Geo`), per §6.
//! - `scheme` is `inrow` or `outrow`; fixed scalar kinds always use
//!   `inrow` but still carry the token for uniform parsing.
//! - `limit` is the declared maximum encoded length in bytes for
//!   strings/custom types, or the maximum element count for arrays; it is
//!   `0` (ignored) for kinds with an intrinsic fixed width.
//! - array and ref-array kinds carry a nested element descriptor in
//!   parentheses.
//!
//! Example: `i8:notnull:inrow:0` is a non-nullable inrow 8-byte integer;
//! `str:null:outrow:4:utf8` is a nullable outrow UTF-8 string with limit
//! 4; `refarr:notnull:outrow:6:(ref:notnull:inrow:0)` is a fixed-max-6
//! array of references stored outrow.

pub mod text;

use crate::util::status::{AcdpError, Result, Status};
use crate::util::varint::MAX_VARINT_LEN_U64;
use text::TextEncoding;

/// A runtime column value. `Ref` stores a 1-based FL slot index; the
/// byte width used on disk (`nobsRowRef`) is a table-level parameter
/// supplied through [`EncodeCtx`], not part of the value itself.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    F32(f32),
    F64(f64),
    Str(String),
    Array(Vec<Value>),
    Ref(u64),
    RefArray(Vec<u64>),
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum Scheme {
    Inrow,
    Outrow,
}

impl Scheme {
    fn as_str(&self) -> &'static str {
        match self {
            Scheme::Inrow => "inrow",
            Scheme::Outrow => "outrow",
        }
    }
}

/// A fully resolved column type, as parsed from a layout file's
/// `typeDesc` (§6).
#[derive(Clone, Debug, PartialEq)]
pub enum ColumnType {
    Bool {
        nullable: bool,
    },
    Int {
        width: u8, // 1, 2, 4, or 8
        nullable: bool,
    },
    Float32 {
        nullable: bool,
    },
    Float64 {
        nullable: bool,
    },
    Str {
        limit: u32,
        nullable: bool,
        scheme: Scheme,
        encoding: TextEncoding,
    },
    Array {
        element: Box<ColumnType>,
        limit: u32,
        nullable: bool,
        scheme: Scheme,
    },
    Ref {
        table: String,
        nullable: bool,
    },
    RefArray {
        table: String,
        limit: u32,
        nullable: bool,
        scheme: Scheme,
    },
    /// Additional variants registered at build time of the engine binary
    /// surface here; the core never loads custom codecs dynamically (see
    /// DESIGN.md). `limit` is the declared maximum encoded payload length.
    Custom {
        name: String,
        limit: u32,
        nullable: bool,
        scheme: Scheme,
    },
}

impl ColumnType {
    pub fn nullable(&self) -> bool {
        match self {
            ColumnType::Bool { nullable }
            | ColumnType::Int { nullable, .. }
            | ColumnType::Float32 { nullable }
            | ColumnType::Float64 { nullable }
            | ColumnType::Str { nullable, .. }
            | ColumnType::Array { nullable, .. }
            | ColumnType::Ref { nullable, .. }
            | ColumnType::RefArray { nullable, .. }
            | ColumnType::Custom { nullable, .. } => *nullable,
        }
    }

    pub fn is_outrow(&self) -> bool {
        match self {
            ColumnType::Str { scheme, .. }
            | ColumnType::Array { scheme, .. }
            | ColumnType::RefArray { scheme, .. }
            | ColumnType::Custom { scheme, .. } => *scheme == Scheme::Outrow,
            _ => false,
        }
    }

    /// Byte width of the inrow length prefix for a variable-with-prefix
    /// column: `ceil(log256(limit)) + 1`, per §4.1.
    fn inrow_length_prefix_width(limit: u32) -> usize {
        let mut n = limit as u64;
        let mut bytes = 0usize;
        loop {
            bytes += 1;
            n >>= 8;
            if n == 0 {
                break;
            }
        }
        bytes + 1
    }

    /// Number of bytes this column occupies in the FL slot's inline
    /// section, given the table's configured reference-byte widths.
    pub fn inline_len(&self, ctx: &EncodeCtx) -> usize {
        match self {
            ColumnType::Bool { .. } => 1,
            ColumnType::Int { width, .. } => *width as usize,
            ColumnType::Float32 { .. } => 4,
            ColumnType::Float64 { .. } => 8,
            ColumnType::Ref { .. } => ctx.nobs_row_ref,
            ColumnType::Str { limit, scheme, .. } => match scheme {
                Scheme::Inrow => Self::inrow_length_prefix_width(*limit) + *limit as usize,
                Scheme::Outrow => {
                    Self::inrow_length_prefix_width(*limit) + ctx.nobs_outrow_ptr
                }
            },
            ColumnType::Array {
                element,
                limit,
                scheme,
                ..
            } => {
                let elem_len = element.inline_len(ctx);
                match scheme {
                    Scheme::Inrow => 4 + (*limit as usize) * elem_len,
                    Scheme::Outrow => 4 + ctx.nobs_outrow_ptr,
                }
            }
            ColumnType::RefArray { limit, scheme, .. } => match scheme {
                Scheme::Inrow => 4 + (*limit as usize) * ctx.nobs_row_ref,
                Scheme::Outrow => 4 + ctx.nobs_outrow_ptr,
            },
            ColumnType::Custom { limit, scheme, .. } => match scheme {
                Scheme::Inrow => Self::inrow_length_prefix_width(*limit) + *limit as usize,
                Scheme::Outrow => {
                    Self::inrow_length_prefix_width(*limit) + ctx.nobs_outrow_ptr
                }
            },
        }
    }

    // -------------------------------------------------------------
    // Descriptor round-trip
    // -------------------------------------------------------------

    pub fn to_descriptor(&self) -> String {
        match self {
            ColumnType::Bool { nullable } => format!("bool:{}:inrow:0", null_tok(*nullable)),
            ColumnType::Int { width, nullable } => {
                format!("i{}:{}:inrow:0", width, null_tok(*nullable))
            }
            ColumnType::Float32 { nullable } => format!("f4:{}:inrow:0", null_tok(*nullable)),
            ColumnType::Float64 { nullable } => format!("f8:{}:inrow:0", null_tok(*nullable)),
            ColumnType::Ref { nullable, .. } => format!("ref:{}:inrow:0", null_tok(*nullable)),
            ColumnType::Str {
                limit,
                nullable,
                scheme,
                encoding,
            } => format!(
                "str:{}:{}:{}:{}",
                null_tok(*nullable),
                scheme.as_str(),
                limit,
                encoding.as_str()
            ),
            ColumnType::Array {
                element,
                limit,
                nullable,
                scheme,
            } => format!(
                "arr:{}:{}:{}:({})",
                null_tok(*nullable),
                scheme.as_str(),
                limit,
                element.to_descriptor()
            ),
            ColumnType::RefArray {
                limit,
                nullable,
                scheme,
                ..
            } => format!(
                "refarr:{}:{}:{}",
                null_tok(*nullable),
                scheme.as_str(),
                limit
            ),
            ColumnType::Custom {
                name,
                limit,
                nullable,
                scheme,
            } => format!(
                "{}:{}:{}:{}",
                name,
                null_tok(*nullable),
                scheme.as_str(),
                limit
            ),
        }
    }

    pub fn parse_descriptor(s: &str) -> Result<Self> {
        let tokens = split_top_level(s)?;
        if tokens.is_empty() {
            return Err(AcdpError::new(Status::Usage, Some("empty type descriptor")));
        }
        let kind = tokens[0].as_str();
        match kind {
            "bool" => Ok(ColumnType::Bool {
                nullable: parse_null(&tokens, 1)?,
            }),
            "i1" | "i2" | "i4" | "i8" => Ok(ColumnType::Int {
                width: kind[1..].parse().unwrap(),
                nullable: parse_null(&tokens, 1)?,
            }),
            "f4" => Ok(ColumnType::Float32 {
                nullable: parse_null(&tokens, 1)?,
            }),
            "f8" => Ok(ColumnType::Float64 {
                nullable: parse_null(&tokens, 1)?,
            }),
            "ref" => Ok(ColumnType::Ref {
                table: String::new(),
                nullable: parse_null(&tokens, 1)?,
            }),
            "str" => {
                let nullable = parse_null(&tokens, 1)?;
                let scheme = parse_scheme(&tokens, 2)?;
                let limit = parse_limit(&tokens, 3)?;
                let encoding = TextEncoding::parse(
                    tokens.get(4).map(String::as_str).unwrap_or("utf8"),
                )?;
                Ok(ColumnType::Str {
                    limit,
                    nullable,
                    scheme,
                    encoding,
                })
            }
            "arr" => {
                let nullable = parse_null(&tokens, 1)?;
                let scheme = parse_scheme(&tokens, 2)?;
                let limit = parse_limit(&tokens, 3)?;
                let elem_desc = tokens.get(4).ok_or_else(|| {
                    AcdpError::new(Status::Usage, Some("array descriptor missing element type"))
                })?;
                let element = Box::new(ColumnType::parse_descriptor(elem_desc)?);
                Ok(ColumnType::Array {
                    element,
                    limit,
                    nullable,
                    scheme,
                })
            }
            "refarr" => {
                let nullable = parse_null(&tokens, 1)?;
                let scheme = parse_scheme(&tokens, 2)?;
                let limit = parse_limit(&tokens, 3)?;
                Ok(ColumnType::RefArray {
                    table: String::new(),
                    limit,
                    nullable,
                    scheme,
                })
            }
            custom if custom.starts_with(|c: char| c.is_ascii_uppercase()) => {
                let nullable = parse_null(&tokens, 1)?;
                let scheme = parse_scheme(&tokens, 2)?;
                let limit = parse_limit(&tokens, 3)?;
                Ok(ColumnType::Custom {
                    name: custom.to_owned(),
                    limit,
                    nullable,
                    scheme,
                })
            }
            other => Err(AcdpError::new(
                Status::Usage,
                Some(&format!("unknown type descriptor kind '{}'", other)),
            )),
        }
    }

    /// Binds the `refdTable` attribute from the layout file onto a `Ref`
    /// or `RefArray` column type (the table name is per-column schema,
    /// not part of the descriptor itself, per §4 DATA MODEL).
    pub fn with_referenced_table(self, table: String) -> Self {
        match self {
            ColumnType::Ref { nullable, .. } => ColumnType::Ref { table, nullable },
            ColumnType::RefArray {
                limit,
                nullable,
                scheme,
                ..
            } => ColumnType::RefArray {
                table,
                limit,
                nullable,
                scheme,
            },
            other => other,
        }
    }

    pub fn referenced_table(&self) -> Option<&str> {
        match self {
            ColumnType::Ref { table, .. } if !table.is_empty() => Some(table),
            ColumnType::RefArray { table, .. } if !table.is_empty() => Some(table),
            _ => None,
        }
    }
}

fn null_tok(nullable: bool) -> &'static str {
    if nullable {
        "null"
    } else {
        "notnull"
    }
}

fn parse_null(tokens: &[String], idx: usize) -> Result<bool> {
    match tokens.get(idx).map(String::as_str) {
        Some("null") => Ok(true),
        Some("notnull") => Ok(false),
        _ => Err(AcdpError::new(
            Status::Usage,
            Some("type descriptor missing null/notnull token"),
        )),
    }
}

fn parse_scheme(tokens: &[String], idx: usize) -> Result<Scheme> {
    match tokens.get(idx).map(String::as_str) {
        Some("inrow") => Ok(Scheme::Inrow),
        Some("outrow") => Ok(Scheme::Outrow),
        _ => Err(AcdpError::new(
            Status::Usage,
            Some("type descriptor missing inrow/outrow token"),
        )),
    }
}

fn parse_limit(tokens: &[String], idx: usize) -> Result<u32> {
    tokens
        .get(idx)
        .ok_or_else(|| AcdpError::new(Status::Usage, Some("type descriptor missing limit token")))?
        .parse::<u32>()
        .map_err(|_| AcdpError::new(Status::Usage, Some("type descriptor limit is not a number")))
}

/// Splits a descriptor on `:` at depth zero, treating `(...)` as an
/// opaque nested token (used for array element descriptors).
fn split_top_level(s: &str) -> Result<Vec<String>> {
    let mut tokens = vec![];
    let mut depth = 0i32;
    let mut cur = String::new();
    for c in s.chars() {
        match c {
            '(' => {
                depth += 1;
                if depth > 1 {
                    cur.push(c);
                }
            }
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(AcdpError::new(
                        Status::Usage,
                        Some("unbalanced parentheses in type descriptor"),
                    ));
                }
                if depth > 0 {
                    cur.push(c);
                }
            }
            ':' if depth == 0 => {
                tokens.push(std::mem::take(&mut cur));
            }
            _ => cur.push(c),
        }
    }
    if depth != 0 {
        return Err(AcdpError::new(
            Status::Usage,
            Some("unbalanced parentheses in type descriptor"),
        ));
    }
    tokens.push(cur);
    Ok(tokens)
}

/// Table-level parameters a codec needs but a column type doesn't carry
/// on its own: the configured byte widths of §4 DATA MODEL.
#[derive(Clone, Copy, Debug)]
pub struct EncodeCtx {
    pub nobs_row_ref: usize,
    pub nobs_outrow_ptr: usize,
}

/// Result of encoding a non-null value: either the complete inrow bytes,
/// or (for outrow columns) the payload to place in a VL block. The
/// caller (table store) is responsible for allocating the VL block and
/// writing the resulting `(length, pointer)` pair into the inline
/// section — that placement logic belongs to the FSM, not the codec.
pub enum Encoded {
    Inline(Vec<u8>),
    Outrow(Vec<u8>),
}

/// Inclusive min/max a two's-complement big-endian integer of `w` bytes
/// can hold. Computed directly rather than derived from the unsigned
/// `max_value_for_width` (which saturates at `u64::MAX` for `w == 8` and
/// wraps to `-1` if simply cast to `i64`).
fn signed_range_for_width(w: usize) -> (i64, i64) {
    if w >= 8 {
        (i64::MIN, i64::MAX)
    } else {
        let bits = (w * 8) as u32;
        (-(1i64 << (bits - 1)), (1i64 << (bits - 1)) - 1)
    }
}

impl ColumnType {
    /// Validates and encodes a value. Returns `Status::Usage` for a null
    /// on a non-nullable column or a type mismatch, `Status::Capacity`
    /// if the encoded length exceeds the declared limit.
    pub fn encode(&self, value: &Value, ctx: &EncodeCtx) -> Result<Encoded> {
        if matches!(value, Value::Null) {
            if !self.nullable() {
                return Err(AcdpError::new(
                    Status::Usage,
                    Some("null supplied for a non-nullable column"),
                ));
            }
            // Deterministic, zero-filled payload for the (unspecified)
            // null representation, per §4.1.
            return Ok(Encoded::Inline(vec![0u8; self.inline_len(ctx)]));
        }
        match (self, value) {
            (ColumnType::Bool { .. }, Value::Bool(b)) => {
                Ok(Encoded::Inline(vec![if *b { 1 } else { 0 }]))
            }
            (ColumnType::Int { width, .. }, Value::Int(v)) => {
                let w = *width as usize;
                let (min, max) = signed_range_for_width(w);
                if *v > max || *v < min {
                    return Err(AcdpError::new(
                        Status::Capacity,
                        Some("integer value exceeds the column's declared width"),
                    ));
                }
                let mut buf = vec![0u8; w];
                let bytes = v.to_be_bytes();
                buf.copy_from_slice(&bytes[8 - w..]);
                Ok(Encoded::Inline(buf))
            }
            (ColumnType::Float32 { .. }, Value::F32(v)) => {
                Ok(Encoded::Inline(v.to_be_bytes().to_vec()))
            }
            (ColumnType::Float64 { .. }, Value::F64(v)) => {
                Ok(Encoded::Inline(v.to_be_bytes().to_vec()))
            }
            (ColumnType::Ref { .. }, Value::Ref(r)) => {
                if *r > crate::util::coding::max_value_for_width(ctx.nobs_row_ref) {
                    return Err(AcdpError::new(
                        Status::Capacity,
                        Some("row reference does not fit in nobsRowRef bytes"),
                    ));
                }
                let mut buf = vec![0u8; ctx.nobs_row_ref];
                crate::util::coding::encode_uint_be(*r, ctx.nobs_row_ref, &mut buf)?;
                Ok(Encoded::Inline(buf))
            }
            (ColumnType::Str { limit, encoding, scheme, .. }, Value::Str(s)) => {
                let bytes = encoding.encode(s)?;
                if bytes.len() > *limit as usize {
                    return Err(AcdpError::new(
                        Status::Capacity,
                        Some("string value exceeds the column's declared limit"),
                    ));
                }
                match scheme {
                    Scheme::Inrow => {
                        let prefix_w = Self::inrow_length_prefix_width(*limit);
                        let mut buf = vec![0u8; prefix_w + *limit as usize];
                        crate::util::coding::encode_uint_be(
                            bytes.len() as u64,
                            prefix_w,
                            &mut buf[..prefix_w],
                        )?;
                        buf[prefix_w..prefix_w + bytes.len()].copy_from_slice(&bytes);
                        Ok(Encoded::Inline(buf))
                    }
                    Scheme::Outrow => Ok(Encoded::Outrow(bytes)),
                }
            }
            (ColumnType::Array { element, limit, scheme, .. }, Value::Array(items)) => {
                if items.len() > *limit as usize {
                    return Err(AcdpError::new(
                        Status::Capacity,
                        Some("array value exceeds the column's declared max length"),
                    ));
                }
                let mut payload = vec![];
                crate::util::coding::put_fixed_u32(&mut payload, items.len() as u32);
                for item in items {
                    match element.encode(item, ctx)? {
                        Encoded::Inline(bytes) => payload.extend_from_slice(&bytes),
                        Encoded::Outrow(_) => {
                            return Err(AcdpError::new(
                                Status::Usage,
                                Some("array elements must be inrow-encodable simple values"),
                            ))
                        }
                    }
                }
                match scheme {
                    Scheme::Inrow => {
                        let elem_len = element.inline_len(ctx);
                        payload.resize(4 + (*limit as usize) * elem_len, 0);
                        Ok(Encoded::Inline(payload))
                    }
                    Scheme::Outrow => Ok(Encoded::Outrow(payload)),
                }
            }
            (ColumnType::RefArray { limit, scheme, .. }, Value::RefArray(refs)) => {
                if refs.len() > *limit as usize {
                    return Err(AcdpError::new(
                        Status::Capacity,
                        Some("reference array exceeds the column's declared max length"),
                    ));
                }
                let mut payload = vec![];
                crate::util::coding::put_fixed_u32(&mut payload, refs.len() as u32);
                for r in refs {
                    if *r > crate::util::coding::max_value_for_width(ctx.nobs_row_ref) {
                        return Err(AcdpError::new(
                            Status::Capacity,
                            Some("row reference does not fit in nobsRowRef bytes"),
                        ));
                    }
                    let mut buf = vec![0u8; ctx.nobs_row_ref];
                    crate::util::coding::encode_uint_be(*r, ctx.nobs_row_ref, &mut buf)?;
                    payload.extend_from_slice(&buf);
                }
                match scheme {
                    Scheme::Inrow => {
                        payload.resize(4 + (*limit as usize) * ctx.nobs_row_ref, 0);
                        Ok(Encoded::Inline(payload))
                    }
                    Scheme::Outrow => Ok(Encoded::Outrow(payload)),
                }
            }
            (ColumnType::Custom { .. }, _) => Err(AcdpError::new(
                Status::Usage,
                Some("custom column types require a registered factory outside the core"),
            )),
            _ => Err(AcdpError::new(
                Status::Usage,
                Some("value is not compatible with the column's declared type"),
            )),
        }
    }

    /// Decodes a value given its inline bytes (already sliced to
    /// `inline_len`) and, for outrow columns, its VL payload bytes.
    pub fn decode(&self, inline: &[u8], payload: Option<&[u8]>, ctx: &EncodeCtx) -> Result<Value> {
        match self {
            ColumnType::Bool { .. } => Ok(Value::Bool(inline[0] != 0)),
            ColumnType::Int { width, .. } => {
                let w = *width as usize;
                let mut buf = [0u8; 8];
                let sign_extend = inline[0] & 0x80 != 0;
                if sign_extend {
                    buf = [0xff; 8];
                }
                buf[8 - w..].copy_from_slice(&inline[..w]);
                Ok(Value::Int(i64::from_be_bytes(buf)))
            }
            ColumnType::Float32 { .. } => {
                let mut buf = [0u8; 4];
                buf.copy_from_slice(&inline[..4]);
                Ok(Value::F32(f32::from_be_bytes(buf)))
            }
            ColumnType::Float64 { .. } => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&inline[..8]);
                Ok(Value::F64(f64::from_be_bytes(buf)))
            }
            ColumnType::Ref { .. } => {
                Ok(Value::Ref(crate::util::coding::decode_uint_be(inline, ctx.nobs_row_ref)))
            }
            ColumnType::Str { limit, scheme, encoding, .. } => match scheme {
                Scheme::Inrow => {
                    let prefix_w = Self::inrow_length_prefix_width(*limit);
                    let len = crate::util::coding::decode_uint_be(&inline[..prefix_w], prefix_w) as usize;
                    if len > *limit as usize {
                        return Err(AcdpError::new(
                            Status::Corruption,
                            Some("decoded string length exceeds declared limit"),
                        ));
                    }
                    let bytes = &inline[prefix_w..prefix_w + len];
                    Ok(Value::Str(encoding.decode(bytes)?))
                }
                Scheme::Outrow => {
                    let bytes = payload.ok_or_else(|| {
                        AcdpError::new(Status::Corruption, Some("missing outrow payload for string column"))
                    })?;
                    Ok(Value::Str(encoding.decode(bytes)?))
                }
            },
            ColumnType::Array { element, limit, scheme, .. } => {
                let bytes: &[u8] = match scheme {
                    Scheme::Inrow => inline,
                    Scheme::Outrow => payload.ok_or_else(|| {
                        AcdpError::new(Status::Corruption, Some("missing outrow payload for array column"))
                    })?,
                };
                let count = crate::util::coding::decode_fixed_u32(&bytes[..4]) as usize;
                if count > *limit as usize {
                    return Err(AcdpError::new(
                        Status::Corruption,
                        Some("decoded array length exceeds declared max length"),
                    ));
                }
                let elem_len = element.inline_len(ctx);
                let mut items = Vec::with_capacity(count);
                let mut off = 4;
                for _ in 0..count {
                    items.push(element.decode(&bytes[off..off + elem_len], None, ctx)?);
                    off += elem_len;
                }
                Ok(Value::Array(items))
            }
            ColumnType::RefArray { limit, scheme, .. } => {
                let bytes: &[u8] = match scheme {
                    Scheme::Inrow => inline,
                    Scheme::Outrow => payload.ok_or_else(|| {
                        AcdpError::new(Status::Corruption, Some("missing outrow payload for ref-array column"))
                    })?,
                };
                let count = crate::util::coding::decode_fixed_u32(&bytes[..4]) as usize;
                if count > *limit as usize {
                    return Err(AcdpError::new(
                        Status::Corruption,
                        Some("decoded ref-array length exceeds declared max length"),
                    ));
                }
                let mut refs = Vec::with_capacity(count);
                let mut off = 4;
                for _ in 0..count {
                    refs.push(crate::util::coding::decode_uint_be(
                        &bytes[off..off + ctx.nobs_row_ref],
                        ctx.nobs_row_ref,
                    ));
                    off += ctx.nobs_row_ref;
                }
                Ok(Value::RefArray(refs))
            }
            ColumnType::Custom { .. } => Err(AcdpError::new(
                Status::Usage,
                Some("custom column types require a registered factory outside the core"),
            )),
        }
    }

    /// References carried by a value (for refcount maintenance), whether
    /// stored as a lone `Ref` or collected from a `RefArray`.
    pub fn references_in(value: &Value) -> Vec<u64> {
        match value {
            Value::Ref(r) => vec![*r],
            Value::RefArray(rs) => rs.clone(),
            _ => vec![],
        }
    }
}

/// Upper bound on the encoded length of a type descriptor string, used
/// only to presize buffers when serializing a whole layout file; kept in
/// step with `MAX_VARINT_LEN_U64` so descriptor and recorder encodings
/// share one constant family rather than two unrelated magic numbers.
pub const DESCRIPTOR_SCRATCH_HINT: usize = 64 + MAX_VARINT_LEN_U64;

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> EncodeCtx {
        EncodeCtx {
            nobs_row_ref: 3,
            nobs_outrow_ptr: 4,
        }
    }

    #[test]
    fn descriptor_round_trips_for_every_kind() {
        let cases = vec![
            ColumnType::Bool { nullable: true },
            ColumnType::Int { width: 8, nullable: false },
            ColumnType::Float32 { nullable: true },
            ColumnType::Str {
                limit: 40,
                nullable: false,
                scheme: Scheme::Inrow,
                encoding: TextEncoding::Utf8,
            },
            ColumnType::Str {
                limit: 4,
                nullable: true,
                scheme: Scheme::Outrow,
                encoding: TextEncoding::Utf8,
            },
            ColumnType::Array {
                element: Box::new(ColumnType::Int { width: 4, nullable: false }),
                limit: 8,
                nullable: false,
                scheme: Scheme::Outrow,
            },
        ];
        for case in cases {
            let desc = case.to_descriptor();
            let parsed = ColumnType::parse_descriptor(&desc).unwrap();
            assert_eq!(parsed, case, "round trip failed for {}", desc);
        }
    }

    #[test]
    fn encode_decode_round_trips_int() {
        let ty = ColumnType::Int { width: 8, nullable: false };
        let encoded = ty.encode(&Value::Int(30), &ctx()).unwrap();
        let Encoded::Inline(bytes) = encoded else { panic!("expected inline") };
        let decoded = ty.decode(&bytes, None, &ctx()).unwrap();
        assert_eq!(decoded, Value::Int(30));
    }

    #[test]
    fn encode_rejects_value_exceeding_limit() {
        let ty = ColumnType::Str {
            limit: 2,
            nullable: false,
            scheme: Scheme::Inrow,
            encoding: TextEncoding::Utf8,
        };
        let res = ty.encode(&Value::Str("abc".into()), &ctx());
        assert!(res.is_err());
        assert_eq!(res.unwrap_err().status(), Status::Capacity);
    }

    #[test]
    fn encode_rejects_null_on_non_nullable_column() {
        let ty = ColumnType::Int { width: 1, nullable: false };
        let res = ty.encode(&Value::Null, &ctx());
        assert_eq!(res.unwrap_err().status(), Status::Usage);
    }

    #[test]
    fn null_value_round_trips_through_deterministic_zero_fill() {
        let ty = ColumnType::Int { width: 4, nullable: true };
        let encoded = ty.encode(&Value::Null, &ctx()).unwrap();
        let Encoded::Inline(bytes) = encoded else { panic!("expected inline") };
        assert_eq!(bytes, vec![0, 0, 0, 0]);
    }

    #[test]
    fn ref_array_collects_references_for_refcounting() {
        let v = Value::RefArray(vec![1, 2, 3]);
        assert_eq!(ColumnType::references_in(&v), vec![1, 2, 3]);
    }
}
