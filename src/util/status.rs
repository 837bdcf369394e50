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

use std::error::Error as StdError;
use std::fmt;
use std::io;

/// The error taxonomy of §7: each variant is a *kind* of failure, not a
/// single cause. `AcdpError::status()` is what callers match on; the
/// message and source are for humans and logs.
#[derive(Clone, Copy, Eq, PartialEq, Debug, Hash)]
pub enum Status {
    /// Null where not allowed, type incompatibility, out-of-range index,
    /// unknown column/table, invalid argument.
    Usage,
    /// FL slot count, VL offset, refcount, or encoded value exceeds a
    /// declared capacity bound (`nobsRowRef` / `nobsOutrowPtr` /
    /// `nobsRefCount` / column limit).
    Capacity,
    /// Illegal reference: out-of-range slot index, or reference to a row
    /// gap. See `AcdpError::row_gap`.
    Reference,
    /// Delete of a row with `refcount > 0`, or truncate of a referenced
    /// table.
    Constraint,
    /// Operation forbidden in the caller's current concurrency scope
    /// (writer inside a read zone, unit acquisition on a closed sync
    /// manager, nested unit opened from the wrong thread, ...).
    Concurrency,
    /// Recorder write failure, fsync failure, file-lock acquisition
    /// failure. Breaks the current unit and, on commit, the database.
    Durability,
    /// Persisted consistency tag does not match the schema-supplied tag
    /// at open time.
    Consistency,
    /// Cipher initialization or operation failure.
    Crypto,
    /// Bytes read from a data file fail a structural self-check
    /// (corrupted length, bad magic, truncated record).
    Corruption,
    /// Wraps a bare `std::io::Error` that doesn't carry its own status
    /// (surfaced to callers as `Durability` in most contexts; kept
    /// distinct here so the I/O error can still be inspected).
    IoError,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Usage => "usage error",
            Status::Capacity => "capacity error",
            Status::Reference => "reference error",
            Status::Constraint => "constraint error",
            Status::Concurrency => "concurrency error",
            Status::Durability => "durability error",
            Status::Consistency => "consistency error",
            Status::Crypto => "crypto error",
            Status::Corruption => "corruption",
            Status::IoError => "io error",
        };
        write!(f, "{}", s)
    }
}

/// The crate-wide error type. Modeled on wickdb's `WickErr`: a `Status`
/// tag, an optional human message, and an optional chained cause.
pub struct AcdpError {
    status: Status,
    message: Option<String>,
    /// Set only on the `Reference` status: distinguishes an out-of-range
    /// slot index from a reference to a live row gap.
    row_gap: bool,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl AcdpError {
    pub fn new(status: Status, message: Option<&str>) -> Self {
        Self {
            status,
            message: message.map(String::from),
            row_gap: false,
            source: None,
        }
    }

    pub fn reference(row_gap: bool, message: &str) -> Self {
        Self {
            status: Status::Reference,
            message: Some(message.to_owned()),
            row_gap,
            source: None,
        }
    }

    pub fn with_source(
        status: Status,
        message: &str,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self {
            status,
            message: Some(message.to_owned()),
            row_gap: false,
            source: Some(Box::new(source)),
        }
    }

    #[inline]
    pub fn status(&self) -> Status {
        self.status
    }

    #[inline]
    pub fn is_row_gap(&self) -> bool {
        self.row_gap
    }

    pub fn description(&self) -> &str {
        self.message.as_deref().unwrap_or("")
    }
}

impl fmt::Debug for AcdpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.description())
    }
}

impl fmt::Display for AcdpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.description())
    }
}

impl StdError for AcdpError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source.as_ref().map(|b| b.as_ref() as &(dyn StdError + 'static))
    }
}

impl From<io::Error> for AcdpError {
    fn from(e: io::Error) -> Self {
        AcdpError::with_source(Status::IoError, "io failure", e)
    }
}

pub type Result<T> = std::result::Result<T, AcdpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_error_carries_row_gap_flag() {
        let e = AcdpError::reference(true, "slot 4 is a gap");
        assert_eq!(e.status(), Status::Reference);
        assert!(e.is_row_gap());
        let e2 = AcdpError::reference(false, "slot 99 out of range");
        assert!(!e2.is_row_gap());
    }

    #[test]
    fn io_error_converts_to_io_status() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "missing");
        let e: AcdpError = io_err.into();
        assert_eq!(e.status(), Status::IoError);
        assert!(e.source().is_some());
    }
}
