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

//! In-process configuration surface (§4.7). The layout file (§6) is the
//! on-disk configuration; `DbOptions` carries everything a caller
//! chooses per-open that has no on-disk representation, the same split
//! wickdb draws between `Options` and a persisted manifest.

use crate::cipher::CipherFactory;
use std::sync::Arc;

/// The five open-mode codes of §4.7, governing how aggressively idle
/// file handles are closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    /// Close idle file handles aggressively.
    CloseIdleAggressively,
    /// Close idle handles after `max(10, millis)` ms.
    CloseIdleAfterMillis(u64),
    /// Keep all handles open until the database closes.
    KeepAllOpen,
    /// Read-only open; rejected for a WR database.
    ReadOnly,
    /// Read-only open, variant 2; rejected for a WR database.
    ReadOnlyAlt,
}

impl OpenMode {
    /// Parses the integer code of §4.7: `0` / `n>0` / `-1` / `-2` / `-3`.
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => OpenMode::CloseIdleAggressively,
            n if n > 0 => OpenMode::CloseIdleAfterMillis(n.max(10) as u64),
            -1 => OpenMode::KeepAllOpen,
            -2 => OpenMode::ReadOnly,
            _ => OpenMode::ReadOnlyAlt,
        }
    }

    pub fn is_read_only(self) -> bool {
        matches!(self, OpenMode::ReadOnly | OpenMode::ReadOnlyAlt)
    }
}

/// Call-scoped configuration for opening a WR database.
pub struct DbOptions {
    pub open_mode: OpenMode,
    /// Overrides the layout file's `forceWriteCommit` setting when set.
    pub force_write_commit_override: Option<bool>,
    pub cipher_factory: Option<Arc<dyn CipherFactory>>,
    /// When set, `Database::open` fails with `Status::Consistency` unless
    /// this matches the layout file's persisted `consistencyNumber`. Lets
    /// a caller refuse to open a database whose on-disk schema tag has
    /// drifted from the one it was built against.
    pub expected_consistency_number: Option<i64>,
}

impl DbOptions {
    pub fn new() -> Self {
        DbOptions {
            open_mode: OpenMode::KeepAllOpen,
            force_write_commit_override: None,
            cipher_factory: None,
            expected_consistency_number: None,
        }
    }
}

impl Default for DbOptions {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_mode_from_code_matches_spec_boundaries() {
        assert_eq!(OpenMode::from_code(0), OpenMode::CloseIdleAggressively);
        assert_eq!(OpenMode::from_code(5), OpenMode::CloseIdleAfterMillis(10));
        assert_eq!(OpenMode::from_code(50), OpenMode::CloseIdleAfterMillis(50));
        assert_eq!(OpenMode::from_code(-1), OpenMode::KeepAllOpen);
        assert!(OpenMode::from_code(-2).is_read_only());
        assert!(OpenMode::from_code(-3).is_read_only());
    }
}
