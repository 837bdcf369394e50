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

//! File Space Manager (§4.2): the pair of files backing one table, FL
//! (fixed-length row slots) and VL (variable-length outrow blocks),
//! presented as a single unit so `TableStore` doesn't juggle two handles
//! and two locks.

pub mod fl;
pub mod vl;

pub use fl::FlSpace;
pub use vl::VlSpace;

use crate::recorder::{FileKind, RecordOp};
use crate::storage::{File, Storage};
use crate::util::status::Result;
use std::path::Path;
use std::sync::Arc;

/// The FL/VL pair for one table.
pub struct FileSpaceManager {
    pub fl: FlSpace,
    pub vl: VlSpace,
}

impl FileSpaceManager {
    pub fn open(
        storage: &dyn Storage,
        fl_path: &Path,
        vl_path: &Path,
        slot_size: usize,
        nobs_row_ref: usize,
        nobs_outrow_ptr: usize,
        nobs_ref_count: usize,
    ) -> Result<Self> {
        let fl_file: Arc<dyn File> = storage.create(fl_path)?;
        let vl_file: Arc<dyn File> = storage.create(vl_path)?;
        Ok(FileSpaceManager {
            fl: FlSpace::open(fl_file, slot_size, nobs_row_ref, nobs_ref_count)?,
            vl: VlSpace::open(vl_file, nobs_outrow_ptr)?,
        })
    }

    pub fn force_write(&self) -> Result<()> {
        self.fl.sync()?;
        self.vl.sync()
    }

    /// Rescans both files to rebuild the in-memory gap list and free-block
    /// index. Called after `apply_inverse` has rewritten raw bytes out
    /// from under them.
    pub fn rebuild(&self) -> Result<()> {
        self.fl.rebuild()?;
        self.vl.rebuild()
    }

    /// Undoes one recorded mutation against whichever file it names.
    pub fn apply_inverse(&self, kind: FileKind, offset: u64, op: &RecordOp) -> Result<()> {
        match kind {
            FileKind::Fl => self.fl.apply_inverse(offset, op),
            FileKind::Vl => self.vl.apply_inverse(offset, op),
        }
    }
}
