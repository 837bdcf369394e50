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

#![allow(clippy::unreadable_literal)]
#![allow(clippy::type_complexity)]
// See https://github.com/rust-lang/rust-clippy/issues/1608
#![allow(clippy::redundant_closure)]

extern crate libc;
#[macro_use]
extern crate log;
#[macro_use]
extern crate lazy_static;
extern crate crc;

pub mod cipher;
pub mod codec;
pub mod db;
pub mod fsm;
pub mod layout;
mod logger;
pub mod options;
pub mod recorder;
pub mod storage;
pub mod sync_mgr;
pub mod table;
pub mod unit;
mod util;

pub use cipher::{CipherFactory, NullCipherFactory, StreamCipher};
pub use codec::{ColumnType, Encoded, Scheme, Value};
pub use db::{Database, RoConverter};
pub use layout::{ColumnLayout, DatabaseLayout, StoreLayout, TableLayout};
pub use log::{LevelFilter, Log};
pub use options::{DbOptions, OpenMode};
pub use recorder::{Record, RecordSink};
pub use storage::{File, FileLock, MemStorage, PosixStorage, Storage};
pub use sync_mgr::ReadZoneGuard;
pub use table::{RefChange, RowIterator, TableStore};
pub use unit::Unit;
pub use util::status::{AcdpError, Result, Status};
