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

//! # Layout file
//!
//! The layout file is an external collaborator (§1): textual,
//! indentation-structured key/value tree. Parsing and serialization are
//! orthogonal to the tree shape itself, so this module is split in two:
//! [`node`] is the generic indentation-tree reader/writer, and
//! [`schema`] interprets a parsed tree as the database/table/column
//! structure §6 describes.

pub mod node;
pub mod schema;

pub use node::LayoutNode;
pub use schema::{ColumnLayout, DatabaseLayout, StoreLayout, TableLayout};
