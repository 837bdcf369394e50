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

//! Interprets a parsed [`LayoutNode`] tree as the database/table/column
//! schema §6 names. This is the only place that knows the specific keys
//! (`name`, `tables`, `store`, ...); everything above treats the layout
//! file as an opaque collaborator.

use super::node::LayoutNode;
use crate::codec::ColumnType;
use crate::util::status::{AcdpError, Result, Status};

#[derive(Clone, Debug)]
pub struct ColumnLayout {
    pub name: String,
    pub type_desc: String,
    pub type_factory_class_name: Option<String>,
    pub type_factory_classpath: Option<String>,
    pub refd_table: Option<String>,
}

impl ColumnLayout {
    pub fn resolve_type(&self) -> Result<ColumnType> {
        let ty = ColumnType::parse_descriptor(&self.type_desc)?;
        Ok(match &self.refd_table {
            Some(t) => ty.with_referenced_table(t.clone()),
            None => ty,
        })
    }
}

#[derive(Clone, Debug)]
pub struct StoreLayout {
    pub fl_data_file: String,
    pub vl_data_file: Option<String>,
    pub nobs_row_ref: usize,
    pub nobs_outrow_ptr: usize,
    pub nobs_ref_count: usize,
}

#[derive(Clone, Debug)]
pub struct TableLayout {
    pub name: String,
    pub columns: Vec<ColumnLayout>,
    pub store: StoreLayout,
}

#[derive(Clone, Debug)]
pub struct DatabaseLayout {
    pub name: String,
    pub version: Option<String>,
    pub consistency_number: i64,
    pub cipher_factory_class_name: Option<String>,
    pub cipher_factory_classpath: Option<String>,
    pub cipher_challenge: Option<String>,
    pub force_write_commit: bool,
    pub rec_file: String,
    pub tables: Vec<TableLayout>,
}

impl DatabaseLayout {
    pub fn parse(text: &str) -> Result<Self> {
        let root = LayoutNode::parse(text)?;
        Self::from_node(&root)
    }

    pub fn from_node(root: &LayoutNode) -> Result<Self> {
        let name = root.require_str("name")?.to_owned();
        let version = root.get_str("version").map(String::from);
        let consistency_number = root
            .get_str("consistencyNumber")
            .unwrap_or("0")
            .parse::<i64>()
            .map_err(|_| {
                AcdpError::new(Status::Usage, Some("consistencyNumber is not an integer"))
            })?;

        let cipher_factory_class_name = root.get_str("cipherFactoryClassName").map(String::from);
        let cipher_factory_classpath = root.get_str("cipherFactoryClasspath").map(String::from);
        let cipher_challenge = root.get_str("cipherChallenge").map(String::from);
        if cipher_factory_class_name.is_some() != cipher_challenge.is_some() {
            return Err(AcdpError::new(
                Status::Usage,
                Some("cipherFactoryClassName and cipherChallenge must both be present or both absent"),
            ));
        }

        let force_write_commit = match root.get_str("forceWriteCommit") {
            Some("on") => true,
            Some("off") | None => false,
            Some(other) => {
                return Err(AcdpError::new(
                    Status::Usage,
                    Some(&format!("forceWriteCommit must be 'on' or 'off', got '{}'", other)),
                ))
            }
        };

        let rec_file = root.require_str("recFile")?.to_owned();

        let tables_node = root.get("tables").ok_or_else(|| {
            AcdpError::new(Status::Usage, Some("layout file has no 'tables' section"))
        })?;
        let mut tables = vec![];
        for (table_name, table_node) in tables_node.children() {
            tables.push(TableLayout::from_node(table_name, table_node)?);
        }
        let mut seen = std::collections::HashSet::new();
        for t in &tables {
            if !seen.insert(t.name.as_str()) {
                return Err(AcdpError::new(
                    Status::Usage,
                    Some(&format!("duplicate table name '{}' in layout file", t.name)),
                ));
            }
        }

        Ok(DatabaseLayout {
            name,
            version,
            consistency_number,
            cipher_factory_class_name,
            cipher_factory_classpath,
            cipher_challenge,
            force_write_commit,
            rec_file,
            tables,
        })
    }

    pub fn to_node(&self) -> LayoutNode {
        let mut children = vec![
            ("name".to_owned(), LayoutNode::Leaf(self.name.clone())),
        ];
        if let Some(v) = &self.version {
            children.push(("version".to_owned(), LayoutNode::Leaf(v.clone())));
        }
        children.push((
            "consistencyNumber".to_owned(),
            LayoutNode::Leaf(self.consistency_number.to_string()),
        ));
        if let Some(c) = &self.cipher_factory_class_name {
            children.push(("cipherFactoryClassName".to_owned(), LayoutNode::Leaf(c.clone())));
            if let Some(cp) = &self.cipher_factory_classpath {
                children.push(("cipherFactoryClasspath".to_owned(), LayoutNode::Leaf(cp.clone())));
            }
            if let Some(ch) = &self.cipher_challenge {
                children.push(("cipherChallenge".to_owned(), LayoutNode::Leaf(ch.clone())));
            }
        }
        children.push((
            "forceWriteCommit".to_owned(),
            LayoutNode::Leaf(if self.force_write_commit { "on" } else { "off" }.to_owned()),
        ));
        children.push(("recFile".to_owned(), LayoutNode::Leaf(self.rec_file.clone())));

        let table_children = self
            .tables
            .iter()
            .map(|t| (t.name.clone(), t.to_node()))
            .collect();
        children.push(("tables".to_owned(), LayoutNode::Tree(table_children)));
        LayoutNode::Tree(children)
    }
}

impl TableLayout {
    fn from_node(name: &str, node: &LayoutNode) -> Result<Self> {
        let columns_node = node.get("columns").ok_or_else(|| {
            AcdpError::new(
                Status::Usage,
                Some(&format!("table '{}' has no 'columns' section", name)),
            )
        })?;
        let mut columns = vec![];
        for (col_name, col_node) in columns_node.children() {
            columns.push(ColumnLayout {
                name: col_name.clone(),
                type_desc: col_node.require_str("typeDesc")?.to_owned(),
                type_factory_class_name: col_node.get_str("typeFactoryClassName").map(String::from),
                type_factory_classpath: col_node.get_str("typeFactoryClasspath").map(String::from),
                refd_table: col_node.get_str("refdTable").map(String::from),
            });
        }

        let store_node = node.get("store").ok_or_else(|| {
            AcdpError::new(
                Status::Usage,
                Some(&format!("table '{}' has no 'store' section", name)),
            )
        })?;
        let store = StoreLayout {
            fl_data_file: store_node.require_str("flDataFile")?.to_owned(),
            vl_data_file: store_node.get_str("vlDataFile").map(String::from),
            nobs_row_ref: parse_width(store_node, "nobsRowRef")?,
            nobs_outrow_ptr: parse_width(store_node, "nobsOutrowPtr")?,
            nobs_ref_count: parse_width(store_node, "nobsRefCount")?,
        };

        Ok(TableLayout {
            name: name.to_owned(),
            columns,
            store,
        })
    }

    fn to_node(&self) -> LayoutNode {
        let col_children = self
            .columns
            .iter()
            .map(|c| {
                let mut fields = vec![("typeDesc".to_owned(), LayoutNode::Leaf(c.type_desc.clone()))];
                if let Some(v) = &c.type_factory_class_name {
                    fields.push(("typeFactoryClassName".to_owned(), LayoutNode::Leaf(v.clone())));
                }
                if let Some(v) = &c.type_factory_classpath {
                    fields.push(("typeFactoryClasspath".to_owned(), LayoutNode::Leaf(v.clone())));
                }
                if let Some(v) = &c.refd_table {
                    fields.push(("refdTable".to_owned(), LayoutNode::Leaf(v.clone())));
                }
                (c.name.clone(), LayoutNode::Tree(fields))
            })
            .collect();

        let mut store_fields = vec![(
            "flDataFile".to_owned(),
            LayoutNode::Leaf(self.store.fl_data_file.clone()),
        )];
        if let Some(v) = &self.store.vl_data_file {
            store_fields.push(("vlDataFile".to_owned(), LayoutNode::Leaf(v.clone())));
        }
        store_fields.push(("nobsRowRef".to_owned(), LayoutNode::Leaf(self.store.nobs_row_ref.to_string())));
        store_fields.push((
            "nobsOutrowPtr".to_owned(),
            LayoutNode::Leaf(self.store.nobs_outrow_ptr.to_string()),
        ));
        store_fields.push((
            "nobsRefCount".to_owned(),
            LayoutNode::Leaf(self.store.nobs_ref_count.to_string()),
        ));

        LayoutNode::Tree(vec![
            ("columns".to_owned(), LayoutNode::Tree(col_children)),
            ("store".to_owned(), LayoutNode::Tree(store_fields)),
        ])
    }
}

fn parse_width(node: &LayoutNode, key: &str) -> Result<usize> {
    let raw = node.require_str(key)?;
    let v: usize = raw
        .parse()
        .map_err(|_| AcdpError::new(Status::Usage, Some(&format!("'{}' is not an integer", key))))?;
    if !(1..=8).contains(&v) {
        return Err(AcdpError::new(
            Status::Usage,
            Some(&format!("'{}' must be between 1 and 8 bytes", key)),
        ));
    }
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> &'static str {
        "name: mydb\n\
         version: 1.0\n\
         consistencyNumber: 3\n\
         forceWriteCommit: on\n\
         recFile: mydb.rec\n\
         tables\n\
         \x20\x20people\n\
         \x20\x20\x20\x20columns\n\
         \x20\x20\x20\x20\x20\x20name\n\
         \x20\x20\x20\x20\x20\x20\x20\x20typeDesc: str:notnull:inrow:40:utf8\n\
         \x20\x20\x20\x20\x20\x20age\n\
         \x20\x20\x20\x20\x20\x20\x20\x20typeDesc: i1:null:inrow:0\n\
         \x20\x20\x20\x20store\n\
         \x20\x20\x20\x20\x20\x20flDataFile: people.fl\n\
         \x20\x20\x20\x20\x20\x20nobsRowRef: 3\n\
         \x20\x20\x20\x20\x20\x20nobsOutrowPtr: 4\n\
         \x20\x20\x20\x20\x20\x20nobsRefCount: 2\n"
    }

    #[test]
    fn parses_a_full_database_layout() {
        let layout = DatabaseLayout::parse(sample()).unwrap();
        assert_eq!(layout.name, "mydb");
        assert_eq!(layout.tables.len(), 1);
        let people = &layout.tables[0];
        assert_eq!(people.columns.len(), 2);
        assert_eq!(people.store.nobs_row_ref, 3);
        assert!(layout.force_write_commit);
    }

    #[test]
    fn column_resolves_to_a_column_type() {
        let layout = DatabaseLayout::parse(sample()).unwrap();
        let name_col = &layout.tables[0].columns[0];
        let ty = name_col.resolve_type().unwrap();
        assert!(!ty.nullable());
    }

    #[test]
    fn round_trips_through_to_node_and_parse() {
        let layout = DatabaseLayout::parse(sample()).unwrap();
        let serialized = layout.to_node().serialize();
        let reparsed = DatabaseLayout::parse(&serialized).unwrap();
        assert_eq!(reparsed.name, layout.name);
        assert_eq!(reparsed.tables[0].store.nobs_row_ref, layout.tables[0].store.nobs_row_ref);
    }

    #[test]
    fn rejects_mismatched_cipher_fields() {
        let text = "name: mydb\nconsistencyNumber: 1\nrecFile: x.rec\ncipherFactoryClassName: Foo\ntables\n  t\n    columns\n      c\n        typeDesc: bool:notnull:inrow:0\n    store\n      flDataFile: t.fl\n      nobsRowRef: 1\n      nobsOutrowPtr: 1\n      nobsRefCount: 1\n";
        assert!(DatabaseLayout::parse(text).is_err());
    }
}
