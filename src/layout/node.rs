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

//! Generic textual indentation tree: `key: value` or bare `key` lines,
//! where a line's children are every following line indented strictly
//! further than it, up to the next line at the same or shallower
//! indent. Blank lines and lines whose first non-space character is `#`
//! are ignored. Indentation must be spaces; a tab is a parse error.

use crate::util::status::{AcdpError, Result, Status};
use std::fmt::Write as _;

#[derive(Clone, Debug, PartialEq)]
pub enum LayoutNode {
    /// A leaf carries its raw value text (possibly empty).
    Leaf(String),
    /// An internal node's children, in file order. Keys are not
    /// deduplicated by the parser; `tables` trees rely on every table
    /// name being unique, which is validated in `schema`.
    Tree(Vec<(String, LayoutNode)>),
}

impl LayoutNode {
    pub fn get(&self, key: &str) -> Option<&LayoutNode> {
        match self {
            LayoutNode::Tree(children) => children.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            LayoutNode::Leaf(_) => None,
        }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.get(key)? {
            LayoutNode::Leaf(s) => Some(s.as_str()),
            LayoutNode::Tree(_) => None,
        }
    }

    pub fn require_str(&self, key: &str) -> Result<&str> {
        self.get_str(key).ok_or_else(|| {
            AcdpError::new(
                Status::Usage,
                Some(&format!("layout file is missing required key '{}'", key)),
            )
        })
    }

    pub fn children(&self) -> &[(String, LayoutNode)] {
        match self {
            LayoutNode::Tree(c) => c,
            LayoutNode::Leaf(_) => &[],
        }
    }

    /// Parses a full layout document into a root `Tree`.
    pub fn parse(text: &str) -> Result<LayoutNode> {
        let mut lines = vec![];
        for (lineno, raw) in text.lines().enumerate() {
            let trimmed = raw.trim_end();
            if trimmed.trim_start().is_empty() || trimmed.trim_start().starts_with('#') {
                continue;
            }
            if trimmed.contains('\t') {
                return Err(AcdpError::new(
                    Status::Usage,
                    Some(&format!("layout file line {} uses a tab for indentation", lineno + 1)),
                ));
            }
            let indent = trimmed.len() - trimmed.trim_start().len();
            lines.push((indent, trimmed.trim_start().to_owned(), lineno + 1));
        }
        let mut pos = 0;
        let children = parse_block(&lines, &mut pos, 0)?;
        if pos != lines.len() {
            return Err(AcdpError::new(
                Status::Usage,
                Some("layout file has inconsistent indentation"),
            ));
        }
        Ok(LayoutNode::Tree(children))
    }

    /// Serializes this node back to indentation-structured text. Round
    /// trips with `parse` for any tree the parser can produce (modulo
    /// comments and blank lines, which are not preserved).
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        write_node(self, 0, &mut out);
        out
    }
}

fn parse_block(
    lines: &[(usize, String, usize)],
    pos: &mut usize,
    indent: usize,
) -> Result<Vec<(String, LayoutNode)>> {
    let mut children = vec![];
    while *pos < lines.len() {
        let (line_indent, content, lineno) = &lines[*pos];
        if *line_indent < indent {
            break;
        }
        if *line_indent > indent {
            return Err(AcdpError::new(
                Status::Usage,
                Some(&format!("layout file line {} is indented unexpectedly", lineno)),
            ));
        }
        let (key, value) = split_key_value(content);
        *pos += 1;
        let child_indent = lines.get(*pos).map(|(i, ..)| *i);
        let node = if let Some(ci) = child_indent {
            if ci > indent {
                let nested = parse_block(lines, pos, ci)?;
                LayoutNode::Tree(nested)
            } else {
                LayoutNode::Leaf(value.unwrap_or_default())
            }
        } else {
            LayoutNode::Leaf(value.unwrap_or_default())
        };
        children.push((key, node));
    }
    Ok(children)
}

fn split_key_value(line: &str) -> (String, Option<String>) {
    match line.split_once(':') {
        Some((k, v)) => (k.trim().to_owned(), Some(v.trim().to_owned())),
        None => (line.trim().to_owned(), None),
    }
}

fn write_node(node: &LayoutNode, depth: usize, out: &mut String) {
    if let LayoutNode::Tree(children) = node {
        for (key, child) in children {
            let pad = "  ".repeat(depth);
            match child {
                LayoutNode::Leaf(v) if v.is_empty() => {
                    let _ = writeln!(out, "{}{}", pad, key);
                }
                LayoutNode::Leaf(v) => {
                    let _ = writeln!(out, "{}{}: {}", pad, key, v);
                }
                LayoutNode::Tree(_) => {
                    let _ = writeln!(out, "{}{}", pad, key);
                    write_node(child, depth + 1, out);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flat_key_values() {
        let text = "name: mydb\nversion: 1.0\nconsistencyNumber: 7\n";
        let tree = LayoutNode::parse(text).unwrap();
        assert_eq!(tree.get_str("name"), Some("mydb"));
        assert_eq!(tree.get_str("consistencyNumber"), Some("7"));
    }

    #[test]
    fn parses_nested_tree() {
        let text = "tables\n  people\n    columns\n      name: str\n    store\n      nobsRowRef: 3\n";
        let tree = LayoutNode::parse(text).unwrap();
        let tables = tree.get("tables").unwrap();
        let people = tables.get("people").unwrap();
        let store = people.get("store").unwrap();
        assert_eq!(store.get_str("nobsRowRef"), Some("3"));
    }

    #[test]
    fn ignores_blank_lines_and_comments() {
        let text = "# a comment\nname: mydb\n\n# another\nversion: 2\n";
        let tree = LayoutNode::parse(text).unwrap();
        assert_eq!(tree.get_str("name"), Some("mydb"));
        assert_eq!(tree.get_str("version"), Some("2"));
    }

    #[test]
    fn rejects_tab_indentation() {
        let text = "tables\n\tpeople\n";
        assert!(LayoutNode::parse(text).is_err());
    }

    #[test]
    fn rejects_indentation_jump_without_parent() {
        let text = "name: mydb\n    version: 2\n";
        assert!(LayoutNode::parse(text).is_err());
    }

    #[test]
    fn serialize_round_trips_through_parse() {
        let text = "name: mydb\ntables\n  people\n    nobsRowRef: 3\n";
        let tree = LayoutNode::parse(text).unwrap();
        let serialized = tree.serialize();
        let reparsed = LayoutNode::parse(&serialized).unwrap();
        assert_eq!(tree, reparsed);
    }
}
