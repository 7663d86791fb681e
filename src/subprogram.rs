//! Subprogram index builder: parses a textual debug-info tree into a
//! name-to-declaration index.
//!
//! The dump is a flat rendering of the debug-info node tree. Each node line
//! carries a node id and a tag; attribute lines that follow belong to the
//! most recent node. Only subprogram nodes are of interest here, and only a
//! handful of their attributes: name, linkage name (preferred), declaration
//! file index, declaration line, and an abstract-origin reference to an
//! earlier node.
//!
//! Resolution happens in a second pass: a subprogram keeps its own
//! `(file, line)` when present, otherwise it follows exactly one
//! abstract-origin hop and uses that node's own coordinates. Nodes still
//! missing a name or coordinates after the hop contribute no evidence and
//! are dropped silently. File indices are substituted with paths via the
//! file table decoded from the line-program dump, since the two dumps share
//! file indexing.

use crate::model::{DeclCoord, Diagnostic, FileTable, Stream, SubprogramIndex};
use regex::Regex;
use std::collections::BTreeMap;
use tracing::{trace, warn};

/// One node of the debug-info tree, reduced to the attributes the
/// subprogram index cares about.
#[derive(Clone, Debug, Default)]
struct Node {
    is_subprogram: bool,
    name: Option<String>,
    linkage_name: Option<String>,
    decl_file: Option<u64>,
    decl_line: Option<u64>,
    abstract_origin: Option<u64>,
}

/// The parsed node table, keyed by node id, in appearance order.
#[derive(Clone, Debug, Default)]
pub struct NodeTable {
    order: Vec<u64>,
    nodes: BTreeMap<u64, Node>,
}

struct Patterns {
    node: Regex,
    attr: Regex,
    origin_ref: Regex,
    integer: Regex,
}

impl Patterns {
    fn new() -> Self {
        Self {
            node: Regex::new(
                r"^\s*<\d+><(?:0x)?([0-9A-Fa-f]+)>:\s*Abbrev Number:\s*(\d+)(?:\s*\((\w+)\))?",
            )
            .unwrap(),
            attr: Regex::new(r"^\s*(?:<(?:0x)?[0-9A-Fa-f]+>\s+)?(DW_AT_\w+)\s*:?\s*(.*)$")
                .unwrap(),
            origin_ref: Regex::new(r"<(?:0x)?([0-9A-Fa-f]+)>").unwrap(),
            integer: Regex::new(r"\d+").unwrap(),
        }
    }
}

/// Parses the debug-info tree dump into a node table.
pub fn parse(input: &str) -> (NodeTable, Vec<Diagnostic>) {
    let pat = Patterns::new();
    let mut table = NodeTable::default();
    let mut diagnostics = Vec::new();
    let mut current: Option<u64> = None;

    for (idx, line) in input.lines().enumerate() {
        let lineno = idx + 1;
        if line.trim().is_empty() {
            continue;
        }
        if let Some(c) = pat.node.captures(line) {
            let Ok(id) = u64::from_str_radix(&c[1], 16) else {
                continue;
            };
            // Abbrev number 0 is a null entry closing a sibling chain.
            if &c[2] == "0" {
                current = None;
                continue;
            }
            let is_subprogram = c.get(3).map_or(false, |t| t.as_str() == "DW_TAG_subprogram");
            table.order.push(id);
            table.nodes.insert(
                id,
                Node {
                    is_subprogram,
                    ..Node::default()
                },
            );
            current = Some(id);
            continue;
        }
        if let Some(c) = pat.attr.captures(line) {
            let Some(id) = current else {
                let message = format!("attribute before any node: {}", line.trim());
                warn!(line = lineno, "{}", message);
                diagnostics.push(Diagnostic::new(Stream::DebugInfo, lineno, message));
                continue;
            };
            let node = table.nodes.get_mut(&id).unwrap();
            if !node.is_subprogram {
                continue;
            }
            let value = c[2].trim();
            match &c[1] {
                "DW_AT_name" => node.name = Some(string_value(value)),
                "DW_AT_linkage_name" | "DW_AT_MIPS_linkage_name" => {
                    node.linkage_name = Some(string_value(value))
                }
                "DW_AT_decl_file" => node.decl_file = integer_value(&pat, value),
                "DW_AT_decl_line" => node.decl_line = integer_value(&pat, value),
                "DW_AT_abstract_origin" => {
                    node.abstract_origin = pat
                        .origin_ref
                        .captures(value)
                        .and_then(|r| u64::from_str_radix(&r[1], 16).ok());
                }
                _ => {}
            }
            continue;
        }
        // Unit headers, section banners and the like never start with '<';
        // only lines that look structural but fail to parse are worth
        // reporting.
        if line.trim_start().starts_with('<') {
            let message = format!("unrecognized node line: {}", line.trim());
            warn!(line = lineno, "{}", message);
            diagnostics.push(Diagnostic::new(Stream::DebugInfo, lineno, message));
        } else {
            trace!("skipping header line: {}", line.trim());
        }
    }

    (table, diagnostics)
}

/// Attribute string values may be rendered indirectly, e.g.
/// `(indirect string, offset: 0x1c): main`. The payload is whatever follows
/// the last `): `.
fn string_value(value: &str) -> String {
    match value.rfind("): ") {
        Some(pos) => value[pos + 3..].trim().to_string(),
        None => value.to_string(),
    }
}

fn integer_value(pat: &Patterns, value: &str) -> Option<u64> {
    pat.integer.find(value)?.as_str().parse().ok()
}

impl NodeTable {
    /// Resolves the node table into a name-to-declaration index.
    ///
    /// First resolved record wins when two subprograms share a name, which
    /// keeps the result deterministic in appearance order.
    pub fn resolve(&self, files: &FileTable) -> SubprogramIndex {
        let mut index = SubprogramIndex::default();

        for id in &self.order {
            let node = &self.nodes[id];
            if !node.is_subprogram {
                continue;
            }
            let Some(name) = node.linkage_name.as_ref().or(node.name.as_ref()) else {
                continue;
            };
            let coords = match (node.decl_file, node.decl_line) {
                (Some(f), Some(l)) => Some((f, l)),
                // One abstract-origin hop, never chased further.
                _ => node.abstract_origin.and_then(|origin| {
                    let o = self.nodes.get(&origin)?;
                    Some((o.decl_file?, o.decl_line?))
                }),
            };
            let Some((file_index, line)) = coords else {
                trace!("dropping subprogram without coordinates: {}", name);
                continue;
            };
            let Some(file) = files.get(file_index) else {
                trace!("dropping subprogram with unknown file index: {}", name);
                continue;
            };
            index.decls.entry(name.clone()).or_insert(DeclCoord {
                file: file.to_string(),
                line,
            });
        }

        index
    }
}
