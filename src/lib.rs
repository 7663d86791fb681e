//! Reconstruction of the mapping between machine instructions and the source
//! lines that produced them, from the textual dumps of a binary's debug
//! metadata.
//!
//! The inputs are four independent text streams produced by an external
//! disassembler/debug-info tool: a disassembly listing, a symbol table, a
//! debug-info tree, and a line-number program dump. Each is parsed by its
//! own builder (`disasm`, `symtab`, `subprogram`, `line_program`), and the
//! resulting views are reconciled by the `matcher`, which solves the one
//! genuinely hard problem in here: line-number sequences do not say which
//! binary section they describe, so the association has to be reconstructed
//! from geometry, instruction alignment, and symbol evidence.
//!
//! Everything is owned by a single [`LineMapDb`] snapshot. A reload builds a
//! fresh snapshot from scratch; callers who need concurrent readers swap the
//! finished snapshot in atomically (e.g. behind an `Arc`) so nobody ever
//! observes a partially-built table. The four builders are independent
//! single-pass parsers over disjoint inputs and could run in parallel; the
//! matcher is inherently sequential.

pub mod disasm;
pub mod line_program;
pub mod matcher;
pub mod model;
pub mod subprogram;
pub mod symtab;

pub use crate::matcher::MatchOutcome;
pub use crate::model::*;

use std::collections::BTreeMap;
use thiserror::Error;
use tracing::info;

/// A structural failure: the build as a whole is abandoned and no snapshot
/// is published. Single malformed lines never end up here; those become
/// [`Diagnostic`]s.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("disassembly listing contains no sections")]
    NoSections,
    #[error("line program emits rows but carries no file name table")]
    MissingFileTable,
}

/// A complete, immutable snapshot of one object file's debug information.
#[derive(Clone, Debug)]
pub struct LineMapDb {
    code: CodeTable,
    symbols: SymbolIndex,
    subprograms: SubprogramIndex,
    sequences: Vec<LineSequence>,
    matching: MatchingTable,
    duplicate_of: BTreeMap<SeqId, SeqId>,
    unmatched: Vec<SeqId>,
    /// section -> alias name -> code-table entry name.
    aliases: BTreeMap<String, BTreeMap<String, String>>,
    diagnostics: Vec<Diagnostic>,
}

/// Builds a snapshot from the four dump streams.
///
/// Unrecognized lines are collected as diagnostics, never errors; only
/// structural failures (no sections at all, rows without a file table)
/// abort the build.
pub fn parse_streams(
    disassembly: &str,
    symbol_table: &str,
    debug_info: &str,
    line_program_dump: &str,
) -> Result<LineMapDb, BuildError> {
    let (code, mut diagnostics) = disasm::parse(disassembly);
    if code.sections.is_empty() {
        return Err(BuildError::NoSections);
    }

    let symbols = symtab::parse(symbol_table);

    let (lines, line_diags) = line_program::parse(line_program_dump)?;
    diagnostics.extend(line_diags);

    let (nodes, info_diags) = subprogram::parse(debug_info);
    diagnostics.extend(info_diags);
    let subprograms = nodes.resolve(&lines.files);

    let outcome = matcher::match_sections(&code, &symbols, &subprograms, &lines.sequences);

    let aliases = build_aliases(&code, &symbols);

    info!(
        sections = code.sections.len(),
        sequences = lines.sequences.len(),
        duplicates = outcome.duplicate_of.len(),
        unmatched = outcome.unmatched.len(),
        diagnostics = diagnostics.len(),
        "snapshot built"
    );

    Ok(LineMapDb {
        code,
        symbols,
        subprograms,
        sequences: lines.sequences,
        matching: outcome.table,
        duplicate_of: outcome.duplicate_of,
        unmatched: outcome.unmatched,
        aliases,
        diagnostics,
    })
}

/// Symbol names that share a start address with a code-table entry are
/// aliases for it; lookups may use either name.
fn build_aliases(code: &CodeTable, symbols: &SymbolIndex) -> BTreeMap<String, BTreeMap<String, String>> {
    let mut aliases: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
    for (section, sc) in &code.sections {
        let Some(addr_map) = symbols.by_section.get(section) else {
            continue;
        };
        let starts: BTreeMap<u64, &str> = sc
            .entries
            .iter()
            .filter_map(|(name, insns)| Some((insns.first()?.address, name.as_str())))
            .collect();
        for (addr, entries) in addr_map {
            let Some(&entry_name) = starts.get(addr) else {
                continue;
            };
            for e in entries {
                if e.name != entry_name {
                    aliases
                        .entry(section.clone())
                        .or_default()
                        .insert(e.name.clone(), entry_name.to_string());
                }
            }
        }
    }
    aliases
}

impl LineMapDb {
    /// Section names in listing order.
    pub fn sections(&self) -> impl Iterator<Item = &str> + '_ {
        self.code.sections.keys().map(|s| s.as_str())
    }

    /// Entry names of a section, sorted by first instruction address.
    /// Entries with no instructions sort last.
    pub fn entries_of(&self, section: &str) -> Vec<&str> {
        let Some(sc) = self.code.sections.get(section) else {
            return Vec::new();
        };
        let mut names: Vec<(&str, u64)> = sc
            .entries
            .iter()
            .map(|(name, insns)| {
                (
                    name.as_str(),
                    insns.first().map_or(u64::MAX, |i| i.address),
                )
            })
            .collect();
        names.sort_by_key(|&(_, addr)| addr);
        names.into_iter().map(|(name, _)| name).collect()
    }

    /// Instructions of one symbol entry, in listing order. The entry may be
    /// named by its code-table name or by any symbol-table alias sharing its
    /// start address.
    pub fn instructions_of(&self, section: &str, entry: &str) -> Option<&[Instruction]> {
        let sc = self.code.sections.get(section)?;
        if let Some(insns) = sc.entries.get(entry) {
            return Some(insns);
        }
        let canonical = self.aliases.get(section)?.get(entry)?;
        sc.entries.get(canonical).map(|v| v.as_slice())
    }

    /// Resolves an address to the source positions recorded for it, if any.
    ///
    /// Many addresses have no line correspondence (mid-instruction bytes,
    /// padding); that is a `None`, not an error.
    pub fn resolve(&self, section: &str, address: u64) -> Option<&[SourcePosition]> {
        let SeqId(idx) = self.matching.lookup(section, address)?;
        self.sequences[idx]
            .rows
            .get(&address)
            .map(|v| v.as_slice())
    }

    /// Each instruction of an entry paired with its resolved positions.
    pub fn annotated_instructions(
        &self,
        section: &str,
        entry: &str,
    ) -> Option<Vec<(&Instruction, Option<&[SourcePosition]>)>> {
        let insns = self.instructions_of(section, entry)?;
        Some(
            insns
                .iter()
                .map(|i| (i, self.resolve(section, i.address)))
                .collect(),
        )
    }

    /// Per-file view of a section: source line to the addresses of the
    /// instructions that map to it.
    pub fn line_index(&self, section: &str) -> BTreeMap<&str, BTreeMap<u64, Vec<u64>>> {
        let mut index: BTreeMap<&str, BTreeMap<u64, Vec<u64>>> = BTreeMap::new();
        let Some(sc) = self.code.sections.get(section) else {
            return index;
        };
        for insn in sc.instructions() {
            let Some(positions) = self.resolve(section, insn.address) else {
                continue;
            };
            for p in positions {
                let addrs = index
                    .entry(p.file.as_str())
                    .or_default()
                    .entry(p.line)
                    .or_default();
                if addrs.last() != Some(&insn.address) {
                    addrs.push(insn.address);
                }
            }
        }
        index
    }

    pub fn sequences(&self) -> &[LineSequence] {
        &self.sequences
    }

    pub fn matching(&self) -> &MatchingTable {
        &self.matching
    }

    pub fn subprogram_decl(&self, name: &str) -> Option<&DeclCoord> {
        self.subprograms.decls.get(name)
    }

    pub fn symbols(&self) -> &SymbolIndex {
        &self.symbols
    }

    /// Sequences that were byte-identical duplicates of an earlier one; they
    /// inherit the representative's match.
    pub fn duplicate_of(&self, id: SeqId) -> Option<SeqId> {
        self.duplicate_of.get(&id).copied()
    }

    /// Sequences the best-effort pass could not place anywhere.
    pub fn unmatched(&self) -> &[SeqId] {
        &self.unmatched
    }

    /// Unrecognized-input reports accumulated across all four streams.
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// Summary counts, mostly useful to tell "no debug info" apart from
    /// "nothing parsed".
    pub fn stats(&self) -> Stats {
        Stats {
            sections: self.code.sections.len(),
            entries: self.code.sections.values().map(|s| s.entries.len()).sum(),
            symbols: self
                .symbols
                .by_section
                .values()
                .flat_map(|m| m.values())
                .map(Vec::len)
                .sum(),
            subprograms: self.subprograms.decls.len(),
            sequences: self.sequences.len(),
            duplicates: self.duplicate_of.len(),
            unmatched: self.unmatched.len(),
            diagnostics: self.diagnostics.len(),
        }
    }
}

/// Summary counts over one snapshot.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    pub sections: usize,
    pub entries: usize,
    pub symbols: usize,
    pub subprograms: usize,
    pub sequences: usize,
    pub duplicates: usize,
    pub unmatched: usize,
    pub diagnostics: usize,
}
