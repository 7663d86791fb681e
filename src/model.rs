//! Data model types.
//!
//! This is our abstract description of the three views of a program that the
//! debug dumps give us -- instructions, symbols, and line-number sequences --
//! plus the matching table that reconciles them.

use indexmap::IndexMap;
use rangemap::RangeMap;
use std::collections::BTreeMap;
use std::ops::Range;

/// One machine instruction from the disassembly listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Instruction {
    /// Address of the first encoded byte.
    pub address: u64,
    /// Encoded bytes exactly as printed in the listing.
    pub bytes: Vec<u8>,
    /// Disassembled text. `None` for data/padding lines the external tool
    /// chose not to interpret; those still occupy address space.
    pub text: Option<String>,
}

impl Instruction {
    /// Address immediately past this instruction's bytes.
    pub fn end_address(&self) -> u64 {
        self.address + self.bytes.len() as u64
    }
}

/// Instructions of one section, grouped by symbol entry.
///
/// Entries are in first-seen listing order, and so are the instructions
/// within each entry. Addresses increase within one entry but not
/// necessarily across entries.
#[derive(Clone, Debug, Default)]
pub struct SectionCode {
    pub entries: IndexMap<String, Vec<Instruction>>,
}

impl SectionCode {
    /// Minimum instruction address in the section, if it has any
    /// instructions.
    pub fn lo_addr(&self) -> Option<u64> {
        self.instructions().map(|i| i.address).min()
    }

    /// Address immediately following the last instruction's bytes.
    pub fn hi_addr(&self) -> Option<u64> {
        self.instructions().map(|i| i.end_address()).max()
    }

    pub fn instructions(&self) -> impl Iterator<Item = &Instruction> + '_ {
        self.entries.values().flatten()
    }
}

/// Ordered per-section, per-entry instruction table produced from the
/// disassembly listing.
#[derive(Clone, Debug, Default)]
pub struct CodeTable {
    /// Sections in first-seen order.
    pub sections: IndexMap<String, SectionCode>,
}

/// One row of the symbol table dump, minus the address it is keyed under.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SymbolEntry {
    pub name: String,
    /// Start address plus the symbol's size.
    pub end_address: u64,
}

/// Per-section address-to-symbols index.
///
/// Multiple entries may share one address; those are aliases and the model
/// keeps all of them.
#[derive(Clone, Debug, Default)]
pub struct SymbolIndex {
    pub by_section: IndexMap<String, BTreeMap<u64, Vec<SymbolEntry>>>,
}

/// Source declaration coordinates of a subprogram.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeclCoord {
    pub file: String,
    pub line: u64,
}

/// Subprogram name to declaration coordinates, after abstract-origin
/// resolution. Unresolvable subprograms never make it in here.
#[derive(Clone, Debug, Default)]
pub struct SubprogramIndex {
    pub decls: BTreeMap<String, DeclCoord>,
}

/// File-name table from the line-program dump.
///
/// The debug-info tree indexes files the same way, so this table is shared
/// between the two builders.
#[derive(Clone, Debug, Default)]
pub struct FileTable {
    paths: BTreeMap<u64, String>,
}

impl FileTable {
    pub fn insert(&mut self, index: u64, path: String) {
        self.paths.insert(index, path);
    }

    pub fn get(&self, index: u64) -> Option<&str> {
        self.paths.get(&index).map(|s| s.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// One emitted row of the line-number program.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourcePosition {
    pub file: String,
    pub line: u64,
    pub column: u64,
    pub is_stmt: bool,
    /// Tie-breaker distinguishing multiple positions that legitimately share
    /// one address.
    pub discriminator: u32,
}

/// One contiguous run of the line-number program, terminated by an explicit
/// end-of-sequence marker. Sequences are the unit of section matching.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LineSequence {
    /// Address to positions recorded at that address, in emission order.
    /// One address may carry several positions; the list is never collapsed.
    pub rows: BTreeMap<u64, Vec<SourcePosition>>,
}

impl LineSequence {
    pub fn min_addr(&self) -> Option<u64> {
        self.rows.keys().next().copied()
    }

    pub fn max_addr(&self) -> Option<u64> {
        self.rows.keys().next_back().copied()
    }

    /// Half-open address span of the sequence. The maximum recorded address
    /// is the end-of-sequence marker, one past the code the sequence
    /// describes, so it is the exclusive bound. A single-row sequence still
    /// occupies one address.
    pub fn span(&self) -> Option<Range<u64>> {
        let lo = self.min_addr()?;
        let hi = self.max_addr()?;
        Some(lo..hi.max(lo + 1))
    }
}

/// Index of a sequence in the snapshot's sequence list.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct SeqId(pub usize);

/// The resolved assignment of sequences to sections.
///
/// Invariant: within each section the stored intervals are disjoint and
/// sorted by start address. `RangeMap` maintains this structurally; the
/// matcher is responsible for never splitting a stored span.
#[derive(Clone, Debug, Default)]
pub struct MatchingTable {
    pub by_section: IndexMap<String, RangeMap<u64, SeqId>>,
}

impl MatchingTable {
    /// Finds the sequence whose interval contains `address` in `section`.
    pub fn lookup(&self, section: &str, address: u64) -> Option<SeqId> {
        self.by_section.get(section)?.get(&address).copied()
    }
}

/// Which of the four input streams a diagnostic came from.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Stream {
    Disassembly,
    SymbolTable,
    DebugInfo,
    LineProgram,
}

impl std::fmt::Display for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            Stream::Disassembly => "disassembly",
            Stream::SymbolTable => "symbol table",
            Stream::DebugInfo => "debug info",
            Stream::LineProgram => "line program",
        };
        f.write_str(name)
    }
}

/// An input line that matched none of the known patterns, or another
/// recoverable oddity. Reported and skipped, never fatal -- dump formats
/// drift across tool versions.
#[derive(Clone, Debug)]
pub struct Diagnostic {
    pub stream: Stream,
    /// 1-based line number in the input stream.
    pub line_number: usize,
    pub message: String,
}

impl Diagnostic {
    pub fn new(stream: Stream, line_number: usize, message: impl Into<String>) -> Self {
        Self {
            stream,
            line_number,
            message: message.into(),
        }
    }
}
