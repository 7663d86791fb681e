//! Line program decoder: executes the line-number virtual machine encoded in
//! the dump, producing ordered address-keyed source-position sequences.
//!
//! The dump carries a directory table, a file-name table, and an instruction
//! stream. The decoder threads an explicit register record through the
//! stream; every end-of-sequence marker emits a final row, closes the
//! current sequence, and resets the registers to their initial values.
//! Directory and file tables are scoped to the whole dump, not per sequence.

use crate::model::{Diagnostic, FileTable, LineSequence, SourcePosition, Stream};
use crate::BuildError;
use regex::Regex;
use tracing::{trace, warn};

/// Decoder output: the sequences in dump order plus the file table, which
/// the subprogram index builder cross-references.
#[derive(Clone, Debug, Default)]
pub struct LineProgram {
    pub sequences: Vec<LineSequence>,
    pub files: FileTable,
}

/// The line-number machine's register file.
#[derive(Clone, Debug)]
struct Registers {
    address: u64,
    file: u64,
    line: i64,
    column: u64,
    is_stmt: bool,
    discriminator: u32,
}

impl Registers {
    fn initial() -> Self {
        Self {
            address: 0,
            file: 1,
            line: 1,
            column: 0,
            is_stmt: true,
            discriminator: 0,
        }
    }
}

struct Patterns {
    offset_prefix: Regex,
    set_address: Regex,
    special: Regex,
    advance_pc: Regex,
    advance_line: Regex,
    copy: Regex,
    set_column: Regex,
    set_is_stmt: Regex,
    set_file: Regex,
    set_discriminator: Regex,
    end_sequence: Regex,
    dir_row: Regex,
    file_row: Regex,
}

impl Patterns {
    fn new() -> Self {
        Self {
            offset_prefix: Regex::new(r"^\[0x[0-9A-Fa-f]+\]\s*").unwrap(),
            set_address: Regex::new(r"^Extended opcode \d+: set Address to 0x([0-9A-Fa-f]+)$")
                .unwrap(),
            special: Regex::new(
                r"^Special opcode \d+: advance Address by \d+ to 0x([0-9A-Fa-f]+)(?:\[\d+\])? and Line by -?\d+ to (-?\d+)(?:\s*\(view \d+\))?$",
            )
            .unwrap(),
            advance_pc: Regex::new(r"^Advance PC by (?:constant )?\d+ to 0x([0-9A-Fa-f]+)$")
                .unwrap(),
            advance_line: Regex::new(r"^Advance Line by -?\d+ to (-?\d+)$").unwrap(),
            copy: Regex::new(r"^Copy(?:\s*\(view \d+\))?$").unwrap(),
            set_column: Regex::new(r"^Set column to (\d+)$").unwrap(),
            set_is_stmt: Regex::new(r"^Set is_stmt to (\d+)$").unwrap(),
            set_file: Regex::new(r"^Set File Name to entry (\d+) in the File Name Table$")
                .unwrap(),
            set_discriminator: Regex::new(
                r"^Extended opcode \d+: set Discriminator to (\d+)$",
            )
            .unwrap(),
            end_sequence: Regex::new(r"^Extended opcode 1: End of Sequence$").unwrap(),
            dir_row: Regex::new(r"^(\d+)\s+(.+?)$").unwrap(),
            file_row: Regex::new(r"^(\d+)\s+(\d+)(?:\s+\d+\s+\d+)?\s+(.+?)$").unwrap(),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Region {
    Header,
    Directories,
    Files,
    Statements,
}

/// Decodes a line-number program dump.
pub fn parse(input: &str) -> Result<(LineProgram, Vec<Diagnostic>), BuildError> {
    let pat = Patterns::new();
    let mut out = LineProgram::default();
    let mut diagnostics = Vec::new();
    let mut directories: std::collections::BTreeMap<u64, String> = Default::default();
    let mut region = Region::Header;
    let mut regs = Registers::initial();
    let mut current = LineSequence::default();

    for (idx, raw) in input.lines().enumerate() {
        let lineno = idx + 1;
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with("The Directory Table") {
            region = Region::Directories;
            continue;
        }
        if line.starts_with("The File Name Table") {
            region = Region::Files;
            continue;
        }
        if line.starts_with("Line Number Statements") {
            region = Region::Statements;
            continue;
        }

        match region {
            Region::Header => trace!("skipping header line: {}", line),
            Region::Directories => {
                if let Some(c) = pat.dir_row.captures(line) {
                    if let Ok(index) = c[1].parse() {
                        directories.insert(index, string_payload(&c[2]));
                    }
                } else {
                    trace!("skipping directory-table line: {}", line);
                }
            }
            Region::Files => {
                if line.starts_with("Entry") {
                    continue;
                }
                if let Some(c) = pat.file_row.captures(line) {
                    let (Ok(index), Ok(dir)) = (c[1].parse::<u64>(), c[2].parse::<u64>()) else {
                        continue;
                    };
                    let name = string_payload(&c[3]);
                    let path = if dir != 0 {
                        match directories.get(&dir) {
                            Some(d) => format!("{}/{}", d, name),
                            None => {
                                warn!("file entry {} references unknown directory {}", index, dir);
                                name
                            }
                        }
                    } else {
                        name
                    };
                    out.files.insert(index, path);
                } else {
                    trace!("skipping file-table line: {}", line);
                }
            }
            Region::Statements => {
                let stmt = pat.offset_prefix.replace(line, "");
                step(
                    &pat,
                    stmt.as_ref(),
                    lineno,
                    &mut regs,
                    &mut current,
                    &mut out,
                    &mut diagnostics,
                )?;
            }
        }
    }

    if !current.rows.is_empty() {
        let message = "sequence not closed by an end-of-sequence marker".to_string();
        warn!("{}", message);
        diagnostics.push(Diagnostic::new(Stream::LineProgram, input.lines().count(), message));
    }

    Ok((out, diagnostics))
}

/// Applies one decoded statement to the register file.
fn step(
    pat: &Patterns,
    stmt: &str,
    lineno: usize,
    regs: &mut Registers,
    current: &mut LineSequence,
    out: &mut LineProgram,
    diagnostics: &mut Vec<Diagnostic>,
) -> Result<(), BuildError> {
    if let Some(c) = pat.set_address.captures(stmt) {
        regs.address = u64::from_str_radix(&c[1], 16).unwrap_or(0);
    } else if let Some(c) = pat.special.captures(stmt) {
        regs.address = u64::from_str_radix(&c[1], 16).unwrap_or(0);
        regs.line = c[2].parse().unwrap_or(regs.line);
        emit(regs, lineno, current, &out.files, diagnostics)?;
        regs.discriminator = 0;
    } else if let Some(c) = pat.advance_pc.captures(stmt) {
        regs.address = u64::from_str_radix(&c[1], 16).unwrap_or(0);
    } else if let Some(c) = pat.advance_line.captures(stmt) {
        regs.line = c[1].parse().unwrap_or(regs.line);
    } else if pat.copy.is_match(stmt) {
        emit(regs, lineno, current, &out.files, diagnostics)?;
        regs.discriminator = 0;
    } else if let Some(c) = pat.set_column.captures(stmt) {
        regs.column = c[1].parse().unwrap_or(0);
    } else if let Some(c) = pat.set_is_stmt.captures(stmt) {
        regs.is_stmt = &c[1] != "0";
    } else if let Some(c) = pat.set_file.captures(stmt) {
        regs.file = c[1].parse().unwrap_or(regs.file);
    } else if let Some(c) = pat.set_discriminator.captures(stmt) {
        regs.discriminator = c[1].parse().unwrap_or(0);
    } else if pat.end_sequence.is_match(stmt) {
        emit(regs, lineno, current, &out.files, diagnostics)?;
        out.sequences.push(std::mem::take(current));
        *regs = Registers::initial();
    } else {
        let message = format!("unrecognized statement: {}", stmt);
        warn!(line = lineno, "{}", message);
        diagnostics.push(Diagnostic::new(Stream::LineProgram, lineno, message));
    }
    Ok(())
}

/// Appends a row at the current address. The file register resolves through
/// the file table at emission time; a dump that emits rows without a file
/// table at all is structurally broken and fails the whole build, while a
/// single row pointing at an absent entry is dropped with a diagnostic.
fn emit(
    regs: &Registers,
    lineno: usize,
    current: &mut LineSequence,
    files: &FileTable,
    diagnostics: &mut Vec<Diagnostic>,
) -> Result<(), BuildError> {
    let Some(path) = files.get(regs.file) else {
        if files.is_empty() {
            return Err(BuildError::MissingFileTable);
        }
        let message = format!(
            "row references file entry {}, absent from the file name table",
            regs.file
        );
        warn!(line = lineno, "{}", message);
        diagnostics.push(Diagnostic::new(Stream::LineProgram, lineno, message));
        return Ok(());
    };
    current
        .rows
        .entry(regs.address)
        .or_default()
        .push(SourcePosition {
            file: path.to_string(),
            line: regs.line.max(0) as u64,
            column: regs.column,
            is_stmt: regs.is_stmt,
            discriminator: regs.discriminator,
        });
    Ok(())
}

/// Table cells may be rendered indirectly, e.g.
/// `(indirect line string, offset: 0x0): demo.c`.
fn string_payload(value: &str) -> String {
    match value.rfind("): ") {
        Some(pos) => value[pos + 3..].trim().to_string(),
        None => value.trim().to_string(),
    }
}
