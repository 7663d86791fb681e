//! Code table builder: parses a disassembly listing into an ordered,
//! per-section, per-symbol instruction table.
//!
//! The listing is the text produced by an external disassembler. Recognized
//! line shapes: section start, symbol entry header, instruction, relocation
//! annotation, blank, and the file-format banner. Anything else is reported
//! as a diagnostic and skipped; parsing never aborts.

use crate::model::{CodeTable, Diagnostic, Instruction, Stream};
use regex::{NoExpand, Regex};
use tracing::warn;

struct Patterns {
    section: Regex,
    entry: Regex,
    reloc: Regex,
    insn: Regex,
    offset_suffix: Regex,
    target: Regex,
}

impl Patterns {
    fn new() -> Self {
        Self {
            section: Regex::new(r"^Disassembly of section (\S+):\s*$").unwrap(),
            entry: Regex::new(r"^([0-9A-Fa-f]+)\s+<(.+)>:\s*$").unwrap(),
            reloc: Regex::new(r"^\s*([0-9A-Fa-f]+):\s+(R_\S+)\s+(\S+)\s*$").unwrap(),
            insn: Regex::new(
                r"^\s*([0-9A-Fa-f]+):\s+([0-9A-Fa-f]{2}(?: ?[0-9A-Fa-f]{2})*)\s*(?:\t\s*(.*?))?\s*$",
            )
            .unwrap(),
            offset_suffix: Regex::new(r"[+-](?:0x[0-9A-Fa-f]+|\d+)$").unwrap(),
            target: Regex::new(r"<[^>]*>").unwrap(),
        }
    }
}

/// Parses a disassembly listing.
///
/// Sections keep first-seen order; instructions keep listing order within
/// their entry.
pub fn parse(input: &str) -> (CodeTable, Vec<Diagnostic>) {
    let pat = Patterns::new();
    let mut table = CodeTable::default();
    let mut diagnostics = Vec::new();

    // (section, entry) the most recent instruction was appended to, for
    // relocation rewrites.
    let mut cursor: Option<(String, String)> = None;
    let mut current_section: Option<String> = None;
    let mut current_entry: Option<String> = None;

    for (idx, line) in input.lines().enumerate() {
        let lineno = idx + 1;
        if line.trim().is_empty() {
            continue;
        }
        if line.contains("file format") {
            continue;
        }
        if let Some(c) = pat.section.captures(line) {
            let name = c[1].to_string();
            table.sections.entry(name.clone()).or_default();
            current_section = Some(name);
            current_entry = None;
            continue;
        }
        if let Some(c) = pat.entry.captures(line) {
            let Some(section) = &current_section else {
                report(
                    &mut diagnostics,
                    lineno,
                    format!("symbol entry outside any section: {}", line.trim()),
                );
                continue;
            };
            let name = c[2].to_string();
            table
                .sections
                .entry(section.clone())
                .or_default()
                .entries
                .entry(name.clone())
                .or_default();
            current_entry = Some(name);
            continue;
        }
        // Relocations look superficially like instructions; test them first.
        if let Some(c) = pat.reloc.captures(line) {
            let symbol = pat.offset_suffix.replace(&c[3], "").into_owned();
            match last_instruction(&mut table, &cursor) {
                Some(insn) => rewrite_target(&pat, insn, &symbol),
                None => report(
                    &mut diagnostics,
                    lineno,
                    format!("relocation with no preceding instruction: {}", line.trim()),
                ),
            }
            continue;
        }
        if let Some(c) = pat.insn.captures(line) {
            let (Some(section), Some(entry)) = (&current_section, &current_entry) else {
                report(
                    &mut diagnostics,
                    lineno,
                    format!("instruction outside any symbol entry: {}", line.trim()),
                );
                continue;
            };
            // The address field is hex with no prefix.
            let Ok(address) = u64::from_str_radix(&c[1], 16) else {
                report(&mut diagnostics, lineno, format!("bad address: {}", &c[1]));
                continue;
            };
            let bytes = parse_bytes(&c[2]);
            let text = c
                .get(3)
                .map(|m| m.as_str().trim())
                .filter(|t| !t.is_empty())
                .map(str::to_string);
            table.sections[section.as_str()].entries[entry.as_str()].push(Instruction {
                address,
                bytes,
                text,
            });
            cursor = Some((section.clone(), entry.clone()));
            continue;
        }
        report(
            &mut diagnostics,
            lineno,
            format!("unrecognized line: {}", line.trim()),
        );
    }

    (table, diagnostics)
}

fn report(diagnostics: &mut Vec<Diagnostic>, lineno: usize, message: String) {
    warn!(line = lineno, "{}", message);
    diagnostics.push(Diagnostic::new(Stream::Disassembly, lineno, message));
}

fn last_instruction<'t>(
    table: &'t mut CodeTable,
    cursor: &Option<(String, String)>,
) -> Option<&'t mut Instruction> {
    let (section, entry) = cursor.as_ref()?;
    table
        .sections
        .get_mut(section)?
        .entries
        .get_mut(entry)?
        .last_mut()
}

/// Rewrites the instruction's symbolic operand target to the relocation's
/// symbol name. The listing's own guess (often a bogus local offset) is
/// replaced wholesale.
fn rewrite_target(pat: &Patterns, insn: &mut Instruction, symbol: &str) {
    let replacement = format!("<{}>", symbol);
    match &insn.text {
        Some(text) if pat.target.is_match(text) => {
            // NoExpand: `$` is common in symbol names (ARM mapping symbols,
            // compiler-generated locals) and must not be treated as a
            // capture-group reference.
            insn.text =
                Some(pat.target.replace(text, NoExpand(replacement.as_str())).into_owned());
        }
        Some(text) => {
            insn.text = Some(format!("{} {}", text, replacement));
        }
        None => {}
    }
}

fn parse_bytes(field: &str) -> Vec<u8> {
    let hex: String = field.chars().filter(|c| !c.is_whitespace()).collect();
    hex.as_bytes()
        .chunks(2)
        .filter_map(|pair| {
            let s = std::str::from_utf8(pair).ok()?;
            u8::from_str_radix(s, 16).ok()
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    const LISTING: &str = "\
demo.elf:     file format elf64-littleaarch64

Disassembly of section .text:

0000000000400078 <_start>:
  400078:\td2800540 \tmov\tx0, #0x2a
  40007c:\t94000002 \tbl\t400084 <compute+0x4>
\t\t40007c: R_AARCH64_CALL26\tcompute+0x4

0000000000400084 <compute>:
  400084:\t91000400 \tadd\tx0, x0, #0x1
  400088:\td65f03c0 \tret

Disassembly of section .init:

0000000000400000 <_init>:
  400000:\t00 00
";

    #[test]
    fn sections_and_entries_keep_listing_order() {
        let (table, diags) = parse(LISTING);
        assert!(diags.is_empty(), "{:?}", diags);
        let sections: Vec<_> = table.sections.keys().collect();
        assert_eq!(sections, [".text", ".init"]);
        let entries: Vec<_> = table.sections[".text"].entries.keys().collect();
        assert_eq!(entries, ["_start", "compute"]);
    }

    #[test]
    fn instruction_fields() {
        let (table, _) = parse(LISTING);
        let start = &table.sections[".text"].entries["_start"];
        assert_eq!(start.len(), 2);
        assert_eq!(start[0].address, 0x400078);
        assert_eq!(start[0].bytes, [0xd2, 0x80, 0x05, 0x40]);
        assert_eq!(start[0].text.as_deref(), Some("mov\tx0, #0x2a"));
    }

    #[test]
    fn data_line_has_no_text() {
        let (table, _) = parse(LISTING);
        let init = &table.sections[".init"].entries["_init"];
        assert_eq!(init[0].bytes, [0x00, 0x00]);
        assert_eq!(init[0].text, None);
    }

    #[test]
    fn section_bounds() {
        let (table, _) = parse(LISTING);
        let text = &table.sections[".text"];
        assert_eq!(text.lo_addr(), Some(0x400078));
        assert_eq!(text.hi_addr(), Some(0x40008c));
    }

    #[test]
    fn relocation_rewrites_target_and_strips_offset() {
        let (table, _) = parse(LISTING);
        let start = &table.sections[".text"].entries["_start"];
        assert_eq!(start[1].text.as_deref(), Some("bl\t400084 <compute>"));
    }

    #[test]
    fn relocation_symbol_with_dollar_sign_is_kept_verbatim() {
        let input = "Disassembly of section .text:\n\
                     0000000000400078 <_start>:\n\
                     \x20 400078:\t94000002 \tbl\t400084 <compute+0x4>\n\
                     \t\t400078: R_AARCH64_CALL26\t$x\n";
        let (table, diags) = parse(input);
        assert!(diags.is_empty(), "{:?}", diags);
        let start = &table.sections[".text"].entries["_start"];
        assert_eq!(start[0].text.as_deref(), Some("bl\t400084 <$x>"));
    }

    #[test]
    fn unrecognized_lines_are_reported_not_fatal() {
        let input = "Disassembly of section .text:\n\
                     0000000000400078 <_start>:\n\
                     total garbage here\n\
                     \x20 400078:\td2800540 \tmov\tx0, #0x2a\n";
        let (table, diags) = parse(input);
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].line_number, 3);
        assert_eq!(table.sections[".text"].entries["_start"].len(), 1);
    }
}
