//! Symbol table builder: parses a symbol-table dump into a per-section
//! address index.
//!
//! Rows carry `(address, [flags,] section, size, name)`. Flag columns vary
//! between tool versions, so the parser keys off the positions that do not:
//! the address is the first token, the name is the last, the size is the
//! second-to-last, and the section immediately precedes the size. Banner and
//! blank lines do not match and are skipped without error.

use crate::model::{SymbolEntry, SymbolIndex};
use tracing::trace;

/// Parses a symbol-table dump.
pub fn parse(input: &str) -> SymbolIndex {
    let mut index = SymbolIndex::default();

    for line in input.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 4 {
            skip(line);
            continue;
        }
        let Ok(address) = u64::from_str_radix(tokens[0], 16) else {
            skip(line);
            continue;
        };
        let n = tokens.len();
        let Ok(size) = u64::from_str_radix(tokens[n - 2], 16) else {
            skip(line);
            continue;
        };
        let section = tokens[n - 3];
        let name = tokens[n - 1];

        index
            .by_section
            .entry(section.to_string())
            .or_default()
            .entry(address)
            .or_default()
            .push(SymbolEntry {
                name: name.to_string(),
                end_address: address + size,
            });
    }

    index
}

fn skip(line: &str) {
    if !line.trim().is_empty() {
        trace!("skipping non-symbol line: {}", line.trim());
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const DUMP: &str = "\
demo.elf:     file format elf64-littleaarch64

SYMBOL TABLE:
0000000000400078 l    d  .text\t0000000000000000 .text
0000000000400078 g     F .text\t000000000000000c _start
0000000000400078 g     F .text\t000000000000000c start_alias
0000000000400084 g     F .text\t0000000000000008 compute
0000000000000000 l    df *ABS*\t0000000000000000 demo.c
";

    #[test]
    fn rows_are_indexed_by_section_and_address() {
        let index = parse(DUMP);
        let text = &index.by_section[".text"];
        assert_eq!(text[&0x400084].len(), 1);
        assert_eq!(text[&0x400084][0].name, "compute");
        assert_eq!(text[&0x400084][0].end_address, 0x40008c);
    }

    #[test]
    fn aliases_at_one_address_are_all_kept() {
        let index = parse(DUMP);
        let names: Vec<_> = index.by_section[".text"][&0x400078]
            .iter()
            .map(|e| e.name.as_str())
            .collect();
        assert!(names.contains(&"_start"));
        assert!(names.contains(&"start_alias"));
    }

    #[test]
    fn banners_are_skipped_silently() {
        let index = parse("SYMBOL TABLE:\n\nno symbols\n");
        assert!(index.by_section.is_empty());
    }
}
