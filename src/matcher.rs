//! Section matcher: assigns each line sequence to exactly one section and a
//! non-overlapping address range within it.
//!
//! Line sequences are not tagged with the section they describe, so the
//! association has to be reconstructed. Each sequence starts with every
//! section as a candidate; a fixed pipeline of filters narrows the candidate
//! sets (never widening them), and a greedy best-effort commit places
//! whatever is still ambiguous afterwards. The pipeline short-circuits as
//! soon as every candidate set is a singleton and the implied per-section
//! spans are pairwise disjoint.
//!
//! The commit step works off reservations held in a `RangeMap` per section,
//! so the final Matching Table is disjoint by construction.

use crate::model::{
    CodeTable, LineSequence, MatchingTable, SeqId, SubprogramIndex, SymbolIndex,
};
use rangemap::RangeMap;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::ops::Range;
use tracing::{debug, warn};

/// Result of matching: the table, which sequences were byte-identical
/// duplicates of an earlier one (they inherit that sequence's match), and
/// which sequences could not be placed at all.
#[derive(Clone, Debug, Default)]
pub struct MatchOutcome {
    pub table: MatchingTable,
    pub duplicate_of: BTreeMap<SeqId, SeqId>,
    pub unmatched: Vec<SeqId>,
}

/// Per-section geometry precomputed from the code table. Sections without
/// instructions cannot host a sequence and are excluded up front.
struct SectionGeom {
    name: String,
    lo: u64,
    hi: u64,
    starts: BTreeSet<u64>,
}

/// One non-duplicate sequence being matched.
struct Work {
    seq: usize,
    /// Minimum and maximum recorded addresses (the maximum is the
    /// end-of-sequence marker).
    min: u64,
    max: u64,
    /// Half-open reservation span.
    span: Range<u64>,
    /// Surviving candidates, as indices into the geometry list, in section
    /// listing order.
    cands: Vec<usize>,
}

pub fn match_sections(
    code: &CodeTable,
    symbols: &SymbolIndex,
    subprograms: &SubprogramIndex,
    sequences: &[LineSequence],
) -> MatchOutcome {
    let sections: Vec<SectionGeom> = code
        .sections
        .iter()
        .filter_map(|(name, sc)| {
            Some(SectionGeom {
                name: name.clone(),
                lo: sc.lo_addr()?,
                hi: sc.hi_addr()?,
                starts: sc.instructions().map(|i| i.address).collect(),
            })
        })
        .collect();

    // Deduplication: byte-identical sequences are matched once; the
    // duplicate inherits the representative's assignment.
    let mut duplicate_of = BTreeMap::new();
    let mut work: Vec<Work> = Vec::new();
    for (i, seq) in sequences.iter().enumerate() {
        let Some(span) = seq.span() else {
            warn!(sequence = i, "empty sequence cannot be matched");
            continue;
        };
        if let Some(rep) = work.iter().find(|w| sequences[w.seq] == *seq) {
            duplicate_of.insert(SeqId(i), SeqId(rep.seq));
            continue;
        }
        work.push(Work {
            seq: i,
            min: seq.min_addr().unwrap(),
            max: seq.max_addr().unwrap(),
            span,
            cands: (0..sections.len()).collect(),
        });
    }

    // Filter 1: a sequence cannot describe a section it does not fit inside.
    for w in &mut work {
        w.cands
            .retain(|&s| sections[s].lo <= w.min && w.max <= sections[s].hi);
    }
    if complete(&work) {
        return commit(work, &sections, duplicate_of);
    }

    // Filter 2: unique candidates reserve their span; overlapping rivals
    // lose that candidate. Runs to fixpoint.
    overlap_fixpoint(&mut work);
    if complete(&work) {
        return commit(work, &sections, duplicate_of);
    }

    // Filter 3: every recorded address must be a real instruction start,
    // except the end marker, which may also sit one past the section.
    for w in &mut work {
        if w.cands.len() < 2 {
            continue;
        }
        let seq = &sequences[w.seq];
        w.cands.retain(|&s| aligned(seq, &sections[s], w.max));
    }
    if complete(&work) {
        return commit(work, &sections, duplicate_of);
    }

    // Filter 4: symbol evidence. Presence of any corroborating symbol beats
    // absence; the distance itself is diagnostic only.
    for w in &mut work {
        if w.cands.len() < 2 {
            continue;
        }
        let seq = &sequences[w.seq];
        let counts: Vec<usize> = w
            .cands
            .iter()
            .map(|&s| corroborating_symbols(seq, &sections[s].name, symbols, subprograms))
            .collect();
        if counts.iter().any(|&c| c > 0) {
            let mut keep = counts.iter();
            w.cands.retain(|_| *keep.next().unwrap() > 0);
        }
    }
    if complete(&work) {
        return commit(work, &sections, duplicate_of);
    }

    // Filter 5: evidence may have produced new unique candidates.
    overlap_fixpoint(&mut work);

    commit(work, &sections, duplicate_of)
}

/// True when every candidate set is a singleton and the implied per-section
/// spans are pairwise disjoint.
fn complete(work: &[Work]) -> bool {
    if !work.iter().all(|w| w.cands.len() == 1) {
        return false;
    }
    let mut spans: BTreeMap<usize, Vec<Range<u64>>> = BTreeMap::new();
    for w in work {
        spans.entry(w.cands[0]).or_default().push(w.span.clone());
    }
    for ranges in spans.values_mut() {
        ranges.sort_by_key(|r| r.start);
        if ranges.windows(2).any(|p| p[1].start < p[0].end) {
            return false;
        }
    }
    true
}

fn overlap_fixpoint(work: &mut [Work]) {
    loop {
        // Read reservations, then apply removals, as one pass.
        let mut reserved: BTreeMap<usize, Vec<(Range<u64>, usize)>> = BTreeMap::new();
        for w in work.iter() {
            if let [only] = w.cands[..] {
                reserved.entry(only).or_default().push((w.span.clone(), w.seq));
            }
        }
        let mut changed = false;
        for w in work.iter_mut() {
            if w.cands.len() < 2 {
                continue;
            }
            let before = w.cands.len();
            w.cands.retain(|&s| {
                reserved.get(&s).map_or(true, |rs| {
                    !rs.iter()
                        .any(|(r, owner)| *owner != w.seq && overlaps(r, &w.span))
                })
            });
            changed |= w.cands.len() != before;
        }
        if !changed {
            break;
        }
    }
}

fn overlaps(a: &Range<u64>, b: &Range<u64>) -> bool {
    a.start < b.end && b.start < a.end
}

fn aligned(seq: &LineSequence, g: &SectionGeom, max: u64) -> bool {
    seq.rows
        .keys()
        .all(|&a| g.starts.contains(&a) || (a == max && a == g.hi))
}

/// Counts symbols in `section` whose known declaration coordinates are
/// corroborated by at least one sequence row at the symbol's address.
fn corroborating_symbols(
    seq: &LineSequence,
    section: &str,
    symbols: &SymbolIndex,
    subprograms: &SubprogramIndex,
) -> usize {
    let Some(addr_map) = symbols.by_section.get(section) else {
        return 0;
    };
    let mut count = 0;
    for (addr, entries) in addr_map {
        let Some(rows) = seq.rows.get(addr) else {
            continue;
        };
        for entry in entries {
            let Some(decl) = subprograms.decls.get(&entry.name) else {
                continue;
            };
            let distances: Vec<u64> = rows
                .iter()
                .filter(|r| r.file == decl.file && r.line >= decl.line)
                .map(|r| r.line - decl.line)
                .collect();
            if !distances.is_empty() {
                let mean = distances.iter().sum::<u64>() as f64 / distances.len() as f64;
                debug!(
                    symbol = %entry.name,
                    section = %section,
                    mean_line_distance = mean,
                    "corroborating symbol"
                );
                count += 1;
            }
        }
    }
    count
}

/// Greedy best-effort placement. Candidates are tried in candidate-set
/// order; a span that overlaps exactly one existing reservation replaces it
/// only when strictly larger (ties favor the incumbent), and a sequence
/// evicted that way goes back on the queue. More than one overlapping
/// reservation makes the candidate unworkable. For the constraint-derived
/// path (singleton candidates, disjoint spans) this degenerates to plain
/// insertion.
fn commit(
    work: Vec<Work>,
    sections: &[SectionGeom],
    duplicate_of: BTreeMap<SeqId, SeqId>,
) -> MatchOutcome {
    let mut table = MatchingTable::default();
    for g in sections {
        table.by_section.insert(g.name.clone(), RangeMap::new());
    }

    let work_of_seq: BTreeMap<usize, usize> =
        work.iter().enumerate().map(|(i, w)| (w.seq, i)).collect();
    let mut queue: VecDeque<usize> = (0..work.len()).collect();
    let mut unmatched = Vec::new();

    while let Some(wi) = queue.pop_front() {
        let w = &work[wi];
        let mut placed = false;
        for &s in &w.cands {
            let map = table.by_section.get_mut(sections[s].name.as_str()).unwrap();
            let overlapping: Vec<(Range<u64>, SeqId)> = map
                .overlapping(&w.span)
                .map(|(r, v)| (r.clone(), *v))
                .collect();
            match overlapping.as_slice() {
                [] => {
                    map.insert(w.span.clone(), SeqId(w.seq));
                    placed = true;
                }
                [(incumbent, owner)] => {
                    let larger =
                        w.span.end - w.span.start > incumbent.end - incumbent.start;
                    if larger {
                        map.remove(incumbent.clone());
                        map.insert(w.span.clone(), SeqId(w.seq));
                        queue.push_back(work_of_seq[&owner.0]);
                        placed = true;
                    }
                }
                _ => {}
            }
            if placed {
                break;
            }
        }
        if !placed {
            warn!(sequence = w.seq, "no workable section for sequence");
            unmatched.push(SeqId(w.seq));
        }
    }

    unmatched.sort();
    MatchOutcome {
        table,
        duplicate_of,
        unmatched,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::{CodeTable, Instruction, SourcePosition};

    fn position(file: &str, line: u64) -> SourcePosition {
        SourcePosition {
            file: file.to_string(),
            line,
            column: 0,
            is_stmt: true,
            discriminator: 0,
        }
    }

    fn sequence(rows: &[(u64, &str, u64)]) -> LineSequence {
        let mut seq = LineSequence::default();
        for &(addr, file, line) in rows {
            seq.rows.entry(addr).or_default().push(position(file, line));
        }
        seq
    }

    /// A section whose single entry has 4-byte instructions at each address.
    fn section(table: &mut CodeTable, name: &str, entry: &str, addrs: &[u64]) {
        let code = table.sections.entry(name.to_string()).or_default();
        let insns = code.entries.entry(entry.to_string()).or_default();
        for &a in addrs {
            insns.push(Instruction {
                address: a,
                bytes: vec![0; 4],
                text: Some("nop".to_string()),
            });
        }
    }

    fn addrs(lo: u64, hi: u64) -> Vec<u64> {
        (lo..hi).step_by(4).collect()
    }

    #[test]
    fn single_candidate_by_size() {
        let mut code = CodeTable::default();
        section(&mut code, ".text", "f", &addrs(0x10, 0x20));
        section(&mut code, ".init", "i", &addrs(0x100, 0x108));
        let seqs = vec![sequence(&[(0x10, "f.c", 1), (0x18, "f.c", 2), (0x20, "f.c", 3)])];
        let out = match_sections(
            &code,
            &SymbolIndex::default(),
            &SubprogramIndex::default(),
            &seqs,
        );
        assert_eq!(out.table.lookup(".text", 0x18), Some(SeqId(0)));
        assert_eq!(out.table.lookup(".init", 0x100), None);
        assert!(out.unmatched.is_empty());
    }

    #[test]
    fn disjoint_spans_share_a_section_via_size_filter() {
        let mut code = CodeTable::default();
        section(&mut code, ".text", "f", &addrs(0x10, 0x40));
        let seqs = vec![
            sequence(&[(0x10, "a.c", 1), (0x20, "a.c", 2)]),
            sequence(&[(0x28, "b.c", 1), (0x40, "b.c", 2)]),
        ];
        let out = match_sections(
            &code,
            &SymbolIndex::default(),
            &SubprogramIndex::default(),
            &seqs,
        );
        assert_eq!(out.table.lookup(".text", 0x10), Some(SeqId(0)));
        assert_eq!(out.table.lookup(".text", 0x30), Some(SeqId(1)));
        assert!(out.unmatched.is_empty());
    }

    #[test]
    fn alignment_rejects_sections_with_mismatched_instruction_grid() {
        let mut code = CodeTable::default();
        // Both sections cover the sequence's span, but .odd's instruction
        // grid is offset by 2 and never hits the recorded addresses.
        section(&mut code, ".even", "e", &addrs(0x10, 0x30));
        section(&mut code, ".odd", "o", &[0x12, 0x16, 0x1a, 0x1e, 0x22, 0x26, 0x2a, 0x2e]);
        let seqs = vec![sequence(&[(0x14, "a.c", 1), (0x20, "a.c", 2), (0x28, "a.c", 3)])];
        let out = match_sections(
            &code,
            &SymbolIndex::default(),
            &SubprogramIndex::default(),
            &seqs,
        );
        assert_eq!(out.table.lookup(".even", 0x14), Some(SeqId(0)));
        assert_eq!(out.table.lookup(".odd", 0x14), None);
    }

    #[test]
    fn symbol_evidence_breaks_geometric_ties() {
        let mut code = CodeTable::default();
        section(&mut code, ".a", "f", &addrs(0x10, 0x20));
        section(&mut code, ".b", "g", &addrs(0x10, 0x20));
        let mut symbols = SymbolIndex::default();
        symbols
            .by_section
            .entry(".b".to_string())
            .or_default()
            .entry(0x10)
            .or_default()
            .push(crate::model::SymbolEntry {
                name: "g".to_string(),
                end_address: 0x20,
            });
        let mut subprograms = SubprogramIndex::default();
        subprograms.decls.insert(
            "g".to_string(),
            crate::model::DeclCoord {
                file: "g.c".to_string(),
                line: 5,
            },
        );
        let seqs = vec![sequence(&[(0x10, "g.c", 7), (0x20, "g.c", 9)])];
        let out = match_sections(&code, &symbols, &subprograms, &seqs);
        assert_eq!(out.table.lookup(".b", 0x10), Some(SeqId(0)));
        assert_eq!(out.table.lookup(".a", 0x10), None);
    }

    #[test]
    fn larger_span_wins_and_evicted_sequence_is_requeued() {
        let mut code = CodeTable::default();
        section(&mut code, ".a", "f", &addrs(0x10, 0x30));
        section(&mut code, ".b", "g", &addrs(0x10, 0x30));
        let seqs = vec![
            sequence(&[(0x10, "x.c", 1), (0x20, "x.c", 2)]),
            sequence(&[(0x10, "y.c", 1), (0x30, "y.c", 2)]),
        ];
        let out = match_sections(
            &code,
            &SymbolIndex::default(),
            &SubprogramIndex::default(),
            &seqs,
        );
        // The larger sequence claims the first candidate section, evicting
        // the smaller one, which lands in the next section over.
        assert_eq!(out.table.lookup(".a", 0x28), Some(SeqId(1)));
        assert_eq!(out.table.lookup(".b", 0x18), Some(SeqId(0)));
        assert!(out.unmatched.is_empty());
    }

    #[test]
    fn duplicate_sequences_inherit_the_match() {
        let mut code = CodeTable::default();
        section(&mut code, ".text", "f", &addrs(0x10, 0x20));
        let seq = sequence(&[(0x10, "f.c", 1), (0x20, "f.c", 2)]);
        let seqs = vec![seq.clone(), seq];
        let out = match_sections(
            &code,
            &SymbolIndex::default(),
            &SubprogramIndex::default(),
            &seqs,
        );
        assert_eq!(out.duplicate_of.get(&SeqId(1)), Some(&SeqId(0)));
        assert_eq!(out.table.lookup(".text", 0x10), Some(SeqId(0)));
    }

    #[test]
    fn matching_is_deterministic() {
        let mut code = CodeTable::default();
        section(&mut code, ".a", "f", &addrs(0x10, 0x30));
        section(&mut code, ".b", "g", &addrs(0x10, 0x30));
        let seqs = vec![
            sequence(&[(0x10, "x.c", 1), (0x20, "x.c", 2)]),
            sequence(&[(0x14, "y.c", 1), (0x30, "y.c", 2)]),
        ];
        let runs: Vec<Vec<(String, Range<u64>, SeqId)>> = (0..2)
            .map(|_| {
                let out = match_sections(
                    &code,
                    &SymbolIndex::default(),
                    &SubprogramIndex::default(),
                    &seqs,
                );
                out.table
                    .by_section
                    .iter()
                    .flat_map(|(name, map)| {
                        map.iter()
                            .map(|(r, &v)| (name.clone(), r.clone(), v))
                            .collect::<Vec<_>>()
                    })
                    .collect()
            })
            .collect();
        assert_eq!(runs[0], runs[1]);
    }

    #[test]
    fn intervals_stay_disjoint_on_the_best_effort_path() {
        let mut code = CodeTable::default();
        section(&mut code, ".a", "f", &addrs(0x10, 0x40));
        let seqs = vec![
            sequence(&[(0x10, "x.c", 1), (0x24, "x.c", 2)]),
            sequence(&[(0x20, "y.c", 1), (0x40, "y.c", 2)]),
            sequence(&[(0x10, "z.c", 1), (0x18, "z.c", 2)]),
        ];
        let out = match_sections(
            &code,
            &SymbolIndex::default(),
            &SubprogramIndex::default(),
            &seqs,
        );
        for map in out.table.by_section.values() {
            let ranges: Vec<_> = map.iter().map(|(r, _)| r.clone()).collect();
            for pair in ranges.windows(2) {
                assert!(pair[0].end <= pair[1].start, "overlap: {:?}", pair);
            }
        }
    }
}
