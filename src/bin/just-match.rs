use anyhow::Result;
use clap::Parser;

/// Builds a snapshot from four dump files and prints a summary. Thin glue
/// around the library; the interactive viewer lives elsewhere.
#[derive(Debug, Parser)]
struct JustMatch {
    /// Disassembly listing.
    disassembly: std::path::PathBuf,
    /// Symbol table dump.
    symbols: std::path::PathBuf,
    /// Debug-info tree dump.
    debug_info: std::path::PathBuf,
    /// Line-number program dump.
    line_program: std::path::PathBuf,

    /// Resolve one address, given as SECTION:ADDR (ADDR accepts 0x prefixes).
    #[arg(long)]
    resolve: Option<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = JustMatch::parse();

    let db = linemap::parse_streams(
        &std::fs::read_to_string(&args.disassembly)?,
        &std::fs::read_to_string(&args.symbols)?,
        &std::fs::read_to_string(&args.debug_info)?,
        &std::fs::read_to_string(&args.line_program)?,
    )?;

    let stats = db.stats();
    println!(
        "{} sections, {} entries, {} symbols, {} subprograms, {} sequences \
         ({} duplicate, {} unmatched), {} diagnostics",
        stats.sections,
        stats.entries,
        stats.symbols,
        stats.subprograms,
        stats.sequences,
        stats.duplicates,
        stats.unmatched,
        stats.diagnostics,
    );

    for section in db.sections() {
        println!("{}:", section);
        for entry in db.entries_of(section) {
            let n = db.instructions_of(section, entry).map_or(0, |i| i.len());
            println!("  {:6} instructions  {}", n, entry);
        }
    }

    if let Some(spec) = &args.resolve {
        let (section, addr) = spec
            .rsplit_once(':')
            .ok_or_else(|| anyhow::anyhow!("--resolve wants SECTION:ADDR"))?;
        let addr: u64 = parse_int::parse(addr)?;
        match db.resolve(section, addr) {
            Some(positions) => {
                for p in positions {
                    println!("{}:{:#x} -> {}:{}:{}", section, addr, p.file, p.line, p.column);
                }
            }
            None => println!("{}:{:#x} -> no match", section, addr),
        }
    }

    Ok(())
}
