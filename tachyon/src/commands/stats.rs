use std::path::PathBuf;

use tachyon_base::Result;
use tachyon_core::container::ContainerHeader;
use tachyon_core::ioutil::Reader as _;
use tachyon_core::TachyonReader;

/// Grounded on the original's `VariantImporterStats`-style size
/// accounting: per-column compressed/uncompressed totals and ratios,
/// aggregated across every block in the file.
pub fn run(path: &str) -> Result<()> {
    let mut reader = TachyonReader::open(PathBuf::from(path))?;
    let header = reader.header().clone();
    let n_blocks = reader.n_blocks();

    let mut invariant_totals: (u64, u64) = (0, 0);
    let mut info_totals: std::collections::BTreeMap<i32, (u64, u64)> = std::collections::BTreeMap::new();
    let mut format_totals: std::collections::BTreeMap<i32, (u64, u64)> = std::collections::BTreeMap::new();

    let mut rd = tachyon_core::ioutil::FileReader::try_open_existing(PathBuf::from(path))?;
    let offsets: Vec<u64> = reader.index().entries.iter().map(|e| e.block_offset).collect();
    for offset in offsets {
        rd.rewind_to(offset as i64)?;
        let block = tachyon_core::block::ReadBlock::read_from(&mut rd)?;
        // Sizes are meaningful pre-decompression; don't decrypt/decompress
        // just to print totals already recorded in each container header.
        for c in &block.invariant_containers {
            accumulate(&mut invariant_totals, &c.header);
        }
        for c in &block.format_containers {
            let totals = format_totals.entry(c.header.global_key).or_default();
            accumulate(totals, &c.header);
        }
        for c in &block.info_containers {
            let totals = info_totals.entry(c.header.global_key).or_default();
            accumulate(totals, &c.header);
        }
    }

    println!("blocks: {n_blocks}");
    println!("samples: {}", header.n_samples);
    println!();
    println!("{:<24}{:>14}{:>14}{:>8}", "column", "compressed", "uncompressed", "ratio");
    print_row("invariant (base columns)", invariant_totals);
    for (idx, totals) in info_totals {
        let name = header.info.get(idx).map(|e| e.id.as_str()).unwrap_or("?");
        print_row(&format!("INFO/{name}"), totals);
    }
    for (idx, totals) in format_totals {
        let name = header.format.get(idx).map(|e| e.id.as_str()).unwrap_or("?");
        print_row(&format!("FORMAT/{name}"), totals);
    }
    Ok(())
}

fn accumulate(totals: &mut (u64, u64), header: &ContainerHeader) {
    totals.0 += header.compressed_len as u64;
    totals.1 += header.uncompressed_len as u64;
}

fn print_row(name: &str, totals: (u64, u64)) {
    let (compressed, uncompressed) = totals;
    let ratio = if compressed == 0 { 0.0 } else { uncompressed as f64 / compressed as f64 };
    println!("{name:<24}{compressed:>14}{uncompressed:>14}{ratio:>8.2}");
}
