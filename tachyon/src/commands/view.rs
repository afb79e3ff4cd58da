use std::path::PathBuf;

use tachyon_base::Result;
use tachyon_core::TachyonReader;

use super::parse_region;

/// Prints a simplified per-variant rendering: CHROM/POS/ID/REF/ALT/QUAL
/// plus per-sample genotypes. A full VCF/BCF output formatter (INFO and
/// FORMAT field reconstruction, header re-emission) is out of scope here,
/// same as the parser on the way in.
pub fn run(path: &str, fields: Option<&str>, samples: Option<&str>, region: Option<&str>) -> Result<()> {
    let mut reader = TachyonReader::open(PathBuf::from(path))?;
    let header = reader.header().clone();

    if let Some(spec) = fields {
        tracing::warn!(fields = spec, "field filtering is not implemented by this viewer; showing all core columns");
    }

    let sample_filter: Option<Vec<&str>> = samples.map(|s| s.split(',').collect());
    let sample_indices: Vec<usize> = match &sample_filter {
        None => (0..header.sample_names.len()).collect(),
        Some(names) => names
            .iter()
            .filter_map(|n| header.sample_names.iter().position(|s| s == n))
            .collect(),
    };

    let block_ids: Vec<usize> = match region {
        Some(r) => {
            let (rid, start, end) = parse_region(r, &header.contigs)?;
            reader.blocks_in_region(rid, start, end)
        }
        None => (0..reader.n_blocks()).collect(),
    };

    let mut stdout = std::io::stdout().lock();
    use std::io::Write;

    for block_id in block_ids {
        let records = match reader.read_block(block_id, None) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(block_id, error = %e, "skipping unreadable block");
                continue;
            }
        };
        for (meta, genotypes) in records {
            let contig_name = header.contigs.get(meta.contig_id).map(|c| c.name.as_str()).unwrap_or("?");
            let alleles: Vec<String> = meta.alleles.iter().map(|a| String::from_utf8_lossy(a).into_owned()).collect();
            let reference = alleles.first().cloned().unwrap_or_default();
            let alt = alleles.get(1..).map(|rest| rest.join(",")).unwrap_or_default();

            let gt_strs: Vec<String> = sample_indices
                .iter()
                .map(|&i| format_genotype(genotypes.get(i)))
                .collect();

            writeln!(
                stdout,
                "{}\t{}\t{}\t{}\t{}\t{}\t{}",
                contig_name,
                meta.position + 1,
                meta.name,
                reference,
                alt,
                meta.quality,
                gt_strs.join("\t")
            )
            .map_err(tachyon_base::Error::from)?;
        }
    }
    Ok(())
}

fn format_genotype(call: Option<&tachyon_core::GtCall>) -> String {
    let Some(call) = call else { return ".".to_string() };
    let sep = if call.phase { '|' } else { '/' };
    call.alleles
        .iter()
        .map(|&a| if a == tachyon_core::permutation::ALLELE_MISSING { ".".to_string() } else { a.to_string() })
        .collect::<Vec<_>>()
        .join(&sep.to_string())
}
