use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;

use tachyon_base::Result;
use tachyon_core::block::BlockBoundary;
use tachyon_core::keychain::{Keychain, OsRngSource};
use tachyon_core::record::{FieldView, RecordView};
use tachyon_core::TachyonWriter;

use crate::vcf::VcfReader;

#[allow(clippy::too_many_arguments)]
pub fn run(
    input: &str,
    output: &str,
    zstd_level: i32,
    records_per_block: u32,
    bases_per_block: i64,
    encrypt: bool,
) -> Result<()> {
    let file = File::open(input).map_err(tachyon_base::Error::from)?;
    let mut vcf = VcfReader::new(BufReader::new(file))?;
    let header = vcf.header().clone();

    let boundary = BlockBoundary { max_records: records_per_block as usize, max_bases: bases_per_block };
    let (keychain, rng): (Option<Arc<Keychain>>, Option<Arc<dyn tachyon_core::keychain::RandomSource>>) =
        if encrypt {
            (Some(Arc::new(Keychain::new())), Some(Arc::new(OsRngSource) as Arc<dyn tachyon_core::keychain::RandomSource>))
        } else {
            (None, None)
        };

    let mut writer = TachyonWriter::create(PathBuf::from(output), header, boundary, zstd_level, keychain.clone(), rng)?;

    let mut n_records = 0u64;
    while let Some(record) = vcf.next_record()? {
        let allele_refs: Vec<&[u8]> = record.alleles.iter().map(|a| a.as_slice()).collect();
        let info_views: Vec<FieldView> = record
            .info
            .iter()
            .map(|f| FieldView { key: f.key, primitive: f.primitive, n_per_sample: f.n_per_sample, bytes: &f.bytes })
            .collect();
        let fmt_views: Vec<FieldView> = record
            .fmt
            .iter()
            .map(|f| FieldView { key: f.key, primitive: f.primitive, n_per_sample: f.n_per_sample, bytes: &f.bytes })
            .collect();
        let view = RecordView {
            rid: record.rid,
            pos: record.pos,
            qual: record.qual,
            id: &record.id,
            alleles: &allele_refs,
            filters: &record.filters,
            info: &info_views,
            fmt: &fmt_views,
            genotypes: &record.genotypes,
        };
        writer.append(&view)?;
        n_records += 1;
    }
    writer.finish()?;
    tracing::info!(n_records, output, "import complete");
    if let Some(kc) = keychain {
        tracing::info!(n_keys = kc.entry_count(), "container keys generated (not persisted by this CLI)");
    }
    Ok(())
}
