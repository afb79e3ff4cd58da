pub mod import;
pub mod stats;
pub mod view;

/// Parses a `contig:start-end` region string against a file's contig
/// dictionary (spec section 6's `view -r region`).
pub fn parse_region(
    region: &str,
    contigs: &tachyon_core::header::Dictionary<tachyon_core::header::ContigEntry>,
) -> tachyon_base::Result<(i32, i64, i64)> {
    let (name, range) = region
        .split_once(':')
        .ok_or_else(|| tachyon_base::err("region must be formatted contig:start-end"))?;
    let rid = contigs
        .idx_of(name)
        .ok_or_else(|| tachyon_base::err(format!("unknown contig '{name}' in region")))?;
    let (start, end) = range
        .split_once('-')
        .ok_or_else(|| tachyon_base::err("region range must be formatted start-end"))?;
    let start: i64 = start.parse().map_err(|_| tachyon_base::err("invalid region start"))?;
    let end: i64 = end.parse().map_err(|_| tachyon_base::err("invalid region end"))?;
    Ok((rid, start, end))
}
