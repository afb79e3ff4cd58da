//! Genotype encoding (spec 4.3): summarize each site's raw calls, pick the
//! cheapest run-length encoding across four variants, and emit it into the
//! matching invariant column.

mod diploid;
mod multiploid;
mod summary;

pub use diploid::{assess_diploid_biallelic, assess_diploid_multi_allelic, emit_diploid_runs};
pub use multiploid::{assess_multiploid, emit_multiploid_runs};
pub use summary::{compute_summary, GenotypeSummary};

use crate::permutation::{ALLELE_END_OF_VECTOR, ALLELE_MISSING};

/// One sample's raw genotype call at a site: ploidy-length allele codes
/// (`ALLELE_MISSING`/`ALLELE_END_OF_VECTOR` sentinels allowed) plus a
/// single phase bit (the packed record layout has room for exactly one).
#[derive(Clone, Debug)]
pub struct GtCall {
    pub alleles: Vec<i32>,
    pub phase: bool,
}

impl GtCall {
    pub fn is_missing_or_eov(&self) -> bool {
        self.alleles
            .iter()
            .all(|&a| a == ALLELE_MISSING || a == ALLELE_END_OF_VECTOR)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum WordWidth {
    W8,
    W16,
    W32,
    W64,
}

impl WordWidth {
    pub const ALL: [WordWidth; 4] = [WordWidth::W8, WordWidth::W16, WordWidth::W32, WordWidth::W64];

    pub fn bytes(self) -> usize {
        match self {
            WordWidth::W8 => 1,
            WordWidth::W16 => 2,
            WordWidth::W32 => 4,
            WordWidth::W64 => 8,
        }
    }

    pub fn bits(self) -> u32 {
        self.bytes() as u32 * 8
    }

    pub fn max_uint(self) -> u64 {
        if self.bits() >= 64 {
            u64::MAX
        } else {
            (1u64 << self.bits()) - 1
        }
    }
}

/// Which invariant column family a chosen encoding targets (spec 4.3.6).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GtMethod {
    DiploidBiallelic,
    DiploidMultiAllelic,
    Multiploid,
}

#[derive(Clone, Copy, Debug)]
pub struct EncodingChoice {
    pub width: WordWidth,
    pub permuted: bool,
    /// Per-allele bit width; 0 for multiploid (which packs no alleles into
    /// the run word).
    pub shift: u32,
    /// Phase bit width, 0 or 1; always 0 for multiploid.
    pub add: u32,
    pub n_runs: usize,
}

impl EncodingChoice {
    pub fn cost_bytes(&self) -> usize {
        self.n_runs * self.width.bytes()
    }
}

/// `ceil(log2(n))` for `n >= 1`; used both for the multi-allelic packed-key
/// shift and the permutation radix-sort shift.
pub fn ceil_log2(n: u64) -> u32 {
    if n <= 1 {
        1
    } else {
        64 - (n - 1).leading_zeros()
    }
}

/// Counts runs in `keys` under a run-length `limit`: a run breaks when the
/// key changes or the current run reaches `limit` entries (spec 4.3.3).
pub(crate) fn count_runs(keys: &[u64], limit: u64) -> usize {
    if keys.is_empty() {
        return 0;
    }
    let mut n_runs = 1usize;
    let mut run_len: u64 = 1;
    let mut prev = keys[0];
    for &k in &keys[1..] {
        if k == prev && run_len < limit {
            run_len += 1;
        } else {
            n_runs += 1;
            run_len = 1;
            prev = k;
        }
    }
    n_runs
}

/// Picks the lowest-cost candidate, breaking ties toward the smaller width
/// and then toward the permuted variant (spec 4.3.3's tie-break rule,
/// reused for every assessor).
pub(crate) fn pick_best(candidates: Vec<EncodingChoice>) -> Option<EncodingChoice> {
    candidates
        .into_iter()
        .min_by_key(|c| (c.cost_bytes(), c.width.bytes(), !c.permuted))
}

/// Dispatches a site to the correct assessor based on `(base_ploidy,
/// n_alleles, has_eov)` (spec 4.3.2), returning the method alongside its
/// chosen width/permutation.
pub fn select_encoder(
    calls: &[GtCall],
    perm: &[u32],
    summary: &GenotypeSummary,
    n_alleles: usize,
) -> Option<(GtMethod, EncodingChoice)> {
    if summary.base_ploidy == 2 {
        let has_eov = summary.n_vector_end > 0;
        if n_alleles <= 2 && !has_eov {
            assess_diploid_biallelic(calls, perm, summary)
                .map(|c| (GtMethod::DiploidBiallelic, c))
        } else {
            assess_diploid_multi_allelic(calls, perm, summary, n_alleles)
                .map(|c| (GtMethod::DiploidMultiAllelic, c))
        }
    } else {
        assess_multiploid(calls, perm, summary).map(|c| (GtMethod::Multiploid, c))
    }
}
