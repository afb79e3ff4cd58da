use super::{ceil_log2, count_runs, pick_best, EncodingChoice, GenotypeSummary, GtCall, WordWidth};
use crate::permutation::{ALLELE_END_OF_VECTOR, ALLELE_MISSING};

fn allele_at(call: &GtCall, idx: usize) -> i32 {
    call.alleles.get(idx).copied().unwrap_or(ALLELE_MISSING)
}

/// Biallelic allele mapping: `0 -> 0, 1 -> 1, missing -> 2`.
fn remap_biallelic(code: i32) -> u64 {
    match code {
        ALLELE_MISSING => 2,
        ALLELE_END_OF_VECTOR => 2,
        other => other as u64,
    }
}

/// Multi-allelic remap: `missing -> 0, EOV -> 1`, real alleles shifted up
/// by one to make room (spec 4.3.4).
fn remap_multi_allelic(code: i32) -> u64 {
    match code {
        ALLELE_MISSING => 0,
        ALLELE_END_OF_VECTOR => 1,
        other => other as u64 + 2,
    }
}

fn packed_key(call: &GtCall, remap: impl Fn(i32) -> u64, shift: u32, add: u32) -> u64 {
    let a = remap(allele_at(call, 0));
    let b = remap(allele_at(call, 1));
    let phase = if add == 1 && call.phase { 1 } else { 0 };
    (a << (shift + add)) | (b << add) | phase
}

fn assess_with_remap(
    calls: &[GtCall],
    perm: &[u32],
    shift: u32,
    add: u32,
    remap: impl Fn(i32) -> u64 + Copy,
) -> Option<EncodingChoice> {
    let key_unpermuted: Vec<u64> = calls.iter().map(|c| packed_key(c, remap, shift, add)).collect();
    let key_permuted: Vec<u64> = perm
        .iter()
        .map(|&old| packed_key(&calls[old as usize], remap, shift, add))
        .collect();

    let mut candidates = Vec::new();
    for (permuted, keys) in [(true, &key_permuted), (false, &key_unpermuted)] {
        for width in WordWidth::ALL {
            let run_bits = width.bits() as i64 - (2 * shift + add) as i64;
            if run_bits <= 0 {
                continue; // banned width: not enough bits left for run_length
            }
            let limit = if run_bits >= 64 {
                u64::MAX
            } else {
                (1u64 << run_bits) - 1
            };
            let n_runs = count_runs(keys, limit);
            candidates.push(EncodingChoice {
                width,
                permuted,
                shift,
                add,
                n_runs,
            });
        }
    }
    pick_best(candidates)
}

/// Spec 4.3.3: `shift = 2` if any missing call in the site, else `1`;
/// `add = 1` if phasing is mixed within the site, else `0`.
pub fn assess_diploid_biallelic(
    calls: &[GtCall],
    perm: &[u32],
    summary: &GenotypeSummary,
) -> Option<EncodingChoice> {
    let shift = if summary.n_missing > 0 { 2 } else { 1 };
    let add = if summary.mixed_phasing { 1 } else { 0 };
    assess_with_remap(calls, perm, shift, add, remap_biallelic)
}

/// Spec 4.3.4: `shift = ceil(log2(n_alleles + 3))`.
pub fn assess_diploid_multi_allelic(
    calls: &[GtCall],
    perm: &[u32],
    summary: &GenotypeSummary,
    n_alleles: usize,
) -> Option<EncodingChoice> {
    let shift = ceil_log2(n_alleles as u64 + 3);
    let add = if summary.mixed_phasing { 1 } else { 0 };
    assess_with_remap(calls, perm, shift, add, remap_multi_allelic)
}

/// Packs the run entries for a chosen diploid encoding into little-endian
/// bytes of `choice.width`, per spec 4.3.6's bit layout:
/// `[run_length][allele_a : shift][allele_b : shift][phase : add]`.
/// `calls_in_order` must already be permuted (or not) according to
/// `choice.permuted`. Returns the serialized runs and the run count
/// (pushed separately into `GT_SUPPORT`).
pub fn emit_diploid_runs(
    calls_in_order: &[GtCall],
    choice: &EncodingChoice,
    multi_allelic: bool,
) -> (Vec<u8>, u32) {
    let remap: fn(i32) -> u64 = if multi_allelic {
        remap_multi_allelic
    } else {
        remap_biallelic
    };
    let shift = choice.shift;
    let add = choice.add;
    let run_bits = choice.width.bits() - (2 * shift + add);
    let limit: u64 = if run_bits >= 64 {
        u64::MAX
    } else {
        (1u64 << run_bits) - 1
    };

    let mut out = Vec::new();
    let mut n_runs: u32 = 0;
    let mut i = 0;
    while i < calls_in_order.len() {
        let call = &calls_in_order[i];
        let key = packed_key(call, remap, shift, add);
        let mut run_len: u64 = 1;
        let mut j = i + 1;
        while j < calls_in_order.len() && run_len < limit {
            let next_key = packed_key(&calls_in_order[j], remap, shift, add);
            if next_key != key {
                break;
            }
            run_len += 1;
            j += 1;
        }
        let a = remap(allele_at(call, 0));
        let b = remap(allele_at(call, 1));
        let phase = if add == 1 && call.phase { 1 } else { 0 };
        let entry: u64 = (run_len << (2 * shift + add)) | (a << (shift + add)) | (b << add) | phase;
        push_le_width(&mut out, entry, choice.width);
        n_runs += 1;
        i = j;
    }
    (out, n_runs)
}

fn push_le_width(out: &mut Vec<u8>, v: u64, width: WordWidth) {
    match width {
        WordWidth::W8 => out.push(v as u8),
        WordWidth::W16 => out.extend_from_slice(&(v as u16).to_le_bytes()),
        WordWidth::W32 => out.extend_from_slice(&(v as u32).to_le_bytes()),
        WordWidth::W64 => out.extend_from_slice(&v.to_le_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(a: i32, b: i32, phase: bool) -> GtCall {
        GtCall { alleles: vec![a, b], phase }
    }

    #[test]
    fn test_biallelic_picks_u8_for_long_uniform_run() {
        let calls: Vec<GtCall> = (0..200).map(|_| call(0, 0, false)).collect();
        let perm: Vec<u32> = (0..200).collect();
        let summary = super::super::compute_summary(&calls);
        let choice = assess_diploid_biallelic(&calls, &perm, &summary).unwrap();
        assert_eq!(choice.width, WordWidth::W8);
        assert_eq!(choice.n_runs, 1);
    }

    #[test]
    fn test_biallelic_emit_roundtrip_run_count() {
        let mut calls = vec![call(0, 0, false); 5];
        calls.extend(vec![call(1, 1, false); 3]);
        let perm: Vec<u32> = (0..calls.len() as u32).collect();
        let summary = super::super::compute_summary(&calls);
        let choice = assess_diploid_biallelic(&calls, &perm, &summary).unwrap();
        let (bytes, n_runs) = emit_diploid_runs(&calls, &choice, false);
        assert_eq!(n_runs, 2);
        assert_eq!(bytes.len(), 2 * choice.width.bytes());
    }
}
