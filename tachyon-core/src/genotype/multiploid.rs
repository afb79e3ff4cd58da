use super::{count_runs, pick_best, EncodingChoice, GenotypeSummary, GtCall, WordWidth};

fn hash_call(call: &GtCall) -> u64 {
    let mut bytes = Vec::with_capacity(call.alleles.len() * 4 + 1);
    for &a in &call.alleles {
        bytes.extend_from_slice(&a.to_le_bytes());
    }
    bytes.push(call.phase as u8);
    rapidhash::rapidhash(&bytes)
}

/// Spec 4.3.5: ploidy > 2. Each sample's allele tuple is hashed; runs
/// break on hash change. Unlike the diploid variants, no allele bits are
/// packed into the run word, so the run-length limit is the word's full
/// unsigned range.
pub fn assess_multiploid(
    calls: &[GtCall],
    perm: &[u32],
    _summary: &GenotypeSummary,
) -> Option<EncodingChoice> {
    let hashes_unpermuted: Vec<u64> = calls.iter().map(hash_call).collect();
    let hashes_permuted: Vec<u64> = perm.iter().map(|&old| hash_call(&calls[old as usize])).collect();

    let mut candidates = Vec::new();
    for (permuted, hashes) in [(true, &hashes_permuted), (false, &hashes_unpermuted)] {
        for width in WordWidth::ALL {
            let n_runs = count_runs(hashes, width.max_uint());
            candidates.push(EncodingChoice {
                width,
                permuted,
                shift: 0,
                add: 0,
                n_runs,
            });
        }
    }
    pick_best(candidates)
}

/// Spec 4.3.6: each run is `(run_length : word_bits)` followed by
/// `base_ploidy` per-allele bytes (allele codes truncated to `u8`, which
/// holds any realistic VCF allele count).
pub fn emit_multiploid_runs(
    calls_in_order: &[GtCall],
    choice: &EncodingChoice,
    base_ploidy: usize,
) -> (Vec<u8>, u32) {
    let hashes: Vec<u64> = calls_in_order.iter().map(hash_call).collect();
    let limit = choice.width.max_uint();

    let mut out = Vec::new();
    let mut n_runs: u32 = 0;
    let mut i = 0;
    while i < hashes.len() {
        let h = hashes[i];
        let mut run_len: u64 = 1;
        let mut j = i + 1;
        while j < hashes.len() && run_len < limit && hashes[j] == h {
            run_len += 1;
            j += 1;
        }
        push_le_width(&mut out, run_len, choice.width);
        for p in 0..base_ploidy {
            let a = calls_in_order[i].alleles.get(p).copied().unwrap_or(-1);
            out.push(a as u8);
        }
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

    fn call(alleles: &[i32]) -> GtCall {
        GtCall { alleles: alleles.to_vec(), phase: false }
    }

    #[test]
    fn test_multiploid_groups_by_hash() {
        let calls = vec![
            call(&[0, 1, 0]),
            call(&[0, 1, 0]),
            call(&[1, 1, 1]),
        ];
        let perm: Vec<u32> = (0..3).collect();
        let summary = super::super::compute_summary(&calls);
        let choice = assess_multiploid(&calls, &perm, &summary).unwrap();
        let (bytes, n_runs) = emit_multiploid_runs(&calls, &choice, 3);
        assert_eq!(n_runs, 2);
        assert_eq!(bytes.len(), 2 * (choice.width.bytes() + 3));
    }
}
