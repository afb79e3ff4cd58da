use super::GtCall;
use crate::permutation::{ALLELE_END_OF_VECTOR, ALLELE_MISSING};

/// Per-site genotype summary computed over every sample's raw call
/// (spec 4.3.1), feeding the encoder-selection dispatch.
#[derive(Clone, Debug, Default)]
pub struct GenotypeSummary {
    pub base_ploidy: usize,
    pub uniform_phase: bool,
    pub mixed_phasing: bool,
    pub n_missing: usize,
    pub n_vector_end: usize,
    pub is_invariant: bool,
}

pub fn compute_summary(calls: &[GtCall]) -> GenotypeSummary {
    let base_ploidy = calls.iter().map(|c| c.alleles.len()).max().unwrap_or(0);

    let uniform_phase = calls
        .iter()
        .find(|c| !c.is_missing_or_eov())
        .map(|c| c.phase)
        .unwrap_or(false);

    let mut mixed_phasing = false;
    let mut n_missing = 0usize;
    let mut n_vector_end = 0usize;
    for call in calls {
        for &a in &call.alleles {
            match a {
                ALLELE_MISSING => n_missing += 1,
                ALLELE_END_OF_VECTOR => n_vector_end += 1,
                _ => {}
            }
        }
        if !call.is_missing_or_eov() && call.phase != uniform_phase {
            mixed_phasing = true;
        }
    }

    let is_invariant = calls
        .first()
        .map(|first| {
            calls
                .iter()
                .all(|c| c.alleles == first.alleles && c.phase == first.phase)
        })
        .unwrap_or(true);

    GenotypeSummary {
        base_ploidy,
        uniform_phase,
        mixed_phasing,
        n_missing,
        n_vector_end,
        is_invariant,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_uniform() {
        let calls = vec![
            GtCall { alleles: vec![0, 0], phase: false },
            GtCall { alleles: vec![0, 0], phase: false },
        ];
        let s = compute_summary(&calls);
        assert!(s.is_invariant);
        assert!(!s.mixed_phasing);
        assert_eq!(s.n_missing, 0);
        assert_eq!(s.base_ploidy, 2);
    }

    #[test]
    fn test_summary_missing_and_mixed_phase() {
        let calls = vec![
            GtCall { alleles: vec![0, 1], phase: false },
            GtCall { alleles: vec![ALLELE_MISSING, ALLELE_MISSING], phase: false },
            GtCall { alleles: vec![1, 1], phase: true },
        ];
        let s = compute_summary(&calls);
        assert!(!s.is_invariant);
        assert!(s.mixed_phasing);
        assert_eq!(s.n_missing, 2);
    }
}
