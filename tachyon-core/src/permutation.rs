//! Sample-permutation radix sort (spec 4.3.7): builds a per-block
//! permutation array that groups samples sharing identical genotype
//! patterns, which amplifies the genotype run-length encoder's
//! compressibility.

use std::collections::HashMap;

pub const ALLELE_MISSING: i32 = -1;
pub const ALLELE_END_OF_VECTOR: i32 = -2;

/// `perm[new_pos] = old_pos`, rebuilt from scratch once per block.
pub struct PermutationArray {
    pub perm: Vec<u32>,
}

impl PermutationArray {
    pub fn identity(n_samples: usize) -> Self {
        PermutationArray {
            perm: (0..n_samples as u32).collect(),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum BinKey {
    /// Alleles packed into one integer, `shift` bits each; preferred
    /// ordering when the tuple fits in 64 bits.
    Packed(u64),
    /// Tuple didn't fit; bins are instead ordered by hash value alone.
    HashOnly(u64),
}

struct Bin {
    key: BinKey,
    sample_ids: Vec<u32>,
}

/// Accumulates the next permutation one site at a time. `fold_site` is
/// called once per variant in the block, in order; after the last site,
/// `perm.perm` is the block's final PPA.
pub struct PermutationBuilder {
    perm: PermutationArray,
}

impl PermutationBuilder {
    pub fn new(n_samples: usize) -> Self {
        PermutationBuilder {
            perm: PermutationArray::identity(n_samples),
        }
    }

    pub fn into_permutation(self) -> PermutationArray {
        self.perm
    }

    pub fn current(&self) -> &[u32] {
        &self.perm.perm
    }

    /// `genotypes[old_sample_id]` holds that sample's raw allele codes for
    /// this site (ploidy-length, `ALLELE_MISSING`/`ALLELE_END_OF_VECTOR`
    /// sentinels allowed). `max_alleles` is the site's allele count.
    pub fn fold_site(&mut self, genotypes: &[Vec<i32>], max_alleles: usize) {
        if genotypes.is_empty() {
            return;
        }
        let remap = |code: i32| -> u64 {
            if code == ALLELE_MISSING {
                (max_alleles.saturating_sub(1)) as u64
            } else if code == ALLELE_END_OF_VECTOR {
                max_alleles as u64
            } else {
                code as u64
            }
        };
        let shift = bits_for(max_alleles as u64 + 1);

        let mut bins: HashMap<u64, Bin> = HashMap::new();
        for &old_id in &self.perm.perm {
            let alleles = &genotypes[old_id as usize];
            let remapped: Vec<u64> = alleles.iter().map(|&a| remap(a)).collect();
            let hash = hash_tuple(&remapped);
            let packed = pack_if_fits(&remapped, shift);
            bins.entry(hash)
                .and_modify(|b| b.sample_ids.push(old_id))
                .or_insert_with(|| Bin {
                    key: match packed {
                        Some(p) => BinKey::Packed(p),
                        None => BinKey::HashOnly(hash),
                    },
                    sample_ids: vec![old_id],
                });
        }

        let mut bins: Vec<Bin> = bins.into_values().collect();
        bins.sort_by_key(|b| b.key);

        let mut next = Vec::with_capacity(self.perm.perm.len());
        for bin in bins {
            next.extend(bin.sample_ids);
        }
        self.perm.perm = next;
    }
}

fn bits_for(n_distinct_values: u64) -> u32 {
    if n_distinct_values <= 1 {
        1
    } else {
        64 - (n_distinct_values - 1).leading_zeros()
    }
}

fn pack_if_fits(remapped: &[u64], shift: u32) -> Option<u64> {
    let total_bits = shift.checked_mul(remapped.len() as u32)?;
    if total_bits > 64 {
        return None;
    }
    let mut key: u64 = 0;
    for (p, &v) in remapped.iter().enumerate() {
        key |= v.checked_shl(shift * p as u32)?;
    }
    Some(key)
}

fn hash_tuple(tuple: &[u64]) -> u64 {
    let mut bytes = Vec::with_capacity(tuple.len() * 8);
    for &v in tuple {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    rapidhash::rapidhash(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permutation_groups_identical_genotypes() {
        // 4 samples; samples 0 and 2 share a genotype, 1 and 3 share another.
        let genotypes = vec![
            vec![0, 0],
            vec![1, 1],
            vec![0, 0],
            vec![1, 1],
        ];
        let mut builder = PermutationBuilder::new(4);
        builder.fold_site(&genotypes, 2);
        let perm = builder.into_permutation();
        let first = genotypes[perm.perm[0] as usize].clone();
        for &old_id in &perm.perm[..2] {
            assert_eq!(genotypes[old_id as usize], first);
        }
    }

    #[test]
    fn test_identity_permutation_is_valid_permutation() {
        let n = 16;
        let id = PermutationArray::identity(n);
        let mut seen: Vec<u32> = id.perm.clone();
        seen.sort();
        assert_eq!(seen, (0..n as u32).collect::<Vec<_>>());
    }
}
