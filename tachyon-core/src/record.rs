//! Per-record metadata and the external record-source contract (spec
//! section 3's `MetaRecord`/`Controller`, spec section 6's "Input: record
//! source"). The core never constructs a `RecordView` itself -- an
//! external VCF/BCF parser does, shaped like htslib's `bcf1_t`.

use crate::genotype::{GtCall, GtMethod, WordWidth};
use crate::header::FieldPrimitive;

/// One INFO or FORMAT field's raw bytes for a single record, shaped like
/// htslib's `bcf_info_t`/`bcf_fmt_t`.
pub struct FieldView<'a> {
    /// File-global dictionary index of this field (INFO or FORMAT,
    /// depending on which slice it arrived in).
    pub key: i32,
    pub primitive: FieldPrimitive,
    /// Per-sample element count for FORMAT fields; `1` for INFO fields
    /// unless the field is itself a vector.
    pub n_per_sample: u16,
    pub bytes: &'a [u8],
}

/// One input record (spec section 6). `genotypes` is pulled out of `fmt`
/// into its own slice because the genotype subsystem needs structured
/// allele/phase pairs, not raw bytes, to run the permutation fold and the
/// run-length assessors -- everything else in `fmt` stays as opaque bytes
/// dispatched by `primitive`.
pub struct RecordView<'a> {
    pub rid: i32,
    pub pos: i64,
    pub qual: f32,
    pub id: &'a str,
    pub alleles: &'a [&'a [u8]],
    /// File-global FILTER dictionary indices present on this record.
    pub filters: &'a [i32],
    pub info: &'a [FieldView<'a>],
    pub fmt: &'a [FieldView<'a>],
    /// One call per sample, in file sample order (not yet permuted).
    pub genotypes: &'a [GtCall],
}

/// The 16-bit record controller (spec section 3): a stable bit layout so
/// readers can interpret it without knowing the writer's compiler.
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct Controller(pub u16);

impl Controller {
    pub const BIALLELIC: u16 = 1 << 0;
    pub const DIPLOID: u16 = 1 << 1;
    pub const HAS_MISSING: u16 = 1 << 2;
    pub const MIXED_PHASING: u16 = 1 << 3;
    pub const UNIFORM_PHASE: u16 = 1 << 4;
    pub const MIXED_PLOIDY: u16 = 1 << 5;
    pub const GT_AVAILABLE: u16 = 1 << 6;
    pub const ALL_SNV: u16 = 1 << 7;
    pub const ALLELES_PACKED: u16 = 1 << 8;
    /// Whether this record's genotype runs were encoded against the
    /// block's permuted sample order (spec 4.3.3's per-site independent
    /// permute/don't-permute choice) or the original order.
    pub const GT_PERMUTED: u16 = 1 << 13;
    const GT_ENCODING_SHIFT: u16 = 9;
    const GT_ENCODING_MASK: u16 = 0x3 << Self::GT_ENCODING_SHIFT;
    const GT_PRIMITIVE_SHIFT: u16 = 11;
    const GT_PRIMITIVE_MASK: u16 = 0x3 << Self::GT_PRIMITIVE_SHIFT;

    pub fn has(self, bit: u16) -> bool {
        self.0 & bit != 0
    }

    pub fn set(&mut self, bit: u16, value: bool) {
        if value {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }

    pub fn set_gt_encoding(&mut self, method: Option<GtMethod>) {
        let code: u16 = match method {
            None => 3,
            Some(GtMethod::DiploidBiallelic) => 0,
            Some(GtMethod::DiploidMultiAllelic) => 1,
            Some(GtMethod::Multiploid) => 2,
        };
        self.0 = (self.0 & !Self::GT_ENCODING_MASK) | (code << Self::GT_ENCODING_SHIFT);
    }

    pub fn gt_encoding(self) -> Option<GtMethod> {
        match (self.0 & Self::GT_ENCODING_MASK) >> Self::GT_ENCODING_SHIFT {
            0 => Some(GtMethod::DiploidBiallelic),
            1 => Some(GtMethod::DiploidMultiAllelic),
            2 => Some(GtMethod::Multiploid),
            _ => None,
        }
    }

    pub fn set_gt_primitive(&mut self, width: WordWidth) {
        let code: u16 = match width {
            WordWidth::W8 => 0,
            WordWidth::W16 => 1,
            WordWidth::W32 => 2,
            WordWidth::W64 => 3,
        };
        self.0 = (self.0 & !Self::GT_PRIMITIVE_MASK) | (code << Self::GT_PRIMITIVE_SHIFT);
    }

    pub fn gt_primitive(self) -> WordWidth {
        match (self.0 & Self::GT_PRIMITIVE_MASK) >> Self::GT_PRIMITIVE_SHIFT {
            0 => WordWidth::W8,
            1 => WordWidth::W16,
            2 => WordWidth::W32,
            _ => WordWidth::W64,
        }
    }
}

/// One variant site's metadata, as buffered by a `BlockWriter` and later
/// decoded by a `BlockReader` (spec section 3).
#[derive(Clone, Debug)]
pub struct MetaRecord {
    pub contig_id: i32,
    pub position: i64,
    pub quality: f32,
    pub name: String,
    pub n_alleles: u16,
    pub alleles: Vec<Vec<u8>>,
    pub info_pattern_id: u32,
    pub format_pattern_id: u32,
    pub filter_pattern_id: u32,
    pub controller: Controller,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controller_round_trips_gt_encoding_and_primitive() {
        let mut c = Controller::default();
        c.set(Controller::BIALLELIC, true);
        c.set(Controller::MIXED_PHASING, true);
        c.set_gt_encoding(Some(GtMethod::DiploidMultiAllelic));
        c.set_gt_primitive(WordWidth::W32);

        assert!(c.has(Controller::BIALLELIC));
        assert!(c.has(Controller::MIXED_PHASING));
        assert!(!c.has(Controller::DIPLOID));
        assert_eq!(c.gt_encoding(), Some(GtMethod::DiploidMultiAllelic));
        assert_eq!(c.gt_primitive(), WordWidth::W32);
    }

    #[test]
    fn test_controller_unset_gt_encoding_is_none() {
        let mut c = Controller::default();
        c.set_gt_encoding(None);
        assert_eq!(c.gt_encoding(), None);
    }
}
