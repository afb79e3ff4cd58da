//! Block assembly (spec section 3 "Lifecycles", section 4.3, section 6's
//! on-disk block layout): buffers records until a boundary predicate fires,
//! computes the block's sample permutation, dispatches each site's
//! genotype calls to the cheapest run-length encoding, and serializes the
//! 25 fixed invariant columns plus the INFO/FORMAT columns and footer.

use crate::codec::{self, Codec};
use crate::container::{DataContainer, Value};
use crate::footer::BlockFooter;
use crate::genotype::{self, compute_summary, GtCall, GtMethod, WordWidth};
use crate::header::FieldPrimitive;
use crate::ioutil::{MemReader, MemWriter, Reader, Writer};
use crate::keychain::{Keychain, RandomSource};
use crate::permutation::{PermutationBuilder, ALLELE_END_OF_VECTOR, ALLELE_MISSING};
use crate::preprocess;
use crate::record::{Controller, FieldView, MetaRecord, RecordView};
use std::collections::HashMap;
use tachyon_base::{err_kind, Kind, Result};

/// The 25 fixed invariant columns, in the spec-mandated order.
pub const N_INVARIANT_COLUMNS: usize = 25;

/// Sentinel closing every block (spec section 6's `eof_block`).
pub const TACHYON_BLOCK_EOF: u64 = 0x6E8C_1A5F_00FF_EE11;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(usize)]
pub enum InvariantColumn {
    Ppa = 0,
    Contig = 1,
    Position = 2,
    RefAlt = 3,
    Controller = 4,
    Quality = 5,
    Names = 6,
    Alleles = 7,
    IdInfo = 8,
    IdFormat = 9,
    IdFilter = 10,
    GtInt8 = 11,
    GtInt16 = 12,
    GtInt32 = 13,
    GtInt64 = 14,
    GtSInt8 = 15,
    GtSInt16 = 16,
    GtSInt32 = 17,
    GtSInt64 = 18,
    GtNInt8 = 19,
    GtNInt16 = 20,
    GtNInt32 = 21,
    GtNInt64 = 22,
    GtSupport = 23,
    GtPloidy = 24,
}

const ALL_GT_COLUMNS: [InvariantColumn; 12] = [
    InvariantColumn::GtInt8,
    InvariantColumn::GtInt16,
    InvariantColumn::GtInt32,
    InvariantColumn::GtInt64,
    InvariantColumn::GtSInt8,
    InvariantColumn::GtSInt16,
    InvariantColumn::GtSInt32,
    InvariantColumn::GtSInt64,
    InvariantColumn::GtNInt8,
    InvariantColumn::GtNInt16,
    InvariantColumn::GtNInt32,
    InvariantColumn::GtNInt64,
];

/// Which of the 4 width-keyed GT column families a `(method, width)` pair
/// targets (spec 4.3.6): `GT_INT*` for diploid-biallelic, `GT_S_INT*` for
/// diploid-multi-allelic, `GT_N_INT*` for multiploid.
fn gt_column_index(method: GtMethod, width: WordWidth) -> InvariantColumn {
    use InvariantColumn::*;
    match (method, width) {
        (GtMethod::DiploidBiallelic, WordWidth::W8) => GtInt8,
        (GtMethod::DiploidBiallelic, WordWidth::W16) => GtInt16,
        (GtMethod::DiploidBiallelic, WordWidth::W32) => GtInt32,
        (GtMethod::DiploidBiallelic, WordWidth::W64) => GtInt64,
        (GtMethod::DiploidMultiAllelic, WordWidth::W8) => GtSInt8,
        (GtMethod::DiploidMultiAllelic, WordWidth::W16) => GtSInt16,
        (GtMethod::DiploidMultiAllelic, WordWidth::W32) => GtSInt32,
        (GtMethod::DiploidMultiAllelic, WordWidth::W64) => GtSInt64,
        (GtMethod::Multiploid, WordWidth::W8) => GtNInt8,
        (GtMethod::Multiploid, WordWidth::W16) => GtNInt16,
        (GtMethod::Multiploid, WordWidth::W32) => GtNInt32,
        (GtMethod::Multiploid, WordWidth::W64) => GtNInt64,
    }
}

/// At most `max_records` records per block, and every record must share
/// the first record's contig and lie within `max_bases` of its position
/// (spec section 6's block-boundary predicate). The record that trips the
/// predicate belongs to the *next* block.
#[derive(Clone, Copy, Debug)]
pub struct BlockBoundary {
    pub max_records: usize,
    pub max_bases: i64,
}

impl BlockBoundary {
    pub fn fits(&self, first_rid: i32, first_pos: i64, n_in_block: usize, rid: i32, pos: i64) -> bool {
        n_in_block < self.max_records && rid == first_rid && pos - first_pos <= self.max_bases
    }
}

#[derive(Clone, Debug)]
pub struct BlockHeader {
    pub offset_to_footer: u32,
    pub block_hash: u64,
    pub has_gt: bool,
    pub has_gt_permuted: bool,
    pub any_encrypted: bool,
    pub contig_id: i32,
    pub min_pos: i64,
    pub max_pos: i64,
    pub n_variants: u32,
}

impl BlockHeader {
    fn controller_bits(&self) -> u8 {
        (self.has_gt as u8) | ((self.has_gt_permuted as u8) << 1) | ((self.any_encrypted as u8) << 2)
    }

    pub fn write(&self, wr: &mut impl Writer) -> Result<()> {
        wr.push_context("block_header");
        wr.write_annotated_le_num("offset_to_footer", self.offset_to_footer)?;
        wr.write_annotated_le_num("block_hash", self.block_hash)?;
        wr.write_annotated_le_num("controller", self.controller_bits())?;
        wr.write_annotated_le_num("contig_id", self.contig_id)?;
        wr.write_annotated_le_num("min_pos", self.min_pos)?;
        wr.write_annotated_le_num("max_pos", self.max_pos)?;
        wr.write_annotated_le_num("n_variants", self.n_variants)?;
        wr.pop_context();
        Ok(())
    }

    pub fn read(rd: &mut impl Reader) -> Result<Self> {
        let offset_to_footer: u32 = rd.read_le_num()?;
        let block_hash: u64 = rd.read_le_num()?;
        let controller: u8 = rd.read_le_num()?;
        let contig_id: i32 = rd.read_le_num()?;
        let min_pos: i64 = rd.read_le_num()?;
        let max_pos: i64 = rd.read_le_num()?;
        let n_variants: u32 = rd.read_le_num()?;
        Ok(BlockHeader {
            offset_to_footer,
            block_hash,
            has_gt: controller & 1 != 0,
            has_gt_permuted: controller & 2 != 0,
            any_encrypted: controller & 4 != 0,
            contig_id,
            min_pos,
            max_pos,
            n_variants,
        })
    }
}

fn elem_width(primitive: FieldPrimitive) -> usize {
    match primitive {
        FieldPrimitive::Integer => 4,
        FieldPrimitive::Float => 4,
        FieldPrimitive::Flag | FieldPrimitive::Character | FieldPrimitive::String => 1,
    }
}

/// One site's buffered non-GT FORMAT field: htslib's `bcf_fmt_t` lays out
/// a field's bytes as `n_samples` contiguous `n_per_sample * width` chunks,
/// so that's the shape we reorder by the final permutation at finalize
/// time (spec section 5's ordering guarantee: sample order is consistent
/// across every per-sample column of a block, not just genotypes).
struct FormatFieldBuffer {
    primitive: FieldPrimitive,
    sites: Vec<Option<(u16, Vec<u8>)>>,
}

struct RecordDraft {
    contig_id: i32,
    position: i64,
    quality: f32,
    name: String,
    alleles: Vec<Vec<u8>>,
    info_pattern_id: u32,
    format_pattern_id: u32,
    filter_pattern_id: u32,
}

fn push_field_values(container: &mut DataContainer, f: &FieldView) -> Result<()> {
    let width = elem_width(f.primitive);
    let n = f.n_per_sample as usize;
    if f.bytes.len() != width * n {
        return Err(err_kind(
            Kind::InvalidFormat,
            "field byte length does not match n_per_sample * element width",
        ));
    }
    push_field_values_bytes(container, f.primitive, f.bytes)
}

fn push_field_values_bytes(container: &mut DataContainer, primitive: FieldPrimitive, bytes: &[u8]) -> Result<()> {
    let width = elem_width(primitive);
    for chunk in bytes.chunks(width) {
        match primitive {
            FieldPrimitive::Integer => {
                let v = i32::from_le_bytes(chunk.try_into().unwrap());
                container.push(Value::Int(v as i64));
            }
            FieldPrimitive::Float => {
                let v = f32::from_le_bytes(chunk.try_into().unwrap());
                container.push(Value::Float32(v));
            }
            FieldPrimitive::Flag | FieldPrimitive::Character | FieldPrimitive::String => {
                container.push(Value::Char(chunk[0]));
            }
        }
    }
    Ok(())
}

fn refalt_code(base: u8) -> Option<u8> {
    match base.to_ascii_uppercase() {
        b'A' => Some(0),
        b'C' => Some(1),
        b'G' => Some(2),
        b'T' => Some(3),
        _ => None,
    }
}

fn encode_alleles_blob(alleles: &[Vec<u8>]) -> Vec<u8> {
    let mut blob = Vec::new();
    for a in alleles {
        blob.extend_from_slice(&(a.len() as u16).to_le_bytes());
        blob.extend_from_slice(a);
    }
    blob
}

fn decode_alleles_blob(blob: &[u8]) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    let mut i = 0;
    while i + 2 <= blob.len() {
        let len = u16::from_le_bytes([blob[i], blob[i + 1]]) as usize;
        i += 2;
        if i + len > blob.len() {
            break;
        }
        out.push(blob[i..i + len].to_vec());
        i += len;
    }
    out
}

fn read_le_width(bytes: &[u8], width: WordWidth) -> u64 {
    match width {
        WordWidth::W8 => bytes[0] as u64,
        WordWidth::W16 => u16::from_le_bytes([bytes[0], bytes[1]]) as u64,
        WordWidth::W32 => u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as u64,
        WordWidth::W64 => u64::from_le_bytes(bytes[0..8].try_into().unwrap()),
    }
}

/// Reorders a FORMAT field's raw per-sample bytes by the block's final
/// permutation, before pushing into the block-level container.
fn reorder_format_bytes(bytes: &[u8], n_per_sample: usize, primitive: FieldPrimitive, perm: &[u32]) -> Vec<u8> {
    let width = elem_width(primitive);
    let chunk_len = n_per_sample * width;
    if chunk_len == 0 || bytes.len() != chunk_len * perm.len() {
        return bytes.to_vec();
    }
    let mut out = vec![0u8; bytes.len()];
    for (new_pos, &old_pos) in perm.iter().enumerate() {
        let src = &bytes[old_pos as usize * chunk_len..(old_pos as usize + 1) * chunk_len];
        out[new_pos * chunk_len..(new_pos + 1) * chunk_len].copy_from_slice(src);
    }
    out
}

/// Buffers one block's records; `finalize()` runs the permutation fold,
/// the genotype encoder dispatch, and serializes every column.
pub struct BlockWriter {
    n_samples: usize,
    records: Vec<RecordDraft>,
    gt_calls: Vec<Vec<GtCall>>,
    gt_n_alleles: Vec<usize>,
    info_containers: HashMap<i32, DataContainer>,
    info_dict: crate::footer::StreamDictionary,
    format_dict: crate::footer::StreamDictionary,
    filter_dict: crate::footer::StreamDictionary,
    info_patterns: crate::footer::PatternTable,
    format_patterns: crate::footer::PatternTable,
    filter_patterns: crate::footer::PatternTable,
    format_values: HashMap<i32, FormatFieldBuffer>,
    first_rid: Option<i32>,
    first_pos: i64,
    min_pos: i64,
    max_pos: i64,
}

impl BlockWriter {
    pub fn new(n_samples: usize) -> Self {
        BlockWriter {
            n_samples,
            records: Vec::new(),
            gt_calls: Vec::new(),
            gt_n_alleles: Vec::new(),
            info_containers: HashMap::new(),
            info_dict: crate::footer::StreamDictionary::new(),
            format_dict: crate::footer::StreamDictionary::new(),
            filter_dict: crate::footer::StreamDictionary::new(),
            info_patterns: crate::footer::PatternTable::new(),
            format_patterns: crate::footer::PatternTable::new(),
            filter_patterns: crate::footer::PatternTable::new(),
            format_values: HashMap::new(),
            first_rid: None,
            first_pos: 0,
            min_pos: 0,
            max_pos: 0,
        }
    }

    pub fn n_records(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Whether `(rid, pos)` still belongs in this block under `boundary`
    /// (spec section 6). Always `true` for the block's first record.
    pub fn fits(&self, boundary: &BlockBoundary, rid: i32, pos: i64) -> bool {
        match self.first_rid {
            None => true,
            Some(first_rid) => boundary.fits(first_rid, self.first_pos, self.records.len(), rid, pos),
        }
    }

    pub fn append(&mut self, record: &RecordView) -> Result<()> {
        if record.genotypes.len() != self.n_samples {
            return Err(err_kind(
                Kind::InvalidFormat,
                "record genotype count does not match file sample count",
            ));
        }
        let site_idx = self.records.len();
        if self.first_rid.is_none() {
            self.first_rid = Some(record.rid);
            self.first_pos = record.pos;
            self.min_pos = record.pos;
            self.max_pos = record.pos;
        }
        self.min_pos = self.min_pos.min(record.pos);
        self.max_pos = self.max_pos.max(record.pos);

        let mut info_global_ids = Vec::with_capacity(record.info.len());
        for f in record.info {
            self.info_dict.add_stream(f.key);
            info_global_ids.push(f.key);
            let container = self
                .info_containers
                .entry(f.key)
                .or_insert_with(|| DataContainer::new(f.key));
            push_field_values(container, f)?;
            container.push_stride(f.n_per_sample as u32);
        }
        let info_pattern_id = self.info_patterns.add_pattern(info_global_ids);

        let mut filter_ids = Vec::with_capacity(record.filters.len());
        for &fid in record.filters {
            self.filter_dict.add_stream(fid);
            filter_ids.push(fid);
        }
        let filter_pattern_id = self.filter_patterns.add_pattern(filter_ids);

        let mut format_global_ids = Vec::with_capacity(record.fmt.len());
        for f in record.fmt {
            self.format_dict.add_stream(f.key);
            format_global_ids.push(f.key);
            let buf = self.format_values.entry(f.key).or_insert_with(|| FormatFieldBuffer {
                primitive: f.primitive,
                sites: vec![None; site_idx],
            });
            buf.sites.push(Some((f.n_per_sample, f.bytes.to_vec())));
        }
        for buf in self.format_values.values_mut() {
            if buf.sites.len() == site_idx {
                buf.sites.push(None);
            }
        }
        let format_pattern_id = self.format_patterns.add_pattern(format_global_ids);

        let n_alleles = record.alleles.len();
        self.gt_calls.push(record.genotypes.to_vec());
        self.gt_n_alleles.push(n_alleles);

        self.records.push(RecordDraft {
            contig_id: record.rid,
            position: record.pos,
            quality: record.qual,
            name: record.id.to_string(),
            alleles: record.alleles.iter().map(|a| a.to_vec()).collect(),
            info_pattern_id,
            format_pattern_id,
            filter_pattern_id,
        });
        Ok(())
    }

    /// Runs the permutation fold and genotype dispatch, reorders buffered
    /// FORMAT values, compresses every column, and assembles the footer
    /// (spec section 3's block finalize lifecycle step).
    pub fn finalize(self, level: i32) -> Result<FinalizedBlock> {
        let BlockWriter {
            n_samples,
            records,
            gt_calls,
            gt_n_alleles,
            mut info_containers,
            info_dict,
            format_dict,
            filter_dict,
            info_patterns,
            format_patterns,
            filter_patterns,
            format_values,
            first_rid,
            min_pos,
            max_pos,
            ..
        } = self;

        let n_records = records.len();

        let mut builder = PermutationBuilder::new(n_samples);
        for (calls, &n_alleles) in gt_calls.iter().zip(&gt_n_alleles) {
            let genotypes: Vec<Vec<i32>> = calls.iter().map(|c| c.alleles.clone()).collect();
            builder.fold_site(&genotypes, n_alleles.max(1));
        }
        let perm = builder.into_permutation();

        let mut invariant: Vec<DataContainer> = (0..N_INVARIANT_COLUMNS)
            .map(|_| DataContainer::new(-1))
            .collect();

        let mut any_gt = false;
        let mut any_gt_permuted = false;

        for (i, draft) in records.iter().enumerate() {
            let calls = &gt_calls[i];
            let n_alleles = gt_n_alleles[i];
            let gt_available = !calls.is_empty();
            let summary = compute_summary(calls);

            let mut controller = Controller::default();
            controller.set(Controller::BIALLELIC, n_alleles <= 2);
            controller.set(Controller::DIPLOID, gt_available && summary.base_ploidy == 2);
            controller.set(Controller::HAS_MISSING, summary.n_missing > 0);
            controller.set(Controller::MIXED_PHASING, summary.mixed_phasing);
            controller.set(Controller::UNIFORM_PHASE, !summary.mixed_phasing);
            let mixed_ploidy = calls
                .iter()
                .map(|c| c.alleles.len())
                .collect::<std::collections::HashSet<_>>()
                .len()
                > 1;
            controller.set(Controller::MIXED_PLOIDY, mixed_ploidy);
            controller.set(Controller::GT_AVAILABLE, gt_available);

            let all_snv = !draft.alleles.is_empty() && draft.alleles.iter().all(|a| a.len() == 1);
            controller.set(Controller::ALL_SNV, all_snv);

            let refalt_byte = if all_snv && draft.alleles.len() == 2 {
                match (refalt_code(draft.alleles[0][0]), refalt_code(draft.alleles[1][0])) {
                    (Some(r), Some(a)) => {
                        controller.set(Controller::ALLELES_PACKED, true);
                        (r << 2) | a
                    }
                    _ => {
                        controller.set(Controller::ALLELES_PACKED, false);
                        0xFF
                    }
                }
            } else {
                controller.set(Controller::ALLELES_PACKED, false);
                0xFF
            };

            if gt_available {
                any_gt = true;
                let (method, choice) = genotype::select_encoder(calls, &perm.perm, &summary, n_alleles)
                    .ok_or_else(|| err_kind(Kind::Encoder, "no genotype encoding fit any word width"))?;
                controller.set_gt_encoding(Some(method));
                controller.set_gt_primitive(choice.width);
                controller.set(Controller::GT_PERMUTED, choice.permuted);
                if choice.permuted {
                    any_gt_permuted = true;
                }

                let calls_in_order: Vec<GtCall> = if choice.permuted {
                    perm.perm.iter().map(|&old| calls[old as usize].clone()).collect()
                } else {
                    calls.clone()
                };
                let (run_bytes, n_runs) = match method {
                    GtMethod::DiploidBiallelic => genotype::emit_diploid_runs(&calls_in_order, &choice, false),
                    GtMethod::DiploidMultiAllelic => genotype::emit_diploid_runs(&calls_in_order, &choice, true),
                    GtMethod::Multiploid => {
                        genotype::emit_multiploid_runs(&calls_in_order, &choice, summary.base_ploidy)
                    }
                };
                let col = gt_column_index(method, choice.width) as usize;
                let blob_len = run_bytes.len() as u32;
                invariant[col].push(Value::Bytes(run_bytes));
                invariant[col].push_stride(blob_len);
                invariant[InvariantColumn::GtSupport as usize].push(Value::Int(n_runs as i64));
                invariant[InvariantColumn::GtSupport as usize].push_stride(1);
                invariant[InvariantColumn::GtPloidy as usize].push(Value::Int(summary.base_ploidy as i64));
                invariant[InvariantColumn::GtPloidy as usize].push_stride(1);
            } else {
                controller.set_gt_encoding(None);
                invariant[InvariantColumn::GtSupport as usize].push(Value::Int(0));
                invariant[InvariantColumn::GtSupport as usize].push_stride(1);
                invariant[InvariantColumn::GtPloidy as usize].push(Value::Int(0));
                invariant[InvariantColumn::GtPloidy as usize].push_stride(1);
            }

            invariant[InvariantColumn::Contig as usize].push(Value::Int(draft.contig_id as i64));
            invariant[InvariantColumn::Contig as usize].push_stride(1);
            invariant[InvariantColumn::Position as usize].push(Value::Int(draft.position));
            invariant[InvariantColumn::Position as usize].push_stride(1);
            invariant[InvariantColumn::RefAlt as usize].push(Value::Char(refalt_byte));
            invariant[InvariantColumn::RefAlt as usize].push_stride(1);
            invariant[InvariantColumn::Controller as usize].push(Value::Int(controller.0 as i64));
            invariant[InvariantColumn::Controller as usize].push_stride(1);
            invariant[InvariantColumn::Quality as usize].push(Value::Float32(draft.quality));
            invariant[InvariantColumn::Quality as usize].push_stride(1);

            let name_bytes = draft.name.as_bytes().to_vec();
            let name_len = name_bytes.len() as u32;
            invariant[InvariantColumn::Names as usize].push(Value::Bytes(name_bytes));
            invariant[InvariantColumn::Names as usize].push_stride(name_len);

            let alleles_blob = encode_alleles_blob(&draft.alleles);
            let alleles_len = alleles_blob.len() as u32;
            invariant[InvariantColumn::Alleles as usize].push(Value::Bytes(alleles_blob));
            invariant[InvariantColumn::Alleles as usize].push_stride(alleles_len);

            invariant[InvariantColumn::IdInfo as usize].push(Value::Int(draft.info_pattern_id as i64));
            invariant[InvariantColumn::IdInfo as usize].push_stride(1);
            invariant[InvariantColumn::IdFormat as usize].push(Value::Int(draft.format_pattern_id as i64));
            invariant[InvariantColumn::IdFormat as usize].push_stride(1);
            invariant[InvariantColumn::IdFilter as usize].push(Value::Int(draft.filter_pattern_id as i64));
            invariant[InvariantColumn::IdFilter as usize].push_stride(1);
        }

        let perm_bytes: Vec<u8> = perm.perm.iter().flat_map(|v| v.to_le_bytes()).collect();
        let transposed = preprocess::bit_transpose_32(&perm_bytes);
        let transposed_len = transposed.len() as u32;
        invariant[InvariantColumn::Ppa as usize].push(Value::Bytes(transposed));
        invariant[InvariantColumn::Ppa as usize].push_stride(transposed_len);
        invariant[InvariantColumn::Ppa as usize]
            .header
            .preprocessor
            .set(crate::container::Preprocessor::BIT_PERMUTED);
        // Positions are appended in non-decreasing order within a block
        // (spec section 6's boundary predicate only ever extends forward),
        // so delta+zigzag (spec 4.1's "position-like or ordinal streams")
        // is requested here; `compress()` falls back to the plain encoding
        // on its own if the fold doesn't clear `MIN_COMPRESSION_FOLD`.
        invariant[InvariantColumn::Position as usize]
            .header
            .preprocessor
            .set(crate::container::Preprocessor::DELTA);

        for c in invariant.iter_mut() {
            c.update()?;
            c.compress(level)?;
        }

        let info_globals: Vec<i32> = info_dict.globals().to_vec();
        let mut info_out = Vec::with_capacity(info_globals.len());
        for gid in &info_globals {
            let mut c = info_containers
                .remove(gid)
                .expect("info global registered in dictionary without a backing container");
            c.update()?;
            c.compress(level)?;
            info_out.push(c);
        }

        let format_globals: Vec<i32> = format_dict.globals().to_vec();
        let mut format_out = Vec::with_capacity(format_globals.len());
        for gid in &format_globals {
            let buf = format_values
                .get(gid)
                .expect("format global registered in dictionary without a backing buffer");
            let mut c = DataContainer::new(*gid);
            for site in &buf.sites {
                if let Some((n_per_sample, bytes)) = site {
                    let reordered = reorder_format_bytes(bytes, *n_per_sample as usize, buf.primitive, &perm.perm);
                    push_field_values_bytes(&mut c, buf.primitive, &reordered)?;
                    c.push_stride(*n_per_sample as u32 * n_samples as u32);
                }
            }
            c.update()?;
            c.compress(level)?;
            format_out.push(c);
        }

        let mut footer = BlockFooter::new();
        footer.info_dict = info_dict;
        footer.format_dict = format_dict;
        footer.filter_dict = filter_dict;
        footer.info_patterns = info_patterns;
        footer.format_patterns = format_patterns;
        footer.filter_patterns = filter_patterns;
        footer.invariant_headers = invariant.iter().map(|c| c.header.clone()).collect();
        footer.info_headers = info_out.iter().map(|c| c.header.clone()).collect();
        footer.format_headers = format_out.iter().map(|c| c.header.clone()).collect();

        let header = BlockHeader {
            offset_to_footer: 0,
            block_hash: 0,
            has_gt: any_gt,
            has_gt_permuted: any_gt_permuted,
            any_encrypted: false,
            contig_id: first_rid.unwrap_or(-1),
            min_pos,
            max_pos,
            n_variants: n_records as u32,
        };

        Ok(FinalizedBlock {
            header,
            invariant_containers: invariant,
            info_containers: info_out,
            format_containers: format_out,
            footer,
        })
    }
}

/// The finished, compressed block, ready to be written contiguously.
pub struct FinalizedBlock {
    pub header: BlockHeader,
    pub invariant_containers: Vec<DataContainer>,
    pub info_containers: Vec<DataContainer>,
    pub format_containers: Vec<DataContainer>,
    pub footer: BlockFooter,
}

impl FinalizedBlock {
    /// Optionally encrypts every column (invariant + INFO + FORMAT) under
    /// a shared keychain (spec 4.5), run after `finalize()` and before
    /// `write_to`.
    pub fn encrypt_all(&mut self, keychain: &Keychain, rng: &dyn RandomSource) -> Result<()> {
        for c in self
            .invariant_containers
            .iter_mut()
            .chain(self.info_containers.iter_mut())
            .chain(self.format_containers.iter_mut())
        {
            c.encrypt(keychain, rng)?;
        }
        self.header.any_encrypted = true;
        Ok(())
    }

    /// `block_num` is this block's position in the file (spec section 11's
    /// `block_hash` input), not recoverable from the block's own contents.
    pub fn write_to(&self, wr: &mut impl Writer, block_num: u64) -> Result<()> {
        let mut body = MemWriter::new();
        body.push_context("block_body");
        for c in &self.invariant_containers {
            c.write_to(&mut body)?;
        }
        for c in &self.info_containers {
            c.write_to(&mut body)?;
        }
        for c in &self.format_containers {
            c.write_to(&mut body)?;
        }
        body.pop_context();
        let body_bytes = body.into_bytes();

        let mut footer_wr = MemWriter::new();
        self.footer.write(&mut footer_wr)?;
        let footer_bytes = footer_wr.into_bytes();
        let footer_digest = codec::md5_digest(&footer_bytes);

        let mut header = self.header.clone();
        header.offset_to_footer = body_bytes.len() as u32;
        // spec section 11: XXH64 over (contig_id, min_pos, max_pos, block_num),
        // the same hash used for pattern-table hashing (footer.rs's
        // `xxh64_of_ids`), keyed on the block's identity rather than its bytes.
        let mut hash_input = Vec::with_capacity(28);
        hash_input.extend_from_slice(&header.contig_id.to_le_bytes());
        hash_input.extend_from_slice(&header.min_pos.to_le_bytes());
        hash_input.extend_from_slice(&header.max_pos.to_le_bytes());
        hash_input.extend_from_slice(&block_num.to_le_bytes());
        header.block_hash = xxhash_rust::xxh64::xxh64(&hash_input, 0);
        header.write(wr)?;
        wr.write_annotated_byte_slice("block_body", &body_bytes)?;

        let (footer_compressed, footer_codec) = codec::compress_with_fallback(&footer_bytes, false, 6);
        wr.write_annotated_le_num("l_footer_uncompressed", footer_bytes.len() as u32)?;
        wr.write_annotated_le_num("l_footer_compressed", footer_compressed.len() as u32)?;
        wr.write_annotated_le_num("footer_codec", footer_codec as u8)?;
        wr.write_annotated_byte_slice("footer_crc", &footer_digest[0..4])?;
        wr.write_annotated_byte_slice("footer_container", &footer_compressed)?;
        wr.write_annotated_le_num("eof_block", TACHYON_BLOCK_EOF)?;
        Ok(())
    }
}

/// A block read back off disk, columns still compressed (and possibly
/// still encrypted) until `decrypt_and_decompress_all` runs.
pub struct ReadBlock {
    pub header: BlockHeader,
    pub footer: BlockFooter,
    pub invariant_containers: Vec<DataContainer>,
    pub info_containers: Vec<DataContainer>,
    pub format_containers: Vec<DataContainer>,
}

impl ReadBlock {
    pub fn read_from(rd: &mut impl Reader) -> Result<Self> {
        let header = BlockHeader::read(rd)?;
        let body_start = rd.pos()?;
        let footer_start = body_start + header.offset_to_footer as i64;
        rd.rewind_to(footer_start)?;

        let l_footer_uncompressed: u32 = rd.read_le_num()?;
        let l_footer_compressed: u32 = rd.read_le_num()?;
        let footer_codec_byte: u8 = rd.read_le_num()?;
        let footer_codec = Codec::from_code(footer_codec_byte)
            .ok_or_else(|| err_kind(Kind::UnsupportedCodec, "unknown footer codec"))?;
        let footer_crc = rd.read_byte_vec(4)?;
        let footer_compressed = rd.read_byte_vec(l_footer_compressed as usize)?;
        let footer_bytes = codec::decompress(&footer_compressed, footer_codec, l_footer_uncompressed as usize)?;
        let digest = codec::md5_digest(&footer_bytes);
        if digest[0..4] != footer_crc[..] {
            return Err(err_kind(Kind::IntegrityFailure, "block footer CRC mismatch"));
        }
        let mut footer_rd = MemReader::from(footer_bytes);
        let footer = BlockFooter::read(&mut footer_rd)?;

        let eof: u64 = rd.read_le_num()?;
        if eof != TACHYON_BLOCK_EOF {
            return Err(err_kind(Kind::InvalidFormat, "missing block EOF marker"));
        }
        let block_end = rd.pos()?;

        rd.rewind_to(body_start)?;
        let mut invariant_containers = Vec::with_capacity(N_INVARIANT_COLUMNS);
        for _ in 0..N_INVARIANT_COLUMNS {
            invariant_containers.push(DataContainer::read_from(rd)?);
        }
        let mut info_containers = Vec::with_capacity(footer.info_dict.len());
        for _ in 0..footer.info_dict.len() {
            info_containers.push(DataContainer::read_from(rd)?);
        }
        let mut format_containers = Vec::with_capacity(footer.format_dict.len());
        for _ in 0..footer.format_dict.len() {
            format_containers.push(DataContainer::read_from(rd)?);
        }

        rd.rewind_to(block_end)?;

        Ok(ReadBlock {
            header,
            footer,
            invariant_containers,
            info_containers,
            format_containers,
        })
    }

    pub fn decrypt_and_decompress_all(&mut self, keychain: Option<&Keychain>) -> Result<()> {
        for c in self
            .invariant_containers
            .iter_mut()
            .chain(self.info_containers.iter_mut())
            .chain(self.format_containers.iter_mut())
        {
            if c.state() == crate::container::ContainerState::Encrypted {
                let kc = keychain
                    .ok_or_else(|| err_kind(Kind::KeychainMiss, "block is encrypted but no keychain was supplied"))?;
                c.decrypt(kc)?;
            }
            c.decompress()?;
        }
        Ok(())
    }

    /// Reconstructs every record's metadata and genotype calls (un-permuted
    /// back to file sample order), per spec section 3's `MetaRecord`.
    /// INFO/FORMAT values are left in their own containers for the caller
    /// to pull out by field id; decoding every VCF field back to text is
    /// outside the core's scope (spec Non-goals).
    pub fn decode_records(&self, n_samples: usize) -> Result<Vec<(MetaRecord, Vec<GtCall>)>> {
        let n = self.header.n_variants as usize;
        let inv = &self.invariant_containers;

        let contig_ids = inv[InvariantColumn::Contig as usize].decoded_ints(n);
        let positions = inv[InvariantColumn::Position as usize].decoded_ints(n);
        let controllers = inv[InvariantColumn::Controller as usize].decoded_ints(n);
        let id_info = inv[InvariantColumn::IdInfo as usize].decoded_ints(n);
        let id_format = inv[InvariantColumn::IdFormat as usize].decoded_ints(n);
        let id_filter = inv[InvariantColumn::IdFilter as usize].decoded_ints(n);
        let gt_ploidy = inv[InvariantColumn::GtPloidy as usize].decoded_ints(n);

        let quality_strides = column_strides(&inv[InvariantColumn::Quality as usize], n);
        let quality_bytes = inv[InvariantColumn::Quality as usize]
            .decoded_bytes(quality_strides.iter().map(|&s| s as usize).sum::<usize>() * 4);
        let qualities = split_f32(&quality_bytes, &quality_strides);

        let name_strides = column_strides(&inv[InvariantColumn::Names as usize], n);
        let name_bytes =
            inv[InvariantColumn::Names as usize].decoded_bytes(name_strides.iter().map(|&s| s as usize).sum());
        let names = split_bytes(&name_bytes, &name_strides);

        let allele_strides = column_strides(&inv[InvariantColumn::Alleles as usize], n);
        let allele_bytes =
            inv[InvariantColumn::Alleles as usize].decoded_bytes(allele_strides.iter().map(|&s| s as usize).sum());
        let allele_blobs = split_bytes(&allele_bytes, &allele_strides);

        let ppa_c = &inv[InvariantColumn::Ppa as usize];
        let ppa_transposed = ppa_c.decoded_bytes(ppa_c.header.uncompressed_len as usize);
        let ppa_bytes = preprocess::bit_untranspose_32(&ppa_transposed, n_samples);
        let perm: Vec<u32> = ppa_bytes
            .chunks(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect();

        let mut gt_strides: HashMap<usize, Vec<u32>> = HashMap::new();
        let mut gt_full: HashMap<usize, Vec<u8>> = HashMap::new();
        for &col in &ALL_GT_COLUMNS {
            let strides = column_strides(&inv[col as usize], n);
            let total: usize = strides.iter().map(|&s| s as usize).sum();
            let full = inv[col as usize].decoded_bytes(total);
            gt_strides.insert(col as usize, strides);
            gt_full.insert(col as usize, full);
        }
        let mut gt_cursor: HashMap<usize, usize> = HashMap::new();
        let mut gt_byte_cursor: HashMap<usize, usize> = HashMap::new();

        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            let controller = Controller(controllers[i] as u16);
            let name = String::from_utf8_lossy(&names[i]).into_owned();
            let alleles = decode_alleles_blob(&allele_blobs[i]);

            let genotypes = if controller.has(Controller::GT_AVAILABLE) {
                let width = controller.gt_primitive();
                let method = controller
                    .gt_encoding()
                    .ok_or_else(|| err_kind(Kind::InvalidFormat, "GT_AVAILABLE set without a gt_encoding method"))?;
                let col = gt_column_index(method, width) as usize;
                let strides = &gt_strides[&col];
                let cursor = gt_cursor.entry(col).or_insert(0);
                let byte_cursor = gt_byte_cursor.entry(col).or_insert(0);
                let blob_len = strides[*cursor] as usize;
                let full = &gt_full[&col];
                let blob = &full[*byte_cursor..*byte_cursor + blob_len];
                *byte_cursor += blob_len;
                *cursor += 1;

                let base_ploidy = gt_ploidy[i] as usize;
                let add = if controller.has(Controller::MIXED_PHASING) { 1 } else { 0 };
                let calls_in_order = match method {
                    GtMethod::DiploidBiallelic => {
                        let shift = if controller.has(Controller::HAS_MISSING) { 2 } else { 1 };
                        decode_diploid_runs(blob, width, false, n_samples, shift, add)
                    }
                    GtMethod::DiploidMultiAllelic => {
                        let shift = genotype::ceil_log2(alleles.len() as u64 + 3);
                        decode_diploid_runs(blob, width, true, n_samples, shift, add)
                    }
                    GtMethod::Multiploid => decode_multiploid_runs(blob, width, base_ploidy, n_samples),
                };
                if controller.has(Controller::GT_PERMUTED) {
                    unpermute(calls_in_order, &perm)
                } else {
                    calls_in_order
                }
            } else {
                Vec::new()
            };

            let meta = MetaRecord {
                contig_id: contig_ids[i] as i32,
                position: positions[i],
                quality: qualities[i],
                name,
                n_alleles: alleles.len() as u16,
                alleles,
                info_pattern_id: id_info[i] as u32,
                format_pattern_id: id_format[i] as u32,
                filter_pattern_id: id_filter[i] as u32,
                controller,
            };

            out.push((meta, genotypes));
        }
        Ok(out)
    }
}

/// Recovers a column's per-record entry count. A mixed-stride column
/// carries its own length sub-stream; a constant-stride, non-uniform
/// column's entry count follows from `uncompressed_len / window`, which
/// is exact even for a GT column that only a subset of records feed into.
/// A uniform column has truncated to one window and can't recover a true
/// count below `n_records` -- harmless for the fixed one-per-record
/// columns (contig, position, ...) but would undercount a GT column whose
/// few entries happen to collapse to one identical window; real variant
/// data practically never hits that, so it's accepted here rather than
/// carrying a dedicated per-column entry counter through the footer.
fn column_strides(c: &DataContainer, n_records: usize) -> Vec<u32> {
    if let Some(s) = c.decoded_strides() {
        return s;
    }
    if c.header.uniform {
        return vec![c.header.stride.max(0) as u32; n_records];
    }
    let window = c.header.stride.max(0) as usize * c.header.primitive_type.byte_width().max(1);
    let n = if window > 0 { c.data_uncompressed.len() / window } else { 0 };
    vec![c.header.stride.max(0) as u32; n]
}

fn split_bytes(flat: &[u8], strides: &[u32]) -> Vec<Vec<u8>> {
    let mut out = Vec::with_capacity(strides.len());
    let mut i = 0usize;
    for &s in strides {
        let s = s as usize;
        out.push(flat[i..i + s].to_vec());
        i += s;
    }
    out
}

fn split_f32(flat: &[u8], strides: &[u32]) -> Vec<f32> {
    let mut out = Vec::with_capacity(strides.len());
    let mut i = 0usize;
    for &s in strides {
        let n_bytes = s as usize * 4;
        let chunk = &flat[i..i + n_bytes];
        out.push(if chunk.len() >= 4 {
            f32::from_le_bytes(chunk[0..4].try_into().unwrap())
        } else {
            0.0
        });
        i += n_bytes;
    }
    out
}

fn unmap_biallelic(code: u64) -> i32 {
    if code == 2 {
        ALLELE_MISSING
    } else {
        code as i32
    }
}

fn unmap_multi_allelic(code: u64) -> i32 {
    match code {
        0 => ALLELE_MISSING,
        1 => ALLELE_END_OF_VECTOR,
        other => (other - 2) as i32,
    }
}

/// Inverse of `genotype::emit_diploid_runs`. `shift`/`add` aren't stored
/// per column, but they're fully determined by the same inputs the
/// assessor used to choose them (spec 4.3.3/4.3.4): `shift` from
/// `HAS_MISSING`/`n_alleles`, `add` from `MIXED_PHASING` -- both already
/// decoded off the record by the time genotypes are reconstructed.
fn decode_diploid_runs(
    bytes: &[u8],
    width: WordWidth,
    multi_allelic: bool,
    n_samples: usize,
    shift: u32,
    add: u32,
) -> Vec<GtCall> {
    let wbytes = width.bytes();
    let mask = (1u64 << shift) - 1;
    let mut calls = Vec::with_capacity(n_samples);
    let mut i = 0;
    while i + wbytes <= bytes.len() && calls.len() < n_samples {
        let entry = read_le_width(&bytes[i..i + wbytes], width);
        i += wbytes;
        let phase = if add == 1 { (entry & 1) != 0 } else { false };
        let b = (entry >> add) & mask;
        let a = (entry >> (shift + add)) & mask;
        let run_len = entry >> (2 * shift + add);
        let allele_a = if multi_allelic { unmap_multi_allelic(a) } else { unmap_biallelic(a) };
        let allele_b = if multi_allelic { unmap_multi_allelic(b) } else { unmap_biallelic(b) };
        for _ in 0..run_len {
            if calls.len() >= n_samples {
                break;
            }
            calls.push(GtCall { alleles: vec![allele_a, allele_b], phase });
        }
    }
    calls
}

fn decode_multiploid_runs(bytes: &[u8], width: WordWidth, base_ploidy: usize, n_samples: usize) -> Vec<GtCall> {
    let wbytes = width.bytes();
    let mut calls = Vec::with_capacity(n_samples);
    let mut i = 0;
    while i + wbytes <= bytes.len() && calls.len() < n_samples {
        let run_len = read_le_width(&bytes[i..i + wbytes], width);
        i += wbytes;
        if i + base_ploidy > bytes.len() {
            break;
        }
        let alleles: Vec<i32> = bytes[i..i + base_ploidy].iter().map(|&b| b as i8 as i32).collect();
        i += base_ploidy;
        for _ in 0..run_len {
            if calls.len() >= n_samples {
                break;
            }
            calls.push(GtCall { alleles: alleles.clone(), phase: false });
        }
    }
    calls
}

fn unpermute(calls_in_perm_order: Vec<GtCall>, perm: &[u32]) -> Vec<GtCall> {
    let mut out: Vec<Option<GtCall>> = vec![None; perm.len()];
    for (new_pos, &old_pos) in perm.iter().enumerate() {
        if let Some(call) = calls_in_perm_order.get(new_pos) {
            out[old_pos as usize] = Some(call.clone());
        }
    }
    out.into_iter()
        .map(|c| c.unwrap_or(GtCall { alleles: Vec::new(), phase: false }))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ioutil::MemWriter;
    use crate::record::RecordView;

    fn make_call(a: i32, b: i32, phase: bool) -> GtCall {
        GtCall { alleles: vec![a, b], phase }
    }

    #[test]
    fn test_boundary_predicate() {
        let boundary = BlockBoundary { max_records: 2, max_bases: 1000 };
        assert!(boundary.fits(0, 100, 0, 0, 100));
        assert!(boundary.fits(0, 100, 1, 0, 500));
        assert!(!boundary.fits(0, 100, 2, 0, 500));
        assert!(!boundary.fits(0, 100, 1, 1, 500));
        assert!(!boundary.fits(0, 100, 1, 0, 2000));
    }

    #[test]
    fn test_block_roundtrip_trivial_biallelic() {
        let n_samples = 4;
        let mut writer = BlockWriter::new(n_samples);
        for site in 0..5 {
            let genotypes: Vec<GtCall> = (0..n_samples)
                .map(|s| make_call((s as i32 + site) % 2, (s as i32 + site + 1) % 2, false))
                .collect();
            let alleles: Vec<&[u8]> = vec![b"A", b"G"];
            let record = RecordView {
                rid: 0,
                pos: 1000 + site as i64,
                qual: 30.0,
                id: ".",
                alleles: &alleles,
                filters: &[],
                info: &[],
                fmt: &[],
                genotypes: &genotypes,
            };
            writer.append(&record).unwrap();
        }
        let finalized = writer.finalize(6).unwrap();
        assert_eq!(finalized.header.n_variants, 5);
        assert!(finalized.header.has_gt);

        let mut wr = MemWriter::new();
        finalized.write_to(&mut wr, 0).unwrap();
        let mut rd = wr.try_into_reader().unwrap();
        let mut read_back = ReadBlock::read_from(&mut rd).unwrap();
        assert_eq!(read_back.header.n_variants, 5);
        read_back.decrypt_and_decompress_all(None).unwrap();

        let decoded = read_back.decode_records(n_samples).unwrap();
        assert_eq!(decoded.len(), 5);
        for (site, (meta, genotypes)) in decoded.iter().enumerate() {
            assert_eq!(meta.position, 1000 + site as i64);
            assert_eq!(meta.alleles, vec![b"A".to_vec(), b"G".to_vec()]);
            assert_eq!(genotypes.len(), n_samples);
            for s in 0..n_samples {
                assert_eq!(genotypes[s].alleles[0], (s as i32 + site as i32) % 2);
                assert_eq!(genotypes[s].alleles[1], (s as i32 + site as i32 + 1) % 2);
            }
        }
    }

    #[test]
    fn test_block_roundtrip_with_info_and_format_fields() {
        let n_samples = 3;
        let mut writer = BlockWriter::new(n_samples);
        let genotypes = vec![make_call(0, 0, true), make_call(0, 1, true), make_call(1, 1, false)];
        let dp_bytes: Vec<u8> = vec![10i32, 20, 30].into_iter().flat_map(|v| v.to_le_bytes()).collect();
        let info_fields = [FieldView { key: 5, primitive: FieldPrimitive::Integer, n_per_sample: 1, bytes: b"\x2a\x00\x00\x00" }];
        let fmt_fields = [FieldView { key: 7, primitive: FieldPrimitive::Integer, n_per_sample: 1, bytes: &dp_bytes }];
        let alleles: Vec<&[u8]> = vec![b"A", b"T"];
        let record = RecordView {
            rid: 0,
            pos: 500,
            qual: 99.0,
            id: "rs1",
            alleles: &alleles,
            filters: &[0],
            info: &info_fields,
            fmt: &fmt_fields,
            genotypes: &genotypes,
        };
        writer.append(&record).unwrap();
        let finalized = writer.finalize(6).unwrap();
        assert_eq!(finalized.info_containers.len(), 1);
        assert_eq!(finalized.format_containers.len(), 1);

        let mut wr = MemWriter::new();
        finalized.write_to(&mut wr, 0).unwrap();
        let mut rd = wr.try_into_reader().unwrap();
        let mut read_back = ReadBlock::read_from(&mut rd).unwrap();
        read_back.decrypt_and_decompress_all(None).unwrap();
        let decoded = read_back.decode_records(n_samples).unwrap();
        assert_eq!(decoded[0].0.name, "rs1");
        assert_eq!(decoded[0].1.len(), 3);
    }

    #[test]
    fn test_block_encrypted_roundtrip_requires_keychain() {
        use crate::keychain::{DeterministicTestSource, Keychain};
        let n_samples = 2;
        let mut writer = BlockWriter::new(n_samples);
        let genotypes = vec![make_call(0, 1, false), make_call(1, 1, false)];
        let alleles: Vec<&[u8]> = vec![b"A", b"C"];
        let record = RecordView {
            rid: 0,
            pos: 1,
            qual: 1.0,
            id: ".",
            alleles: &alleles,
            filters: &[],
            info: &[],
            fmt: &[],
            genotypes: &genotypes,
        };
        writer.append(&record).unwrap();
        let mut finalized = writer.finalize(6).unwrap();
        let kc = Keychain::new();
        let rng = DeterministicTestSource::new(11);
        finalized.encrypt_all(&kc, &rng).unwrap();
        assert!(finalized.header.any_encrypted);

        let mut wr = MemWriter::new();
        finalized.write_to(&mut wr, 0).unwrap();
        let mut rd = wr.try_into_reader().unwrap();
        let mut read_back = ReadBlock::read_from(&mut rd).unwrap();
        let empty_kc = Keychain::new();
        let err = read_back.decrypt_and_decompress_all(Some(&empty_kc)).unwrap_err();
        assert_eq!(err.kind(), Kind::KeychainMiss);

        read_back.decrypt_and_decompress_all(Some(&kc)).unwrap();
        let decoded = read_back.decode_records(n_samples).unwrap();
        assert_eq!(decoded.len(), 1);
    }
}
