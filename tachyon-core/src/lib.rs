//! Columnar storage engine for variant-call data (spec section 1-2):
//! ingest VCF/BCF-shaped records into typed, individually-compressed
//! column blocks, and read them back with targeted random access to any
//! subset of columns or blocks.
//!
//! This crate owns the four subsystems the file format is built from --
//! the block data model (`block`, `container`, `footer`), the genotype
//! run-length encoder (`genotype`), the sample-permutation radix sort
//! (`permutation`), and the codec/preprocessor pipeline (`codec`,
//! `preprocess`) -- plus the ambient file-level pipeline that ties them
//! together (`header`, `index`, and this module's `TachyonWriter`/
//! `TachyonReader`). Parsing an actual VCF/BCF file into `RecordView`s is
//! an external collaborator's job (spec section 1); this crate only
//! defines the shape of the record it expects to ingest.

pub mod annotations;
pub mod block;
pub mod codec;
pub mod container;
pub mod footer;
pub mod genotype;
pub mod header;
pub mod index;
pub mod ioutil;
pub mod keychain;
pub mod permutation;
pub mod preprocess;
pub mod primitive;
pub mod record;

use block::{BlockBoundary, BlockWriter, FinalizedBlock, ReadBlock};
use header::FileHeader;
use index::{FileIndex, IndexEntry};
use ioutil::{FileReader, FileWriter, Reader, Writer};
use keychain::{Keychain, RandomSource};
use record::{MetaRecord, RecordView};
use std::io::{Seek, SeekFrom, Write as _};
use std::path::PathBuf;
use std::sync::Arc;
use tachyon_base::{err_kind, Kind, Result};

pub use genotype::GtCall;

/// File-level sentinel closing a `.yon` file (spec section 6's
/// `eof_marker`), distinct from the per-block `block::TACHYON_BLOCK_EOF`.
pub const EOF_MARKER: [u8; 32] = [
    0xfa, 0x20, 0x42, 0x7e, 0x11, 0x8a, 0x1f, 0x0c, 0x7e, 0x11, 0x95, 0xe4, 0xf8, 0x5e, 0x15, 0xe7,
    0x43, 0x68, 0xb1, 0x12, 0xe7, 0x0d, 0xd8, 0x9f, 0xd0, 0x27, 0x72, 0xe1, 0xd9, 0x0c, 0xb5, 0xdd,
];

/// Writes a `.yon` file from front to back: header, then one block per
/// `append` run that trips `boundary`, then the file index, then
/// `EOF_MARKER`. Nothing is buffered beyond the block currently being
/// assembled.
pub struct TachyonWriter {
    wr: FileWriter,
    header: FileHeader,
    boundary: BlockBoundary,
    level: i32,
    keychain: Option<Arc<Keychain>>,
    rng: Option<Arc<dyn RandomSource>>,
    current: Option<BlockWriter>,
    index: FileIndex,
    n_samples: usize,
}

impl TachyonWriter {
    /// `header` must already have its contig/INFO/FORMAT/FILTER
    /// dictionaries populated; it is frozen here (spec section 3's
    /// lifecycle: header ingest happens once, before any block).
    pub fn create(
        path: PathBuf,
        mut header: FileHeader,
        boundary: BlockBoundary,
        level: i32,
        keychain: Option<Arc<Keychain>>,
        rng: Option<Arc<dyn RandomSource>>,
    ) -> Result<Self> {
        header.freeze();
        let n_samples = header.sample_names.len();
        let mut wr = FileWriter::try_create_non_existing(path)?;
        header.write(&mut wr)?;
        Ok(TachyonWriter {
            wr,
            header,
            boundary,
            level,
            keychain,
            rng,
            current: None,
            index: FileIndex::new(),
            n_samples,
        })
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    /// Buffers `record` into the current block, flushing and starting a
    /// fresh block first if `record` trips the boundary predicate (spec
    /// section 6: the tripping record carries over into the new block).
    pub fn append(&mut self, record: &RecordView) -> Result<()> {
        let needs_flush = match &self.current {
            None => false,
            Some(bw) => !bw.fits(&self.boundary, record.rid, record.pos),
        };
        if needs_flush {
            self.flush_current()?;
        }
        if self.current.is_none() {
            self.current = Some(BlockWriter::new(self.n_samples));
        }
        self.current.as_mut().unwrap().append(record)
    }

    fn flush_current(&mut self) -> Result<()> {
        let Some(bw) = self.current.take() else {
            return Ok(());
        };
        if bw.is_empty() {
            return Ok(());
        }
        let block_num = self.index.len();
        let n_records = bw.n_records();
        let span = tracing::info_span!("write_block", block_num, n_records);
        let _enter = span.enter();

        let mut finalized: FinalizedBlock = bw.finalize(self.level)?;
        if let (Some(kc), Some(rng)) = (&self.keychain, &self.rng) {
            finalized.encrypt_all(kc, rng.as_ref())?;
        }

        let block_offset = self.wr.pos()? as u64;
        finalized.write_to(&mut self.wr, block_num as u64)?;
        let block_end = self.wr.pos()? as u64;

        self.index.push(IndexEntry {
            contig_id: finalized.header.contig_id,
            min_pos: finalized.header.min_pos,
            max_pos: finalized.header.max_pos,
            n_variants: finalized.header.n_variants,
            block_offset,
            block_length: block_end - block_offset,
        });
        Ok(())
    }

    /// Flushes any buffered block, writes the file index, and appends
    /// `EOF_MARKER` (spec section 6's file layout grammar).
    pub fn finish(mut self) -> Result<()> {
        self.flush_current()?;
        self.index.write(&mut self.wr)?;
        self.wr.write_annotated_byte_slice("eof_marker", &EOF_MARKER)?;
        self.wr.flush()?;
        Ok(())
    }
}

/// Reads a `.yon` file back: header first, then (by index-driven seek)
/// any block's column data. A block that fails to read -- integrity
/// failure, unsupported codec, truncated tail -- is skipped rather than
/// aborting the whole read (spec section 7: "a reader failing on one
/// block does not corrupt subsequent blocks").
pub struct TachyonReader {
    rd: FileReader,
    header: FileHeader,
    index: FileIndex,
}

impl TachyonReader {
    pub fn open(path: PathBuf) -> Result<Self> {
        let mut rd = FileReader::try_open_existing(path)?;
        let header = FileHeader::read(&mut rd)?;

        let end = rd.seek(SeekFrom::End(0))? as i64;
        let marker_start = end - EOF_MARKER.len() as i64;
        rd.rewind_to(marker_start)?;
        let marker = rd.read_byte_vec(EOF_MARKER.len())?;
        if marker != EOF_MARKER {
            return Err(err_kind(Kind::InvalidFormat, "missing file EOF marker"));
        }

        // The index sits directly before the marker, but its own byte
        // length isn't separately recorded anywhere; recover its start by
        // walking block+ from just after the header, using each block's
        // own footer-length fields to skip over it without decompressing
        // any column (`ReadBlock::read_from` never decodes column bodies,
        // only headers and the footer).
        let header_end = rd.pos()?;
        let index = Self::scan_index(&mut rd, header_end, marker_start)?;

        Ok(TachyonReader { rd, header, index })
    }

    fn scan_index(rd: &mut FileReader, header_end: i64, index_upper_bound: i64) -> Result<FileIndex> {
        rd.rewind_to(header_end)?;
        loop {
            let pos = rd.pos()?;
            if pos >= index_upper_bound {
                rd.rewind_to(pos)?;
                return FileIndex::read(rd);
            }
            ReadBlock::read_from(rd)?;
        }
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    pub fn index(&self) -> &FileIndex {
        &self.index
    }

    pub fn n_blocks(&self) -> usize {
        self.index.len()
    }

    /// Reads and fully decodes block `i` (0-based, file order), applying
    /// `keychain` if any column is encrypted. Returns the block's
    /// records with their un-permuted genotype calls.
    pub fn read_block(&mut self, i: usize, keychain: Option<&Keychain>) -> Result<Vec<(MetaRecord, Vec<GtCall>)>> {
        let entry = self
            .index
            .entries
            .get(i)
            .ok_or_else(|| err_kind(Kind::InvalidFormat, "block index out of range"))?
            .clone();
        let span = tracing::info_span!("read_block", block_num = i, n_variants = entry.n_variants);
        let _enter = span.enter();

        self.rd.rewind_to(entry.block_offset as i64)?;
        let mut block = ReadBlock::read_from(&mut self.rd)?;
        block.decrypt_and_decompress_all(keychain)?;
        block.decode_records(self.header.sample_names.len())
    }

    /// Decodes every block in file order, logging and skipping (rather
    /// than aborting on) any block that fails to read (spec section 7's
    /// recovery policy).
    pub fn read_all(&mut self, keychain: Option<&Keychain>) -> Vec<(MetaRecord, Vec<GtCall>)> {
        let mut out = Vec::new();
        for i in 0..self.n_blocks() {
            match self.read_block(i, keychain) {
                Ok(mut records) => out.append(&mut records),
                Err(e) => {
                    tracing::warn!(block_num = i, error = %e, "skipping unreadable block");
                }
            }
        }
        out
    }

    /// Blocks overlapping `[start, end]` on `contig_id`, for callers that
    /// want to restrict decoding to a region (spec section 1's "targeted
    /// random access").
    pub fn blocks_in_region(&self, contig_id: i32, start: i64, end: i64) -> Vec<usize> {
        self.index
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.contig_id == contig_id && e.min_pos <= end && e.max_pos >= start)
            .map(|(i, _)| i)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genotype::GtCall;
    use crate::header::{ContigEntry, FieldPrimitive, FileHeader, FormatEntry};
    use crate::keychain::{DeterministicTestSource, Keychain};
    use crate::record::RecordView;

    fn tmp_path(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("tachyon_test_{name}_{}.yon", std::process::id()));
        let _ = std::fs::remove_file(&p);
        p
    }

    #[test]
    fn test_whole_file_roundtrip_single_block() {
        let path = tmp_path("single_block");
        let mut header = FileHeader::new(vec!["S1".into(), "S2".into()]);
        header.contigs.insert(ContigEntry { name: "chr1".into(), length: 1000 }, None).unwrap();
        let gt_idx = header
            .format
            .insert(
                FormatEntry { id: "GT".into(), primitive: FieldPrimitive::String, description: "".into() },
                None,
            )
            .unwrap();
        assert_eq!(gt_idx, 0);

        let boundary = BlockBoundary { max_records: 65536, max_bases: 10_000_000 };
        let mut writer = TachyonWriter::create(path.clone(), header, boundary, 3, None, None).unwrap();

        for i in 0..5 {
            let genotypes = vec![
                GtCall { alleles: vec![0, 1], phase: false },
                GtCall { alleles: vec![1, 1], phase: true },
            ];
            let alleles: Vec<&[u8]> = vec![b"A", b"T"];
            let record = RecordView {
                rid: 0,
                pos: 100 + i,
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
        writer.finish().unwrap();

        let mut reader = TachyonReader::open(path.clone()).unwrap();
        assert_eq!(reader.header().sample_names, vec!["S1", "S2"]);
        assert_eq!(reader.n_blocks(), 1);
        let records = reader.read_block(0, None).unwrap();
        assert_eq!(records.len(), 5);
        assert_eq!(records[0].1.len(), 2);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_whole_file_roundtrip_multiple_blocks_via_boundary() {
        let path = tmp_path("multi_block");
        let mut header = FileHeader::new(vec!["S1".into()]);
        header.contigs.insert(ContigEntry { name: "chr1".into(), length: 1000 }, None).unwrap();
        let boundary = BlockBoundary { max_records: 2, max_bases: 10_000_000 };
        let mut writer = TachyonWriter::create(path.clone(), header, boundary, 3, None, None).unwrap();

        for i in 0..5 {
            let genotypes = vec![GtCall { alleles: vec![0, 0], phase: false }];
            let alleles: Vec<&[u8]> = vec![b"A", b"C"];
            let record = RecordView {
                rid: 0,
                pos: 10 + i,
                qual: 1.0,
                id: ".",
                alleles: &alleles,
                filters: &[],
                info: &[],
                fmt: &[],
                genotypes: &genotypes,
            };
            writer.append(&record).unwrap();
        }
        writer.finish().unwrap();

        let mut reader = TachyonReader::open(path.clone()).unwrap();
        assert_eq!(reader.n_blocks(), 3); // 2 + 2 + 1
        let all = reader.read_all(None);
        assert_eq!(all.len(), 5);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_whole_file_roundtrip_encrypted() {
        let path = tmp_path("encrypted");
        let mut header = FileHeader::new(vec!["S1".into()]);
        header.contigs.insert(ContigEntry { name: "chr1".into(), length: 1000 }, None).unwrap();
        let boundary = BlockBoundary { max_records: 65536, max_bases: 10_000_000 };
        let keychain = Arc::new(Keychain::new());
        let rng: Arc<dyn RandomSource> = Arc::new(DeterministicTestSource::new(99));
        let mut writer = TachyonWriter::create(
            path.clone(),
            header,
            boundary,
            3,
            Some(keychain.clone()),
            Some(rng),
        )
        .unwrap();

        let genotypes = vec![GtCall { alleles: vec![0, 1], phase: false }];
        let alleles: Vec<&[u8]> = vec![b"A", b"G"];
        let record = RecordView {
            rid: 0,
            pos: 55,
            qual: 10.0,
            id: ".",
            alleles: &alleles,
            filters: &[],
            info: &[],
            fmt: &[],
            genotypes: &genotypes,
        };
        writer.append(&record).unwrap();
        writer.finish().unwrap();

        let mut reader = TachyonReader::open(path.clone()).unwrap();
        assert!(reader.read_block(0, None).is_err());
        let records = reader.read_block(0, Some(&keychain)).unwrap();
        assert_eq!(records.len(), 1);

        std::fs::remove_file(&path).ok();
    }
}
