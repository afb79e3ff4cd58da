//! File-level block index (spec section 6's on-disk layout: `file :=
//! file_header block+ index eof_marker`). The index is a flat table of
//! one entry per block recording exactly the summary fields a reader
//! needs to skip straight to the blocks it cares about -- the same
//! `contig_id`/`min_pos`/`max_pos`/`n_variants` already carried in each
//! block's own header (spec section 6's `block_header`), plus the byte
//! range so the reader never has to walk the file sequentially to find
//! block N.
//!
//! Grounded on `original_source/tachyon/containers/interval_container.h`
//! (spec section 11): the original keeps a parallel structure mapping
//! contig/position ranges to block offsets so that region queries don't
//! require scanning every block header in turn.

use crate::ioutil::{Reader, Writer};
use tachyon_base::Result;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    pub contig_id: i32,
    pub min_pos: i64,
    pub max_pos: i64,
    pub n_variants: u32,
    pub block_offset: u64,
    pub block_length: u64,
}

/// One entry per block, in write order (which is also contig/position
/// order, since blocks are only ever appended in ingest order).
#[derive(Clone, Debug, Default)]
pub struct FileIndex {
    pub entries: Vec<IndexEntry>,
}

impl FileIndex {
    pub fn new() -> Self {
        FileIndex::default()
    }

    pub fn push(&mut self, entry: IndexEntry) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Blocks whose `[min_pos, max_pos]` range overlaps `[start, end]` on
    /// `contig_id`, in file order. A linear scan is fine here -- the index
    /// itself is tiny (one entry per block, not per record) even for
    /// files with millions of variants.
    pub fn blocks_overlapping(&self, contig_id: i32, start: i64, end: i64) -> Vec<&IndexEntry> {
        self.entries
            .iter()
            .filter(|e| e.contig_id == contig_id && e.min_pos <= end && e.max_pos >= start)
            .collect()
    }

    pub fn write(&self, wr: &mut impl Writer) -> Result<()> {
        wr.push_context("index");
        wr.write_annotated_le_num("n_blocks", self.entries.len() as u32)?;
        for (i, e) in self.entries.iter().enumerate() {
            wr.push_context(i);
            wr.write_annotated_le_num("contig_id", e.contig_id)?;
            wr.write_annotated_le_num("min_pos", e.min_pos)?;
            wr.write_annotated_le_num("max_pos", e.max_pos)?;
            wr.write_annotated_le_num("n_variants", e.n_variants)?;
            wr.write_annotated_le_num("block_offset", e.block_offset)?;
            wr.write_annotated_le_num("block_length", e.block_length)?;
            wr.pop_context();
        }
        wr.pop_context();
        Ok(())
    }

    pub fn read(rd: &mut impl Reader) -> Result<Self> {
        let n_blocks: u32 = rd.read_le_num()?;
        let mut entries = Vec::with_capacity(n_blocks as usize);
        for _ in 0..n_blocks {
            entries.push(IndexEntry {
                contig_id: rd.read_le_num()?,
                min_pos: rd.read_le_num()?,
                max_pos: rd.read_le_num()?,
                n_variants: rd.read_le_num()?,
                block_offset: rd.read_le_num()?,
                block_length: rd.read_le_num()?,
            });
        }
        Ok(FileIndex { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ioutil::MemWriter;

    fn sample_index() -> FileIndex {
        let mut idx = FileIndex::new();
        idx.push(IndexEntry {
            contig_id: 0,
            min_pos: 100,
            max_pos: 900,
            n_variants: 50,
            block_offset: 128,
            block_length: 4096,
        });
        idx.push(IndexEntry {
            contig_id: 0,
            min_pos: 901,
            max_pos: 2000,
            n_variants: 40,
            block_offset: 4224,
            block_length: 3072,
        });
        idx.push(IndexEntry {
            contig_id: 1,
            min_pos: 1,
            max_pos: 500,
            n_variants: 12,
            block_offset: 7296,
            block_length: 1024,
        });
        idx
    }

    #[test]
    fn test_index_roundtrip() {
        let idx = sample_index();
        let mut wr = MemWriter::new();
        idx.write(&mut wr).unwrap();
        let mut rd = wr.try_into_reader().unwrap();
        let back = FileIndex::read(&mut rd).unwrap();
        assert_eq!(back.entries, idx.entries);
    }

    #[test]
    fn test_blocks_overlapping_filters_by_contig_and_range() {
        let idx = sample_index();
        let hits = idx.blocks_overlapping(0, 850, 950);
        assert_eq!(hits.len(), 2);
        let hits = idx.blocks_overlapping(1, 0, 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].n_variants, 12);
        let hits = idx.blocks_overlapping(2, 0, 10);
        assert!(hits.is_empty());
    }
}
