//! Block footer & pattern assembly (spec 4.4): per-block INFO/FORMAT/FILTER
//! dictionaries map a file-global dictionary index to a local index scoped
//! to this block, and a pattern table assigns every distinct combination of
//! present fields a `pattern_id` that each `MetaRecord` carries.

use crate::container::ContainerHeader;
use crate::ioutil::{Reader, Writer};
use std::collections::HashMap;
use tachyon_base::{Bitset, Result};

/// Maps file-global dictionary indices to per-block local indices,
/// rebuilt empty at the start of every block.
#[derive(Clone, Debug, Default)]
pub struct StreamDictionary {
    global_to_local: HashMap<i32, u32>,
    locals: Vec<i32>,
}

impl StreamDictionary {
    pub fn new() -> Self {
        Default::default()
    }

    /// `add_stream(global_id) -> local_id` (spec 4.4): allocates a fresh
    /// local index on first sight of a global id, else returns the one
    /// already assigned.
    pub fn add_stream(&mut self, global_id: i32) -> u32 {
        if let Some(&local) = self.global_to_local.get(&global_id) {
            return local;
        }
        let local = self.locals.len() as u32;
        self.locals.push(global_id);
        self.global_to_local.insert(global_id, local);
        local
    }

    pub fn local_of(&self, global_id: i32) -> Option<u32> {
        self.global_to_local.get(&global_id).copied()
    }

    pub fn global_of(&self, local_id: u32) -> Option<i32> {
        self.locals.get(local_id as usize).copied()
    }

    pub fn len(&self) -> usize {
        self.locals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locals.is_empty()
    }

    pub fn globals(&self) -> &[i32] {
        &self.locals
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BitvectorPattern {
    pub global_ids: Vec<i32>,
    pub bitvector: Bitset,
}

/// Allocates pattern ids for observed combinations of present fields within
/// one block (spec 4.4). `add_pattern` hashes the ordered id vector with
/// XXH64 over the little-endian concatenation of the ids and reuses the
/// pattern id on a repeat of the exact same vector.
#[derive(Clone, Debug, Default)]
pub struct PatternTable {
    by_hash: HashMap<u64, u32>,
    patterns: Vec<Vec<i32>>,
}

impl PatternTable {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn add_pattern(&mut self, global_ids: Vec<i32>) -> u32 {
        let hash = xxh64_of_ids(&global_ids);
        if let Some(&id) = self.by_hash.get(&hash) {
            return id;
        }
        let id = self.patterns.len() as u32;
        self.by_hash.insert(hash, id);
        self.patterns.push(global_ids);
        id
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Builds the final `BitvectorPattern` list using `dict`'s global→local
    /// map (spec 4.4's finalization step); each bit-vector is
    /// `ceil((n_streams+1)/8)` bytes, bit `local_id` set iff that field is
    /// present in the pattern.
    pub fn finalize(&self, dict: &StreamDictionary) -> Vec<BitvectorPattern> {
        let n_bits = dict.len() + 1;
        self.patterns
            .iter()
            .map(|global_ids| {
                let mut bitvector = Bitset::with_capacity_bits(n_bits);
                for &gid in global_ids {
                    if let Some(local) = dict.local_of(gid) {
                        bitvector.set(local as usize, true);
                    }
                }
                BitvectorPattern { global_ids: global_ids.clone(), bitvector }
            })
            .collect()
    }
}

fn xxh64_of_ids(ids: &[i32]) -> u64 {
    let mut bytes = Vec::with_capacity(ids.len() * 4);
    for &id in ids {
        bytes.extend_from_slice(&id.to_le_bytes());
    }
    xxhash_rust::xxh64::xxh64(&bytes, 0)
}

fn write_patterns(wr: &mut impl Writer, patterns: &[BitvectorPattern]) -> Result<()> {
    wr.write_annotated_le_num("n_patterns", patterns.len() as u32)?;
    for p in patterns {
        wr.write_annotated_le_num("n_global_ids", p.global_ids.len() as u32)?;
        wr.write_annotated_le_num_slice("global_ids", &p.global_ids)?;
        wr.write_annotated_le_num("bitvector_len", p.bitvector.byte_len() as u32)?;
        wr.write_annotated_byte_slice("bitvector", &p.bitvector.bytes)?;
    }
    Ok(())
}

fn read_patterns(rd: &mut impl Reader) -> Result<Vec<BitvectorPattern>> {
    let n: u32 = rd.read_le_num()?;
    let mut out = Vec::with_capacity(n as usize);
    for _ in 0..n {
        let n_ids: u32 = rd.read_le_num()?;
        let global_ids: Vec<i32> = rd.read_le_num_vec(n_ids as usize)?;
        let bv_len: u32 = rd.read_le_num()?;
        let bitvector = Bitset::from_bytes(rd.read_byte_vec(bv_len as usize)?);
        out.push(BitvectorPattern { global_ids, bitvector });
    }
    Ok(out)
}

fn write_headers(wr: &mut impl Writer, headers: &[ContainerHeader]) -> Result<()> {
    wr.write_annotated_le_num("n_headers", headers.len() as u32)?;
    for h in headers {
        h.write(wr)?;
    }
    Ok(())
}

fn read_headers(rd: &mut impl Reader, n: usize) -> Result<Vec<ContainerHeader>> {
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(ContainerHeader::read(rd)?);
    }
    Ok(out)
}

/// The per-block footer (spec section 3, 4.4): stream dictionaries and
/// pattern tables for INFO/FORMAT/FILTER, plus every container header that
/// describes this block's columns. Serialized as its own compressed
/// container (spec section 6's `footer_container`).
pub struct BlockFooter {
    pub info_dict: StreamDictionary,
    pub format_dict: StreamDictionary,
    pub filter_dict: StreamDictionary,
    pub info_patterns: PatternTable,
    pub format_patterns: PatternTable,
    pub filter_patterns: PatternTable,
    /// The 25 fixed invariant columns, in the spec-mandated order.
    pub invariant_headers: Vec<ContainerHeader>,
    pub info_headers: Vec<ContainerHeader>,
    pub format_headers: Vec<ContainerHeader>,
}

impl BlockFooter {
    pub fn new() -> Self {
        BlockFooter {
            info_dict: StreamDictionary::new(),
            format_dict: StreamDictionary::new(),
            filter_dict: StreamDictionary::new(),
            info_patterns: PatternTable::new(),
            format_patterns: PatternTable::new(),
            filter_patterns: PatternTable::new(),
            invariant_headers: Vec::new(),
            info_headers: Vec::new(),
            format_headers: Vec::new(),
        }
    }

    pub fn write(&self, wr: &mut impl Writer) -> Result<()> {
        wr.push_context("footer");
        wr.write_annotated_le_num("n_info_streams", self.info_dict.len() as u32)?;
        wr.write_annotated_le_num("n_format_streams", self.format_dict.len() as u32)?;
        wr.write_annotated_le_num("n_filter_streams", self.filter_dict.len() as u32)?;
        wr.write_annotated_le_num("n_info_patterns", self.info_patterns.len() as u32)?;
        wr.write_annotated_le_num("n_format_patterns", self.format_patterns.len() as u32)?;
        wr.write_annotated_le_num("n_filter_patterns", self.filter_patterns.len() as u32)?;

        wr.write_annotated_le_num_slice("info_globals", self.info_dict.globals())?;
        wr.write_annotated_le_num_slice("format_globals", self.format_dict.globals())?;
        wr.write_annotated_le_num_slice("filter_globals", self.filter_dict.globals())?;

        write_patterns(wr, &self.info_patterns.finalize(&self.info_dict))?;
        write_patterns(wr, &self.format_patterns.finalize(&self.format_dict))?;
        write_patterns(wr, &self.filter_patterns.finalize(&self.filter_dict))?;

        write_headers(wr, &self.invariant_headers)?;
        write_headers(wr, &self.info_headers)?;
        write_headers(wr, &self.format_headers)?;
        wr.pop_context();
        Ok(())
    }

    pub fn read(rd: &mut impl Reader) -> Result<Self> {
        let n_info_streams: u32 = rd.read_le_num()?;
        let n_format_streams: u32 = rd.read_le_num()?;
        let n_filter_streams: u32 = rd.read_le_num()?;
        let _n_info_patterns: u32 = rd.read_le_num()?;
        let _n_format_patterns: u32 = rd.read_le_num()?;
        let _n_filter_patterns: u32 = rd.read_le_num()?;

        let info_globals: Vec<i32> = rd.read_le_num_vec(n_info_streams as usize)?;
        let format_globals: Vec<i32> = rd.read_le_num_vec(n_format_streams as usize)?;
        let filter_globals: Vec<i32> = rd.read_le_num_vec(n_filter_streams as usize)?;

        let mut info_dict = StreamDictionary::new();
        for g in info_globals {
            info_dict.add_stream(g);
        }
        let mut format_dict = StreamDictionary::new();
        for g in format_globals {
            format_dict.add_stream(g);
        }
        let mut filter_dict = StreamDictionary::new();
        for g in filter_globals {
            filter_dict.add_stream(g);
        }

        let info_bitvectors = read_patterns(rd)?;
        let format_bitvectors = read_patterns(rd)?;
        let filter_bitvectors = read_patterns(rd)?;

        let mut info_patterns = PatternTable::new();
        for p in info_bitvectors {
            info_patterns.add_pattern(p.global_ids);
        }
        let mut format_patterns = PatternTable::new();
        for p in format_bitvectors {
            format_patterns.add_pattern(p.global_ids);
        }
        let mut filter_patterns = PatternTable::new();
        for p in filter_bitvectors {
            filter_patterns.add_pattern(p.global_ids);
        }

        let invariant_headers = read_headers(rd, crate::block::N_INVARIANT_COLUMNS)?;
        let info_headers = read_headers(rd, n_info_streams as usize)?;
        let format_headers = read_headers(rd, n_format_streams as usize)?;

        Ok(BlockFooter {
            info_dict,
            format_dict,
            filter_dict,
            info_patterns,
            format_patterns,
            filter_patterns,
            invariant_headers,
            info_headers,
            format_headers,
        })
    }
}

impl Default for BlockFooter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::DataContainer;
    use crate::ioutil::MemWriter;

    #[test]
    fn test_add_stream_is_idempotent_per_global_id() {
        let mut dict = StreamDictionary::new();
        assert_eq!(dict.add_stream(7), 0);
        assert_eq!(dict.add_stream(9), 1);
        assert_eq!(dict.add_stream(7), 0);
        assert_eq!(dict.len(), 2);
    }

    #[test]
    fn test_add_pattern_dedupes_identical_vectors() {
        let mut patterns = PatternTable::new();
        let a = patterns.add_pattern(vec![3, 1, 4]);
        let b = patterns.add_pattern(vec![3, 1, 4]);
        let c = patterns.add_pattern(vec![1, 3, 4]); // different order -> different hash
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(patterns.len(), 2);
    }

    #[test]
    fn test_pattern_bitvector_matches_local_indices() {
        let mut dict = StreamDictionary::new();
        dict.add_stream(10); // local 0
        dict.add_stream(20); // local 1
        dict.add_stream(30); // local 2

        let mut patterns = PatternTable::new();
        patterns.add_pattern(vec![30, 10]);
        let finalized = patterns.finalize(&dict);
        assert_eq!(finalized.len(), 1);
        let bv = &finalized[0].bitvector;
        assert!(bv.get(0));
        assert!(!bv.get(1));
        assert!(bv.get(2));
        assert_eq!(bv.count(), 2);
        assert_eq!(bv.byte_len(), (dict.len() + 1).div_ceil(8));
    }

    #[test]
    fn test_footer_roundtrip() {
        let mut footer = BlockFooter::new();
        let dp_local = footer.info_dict.add_stream(5);
        assert_eq!(dp_local, 0);
        footer.info_patterns.add_pattern(vec![5]);
        footer.info_patterns.add_pattern(vec![]);

        for _ in 0..crate::block::N_INVARIANT_COLUMNS {
            let mut c = DataContainer::new(-1);
            c.push(crate::container::Value::Int(1));
            c.push_stride(1);
            c.update().unwrap();
            c.compress(6).unwrap();
            footer.invariant_headers.push(c.header.clone());
        }
        let mut c = DataContainer::new(5);
        c.push(crate::container::Value::Int(30));
        c.push_stride(1);
        c.update().unwrap();
        c.compress(6).unwrap();
        footer.info_headers.push(c.header.clone());

        let mut wr = MemWriter::new();
        footer.write(&mut wr).unwrap();
        let mut rd = wr.try_into_reader().unwrap();
        let back = BlockFooter::read(&mut rd).unwrap();

        assert_eq!(back.info_dict.len(), 1);
        assert_eq!(back.info_dict.local_of(5), Some(0));
        assert_eq!(back.info_patterns.len(), 2);
        assert_eq!(back.invariant_headers.len(), crate::block::N_INVARIANT_COLUMNS);
        assert_eq!(back.info_headers.len(), 1);
        assert_eq!(back.info_headers[0].global_key, 5);
    }
}
