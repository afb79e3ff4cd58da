//! File-level header (spec section 3 "Lifecycles" and section 6's on-disk
//! file layout): builds the contig/INFO/FORMAT/FILTER dictionaries once at
//! ingest, assigning each field a stable global index ("IDX"). After
//! ingest the dictionaries are frozen and shared freely as immutable data
//! (spec section 5's concurrency model).
//!
//! Grounded on `original_source/tachyon/core/header/header_map_entry.h`
//! (spec section 11): a BCF header may already assign IDX values to its
//! contig/INFO/FORMAT/FILTER lines, and those must be preserved verbatim
//! rather than renumbered, so `Dictionary::insert` accepts an explicit
//! slot index instead of always appending.

use crate::codec;
use crate::ioutil::{Reader, Writer};
use std::collections::HashMap;
use tachyon_base::{err_kind, Kind, Result};

pub const FILE_MAGIC: &[u8; 8] = b"TACHYON\x01";
pub const FILE_VERSION: [i32; 3] = [0, 2, 0];

/// VCF primitive type tag for an INFO/FORMAT declaration; tells the
/// ingest layer how to dispatch a `FieldView`'s raw bytes into a typed
/// `container::Value` push.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FieldPrimitive {
    Integer,
    Float,
    Flag,
    Character,
    String,
}

impl FieldPrimitive {
    fn code(self) -> u8 {
        match self {
            FieldPrimitive::Integer => 0,
            FieldPrimitive::Float => 1,
            FieldPrimitive::Flag => 2,
            FieldPrimitive::Character => 3,
            FieldPrimitive::String => 4,
        }
    }
    fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            0 => FieldPrimitive::Integer,
            1 => FieldPrimitive::Float,
            2 => FieldPrimitive::Flag,
            3 => FieldPrimitive::Character,
            4 => FieldPrimitive::String,
            _ => return Err(err_kind(Kind::InvalidFormat, "unknown field primitive code")),
        })
    }
}

pub trait NamedEntry: Clone {
    fn name(&self) -> &str;
    fn write_fields(&self, wr: &mut impl Writer) -> Result<()>;
    fn read_fields(rd: &mut impl Reader) -> Result<Self>;
}

#[derive(Clone, Debug)]
pub struct ContigEntry {
    pub name: String,
    pub length: i64,
}
impl NamedEntry for ContigEntry {
    fn name(&self) -> &str {
        &self.name
    }
    fn write_fields(&self, wr: &mut impl Writer) -> Result<()> {
        write_string(wr, "name", &self.name)?;
        wr.write_annotated_le_num("length", self.length)?;
        Ok(())
    }
    fn read_fields(rd: &mut impl Reader) -> Result<Self> {
        let name = read_string(rd)?;
        let length: i64 = rd.read_le_num()?;
        Ok(ContigEntry { name, length })
    }
}

#[derive(Clone, Debug)]
pub struct InfoEntry {
    pub id: String,
    pub primitive: FieldPrimitive,
    pub description: String,
}
impl NamedEntry for InfoEntry {
    fn name(&self) -> &str {
        &self.id
    }
    fn write_fields(&self, wr: &mut impl Writer) -> Result<()> {
        write_string(wr, "id", &self.id)?;
        wr.write_annotated_le_num("primitive", self.primitive.code())?;
        write_string(wr, "description", &self.description)?;
        Ok(())
    }
    fn read_fields(rd: &mut impl Reader) -> Result<Self> {
        let id = read_string(rd)?;
        let primitive = FieldPrimitive::from_code(rd.read_le_num()?)?;
        let description = read_string(rd)?;
        Ok(InfoEntry { id, primitive, description })
    }
}

#[derive(Clone, Debug)]
pub struct FormatEntry {
    pub id: String,
    pub primitive: FieldPrimitive,
    pub description: String,
}
impl NamedEntry for FormatEntry {
    fn name(&self) -> &str {
        &self.id
    }
    fn write_fields(&self, wr: &mut impl Writer) -> Result<()> {
        write_string(wr, "id", &self.id)?;
        wr.write_annotated_le_num("primitive", self.primitive.code())?;
        write_string(wr, "description", &self.description)?;
        Ok(())
    }
    fn read_fields(rd: &mut impl Reader) -> Result<Self> {
        let id = read_string(rd)?;
        let primitive = FieldPrimitive::from_code(rd.read_le_num()?)?;
        let description = read_string(rd)?;
        Ok(FormatEntry { id, primitive, description })
    }
}

#[derive(Clone, Debug)]
pub struct FilterEntry {
    pub id: String,
    pub description: String,
}
impl NamedEntry for FilterEntry {
    fn name(&self) -> &str {
        &self.id
    }
    fn write_fields(&self, wr: &mut impl Writer) -> Result<()> {
        write_string(wr, "id", &self.id)?;
        write_string(wr, "description", &self.description)?;
        Ok(())
    }
    fn read_fields(rd: &mut impl Reader) -> Result<Self> {
        let id = read_string(rd)?;
        let description = read_string(rd)?;
        Ok(FilterEntry { id, description })
    }
}

fn write_string(wr: &mut impl Writer, name: &str, s: &str) -> Result<()> {
    wr.write_annotated_le_num(&format!("{name}_len"), s.len() as u32)?;
    wr.write_annotated_byte_slice(name, s.as_bytes())?;
    Ok(())
}

fn read_string(rd: &mut impl Reader) -> Result<String> {
    let len: u32 = rd.read_le_num()?;
    let bytes = rd.read_byte_vec(len as usize)?;
    String::from_utf8(bytes).map_err(|e| err_kind(Kind::InvalidFormat, e.to_string()))
}

/// A slot-addressed dictionary: `insert` honors an explicit IDX when the
/// source header already assigned one (spec section 11), else appends at
/// the next free slot. Frozen after header ingest (spec section 3).
#[derive(Clone, Debug, Default)]
pub struct Dictionary<T: NamedEntry> {
    slots: Vec<Option<T>>,
    by_name: HashMap<String, i32>,
    frozen: bool,
}

impl<T: NamedEntry> Dictionary<T> {
    pub fn new() -> Self {
        Dictionary { slots: Vec::new(), by_name: HashMap::new(), frozen: false }
    }

    /// Returns the field's global IDX, inserting it if unseen. Returns
    /// the existing IDX (ignoring `requested_idx`) if the name is already
    /// present -- dictionaries are additive, never renamed in place.
    pub fn insert(&mut self, entry: T, requested_idx: Option<i32>) -> Result<i32> {
        if self.frozen {
            return Err(err_kind(
                Kind::InvalidFormat,
                "dictionary is frozen after header ingest",
            ));
        }
        if let Some(&existing) = self.by_name.get(entry.name()) {
            return Ok(existing);
        }
        let idx = requested_idx.unwrap_or(self.slots.len() as i32);
        if idx < 0 {
            return Err(err_kind(Kind::InvalidFormat, "negative dictionary IDX"));
        }
        let idx_usize = idx as usize;
        if idx_usize >= self.slots.len() {
            self.slots.resize(idx_usize + 1, None);
        }
        if self.slots[idx_usize].is_some() {
            return Err(err_kind(Kind::InvalidFormat, "duplicate IDX in header dictionary"));
        }
        self.by_name.insert(entry.name().to_string(), idx);
        self.slots[idx_usize] = Some(entry);
        Ok(idx)
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn get(&self, idx: i32) -> Option<&T> {
        if idx < 0 {
            return None;
        }
        self.slots.get(idx as usize).and_then(|s| s.as_ref())
    }

    pub fn idx_of(&self, name: &str) -> Option<i32> {
        self.by_name.get(name).copied()
    }

    /// Occupied-slot count, i.e. the number of distinct fields -- not
    /// `self.slots.len()`, which may include gaps left by explicit IDXs.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (i32, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|e| (i as i32, e)))
    }

    fn write(&self, wr: &mut impl Writer) -> Result<()> {
        let occupied: Vec<(i32, &T)> = self.iter().collect();
        wr.write_annotated_le_num("n_entries", occupied.len() as u32)?;
        for (idx, entry) in occupied {
            wr.push_context(idx);
            wr.write_annotated_le_num("idx", idx)?;
            entry.write_fields(wr)?;
            wr.pop_context();
        }
        Ok(())
    }

    fn read(rd: &mut impl Reader) -> Result<Self> {
        let n_entries: u32 = rd.read_le_num()?;
        let mut dict = Dictionary::new();
        for _ in 0..n_entries {
            let idx: i32 = rd.read_le_num()?;
            let entry = T::read_fields(rd)?;
            dict.insert(entry, Some(idx))?;
        }
        dict.freeze();
        Ok(dict)
    }
}

/// The whole-file header (spec section 6): magic, version, a controller
/// bit-field reserved for file-level flags, `n_samples`, sample names
/// (needed to reconstruct VCF sample columns; not itself a spec-named
/// field but grounded on `original_source/tachyon/core/header/
/// header_sample.h`), the compressed literal VCF header text, and the
/// four frozen dictionaries.
#[derive(Clone, Debug)]
pub struct FileHeader {
    pub version: [i32; 3],
    pub controller: u16,
    pub n_samples: u64,
    pub sample_names: Vec<String>,
    /// Raw VCF header text (`##...` lines), kept for round-trip fidelity;
    /// the core never parses it (spec section 1: the VCF/BCF parser is an
    /// external collaborator).
    pub literals: Vec<u8>,
    pub contigs: Dictionary<ContigEntry>,
    pub info: Dictionary<InfoEntry>,
    pub format: Dictionary<FormatEntry>,
    pub filter: Dictionary<FilterEntry>,
}

impl FileHeader {
    pub fn new(sample_names: Vec<String>) -> Self {
        FileHeader {
            version: FILE_VERSION,
            controller: 0,
            n_samples: sample_names.len() as u64,
            sample_names,
            literals: Vec::new(),
            contigs: Dictionary::new(),
            info: Dictionary::new(),
            format: Dictionary::new(),
            filter: Dictionary::new(),
        }
    }

    /// Freezes all four dictionaries; called once header ingest completes
    /// and before any block is written (spec section 3's lifecycle rule).
    pub fn freeze(&mut self) {
        self.contigs.freeze();
        self.info.freeze();
        self.format.freeze();
        self.filter.freeze();
    }

    pub fn write(&self, wr: &mut impl Writer) -> Result<()> {
        wr.push_context("file_header");
        wr.write_annotated_byte_slice("magic", FILE_MAGIC)?;
        for (i, v) in self.version.iter().enumerate() {
            wr.write_annotated_le_num(&format!("version_{i}"), *v)?;
        }
        wr.write_annotated_le_num("controller", self.controller)?;
        wr.write_annotated_le_num("n_samples", self.n_samples)?;
        wr.write_annotated_le_num("n_contigs", self.contigs.len() as u32)?;
        wr.write_annotated_le_num("n_info", self.info.len() as u32)?;
        wr.write_annotated_le_num("n_format", self.format.len() as u32)?;
        wr.write_annotated_le_num("n_filter", self.filter.len() as u32)?;

        let (literals_compressed, codec) =
            codec::compress_with_fallback(&self.literals, false, 6);
        wr.write_annotated_le_num("l_literals", literals_compressed.len() as u32)?;
        wr.write_annotated_le_num("l_header_compressed", literals_compressed.len() as u32)?;
        wr.write_annotated_le_num("l_header_uncompressed", self.literals.len() as u32)?;
        wr.write_annotated_le_num("literals_codec", codec as u8)?;
        wr.write_annotated_byte_slice("literals", &literals_compressed)?;

        wr.push_context("sample_names");
        wr.write_annotated_le_num("n_sample_names", self.sample_names.len() as u32)?;
        for name in &self.sample_names {
            write_string(wr, "sample_name", name)?;
        }
        wr.pop_context();

        wr.push_context("contigs");
        self.contigs.write(wr)?;
        wr.pop_context();
        wr.push_context("info");
        self.info.write(wr)?;
        wr.pop_context();
        wr.push_context("format");
        self.format.write(wr)?;
        wr.pop_context();
        wr.push_context("filter");
        self.filter.write(wr)?;
        wr.pop_context();
        wr.pop_context();
        Ok(())
    }

    pub fn read(rd: &mut impl Reader) -> Result<Self> {
        let magic = rd.read_byte_vec(8)?;
        if magic.as_slice() != FILE_MAGIC.as_slice() {
            return Err(err_kind(Kind::InvalidFormat, "bad file magic"));
        }
        let mut version = [0i32; 3];
        for v in version.iter_mut() {
            *v = rd.read_le_num()?;
        }
        if version[0] > FILE_VERSION[0] {
            return Err(err_kind(
                Kind::UnsupportedVersion,
                format!("file major version {} is newer than this reader supports", version[0]),
            ));
        }
        let controller: u16 = rd.read_le_num()?;
        let n_samples: u64 = rd.read_le_num()?;
        let _n_contigs: u32 = rd.read_le_num()?;
        let _n_info: u32 = rd.read_le_num()?;
        let _n_format: u32 = rd.read_le_num()?;
        let _n_filter: u32 = rd.read_le_num()?;

        let l_literals: u32 = rd.read_le_num()?;
        let _l_header_compressed: u32 = rd.read_le_num()?;
        let l_header_uncompressed: u32 = rd.read_le_num()?;
        let literals_codec = codec::Codec::from_code(rd.read_le_num()?)
            .ok_or_else(|| err_kind(Kind::UnsupportedCodec, "unknown literals codec"))?;
        let literals_compressed = rd.read_byte_vec(l_literals as usize)?;
        let literals = codec::decompress(
            &literals_compressed,
            literals_codec,
            l_header_uncompressed as usize,
        )?;

        let n_sample_names: u32 = rd.read_le_num()?;
        let mut sample_names = Vec::with_capacity(n_sample_names as usize);
        for _ in 0..n_sample_names {
            sample_names.push(read_string(rd)?);
        }
        if sample_names.len() as u64 != n_samples {
            return Err(err_kind(Kind::InvalidFormat, "n_samples/sample_names mismatch"));
        }

        let contigs = Dictionary::read(rd)?;
        let info = Dictionary::read(rd)?;
        let format = Dictionary::read(rd)?;
        let filter = Dictionary::read(rd)?;

        Ok(FileHeader {
            version,
            controller,
            n_samples,
            sample_names,
            literals,
            contigs,
            info,
            format,
            filter,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ioutil::MemWriter;

    #[test]
    fn test_dictionary_preserves_explicit_idx() {
        let mut d: Dictionary<InfoEntry> = Dictionary::new();
        let dp_idx = d
            .insert(
                InfoEntry { id: "DP".into(), primitive: FieldPrimitive::Integer, description: "".into() },
                Some(5),
            )
            .unwrap();
        assert_eq!(dp_idx, 5);
        let af_idx = d
            .insert(
                InfoEntry { id: "AF".into(), primitive: FieldPrimitive::Float, description: "".into() },
                None,
            )
            .unwrap();
        assert_eq!(af_idx, 6); // appended past the explicit gap
        assert_eq!(d.idx_of("DP"), Some(5));
        assert_eq!(d.len(), 2);
    }

    #[test]
    fn test_dictionary_rejects_duplicate_idx() {
        let mut d: Dictionary<FilterEntry> = Dictionary::new();
        d.insert(FilterEntry { id: "PASS".into(), description: "".into() }, Some(0))
            .unwrap();
        let err = d
            .insert(FilterEntry { id: "q10".into(), description: "".into() }, Some(0))
            .unwrap_err();
        assert_eq!(err.kind(), Kind::InvalidFormat);
    }

    #[test]
    fn test_file_header_roundtrip() {
        let mut h = FileHeader::new(vec!["A".into(), "B".into(), "C".into()]);
        h.contigs
            .insert(ContigEntry { name: "chr1".into(), length: 1000 }, None)
            .unwrap();
        h.info
            .insert(
                InfoEntry { id: "DP".into(), primitive: FieldPrimitive::Integer, description: "Depth".into() },
                None,
            )
            .unwrap();
        h.format
            .insert(
                FormatEntry { id: "GT".into(), primitive: FieldPrimitive::String, description: "Genotype".into() },
                None,
            )
            .unwrap();
        h.filter
            .insert(FilterEntry { id: "PASS".into(), description: "".into() }, None)
            .unwrap();
        h.literals = b"##fileformat=VCFv4.2\n".to_vec();
        h.freeze();

        let mut wr = MemWriter::new();
        h.write(&mut wr).unwrap();
        let mut rd = wr.try_into_reader().unwrap();
        let back = FileHeader::read(&mut rd).unwrap();

        assert_eq!(back.n_samples, 3);
        assert_eq!(back.sample_names, vec!["A", "B", "C"]);
        assert_eq!(back.contigs.idx_of("chr1"), Some(0));
        assert_eq!(back.info.get(0).unwrap().id, "DP");
        assert_eq!(back.format.get(0).unwrap().id, "GT");
        assert_eq!(back.filter.get(0).unwrap().id, "PASS");
        assert_eq!(back.literals, h.literals);
    }
}
