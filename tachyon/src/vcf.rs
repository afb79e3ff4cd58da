//! A minimal VCF 4.x text reader that feeds `tachyon_core`'s record-source
//! contract (spec section 6: the real VCF/BCF parser is an external
//! collaborator -- this is just enough of one to drive the CLI end to
//! end). It does not aim for full VCF coverage: structural/symbolic ALT
//! alleles and breakend notation round-trip as opaque bytes, and every
//! FORMAT/INFO field is assumed to carry the same element count on every
//! record it appears on (no per-record `Number=.` resizing).
//!
//! Grounded on `original_source/tachyon/io/vcf/VCFHeader.h` (spec section
//! 11) for the header/sample-line/contig-table shape.

use std::io::BufRead;
use tachyon_base::{err, Result};
use tachyon_core::genotype::GtCall;
use tachyon_core::header::{ContigEntry, FieldPrimitive, FileHeader, FilterEntry, FormatEntry, InfoEntry};
use tachyon_core::permutation::{ALLELE_END_OF_VECTOR, ALLELE_MISSING};

pub struct OwnedField {
    pub key: i32,
    pub primitive: FieldPrimitive,
    pub n_per_sample: u16,
    pub bytes: Vec<u8>,
}

pub struct ParsedRecord {
    pub rid: i32,
    pub pos: i64,
    pub qual: f32,
    pub id: String,
    pub alleles: Vec<Vec<u8>>,
    pub filters: Vec<i32>,
    pub info: Vec<OwnedField>,
    pub fmt: Vec<OwnedField>,
    pub genotypes: Vec<GtCall>,
}

/// A VCF reader over any buffered byte source: parses `##`/`#CHROM`
/// header lines into a frozen `FileHeader`, then yields one
/// `ParsedRecord` per data line.
pub struct VcfReader<R: BufRead> {
    inner: R,
    header: FileHeader,
    declared_info: std::collections::HashMap<String, FieldPrimitive>,
    declared_format: std::collections::HashMap<String, FieldPrimitive>,
    line: String,
}

impl<R: BufRead> VcfReader<R> {
    pub fn new(mut inner: R) -> Result<Self> {
        let mut literal = Vec::new();
        let mut contigs = Vec::new();
        let mut info_decls = Vec::new();
        let mut format_decls = Vec::new();
        let mut filter_decls = Vec::new();
        let mut sample_names = Vec::new();
        let mut line = String::new();

        loop {
            line.clear();
            let n = inner.read_line(&mut line).map_err(tachyon_base::Error::from)?;
            if n == 0 {
                return Err(err("VCF file ended before #CHROM header line"));
            }
            let trimmed = line.trim_end_matches(['\n', '\r']);
            if let Some(rest) = trimmed.strip_prefix("##") {
                literal.extend_from_slice(trimmed.as_bytes());
                literal.push(b'\n');
                if let Some(body) = rest.strip_prefix("contig=<").and_then(|s| s.strip_suffix('>')) {
                    let kv = parse_kv_list(body);
                    let name = kv.get("ID").cloned().unwrap_or_default();
                    let length = kv.get("length").and_then(|s| s.parse().ok()).unwrap_or(0);
                    contigs.push((name, length));
                } else if let Some(body) = rest.strip_prefix("INFO=<").and_then(|s| s.strip_suffix('>')) {
                    let kv = parse_kv_list(body);
                    info_decls.push(decl_from_kv(&kv));
                } else if let Some(body) = rest.strip_prefix("FORMAT=<").and_then(|s| s.strip_suffix('>')) {
                    let kv = parse_kv_list(body);
                    format_decls.push(decl_from_kv(&kv));
                } else if let Some(body) = rest.strip_prefix("FILTER=<").and_then(|s| s.strip_suffix('>')) {
                    let kv = parse_kv_list(body);
                    let id = kv.get("ID").cloned().unwrap_or_default();
                    let description = kv.get("Description").cloned().unwrap_or_default();
                    filter_decls.push((id, description));
                }
                continue;
            }
            if let Some(rest) = trimmed.strip_prefix("#CHROM") {
                let cols: Vec<&str> = rest.split('\t').collect();
                // cols[0..8] are POS..INFO (minus CHROM itself); samples
                // start after FORMAT, i.e. index 8 in the full #CHROM line.
                if cols.len() > 8 {
                    sample_names = cols[8..].iter().map(|s| s.to_string()).collect();
                }
                break;
            }
            return Err(err("unexpected line before #CHROM header"));
        }

        let mut header = FileHeader::new(sample_names);
        header.literals = literal;
        for (name, length) in contigs {
            header.contigs.insert(ContigEntry { name, length }, None)?;
        }
        let mut declared_info = std::collections::HashMap::new();
        for (id, primitive, description) in info_decls {
            declared_info.insert(id.clone(), primitive);
            header.info.insert(InfoEntry { id, primitive, description }, None)?;
        }
        let mut declared_format = std::collections::HashMap::new();
        for (id, primitive, description) in format_decls {
            declared_format.insert(id.clone(), primitive);
            header.format.insert(FormatEntry { id, primitive, description }, None)?;
        }
        for (id, description) in filter_decls {
            header.filter.insert(FilterEntry { id, description }, None)?;
        }

        Ok(VcfReader { inner, header, declared_info, declared_format, line: String::new() })
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    /// Parses the next data line, or `None` at EOF.
    pub fn next_record(&mut self) -> Result<Option<ParsedRecord>> {
        self.line.clear();
        let n = self.inner.read_line(&mut self.line).map_err(tachyon_base::Error::from)?;
        if n == 0 {
            return Ok(None);
        }
        let trimmed = self.line.trim_end_matches(['\n', '\r']);
        if trimmed.is_empty() {
            return self.next_record();
        }
        let cols: Vec<&str> = trimmed.split('\t').collect();
        if cols.len() < 8 {
            return Err(err("VCF data line has fewer than 8 columns"));
        }
        let chrom = cols[0];
        let rid = self
            .header
            .contigs
            .idx_of(chrom)
            .ok_or_else(|| err(format!("record references undeclared contig '{chrom}'")))?;
        let pos: i64 = cols[1].parse::<i64>().map_err(|e| err(e.to_string()))? - 1; // VCF is 1-based
        let id = cols[2].to_string();
        let reference = cols[3].as_bytes().to_vec();
        let mut alleles = vec![reference];
        if cols[4] != "." {
            alleles.extend(cols[4].split(',').map(|a| a.as_bytes().to_vec()));
        }
        let qual = if cols[5] == "." { f32::NAN } else { cols[5].parse().map_err(|e: std::num::ParseFloatError| err(e.to_string()))? };

        let mut filters = Vec::new();
        if cols[6] != "." {
            for name in cols[6].split(';') {
                if name == "." {
                    continue;
                }
                let fidx = match self.header.filter.idx_of(name) {
                    Some(i) => i,
                    None => self.header.filter.insert(
                        FilterEntry { id: name.to_string(), description: String::new() },
                        None,
                    )?,
                };
                filters.push(fidx);
            }
        }

        let mut info = Vec::new();
        if cols[7] != "." {
            for kv in cols[7].split(';') {
                if kv.is_empty() {
                    continue;
                }
                let (key_name, value) = match kv.split_once('=') {
                    Some((k, v)) => (k, Some(v)),
                    None => (kv, None),
                };
                let primitive = *self.declared_info.get(key_name).unwrap_or(&FieldPrimitive::Flag);
                let key = match self.header.info.idx_of(key_name) {
                    Some(i) => i,
                    None => self.header.info.insert(
                        InfoEntry { id: key_name.to_string(), primitive, description: String::new() },
                        None,
                    )?,
                };
                let (bytes, n) = encode_scalar_list(primitive, value.unwrap_or(""))?;
                info.push(OwnedField { key, primitive, n_per_sample: n as u16, bytes });
            }
        }

        let mut genotypes = Vec::new();
        let mut fmt = Vec::new();
        if cols.len() > 8 {
            let fmt_keys: Vec<&str> = cols[8].split(':').collect();
            let sample_cols = &cols[9..];
            let gt_pos = fmt_keys.iter().position(|&k| k == "GT");

            if let Some(gt_pos) = gt_pos {
                for sample in sample_cols {
                    let parts: Vec<&str> = sample.split(':').collect();
                    let gt_str = parts.get(gt_pos).copied().unwrap_or(".");
                    genotypes.push(parse_genotype(gt_str));
                }
            } else {
                genotypes = vec![GtCall { alleles: vec![ALLELE_MISSING, ALLELE_MISSING], phase: false }; sample_cols.len()];
            }

            for (fi, &key_name) in fmt_keys.iter().enumerate() {
                if key_name == "GT" {
                    continue;
                }
                let primitive = *self.declared_format.get(key_name).unwrap_or(&FieldPrimitive::String);
                let key = match self.header.format.idx_of(key_name) {
                    Some(i) => i,
                    None => self.header.format.insert(
                        FormatEntry { id: key_name.to_string(), primitive, description: String::new() },
                        None,
                    )?,
                };
                let mut bytes = Vec::new();
                let mut n_per_sample = 1usize;
                for sample in sample_cols {
                    let parts: Vec<&str> = sample.split(':').collect();
                    let raw = parts.get(fi).copied().unwrap_or(".");
                    let (sample_bytes, n) = encode_scalar_list(primitive, raw)?;
                    n_per_sample = n_per_sample.max(n);
                    bytes.extend(sample_bytes);
                }
                fmt.push(OwnedField { key, primitive, n_per_sample: n_per_sample as u16, bytes });
            }
        }

        Ok(Some(ParsedRecord { rid, pos, qual, id, alleles, filters, info, fmt, genotypes }))
    }
}

fn parse_genotype(raw: &str) -> GtCall {
    if raw == "." || raw.is_empty() {
        return GtCall { alleles: vec![ALLELE_MISSING, ALLELE_MISSING], phase: false };
    }
    let phase = raw.contains('|');
    let tokens: Vec<&str> = raw.split(['/', '|']).collect();
    let alleles = tokens
        .iter()
        .map(|t| match *t {
            "." => ALLELE_MISSING,
            "" => ALLELE_END_OF_VECTOR,
            n => n.parse::<i32>().unwrap_or(ALLELE_MISSING),
        })
        .collect();
    GtCall { alleles, phase }
}

/// Encodes a scalar or comma-separated list under `primitive`'s on-wire
/// element width (spec section 6's `FieldView`), returning the bytes and
/// the element count.
fn encode_scalar_list(primitive: FieldPrimitive, raw: &str) -> Result<(Vec<u8>, usize)> {
    match primitive {
        FieldPrimitive::Flag => Ok((vec![1u8], 1)),
        FieldPrimitive::Integer => {
            let mut bytes = Vec::new();
            let mut n = 0;
            for tok in raw.split(',') {
                let v: i32 = if tok == "." || tok.is_empty() {
                    tachyon_core::primitive::MISSING
                } else {
                    tok.parse().map_err(|e: std::num::ParseIntError| err(e.to_string()))?
                };
                bytes.extend_from_slice(&v.to_le_bytes());
                n += 1;
            }
            Ok((bytes, n.max(1)))
        }
        FieldPrimitive::Float => {
            let mut bytes = Vec::new();
            let mut n = 0;
            for tok in raw.split(',') {
                let v: f32 = if tok == "." || tok.is_empty() { f32::NAN } else { tok.parse().map_err(|e: std::num::ParseFloatError| err(e.to_string()))? };
                bytes.extend_from_slice(&v.to_le_bytes());
                n += 1;
            }
            Ok((bytes, n.max(1)))
        }
        FieldPrimitive::Character | FieldPrimitive::String => {
            let bytes = raw.as_bytes().to_vec();
            let n = bytes.len().max(1);
            Ok((bytes, n))
        }
    }
}

fn decl_from_kv(kv: &std::collections::HashMap<String, String>) -> (String, FieldPrimitive, String) {
    let id = kv.get("ID").cloned().unwrap_or_default();
    let primitive = match kv.get("Type").map(String::as_str) {
        Some("Integer") => FieldPrimitive::Integer,
        Some("Float") => FieldPrimitive::Float,
        Some("Flag") => FieldPrimitive::Flag,
        Some("Character") => FieldPrimitive::Character,
        _ => FieldPrimitive::String,
    };
    let description = kv.get("Description").cloned().unwrap_or_default();
    (id, primitive, description)
}

/// Parses `KEY=value,KEY2="quoted, value",KEY3=...` as found inside VCF
/// meta-line angle brackets. Commas inside double quotes don't split.
fn parse_kv_list(body: &str) -> std::collections::HashMap<String, String> {
    let mut out = std::collections::HashMap::new();
    let mut chars = body.chars().peekable();
    loop {
        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' {
                chars.next();
                break;
            }
            key.push(c);
            chars.next();
        }
        if key.is_empty() {
            break;
        }
        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            for c in chars.by_ref() {
                if c == '"' {
                    break;
                }
                value.push(c);
            }
            // consume the trailing comma, if any
            if chars.peek() == Some(&',') {
                chars.next();
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c == ',' {
                    chars.next();
                    break;
                }
                value.push(c);
                chars.next();
            }
        }
        out.insert(key.trim().to_string(), value);
        if chars.peek().is_none() {
            break;
        }
    }
    out
}
