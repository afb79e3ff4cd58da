//! The typed column container (spec 3, 4.1): a self-describing column with
//! a header (primitive type, stride, compression, encryption, uniformity)
//! plus an optional parallel stride sub-stream.

use crate::codec::{self, Codec};
use crate::ioutil::{Reader, Writer};
use crate::keychain::{self, Keychain, KeychainEntry, RandomSource};
use crate::preprocess;
use crate::primitive::{
    round_up_width, signed_sentinels_for_width, smallest_unsigned_width, PrimitiveType,
    END_OF_VECTOR, MISSING,
};
use tachyon_base::{err, err_kind, Kind, Result};

/// Preprocessor bits (spec's container-header `preprocessor` bit set).
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct Preprocessor(pub u16);

impl Preprocessor {
    pub const BIT_PERMUTED: u16 = 1 << 0;
    pub const VARINT: u16 = 1 << 1;
    pub const DELTA: u16 = 1 << 2;
    pub const ZIGZAG: u16 = 1 << 3;

    pub fn has(self, bit: u16) -> bool {
        self.0 & bit != 0
    }
    pub fn set(&mut self, bit: u16) {
        self.0 |= bit;
    }
    pub fn clear(&mut self, bit: u16) {
        self.0 &= !bit;
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Encryption {
    None,
    Aes256Gcm,
}

impl Encryption {
    fn code(self) -> u8 {
        match self {
            Encryption::None => 0,
            Encryption::Aes256Gcm => 1,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Encryption::None),
            1 => Some(Encryption::Aes256Gcm),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ContainerState {
    Empty,
    UncompressedOnly,
    Compressed,
    Encrypted,
}

#[derive(Clone, Debug)]
pub struct ContainerHeader {
    pub primitive_type: PrimitiveType,
    pub signedness: bool,
    /// `-1` means mixed stride; otherwise the constant per-entry element count.
    pub stride: i32,
    pub uniform: bool,
    pub mixed_stride: bool,
    pub codec: Codec,
    pub encryption: Encryption,
    pub preprocessor: Preprocessor,
    pub offset: u32,
    pub compressed_len: u32,
    pub uncompressed_len: u32,
    pub encrypted_len: u32,
    pub crc_or_md5: [u8; 16],
    /// `-1` for invariant (base) columns; otherwise the file-global
    /// dictionary index of the INFO/FORMAT/FILTER field this column holds.
    pub global_key: i32,
    /// Present iff `mixed_stride`: a parallel header of identical shape
    /// describing the per-entry length sub-stream.
    pub stride_header: Option<Box<ContainerHeader>>,
    /// The keychain `field_id` this container is encrypted under (spec
    /// 4.5's "identifier" slot). `0` when `encryption == None`.
    pub identifier: u64,
}

impl ContainerHeader {
    pub fn new(global_key: i32) -> Self {
        ContainerHeader {
            primitive_type: PrimitiveType::Int32,
            signedness: true,
            stride: 0,
            uniform: false,
            mixed_stride: false,
            codec: Codec::None,
            encryption: Encryption::None,
            preprocessor: Preprocessor::default(),
            offset: 0,
            compressed_len: 0,
            uncompressed_len: 0,
            encrypted_len: 0,
            crc_or_md5: [0u8; 16],
            global_key,
            stride_header: None,
            identifier: 0,
        }
    }

    /// Packs the LSB-first controller bit layout from spec section 6:
    /// `signedness(1) mixed_stride(1) type(6) codec(5) uniform(1)
    /// encryption(2) preprocessor(16)`.
    fn controller_bits(&self) -> u32 {
        let signedness = self.signedness as u32;
        let mixed_stride = (self.mixed_stride as u32) << 1;
        let ty = ((self.primitive_type as u32) & 0x3f) << 2;
        let codec = ((self.codec as u32) & 0x1f) << 8;
        let uniform = (self.uniform as u32) << 13;
        let encryption = (self.encryption.code() as u32 & 0x3) << 14;
        let preprocessor = (self.preprocessor.0 as u32) << 16;
        signedness | mixed_stride | ty | codec | uniform | encryption | preprocessor
    }

    fn from_controller_bits(bits: u32) -> Result<(bool, bool, PrimitiveType, Codec, bool, Encryption, Preprocessor)> {
        let signedness = bits & 1 != 0;
        let mixed_stride = bits & (1 << 1) != 0;
        let ty_code = ((bits >> 2) & 0x3f) as u8;
        let codec_code = ((bits >> 8) & 0x1f) as u8;
        let uniform = bits & (1 << 13) != 0;
        let enc_code = ((bits >> 14) & 0x3) as u8;
        let preprocessor = Preprocessor(((bits >> 16) & 0xffff) as u16);

        let ty = PrimitiveType::from_code(ty_code)
            .ok_or_else(|| err_kind(Kind::InvalidFormat, "unknown primitive type code"))?;
        let codec = Codec::from_code(codec_code)
            .ok_or_else(|| err_kind(Kind::UnsupportedCodec, "unknown codec code"))?;
        let encryption = Encryption::from_code(enc_code)
            .ok_or_else(|| err_kind(Kind::InvalidFormat, "unknown encryption code"))?;
        Ok((signedness, mixed_stride, ty, codec, uniform, encryption, preprocessor))
    }

    /// Writes the wire form from spec section 6's "Container wire form":
    /// `controller(u32) stride(i32) offset(u32) compressed_len(u32)
    /// uncompressed_len(u32) encrypted_len(u32) md5(16) global_key(i32)`,
    /// followed by a stride sub-header iff `mixed_stride`.
    pub fn write(&self, wr: &mut impl Writer) -> Result<()> {
        wr.push_context("header");
        wr.write_annotated_le_num("controller", self.controller_bits())?;
        wr.write_annotated_le_num("stride", self.stride)?;
        wr.write_annotated_le_num("offset", self.offset)?;
        wr.write_annotated_le_num("compressed_len", self.compressed_len)?;
        wr.write_annotated_le_num("uncompressed_len", self.uncompressed_len)?;
        wr.write_annotated_le_num("encrypted_len", self.encrypted_len)?;
        wr.write_annotated_byte_slice("md5", &self.crc_or_md5)?;
        wr.write_annotated_le_num("global_key", self.global_key)?;
        wr.write_annotated_le_num("identifier", self.identifier)?;
        wr.pop_context();
        if self.mixed_stride {
            match &self.stride_header {
                Some(sh) => sh.write(wr)?,
                None => return Err(err("mixed_stride set but stride_header missing")),
            }
        }
        Ok(())
    }

    pub fn read(rd: &mut impl Reader) -> Result<Self> {
        let controller: u32 = rd.read_le_num()?;
        let (signedness, mixed_stride, primitive_type, codec, uniform, encryption, preprocessor) =
            Self::from_controller_bits(controller)?;
        let stride: i32 = rd.read_le_num()?;
        let offset: u32 = rd.read_le_num()?;
        let compressed_len: u32 = rd.read_le_num()?;
        let uncompressed_len: u32 = rd.read_le_num()?;
        let encrypted_len: u32 = rd.read_le_num()?;
        let crc_or_md5: [u8; 16] = rd.read_byte_vec(16)?.try_into().unwrap();
        let global_key: i32 = rd.read_le_num()?;
        let identifier: u64 = rd.read_le_num()?;
        if global_key < -1 {
            return Err(err_kind(Kind::InvalidFormat, "global_key must be >= -1"));
        }
        let stride_header = if mixed_stride {
            Some(Box::new(ContainerHeader::read(rd)?))
        } else {
            None
        };
        Ok(ContainerHeader {
            primitive_type,
            signedness,
            stride,
            uniform,
            mixed_stride,
            codec,
            encryption,
            preprocessor,
            offset,
            compressed_len,
            uncompressed_len,
            encrypted_len,
            crc_or_md5,
            global_key,
            stride_header,
            identifier,
        })
    }
}

/// A logical value pushed into a container; integers are widened to `i64`
/// internally per spec 4.1 so reformatting can shrink them back down.
pub enum Value {
    Bool(bool),
    Char(u8),
    Int(i64),
    Float32(f32),
    Float64(f64),
    Bytes(Vec<u8>),
}

pub struct DataContainer {
    pub header: ContainerHeader,
    state: ContainerState,
    type_fixed: bool,
    logical_ints: Vec<i64>,
    raw_bytes: Vec<u8>,
    strides: Vec<u32>,
    stride_fixed: bool,
    pub n_entries: usize,
    pub n_additions: usize,
    pub data_uncompressed: Vec<u8>,
    pub data_compressed: Vec<u8>,
    pub stride_uncompressed: Vec<u8>,
    pub stride_compressed: Vec<u8>,
    /// GCM ciphertext+tag, populated only while `state == Encrypted`.
    encrypted_bytes: Vec<u8>,
}

impl DataContainer {
    pub fn new(global_key: i32) -> Self {
        DataContainer {
            header: ContainerHeader::new(global_key),
            state: ContainerState::Empty,
            type_fixed: false,
            logical_ints: Vec::new(),
            raw_bytes: Vec::new(),
            strides: Vec::new(),
            stride_fixed: false,
            n_entries: 0,
            n_additions: 0,
            data_uncompressed: Vec::new(),
            data_compressed: Vec::new(),
            stride_uncompressed: Vec::new(),
            stride_compressed: Vec::new(),
            encrypted_bytes: Vec::new(),
        }
    }

    fn set_or_check_type(&mut self, ty: PrimitiveType, signed: bool) {
        if !self.type_fixed {
            self.header.primitive_type = ty;
            self.header.signedness = signed;
            self.type_fixed = true;
        } else {
            assert_eq!(
                self.header.primitive_type, ty,
                "container push type mismatch: ingest layer dispatched the wrong field type"
            );
        }
    }

    /// `push(value)`: sets the container's type on first call, checks it on
    /// every subsequent call (a mismatch is a caller bug, not a recoverable
    /// error, per spec 4.1).
    pub fn push(&mut self, value: Value) {
        self.n_additions += 1;
        match value {
            Value::Bool(b) => {
                self.set_or_check_type(PrimitiveType::Bool, false);
                self.raw_bytes.push(b as u8);
            }
            Value::Char(c) => {
                self.set_or_check_type(PrimitiveType::Char, false);
                self.raw_bytes.push(c);
            }
            Value::Int(v) => {
                self.set_or_check_type(PrimitiveType::Int32, true);
                self.logical_ints.push(v);
            }
            Value::Float32(f) => {
                self.set_or_check_type(PrimitiveType::Float32, true);
                self.raw_bytes.extend_from_slice(&f.to_le_bytes());
            }
            Value::Float64(f) => {
                self.set_or_check_type(PrimitiveType::Float64, true);
                self.raw_bytes.extend_from_slice(&f.to_le_bytes());
            }
            Value::Bytes(b) => {
                self.set_or_check_type(PrimitiveType::Char, false);
                self.raw_bytes.extend_from_slice(&b);
            }
        }
        self.n_entries += 1;
    }

    /// `push_stride(s)`: fixes the constant stride on first call; a later
    /// differing value flips the container into mixed-stride mode.
    pub fn push_stride(&mut self, s: u32) {
        if !self.stride_fixed {
            self.header.stride = s as i32;
            self.stride_fixed = true;
        } else if !self.header.mixed_stride && s as i32 != self.header.stride {
            self.header.mixed_stride = true;
            self.header.stride = -1;
        }
        self.strides.push(s);
    }

    /// `push_literal`: bypasses the type check entirely, for bytes a codec
    /// has already re-typed (e.g. pre-packed genotype run entries).
    pub fn push_literal(&mut self, bytes: &[u8]) {
        self.type_fixed = true;
        self.raw_bytes.extend_from_slice(bytes);
        self.n_entries += 1;
        self.n_additions += 1;
    }

    /// `update()`: uniformity detection, integer reformat, stride reformat,
    /// MD5, then sets `uncompressed_len`. Must run before `compress`.
    pub fn update(&mut self) -> Result<()> {
        if self.header.primitive_type.is_integer() && !self.raw_bytes.is_empty() {
            return Err(err_kind(
                Kind::Encoder,
                "container mixes logical ints and raw bytes",
            ));
        }

        let mut finalized = if self.header.primitive_type.is_integer() {
            self.finalize_integer_column()
        } else {
            std::mem::take(&mut self.raw_bytes)
        };

        if !self.header.mixed_stride
            && self.header.stride > 0
            && self.header.primitive_type != PrimitiveType::Struct
        {
            let window = self.header.stride as usize * self.header.primitive_type.byte_width();
            if window > 0 && is_uniform(&finalized, window) {
                self.header.uniform = true;
                finalized.truncate(window);
                self.header.codec = Codec::None;
            }
        }

        if self.header.mixed_stride {
            self.finalize_stride_column();
        }

        self.header.crc_or_md5 = codec::md5_digest(&finalized);
        self.header.uncompressed_len = finalized.len() as u32;
        self.data_uncompressed = finalized;
        self.state = ContainerState::UncompressedOnly;
        Ok(())
    }

    /// Integer reformat (spec 4.1): signed-32-widened values shrunk to the
    /// smallest width that holds them, remapping `MISSING`/`END_OF_VECTOR`
    /// to the destination width's top two sentinel values.
    fn finalize_integer_column(&mut self) -> Vec<u8> {
        let vals = std::mem::take(&mut self.logical_ints);
        let has_sentinel = vals
            .iter()
            .any(|&v| v == MISSING as i64 || v == END_OF_VECTOR as i64);
        let real_vals = vals
            .iter()
            .copied()
            .filter(|&v| v != MISSING as i64 && v != END_OF_VECTOR as i64);
        let min = real_vals.clone().min().unwrap_or(0);
        let max = real_vals.max().unwrap_or(0);

        let (signed, width) = if min >= 0 && !has_sentinel {
            (false, round_up_width(smallest_unsigned_width(max as u64)))
        } else {
            // Width must hold `min`/`max` with the two most-negative codes
            // of that width held back for the sentinels.
            let mut chosen = 8usize;
            for w in [1usize, 2, 4, 8] {
                let max_representable_real = (1i64 << (8 * w - 1)) - 1;
                let min_representable = -(1i64 << (8 * w - 1)) + 2;
                if min >= min_representable && max <= max_representable_real {
                    chosen = w;
                    break;
                }
            }
            (true, round_up_width(chosen))
        };

        self.header.signedness = signed;
        self.header.primitive_type = PrimitiveType::int_of_width(width);

        let (sent_missing, sent_eov) = signed_sentinels_for_width(width);
        let mut out = Vec::with_capacity(vals.len() * width);
        for v in vals {
            let remapped = if v == MISSING as i64 {
                sent_missing
            } else if v == END_OF_VECTOR as i64 {
                sent_eov
            } else {
                v
            };
            push_int_width(&mut out, remapped, width, signed);
        }
        out
    }

    /// Stride reformat: identical shape to integer reformat, but always
    /// unsigned (strides are non-negative by construction).
    fn finalize_stride_column(&mut self) {
        let strides = std::mem::take(&mut self.strides);
        let max = strides.iter().copied().max().unwrap_or(0) as u64;
        let width = round_up_width(smallest_unsigned_width(max));
        let mut out = Vec::with_capacity(strides.len() * width);
        for s in strides {
            push_int_width(&mut out, s as i64, width, false);
        }
        let mut stride_header = ContainerHeader::new(self.header.global_key);
        stride_header.primitive_type = PrimitiveType::int_of_width(width);
        stride_header.signedness = false;
        stride_header.stride = 1;
        stride_header.crc_or_md5 = codec::md5_digest(&out);
        stride_header.uncompressed_len = out.len() as u32;
        self.stride_uncompressed = out;
        self.header.stride_header = Some(Box::new(stride_header));
    }

    /// Runs requested preprocessors (with the fold-ratio guard), then the
    /// Zstandard codec, over the finalized uncompressed buffer(s).
    pub fn compress(&mut self, level: i32) -> Result<()> {
        if self.state != ContainerState::UncompressedOnly {
            return Err(err_kind(
                Kind::Encoder,
                "compress() called before update() or more than once",
            ));
        }

        let plain_len = self.data_uncompressed.len();
        let mut candidate = self.data_uncompressed.clone();

        // Uniform columns already collapsed to a single verbatim window
        // (spec 4.1); delta/varint only make sense over a real multi-entry
        // stream, and pre-processing the lone window would leave the
        // decoder unable to tell a preprocessed uniform window from a raw
        // one (the wire form carries no extra bit for that).
        if self.header.uniform {
            self.header.compressed_len = self.data_uncompressed.len() as u32;
            self.data_compressed = self.data_uncompressed.clone();
            self.state = ContainerState::Compressed;
            return Ok(());
        }

        if self.header.preprocessor.has(Preprocessor::DELTA) && self.header.primitive_type.is_integer()
        {
            let ints = reread_ints(&self.data_uncompressed, &self.header);
            let deltas = preprocess::delta_encode_i64(&ints);
            let re_encoded = preprocess::encode_varint_zigzag_i64(&deltas);
            match preprocess::apply_with_fold_guard(&re_encoded, plain_len) {
                preprocess::PreprocessOutcome::Applied(bytes) => {
                    candidate = bytes;
                    self.header.preprocessor.set(Preprocessor::ZIGZAG);
                }
                preprocess::PreprocessOutcome::Abandoned => {
                    self.header.preprocessor.clear(Preprocessor::DELTA);
                }
            }
        } else if self.header.preprocessor.has(Preprocessor::VARINT)
            && self.header.primitive_type.is_integer()
        {
            let ints = reread_ints(&self.data_uncompressed, &self.header);
            let re_encoded = preprocess::encode_varint_zigzag_i64(&ints);
            match preprocess::apply_with_fold_guard(&re_encoded, plain_len) {
                preprocess::PreprocessOutcome::Applied(bytes) => {
                    candidate = bytes;
                    self.header.preprocessor.set(Preprocessor::ZIGZAG);
                }
                preprocess::PreprocessOutcome::Abandoned => {
                    self.header.preprocessor.clear(Preprocessor::VARINT);
                }
            }
        }

        let (bytes, codec) =
            codec::compress_with_fallback(&candidate, self.header.uniform, level);
        self.header.codec = codec;
        self.header.compressed_len = bytes.len() as u32;
        self.data_compressed = bytes;

        if let Some(stride_header) = &mut self.header.stride_header {
            let (sbytes, scodec) =
                codec::compress_with_fallback(&self.stride_uncompressed, false, level);
            stride_header.codec = scodec;
            stride_header.compressed_len = sbytes.len() as u32;
            self.stride_compressed = sbytes;
        }

        self.state = ContainerState::Compressed;
        Ok(())
    }

    pub fn decompress(&mut self) -> Result<()> {
        if self.header.encryption != Encryption::None {
            return Err(err_kind(
                Kind::IntegrityFailure,
                "container is still encrypted; decrypt before decompress",
            ));
        }
        let bytes = codec::decompress(
            &self.data_compressed,
            self.header.codec,
            self.header.uncompressed_len as usize,
        )?;
        let bytes = self.reverse_preprocessor(bytes)?;
        let digest = codec::md5_digest(&bytes);
        if digest != self.header.crc_or_md5 {
            return Err(err_kind(Kind::IntegrityFailure, "container MD5 mismatch"));
        }
        self.data_uncompressed = bytes;
        if let Some(stride_header) = &self.header.stride_header {
            let sbytes = codec::decompress(
                &self.stride_compressed,
                stride_header.codec,
                stride_header.uncompressed_len as usize,
            )?;
            self.stride_uncompressed = sbytes;
        }
        self.state = ContainerState::UncompressedOnly;
        Ok(())
    }

    /// Inverse of the varint/zigzag and delta preprocessors `compress()`
    /// may have applied (spec 4.1): re-expands the variable-width zigzag
    /// stream back to `header.uncompressed_len / width` fixed-width
    /// entries, delta-decoding first if `DELTA` is also set. A no-op
    /// unless `ZIGZAG` is set, since `compress()` only ever sets it
    /// alongside an applied `DELTA` or `VARINT` preprocessor.
    fn reverse_preprocessor(&self, raw: Vec<u8>) -> Result<Vec<u8>> {
        if !self.header.preprocessor.has(Preprocessor::ZIGZAG) {
            return Ok(raw);
        }
        let width = self.header.primitive_type.byte_width().max(1);
        let n = self.header.uncompressed_len as usize / width;
        let mut ints = preprocess::decode_varint_zigzag_i64(&raw, n)
            .ok_or_else(|| err_kind(Kind::InvalidFormat, "truncated varint/zigzag stream"))?;
        if self.header.preprocessor.has(Preprocessor::DELTA) {
            ints = preprocess::delta_decode_i64(&ints);
        }
        let mut out = Vec::with_capacity(n * width);
        for v in ints {
            push_int_width(&mut out, v, width, self.header.signedness);
        }
        Ok(out)
    }

    pub fn state(&self) -> ContainerState {
        self.state
    }

    /// Encrypts a compressed container under a fresh keychain entry (spec
    /// 4.5): the plaintext is the real header followed by its data and
    /// (if present) stride sub-streams, encrypted as a single GCM message.
    /// The in-memory header is then replaced by the zeroed on-disk form;
    /// `global_key` is kept (not zeroed) so a reader can still decide
    /// whether to bother decrypting a given INFO/FORMAT column without a
    /// keychain, preserving the lazy per-column read path.
    pub fn encrypt(&mut self, keychain: &Keychain, rng: &dyn RandomSource) -> Result<()> {
        if self.state != ContainerState::Compressed {
            return Err(err_kind(
                Kind::Encoder,
                "encrypt() requires a compressed container",
            ));
        }
        let entry = keychain.insert_new(rng);
        let mut plain = crate::ioutil::MemWriter::new();
        self.header.write(&mut plain)?;
        plain.write_annotated_byte_slice("data", &self.data_compressed)?;
        if self.header.mixed_stride {
            plain.write_annotated_byte_slice("stride", &self.stride_compressed)?;
        }
        let plaintext = plain.into_bytes();
        let ciphertext = keychain::encrypt(&entry, &plaintext)?;

        self.header = ContainerHeader::new(self.header.global_key);
        self.header.encryption = Encryption::Aes256Gcm;
        self.header.identifier = entry.field_id;
        self.header.encrypted_len = ciphertext.len() as u32;
        self.encrypted_bytes = ciphertext;
        self.state = ContainerState::Encrypted;
        Ok(())
    }

    /// Inverse of `encrypt`: looks `header.identifier` up in `keychain`,
    /// verifies the GCM tag, and restores the real header/data/stride so
    /// `decompress()` can run as usual.
    pub fn decrypt(&mut self, keychain: &Keychain) -> Result<()> {
        if self.state != ContainerState::Encrypted {
            return Err(err_kind(
                Kind::Encoder,
                "decrypt() requires an encrypted container",
            ));
        }
        let entry = keychain.get(self.header.identifier)?;
        let plaintext = keychain::decrypt(&entry, &self.encrypted_bytes)?;
        let mut mr = crate::ioutil::MemReader::from(plaintext);
        let real_header = ContainerHeader::read(&mut mr)?;
        let data_compressed = mr.read_byte_vec(real_header.compressed_len as usize)?;
        let stride_compressed = if let Some(sh) = &real_header.stride_header {
            mr.read_byte_vec(sh.compressed_len as usize)?
        } else {
            Vec::new()
        };
        self.header = real_header;
        self.data_compressed = data_compressed;
        self.stride_compressed = stride_compressed;
        self.encrypted_bytes.clear();
        self.state = ContainerState::Compressed;
        Ok(())
    }

    /// Serializes the full on-disk container (header + body), matching
    /// spec section 6's "Container wire form".
    pub fn write_to(&self, wr: &mut impl Writer) -> Result<()> {
        self.header.write(wr)?;
        if self.header.encryption != Encryption::None {
            wr.write_annotated_byte_slice("ciphertext", &self.encrypted_bytes)?;
        } else {
            wr.write_annotated_byte_slice("data", &self.data_compressed)?;
            if self.header.mixed_stride {
                wr.write_annotated_byte_slice("stride", &self.stride_compressed)?;
            }
        }
        Ok(())
    }

    pub fn read_from(rd: &mut impl Reader) -> Result<Self> {
        let header = ContainerHeader::read(rd)?;
        let mut c = DataContainer::new(header.global_key);
        if header.encryption != Encryption::None {
            c.encrypted_bytes = rd.read_byte_vec(header.encrypted_len as usize)?;
            c.header = header;
            c.state = ContainerState::Encrypted;
        } else {
            c.data_compressed = rd.read_byte_vec(header.compressed_len as usize)?;
            c.stride_compressed = if let Some(sh) = &header.stride_header {
                rd.read_byte_vec(sh.compressed_len as usize)?
            } else {
                Vec::new()
            };
            c.header = header;
            c.state = ContainerState::Compressed;
        }
        Ok(c)
    }
}

impl DataContainer {
    /// Decodes the uncompressed integer buffer back to logical `i64`
    /// values (inverse of `finalize_integer_column`). A uniform column's
    /// header carries no entry count (only the one stored window), so
    /// callers who know the column's true length from surrounding context
    /// (record/sample counts) pass it as `expected_entries`.
    pub fn decoded_ints(&self, expected_entries: usize) -> Vec<i64> {
        let window = reread_ints(&self.data_uncompressed, &self.header);
        if self.header.uniform && !window.is_empty() {
            window.into_iter().cycle().take(expected_entries).collect()
        } else {
            window
        }
    }

    /// Decodes the uncompressed buffer as raw bytes, repeating a uniform
    /// column's single window up to `expected_len` bytes.
    pub fn decoded_bytes(&self, expected_len: usize) -> Vec<u8> {
        if self.header.uniform && !self.data_uncompressed.is_empty() {
            self.data_uncompressed.iter().copied().cycle().take(expected_len).collect()
        } else {
            self.data_uncompressed.clone()
        }
    }

    /// Decodes the parallel stride sub-stream, if this container is
    /// mixed-stride.
    pub fn decoded_strides(&self) -> Option<Vec<u32>> {
        let sh = self.header.stride_header.as_ref()?;
        let vals = reread_ints(&self.stride_uncompressed, sh);
        Some(vals.into_iter().map(|v| v as u32).collect())
    }
}

fn reread_ints(bytes: &[u8], header: &ContainerHeader) -> Vec<i64> {
    let width = header.primitive_type.byte_width();
    bytes
        .chunks(width)
        .map(|chunk| read_int_width(chunk, header.signedness))
        .collect()
}

fn read_int_width(bytes: &[u8], signed: bool) -> i64 {
    match bytes.len() {
        1 => {
            if signed {
                bytes[0] as i8 as i64
            } else {
                bytes[0] as i64
            }
        }
        2 => {
            let v = u16::from_le_bytes([bytes[0], bytes[1]]);
            if signed {
                v as i16 as i64
            } else {
                v as i64
            }
        }
        4 => {
            let v = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            if signed {
                v as i32 as i64
            } else {
                v as i64
            }
        }
        8 => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(bytes);
            let v = u64::from_le_bytes(buf);
            if signed {
                v as i64
            } else {
                v as i64
            }
        }
        _ => 0,
    }
}

fn push_int_width(out: &mut Vec<u8>, v: i64, width: usize, signed: bool) {
    match width {
        1 => out.push(if signed { v as i8 as u8 } else { v as u8 }),
        2 => out.extend_from_slice(&(if signed { v as i16 as u16 } else { v as u16 }).to_le_bytes()),
        4 => out.extend_from_slice(&(if signed { v as i32 as u32 } else { v as u32 }).to_le_bytes()),
        _ => out.extend_from_slice(&(v as u64).to_le_bytes()),
    }
}

fn is_uniform(bytes: &[u8], window: usize) -> bool {
    if bytes.is_empty() || bytes.len() % window != 0 {
        return false;
    }
    let first = &bytes[..window];
    bytes.chunks(window).all(|chunk| chunk == first)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_column_truncates_to_one_window() {
        let mut c = DataContainer::new(-1);
        for _ in 0..1000 {
            c.push(Value::Int(30));
            c.push_stride(1);
        }
        c.update().unwrap();
        assert!(c.header.uniform);
        assert_eq!(c.header.codec, Codec::None);
        assert_eq!(c.data_uncompressed.len(), c.header.primitive_type.byte_width());
    }

    #[test]
    fn test_integer_reformat_shrinks_width() {
        let mut c = DataContainer::new(-1);
        for v in 0..50i64 {
            c.push(Value::Int(v));
            c.push_stride(1);
        }
        c.update().unwrap();
        assert_eq!(c.header.primitive_type, PrimitiveType::Int8);
        assert!(!c.header.signedness);
    }

    #[test]
    fn test_sentinel_remap_survives_reformat() {
        let mut c = DataContainer::new(-1);
        c.push(Value::Int(MISSING as i64));
        c.push(Value::Int(END_OF_VECTOR as i64));
        c.push(Value::Int(5));
        c.push_stride(1);
        c.push_stride(1);
        c.push_stride(1);
        c.update().unwrap();
        assert_eq!(c.header.primitive_type, PrimitiveType::Int8);
        let vals = reread_ints(&c.data_uncompressed, &c.header);
        let (sm, se) = signed_sentinels_for_width(1);
        assert_eq!(vals, vec![sm, se, 5]);
    }

    #[test]
    fn test_write_read_roundtrip() {
        use crate::ioutil::MemWriter;
        let mut c = DataContainer::new(3);
        for v in 0..2000i64 {
            c.push(Value::Int(v % 11));
            c.push_stride(1);
        }
        c.update().unwrap();
        c.compress(6).unwrap();
        let mut mw = MemWriter::new();
        c.write_to(&mut mw).unwrap();
        let mut mr = mw.try_into_reader().unwrap();
        let mut back = DataContainer::read_from(&mut mr).unwrap();
        assert_eq!(back.header.global_key, 3);
        assert_eq!(back.header.compressed_len, c.header.compressed_len);
        back.decompress().unwrap();
        c.decompress().unwrap();
        assert_eq!(back.data_uncompressed, c.data_uncompressed);
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        use crate::keychain::{DeterministicTestSource, Keychain};
        let mut c = DataContainer::new(-1);
        for v in 0..3000i64 {
            c.push(Value::Int(v % 5));
            c.push_stride(1);
        }
        c.update().unwrap();
        c.compress(6).unwrap();
        let plaintext_data = c.data_uncompressed.clone();
        let kc = Keychain::new();
        let rng = DeterministicTestSource::new(99);
        c.encrypt(&kc, &rng).unwrap();
        assert_eq!(c.header.encryption, Encryption::Aes256Gcm);
        assert_eq!(c.header.global_key, -1); // global_key survives zeroing
        c.decrypt(&kc).unwrap();
        assert_eq!(c.header.encryption, Encryption::None);
        c.decompress().unwrap();
        assert_eq!(c.data_uncompressed, plaintext_data);
    }

    #[test]
    fn test_decrypt_without_keychain_entry_is_keychain_miss() {
        use crate::keychain::{DeterministicTestSource, Keychain};
        let mut c = DataContainer::new(-1);
        for v in 0..200i64 {
            c.push(Value::Int(v));
            c.push_stride(1);
        }
        c.update().unwrap();
        c.compress(6).unwrap();
        let kc = Keychain::new();
        let rng = DeterministicTestSource::new(1);
        c.encrypt(&kc, &rng).unwrap();
        let empty_keychain = Keychain::new();
        let err = c.decrypt(&empty_keychain).unwrap_err();
        assert_eq!(err.kind(), Kind::KeychainMiss);
    }

    #[test]
    fn test_compress_roundtrip() {
        let mut c = DataContainer::new(-1);
        for v in 0..5000i64 {
            c.push(Value::Int(v % 7));
            c.push_stride(1);
        }
        c.update().unwrap();
        c.compress(6).unwrap();
        let compressed_len = c.header.compressed_len;
        let uncompressed = c.data_uncompressed.clone();
        c.data_uncompressed.clear();
        c.decompress().unwrap();
        assert_eq!(c.data_uncompressed, uncompressed);
        assert!(compressed_len > 0);
    }

    #[test]
    fn test_delta_preprocessor_roundtrip_on_monotone_column() {
        let mut c = DataContainer::new(-1);
        for v in 0..4000i64 {
            c.push(Value::Int(100_000 + v * 3));
            c.push_stride(1);
        }
        c.update().unwrap();
        c.header.preprocessor.set(Preprocessor::DELTA);
        let original = c.data_uncompressed.clone();
        c.compress(6).unwrap();
        assert!(c.header.preprocessor.has(Preprocessor::ZIGZAG));
        c.decompress().unwrap();
        assert_eq!(c.data_uncompressed, original);
    }

    #[test]
    fn test_delta_preprocessor_abandoned_on_non_monotone_column_still_decodes() {
        let mut c = DataContainer::new(-1);
        for v in 0..200i64 {
            c.push(Value::Int(if v % 2 == 0 { 1 } else { -1 }));
            c.push_stride(1);
        }
        c.update().unwrap();
        c.header.preprocessor.set(Preprocessor::DELTA);
        let original = c.data_uncompressed.clone();
        c.compress(6).unwrap();
        c.decompress().unwrap();
        assert_eq!(c.data_uncompressed, original);
    }
}
