//! The container-level compression codecs (spec section 4.2): the
//! uncompressed passthrough and the Zstandard wrapper, including its
//! short-circuit rules. Preprocessors that run *before* a codec (varint,
//! delta, bit-transposition) live in `preprocess.rs`.

use md5::{Digest, Md5};
use tachyon_base::{err_kind, Kind, Result};

/// Below this ratio of uncompressed-to-compressed size, Zstandard's gain
/// isn't worth paying decompression cost for; duplicated across every
/// codec path in the original source, so the redesign keeps it as one
/// named constant (spec Open Question 3).
pub const MIN_COMPRESSION_FOLD: f64 = 1.05;

/// Below this many bytes Zstd's own frame overhead dominates, so the
/// container is stored uncompressed regardless of its fold ratio.
pub const MIN_COMPRESSION_INPUT_LEN: usize = 100;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Codec {
    None = 0,
    Zstd = 1,
    /// The legacy `ZPAQ` codec value (spec Open Question 1): kept in the
    /// enum for on-disk compatibility with files that declare it, but
    /// refused at read time rather than implemented.
    LegacyZpaq = 2,
}

impl Codec {
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Codec::None,
            1 => Codec::Zstd,
            2 => Codec::LegacyZpaq,
            _ => return None,
        })
    }
}

pub fn md5_digest(data: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Compresses `uncompressed` for a container, applying the short-circuit
/// rules from spec 4.2: uniform columns and small buffers are stored
/// verbatim, and a Zstd result that doesn't clear `MIN_COMPRESSION_FOLD` is
/// discarded in favor of the plain copy. Returns `(bytes, codec)`.
pub fn compress_with_fallback(uncompressed: &[u8], uniform: bool, level: i32) -> (Vec<u8>, Codec) {
    if uniform || uncompressed.len() < MIN_COMPRESSION_INPUT_LEN {
        return (uncompressed.to_vec(), Codec::None);
    }
    let compressed = match zstd::encode_all(uncompressed, level) {
        Ok(c) => c,
        Err(_) => return (uncompressed.to_vec(), Codec::None),
    };
    if compressed.is_empty() {
        return (uncompressed.to_vec(), Codec::None);
    }
    let fold = uncompressed.len() as f64 / compressed.len() as f64;
    if fold < MIN_COMPRESSION_FOLD {
        (uncompressed.to_vec(), Codec::None)
    } else {
        (compressed, Codec::Zstd)
    }
}

/// Inverse of `compress_with_fallback`. `uncompressed_len` is the expected
/// output length, used only to pre-size the output buffer; it is not
/// trusted for correctness beyond that (Zstd validates its own frame).
pub fn decompress(compressed: &[u8], codec: Codec, uncompressed_len: usize) -> Result<Vec<u8>> {
    match codec {
        Codec::None => Ok(compressed.to_vec()),
        Codec::Zstd => {
            let mut out = Vec::with_capacity(uncompressed_len);
            zstd::stream::copy_decode(compressed, &mut out)
                .map_err(|e| err_kind(Kind::UnsupportedCodec, format!("zstd decode failed: {e}")))?;
            Ok(out)
        }
        Codec::LegacyZpaq => Err(err_kind(
            Kind::UnsupportedCodec,
            "ZPAQ is no longer supported!",
        )),
    }
}
