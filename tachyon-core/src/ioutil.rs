use crate::annotations::Annotations;
use std::{
    fs::File,
    io::{BufReader, BufWriter, Cursor, Read, Result, Seek, SeekFrom, Write},
    path::PathBuf,
    sync::Arc,
};

pub trait Reader: Read + Seek + Send + Sized {
    fn try_clone_independent(&self) -> Result<Self>;

    fn pos(&mut self) -> Result<i64> {
        Ok(self.stream_position()? as i64)
    }

    fn rewind_to(&mut self, pos: i64) -> Result<()> {
        self.seek(SeekFrom::Start(pos as u64))?;
        Ok(())
    }

    fn read_byte_vec(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn read_le_num<N: LeNum>(&mut self) -> Result<N> {
        let mut buf = vec![0u8; N::SIZE];
        self.read_exact(&mut buf)?;
        Ok(N::from_le_bytes_slice(&buf))
    }

    fn read_le_num_vec<N: LeNum>(&mut self, n: usize) -> Result<Vec<N>> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.read_le_num()?);
        }
        Ok(out)
    }

    /// Seeks to `end_pos - 4`, reads a u32 footer length written there by
    /// `write_len_of_footer_starting_at`, then rewinds the reader to the
    /// start of that footer (`end_pos - 4 - len`) and returns that position.
    fn read_footer_len_ending_at_pos_and_rewind_to_start(&mut self, end_pos: i64) -> Result<i64> {
        self.rewind_to(end_pos - 4)?;
        let len: u32 = self.read_le_num()?;
        let start = end_pos - 4 - (len as i64);
        self.rewind_to(start)?;
        Ok(start)
    }
}

pub trait Writer: Write + Seek + Send + Sized {
    type PairedReader: Reader;
    fn try_into_reader(self) -> Result<Self::PairedReader>;

    fn annotations(&mut self) -> &mut Annotations;

    fn pos(&mut self) -> Result<i64> {
        Ok(self.stream_position()? as i64)
    }

    fn push_context<T: ToString>(&mut self, context: T) {
        self.annotations().push_context(context);
    }

    fn pop_context(&mut self) {
        self.annotations().pop_context();
    }

    fn write_annotated_byte_slice(&mut self, name: &str, data: &[u8]) -> Result<()> {
        let start = self.pos()?;
        self.write_all(data)?;
        let end = self.pos()?;
        self.annotations().annotate(start..end, name);
        Ok(())
    }

    fn write_annotated_le_num<N: LeNum>(&mut self, name: &str, v: N) -> Result<()> {
        let bytes = v.to_le_bytes_vec();
        self.write_annotated_byte_slice(name, &bytes)
    }

    fn write_annotated_le_num_slice<N: LeNum>(&mut self, name: &str, vals: &[N]) -> Result<()> {
        let start = self.pos()?;
        for v in vals {
            self.write_all(&v.to_le_bytes_vec())?;
        }
        let end = self.pos()?;
        self.annotations().annotate(start..end, name);
        Ok(())
    }

    /// Writes `(self.pos() - start) as u32` at the current position; the
    /// paired reader recovers `start` from the end position with
    /// `read_footer_len_ending_at_pos_and_rewind_to_start`.
    fn write_len_of_footer_starting_at(&mut self, start: i64) -> Result<()> {
        let end = self.pos()?;
        let len = (end - start) as u32;
        self.write_annotated_le_num("footer_len", len)
    }
}

/// Numeric types that can be written/read in little-endian form by the
/// annotated IO helpers above.
pub trait LeNum: Copy + Default {
    const SIZE: usize;
    fn to_le_bytes_vec(self) -> Vec<u8>;
    fn from_le_bytes_slice(b: &[u8]) -> Self;
}

macro_rules! impl_le_num {
    ($($t:ty),* $(,)?) => {
        $(
            impl LeNum for $t {
                const SIZE: usize = std::mem::size_of::<$t>();
                fn to_le_bytes_vec(self) -> Vec<u8> {
                    self.to_le_bytes().to_vec()
                }
                fn from_le_bytes_slice(b: &[u8]) -> Self {
                    let mut buf = [0u8; std::mem::size_of::<$t>()];
                    buf.copy_from_slice(&b[..std::mem::size_of::<$t>()]);
                    <$t>::from_le_bytes(buf)
                }
            }
        )*
    };
}

impl_le_num!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

/// A range over a byte buffer, used by `Annotations` for debug rendering.
/// `Range<i64>` lacks `.len()` in std because `ExactSizeIterator` is only
/// implemented for `Range<usize>`.
pub trait RangeExt {
    fn len(&self) -> i64;
}

impl RangeExt for std::ops::Range<i64> {
    fn len(&self) -> i64 {
        self.end - self.start
    }
}

// MemReader

pub struct MemReader {
    mem: Cursor<Arc<[u8]>>,
}

impl MemReader {
    fn new(mem: Arc<[u8]>) -> Self {
        Self {
            mem: Cursor::new(mem),
        }
    }
}

impl From<Vec<u8>> for MemReader {
    fn from(vec: Vec<u8>) -> Self {
        let rc: Arc<[u8]> = Arc::from(vec);
        Self::new(rc)
    }
}

impl Read for MemReader {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.mem.read(buf)
    }
}

impl Seek for MemReader {
    fn seek(&mut self, pos: std::io::SeekFrom) -> Result<u64> {
        self.mem.seek(pos)
    }
}

impl Reader for MemReader {
    fn try_clone_independent(&self) -> Result<Self> {
        let rc = self.mem.get_ref().clone();
        Ok(Self::new(rc))
    }
}

// MemWriter

pub struct MemWriter {
    mem: Cursor<Vec<u8>>,
    annotations: Annotations,
}

impl MemWriter {
    pub fn new() -> Self {
        Self {
            mem: Cursor::new(Vec::new()),
            annotations: Annotations::new(),
        }
    }
}

impl Default for MemWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl MemWriter {
    /// Consumes the writer and returns its raw bytes, bypassing the
    /// `Writer`/`Reader` pairing. Used to build the plaintext blob that
    /// gets handed to AES-GCM before a container is encrypted (spec 4.5).
    pub fn into_bytes(self) -> Vec<u8> {
        self.mem.into_inner()
    }

    #[cfg(test)]
    pub fn render_annotations(&self) -> tachyon_base::Result<String> {
        self.annotations.render_hexdump(self.mem.get_ref())
    }
}

impl Write for MemWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.mem.write(buf)
    }
    fn flush(&mut self) -> Result<()> {
        self.mem.flush()
    }
}

impl Seek for MemWriter {
    fn seek(&mut self, pos: std::io::SeekFrom) -> Result<u64> {
        self.mem.seek(pos)
    }
}

impl Writer for MemWriter {
    type PairedReader = MemReader;
    fn try_into_reader(self) -> Result<Self::PairedReader> {
        let mem = self.mem.into_inner();
        let rc: Arc<[u8]> = Arc::from(mem);
        Ok(MemReader {
            mem: Cursor::new(rc),
        })
    }
    fn annotations(&mut self) -> &mut Annotations {
        &mut self.annotations
    }
}

// FileReader

pub struct FileReader {
    file: BufReader<File>,
    path: PathBuf,
}

impl FileReader {
    pub fn try_open_existing(path: PathBuf) -> Result<Self> {
        let file = File::open(&path)?;
        let file = BufReader::new(file);
        Ok(Self { file, path })
    }
}
impl Read for FileReader {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.file.read(buf)
    }
}

impl Seek for FileReader {
    fn seek(&mut self, pos: std::io::SeekFrom) -> Result<u64> {
        self.file.seek(pos)
    }
}

impl Reader for FileReader {
    fn try_clone_independent(&self) -> Result<Self> {
        FileReader::try_open_existing(self.path.clone())
    }
}

// FileWriter

pub struct FileWriter {
    file: BufWriter<File>,
    path: PathBuf,
    annotations: Annotations,
}

impl FileWriter {
    pub fn try_create_non_existing(path: PathBuf) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        let file = BufWriter::new(file);
        let path = path.to_owned();
        Ok(Self {
            file,
            path,
            annotations: Annotations::new(),
        })
    }
}

impl Write for FileWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.file.write(buf)
    }
    fn flush(&mut self) -> Result<()> {
        self.file.flush()
    }
}
impl Seek for FileWriter {
    fn seek(&mut self, pos: std::io::SeekFrom) -> Result<u64> {
        self.file.seek(pos)
    }
}

impl Writer for FileWriter {
    type PairedReader = FileReader;
    fn try_into_reader(self) -> Result<Self::PairedReader> {
        let Self {
            mut file, path, ..
        } = self;
        // Make extra sure we've flushed-and-closed before
        // opening to read.
        file.flush()?;
        let file = file.into_inner()?;
        file.sync_all()?;
        drop(file);
        FileReader::try_open_existing(path)
    }
    fn annotations(&mut self) -> &mut Annotations {
        &mut self.annotations
    }
}
