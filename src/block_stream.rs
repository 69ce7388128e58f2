//! Stitch independently compressed blocks of one archive into a single XML document.

use std::{
    fmt,
    fs::File,
    io::{self, BufRead, BufReader, Read, Seek, SeekFrom},
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

const ROOT_OPEN: &[u8] = b"<dummy_root>\n";
const ROOT_CLOSE: &[u8] = b"\n</dummy_root>\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Compression {
    Bzip2,
    Gzip,
    Zstd,
}

impl Compression {
    /// Recognize a format from the first bytes of a compressed stream.
    pub fn detect(magic: &[u8]) -> Option<Self> {
        if magic.starts_with(b"BZh") {
            Some(Compression::Bzip2)
        } else if magic.starts_with(&[0x1f, 0x8b]) {
            Some(Compression::Gzip)
        } else if magic.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
            Some(Compression::Zstd)
        } else {
            None
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "bz2" => Some(Compression::Bzip2),
            "gz" => Some(Compression::Gzip),
            "zst" => Some(Compression::Zstd),
            _ => None,
        }
    }

    /// Decompress exactly one stream (one bzip2 stream, one gzip member, one zstd frame)
    /// starting at the current position of `source`.
    fn decode_one<B: BufRead>(self, source: B, out: &mut Vec<u8>) -> io::Result<usize> {
        match self {
            Compression::Bzip2 => bzip2::bufread::BzDecoder::new(source).read_to_end(out),
            Compression::Gzip => flate2::bufread::GzDecoder::new(source).read_to_end(out),
            Compression::Zstd => zstd::Decoder::with_buffer(source)?
                .single_frame()
                .read_to_end(out),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Compression::Bzip2 => "bzip2",
            Compression::Gzip => "gzip",
            Compression::Zstd => "zstd",
        })
    }
}

/// Counters shared between a [`BlockStream`] and whoever wants to observe it.
#[derive(Debug, Default)]
pub struct BlockStats {
    decompressed: AtomicUsize,
    skipped: AtomicUsize,
}

impl BlockStats {
    pub fn blocks_decompressed(&self) -> usize {
        self.decompressed.load(Ordering::Relaxed)
    }

    pub fn blocks_skipped(&self) -> usize {
        self.skipped.load(Ordering::Relaxed)
    }
}

enum State {
    Prefix(usize),
    Block { data: Vec<u8>, pos: usize },
    Advance,
    Suffix(usize),
    Exhausted,
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Prefix(pos) => write!(f, "Prefix({pos})"),
            State::Block { data, pos } => write!(f, "Block({pos}/{})", data.len()),
            State::Advance => write!(f, "Advance"),
            State::Suffix(pos) => write!(f, "Suffix({pos})"),
            State::Exhausted => write!(f, "Exhausted"),
        }
    }
}

/// A [`Read`] yielding `<dummy_root>`, the decompressed content of the block at each offset
/// in turn and `</dummy_root>`.
///
/// The compression format is detected from the first block that can be read and assumed
/// for all following ones. A block that fails to decompress is logged, counted and skipped.
/// Errors of the underlying reader itself (e.g. a failing seek) are returned to the caller.
#[derive(Debug)]
pub struct BlockStream<R> {
    source: BufReader<R>,
    offsets: Vec<u64>,
    next_offset: usize,
    format: Option<Compression>,
    state: State,
    stats: Arc<BlockStats>,
}

impl BlockStream<File> {
    pub fn open(path: &Path, offsets: Vec<u64>) -> io::Result<Self> {
        Ok(Self::new(File::open(path)?, offsets))
    }
}

impl<R: Read + Seek> BlockStream<R> {
    pub fn new(source: R, offsets: Vec<u64>) -> Self {
        Self {
            source: BufReader::with_capacity(256 * 1024, source),
            offsets,
            next_offset: 0,
            format: None,
            state: State::Prefix(0),
            stats: Arc::default(),
        }
    }

    /// Stream exactly one block, for callers that already know which block they need.
    pub fn single(source: R, offset: u64) -> Self {
        Self::new(source, vec![offset])
    }

    pub fn stats(&self) -> Arc<BlockStats> {
        Arc::clone(&self.stats)
    }

    pub fn format(&self) -> Option<Compression> {
        self.format
    }

    pub fn into_inner(self) -> R {
        self.source.into_inner()
    }

    /// Decompress the next block, skipping blocks that cannot be decompressed.
    ///
    /// Returns `None` once the offsets are exhausted.
    fn next_block(&mut self) -> io::Result<Option<Vec<u8>>> {
        while let Some(&offset) = self.offsets.get(self.next_offset) {
            self.next_offset += 1;
            self.source.seek(SeekFrom::Start(offset))?;

            let format = match self.format {
                Some(format) => format,
                None => match Compression::detect(self.source.fill_buf()?) {
                    Some(format) => {
                        tracing::debug!(message = "Detected block compression", %format, offset);
                        self.format = Some(format);
                        format
                    }
                    None => {
                        tracing::warn!(
                            message = "Skipping block of unknown compression format",
                            offset
                        );
                        self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                },
            };

            let mut data = Vec::new();
            match format.decode_one(&mut self.source, &mut data) {
                Ok(_) => {
                    self.stats.decompressed.fetch_add(1, Ordering::Relaxed);
                    return Ok(Some(data));
                }
                Err(error) => {
                    tracing::warn!(
                        message = "Skipping block that failed to decompress",
                        offset,
                        %format,
                        %error
                    );
                    self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        Ok(None)
    }
}

fn copy_from(src: &[u8], pos: &mut usize, buf: &mut [u8]) -> usize {
    let n = (src.len() - *pos).min(buf.len());
    buf[..n].copy_from_slice(&src[*pos..*pos + n]);
    *pos += n;
    n
}

impl<R: Read + Seek> Read for BlockStream<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            match &mut self.state {
                State::Prefix(pos) => {
                    let n = copy_from(ROOT_OPEN, pos, buf);
                    if *pos == ROOT_OPEN.len() {
                        self.state = State::Advance;
                    }
                    return Ok(n);
                }
                State::Block { data, pos } => {
                    if *pos < data.len() {
                        return Ok(copy_from(data, pos, buf));
                    }
                    self.state = State::Advance;
                }
                State::Advance => {
                    self.state = match self.next_block()? {
                        Some(data) => State::Block { data, pos: 0 },
                        None => State::Suffix(0),
                    };
                }
                State::Suffix(pos) => {
                    let n = copy_from(ROOT_CLOSE, pos, buf);
                    if *pos == ROOT_CLOSE.len() {
                        self.state = State::Exhausted;
                    }
                    return Ok(n);
                }
                State::Exhausted => return Ok(0),
            }
        }
    }
}

/// Open a whole dump file, decompressing it as a concatenation of streams if its magic
/// bytes announce a known format and passing it through unchanged otherwise.
pub fn open_decompressed<R: Read + Send + 'static>(source: R) -> io::Result<Box<dyn BufRead + Send>> {
    let mut source = BufReader::with_capacity(256 * 1024, source);
    let format = Compression::detect(source.fill_buf()?);
    tracing::debug!(message = "Opening dump stream", format = ?format);

    Ok(match format {
        Some(Compression::Bzip2) => Box::new(BufReader::new(bzip2::bufread::MultiBzDecoder::new(
            source,
        ))),
        Some(Compression::Gzip) => {
            Box::new(BufReader::new(flate2::bufread::MultiGzDecoder::new(source)))
        }
        // the zstd decoder continues across frames unless told otherwise
        Some(Compression::Zstd) => Box::new(BufReader::new(zstd::Decoder::with_buffer(source)?)),
        None => Box::new(source),
    })
}
