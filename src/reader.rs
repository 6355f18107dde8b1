//! Random-access readers over trace files
//!
//! Three strategies share one contract ([`TraceReader`]):
//!
//! - [`DirectReader`] maps the file and keeps every record offset
//! - [`IndexingReader`] maps the file and keeps every K-th offset, replaying
//!   forward from the nearest anchor (or the last access) on lookup
//! - [`CompressedReader`] decompresses the body into memory, then indexes it
//!   like the direct reader
//!
//! [`open_reader`] picks one from the header's compression field.

use crate::compression::CodecRegistry;
use crate::error::{Result, TraceError};
use crate::header::FileHeader;
use crate::record::{next_offset, scan_records, IndexedRecord, MappedRecord, RecordView};
use memmap2::Mmap;
use std::cell::Cell;
use std::fs::File;
use std::path::Path;
use tracing::{debug, info, warn};

/// Anchor spacing used when none (or zero) is given
pub const DEFAULT_PERIOD: usize = 100;

/// Indexed access to the records of one trace
pub trait TraceReader {
    fn header(&self) -> &FileHeader;

    /// Number of records actually present in the body
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record at `index`
    ///
    /// # Errors
    /// [`TraceError::OutOfRange`] if `index >= len()`.
    fn at(&self, index: usize) -> Result<RecordView<'_>>;

    /// Short strategy name for logs
    fn name(&self) -> &'static str;
}

/// How [`open_reader`] should open uncompressed traces
#[derive(Debug, Clone)]
pub struct ReaderOptions {
    /// Use [`IndexingReader`] rather than [`DirectReader`]
    pub indexed: bool,
    /// Anchor spacing for [`IndexingReader`]
    pub period: usize,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            indexed: true,
            period: DEFAULT_PERIOD,
        }
    }
}

/// Open `path` with the reader its header calls for
///
/// # Errors
/// Fails on I/O errors, a malformed header or body, or a codec that is not
/// available in this build.
pub fn open_reader(path: impl AsRef<Path>, options: &ReaderOptions) -> Result<Box<dyn TraceReader>> {
    let path = path.as_ref();
    let header = FileHeader::read_from(&mut File::open(path)?, false)?;

    let reader: Box<dyn TraceReader> = if header.is_compressed() {
        Box::new(CompressedReader::open(path)?)
    } else if options.indexed {
        Box::new(IndexingReader::open(path, options.period)?)
    } else {
        Box::new(DirectReader::open(path)?)
    };
    debug!(path = %path.display(), reader = reader.name(), "Opened trace");
    Ok(reader)
}

fn out_of_range(index: usize, len: usize) -> TraceError {
    TraceError::OutOfRange { index, len }
}

fn log_counts(reader: &str, header: &FileHeader, found: usize) {
    info!(
        reader,
        expected = header.num_records,
        found,
        "Indexed trace records"
    );
    if header.num_records != found as u64 {
        warn!(
            "Header claims {} records but the body holds {}; using {}",
            header.num_records, found, found
        );
    }
}

/// Map `path` read-only and parse the header at its start
fn map_trace(path: &Path) -> Result<(Mmap, FileHeader, usize)> {
    let file = File::open(path)?;
    // SAFETY: the mapping is read-only and trace files are not modified while
    // a reader holds them.
    let map = unsafe { Mmap::map(&file)? };
    let (header, start) = FileHeader::decode(&map)?;
    if header.is_compressed() {
        return Err(TraceError::corrupt(format!(
            "{} has a compressed body (kind {}) and cannot be mapped directly",
            path.display(),
            header.compression
        )));
    }
    Ok((map, header, start))
}

// --- DIRECT ---

/// Memory-mapped reader holding the offset of every record
pub struct DirectReader {
    header: FileHeader,
    map: Mmap,
    offsets: Vec<usize>,
}

impl DirectReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (map, header, start) = map_trace(path.as_ref())?;
        let scan = scan_records(&map, start, 1)?;
        log_counts("direct", &header, scan.count);
        Ok(Self {
            header,
            map,
            offsets: scan.anchors,
        })
    }
}

impl TraceReader for DirectReader {
    fn header(&self) -> &FileHeader {
        &self.header
    }

    fn len(&self) -> usize {
        self.offsets.len()
    }

    fn at(&self, index: usize) -> Result<RecordView<'_>> {
        let offset = *self
            .offsets
            .get(index)
            .ok_or_else(|| out_of_range(index, self.offsets.len()))?;
        MappedRecord::parse(&self.map, offset).map(RecordView::from)
    }

    fn name(&self) -> &'static str {
        "direct"
    }
}

// --- INDEXING ---

/// Memory-mapped reader keeping one anchor every `period` records
///
/// Lookups replay forward with [`next_offset`] from the anchor at or below the
/// target, or from the previous lookup when that is closer. Not `Sync`: the
/// last-access position lives in a [`Cell`].
pub struct IndexingReader {
    header: FileHeader,
    map: Mmap,
    anchors: Vec<usize>,
    period: usize,
    count: usize,
    /// (index, byte offset) of the last record handed out
    last: Cell<(usize, usize)>,
}

impl IndexingReader {
    /// Open `path`, anchoring every `period`-th record (0 selects the default)
    pub fn open(path: impl AsRef<Path>, period: usize) -> Result<Self> {
        let period = if period < 1 { DEFAULT_PERIOD } else { period };
        let (map, header, start) = map_trace(path.as_ref())?;
        let scan = scan_records(&map, start, period)?;
        log_counts("indexing", &header, scan.count);
        debug!(period, anchors = scan.anchors.len(), "Built record index");

        Ok(Self {
            header,
            map,
            last: Cell::new((0, start)),
            anchors: scan.anchors,
            period,
            count: scan.count,
        })
    }

    pub fn period(&self) -> usize {
        self.period
    }

    /// Number of anchors
    pub fn indexed_len(&self) -> usize {
        self.anchors.len()
    }

    /// Records after the last anchor
    pub fn remainder(&self) -> usize {
        self.count.saturating_sub(1) % self.period
    }
}

impl TraceReader for IndexingReader {
    fn header(&self) -> &FileHeader {
        &self.header
    }

    fn len(&self) -> usize {
        self.count
    }

    fn at(&self, index: usize) -> Result<RecordView<'_>> {
        if index >= self.count {
            return Err(out_of_range(index, self.count));
        }
        let bucket = index / self.period;
        let step = index % self.period;

        let (mut at, mut offset) = (bucket * self.period, self.anchors[bucket]);
        if step != 0 {
            let (last, last_offset) = self.last.get();
            if last < index && index - last < step {
                (at, offset) = (last, last_offset);
            }
        }
        while at < index {
            offset = next_offset(&self.map, offset)?;
            at += 1;
        }

        self.last.set((index, offset));
        IndexedRecord::parse(&self.map, offset).map(RecordView::from)
    }

    fn name(&self) -> &'static str {
        "indexing"
    }
}

// --- COMPRESSED ---

/// Reader that inflates the whole body into memory
pub struct CompressedReader {
    header: FileHeader,
    body: Vec<u8>,
    offsets: Vec<usize>,
    codec: &'static str,
}

impl CompressedReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        let (header, start) = FileHeader::decode(&bytes)?;

        let registry = CodecRegistry::new();
        let (codec, _) = registry.for_kind(header.compression)?;
        let body = codec.decompress(&bytes[start..])?;
        debug!(
            codec = codec.name(),
            compressed = bytes.len() - start,
            inflated = body.len(),
            "Decompressed trace body"
        );

        let scan = scan_records(&body, 0, 1)?;
        log_counts("compressed", &header, scan.count);
        Ok(Self {
            header,
            body,
            offsets: scan.anchors,
            codec: codec.name(),
        })
    }

    /// Name of the codec the body was stored with
    pub fn codec_name(&self) -> &'static str {
        self.codec
    }
}

impl TraceReader for CompressedReader {
    fn header(&self) -> &FileHeader {
        &self.header
    }

    fn len(&self) -> usize {
        self.offsets.len()
    }

    fn at(&self, index: usize) -> Result<RecordView<'_>> {
        let offset = *self
            .offsets
            .get(index)
            .ok_or_else(|| out_of_range(index, self.offsets.len()))?;
        MappedRecord::parse(&self.body, offset).map(RecordView::from)
    }

    fn name(&self) -> &'static str {
        "compressed"
    }
}
