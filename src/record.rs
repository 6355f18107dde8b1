//! Allocation event records and the views readers hand out
//!
//! A record is a fixed 56-byte header followed by `frame_count` frame ids.
//! The header mirrors the producer's C struct on a 64-bit host, padding
//! included:
//!
//! ```text
//! offset  0  tstart      u64   hook entry (ns)
//! offset  8  treturn     u64   allocator return (ns)
//! offset 16  tend        u64   hook exit (ns)
//! offset 24  alloc_type  u8    0 = free, nonzero = allocation variant
//! offset 32  addr        u64   pointer value
//! offset 40  size        u64   bytes (allocations only)
//! offset 48  frame_count i32
//! offset 56  frame ids   u32 * frame_count
//! ```
//!
//! [`next_offset`] is the only place that knows how far a record extends;
//! every reader steps through the body with it.

use crate::error::{Result, TraceError};

/// Index into the external symbol table
pub type FrameId = u32;

/// Size of the fixed record header
pub const RECORD_HEADER_LEN: usize = 56;

/// Size of one frame id
pub const FRAME_ID_LEN: usize = std::mem::size_of::<FrameId>();

const PAGE_MASK: u64 = 4096 - 1;

const TSTART_AT: usize = 0;
const TRETURN_AT: usize = 8;
const TEND_AT: usize = 16;
const ALLOC_TYPE_AT: usize = 24;
const ADDR_AT: usize = 32;
const SIZE_AT: usize = 40;
const COUNT_AT: usize = 48;

fn ne_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_ne_bytes(raw)
}

fn ne_i32(bytes: &[u8], at: usize) -> i32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    i32::from_ne_bytes(raw)
}

fn decode_frames(bytes: &[u8]) -> Vec<FrameId> {
    bytes
        .chunks_exact(FRAME_ID_LEN)
        .map(|c| FrameId::from_ne_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Offset of the record following the one that starts at `offset`
///
/// Fails with [`TraceError::Corrupt`] when the record header or its frame ids
/// would run past the end of `buf`, or the frame count is negative.
pub fn next_offset(buf: &[u8], offset: usize) -> Result<usize> {
    let header_end = offset
        .checked_add(RECORD_HEADER_LEN)
        .filter(|end| *end <= buf.len())
        .ok_or_else(|| {
            TraceError::corrupt(format!(
                "truncated record header at offset {offset} (body is {} bytes)",
                buf.len()
            ))
        })?;

    let count = ne_i32(buf, offset + COUNT_AT);
    let count = usize::try_from(count).map_err(|_| {
        TraceError::corrupt(format!("negative frame count {count} at offset {offset}"))
    })?;

    count
        .checked_mul(FRAME_ID_LEN)
        .and_then(|len| header_end.checked_add(len))
        .filter(|end| *end <= buf.len())
        .ok_or_else(|| {
            TraceError::corrupt(format!(
                "record at offset {offset} declares {count} frames past the end of the body"
            ))
        })
}

/// Result of walking a record body once
#[derive(Debug, Clone, Default)]
pub struct RecordScan {
    /// Start offset of every `period`-th record
    pub anchors: Vec<usize>,
    /// Exact number of records in the body
    pub count: usize,
    /// Largest frame count seen
    pub max_depth: usize,
}

/// Walk every record in `buf[start..]`, keeping every `period`-th start offset
pub fn scan_records(buf: &[u8], start: usize, period: usize) -> Result<RecordScan> {
    let period = period.max(1);
    let mut scan = RecordScan::default();
    let mut offset = start;
    while offset < buf.len() {
        if scan.count % period == 0 {
            scan.anchors.push(offset);
        }
        let next = next_offset(buf, offset)?;
        let depth = (next - offset - RECORD_HEADER_LEN) / FRAME_ID_LEN;
        scan.max_depth = scan.max_depth.max(depth);
        offset = next;
        scan.count += 1;
    }
    Ok(scan)
}

/// Decoded fixed part of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecordHeader {
    pub tstart: u64,
    pub treturn: u64,
    pub tend: u64,
    pub alloc_type: u8,
    pub addr: u64,
    pub size: u64,
    pub frame_count: i32,
}

impl RecordHeader {
    /// Decode from the first [`RECORD_HEADER_LEN`] bytes of `bytes`
    fn decode(bytes: &[u8]) -> Self {
        Self {
            tstart: ne_u64(bytes, TSTART_AT),
            treturn: ne_u64(bytes, TRETURN_AT),
            tend: ne_u64(bytes, TEND_AT),
            alloc_type: bytes[ALLOC_TYPE_AT],
            addr: ne_u64(bytes, ADDR_AT),
            size: ne_u64(bytes, SIZE_AT),
            frame_count: ne_i32(bytes, COUNT_AT),
        }
    }

    /// On-disk form, padding zeroed
    pub fn encode(&self) -> [u8; RECORD_HEADER_LEN] {
        let mut buf = [0u8; RECORD_HEADER_LEN];
        buf[TSTART_AT..TSTART_AT + 8].copy_from_slice(&self.tstart.to_ne_bytes());
        buf[TRETURN_AT..TRETURN_AT + 8].copy_from_slice(&self.treturn.to_ne_bytes());
        buf[TEND_AT..TEND_AT + 8].copy_from_slice(&self.tend.to_ne_bytes());
        buf[ALLOC_TYPE_AT] = self.alloc_type;
        buf[ADDR_AT..ADDR_AT + 8].copy_from_slice(&self.addr.to_ne_bytes());
        buf[SIZE_AT..SIZE_AT + 8].copy_from_slice(&self.size.to_ne_bytes());
        buf[COUNT_AT..COUNT_AT + 4].copy_from_slice(&self.frame_count.to_ne_bytes());
        buf
    }
}

/// Read accessors shared by every record representation
pub trait MemRecord {
    fn tstart(&self) -> u64;
    fn treturn(&self) -> u64;
    fn tend(&self) -> u64;
    fn alloc_type(&self) -> u8;
    fn addr(&self) -> u64;
    fn size(&self) -> u64;
    fn frame_count(&self) -> usize;
    /// Frame ids, outermost last as captured
    fn stacks(&self) -> Vec<FrameId>;

    fn is_free(&self) -> bool {
        self.alloc_type() == 0
    }

    /// Time spent inside the instrumentation hook
    fn overhead(&self) -> u64 {
        self.tend().saturating_sub(self.tstart())
    }

    /// Page holding the first byte of the block
    fn first_page(&self) -> u64 {
        self.addr() & !PAGE_MASK
    }

    /// Last byte of the page holding the end of the block
    fn last_page(&self) -> u64 {
        self.addr().wrapping_add(self.size()) | PAGE_MASK
    }

    fn header(&self) -> RecordHeader {
        RecordHeader {
            tstart: self.tstart(),
            treturn: self.treturn(),
            tend: self.tend(),
            alloc_type: self.alloc_type(),
            addr: self.addr(),
            size: self.size(),
            frame_count: self.frame_count() as i32,
        }
    }

    /// Copy into a record that no longer borrows the backing buffer
    fn to_owned_record(&self) -> OwnedRecord {
        OwnedRecord {
            header: self.header(),
            stacks: self.stacks(),
        }
    }
}

/// Append the on-disk form of `record` to `out`
pub fn encode_record<R: MemRecord + ?Sized>(record: &R, out: &mut Vec<u8>) {
    let stacks = record.stacks();
    let mut header = record.header();
    header.frame_count = stacks.len() as i32;
    out.extend_from_slice(&header.encode());
    for frame in stacks {
        out.extend_from_slice(&frame.to_ne_bytes());
    }
}

/// Fully decoded header borrowing its frame ids from the mapping
#[derive(Debug, Clone, Copy)]
pub struct MappedRecord<'a> {
    header: RecordHeader,
    frames: &'a [u8],
}

impl<'a> MappedRecord<'a> {
    /// Decode the record starting at `offset` in `buf`
    pub fn parse(buf: &'a [u8], offset: usize) -> Result<Self> {
        let end = next_offset(buf, offset)?;
        Ok(Self {
            header: RecordHeader::decode(&buf[offset..]),
            frames: &buf[offset + RECORD_HEADER_LEN..end],
        })
    }
}

impl MemRecord for MappedRecord<'_> {
    fn tstart(&self) -> u64 {
        self.header.tstart
    }
    fn treturn(&self) -> u64 {
        self.header.treturn
    }
    fn tend(&self) -> u64 {
        self.header.tend
    }
    fn alloc_type(&self) -> u8 {
        self.header.alloc_type
    }
    fn addr(&self) -> u64 {
        self.header.addr
    }
    fn size(&self) -> u64 {
        self.header.size
    }
    fn frame_count(&self) -> usize {
        self.frames.len() / FRAME_ID_LEN
    }
    fn stacks(&self) -> Vec<FrameId> {
        decode_frames(self.frames)
    }
    fn header(&self) -> RecordHeader {
        self.header
    }
}

/// Record bytes borrowed from the mapping, decoded on every access
///
/// Construction is a bounds check and a slice, which keeps the indexing
/// reader's per-access cost down.
#[derive(Debug, Clone, Copy)]
pub struct IndexedRecord<'a> {
    bytes: &'a [u8],
}

impl<'a> IndexedRecord<'a> {
    pub fn parse(buf: &'a [u8], offset: usize) -> Result<Self> {
        let end = next_offset(buf, offset)?;
        Ok(Self {
            bytes: &buf[offset..end],
        })
    }
}

impl MemRecord for IndexedRecord<'_> {
    fn tstart(&self) -> u64 {
        ne_u64(self.bytes, TSTART_AT)
    }
    fn treturn(&self) -> u64 {
        ne_u64(self.bytes, TRETURN_AT)
    }
    fn tend(&self) -> u64 {
        ne_u64(self.bytes, TEND_AT)
    }
    fn alloc_type(&self) -> u8 {
        self.bytes[ALLOC_TYPE_AT]
    }
    fn addr(&self) -> u64 {
        ne_u64(self.bytes, ADDR_AT)
    }
    fn size(&self) -> u64 {
        ne_u64(self.bytes, SIZE_AT)
    }
    fn frame_count(&self) -> usize {
        (self.bytes.len() - RECORD_HEADER_LEN) / FRAME_ID_LEN
    }
    fn stacks(&self) -> Vec<FrameId> {
        decode_frames(&self.bytes[RECORD_HEADER_LEN..])
    }
}

/// Heap copy of a record with an independent lifetime
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OwnedRecord {
    header: RecordHeader,
    stacks: Vec<FrameId>,
}

impl OwnedRecord {
    /// Allocation event of `size` bytes at `addr`
    pub fn alloc(alloc_type: u8, addr: u64, size: u64) -> Self {
        debug_assert!(alloc_type != 0, "alloc_type 0 denotes a free");
        Self {
            header: RecordHeader {
                alloc_type,
                addr,
                size,
                ..RecordHeader::default()
            },
            stacks: Vec::new(),
        }
    }

    /// Free event for `addr`
    pub fn free(addr: u64) -> Self {
        Self {
            header: RecordHeader {
                addr,
                ..RecordHeader::default()
            },
            stacks: Vec::new(),
        }
    }

    pub fn with_times(mut self, tstart: u64, treturn: u64, tend: u64) -> Self {
        self.header.tstart = tstart;
        self.header.treturn = treturn;
        self.header.tend = tend;
        self
    }

    pub fn with_stacks(mut self, stacks: Vec<FrameId>) -> Self {
        self.header.frame_count = stacks.len() as i32;
        self.stacks = stacks;
        self
    }
}

impl MemRecord for OwnedRecord {
    fn tstart(&self) -> u64 {
        self.header.tstart
    }
    fn treturn(&self) -> u64 {
        self.header.treturn
    }
    fn tend(&self) -> u64 {
        self.header.tend
    }
    fn alloc_type(&self) -> u8 {
        self.header.alloc_type
    }
    fn addr(&self) -> u64 {
        self.header.addr
    }
    fn size(&self) -> u64 {
        self.header.size
    }
    fn frame_count(&self) -> usize {
        self.stacks.len()
    }
    fn stacks(&self) -> Vec<FrameId> {
        self.stacks.clone()
    }
    fn header(&self) -> RecordHeader {
        self.header
    }
}

/// Record handed out by a [`crate::reader::TraceReader`]
#[derive(Debug, Clone)]
pub enum RecordView<'a> {
    Mapped(MappedRecord<'a>),
    Indexed(IndexedRecord<'a>),
    Owned(OwnedRecord),
}

impl RecordView<'_> {
    fn inner(&self) -> &dyn MemRecord {
        match self {
            RecordView::Mapped(r) => r,
            RecordView::Indexed(r) => r,
            RecordView::Owned(r) => r,
        }
    }

    /// Detach from the reader's buffer
    pub fn into_owned(self) -> OwnedRecord {
        match self {
            RecordView::Owned(r) => r,
            other => other.to_owned_record(),
        }
    }
}

impl MemRecord for RecordView<'_> {
    fn tstart(&self) -> u64 {
        self.inner().tstart()
    }
    fn treturn(&self) -> u64 {
        self.inner().treturn()
    }
    fn tend(&self) -> u64 {
        self.inner().tend()
    }
    fn alloc_type(&self) -> u8 {
        self.inner().alloc_type()
    }
    fn addr(&self) -> u64 {
        self.inner().addr()
    }
    fn size(&self) -> u64 {
        self.inner().size()
    }
    fn frame_count(&self) -> usize {
        self.inner().frame_count()
    }
    fn stacks(&self) -> Vec<FrameId> {
        self.inner().stacks()
    }
}

impl<'a> From<MappedRecord<'a>> for RecordView<'a> {
    fn from(r: MappedRecord<'a>) -> Self {
        RecordView::Mapped(r)
    }
}

impl<'a> From<IndexedRecord<'a>> for RecordView<'a> {
    fn from(r: IndexedRecord<'a>) -> Self {
        RecordView::Indexed(r)
    }
}

impl From<OwnedRecord> for RecordView<'_> {
    fn from(r: OwnedRecord) -> Self {
        RecordView::Owned(r)
    }
}
