//! File header for allocation trace files
//!
//! The header sits at offset 0 of every trace file and is followed directly by
//! the record body. Layout (native endian, no padding):
//!
//! ```text
//! magic[4] tool_version:i32 compression:i32
//! num_records:u64 max_stack_depth:u64 bucket_size:u64 num_buckets:u64
//! pid:u32 start_time:u64 start_time_utc:u64
//! cmd_length:u64 cmd_line[cmd_length]
//! ```
//!
//! The command line blob holds NUL-separated arguments with no guaranteed
//! trailing NUL.

use crate::error::{Result, TraceError};
use std::fmt;
use std::io::{Read, Seek, SeekFrom, Write};

/// Tag identifying a trace file
pub const MAGIC: [u8; 4] = *b"FOM\0";

/// Version stamped by [`crate::writer::Writer`]
pub const TOOL_VERSION: i32 = 20000;

/// Size of the header without the trailing command line blob
pub const FIXED_HEADER_LEN: usize = 4 + 4 + 4 + 8 * 4 + 4 + 8 + 8 + 8;

/// `compression = codec_id * CODEC_STRIDE + flags`
pub const CODEC_STRIDE: i32 = 10_000_000;

/// Trace file metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub magic: [u8; 4],
    pub tool_version: i32,
    /// Codec id times [`CODEC_STRIDE`] plus codec flags; 0 means uncompressed
    pub compression: i32,
    pub num_records: u64,
    pub max_stack_depth: u64,
    /// Index period used by the producer (informational)
    pub bucket_size: u64,
    /// Informational
    pub num_buckets: u64,
    pub pid: u32,
    /// Monotonic clock at capture start (ns)
    pub start_time: u64,
    /// Wall clock at capture start (ns)
    pub start_time_utc: u64,
    cmd_line: Vec<u8>,
}

impl Default for FileHeader {
    fn default() -> Self {
        Self {
            magic: MAGIC,
            tool_version: -1,
            compression: 0,
            num_records: 0,
            max_stack_depth: 0,
            bucket_size: 0,
            num_buckets: 0,
            pid: 0,
            start_time: 0,
            start_time_utc: 0,
            cmd_line: Vec::new(),
        }
    }
}

impl FileHeader {
    /// Create an empty header carrying the trace magic
    pub fn new() -> Self {
        Self::default()
    }

    /// Codec selected by the compression field (0 = none)
    pub fn codec_id(&self) -> i32 {
        self.compression / CODEC_STRIDE
    }

    /// Codec-specific flags (the compression level; 0 = codec default)
    pub fn codec_flags(&self) -> i32 {
        self.compression % CODEC_STRIDE
    }

    pub fn is_compressed(&self) -> bool {
        self.compression != 0
    }

    /// Raw command line blob
    pub fn cmd_line_bytes(&self) -> &[u8] {
        &self.cmd_line
    }

    /// Replace the command line blob
    pub fn set_cmd_line(&mut self, blob: impl Into<Vec<u8>>) {
        self.cmd_line = blob.into();
    }

    /// Store `args` as a NUL-separated blob
    pub fn set_args<I, S>(&mut self, args: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut blob = Vec::new();
        for arg in args {
            blob.extend_from_slice(arg.as_ref().as_bytes());
            blob.push(0);
        }
        self.cmd_line = blob;
    }

    /// Split the command line blob into its arguments
    pub fn command_line(&self) -> Vec<String> {
        let mut args: Vec<String> = self
            .cmd_line
            .split(|b| *b == 0)
            .map(|arg| String::from_utf8_lossy(arg).into_owned())
            .collect();
        if self.cmd_line.last() == Some(&0) || self.cmd_line.is_empty() {
            args.pop();
        }
        args
    }

    /// Number of bytes the header occupies on disk
    pub fn encoded_len(&self) -> usize {
        FIXED_HEADER_LEN + self.cmd_line.len()
    }

    /// Serialize the header in on-disk order
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(&self.magic);
        buf.extend_from_slice(&self.tool_version.to_ne_bytes());
        buf.extend_from_slice(&self.compression.to_ne_bytes());
        buf.extend_from_slice(&self.num_records.to_ne_bytes());
        buf.extend_from_slice(&self.max_stack_depth.to_ne_bytes());
        buf.extend_from_slice(&self.bucket_size.to_ne_bytes());
        buf.extend_from_slice(&self.num_buckets.to_ne_bytes());
        buf.extend_from_slice(&self.pid.to_ne_bytes());
        buf.extend_from_slice(&self.start_time.to_ne_bytes());
        buf.extend_from_slice(&self.start_time_utc.to_ne_bytes());
        buf.extend_from_slice(&(self.cmd_line.len() as u64).to_ne_bytes());
        buf.extend_from_slice(&self.cmd_line);
        buf
    }

    /// Parse a header from the start of `buf`
    ///
    /// Returns the header and the offset at which the record body begins.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < FIXED_HEADER_LEN {
            return Err(TraceError::corrupt(format!(
                "file is too short: {} bytes, header needs {}",
                buf.len(),
                FIXED_HEADER_LEN
            )));
        }
        let mut fields = Fields::new(&buf[..FIXED_HEADER_LEN]);
        let mut header = Self {
            magic: fields.array(),
            tool_version: i32::from_ne_bytes(fields.array()),
            compression: i32::from_ne_bytes(fields.array()),
            num_records: u64::from_ne_bytes(fields.array()),
            max_stack_depth: u64::from_ne_bytes(fields.array()),
            bucket_size: u64::from_ne_bytes(fields.array()),
            num_buckets: u64::from_ne_bytes(fields.array()),
            pid: u32::from_ne_bytes(fields.array()),
            start_time: u64::from_ne_bytes(fields.array()),
            start_time_utc: u64::from_ne_bytes(fields.array()),
            cmd_line: Vec::new(),
        };
        let cmd_len = u64::from_ne_bytes(fields.array());
        if header.magic != MAGIC {
            return Err(TraceError::InvalidMagic(header.magic));
        }

        let end = usize::try_from(cmd_len)
            .ok()
            .and_then(|len| FIXED_HEADER_LEN.checked_add(len))
            .filter(|end| *end <= buf.len())
            .ok_or_else(|| {
                TraceError::corrupt(format!(
                    "command line length {cmd_len} overruns the file ({} bytes)",
                    buf.len()
                ))
            })?;
        header.cmd_line = buf[FIXED_HEADER_LEN..end].to_vec();
        Ok((header, end))
    }

    /// Write the header at offset 0 of `w`
    ///
    /// With `keep_offset` the stream position is restored afterwards, so a
    /// writer appending records can refresh the header in place.
    pub fn write_to<W: Write + Seek>(&self, w: &mut W, keep_offset: bool) -> Result<()> {
        let position = w.stream_position()?;
        w.seek(SeekFrom::Start(0))?;
        w.write_all(&self.encode())?;
        if keep_offset {
            w.seek(SeekFrom::Start(position))?;
        }
        Ok(())
    }

    /// Read the header from offset 0 of `r`
    ///
    /// Without `keep_offset` the stream is left positioned at the first record.
    pub fn read_from<R: Read + Seek>(r: &mut R, keep_offset: bool) -> Result<Self> {
        let position = r.stream_position()?;
        r.seek(SeekFrom::Start(0))?;

        let mut fixed = [0u8; FIXED_HEADER_LEN];
        r.read_exact(&mut fixed).map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => {
                TraceError::corrupt("file is too short for the trace header")
            }
            _ => TraceError::Io(e),
        })?;
        let cmd_len = u64::from_ne_bytes(
            fixed[FIXED_HEADER_LEN - 8..]
                .try_into()
                .unwrap_or([0; 8]),
        );

        let mut blob = Vec::new();
        r.by_ref().take(cmd_len).read_to_end(&mut blob)?;
        if blob.len() as u64 != cmd_len {
            return Err(TraceError::corrupt(format!(
                "command line truncated: expected {cmd_len} bytes, found {}",
                blob.len()
            )));
        }

        let mut raw = fixed.to_vec();
        raw.extend_from_slice(&blob);
        let (header, _) = Self::decode(&raw)?;

        if keep_offset {
            r.seek(SeekFrom::Start(position))?;
        }
        Ok(header)
    }
}

impl fmt::Display for FileHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let key: String = self
            .magic
            .iter()
            .take_while(|b| **b != 0)
            .map(|b| char::from(*b))
            .collect();
        writeln!(f, "Key              = {key}")?;
        writeln!(f, "Tool Version     = {}", self.tool_version)?;
        writeln!(f, "Compression      = {}", self.compression)?;
        writeln!(f, "Num Records      = {}", self.num_records)?;
        writeln!(f, "Max Stack Depth  = {}", self.max_stack_depth)?;
        writeln!(f, "Bucket Size      = {}", self.bucket_size)?;
        writeln!(f, "Num Buckets      = {}", self.num_buckets)?;
        writeln!(f, "PID              = {}", self.pid)?;
        writeln!(f, "Start time       = {}", self.start_time)?;
        writeln!(f, "Start time UTC   = {}", self.start_time_utc)?;
        writeln!(f, "Command Line     =")?;
        for (i, arg) in self.command_line().iter().enumerate() {
            writeln!(f, "  arg[{i}]   = {arg}")?;
        }
        Ok(())
    }
}

/// Sequential fixed-width field extraction over an already length-checked slice
struct Fields<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Fields<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn array<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        out
    }
}
