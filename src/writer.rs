//! Trace file writer
//!
//! Writes a provisional header, streams records through the codec selected by
//! the compression kind, and rewrites the header with the final counters on
//! close. A closed writer can be reopened to append another session; for
//! compressed files that starts a new codec stream after the previous one.

use crate::compression::{BodyEncoder, CodecRegistry};
use crate::error::{Result, TraceError};
use crate::header::{FileHeader, TOOL_VERSION};
use crate::record::{encode_record, MemRecord};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info};

/// Appends allocation records to a trace file
pub struct Writer {
    path: PathBuf,
    header: FileHeader,
    registry: CodecRegistry,
    /// Handle used for header rewrites; shares its offset with the body stream
    file: Option<File>,
    body: Option<Box<dyn BodyEncoder>>,
    scratch: Vec<u8>,
}

impl Writer {
    /// Create (or truncate) `path` and write a provisional header
    ///
    /// `compression` is `codec_id * CODEC_STRIDE + level`; `index_period` is
    /// recorded in the header's bucket size for readers that index the file.
    ///
    /// # Errors
    /// [`TraceError::UnsupportedCodec`] if the codec is not compiled in, or
    /// any I/O error from creating the file.
    pub fn create(path: impl AsRef<Path>, compression: i32, index_period: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let registry = CodecRegistry::new();
        registry.for_kind(compression)?;

        let mut header = FileHeader::new();
        header.tool_version = TOOL_VERSION;
        header.compression = compression;
        header.bucket_size = index_period;
        header.pid = std::process::id();
        header.start_time = monotonic_ns()?;
        header.start_time_utc = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        header.set_cmd_line(process_cmd_line());

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        header.write_to(&mut file, false)?;

        let body = start_stream(&registry, compression, &file)?;
        info!(
            path = %path.display(),
            compression,
            pid = header.pid,
            "Created trace file"
        );

        Ok(Self {
            path,
            header,
            registry,
            file: Some(file),
            body: Some(body),
            scratch: Vec::new(),
        })
    }

    /// Append one record; the header is not rewritten until [`Writer::close`]
    pub fn append<R: MemRecord + ?Sized>(&mut self, record: &R) -> Result<()> {
        let body = self.body.as_mut().ok_or(TraceError::WriterClosed)?;
        self.scratch.clear();
        encode_record(record, &mut self.scratch);
        body.write_all(&self.scratch)?;

        self.header.num_records += 1;
        self.header.max_stack_depth = self.header.max_stack_depth.max(record.frame_count() as u64);
        Ok(())
    }

    /// Finish the codec stream and release the file
    ///
    /// With `flush` the header is rewritten with the final counters first.
    /// Returns `false` if the writer was already closed.
    pub fn close(&mut self, flush: bool) -> Result<bool> {
        let Some(mut file) = self.file.take() else {
            return Ok(false);
        };
        if let Some(body) = self.body.take() {
            body.finish()?;
        }

        if flush {
            if self.header.bucket_size > 0 {
                self.header.num_buckets = self.header.num_records.div_ceil(self.header.bucket_size);
            }
            self.header.write_to(&mut file, true)?;
        }
        file.sync_all()?;

        info!(
            path = %self.path.display(),
            records = self.header.num_records,
            max_stack_depth = self.header.max_stack_depth,
            "Closed trace file"
        );
        Ok(true)
    }

    /// Reopen a closed writer for further appends
    ///
    /// The on-disk header is read back and validated and the counters are
    /// restored from it. With `seek_to_end` new records follow the existing
    /// ones; otherwise the body is discarded and the counters start from zero.
    /// Returns `false` if the writer is already open.
    pub fn reopen(&mut self, seek_to_end: bool) -> Result<bool> {
        if self.file.is_some() {
            return Ok(false);
        }

        let mut file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        let mut header = FileHeader::read_from(&mut file, false)?;
        self.registry.for_kind(header.compression)?;

        if seek_to_end {
            file.seek(SeekFrom::End(0))?;
        } else {
            file.set_len(header.encoded_len() as u64)?;
            header.num_records = 0;
            header.max_stack_depth = 0;
            header.num_buckets = 0;
        }

        let body = start_stream(&self.registry, header.compression, &file)?;
        debug!(
            path = %self.path.display(),
            records = header.num_records,
            seek_to_end,
            "Reopened trace file"
        );

        self.header = header;
        self.file = Some(file);
        self.body = Some(body);
        Ok(true)
    }

    /// Header as it will be written on close
    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        if let Err(e) = self.close(true) {
            error!(path = %self.path.display(), "Failed to close trace file: {}", e);
        }
    }
}

fn start_stream(registry: &CodecRegistry, kind: i32, file: &File) -> Result<Box<dyn BodyEncoder>> {
    let (codec, level) = registry.for_kind(kind)?;
    let sink = BufWriter::new(file.try_clone()?);
    codec.encoder(Box::new(sink), level)
}

fn monotonic_ns() -> Result<u64> {
    let now = nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC)
        .map_err(std::io::Error::from)?;
    Ok(now.tv_sec() as u64 * 1_000_000_000 + now.tv_nsec() as u64)
}

/// NUL-separated command line of the current process
fn process_cmd_line() -> Vec<u8> {
    if let Ok(blob) = std::fs::read("/proc/self/cmdline") {
        return blob;
    }
    let mut blob = Vec::new();
    for arg in std::env::args() {
        blob.extend_from_slice(arg.as_bytes());
        blob.push(0);
    }
    blob
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{scan_records, OwnedRecord};
    use tempfile::TempDir;

    fn records() -> Vec<OwnedRecord> {
        vec![
            OwnedRecord::alloc(1, 0x10, 8)
                .with_times(100, 101, 102)
                .with_stacks(vec![1, 2]),
            OwnedRecord::free(0x10).with_times(200, 201, 202),
            OwnedRecord::alloc(2, 0x20, 16)
                .with_times(300, 301, 305)
                .with_stacks(vec![3, 4, 5, 6]),
        ]
    }

    fn read_back(path: &Path) -> (FileHeader, Vec<u8>) {
        let bytes = std::fs::read(path).unwrap();
        let (header, start) = FileHeader::decode(&bytes).unwrap();
        let registry = CodecRegistry::new();
        let (codec, _) = registry.for_kind(header.compression).unwrap();
        let body = codec.decompress(&bytes[start..]).unwrap();
        (header, body)
    }

    #[test]
    fn test_close_rewrites_counters() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trace.bin");
        let mut writer = Writer::create(&path, 0, 2).unwrap();
        for r in &records() {
            writer.append(r).unwrap();
        }
        assert!(writer.close(true).unwrap());
        assert!(!writer.close(true).unwrap());

        let (header, body) = read_back(&path);
        assert_eq!(header.tool_version, TOOL_VERSION);
        assert_eq!(header.num_records, 3);
        assert_eq!(header.max_stack_depth, 4);
        assert_eq!(header.bucket_size, 2);
        assert_eq!(header.num_buckets, 2);
        assert_eq!(header.pid, std::process::id());
        assert!(!header.cmd_line_bytes().is_empty());
        assert_eq!(scan_records(&body, 0, 1).unwrap().count, 3);
    }

    #[test]
    fn test_append_after_close_fails() {
        let dir = TempDir::new().unwrap();
        let mut writer = Writer::create(dir.path().join("t.bin"), 0, 100).unwrap();
        writer.close(true).unwrap();
        let err = writer.append(&records()[0]).unwrap_err();
        assert!(matches!(err, TraceError::WriterClosed));
    }

    #[test]
    fn test_reopen_appends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.bin");
        let mut writer = Writer::create(&path, 0, 100).unwrap();
        assert!(!writer.reopen(true).unwrap());
        writer.append(&records()[0]).unwrap();
        writer.close(true).unwrap();

        assert!(writer.reopen(true).unwrap());
        assert_eq!(writer.header().num_records, 1);
        writer.append(&records()[1]).unwrap();
        writer.append(&records()[2]).unwrap();
        writer.close(true).unwrap();

        let (header, body) = read_back(&path);
        assert_eq!(header.num_records, 3);
        assert_eq!(scan_records(&body, 0, 1).unwrap().count, 3);
    }

    #[test]
    fn test_reopen_without_seek_discards_body() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.bin");
        let mut writer = Writer::create(&path, 0, 100).unwrap();
        for r in &records() {
            writer.append(r).unwrap();
        }
        writer.close(true).unwrap();

        writer.reopen(false).unwrap();
        writer.append(&records()[1]).unwrap();
        writer.close(true).unwrap();

        let (header, body) = read_back(&path);
        assert_eq!(header.num_records, 1);
        assert_eq!(body.len(), crate::record::RECORD_HEADER_LEN);
    }

    #[test]
    fn test_unknown_codec_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.bin");
        let err = Writer::create(&path, 9 * crate::header::CODEC_STRIDE, 100).err();
        assert!(matches!(err, Some(TraceError::UnsupportedCodec { codec: 9, .. })));
        assert!(!path.exists());
    }

    #[cfg(feature = "zlib")]
    #[test]
    fn test_compressed_sessions_concatenate() {
        use crate::compression::{compression_kind, ZLIB_ID};

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.z");
        let mut writer = Writer::create(&path, compression_kind(ZLIB_ID, 0), 100).unwrap();
        writer.append(&records()[0]).unwrap();
        writer.close(true).unwrap();
        writer.reopen(true).unwrap();
        writer.append(&records()[1]).unwrap();
        writer.append(&records()[2]).unwrap();
        drop(writer);

        let (header, body) = read_back(&path);
        assert_eq!(header.codec_id(), ZLIB_ID);
        assert_eq!(header.num_records, 3);
        let scan = scan_records(&body, 0, 1).unwrap();
        assert_eq!(scan.count, 3);
        assert_eq!(scan.max_depth, 4);
    }
}
