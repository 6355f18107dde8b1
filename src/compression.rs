//! Pluggable codecs for the record body
//!
//! The header's compression field selects a codec by id
//! (`compression / CODEC_STRIDE`); the remainder carries the codec level.
//! Compressed files keep the header uncompressed and hold one or more
//! concatenated codec streams after it, one per writer session.

use crate::error::{Result, TraceError};
use crate::header::CODEC_STRIDE;
use std::fmt;
use std::io::Write;

/// Codec id for uncompressed bodies
pub const NONE_ID: i32 = 0;
/// Codec id for zlib bodies
pub const ZLIB_ID: i32 = 1;
/// Codec id for zstd bodies
pub const ZSTD_ID: i32 = 2;

/// Header compression field for `codec_id` at `level`
pub fn compression_kind(codec_id: i32, level: i32) -> i32 {
    codec_id * CODEC_STRIDE + level
}

/// Streaming compressor wrapped around the writer's file handle
pub trait BodyEncoder: Write {
    /// Terminate the stream and flush it to the underlying writer
    fn finish(self: Box<Self>) -> Result<()>;
}

/// A body codec
pub trait Codec: fmt::Debug + Send + Sync {
    /// Id stored in the header's compression field
    fn id(&self) -> i32;

    fn name(&self) -> &'static str;

    /// Start a new stream writing into `sink`; `level` 0 selects the default
    fn encoder(&self, sink: Box<dyn Write>, level: i32) -> Result<Box<dyn BodyEncoder>>;

    /// Decode every concatenated stream in `data`
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

// --- No Compression (Pass-through) ---

#[derive(Debug, Clone, Copy)]
pub struct NoCompression;

struct PassThrough(Box<dyn Write>);

impl Write for PassThrough {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.flush()
    }
}

impl BodyEncoder for PassThrough {
    fn finish(mut self: Box<Self>) -> Result<()> {
        self.0.flush()?;
        Ok(())
    }
}

impl Codec for NoCompression {
    fn id(&self) -> i32 {
        NONE_ID
    }

    fn name(&self) -> &'static str {
        "none"
    }

    fn encoder(&self, sink: Box<dyn Write>, _level: i32) -> Result<Box<dyn BodyEncoder>> {
        Ok(Box::new(PassThrough(sink)))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

// --- zlib ---

#[cfg(feature = "zlib")]
#[derive(Debug, Clone, Copy)]
pub struct ZlibCodec;

#[cfg(feature = "zlib")]
impl BodyEncoder for flate2::write::ZlibEncoder<Box<dyn Write>> {
    fn finish(self: Box<Self>) -> Result<()> {
        let mut inner = flate2::write::ZlibEncoder::finish(*self)?;
        inner.flush()?;
        Ok(())
    }
}

#[cfg(feature = "zlib")]
impl Codec for ZlibCodec {
    fn id(&self) -> i32 {
        ZLIB_ID
    }

    fn name(&self) -> &'static str {
        "zlib"
    }

    fn encoder(&self, sink: Box<dyn Write>, level: i32) -> Result<Box<dyn BodyEncoder>> {
        let level = match level {
            0 => flate2::Compression::default(),
            l => flate2::Compression::new(l.clamp(1, 9) as u32),
        };
        Ok(Box::new(flate2::write::ZlibEncoder::new(sink, level)))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        use std::io::Read;

        let mut out = Vec::new();
        let mut rest = data;
        while !rest.is_empty() {
            let mut decoder = flate2::bufread::ZlibDecoder::new(rest);
            decoder
                .read_to_end(&mut out)
                .map_err(|e| TraceError::Compression(format!("zlib: {e}")))?;
            let used = decoder.total_in() as usize;
            if used == 0 || used > rest.len() {
                return Err(TraceError::Compression(
                    "zlib: stream made no progress".to_string(),
                ));
            }
            rest = &rest[used..];
        }
        Ok(out)
    }
}

// --- zstd ---

#[cfg(feature = "zstd")]
#[derive(Debug, Clone, Copy)]
pub struct ZstdCodec;

#[cfg(feature = "zstd")]
impl BodyEncoder for zstd::stream::write::Encoder<'static, Box<dyn Write>> {
    fn finish(self: Box<Self>) -> Result<()> {
        let mut inner = zstd::stream::write::Encoder::finish(*self)?;
        inner.flush()?;
        Ok(())
    }
}

#[cfg(feature = "zstd")]
impl Codec for ZstdCodec {
    fn id(&self) -> i32 {
        ZSTD_ID
    }

    fn name(&self) -> &'static str {
        "zstd"
    }

    fn encoder(&self, sink: Box<dyn Write>, level: i32) -> Result<Box<dyn BodyEncoder>> {
        let encoder = zstd::stream::write::Encoder::new(sink, level)?;
        Ok(Box::new(encoder))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        zstd::stream::decode_all(data).map_err(|e| TraceError::Compression(format!("zstd: {e}")))
    }
}

// --- REGISTRY ---

/// Maps codec ids found in trace headers to implementations
#[derive(Debug)]
pub struct CodecRegistry {
    codecs: Vec<Box<dyn Codec>>,
}

impl CodecRegistry {
    /// Registry holding every codec compiled into this build
    pub fn new() -> Self {
        let mut reg = Self { codecs: Vec::new() };
        reg.register(Box::new(NoCompression));

        #[cfg(feature = "zlib")]
        reg.register(Box::new(ZlibCodec));

        #[cfg(feature = "zstd")]
        reg.register(Box::new(ZstdCodec));

        reg
    }

    /// Add a codec, replacing any codec with the same id
    pub fn register(&mut self, codec: Box<dyn Codec>) {
        self.codecs.retain(|c| c.id() != codec.id());
        self.codecs.push(codec);
    }

    pub fn get(&self, id: i32) -> Option<&dyn Codec> {
        self.codecs
            .iter()
            .find(|c| c.id() == id)
            .map(|c| c.as_ref())
    }

    /// Resolve a header compression field into a codec and its level
    ///
    /// # Errors
    /// [`TraceError::UnsupportedCodec`] when the codec is unknown or was not
    /// compiled in.
    pub fn for_kind(&self, kind: i32) -> Result<(&dyn Codec, i32)> {
        let id = kind / CODEC_STRIDE;
        let level = kind % CODEC_STRIDE;
        self.get(id)
            .map(|codec| (codec, level))
            .ok_or(TraceError::UnsupportedCodec { kind, codec: id })
    }

    /// Names of the registered codecs
    pub fn names(&self) -> Vec<&'static str> {
        self.codecs.iter().map(|c| c.name()).collect()
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Write sink whose contents stay inspectable after the encoder owns it
    #[derive(Clone, Default)]
    struct Shared(Rc<RefCell<Vec<u8>>>);

    impl Write for Shared {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn encode(codec: &dyn Codec, level: i32, sessions: &[&[u8]]) -> Vec<u8> {
        let out = Shared::default();
        for chunk in sessions {
            let mut enc = codec.encoder(Box::new(out.clone()), level).unwrap();
            enc.write_all(chunk).unwrap();
            enc.finish().unwrap();
        }
        let bytes = out.0.borrow().clone();
        bytes
    }

    #[test]
    fn test_kind_encoding() {
        assert_eq!(compression_kind(ZLIB_ID, 6), 10_000_006);
        let reg = CodecRegistry::new();
        let (codec, level) = reg.for_kind(0).unwrap();
        assert_eq!(codec.name(), "none");
        assert_eq!(level, 0);
    }

    #[test]
    fn test_unknown_codec() {
        let reg = CodecRegistry::new();
        let err = reg.for_kind(compression_kind(7, 0)).unwrap_err();
        assert!(matches!(
            err,
            TraceError::UnsupportedCodec { kind: 70_000_000, codec: 7 }
        ));
    }

    #[test]
    fn test_passthrough() {
        let data = encode(&NoCompression, 0, &[&b"abc"[..], &b"def"[..]]);
        assert_eq!(NoCompression.decompress(&data).unwrap(), b"abcdef");
    }

    #[cfg(feature = "zlib")]
    #[test]
    fn test_zlib_concatenated_streams() {
        let first = vec![7u8; 4096];
        let second: Vec<u8> = (0..=255).collect();
        let data = encode(&ZlibCodec, 0, &[first.as_slice(), second.as_slice()]);
        assert!(data.len() < first.len());

        let mut expected = first.clone();
        expected.extend_from_slice(&second);
        assert_eq!(ZlibCodec.decompress(&data).unwrap(), expected);
    }

    #[cfg(feature = "zlib")]
    #[test]
    fn test_zlib_garbage_fails() {
        let err = ZlibCodec.decompress(b"definitely not zlib").unwrap_err();
        assert!(matches!(err, TraceError::Compression(_)));
    }

    #[cfg(feature = "zstd")]
    #[test]
    fn test_zstd_concatenated_streams() {
        let first = vec![1u8; 10_000];
        let second = vec![2u8; 10];
        let data = encode(&ZstdCodec, 3, &[first.as_slice(), second.as_slice()]);

        let mut expected = first.clone();
        expected.extend_from_slice(&second);
        assert_eq!(ZstdCodec.decompress(&data).unwrap(), expected);
    }

    #[test]
    fn test_registry_lists_builtin_codecs() {
        let names = CodecRegistry::new().names();
        assert!(names.contains(&"none"));
        #[cfg(feature = "zlib")]
        assert!(names.contains(&"zlib"));
        #[cfg(feature = "zstd")]
        assert!(names.contains(&"zstd"));
    }
}
