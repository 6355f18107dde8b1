//! Error types for trace reading, writing and analysis

use thiserror::Error;

/// Errors raised by the trace format, readers, writer and analysis pass
#[derive(Error, Debug)]
pub enum TraceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt trace file: {0}")]
    Corrupt(String),

    #[error("Invalid magic tag {0:?}")]
    InvalidMagic([u8; 4]),

    #[error("Record index {index} out of range (trace holds {len} records)")]
    OutOfRange { index: usize, len: usize },

    #[error("Compression kind {kind} selects codec {codec}, which is not available in this build")]
    UnsupportedCodec { kind: i32, codec: i32 },

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Writer is closed")]
    WriterClosed,
}

/// Result type for trace operations
pub type Result<T> = std::result::Result<T, TraceError>;

impl TraceError {
    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        TraceError::Corrupt(msg.into())
    }
}
