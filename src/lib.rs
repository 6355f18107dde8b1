//! heaptrail - allocation trace format, readers and lifetime analysis
//!
//! This library provides the binary format written by the allocation hook,
//! interchangeable random-access readers over it (memory-mapped, sparsely
//! indexed, and decompressing), and a single forward pass that enriches every
//! record with overhead-corrected time, local density, address/size deltas and
//! the lifetime of each allocation.

pub mod analysis;
pub mod cli;
pub mod compression;
pub mod error;
pub mod header;
pub mod queue_pool;
pub mod reader;
pub mod record;
pub mod sink;
pub mod writer;

pub use analysis::{AnalysisConfig, AnalysisEngine, AnalysisSummary, UNRESOLVED_LIFETIME};
pub use error::{Result, TraceError};
pub use header::FileHeader;
pub use reader::{open_reader, CompressedReader, DirectReader, IndexingReader, ReaderOptions, TraceReader};
pub use record::{MemRecord, OwnedRecord, RecordView};
pub use sink::{make_sink, CsvSink, EnrichedRecord, JsonLinesSink, OutputFormat, RecordSink, VecSink};
pub use writer::Writer;
