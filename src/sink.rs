//! Output sinks for enriched records
//!
//! The analysis pass emits one [`EnrichedRecord`] per input record in input
//! order. Sinks decide how they are stored: CSV rows, JSON lines, or an
//! in-memory vector.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::io::Write;

/// An input record plus the features computed for it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EnrichedRecord {
    /// Hook entry (ns)
    pub t0: u64,
    /// Allocator return (ns)
    pub t1: u64,
    /// Hook exit (ns)
    pub t2: u64,
    /// Entry time with capture start and accumulated hook overhead removed
    pub t_corrected: u64,
    pub address: u64,
    #[serde(rename = "AType")]
    pub a_type: u8,
    /// Records within the density half-width of this one, itself excluded
    pub density: u64,
    /// Corrected time until the matching free, -1 if none was found
    pub lifetime: i64,
    /// Address delta to the previous allocation
    pub locality: i64,
    pub size: u64,
    /// Size delta to the previous allocation
    pub variation: i64,
    pub stacks: Vec<u32>,
}

impl EnrichedRecord {
    /// Output column names, in order
    pub const COLUMNS: [&'static str; 12] = [
        "T0",
        "T1",
        "T2",
        "TCorrected",
        "Address",
        "AType",
        "Density",
        "Lifetime",
        "Locality",
        "Size",
        "Variation",
        "Stacks",
    ];

    /// `true` for allocation records
    pub fn is_alloc(&self) -> bool {
        self.a_type != 0
    }
}

/// Destination for the records produced by an analysis pass
pub trait RecordSink {
    fn write(&mut self, record: &EnrichedRecord) -> Result<()>;

    /// Flush anything buffered; called once after the last record
    fn finish(&mut self) -> Result<()>;
}

/// Output format selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Comma-separated values with a header row
    #[default]
    Csv,
    /// One JSON object per line
    Json,
}

/// Build the sink for `format` over `out`
pub fn make_sink<W: Write + 'static>(format: OutputFormat, out: W) -> Box<dyn RecordSink> {
    match format {
        OutputFormat::Csv => Box::new(CsvSink::new(out)),
        OutputFormat::Json => Box::new(JsonLinesSink::new(out)),
    }
}

/// CSV output
///
/// Every field is numeric except `Stacks`, which joins frame ids with `;`, so
/// no quoting is ever needed.
#[derive(Debug)]
pub struct CsvSink<W: Write> {
    out: W,
    header_written: bool,
}

impl<W: Write> CsvSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            header_written: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn format_record(record: &EnrichedRecord) -> String {
        let stacks: Vec<String> = record.stacks.iter().map(|f| f.to_string()).collect();
        let fields = [
            record.t0.to_string(),
            record.t1.to_string(),
            record.t2.to_string(),
            record.t_corrected.to_string(),
            record.address.to_string(),
            record.a_type.to_string(),
            record.density.to_string(),
            record.lifetime.to_string(),
            record.locality.to_string(),
            record.size.to_string(),
            record.variation.to_string(),
            stacks.join(";"),
        ];
        fields.join(",")
    }

    fn write_header(&mut self) -> Result<()> {
        if !self.header_written {
            writeln!(self.out, "{}", EnrichedRecord::COLUMNS.join(","))?;
            self.header_written = true;
        }
        Ok(())
    }
}

impl<W: Write> RecordSink for CsvSink<W> {
    fn write(&mut self, record: &EnrichedRecord) -> Result<()> {
        self.write_header()?;
        writeln!(self.out, "{}", Self::format_record(record))?;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        // An empty trace still gets its header row
        self.write_header()?;
        self.out.flush()?;
        Ok(())
    }
}

/// JSON-lines output, one object per record keyed by column name
#[derive(Debug)]
pub struct JsonLinesSink<W: Write> {
    out: W,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> RecordSink for JsonLinesSink<W> {
    fn write(&mut self, record: &EnrichedRecord) -> Result<()> {
        serde_json::to_writer(&mut self.out, record).map_err(std::io::Error::from)?;
        self.out.write_all(b"\n")?;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

/// Collects records in memory
#[derive(Debug, Default)]
pub struct VecSink {
    pub records: Vec<EnrichedRecord>,
    pub finished: bool,
}

impl VecSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordSink for VecSink {
    fn write(&mut self, record: &EnrichedRecord) -> Result<()> {
        self.records.push(record.clone());
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.finished = true;
        Ok(())
    }
}
