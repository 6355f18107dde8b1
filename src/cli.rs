//! CLI argument parsing for heaptrail

use crate::analysis::AnalysisConfig;
use crate::reader::ReaderOptions;
use crate::sink::OutputFormat;
use clap::Parser;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "heaptrail")]
#[command(version)]
#[command(about = "Enrich allocation traces with corrected time, density and lifetimes", long_about = None)]
pub struct Cli {
    /// Trace file to analyze
    #[arg(short = 'i', long = "input", value_name = "PATH")]
    pub input: Option<PathBuf>,

    /// Trace file to analyze (positional form of --input)
    #[arg(
        value_name = "INPUT",
        conflicts_with = "input",
        required_unless_present = "input"
    )]
    pub input_path: Option<PathBuf>,

    /// Output file (defaults to <input>.out)
    #[arg(short = 'o', long = "output", value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// How far ahead to look for the free matching an allocation
    #[arg(short = 'l', long = "look-ahead-width", value_name = "SECONDS", default_value_t = 200.0)]
    pub look_ahead_width: f64,

    /// Width of the window used for the density column
    #[arg(short = 'd', long = "density-width", value_name = "MICROSECONDS", default_value_t = 1000.0)]
    pub density_width: f64,

    /// Records between index anchors of the indexing reader
    #[arg(short = 'b', long = "bucket-size", value_name = "RECORDS", default_value_t = 100)]
    pub bucket_size: usize,

    /// Queued frees at which scanning beyond the look-ahead stops
    #[arg(short = 'm', long = "map-length", value_name = "ENTRIES", default_value_t = 100_000_000)]
    pub map_length: usize,

    /// Output format
    #[arg(long = "format", value_enum, default_value = "csv")]
    pub format: OutputFormat,

    /// Keep every record offset instead of indexing (uncompressed input only)
    #[arg(long = "direct")]
    pub direct: bool,

    /// Print the trace header and exit
    #[arg(long = "header-only")]
    pub header_only: bool,

    /// Enable debug tracing output to stderr
    #[arg(long = "debug")]
    pub debug: bool,
}

impl Cli {
    /// Input trace, whichever form it was given in
    pub fn input(&self) -> Option<&Path> {
        self.input.as_deref().or(self.input_path.as_deref())
    }

    /// Output path, `<input>.out` when not given
    pub fn output_path(&self) -> Option<PathBuf> {
        if let Some(output) = &self.output {
            return Some(output.clone());
        }
        let mut name = self.input()?.as_os_str().to_owned();
        name.push(".out");
        Some(PathBuf::from(name))
    }

    pub fn analysis_config(&self) -> AnalysisConfig {
        AnalysisConfig {
            lookahead_ns: (self.look_ahead_width.max(0.0) * 1e9) as u64,
            density_width_ns: (self.density_width.max(0.0) * 1e3) as u64,
            table_capacity: self.map_length,
            ..AnalysisConfig::default()
        }
    }

    pub fn reader_options(&self) -> ReaderOptions {
        ReaderOptions {
            indexed: !self.direct,
            period: self.bucket_size,
        }
    }
}
