use anyhow::{Context, Result};
use clap::Parser;
use heaptrail::{cli::Cli, make_sink, open_reader, AnalysisEngine, FileHeader};
use std::fs::File;
use std::io::BufWriter;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber on stderr
fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.debug);

    let input = args
        .input()
        .context("No input trace given. Usage: heaptrail -i TRACE [-o OUTPUT]")?;

    if args.header_only {
        let mut file =
            File::open(input).with_context(|| format!("Failed to open {}", input.display()))?;
        let header = FileHeader::read_from(&mut file, false)
            .with_context(|| format!("Failed to read header of {}", input.display()))?;
        print!("{header}");
        return Ok(());
    }

    let reader = open_reader(input, &args.reader_options())
        .with_context(|| format!("Failed to open trace {}", input.display()))?;
    tracing::debug!("Trace header:\n{}", reader.header());

    let output = args
        .output_path()
        .context("Cannot derive an output path from the input")?;
    let file = File::create(&output)
        .with_context(|| format!("Failed to create output file {}", output.display()))?;
    let mut sink = make_sink(args.format, BufWriter::new(file));

    let summary = AnalysisEngine::new(args.analysis_config())
        .run(reader.as_ref(), sink.as_mut())
        .with_context(|| format!("Analysis of {} failed", input.display()))?;

    eprint!("{summary}");
    eprintln!("Output written to {}", output.display());
    Ok(())
}
