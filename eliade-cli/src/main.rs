//! ELIADE frame stream converter.
//!
//! Decodes detector frame streams into flat CSV or binary event files.

mod config;

use anyhow::{Context, Result};
use clap::Parser;
use config::{Config, ConversionConfig};
use eliade_core::{
    BinarySink, CsvSink, Envelope, FlatEventRecord, IngestMode, IngestOptions, IngestPipeline,
    IngestReport, OutputError, OutputSink, PsdWaveFineTs, Termination,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::Instant;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Records between two progress updates.
const PROGRESS_INTERVAL: u64 = 100_000;

/// Converter for ELIADE digitizer frame streams.
///
/// Reads a framed event stream and writes one flat record per event, either in
/// file order or globally sorted by timestamp.
#[derive(Parser, Debug)]
#[command(name = "eliade-convert")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input frame stream
    #[arg(value_name = "INPUT")]
    input: PathBuf,

    /// Output file path (.csv, .bin)
    ///
    /// The output format is determined by the file extension:
    /// - .csv: Comma-separated values (human-readable)
    /// - .bin: Flat binary records
    #[arg(value_name = "OUTPUT")]
    output: PathBuf,

    /// Frame envelope: prefixed or tagged
    #[arg(short, long)]
    envelope: Option<Envelope>,

    /// Ingest mode: streaming or sorted
    #[arg(short, long)]
    mode: Option<IngestMode>,

    /// TOML configuration file; flags override its values
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Factor applied to TimeStamp when deriving FineTS
    #[arg(long, value_name = "FACTOR")]
    fine_ts_scale: Option<f64>,

    /// Store the PsdWave discrimination ratio in FineTS
    #[arg(long)]
    legacy_psd_wave: bool,

    /// Carry Cross trigger flags into Extras
    #[arg(long)]
    cross_flags: bool,

    /// Write waveform columns to CSV output
    #[arg(long)]
    traces: bool,

    /// Sort on a single thread
    #[arg(long)]
    sequential_sort: bool,

    /// Exit with an error when the stream ends inside a damaged frame
    #[arg(long)]
    strict: bool,

    /// Suppress progress output
    #[arg(short, long)]
    quiet: bool,
}

/// Resolved run settings: config file first, then flags.
fn resolve_options(args: &Args, file: &ConversionConfig) -> (IngestOptions, bool) {
    let mut options = IngestOptions::default();
    file.apply(&mut options);

    if let Some(envelope) = args.envelope {
        options.envelope = envelope;
    }
    if let Some(mode) = args.mode {
        options.mode = mode;
    }
    if let Some(scale) = args.fine_ts_scale {
        options.normalize.fine_ts_scale = scale;
    }
    if args.legacy_psd_wave {
        options.normalize.psd_wave_fine_ts = PsdWaveFineTs::LegacyPsd;
    }
    if args.cross_flags {
        options.normalize.cross_flags_in_extras = true;
    }
    if args.sequential_sort {
        options.parallel_sort = false;
    }

    let traces = args.traces || file.csv_traces.unwrap_or(false);
    (options, traces)
}

fn init_logging(quiet: bool) {
    let default = if quiet { "warn" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Sink wrapper that reports progress on a spinner.
struct ProgressSink<'a, S: OutputSink> {
    inner: S,
    progress: &'a ProgressBar,
    written: u64,
}

impl<S: OutputSink> OutputSink for ProgressSink<'_, S> {
    fn fill(&mut self, record: &FlatEventRecord) -> Result<(), OutputError> {
        self.inner.fill(record)?;
        self.written += 1;
        if self.written % PROGRESS_INTERVAL == 0 {
            self.progress.set_message(format!("Wrote {} events...", self.written));
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), OutputError> {
        self.inner.close()
    }
}

fn open_sink(args: &Args, traces: bool) -> Result<Box<dyn OutputSink>> {
    let output_ext = args
        .output
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("csv");

    let sink: Box<dyn OutputSink> = match output_ext.to_lowercase().as_str() {
        "csv" => Box::new(
            CsvSink::create(&args.output, traces).context("Failed to create CSV output")?,
        ),
        "bin" => Box::new(
            BinarySink::create(&args.output).context("Failed to create binary output")?,
        ),
        _ => {
            anyhow::bail!(
                "Unsupported output format: .{}. Use .csv or .bin",
                output_ext
            );
        }
    };
    Ok(sink)
}

/// Runs one conversion. The sink is closed whether or not the run succeeds.
fn convert(args: &Args, progress: &ProgressBar) -> Result<IngestReport> {
    let file_config = match &args.config {
        Some(path) => {
            let config = Config::from_file(path)?;
            info!(path = %path.display(), "loaded configuration");
            config.conversion
        }
        None => ConversionConfig::default(),
    };
    let (options, traces) = resolve_options(args, &file_config);

    let mut pipeline =
        IngestPipeline::new(&args.input, options).context("Invalid conversion settings")?;
    // The input must open before the output file is created or truncated.
    pipeline
        .check_input()
        .with_context(|| format!("Cannot read input {}", args.input.display()))?;
    let mut sink = ProgressSink {
        inner: open_sink(args, traces)?,
        progress,
        written: 0,
    };

    progress.set_message(format!(
        "Decoding {:?}...",
        args.input.file_name().unwrap_or_default()
    ));
    let run = pipeline.run(&mut sink);
    let closed = sink.close();

    let report = run.with_context(|| format!("Failed to convert {}", args.input.display()))?;
    closed.context("Failed to finalize output")?;

    if args.strict {
        if let Termination::Corrupt {
            frame,
            offset,
            reason,
        } = &report.termination
        {
            anyhow::bail!(
                "Stream damaged at frame {} (byte {}): {}",
                frame,
                offset,
                reason
            );
        }
    }
    Ok(report)
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.quiet);

    // Setup progress bar
    let progress = if args.quiet {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .context("Invalid progress template")?,
        );
        pb.set_message("Starting...");
        pb
    };

    let start_time = Instant::now();
    let report = convert(&args, &progress)?;
    let total_duration = start_time.elapsed();

    progress.finish_with_message(format!(
        "Done! Wrote {} events from {} frames in {:.2}s",
        report.events,
        report.frames,
        total_duration.as_secs_f64()
    ));

    if !args.quiet {
        let events_per_sec = report.events as f64 / total_duration.as_secs_f64();
        eprintln!();
        eprintln!("Summary:");
        eprintln!("  Input:        {:?}", args.input);
        eprintln!("  Output:       {:?}", args.output);
        eprintln!("  Mode:         {:?}", report.mode);
        eprintln!("  Frames:       {}", report.frames);
        eprintln!("  Unrecognized: {}", report.unrecognized_frames);
        eprintln!("  Events:       {}", report.events);
        for (variant, events) in report.counts.iter() {
            eprintln!("    {:<10} {}", variant.name(), events);
        }
        match &report.termination {
            Termination::CleanEof => eprintln!("  End:          clean"),
            Termination::Corrupt { frame, reason, .. } => {
                eprintln!("  End:          damaged at frame {} ({})", frame, reason)
            }
        }
        eprintln!("  Duration:     {:.3}s", total_duration.as_secs_f64());
        eprintln!("  Throughput:   {:.0} events/s", events_per_sec);
    }

    Ok(())
}
