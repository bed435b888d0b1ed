//! Frame decoder and event normalizer for ELIADE detector streams.
//!
//! A stream is a sequence of independently framed messages, each holding a
//! batch of digitizer events in one of several record layouts. This crate
//! reads the frames, dispatches each to its layout, and normalizes every event
//! into a single flat record ([`FlatEventRecord`]).
//!
//! # Example
//!
//! ```no_run
//! use eliade_core::{CsvSink, IngestMode, IngestOptions, IngestPipeline, OutputSink};
//!
//! let options = IngestOptions {
//!     mode: IngestMode::BufferedSorted,
//!     ..Default::default()
//! };
//! let mut pipeline = IngestPipeline::new("run042.cap", options).unwrap();
//! let mut sink = CsvSink::create("run042.csv", false).unwrap();
//! let report = pipeline.run(&mut sink).unwrap();
//! sink.close().unwrap();
//!
//! println!("Wrote {} events from {} frames", report.events, report.frames);
//! ```
//!
//! # Features
//!
//! - Two envelope conventions: discriminant-prefixed and tagged-union frames
//! - Eight event layouts driven by one layout table
//! - Streaming or globally time-sorted output
//! - Truncated and corrupt frames reported separately from a clean end of file
//! - CSV, flat binary and in-memory sinks

pub mod decoder;
pub mod encode;
pub mod normalize;
pub mod output;
pub mod pipeline;
pub mod source;
pub mod types;
pub mod wire;

// Re-export commonly used types
pub use decoder::{DecodeError, DecodedFrame, FrameCount, VariantDecoder};
pub use encode::FrameWriter;
pub use normalize::{NormalizeOptions, PsdWaveFineTs, RecordNormalizer};
pub use output::{BinarySink, CsvSink, OutputError, OutputSink, VecSink};
pub use pipeline::{
    read_all, IngestError, IngestMode, IngestOptions, IngestPipeline, IngestReport, PipelineState,
    Termination,
};
pub use source::{Frame, FrameSource};
pub use types::{Envelope, FlatEventRecord, RawEvent, SchemaVariant, VariantCounts};
