//! Ingest orchestration: streaming and two-pass buffered-sorted modes.
//!
//! ```text
//! Streaming:       Idle -> Reading -> Done
//! BufferedSorted:  Idle -> Counting -> Reading -> Sorting -> Emitting -> Done
//! ```
//!
//! A truncated or corrupt frame ends the frame loop like end-of-stream does,
//! but the run's [`IngestReport`] records it as [`Termination::Corrupt`] and
//! a warning is logged. Only a stream that ends on a frame boundary counts as
//! [`Termination::CleanEof`].

use crate::decoder::{DecodeError, VariantDecoder};
use crate::normalize::{NormalizeOptions, RecordNormalizer};
use crate::output::{OutputError, OutputSink, VecSink};
use crate::source::{Frame, FrameSource, DEFAULT_MAX_FRAME_LEN};
use crate::types::{Envelope, FlatEventRecord, VariantCounts};
use serde::Deserialize;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors that end an ingest run.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Output(#[from] OutputError),

    #[error("Event count changed between passes: counted {counted}, decoded {decoded}")]
    CapacityMismatch { counted: u64, decoded: u64 },

    #[error("Invalid options: {0}")]
    InvalidOptions(String),
}

/// How records reach the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestMode {
    /// Emit in file order, one frame at a time
    #[default]
    Streaming,
    /// Materialize everything, sort by TimeStamp, then emit
    BufferedSorted,
}

impl std::str::FromStr for IngestMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "stream" | "streaming" => Ok(Self::Streaming),
            "sorted" | "buffered" | "buffered_sorted" | "buffered-sorted" => {
                Ok(Self::BufferedSorted)
            }
            other => Err(format!("Unknown mode: {}. Use streaming or sorted", other)),
        }
    }
}

/// Pipeline phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Counting,
    Reading,
    Sorting,
    Emitting,
    Done,
}

/// Why the frame loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// The stream ended on a frame boundary
    CleanEof,
    /// A frame was truncated or unparseable; later frames were not read
    Corrupt {
        frame: u64,
        offset: u64,
        reason: String,
    },
}

/// Outcome of a completed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub mode: IngestMode,
    /// Frames read, recognized or not
    pub frames: u64,
    /// Frames whose variant id was unknown
    pub unrecognized_frames: u64,
    /// Records handed to the sink
    pub events: u64,
    pub counts: VariantCounts,
    pub termination: Termination,
}

impl IngestReport {
    fn new(mode: IngestMode) -> Self {
        Self {
            mode,
            frames: 0,
            unrecognized_frames: 0,
            events: 0,
            counts: VariantCounts::default(),
            termination: Termination::CleanEof,
        }
    }

    /// True when the whole stream was consumed without damage.
    pub fn is_clean(&self) -> bool {
        self.termination == Termination::CleanEof
    }
}

/// Settings for an ingest run.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestOptions {
    pub mode: IngestMode,
    pub envelope: Envelope,
    pub normalize: NormalizeOptions,
    /// Use the data-parallel sort when available
    pub parallel_sort: bool,
    /// Largest frame body accepted
    pub max_frame_len: usize,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            mode: IngestMode::default(),
            envelope: Envelope::default(),
            normalize: NormalizeOptions::default(),
            parallel_sort: true,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl IngestOptions {
    pub fn validate(&self) -> Result<(), IngestError> {
        self.normalize.validate().map_err(IngestError::InvalidOptions)?;
        if self.max_frame_len == 0 {
            return Err(IngestError::InvalidOptions(
                "max_frame_len must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Stable sort by coarse timestamp. Equal stamps keep encounter order.
pub fn sort_by_timestamp(records: &mut [FlatEventRecord], parallel: bool) {
    #[cfg(feature = "parallel")]
    {
        if parallel {
            use rayon::slice::ParallelSliceMut;
            records.par_sort_by_key(|r| r.timestamp);
            return;
        }
    }
    #[cfg(not(feature = "parallel"))]
    let _ = parallel;

    records.sort_by_key(|r| r.timestamp);
}

/// Maps frame damage to a termination; passes other errors through.
fn damage_to_termination(err: DecodeError) -> Result<Termination, IngestError> {
    match err {
        DecodeError::Truncated {
            frame,
            offset,
            reason,
        }
        | DecodeError::Corrupt {
            frame,
            offset,
            reason,
        } => {
            warn!(frame, offset, %reason, "stopping at damaged frame");
            Ok(Termination::Corrupt {
                frame,
                offset,
                reason,
            })
        }
        other => Err(other.into()),
    }
}

/// Drives one input file through decode, normalize and emit.
#[derive(Debug)]
pub struct IngestPipeline {
    path: PathBuf,
    options: IngestOptions,
    decoder: VariantDecoder,
    normalizer: RecordNormalizer,
    state: PipelineState,
}

impl IngestPipeline {
    /// Creates a pipeline for `path`. The file is not opened until `run`.
    pub fn new<P: AsRef<Path>>(path: P, options: IngestOptions) -> Result<Self, IngestError> {
        options.validate()?;
        Ok(Self {
            path: path.as_ref().to_path_buf(),
            decoder: VariantDecoder::new(options.envelope),
            normalizer: RecordNormalizer::new(options.normalize),
            options,
            state: PipelineState::Idle,
        })
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn options(&self) -> &IngestOptions {
        &self.options
    }

    fn open(&self) -> Result<FrameSource<BufReader<File>>, DecodeError> {
        FrameSource::open(&self.path, self.options.envelope)
    }

    /// Opens and closes the input once, surfacing `NotFound` before any
    /// output is created.
    pub fn check_input(&self) -> Result<(), IngestError> {
        self.open()?.close();
        Ok(())
    }

    /// Runs the configured mode to completion, filling `sink`.
    ///
    /// The sink is not closed; that is left to the caller.
    pub fn run<S: OutputSink + ?Sized>(
        &mut self,
        sink: &mut S,
    ) -> Result<IngestReport, IngestError> {
        let path = self.path.clone();
        let envelope = self.options.envelope;
        self.run_with(|| FrameSource::open(&path, envelope), sink)
    }

    /// Like [`IngestPipeline::run`], but each pass reads a source produced
    /// by `open` instead of reopening the configured path.
    pub fn run_with<R, F, S>(
        &mut self,
        mut open: F,
        sink: &mut S,
    ) -> Result<IngestReport, IngestError>
    where
        R: BufRead,
        F: FnMut() -> Result<FrameSource<R>, DecodeError>,
        S: OutputSink + ?Sized,
    {
        self.state = PipelineState::Idle;
        let result = match self.options.mode {
            IngestMode::Streaming => self.run_streaming(&mut open, sink),
            IngestMode::BufferedSorted => self.run_buffered(&mut open, sink),
        };
        self.state = PipelineState::Done;

        if let Ok(report) = &result {
            info!(
                mode = ?report.mode,
                frames = report.frames,
                events = report.events,
                unrecognized = report.unrecognized_frames,
                clean = report.is_clean(),
                "ingest finished"
            );
        }
        result
    }

    /// Reads frames until the stream ends, calling `on_frame` for each.
    fn for_each_frame<R, F>(
        &self,
        source: FrameSource<R>,
        mut on_frame: F,
    ) -> Result<Termination, IngestError>
    where
        R: BufRead,
        F: FnMut(&Frame) -> Result<(), IngestError>,
    {
        let mut source = source.with_max_frame_len(self.options.max_frame_len);
        let termination = loop {
            match source.next_frame() {
                Ok(Some(frame)) => match on_frame(&frame) {
                    Ok(()) => {}
                    Err(IngestError::Decode(err)) if err.is_frame_damage() => {
                        break damage_to_termination(err)?;
                    }
                    Err(err) => return Err(err),
                },
                Ok(None) => break Termination::CleanEof,
                Err(err) => break damage_to_termination(err)?,
            }
        };
        source.close();
        Ok(termination)
    }

    fn run_streaming<R, F, S>(
        &mut self,
        open: &mut F,
        sink: &mut S,
    ) -> Result<IngestReport, IngestError>
    where
        R: BufRead,
        F: FnMut() -> Result<FrameSource<R>, DecodeError>,
        S: OutputSink + ?Sized,
    {
        let mut report = IngestReport::new(IngestMode::Streaming);
        self.state = PipelineState::Reading;

        let decoder = self.decoder;
        let normalizer = self.normalizer;
        let termination = self.for_each_frame(open()?, |frame| {
            let decoded = decoder.decode_frame(frame)?;
            report.frames += 1;
            match decoded.variant {
                Some(variant) => {
                    report.counts.add(variant, decoded.events.len() as u64);
                    for record in normalizer.normalize_all(variant, decoded.events) {
                        sink.fill(&record)?;
                        report.events += 1;
                    }
                }
                None => report.unrecognized_frames += 1,
            }
            Ok(())
        })?;
        report.termination = termination;

        Ok(report)
    }

    /// Counting pass: per-variant event totals without building records.
    pub fn count(&mut self) -> Result<(VariantCounts, Termination), IngestError> {
        let source = self.open()?;
        self.count_source(source)
    }

    fn count_source<R: BufRead>(
        &mut self,
        source: FrameSource<R>,
    ) -> Result<(VariantCounts, Termination), IngestError> {
        self.state = PipelineState::Counting;
        let decoder = self.decoder;
        let mut counts = VariantCounts::default();
        let termination = self.for_each_frame(source, |frame| {
            let counted = decoder.count_frame(frame)?;
            if let Some(variant) = counted.variant {
                counts.add(variant, counted.events);
            }
            Ok(())
        })?;
        debug!(total = counts.total(), "counting pass finished");
        Ok((counts, termination))
    }

    fn run_buffered<R, F, S>(
        &mut self,
        open: &mut F,
        sink: &mut S,
    ) -> Result<IngestReport, IngestError>
    where
        R: BufRead,
        F: FnMut() -> Result<FrameSource<R>, DecodeError>,
        S: OutputSink + ?Sized,
    {
        let mut report = IngestReport::new(IngestMode::BufferedSorted);

        let (counted, _) = self.count_source(open()?)?;
        let capacity = counted.total();

        self.state = PipelineState::Reading;
        let decoder = self.decoder;
        let normalizer = self.normalizer;
        let mut records: Vec<FlatEventRecord> = Vec::with_capacity(capacity as usize);
        let termination = self.for_each_frame(open()?, |frame| {
            let decoded = decoder.decode_frame(frame)?;
            report.frames += 1;
            match decoded.variant {
                Some(variant) => {
                    report.counts.add(variant, decoded.events.len() as u64);
                    records.extend(normalizer.normalize_all(variant, decoded.events));
                }
                None => report.unrecognized_frames += 1,
            }
            Ok(())
        })?;
        report.termination = termination;

        if records.len() as u64 != capacity {
            return Err(IngestError::CapacityMismatch {
                counted: capacity,
                decoded: records.len() as u64,
            });
        }

        self.state = PipelineState::Sorting;
        sort_by_timestamp(&mut records, self.options.parallel_sort);

        self.state = PipelineState::Emitting;
        for record in &records {
            sink.fill(record)?;
            report.events += 1;
        }

        Ok(report)
    }
}

/// Decodes a whole file into memory with the given options.
pub fn read_all<P: AsRef<Path>>(
    path: P,
    options: IngestOptions,
) -> Result<(Vec<FlatEventRecord>, IngestReport), IngestError> {
    let mut pipeline = IngestPipeline::new(path, options)?;
    let mut sink = VecSink::new();
    let report = pipeline.run(&mut sink)?;
    sink.close()?;
    Ok((sink.into_records(), report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::FrameWriter;
    use crate::types::{RawEvent, SchemaVariant};
    use std::io::Cursor;
    use tempfile::NamedTempFile;

    fn plain_stream(frames: &[&[u64]]) -> NamedTempFile {
        let file = NamedTempFile::new().unwrap();
        let mut writer = FrameWriter::new(Vec::new(), Envelope::Prefixed);
        for stamps in frames {
            let events: Vec<_> = stamps
                .iter()
                .enumerate()
                .map(|(i, &t)| RawEvent::new(1, i as u8, t, 100))
                .collect();
            writer.write_frame(SchemaVariant::Plain, &events).unwrap();
        }
        std::fs::write(file.path(), writer.into_inner()).unwrap();
        file
    }

    fn options(mode: IngestMode) -> IngestOptions {
        IngestOptions {
            mode,
            ..Default::default()
        }
    }

    #[test]
    fn test_streaming_keeps_file_order() {
        let file = plain_stream(&[&[50, 10, 30], &[5], &[20, 40]]);
        let (records, report) = read_all(file.path(), options(IngestMode::Streaming)).unwrap();
        let stamps: Vec<u64> = records.iter().map(|r| r.timestamp).collect();
        assert_eq!(stamps, vec![50, 10, 30, 5, 20, 40]);
        assert_eq!(report.frames, 3);
        assert_eq!(report.events, 6);
        assert!(report.is_clean());
    }

    #[test]
    fn test_buffered_sorts_globally() {
        let file = plain_stream(&[&[50, 10, 30], &[5], &[20, 40]]);
        let (records, report) = read_all(file.path(), options(IngestMode::BufferedSorted)).unwrap();
        let stamps: Vec<u64> = records.iter().map(|r| r.timestamp).collect();
        assert_eq!(stamps, vec![5, 10, 20, 30, 40, 50]);
        assert_eq!(report.counts.get(SchemaVariant::Plain), 6);
    }

    #[test]
    fn test_state_transitions() {
        let file = plain_stream(&[&[1]]);
        let mut pipeline =
            IngestPipeline::new(file.path(), options(IngestMode::BufferedSorted)).unwrap();
        assert_eq!(pipeline.state(), PipelineState::Idle);
        let mut sink = VecSink::new();
        pipeline.run(&mut sink).unwrap();
        assert_eq!(pipeline.state(), PipelineState::Done);
    }

    #[test]
    fn test_count_pass() {
        let file = plain_stream(&[&[1, 2], &[3]]);
        let mut pipeline = IngestPipeline::new(file.path(), IngestOptions::default()).unwrap();
        let (counts, termination) = pipeline.count().unwrap();
        assert_eq!(counts.total(), 3);
        assert_eq!(termination, Termination::CleanEof);
    }

    #[test]
    fn test_missing_input() {
        let mut pipeline =
            IngestPipeline::new("/nonexistent/run.cap", IngestOptions::default()).unwrap();
        let mut sink = VecSink::new();
        let err = pipeline.run(&mut sink).unwrap_err();
        assert!(matches!(err, IngestError::Decode(DecodeError::NotFound { .. })));
        assert!(matches!(
            pipeline.check_input(),
            Err(IngestError::Decode(DecodeError::NotFound { .. }))
        ));
    }

    #[test]
    fn test_check_input_existing_file() {
        let file = plain_stream(&[&[1]]);
        let pipeline = IngestPipeline::new(file.path(), IngestOptions::default()).unwrap();
        assert!(pipeline.check_input().is_ok());
    }

    fn plain_bytes(frames: &[&[u64]]) -> Vec<u8> {
        let mut writer = FrameWriter::new(Vec::new(), Envelope::Prefixed);
        for stamps in frames {
            let events: Vec<_> = stamps.iter().map(|&t| RawEvent::new(1, 0, t, 100)).collect();
            writer.write_frame(SchemaVariant::Plain, &events).unwrap();
        }
        writer.into_inner()
    }

    #[test]
    fn test_run_with_reads_given_sources() {
        let bytes = plain_bytes(&[&[9, 3], &[6]]);
        let mut pipeline =
            IngestPipeline::new("unused.cap", options(IngestMode::BufferedSorted)).unwrap();
        let mut sink = VecSink::new();
        let report = pipeline
            .run_with(
                || Ok(FrameSource::from_reader(Cursor::new(bytes.clone()), Envelope::Prefixed)),
                &mut sink,
            )
            .unwrap();
        assert_eq!(report.events, 3);
        let stamps: Vec<u64> = sink.records.iter().map(|r| r.timestamp).collect();
        assert_eq!(stamps, vec![3, 6, 9]);
    }

    #[test]
    fn test_input_growing_between_passes_is_fatal() {
        let first = plain_bytes(&[&[1, 2]]);
        let second = plain_bytes(&[&[1, 2], &[3]]);
        let mut opened = 0;
        let mut pipeline =
            IngestPipeline::new("unused.cap", options(IngestMode::BufferedSorted)).unwrap();
        let mut sink = VecSink::new();

        let err = pipeline
            .run_with(
                || {
                    opened += 1;
                    let bytes = if opened == 1 { first.clone() } else { second.clone() };
                    Ok(FrameSource::from_reader(Cursor::new(bytes), Envelope::Prefixed))
                },
                &mut sink,
            )
            .unwrap_err();

        assert!(matches!(
            err,
            IngestError::CapacityMismatch {
                counted: 2,
                decoded: 3
            }
        ));
        assert!(sink.records.is_empty());
        assert_eq!(opened, 2);
        assert_eq!(pipeline.state(), PipelineState::Done);
    }

    #[test]
    fn test_invalid_options_rejected() {
        let mut opts = IngestOptions::default();
        opts.normalize.fine_ts_scale = 0.0;
        assert!(matches!(
            IngestPipeline::new("unused.cap", opts),
            Err(IngestError::InvalidOptions(_))
        ));
    }

    #[test]
    fn test_stable_sort_keeps_ties() {
        let mut records: Vec<FlatEventRecord> = [(3, 0), (1, 1), (3, 2), (1, 3), (2, 4)]
            .iter()
            .map(|&(t, ch)| FlatEventRecord {
                timestamp: t,
                channel: ch,
                ..Default::default()
            })
            .collect();
        for parallel in [false, true] {
            let mut sorted = records.clone();
            sort_by_timestamp(&mut sorted, parallel);
            let order: Vec<u8> = sorted.iter().map(|r| r.channel).collect();
            assert_eq!(order, vec![1, 3, 4, 0, 2]);
        }
        sort_by_timestamp(&mut records, true);
        let once = records.clone();
        sort_by_timestamp(&mut records, true);
        assert_eq!(records, once);
    }

    #[test]
    fn test_mode_from_str() {
        use std::str::FromStr;
        assert_eq!(IngestMode::from_str("sorted").unwrap(), IngestMode::BufferedSorted);
        assert_eq!(IngestMode::from_str("Streaming").unwrap(), IngestMode::Streaming);
        assert!(IngestMode::from_str("random").is_err());
    }
}
