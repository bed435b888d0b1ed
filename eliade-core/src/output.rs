//! Output sinks for normalized event records.
//!
//! The pipeline hands every [`FlatEventRecord`] to an [`OutputSink`]. This
//! module provides CSV, flat binary and in-memory sinks.

use crate::types::FlatEventRecord;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use thiserror::Error;

/// Errors that can occur during output writing.
#[derive(Error, Debug)]
pub enum OutputError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Sink already closed")]
    Closed,
}

/// Destination of normalized records.
///
/// `close` finalizes persisted state. It must succeed when no record was
/// filled and must be harmless when called twice.
pub trait OutputSink {
    fn fill(&mut self, record: &FlatEventRecord) -> Result<(), OutputError>;

    fn close(&mut self) -> Result<(), OutputError>;
}

impl<S: OutputSink + ?Sized> OutputSink for &mut S {
    fn fill(&mut self, record: &FlatEventRecord) -> Result<(), OutputError> {
        (**self).fill(record)
    }

    fn close(&mut self) -> Result<(), OutputError> {
        (**self).close()
    }
}

impl<S: OutputSink + ?Sized> OutputSink for Box<S> {
    fn fill(&mut self, record: &FlatEventRecord) -> Result<(), OutputError> {
        (**self).fill(record)
    }

    fn close(&mut self) -> Result<(), OutputError> {
        (**self).close()
    }
}

/// Collects records in memory.
#[derive(Debug, Default)]
pub struct VecSink {
    pub records: Vec<FlatEventRecord>,
    closed: bool,
}

impl VecSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn into_records(self) -> Vec<FlatEventRecord> {
        self.records
    }
}

impl OutputSink for VecSink {
    fn fill(&mut self, record: &FlatEventRecord) -> Result<(), OutputError> {
        if self.closed {
            return Err(OutputError::Closed);
        }
        self.records.push(record.clone());
        Ok(())
    }

    fn close(&mut self) -> Result<(), OutputError> {
        self.closed = true;
        Ok(())
    }
}

/// Column header of the CSV sink.
pub const CSV_HEADER: &str = "Mod,Ch,TimeStamp,FineTS,ChargeLong,ChargeShort,Extras,RecordLength";

/// CSV output, one line per record.
///
/// With traces enabled two extra columns carry the samples joined by `;`.
pub struct CsvSink<W: Write> {
    writer: BufWriter<W>,
    with_traces: bool,
    header_written: bool,
    closed: bool,
}

impl CsvSink<File> {
    /// Creates a CSV file sink.
    pub fn create<P: AsRef<Path>>(path: P, with_traces: bool) -> Result<Self, OutputError> {
        Ok(Self::new(File::create(path)?, with_traces))
    }
}

impl<W: Write> CsvSink<W> {
    pub fn new(writer: W, with_traces: bool) -> Self {
        Self {
            writer: BufWriter::new(writer),
            with_traces,
            header_written: false,
            closed: false,
        }
    }

    fn write_header(&mut self) -> Result<(), OutputError> {
        if self.with_traces {
            writeln!(self.writer, "{},Trace1,Trace2", CSV_HEADER)?;
        } else {
            writeln!(self.writer, "{}", CSV_HEADER)?;
        }
        self.header_written = true;
        Ok(())
    }

    fn write_trace(&mut self, samples: &[u16]) -> Result<(), OutputError> {
        for (i, sample) in samples.iter().enumerate() {
            if i > 0 {
                self.writer.write_all(b";")?;
            }
            write!(self.writer, "{}", sample)?;
        }
        Ok(())
    }

    /// Consumes the sink and returns the inner writer.
    pub fn into_inner(mut self) -> Result<W, OutputError> {
        self.close()?;
        self.writer
            .into_inner()
            .map_err(|e| OutputError::Io(e.into_error()))
    }
}

impl<W: Write> OutputSink for CsvSink<W> {
    fn fill(&mut self, record: &FlatEventRecord) -> Result<(), OutputError> {
        if self.closed {
            return Err(OutputError::Closed);
        }
        if !self.header_written {
            self.write_header()?;
        }
        write!(
            self.writer,
            "{},{},{},{},{},{},{},{}",
            record.module,
            record.channel,
            record.timestamp,
            record.fine_ts,
            record.charge_long,
            record.charge_short,
            record.extras,
            record.record_length
        )?;
        if self.with_traces {
            self.writer.write_all(b",")?;
            self.write_trace(&record.trace1)?;
            self.writer.write_all(b",")?;
            self.write_trace(&record.trace2)?;
        }
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), OutputError> {
        if self.closed {
            return Ok(());
        }
        if !self.header_written {
            self.write_header()?;
        }
        self.writer.flush()?;
        self.closed = true;
        Ok(())
    }
}

/// Magic number opening a binary record file.
pub const BINARY_MAGIC: &[u8; 8] = b"ELIBIN\0\0";
/// Current binary record file version.
pub const BINARY_VERSION: u32 = 1;
// magic + version
const COUNT_OFFSET: u64 = 12;

/// Flat binary output.
///
/// Layout, all little-endian:
/// - header: magic (8 bytes), version u32, record count u64
/// - per record: Mod u8, Ch u8, TimeStamp u64, FineTS f64, ChargeLong u16,
///   ChargeShort u16, Extras u32, RecordLength u32, then RecordLength
///   samples of Trace1 followed by RecordLength samples of Trace2
///
/// The record count is written as zero up front and patched on close.
pub struct BinarySink<W: Write + Seek> {
    writer: BufWriter<W>,
    count: u64,
    closed: bool,
}

impl BinarySink<File> {
    /// Creates a binary file sink.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, OutputError> {
        Self::new(File::create(path)?)
    }
}

impl<W: Write + Seek> BinarySink<W> {
    /// Writes the header and returns the sink.
    pub fn new(writer: W) -> Result<Self, OutputError> {
        let mut writer = BufWriter::new(writer);
        writer.write_all(BINARY_MAGIC)?;
        writer.write_u32::<LittleEndian>(BINARY_VERSION)?;
        writer.write_u64::<LittleEndian>(0)?;
        Ok(Self {
            writer,
            count: 0,
            closed: false,
        })
    }

    pub fn records_written(&self) -> u64 {
        self.count
    }

    /// Consumes the sink and returns the inner writer.
    pub fn into_inner(mut self) -> Result<W, OutputError> {
        self.close()?;
        self.writer
            .into_inner()
            .map_err(|e| OutputError::Io(e.into_error()))
    }
}

impl<W: Write + Seek> OutputSink for BinarySink<W> {
    fn fill(&mut self, record: &FlatEventRecord) -> Result<(), OutputError> {
        if self.closed {
            return Err(OutputError::Closed);
        }
        if !record.traces_consistent() {
            return Err(OutputError::InvalidFormat(format!(
                "trace lengths {}/{} disagree with RecordLength {}",
                record.trace1.len(),
                record.trace2.len(),
                record.record_length
            )));
        }
        let w = &mut self.writer;
        w.write_u8(record.module)?;
        w.write_u8(record.channel)?;
        w.write_u64::<LittleEndian>(record.timestamp)?;
        w.write_f64::<LittleEndian>(record.fine_ts)?;
        w.write_u16::<LittleEndian>(record.charge_long)?;
        w.write_u16::<LittleEndian>(record.charge_short)?;
        w.write_u32::<LittleEndian>(record.extras)?;
        w.write_u32::<LittleEndian>(record.record_length)?;
        for &sample in record.trace1.iter().chain(record.trace2.iter()) {
            w.write_u16::<LittleEndian>(sample)?;
        }
        self.count += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<(), OutputError> {
        if self.closed {
            return Ok(());
        }
        self.writer.seek(SeekFrom::Start(COUNT_OFFSET))?;
        self.writer.write_u64::<LittleEndian>(self.count)?;
        self.writer.seek(SeekFrom::End(0))?;
        self.writer.flush()?;
        self.closed = true;
        Ok(())
    }
}

/// Reads a file written by [`BinarySink`].
pub fn read_binary<R: Read>(mut reader: R) -> Result<Vec<FlatEventRecord>, OutputError> {
    let mut magic = [0u8; 8];
    reader.read_exact(&mut magic)?;
    if &magic != BINARY_MAGIC {
        return Err(OutputError::InvalidFormat("bad magic number".to_string()));
    }
    let version = reader.read_u32::<LittleEndian>()?;
    if version != BINARY_VERSION {
        return Err(OutputError::InvalidFormat(format!(
            "unsupported version {}",
            version
        )));
    }
    let count = reader.read_u64::<LittleEndian>()?;

    let mut records = Vec::new();
    for _ in 0..count {
        let mut record = FlatEventRecord {
            module: reader.read_u8()?,
            channel: reader.read_u8()?,
            timestamp: reader.read_u64::<LittleEndian>()?,
            fine_ts: reader.read_f64::<LittleEndian>()?,
            charge_long: reader.read_u16::<LittleEndian>()?,
            charge_short: reader.read_u16::<LittleEndian>()?,
            extras: reader.read_u32::<LittleEndian>()?,
            record_length: reader.read_u32::<LittleEndian>()?,
            ..Default::default()
        };
        let len = record.record_length as usize;
        record.trace1 = vec![0; len];
        reader.read_u16_into::<LittleEndian>(&mut record.trace1)?;
        record.trace2 = vec![0; len];
        reader.read_u16_into::<LittleEndian>(&mut record.trace2)?;
        records.push(record);
    }
    Ok(records)
}

/// Writes records to a CSV file.
pub fn write_csv<P: AsRef<Path>>(
    path: P,
    records: &[FlatEventRecord],
    with_traces: bool,
) -> Result<(), OutputError> {
    let mut sink = CsvSink::create(path, with_traces)?;
    for record in records {
        sink.fill(record)?;
    }
    sink.close()
}

/// Writes records to a binary file.
pub fn write_binary<P: AsRef<Path>>(
    path: P,
    records: &[FlatEventRecord],
) -> Result<(), OutputError> {
    let mut sink = BinarySink::create(path)?;
    for record in records {
        sink.fill(record)?;
    }
    sink.close()
}
