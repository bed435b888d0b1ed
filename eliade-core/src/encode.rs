//! Frame encoder for producing streams.
//!
//! Writes frames in either envelope so that synthetic runs, fixtures and
//! benchmark inputs share the exact layout the decoder reads.

use crate::output::OutputError;
use crate::types::{Envelope, RawEvent, SchemaVariant};
use crate::wire::{self, BODY_COUNT_LEN, PREFIXED_HEADER_LEN, TAGGED_HEADER_LEN};
use byteorder::{LittleEndian, WriteBytesExt};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Sequential frame writer.
#[derive(Debug)]
pub struct FrameWriter<W: Write> {
    writer: W,
    envelope: Envelope,
    frames_written: u64,
    bytes_written: u64,
}

impl FrameWriter<BufWriter<File>> {
    /// Creates a stream file.
    pub fn create<P: AsRef<Path>>(path: P, envelope: Envelope) -> Result<Self, OutputError> {
        Ok(Self::new(BufWriter::new(File::create(path)?), envelope))
    }
}

impl<W: Write> FrameWriter<W> {
    pub fn new(writer: W, envelope: Envelope) -> Self {
        Self {
            writer,
            envelope,
            frames_written: 0,
            bytes_written: 0,
        }
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Writes one frame holding `events` under `variant`'s layout.
    pub fn write_frame(
        &mut self,
        variant: SchemaVariant,
        events: &[RawEvent],
    ) -> Result<(), OutputError> {
        let id = self.envelope.id_for(variant).ok_or_else(|| {
            OutputError::InvalidFormat(format!(
                "variant {} is not carried by the {} envelope",
                variant, self.envelope
            ))
        })?;
        let layout = variant.layout();
        let count = u32::try_from(events.len())
            .map_err(|_| OutputError::InvalidFormat("too many events in one frame".to_string()))?;
        let body_len = BODY_COUNT_LEN
            + events
                .iter()
                .map(|e| wire::event_len(layout, e))
                .sum::<usize>();

        self.write_header(id, body_len)?;
        self.writer.write_u32::<LittleEndian>(count)?;
        for event in events {
            wire::write_event(&mut self.writer, layout, event)?;
        }
        self.finish_frame(body_len);
        Ok(())
    }

    /// Writes a frame with an arbitrary id and body, bypassing the variant
    /// table.
    pub fn write_raw_frame(&mut self, id: u32, body: &[u8]) -> Result<(), OutputError> {
        self.write_header(id, body.len())?;
        self.writer.write_all(body)?;
        self.finish_frame(body.len());
        Ok(())
    }

    fn write_header(&mut self, id: u32, body_len: usize) -> Result<(), OutputError> {
        let body_len = u32::try_from(body_len)
            .map_err(|_| OutputError::InvalidFormat("frame body exceeds 4 GiB".to_string()))?;
        match self.envelope {
            Envelope::Prefixed => {
                self.writer.write_u32::<LittleEndian>(body_len)?;
                self.writer.write_u32::<LittleEndian>(id)?;
            }
            Envelope::Tagged => {
                let tag = u8::try_from(id).map_err(|_| {
                    OutputError::InvalidFormat(format!("tag {} does not fit in one byte", id))
                })?;
                self.writer.write_u8(tag)?;
                self.writer.write_u32::<LittleEndian>(body_len)?;
            }
        }
        Ok(())
    }

    fn finish_frame(&mut self, body_len: usize) {
        let header_len = match self.envelope {
            Envelope::Prefixed => PREFIXED_HEADER_LEN,
            Envelope::Tagged => TAGGED_HEADER_LEN,
        };
        self.frames_written += 1;
        self.bytes_written += (header_len + body_len) as u64;
    }

    pub fn flush(&mut self) -> Result<(), OutputError> {
        self.writer.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}
