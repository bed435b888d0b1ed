//! Variant dispatch for decoded frames.
//!
//! The decoder maps a frame's raw id through the stream's envelope table to a
//! [`SchemaVariant`] and parses the body under that variant's layout. Ids
//! outside the table are not fatal: the frame is logged and yields no events.

use crate::source::Frame;
use crate::types::{Envelope, RawEvent, SchemaVariant, VariantLayout};
use crate::wire::{self, BODY_COUNT_LEN, EVENT_PREFIX_LEN};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors that can occur while reading and decoding frames.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Input file not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("Frame {frame} at offset {offset} is truncated: {reason}")]
    Truncated {
        frame: u64,
        offset: u64,
        reason: String,
    },

    #[error("Frame {frame} at offset {offset} is corrupt: {reason}")]
    Corrupt {
        frame: u64,
        offset: u64,
        reason: String,
    },
}

impl DecodeError {
    /// True for a frame whose bytes are missing or unparseable, as opposed
    /// to an I/O or open failure.
    pub fn is_frame_damage(&self) -> bool {
        matches!(self, Self::Truncated { .. } | Self::Corrupt { .. })
    }
}

/// Events of one decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    /// `None` when the frame's id is not in the envelope table
    pub variant: Option<SchemaVariant>,
    pub events: Vec<RawEvent>,
}

/// Event count of one frame, obtained without materializing events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCount {
    pub variant: Option<SchemaVariant>,
    pub events: u64,
}

/// Stateless frame decoder for one envelope convention.
#[derive(Debug, Clone, Copy)]
pub struct VariantDecoder {
    envelope: Envelope,
}

impl VariantDecoder {
    pub fn new(envelope: Envelope) -> Self {
        Self { envelope }
    }

    pub fn envelope(&self) -> Envelope {
        self.envelope
    }

    /// Resolves the frame's variant, or `None` if the id is unknown.
    #[inline]
    pub fn identify(&self, frame: &Frame) -> Option<SchemaVariant> {
        self.envelope.variant_for(frame.id)
    }

    /// Decodes every event of a frame.
    ///
    /// An unrecognized id logs a warning and returns an empty frame.
    pub fn decode_frame(&self, frame: &Frame) -> Result<DecodedFrame, DecodeError> {
        let variant = match self.identify(frame) {
            Some(variant) => variant,
            None => {
                warn!(
                    frame = frame.index,
                    offset = frame.offset,
                    id = frame.id,
                    envelope = %self.envelope,
                    "unrecognized event variant, frame skipped"
                );
                return Ok(DecodedFrame {
                    variant: None,
                    events: Vec::new(),
                });
            }
        };

        let layout = variant.layout();
        let mut rdr = Cursor::new(frame.payload.as_slice());
        let count = read_event_count(&mut rdr, frame, layout)?;

        let mut events = Vec::with_capacity(count as usize);
        for i in 0..count {
            let event = wire::read_event(&mut rdr, layout)
                .map_err(|e| corrupt(frame, format!("event {} of {}: {}", i, variant, e)))?;
            events.push(event);
        }
        expect_exhausted(&rdr, frame)?;

        debug!(
            frame = frame.index,
            variant = %variant,
            events = events.len(),
            "decoded frame"
        );

        Ok(DecodedFrame {
            variant: Some(variant),
            events,
        })
    }

    /// Counts a frame's events by stepping over them.
    ///
    /// Rejects exactly the frames [`VariantDecoder::decode_frame`] rejects,
    /// so a counting pass and a decoding pass agree on well-formed input.
    pub fn count_frame(&self, frame: &Frame) -> Result<FrameCount, DecodeError> {
        let variant = match self.identify(frame) {
            Some(variant) => variant,
            None => {
                debug!(frame = frame.index, id = frame.id, "unrecognized variant while counting");
                return Ok(FrameCount {
                    variant: None,
                    events: 0,
                });
            }
        };

        let layout = variant.layout();
        let mut rdr = Cursor::new(frame.payload.as_slice());
        let count = read_event_count(&mut rdr, frame, layout)?;
        for i in 0..count {
            wire::skip_event(&mut rdr, layout)
                .map_err(|e| corrupt(frame, format!("event {} of {}: {}", i, variant, e)))?;
        }
        expect_exhausted(&rdr, frame)?;

        Ok(FrameCount {
            variant: Some(variant),
            events: count as u64,
        })
    }
}

fn corrupt(frame: &Frame, reason: String) -> DecodeError {
    DecodeError::Corrupt {
        frame: frame.index,
        offset: frame.offset,
        reason,
    }
}

/// Reads the body's event count and checks it could fit in the payload.
fn read_event_count(
    rdr: &mut Cursor<&[u8]>,
    frame: &Frame,
    layout: VariantLayout,
) -> Result<u32, DecodeError> {
    if frame.payload.len() < BODY_COUNT_LEN {
        return Err(corrupt(frame, "body shorter than its event count".to_string()));
    }
    let count = rdr.read_u32::<LittleEndian>()?;
    let min_event_len = EVENT_PREFIX_LEN + 4 * layout.waveforms as usize;
    if (count as usize).saturating_mul(min_event_len) > wire::remaining(rdr) {
        return Err(corrupt(
            frame,
            format!(
                "event count {} exceeds the {} body bytes available",
                count,
                wire::remaining(rdr)
            ),
        ));
    }
    Ok(count)
}

fn expect_exhausted(rdr: &Cursor<&[u8]>, frame: &Frame) -> Result<(), DecodeError> {
    match wire::remaining(rdr) {
        0 => Ok(()),
        n => Err(corrupt(frame, format!("{} trailing bytes after last event", n))),
    }
}
