//! Sequential frame reader.
//!
//! A [`FrameSource`] owns its reader exclusively and hands out one [`Frame`]
//! at a time, in file order. There is no index: the only way to learn how
//! many frames a stream holds is to read it to the end.

use crate::decoder::DecodeError;
use crate::types::Envelope;
use crate::wire::{PREFIXED_HEADER_LEN, TAGGED_HEADER_LEN};
use byteorder::{LittleEndian, ReadBytesExt};
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;

/// Read buffer size for file-backed sources.
const READ_BUFFER_SIZE: usize = 1 << 20;

/// Largest frame body accepted by default (256 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

/// One undecoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Zero-based ordinal in the stream
    pub index: u64,
    /// Byte offset of the frame's first header byte
    pub offset: u64,
    /// Raw discriminant (prefixed) or union tag (tagged)
    pub id: u32,
    /// Body bytes: `event_count u32` followed by the events
    pub payload: Vec<u8>,
}

/// Sequential reader of frames in one envelope convention.
#[derive(Debug)]
pub struct FrameSource<R> {
    reader: Option<R>,
    envelope: Envelope,
    position: u64,
    frames_read: u64,
    max_frame_len: usize,
}

impl FrameSource<BufReader<File>> {
    /// Opens a stream file.
    ///
    /// A missing file is reported as [`DecodeError::NotFound`]; other open
    /// failures surface as [`DecodeError::Io`].
    pub fn open<P: AsRef<Path>>(path: P, envelope: Envelope) -> Result<Self, DecodeError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => DecodeError::NotFound {
                path: path.to_path_buf(),
            },
            _ => DecodeError::Io(e),
        })?;
        Ok(Self::from_reader(
            BufReader::with_capacity(READ_BUFFER_SIZE, file),
            envelope,
        ))
    }
}

impl<R: BufRead> FrameSource<R> {
    /// Wraps an already-open buffered reader.
    pub fn from_reader(reader: R, envelope: Envelope) -> Self {
        Self {
            reader: Some(reader),
            envelope,
            position: 0,
            frames_read: 0,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    /// Sets the largest body length accepted before a frame is treated as
    /// corrupt.
    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    pub fn envelope(&self) -> Envelope {
        self.envelope
    }

    /// Byte offset of the next unread byte.
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    /// Returns true if at least one more byte is buffered or readable.
    ///
    /// Peeks without consuming. Read errors report `false` here; the next
    /// call to [`FrameSource::next_frame`] surfaces them.
    pub fn has_more(&mut self) -> bool {
        match self.reader.as_mut() {
            Some(reader) => matches!(reader.fill_buf(), Ok(buf) if !buf.is_empty()),
            None => false,
        }
    }

    /// Releases the underlying reader. Safe to call more than once.
    pub fn close(&mut self) {
        self.reader = None;
    }

    pub fn is_closed(&self) -> bool {
        self.reader.is_none()
    }

    /// Reads the next frame.
    ///
    /// Returns `Ok(None)` only when the stream ends exactly on a frame
    /// boundary. A stream that stops inside a header or body yields
    /// [`DecodeError::Truncated`]. Any error closes the source.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, DecodeError> {
        let result = self.read_frame();
        if result.is_err() {
            self.close();
        }
        result
    }

    fn read_frame(&mut self) -> Result<Option<Frame>, DecodeError> {
        let index = self.frames_read;
        let offset = self.position;
        let envelope = self.envelope;
        let max_frame_len = self.max_frame_len;

        let reader = match self.reader.as_mut() {
            Some(reader) => reader,
            None => return Ok(None),
        };

        if reader.fill_buf()?.is_empty() {
            return Ok(None);
        }

        let (id, body_len, header_len) = match envelope {
            Envelope::Prefixed => {
                let mut header = [0u8; PREFIXED_HEADER_LEN];
                fill_exact(reader, &mut header, index, offset, "frame header")?;
                let mut fields = &header[..];
                let body_len = fields.read_u32::<LittleEndian>()?;
                let discriminant = fields.read_u32::<LittleEndian>()?;
                (discriminant, body_len as usize, PREFIXED_HEADER_LEN)
            }
            Envelope::Tagged => {
                let mut header = [0u8; TAGGED_HEADER_LEN];
                fill_exact(reader, &mut header, index, offset, "frame header")?;
                let mut fields = &header[..];
                let tag = fields.read_u8()?;
                let body_len = fields.read_u32::<LittleEndian>()?;
                (tag as u32, body_len as usize, TAGGED_HEADER_LEN)
            }
        };

        if body_len > max_frame_len {
            return Err(DecodeError::Corrupt {
                frame: index,
                offset,
                reason: format!(
                    "declared body length {} exceeds limit {}",
                    body_len, max_frame_len
                ),
            });
        }

        let mut payload = vec![0u8; body_len];
        fill_exact(reader, &mut payload, index, offset, "frame body")?;

        self.position += (header_len + body_len) as u64;
        self.frames_read += 1;

        Ok(Some(Frame {
            index,
            offset,
            id,
            payload,
        }))
    }
}

impl<R: BufRead> Iterator for FrameSource<R> {
    type Item = Result<Frame, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_frame().transpose()
    }
}

/// `read_exact` that reports a short read as a truncated frame.
fn fill_exact<R: Read>(
    reader: &mut R,
    buf: &mut [u8],
    frame: u64,
    offset: u64,
    what: &str,
) -> Result<(), DecodeError> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => DecodeError::Truncated {
            frame,
            offset,
            reason: format!("stream ended inside {}", what),
        },
        _ => DecodeError::Io(e),
    })
}
