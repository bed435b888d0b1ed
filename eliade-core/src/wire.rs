//! Low-level byte layout of frames and event tuples.
//!
//! All integers are little-endian. An event starts with a fixed 12-byte
//! prefix; the optional fields that follow are selected by the variant's
//! [`VariantLayout`]:
//!
//! ```text
//! board u8 | channel u8 | timestamp u64 | energy u16      (always)
//! psd f32                                                  (layout.psd)
//! fine_timestamp f64                                       (layout.fine_timestamp)
//! flags u8                                                 (layout.cross_flags)
//! len u32 | len x u16                                      (once per waveform)
//! ```
//!
//! A frame body is `event_count u32` followed by that many events.

use crate::types::{RawEvent, VariantLayout};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Write};

/// Bytes of the fixed event prefix.
pub const EVENT_PREFIX_LEN: usize = 12;

/// `body_len u32` + `discriminant u32`
pub const PREFIXED_HEADER_LEN: usize = 8;

/// `tag u8` + `body_len u32`
pub const TAGGED_HEADER_LEN: usize = 5;

/// Bytes of the `event_count` field opening each body.
pub const BODY_COUNT_LEN: usize = 4;

pub const FLAG_FIRST: u8 = 0x01;
pub const FLAG_SECOND: u8 = 0x02;

/// Bytes left between the cursor and the end of its buffer.
#[inline]
pub fn remaining(rdr: &Cursor<&[u8]>) -> usize {
    let len = rdr.get_ref().len() as u64;
    len.saturating_sub(rdr.position()) as usize
}

#[inline]
fn short(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, format!("{} runs past end of frame", what))
}

/// Advances the cursor by `n` bytes, failing if fewer remain.
#[inline]
fn advance(rdr: &mut Cursor<&[u8]>, n: usize, what: &str) -> io::Result<()> {
    if remaining(rdr) < n {
        return Err(short(what));
    }
    rdr.set_position(rdr.position() + n as u64);
    Ok(())
}

/// Reads a length-prefixed waveform.
///
/// The declared length is checked against the bytes left so a corrupt
/// length cannot trigger a large allocation.
fn read_waveform(rdr: &mut Cursor<&[u8]>) -> io::Result<Vec<u16>> {
    let len = rdr.read_u32::<LittleEndian>()? as usize;
    if remaining(rdr) / 2 < len {
        return Err(short("waveform"));
    }
    let mut samples = vec![0u16; len];
    rdr.read_u16_into::<LittleEndian>(&mut samples)?;
    Ok(samples)
}

fn skip_waveform(rdr: &mut Cursor<&[u8]>) -> io::Result<()> {
    let len = rdr.read_u32::<LittleEndian>()? as usize;
    advance(rdr, len.saturating_mul(2), "waveform")
}

/// Reads one event under `layout`.
pub fn read_event(rdr: &mut Cursor<&[u8]>, layout: VariantLayout) -> io::Result<RawEvent> {
    if remaining(rdr) < EVENT_PREFIX_LEN {
        return Err(short("event"));
    }
    let mut event = RawEvent::new(
        rdr.read_u8()?,
        rdr.read_u8()?,
        rdr.read_u64::<LittleEndian>()?,
        rdr.read_u16::<LittleEndian>()?,
    );
    if layout.psd {
        event.psd = rdr.read_f32::<LittleEndian>()?;
    }
    if layout.fine_timestamp {
        event.fine_timestamp = rdr.read_f64::<LittleEndian>()?;
    }
    if layout.cross_flags {
        let bits = rdr.read_u8()?;
        event.flags = [bits & FLAG_FIRST != 0, bits & FLAG_SECOND != 0];
    }
    if layout.waveforms >= 1 {
        event.waveform1 = read_waveform(rdr)?;
    }
    if layout.waveforms >= 2 {
        event.waveform2 = read_waveform(rdr)?;
    }
    Ok(event)
}

/// Steps over one event under `layout` without materializing it.
pub fn skip_event(rdr: &mut Cursor<&[u8]>, layout: VariantLayout) -> io::Result<()> {
    let mut fixed = EVENT_PREFIX_LEN;
    if layout.psd {
        fixed += 4;
    }
    if layout.fine_timestamp {
        fixed += 8;
    }
    if layout.cross_flags {
        fixed += 1;
    }
    advance(rdr, fixed, "event")?;
    for _ in 0..layout.waveforms {
        skip_waveform(rdr)?;
    }
    Ok(())
}

/// Encoded size of `event` under `layout`.
pub fn event_len(layout: VariantLayout, event: &RawEvent) -> usize {
    let mut len = EVENT_PREFIX_LEN;
    if layout.psd {
        len += 4;
    }
    if layout.fine_timestamp {
        len += 8;
    }
    if layout.cross_flags {
        len += 1;
    }
    if layout.waveforms >= 1 {
        len += 4 + 2 * event.waveform1.len();
    }
    if layout.waveforms >= 2 {
        len += 4 + 2 * event.waveform2.len();
    }
    len
}

fn write_waveform<W: Write>(wtr: &mut W, samples: &[u16]) -> io::Result<()> {
    let len = u32::try_from(samples.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "waveform too long"))?;
    wtr.write_u32::<LittleEndian>(len)?;
    for &sample in samples {
        wtr.write_u16::<LittleEndian>(sample)?;
    }
    Ok(())
}

/// Writes one event under `layout`. Fields the layout lacks are not written.
pub fn write_event<W: Write>(
    wtr: &mut W,
    layout: VariantLayout,
    event: &RawEvent,
) -> io::Result<()> {
    wtr.write_u8(event.board)?;
    wtr.write_u8(event.channel)?;
    wtr.write_u64::<LittleEndian>(event.timestamp)?;
    wtr.write_u16::<LittleEndian>(event.energy)?;
    if layout.psd {
        wtr.write_f32::<LittleEndian>(event.psd)?;
    }
    if layout.fine_timestamp {
        wtr.write_f64::<LittleEndian>(event.fine_timestamp)?;
    }
    if layout.cross_flags {
        let mut bits = 0u8;
        if event.flags[0] {
            bits |= FLAG_FIRST;
        }
        if event.flags[1] {
            bits |= FLAG_SECOND;
        }
        wtr.write_u8(bits)?;
    }
    if layout.waveforms >= 1 {
        write_waveform(wtr, &event.waveform1)?;
    }
    if layout.waveforms >= 2 {
        write_waveform(wtr, &event.waveform2)?;
    }
    Ok(())
}
