//! Core types for detector event frames.
//!
//! This module defines the flat output record, the closed set of event-record
//! variants with their wire layouts, and the two envelope numbering schemes.

use serde::Deserialize;
use std::fmt;

/// A normalized detector event, one per source event.
///
/// Every variant maps into this single shape. Column names used by the sinks
/// are `Mod`, `Ch`, `TimeStamp`, `FineTS`, `ChargeLong`, `ChargeShort`,
/// `Extras`, `RecordLength`, `Trace1` and `Trace2`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FlatEventRecord {
    /// Originating module/board identifier
    pub module: u8,
    /// Channel identifier within the module
    pub channel: u8,
    /// Coarse clock ticks
    pub timestamp: u64,
    /// Refined timestamp, native or derived from `timestamp`
    pub fine_ts: f64,
    /// Long-gate integrated charge ("energy")
    pub charge_long: u16,
    /// Short-gate charge, or the scaled discrimination ratio
    pub charge_short: u16,
    /// Reserved flag bits
    pub extras: u32,
    /// Number of waveform samples in each trace
    pub record_length: u32,
    /// First waveform trace
    pub trace1: Vec<u16>,
    /// Second waveform trace, zero-filled when the variant has only one
    pub trace2: Vec<u16>,
}

impl FlatEventRecord {
    /// Returns true when both traces agree with `record_length`.
    pub fn traces_consistent(&self) -> bool {
        let len = self.record_length as usize;
        self.trace1.len() == len && self.trace2.len() == len
    }
}

/// Which optional fields follow the common event prefix on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VariantLayout {
    pub psd: bool,
    pub fine_timestamp: bool,
    pub cross_flags: bool,
    pub waveforms: u8,
}

impl VariantLayout {
    const fn new(psd: bool, fine_timestamp: bool, cross_flags: bool, waveforms: u8) -> Self {
        Self {
            psd,
            fine_timestamp,
            cross_flags,
            waveforms,
        }
    }
}

/// Event-record layouts known to the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchemaVariant {
    /// Board, channel, timestamp and energy only
    Plain,
    /// Plain plus a discrimination ratio
    Psd,
    /// Plain plus one waveform
    Wave,
    /// Plain plus two waveforms
    DualWave,
    /// Psd plus two waveforms
    Full,
    /// Plain plus a native fine timestamp
    RawTime,
    /// Plain plus two trigger-quality flags (tagged envelope only)
    Cross,
    /// Psd plus one waveform (tagged envelope only)
    PsdWave,
}

impl SchemaVariant {
    /// All variants, in counter order.
    pub const ALL: [SchemaVariant; 8] = [
        Self::Plain,
        Self::Psd,
        Self::Wave,
        Self::DualWave,
        Self::Full,
        Self::RawTime,
        Self::Cross,
        Self::PsdWave,
    ];

    /// Wire layout of one event of this variant.
    pub const fn layout(self) -> VariantLayout {
        match self {
            Self::Plain => VariantLayout::new(false, false, false, 0),
            Self::Psd => VariantLayout::new(true, false, false, 0),
            Self::Wave => VariantLayout::new(false, false, false, 1),
            Self::DualWave => VariantLayout::new(false, false, false, 2),
            Self::Full => VariantLayout::new(true, false, false, 2),
            Self::RawTime => VariantLayout::new(false, true, false, 0),
            Self::Cross => VariantLayout::new(false, false, true, 0),
            Self::PsdWave => VariantLayout::new(true, false, false, 1),
        }
    }

    /// Position of this variant in [`SchemaVariant::ALL`].
    #[inline]
    pub const fn index(self) -> usize {
        match self {
            Self::Plain => 0,
            Self::Psd => 1,
            Self::Wave => 2,
            Self::DualWave => 3,
            Self::Full => 4,
            Self::RawTime => 5,
            Self::Cross => 6,
            Self::PsdWave => 7,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Plain => "Plain",
            Self::Psd => "Psd",
            Self::Wave => "Wave",
            Self::DualWave => "DualWave",
            Self::Full => "Full",
            Self::RawTime => "RawTime",
            Self::Cross => "Cross",
            Self::PsdWave => "PsdWave",
        }
    }
}

impl fmt::Display for SchemaVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Envelope convention of a stream.
///
/// A stream uses one envelope from start to end. The two conventions number
/// their variants differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Envelope {
    /// Length-prefixed frames starting with a `u32` discriminant
    #[default]
    Prefixed,
    /// Frames starting with a one-byte union tag
    Tagged,
}

// Discriminant order of the prefixed envelope.
const PREFIXED_IDS: [SchemaVariant; 6] = [
    SchemaVariant::Plain,
    SchemaVariant::Psd,
    SchemaVariant::Wave,
    SchemaVariant::DualWave,
    SchemaVariant::Full,
    SchemaVariant::RawTime,
];

// Union member order of the tagged envelope.
const TAGGED_IDS: [SchemaVariant; 8] = [
    SchemaVariant::Plain,
    SchemaVariant::Psd,
    SchemaVariant::Wave,
    SchemaVariant::DualWave,
    SchemaVariant::RawTime,
    SchemaVariant::Cross,
    SchemaVariant::PsdWave,
    SchemaVariant::Full,
];

impl Envelope {
    fn table(self) -> &'static [SchemaVariant] {
        match self {
            Self::Prefixed => &PREFIXED_IDS,
            Self::Tagged => &TAGGED_IDS,
        }
    }

    /// Maps a raw discriminant or tag to its variant.
    #[inline]
    pub fn variant_for(self, id: u32) -> Option<SchemaVariant> {
        self.table().get(id as usize).copied()
    }

    /// Inverse of [`Envelope::variant_for`]. `None` when the envelope cannot
    /// carry the variant.
    pub fn id_for(self, variant: SchemaVariant) -> Option<u32> {
        self.table()
            .iter()
            .position(|&v| v == variant)
            .map(|pos| pos as u32)
    }

    pub fn supports(self, variant: SchemaVariant) -> bool {
        self.id_for(variant).is_some()
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Prefixed => f.write_str("prefixed"),
            Self::Tagged => f.write_str("tagged"),
        }
    }
}

impl std::str::FromStr for Envelope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "prefixed" | "discriminant" => Ok(Self::Prefixed),
            "tagged" | "union" => Ok(Self::Tagged),
            other => Err(format!(
                "Unknown envelope: {}. Use prefixed or tagged",
                other
            )),
        }
    }
}

/// One event as it appears on the wire, before normalization.
///
/// Fields the variant's layout does not carry keep their default values.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawEvent {
    pub board: u8,
    pub channel: u8,
    pub timestamp: u64,
    pub energy: u16,
    /// Discrimination ratio, nominally in `[0, 1]`
    pub psd: f32,
    /// Native fine timestamp
    pub fine_timestamp: f64,
    /// Trigger-quality flags
    pub flags: [bool; 2],
    pub waveform1: Vec<u16>,
    pub waveform2: Vec<u16>,
}

impl RawEvent {
    /// Creates an event carrying only the common prefix.
    pub fn new(board: u8, channel: u8, timestamp: u64, energy: u16) -> Self {
        Self {
            board,
            channel,
            timestamp,
            energy,
            ..Default::default()
        }
    }

    pub fn with_psd(mut self, psd: f32) -> Self {
        self.psd = psd;
        self
    }

    pub fn with_fine_timestamp(mut self, fine_timestamp: f64) -> Self {
        self.fine_timestamp = fine_timestamp;
        self
    }

    pub fn with_flags(mut self, first: bool, second: bool) -> Self {
        self.flags = [first, second];
        self
    }

    pub fn with_waveforms(mut self, waveform1: Vec<u16>, waveform2: Vec<u16>) -> Self {
        self.waveform1 = waveform1;
        self.waveform2 = waveform2;
        self
    }
}

/// Event counts per variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VariantCounts([u64; 8]);

impl VariantCounts {
    #[inline]
    pub fn add(&mut self, variant: SchemaVariant, events: u64) {
        self.0[variant.index()] += events;
    }

    #[inline]
    pub fn get(&self, variant: SchemaVariant) -> u64 {
        self.0[variant.index()]
    }

    pub fn total(&self) -> u64 {
        self.0.iter().sum()
    }

    /// Variants with a non-zero count, in counter order.
    pub fn iter(&self) -> impl Iterator<Item = (SchemaVariant, u64)> + '_ {
        SchemaVariant::ALL
            .iter()
            .map(move |&v| (v, self.get(v)))
            .filter(|&(_, n)| n > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_prefixed_ids() {
        let env = Envelope::Prefixed;
        assert_eq!(env.variant_for(0), Some(SchemaVariant::Plain));
        assert_eq!(env.variant_for(4), Some(SchemaVariant::Full));
        assert_eq!(env.variant_for(5), Some(SchemaVariant::RawTime));
        assert_eq!(env.variant_for(6), None);
        assert!(!env.supports(SchemaVariant::Cross));
        assert!(!env.supports(SchemaVariant::PsdWave));
    }

    #[test]
    fn test_tagged_ids() {
        let env = Envelope::Tagged;
        assert_eq!(env.variant_for(4), Some(SchemaVariant::RawTime));
        assert_eq!(env.variant_for(5), Some(SchemaVariant::Cross));
        assert_eq!(env.variant_for(7), Some(SchemaVariant::Full));
        assert_eq!(env.variant_for(8), None);
        for variant in SchemaVariant::ALL {
            let id = env.id_for(variant).unwrap();
            assert_eq!(env.variant_for(id), Some(variant));
        }
    }

    #[test]
    fn test_layout_table() {
        assert_eq!(SchemaVariant::Plain.layout().waveforms, 0);
        assert!(SchemaVariant::Full.layout().psd);
        assert_eq!(SchemaVariant::Full.layout().waveforms, 2);
        assert!(SchemaVariant::RawTime.layout().fine_timestamp);
        assert!(SchemaVariant::Cross.layout().cross_flags);
        assert_eq!(SchemaVariant::PsdWave.layout().waveforms, 1);
    }

    #[test]
    fn test_variant_index_matches_all() {
        for (i, variant) in SchemaVariant::ALL.iter().enumerate() {
            assert_eq!(variant.index(), i);
        }
    }

    #[test]
    fn test_envelope_from_str() {
        assert_eq!(Envelope::from_str("Tagged").unwrap(), Envelope::Tagged);
        assert_eq!(Envelope::from_str(" prefixed ").unwrap(), Envelope::Prefixed);
        assert!(Envelope::from_str("capnp").is_err());
    }

    #[test]
    fn test_variant_counts() {
        let mut counts = VariantCounts::default();
        counts.add(SchemaVariant::Psd, 3);
        counts.add(SchemaVariant::Wave, 2);
        counts.add(SchemaVariant::Psd, 1);
        assert_eq!(counts.get(SchemaVariant::Psd), 4);
        assert_eq!(counts.total(), 6);
        let seen: Vec<_> = counts.iter().collect();
        assert_eq!(seen, vec![(SchemaVariant::Psd, 4), (SchemaVariant::Wave, 2)]);
    }
}
