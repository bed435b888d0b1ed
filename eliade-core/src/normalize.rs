//! Mapping of raw variant events onto [`FlatEventRecord`].
//!
//! Derivation rules per variant:
//!
//! | variant  | FineTS                                   | ChargeShort       | traces           |
//! |----------|------------------------------------------|-------------------|------------------|
//! | Plain    | TimeStamp x scale                        | 0                 | none             |
//! | Psd      | TimeStamp x scale                        | round(psd x 1000) | none             |
//! | Wave     | TimeStamp x scale                        | 0                 | wave1, zeros     |
//! | DualWave | TimeStamp x scale                        | 0                 | wave1, wave2     |
//! | Full     | TimeStamp x scale                        | round(psd x 1000) | wave1, wave2     |
//! | RawTime  | native, or TimeStamp x scale if 0.0      | 0                 | none             |
//! | Cross    | TimeStamp x scale                        | 0                 | none             |
//! | PsdWave  | TimeStamp x scale (or psd, legacy)       | round(psd x 1000) | wave1, zeros     |

use crate::types::{FlatEventRecord, RawEvent, SchemaVariant};
use serde::Deserialize;
use tracing::{debug, warn};

/// Multiplier turning a discrimination ratio into ChargeShort units.
pub const PSD_SCALE: f64 = 1000.0;

/// Extras bit carrying the first Cross trigger-quality flag.
pub const EXTRAS_CROSS_FIRST: u32 = 0x1;
/// Extras bit carrying the second Cross trigger-quality flag.
pub const EXTRAS_CROSS_SECOND: u32 = 0x2;

/// What the PsdWave variant stores in FineTS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PsdWaveFineTs {
    /// Derived from TimeStamp like every other variant
    #[default]
    Timestamp,
    /// Raw discrimination ratio, as written by an older converter
    LegacyPsd,
}

/// Tunables for normalization.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct NormalizeOptions {
    /// Factor applied to TimeStamp when FineTS is derived from it.
    pub fine_ts_scale: f64,
    pub psd_wave_fine_ts: PsdWaveFineTs,
    /// Carry the Cross flags into Extras bits 0 and 1.
    pub cross_flags_in_extras: bool,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            fine_ts_scale: 1.0,
            psd_wave_fine_ts: PsdWaveFineTs::Timestamp,
            cross_flags_in_extras: false,
        }
    }
}

impl NormalizeOptions {
    /// Checks that derived FineTS values stay non-zero for non-zero stamps.
    pub fn validate(&self) -> Result<(), String> {
        if !self.fine_ts_scale.is_finite() || self.fine_ts_scale <= 0.0 {
            return Err(format!(
                "fine_ts_scale must be a positive finite number, got {}",
                self.fine_ts_scale
            ));
        }
        Ok(())
    }
}

/// Converts a discrimination ratio to ChargeShort.
///
/// Out-of-range products saturate at the u16 bounds and NaN maps to 0.
#[inline]
pub fn scale_psd(psd: f32) -> u16 {
    let scaled = (psd as f64 * PSD_SCALE).round();
    if !(0.0..=u16::MAX as f64).contains(&scaled) {
        debug!(psd, "discrimination value outside ChargeShort range, saturating");
    }
    scaled as u16
}

/// Applies the per-variant derivation rules.
#[derive(Debug, Clone, Copy)]
pub struct RecordNormalizer {
    options: NormalizeOptions,
}

impl Default for RecordNormalizer {
    fn default() -> Self {
        Self::new(NormalizeOptions::default())
    }
}

impl RecordNormalizer {
    pub fn new(options: NormalizeOptions) -> Self {
        if options.psd_wave_fine_ts == PsdWaveFineTs::LegacyPsd {
            warn!("PsdWave events will carry the discrimination ratio in FineTS");
        }
        Self { options }
    }

    pub fn options(&self) -> &NormalizeOptions {
        &self.options
    }

    #[inline]
    fn derived_fine_ts(&self, timestamp: u64) -> f64 {
        timestamp as f64 * self.options.fine_ts_scale
    }

    /// Normalizes one event. Never drops an event.
    pub fn normalize(&self, variant: SchemaVariant, raw: RawEvent) -> FlatEventRecord {
        let layout = variant.layout();

        let fine_ts = match variant {
            SchemaVariant::RawTime if raw.fine_timestamp != 0.0 => raw.fine_timestamp,
            SchemaVariant::PsdWave
                if self.options.psd_wave_fine_ts == PsdWaveFineTs::LegacyPsd =>
            {
                raw.psd as f64
            }
            _ => self.derived_fine_ts(raw.timestamp),
        };

        let charge_short = if layout.psd { scale_psd(raw.psd) } else { 0 };

        let mut extras = 0;
        if layout.cross_flags && self.options.cross_flags_in_extras {
            if raw.flags[0] {
                extras |= EXTRAS_CROSS_FIRST;
            }
            if raw.flags[1] {
                extras |= EXTRAS_CROSS_SECOND;
            }
        }

        let (trace1, trace2) = match layout.waveforms {
            0 => (Vec::new(), Vec::new()),
            1 => {
                let len = raw.waveform1.len();
                (raw.waveform1, vec![0; len])
            }
            _ => {
                let mut trace2 = raw.waveform2;
                trace2.resize(raw.waveform1.len(), 0);
                (raw.waveform1, trace2)
            }
        };

        FlatEventRecord {
            module: raw.board,
            channel: raw.channel,
            timestamp: raw.timestamp,
            fine_ts,
            charge_long: raw.energy,
            charge_short,
            extras,
            // Waveform lengths are u32 on the wire.
            record_length: trace1.len() as u32,
            trace1,
            trace2,
        }
    }

    /// Normalizes every event of a frame, preserving order.
    pub fn normalize_all(
        &self,
        variant: SchemaVariant,
        events: Vec<RawEvent>,
    ) -> impl Iterator<Item = FlatEventRecord> + '_ {
        events
            .into_iter()
            .map(move |raw| self.normalize(variant, raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RawEvent {
        RawEvent::new(4, 9, 1_000, 3_210)
    }

    #[test]
    fn test_plain_defaults() {
        let record = RecordNormalizer::default().normalize(SchemaVariant::Plain, sample());
        assert_eq!(record.module, 4);
        assert_eq!(record.channel, 9);
        assert_eq!(record.timestamp, 1_000);
        assert_eq!(record.charge_long, 3_210);
        assert_eq!(record.fine_ts, 1_000.0);
        assert_eq!(record.charge_short, 0);
        assert_eq!(record.extras, 0);
        assert_eq!(record.record_length, 0);
        assert!(record.trace1.is_empty() && record.trace2.is_empty());
    }

    #[test]
    fn test_fine_ts_scale() {
        let normalizer = RecordNormalizer::new(NormalizeOptions {
            fine_ts_scale: 1000.0,
            ..Default::default()
        });
        let record = normalizer.normalize(SchemaVariant::Psd, sample().with_psd(0.5));
        assert_eq!(record.fine_ts, 1_000_000.0);
    }

    #[test]
    fn test_raw_time_native_and_fallback() {
        let normalizer = RecordNormalizer::default();
        let native =
            normalizer.normalize(SchemaVariant::RawTime, sample().with_fine_timestamp(1_000.375));
        assert_eq!(native.fine_ts, 1_000.375);

        let fallback =
            normalizer.normalize(SchemaVariant::RawTime, sample().with_fine_timestamp(0.0));
        assert_eq!(fallback.fine_ts, 1_000.0);
    }

    #[test]
    fn test_psd_boundaries() {
        assert_eq!(scale_psd(0.0), 0);
        assert_eq!(scale_psd(1.0), 1000);
        assert_eq!(scale_psd(0.2345), 235);
        assert_eq!(scale_psd(0.0004), 0);
    }

    #[test]
    fn test_psd_saturates() {
        assert_eq!(scale_psd(100.0), u16::MAX);
        assert_eq!(scale_psd(-0.5), 0);
        assert_eq!(scale_psd(f32::NAN), 0);
    }

    #[test]
    fn test_single_wave_pads_second_trace() {
        let record = RecordNormalizer::default().normalize(
            SchemaVariant::Wave,
            sample().with_waveforms(vec![5, 6, 7, 8], Vec::new()),
        );
        assert_eq!(record.record_length, 4);
        assert_eq!(record.trace1, vec![5, 6, 7, 8]);
        assert_eq!(record.trace2, vec![0, 0, 0, 0]);
        assert!(record.traces_consistent());
    }

    #[test]
    fn test_dual_wave_length_mismatch() {
        let normalizer = RecordNormalizer::default();
        let short = normalizer.normalize(
            SchemaVariant::DualWave,
            sample().with_waveforms(vec![1, 2, 3], vec![4]),
        );
        assert_eq!(short.trace2, vec![4, 0, 0]);

        let long = normalizer.normalize(
            SchemaVariant::Full,
            sample().with_psd(1.0).with_waveforms(vec![1, 2], vec![4, 5, 6, 7]),
        );
        assert_eq!(long.record_length, 2);
        assert_eq!(long.trace2, vec![4, 5]);
        assert_eq!(long.charge_short, 1000);
    }

    #[test]
    fn test_psd_wave_fine_ts_policies() {
        let event = sample().with_psd(0.25).with_waveforms(vec![1, 1], Vec::new());

        let default = RecordNormalizer::default().normalize(SchemaVariant::PsdWave, event.clone());
        assert_eq!(default.fine_ts, 1_000.0);
        assert_eq!(default.charge_short, 250);

        let legacy = RecordNormalizer::new(NormalizeOptions {
            psd_wave_fine_ts: PsdWaveFineTs::LegacyPsd,
            ..Default::default()
        })
        .normalize(SchemaVariant::PsdWave, event);
        assert_eq!(legacy.fine_ts, 0.25);
    }

    #[test]
    fn test_cross_flags() {
        let event = sample().with_flags(true, true);
        let dropped = RecordNormalizer::default().normalize(SchemaVariant::Cross, event.clone());
        assert_eq!(dropped.extras, 0);

        let carried = RecordNormalizer::new(NormalizeOptions {
            cross_flags_in_extras: true,
            ..Default::default()
        })
        .normalize(SchemaVariant::Cross, event.clone());
        assert_eq!(carried.extras, EXTRAS_CROSS_FIRST | EXTRAS_CROSS_SECOND);

        // Only Cross defines the bits.
        let plain = RecordNormalizer::new(NormalizeOptions {
            cross_flags_in_extras: true,
            ..Default::default()
        })
        .normalize(SchemaVariant::Plain, event);
        assert_eq!(plain.extras, 0);
    }

    #[test]
    fn test_options_validation() {
        assert!(NormalizeOptions::default().validate().is_ok());
        for scale in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let options = NormalizeOptions {
                fine_ts_scale: scale,
                ..Default::default()
            };
            assert!(options.validate().is_err());
        }
    }

    #[test]
    fn test_normalize_all_keeps_order() {
        let events = vec![RawEvent::new(0, 0, 3, 0), RawEvent::new(0, 1, 1, 0)];
        let records: Vec<_> = RecordNormalizer::default()
            .normalize_all(SchemaVariant::Plain, events)
            .collect();
        assert_eq!(records.iter().map(|r| r.channel).collect::<Vec<_>>(), vec![0, 1]);
    }
}
