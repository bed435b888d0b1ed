//! TOML configuration file support.
//!
//! Settings that would otherwise need several flags can live in a file:
//!
//! ```toml
//! # eliade.toml
//! [conversion]
//! envelope = "tagged"
//! mode = "buffered_sorted"
//! fine_ts_scale = 1000.0
//! psd_wave_fine_ts = "timestamp"
//! cross_flags_in_extras = true
//! parallel_sort = true
//! max_frame_len = 67108864
//! csv_traces = false
//! ```
//!
//! Command-line flags take precedence over file values.

use anyhow::{Context, Result};
use eliade_core::{Envelope, IngestMode, IngestOptions, PsdWaveFineTs};
use serde::Deserialize;
use std::path::Path;

/// Root configuration structure for eliade.toml files.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// Conversion-specific settings.
    #[serde(default)]
    pub conversion: ConversionConfig,
}

/// Configuration for a conversion run.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConversionConfig {
    /// Frame envelope convention (`prefixed` or `tagged`).
    pub envelope: Option<Envelope>,

    /// `streaming` or `buffered_sorted`.
    pub mode: Option<IngestMode>,

    /// Factor applied to TimeStamp when FineTS is derived from it.
    pub fine_ts_scale: Option<f64>,

    /// `timestamp` or `legacy_psd`.
    pub psd_wave_fine_ts: Option<PsdWaveFineTs>,

    /// Carry Cross trigger flags into Extras.
    pub cross_flags_in_extras: Option<bool>,

    /// Sort with rayon when the parallel feature is built in.
    pub parallel_sort: Option<bool>,

    /// Largest accepted frame body in bytes.
    pub max_frame_len: Option<usize>,

    /// Write waveform columns to CSV output.
    pub csv_traces: Option<bool>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse TOML configuration")
    }
}

impl ConversionConfig {
    /// Overwrites `options` with every value set in the file.
    pub fn apply(&self, options: &mut IngestOptions) {
        if let Some(envelope) = self.envelope {
            options.envelope = envelope;
        }
        if let Some(mode) = self.mode {
            options.mode = mode;
        }
        if let Some(scale) = self.fine_ts_scale {
            options.normalize.fine_ts_scale = scale;
        }
        if let Some(policy) = self.psd_wave_fine_ts {
            options.normalize.psd_wave_fine_ts = policy;
        }
        if let Some(carry) = self.cross_flags_in_extras {
            options.normalize.cross_flags_in_extras = carry;
        }
        if let Some(parallel) = self.parallel_sort {
            options.parallel_sort = parallel;
        }
        if let Some(max) = self.max_frame_len {
            options.max_frame_len = max;
        }
    }
}
