//! Host-facing monitor configuration.
//!
//! Raw `serde`-deserialized struct, validated into a typed config the rest
//! of the crate consumes.

use std::path::Path;

use crate::error::ConfigError;

/// The per-packet sample value: either "one packet" or "IP total length in
/// bytes".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountMode {
    /// Every packet counts as a sample of `1`.
    Packets,
    /// Every packet counts as a sample equal to its IP total length.
    Bytes,
}

/// Raw, on-the-wire monitor configuration as supplied by the host.
///
/// Deserializable from TOML via `toml`/`serde`; the host may equally
/// construct this directly.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct MonitorConfig {
    /// `"PACKETS"` or `"BYTES"`.
    #[serde(rename = "type")]
    pub count: String,
    /// Byte offset into the packet where the IPv4 header begins.
    #[serde(default)]
    pub offset: usize,
    /// Sampling ratio in `(0, 1]` for forward-direction `push` updates.
    #[serde(default = "default_ratio")]
    pub ratio: f64,
    /// Zoom-in threshold, in sample units per averaging interval.
    pub threshold: u32,
    /// Memory ceiling in KiB; `0` means unbounded.
    #[serde(default)]
    pub memmax: u32,
    /// Whether to stamp the packet annotation byte when a rule fires.
    #[serde(default)]
    pub annotate: bool,
}

fn default_ratio() -> f64 {
    1.0
}

/// Minimum non-zero `memmax`, in KiB — a cap small enough to be silly is
/// rounded up to this instead.
pub const MEMMAX_MIN_KIB: u32 = 4;

/// Validated, internally consumed configuration. `ratio` and `threshold`
/// have already been folded into fixed-point / rescaled form.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ValidatedConfig {
    pub count: CountMode,
    pub offset: usize,
    /// 16.16 fixed point, in `(0, 65536]`.
    pub ratio_raw: u32,
    pub threshold: u32,
    pub memmax_kib: u32,
    pub annotate: bool,
}

impl MonitorConfig {
    /// Parse a `MonitorConfig` from a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(ConfigError::from)
    }

    /// Load a `MonitorConfig` from a TOML file on disk.
    pub fn from_toml_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub(crate) fn validate(&self) -> Result<ValidatedConfig, ConfigError> {
        let count = match self.count.as_str() {
            "PACKETS" => CountMode::Packets,
            "BYTES" => CountMode::Bytes,
            other => return Err(ConfigError::UnknownCountType(other.to_string())),
        };
        if !(self.ratio > 0.0 && self.ratio <= 1.0) {
            return Err(ConfigError::RatioOutOfRange(self.ratio));
        }
        if self.threshold == 0 {
            return Err(ConfigError::NonPositiveThreshold);
        }
        let ratio_raw = (self.ratio * 65536.0).round() as u32;
        let memmax_kib = if self.memmax == 0 { 0 } else { self.memmax.max(MEMMAX_MIN_KIB) };
        Ok(ValidatedConfig {
            count,
            offset: self.offset,
            ratio_raw: ratio_raw.max(1),
            threshold: self.threshold,
            memmax_kib,
            annotate: self.annotate,
        })
    }
}

impl ValidatedConfig {
    /// `memmax` in bytes, `0` meaning unbounded.
    pub fn memmax_bytes(&self) -> u64 {
        self.memmax_kib as u64 * 1024
    }
}
