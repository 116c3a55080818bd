//! Error types for configuration and handler-level failures.
//!
//! Allocation failures inside the packet path are deliberately *not*
//! represented here: they are silent, non-fatal zoom-in aborts, never
//! surfaced to the caller.

/// Errors raised while parsing or validating a [`crate::config::MonitorConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// `type` was neither `PACKETS` nor `BYTES`.
    #[error("unknown count type {0:?}, expected PACKETS or BYTES")]
    UnknownCountType(String),

    /// `ratio` fell outside `(0, 1]`.
    #[error("ratio must be in (0, 1], got {0}")]
    RatioOutOfRange(f64),

    /// `threshold` was zero or negative.
    #[error("threshold must be a positive integer")]
    NonPositiveThreshold,

    /// An `anno_level` write named a level outside `0..=3`.
    #[error("annotation level {0} out of range, expected 0..=3")]
    InvalidLevel(u8),

    /// A `set_anno_level` call could not allocate the counters along its
    /// path because the memory budget is exhausted.
    #[error("monitor memory budget exhausted while setting annotation")]
    MemoryExhausted,

    /// The TOML document could not be parsed into a `MonitorConfig`.
    #[error("invalid monitor configuration: {0}")]
    Toml(#[from] toml::de::Error),

    /// A configuration file could not be read from disk.
    #[error("failed to read monitor configuration: {0}")]
    Io(#[from] std::io::Error),
}
