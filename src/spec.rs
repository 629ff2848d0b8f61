use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::{ErrorKind, Result};

/// Limits for a single bin.
///
/// A bin is a named capacity/rate bucket ("global", "server:example.com",
/// ...) that a connection participates in alongside other bins. Every limit
/// defaults to "unbounded / zero delay", so a bin that is absent from a
/// [`ThrottleSpec`] throttles nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BinLimits {
    /// Maximum number of connections checked out in this bin at once.
    /// `None` means unbounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_open_connections: Option<u32>,

    /// Minimum milliseconds that must elapse, on average, per byte read
    /// from a transfer in this bin. Fractional values are meaningful:
    /// `0.5` bounds sustained throughput at 2000 bytes per second.
    #[serde(default)]
    pub min_millis_per_byte: f64,

    /// Minimum interval between the starts of two fetches in this bin
    #[serde(default, with = "humantime_serde")]
    pub min_time_between_fetches: Duration,
}

impl Default for BinLimits {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl BinLimits {
    /// Limits that throttle nothing
    #[must_use]
    pub const fn unbounded() -> Self {
        Self {
            max_open_connections: None,
            min_millis_per_byte: 0.0,
            min_time_between_fetches: Duration::ZERO,
        }
    }

    fn validate(&self, bin: &str) -> Result<()> {
        if !self.min_millis_per_byte.is_finite() || self.min_millis_per_byte < 0.0 {
            return Err(ErrorKind::InvalidThrottleSpec {
                bin: bin.to_string(),
                reason: format!(
                    "min_millis_per_byte must be finite and non-negative, got {}",
                    self.min_millis_per_byte
                ),
            });
        }
        Ok(())
    }
}

/// An immutable mapping from bin name to its three limits.
///
/// A spec is installed into a throttle group wholesale and swapped
/// wholesale on reconfiguration; it is never mutated in place, so
/// concurrent readers always observe one consistent set of limits.
///
/// Specs deserialize from the framework's TOML configuration:
///
/// ```toml
/// [global]
/// max_open_connections = 12
///
/// ["server:example.com"]
/// max_open_connections = 3
/// min_millis_per_byte = 0.5
/// min_time_between_fetches = "250ms"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThrottleSpec {
    bins: HashMap<String, BinLimits>,
}

impl ThrottleSpec {
    /// An empty spec: every bin is unbounded
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the limits for a bin, builder style
    #[must_use]
    pub fn with_bin(mut self, name: impl Into<String>, limits: BinLimits) -> Self {
        self.bins.insert(name.into(), limits);
        self
    }

    /// Add or replace the limits for a bin
    pub fn insert(&mut self, name: impl Into<String>, limits: BinLimits) {
        self.bins.insert(name.into(), limits);
    }

    /// The limits for a bin; absent bins are unbounded
    #[must_use]
    pub fn limits(&self, bin: &str) -> BinLimits {
        self.bins.get(bin).cloned().unwrap_or_default()
    }

    /// Maximum open connections for a bin, `None` if unbounded
    #[must_use]
    pub fn max_open_connections(&self, bin: &str) -> Option<u32> {
        self.bins.get(bin).and_then(|b| b.max_open_connections)
    }

    /// Minimum milliseconds per byte for a bin, `0.0` if unthrottled
    #[must_use]
    pub fn min_millis_per_byte(&self, bin: &str) -> f64 {
        self.bins.get(bin).map_or(0.0, |b| b.min_millis_per_byte)
    }

    /// Minimum interval between fetch starts for a bin, zero if unthrottled
    #[must_use]
    pub fn min_time_between_fetches(&self, bin: &str) -> Duration {
        self.bins
            .get(bin)
            .map_or(Duration::ZERO, |b| b.min_time_between_fetches)
    }

    /// Names of all bins this spec constrains
    pub fn bin_names(&self) -> impl Iterator<Item = &str> {
        self.bins.keys().map(String::as_str)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        for (name, limits) in &self.bins {
            limits.validate(name)?;
        }
        Ok(())
    }
}
