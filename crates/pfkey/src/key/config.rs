//! Engine configuration.
//!
//! # Example
//!
//! ```
//! use pfkey::key::config::KeyConfig;
//! use pfkey::key::validation::Validatable;
//!
//! let config = KeyConfig::new()
//!     .spi_range(0x1000, 0xffff)
//!     .larval_lifetime(60)
//!     .blockacq_count(5);
//! assert!(config.is_valid());
//! ```

use std::time::Duration;

use super::validation::{Validatable, ValidationResult};

/// Tunables of the key engine. Times are in seconds.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct KeyConfig {
    /// Smallest SPI handed out when no range is requested.
    pub spi_min: u32,
    /// Largest SPI handed out when no range is requested.
    pub spi_max: u32,
    /// Random draws before SPI allocation gives up.
    pub spi_trycnt: u32,
    /// Age at which an SA that never matured is dropped.
    pub larval_lifetime: u64,
    /// Repeats of one acquire suppressed before it is sent again.
    pub blockacq_count: u32,
    /// Age at which an acquire record is forgotten.
    pub blockacq_lifetime: u64,
    /// Period of the sweeper.
    pub sweep_interval: u64,
    /// Period of SPI generator reseeding.
    pub random_interval: u64,
    /// Capacity of the manager's request channel.
    pub channel_capacity: usize,
    /// Whether the packet path may trigger acquires.
    pub acquire_enabled: bool,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            spi_min: 0x100,
            spi_max: 0x0fff_ffff,
            spi_trycnt: 1000,
            larval_lifetime: 30,
            blockacq_count: 10,
            blockacq_lifetime: 20,
            sweep_interval: 1,
            random_interval: 60,
            channel_capacity: 256,
            acquire_enabled: true,
        }
    }
}

impl KeyConfig {
    /// Default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default SPI range.
    pub fn spi_range(mut self, min: u32, max: u32) -> Self {
        self.spi_min = min;
        self.spi_max = max;
        self
    }

    /// Set the number of random draws per SPI allocation.
    pub fn spi_trycnt(mut self, trycnt: u32) -> Self {
        self.spi_trycnt = trycnt;
        self
    }

    /// Set the larval SA lifetime in seconds.
    pub fn larval_lifetime(mut self, secs: u64) -> Self {
        self.larval_lifetime = secs;
        self
    }

    /// Set the acquire repeat threshold.
    pub fn blockacq_count(mut self, count: u32) -> Self {
        self.blockacq_count = count;
        self
    }

    /// Set the acquire record lifetime in seconds.
    pub fn blockacq_lifetime(mut self, secs: u64) -> Self {
        self.blockacq_lifetime = secs;
        self
    }

    /// Set the sweeper period in seconds.
    pub fn sweep_interval(mut self, secs: u64) -> Self {
        self.sweep_interval = secs;
        self
    }

    /// Set the reseed period in seconds.
    pub fn random_interval(mut self, secs: u64) -> Self {
        self.random_interval = secs;
        self
    }

    /// Set the manager channel capacity.
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Enable or disable acquires from the packet path.
    pub fn acquire_enabled(mut self, enabled: bool) -> Self {
        self.acquire_enabled = enabled;
        self
    }

    /// Sweeper period as a duration.
    pub fn sweep_period(&self) -> Duration {
        Duration::from_secs(self.sweep_interval)
    }
}

impl Validatable for KeyConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::new();
        if self.spi_min > self.spi_max {
            result.add_error("spi_range", "minimum exceeds maximum");
        }
        if self.spi_min == 0 {
            result.add_warning("spi_range", "SPI 0 is reserved and will never be handed out");
        }
        if self.spi_min <= 0xff {
            result.add_warning("spi_range", "SPIs up to 255 fail maturity checks");
        }
        if self.spi_trycnt == 0 {
            result.add_error("spi_trycnt", "must be at least 1");
        }
        if self.sweep_interval == 0 {
            result.add_error("sweep_interval", "must be non-zero");
        }
        if self.random_interval == 0 {
            result.add_error("random_interval", "must be non-zero");
        }
        if self.channel_capacity == 0 {
            result.add_error("channel_capacity", "must be non-zero");
        }
        if self.larval_lifetime == 0 {
            result.add_warning("larval_lifetime", "larval SAs will be dropped on the next sweep");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::error::Error;

    #[test]
    fn test_defaults_are_valid() {
        let config = KeyConfig::default();
        let result = config.validate();
        assert!(result.is_valid());
        assert!(!result.has_warnings());
        assert_eq!(config.sweep_period(), Duration::from_secs(1));
        assert_eq!((config.spi_min, config.spi_max), (0x100, 0x0fff_ffff));
    }

    #[test]
    fn test_rejects_bad_values() {
        let config = KeyConfig::new()
            .spi_range(10, 5)
            .spi_trycnt(0)
            .sweep_interval(0)
            .random_interval(0)
            .channel_capacity(0);
        let result = config.validate();
        assert_eq!(result.errors.len(), 5);
        assert!(matches!(result.into_result(), Err(Error::Validation(e)) if e.len() == 5));
    }

    #[test]
    fn test_warnings() {
        let result = KeyConfig::new().spi_range(0, 0xffff).larval_lifetime(0).validate();
        assert!(result.is_valid());
        assert_eq!(result.warnings.len(), 3);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_deserialize_partial() {
        let config: KeyConfig = serde_json::from_str(r#"{"spi_trycnt": 5, "larval_lifetime": 90}"#).unwrap();
        assert_eq!(config.spi_trycnt, 5);
        assert_eq!(config.larval_lifetime, 90);
        assert_eq!(config.blockacq_count, 10);
    }
}
