//! Collector configuration.
//!
//! Settings come either from the builder methods on [`MajorConfig`] or from
//! a runtime parameter string such as
//! `"evacuation-threshold=50,lazy-sweep,no-concurrent-sweep"`.

use thiserror::Error;

use crate::block::MS_BLOCK_ALLOC_NUM;

/// Default occupancy below which a size class is evacuated.
pub const DEFAULT_EVACUATION_THRESHOLD: f64 = 0.666;

/// Errors from parsing collector parameters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The parameter does not belong to this collector.
    #[error("unknown major collector parameter `{0}`")]
    UnknownParam(String),
    /// `evacuation-threshold` was not a percentage.
    #[error("`evacuation-threshold` must be a percentage between 0 and 100, got `{0}`")]
    InvalidThreshold(String),
}

/// Major collector settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MajorConfig {
    /// A size class whose average block occupancy falls below this ratio
    /// is evacuated by the next collection.
    pub evacuation_threshold: f64,
    /// Defer per-block sweeping to the first allocation from the block.
    pub lazy_sweep: bool,
    /// Run the sweep on the job pool instead of in the pause.
    pub concurrent_sweep: bool,
    /// Use the prefetch ring when draining gray queues.
    pub prefetch: bool,
    /// Blocks reserved from the OS per batch.
    pub block_alloc_batch: usize,
}

impl Default for MajorConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl MajorConfig {
    /// The default configuration.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            evacuation_threshold: DEFAULT_EVACUATION_THRESHOLD,
            lazy_sweep: false,
            concurrent_sweep: true,
            prefetch: true,
            block_alloc_batch: MS_BLOCK_ALLOC_NUM,
        }
    }

    /// Sets the evacuation threshold, clamped to `0.0..=1.0`.
    #[must_use]
    pub fn with_evacuation_threshold(mut self, threshold: f64) -> Self {
        self.evacuation_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    /// Enables or disables lazy sweeping.
    #[must_use]
    pub const fn with_lazy_sweep(mut self, lazy: bool) -> Self {
        self.lazy_sweep = lazy;
        self
    }

    /// Enables or disables background sweeping.
    #[must_use]
    pub const fn with_concurrent_sweep(mut self, concurrent: bool) -> Self {
        self.concurrent_sweep = concurrent;
        self
    }

    /// Enables or disables the gray-queue prefetch ring.
    #[must_use]
    pub const fn with_prefetch(mut self, prefetch: bool) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Sets the number of blocks reserved per OS batch (at least one).
    #[must_use]
    pub const fn with_block_alloc_batch(mut self, batch: usize) -> Self {
        self.block_alloc_batch = if batch == 0 { 1 } else { batch };
        self
    }

    /// Applies one parameter.
    ///
    /// Returns `Ok(false)` for parameters that belong to someone else.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidThreshold`] for a malformed
    /// `evacuation-threshold`.
    pub fn handle_param(&mut self, param: &str) -> Result<bool, ConfigError> {
        let param = param.trim();
        if let Some(value) = param.strip_prefix("evacuation-threshold=") {
            let percent: u8 = value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidThreshold(value.to_owned()))?;
            if percent > 100 {
                return Err(ConfigError::InvalidThreshold(value.to_owned()));
            }
            self.evacuation_threshold = f64::from(percent) / 100.0;
            return Ok(true);
        }
        match param {
            "lazy-sweep" => self.lazy_sweep = true,
            "no-lazy-sweep" => self.lazy_sweep = false,
            "concurrent-sweep" => self.concurrent_sweep = true,
            "no-concurrent-sweep" => self.concurrent_sweep = false,
            _ => return Ok(false),
        }
        Ok(true)
    }

    /// Builds a configuration from a comma-separated parameter string.
    ///
    /// # Errors
    ///
    /// Fails on malformed values and on parameters this collector does not
    /// understand.
    pub fn from_params(params: &str) -> Result<Self, ConfigError> {
        let mut config = Self::new();
        for param in params.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            if !config.handle_param(param)? {
                return Err(ConfigError::UnknownParam(param.to_owned()));
            }
        }
        Ok(config)
    }

    /// Help text for the accepted parameters.
    #[must_use]
    pub const fn usage() -> &'static str {
        "  evacuation-threshold=P (where P is a percentage, an integer in 0-100)\n  \
         (no-)lazy-sweep\n  \
         (no-)concurrent-sweep\n"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MajorConfig::default();
        assert!((config.evacuation_threshold - 0.666).abs() < f64::EPSILON);
        assert!(!config.lazy_sweep);
        assert!(config.concurrent_sweep);
        assert_eq!(config.block_alloc_batch, 32);
    }

    #[test]
    fn test_from_params() {
        let config =
            MajorConfig::from_params("evacuation-threshold=50, lazy-sweep,no-concurrent-sweep")
                .unwrap();
        assert!((config.evacuation_threshold - 0.5).abs() < f64::EPSILON);
        assert!(config.lazy_sweep);
        assert!(!config.concurrent_sweep);
    }

    #[test]
    fn test_foreign_param_is_not_ours() {
        let mut config = MajorConfig::new();
        assert_eq!(config.handle_param("nursery-size=4m"), Ok(false));
        assert_eq!(
            MajorConfig::from_params("nursery-size=4m"),
            Err(ConfigError::UnknownParam("nursery-size=4m".into()))
        );
    }

    #[test]
    fn test_bad_threshold() {
        let mut config = MajorConfig::new();
        assert!(matches!(
            config.handle_param("evacuation-threshold=150"),
            Err(ConfigError::InvalidThreshold(_))
        ));
        assert!(matches!(
            config.handle_param("evacuation-threshold=lots"),
            Err(ConfigError::InvalidThreshold(_))
        ));
        assert!(matches!(
            config.handle_param("evacuation-threshold=101"),
            Err(ConfigError::InvalidThreshold(_))
        ));
        assert!(matches!(
            config.handle_param("evacuation-threshold=-5"),
            Err(ConfigError::InvalidThreshold(_))
        ));
    }

    #[test]
    fn test_fractional_threshold_is_rejected() {
        let mut config = MajorConfig::new();
        assert_eq!(
            config.handle_param("evacuation-threshold=12.5"),
            Err(ConfigError::InvalidThreshold("12.5".into()))
        );
        assert!((config.evacuation_threshold - DEFAULT_EVACUATION_THRESHOLD).abs() < f64::EPSILON);
        assert_eq!(config.handle_param("evacuation-threshold=100"), Ok(true));
        assert!((config.evacuation_threshold - 1.0).abs() < f64::EPSILON);
        assert_eq!(config.handle_param("evacuation-threshold=0"), Ok(true));
        assert!(config.evacuation_threshold.abs() < f64::EPSILON);
    }

    #[test]
    fn test_builders_clamp() {
        let config = MajorConfig::new()
            .with_evacuation_threshold(3.0)
            .with_block_alloc_batch(0);
        assert!((config.evacuation_threshold - 1.0).abs() < f64::EPSILON);
        assert_eq!(config.block_alloc_batch, 1);
        assert!(MajorConfig::usage().contains("lazy-sweep"));
    }
}
