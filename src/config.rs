use std::time::Duration;

use atomic::{Atomic, Ordering};

use crate::globals::*;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("evaluation interval must be at least {min} ms, got {value} ms")]
    EvaluationInterval { value: u64, min: u64 },
    #[error("uncommit delay must be at least {min} ms, got {value} ms")]
    UncommitDelay { value: u64, min: u64 },
    #[error("at least one region must be allowed to uncommit")]
    MinRegionsToUncommit,
    #[error("growth threshold must be in (0, 1], got {0}")]
    GrowthThreshold(f64),
    #[error("growth factor must be greater than 1, got {0}")]
    GrowthFactor(f64),
}

/// Configuration of time-based heap sizing.
#[derive(Debug, Clone, PartialEq)]
pub struct SizingConfig {
    /// Periodically evaluate the heap and grow or shrink it
    pub use_time_based_heap_sizing: bool,
    /// Delay between two heap evaluations
    pub evaluation_interval_millis: u64,
    /// How long a free region has to stay untouched before it may be uncommitted
    pub uncommit_delay_millis: u64,
    /// Shrinking is only worth it once this many regions are idle
    pub min_regions_to_uncommit: usize,
    /// Occupancy of committed memory above which the heap grows
    pub growth_threshold: f64,
    /// How fast committed memory grows once the threshold is crossed
    pub growth_factor: f64,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            use_time_based_heap_sizing: false,
            evaluation_interval_millis: DEFAULT_EVALUATION_INTERVAL_MILLIS,
            uncommit_delay_millis: DEFAULT_UNCOMMIT_DELAY_MILLIS,
            min_regions_to_uncommit: DEFAULT_MIN_REGIONS_TO_UNCOMMIT,
            growth_threshold: DEFAULT_GROWTH_THRESHOLD,
            growth_factor: DEFAULT_GROWTH_FACTOR,
        }
    }
}

impl SizingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_evaluation_interval(self.evaluation_interval_millis)?;
        check_uncommit_delay(self.uncommit_delay_millis)?;
        check_min_regions_to_uncommit(self.min_regions_to_uncommit)?;
        check_growth_threshold(self.growth_threshold)?;
        check_growth_factor(self.growth_factor)
    }
}

fn check_evaluation_interval(value: u64) -> Result<(), ConfigError> {
    if value < MIN_EVALUATION_INTERVAL_MILLIS {
        return Err(ConfigError::EvaluationInterval {
            value,
            min: MIN_EVALUATION_INTERVAL_MILLIS,
        });
    }
    Ok(())
}

fn check_uncommit_delay(value: u64) -> Result<(), ConfigError> {
    if value < MIN_UNCOMMIT_DELAY_MILLIS {
        return Err(ConfigError::UncommitDelay {
            value,
            min: MIN_UNCOMMIT_DELAY_MILLIS,
        });
    }
    Ok(())
}

fn check_min_regions_to_uncommit(value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::MinRegionsToUncommit);
    }
    Ok(())
}

fn check_growth_threshold(value: f64) -> Result<(), ConfigError> {
    if !(value > 0.0 && value <= 1.0) {
        return Err(ConfigError::GrowthThreshold(value));
    }
    Ok(())
}

fn check_growth_factor(value: f64) -> Result<(), ConfigError> {
    if !(value > 1.0 && value.is_finite()) {
        return Err(ConfigError::GrowthFactor(value));
    }
    Ok(())
}

/// Live view of [`SizingConfig`] shared between the sizing components and whoever
/// reconfigures them at runtime. Readers always observe the latest accepted value.
pub struct SizingFlags {
    enabled: Atomic<bool>,
    evaluation_interval_millis: Atomic<u64>,
    uncommit_delay_millis: Atomic<u64>,
    min_regions_to_uncommit: Atomic<usize>,
    growth_threshold: Atomic<f64>,
    growth_factor: Atomic<f64>,
}

impl SizingFlags {
    pub fn new(config: &SizingConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            enabled: Atomic::new(config.use_time_based_heap_sizing),
            evaluation_interval_millis: Atomic::new(config.evaluation_interval_millis),
            uncommit_delay_millis: Atomic::new(config.uncommit_delay_millis),
            min_regions_to_uncommit: Atomic::new(config.min_regions_to_uncommit),
            growth_threshold: Atomic::new(config.growth_threshold),
            growth_factor: Atomic::new(config.growth_factor),
        })
    }

    pub fn snapshot(&self) -> SizingConfig {
        SizingConfig {
            use_time_based_heap_sizing: self.is_enabled(),
            evaluation_interval_millis: self.evaluation_interval_millis.load(Ordering::Relaxed),
            uncommit_delay_millis: self.uncommit_delay_millis.load(Ordering::Relaxed),
            min_regions_to_uncommit: self.min_regions_to_uncommit(),
            growth_threshold: self.growth_threshold(),
            growth_factor: self.growth_factor(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn evaluation_interval(&self) -> Duration {
        Duration::from_millis(self.evaluation_interval_millis.load(Ordering::Relaxed))
    }

    pub fn set_evaluation_interval_millis(&self, value: u64) -> Result<(), ConfigError> {
        check_evaluation_interval(value)?;
        self.evaluation_interval_millis
            .store(value, Ordering::Relaxed);
        Ok(())
    }

    pub fn uncommit_delay(&self) -> Duration {
        Duration::from_millis(self.uncommit_delay_millis.load(Ordering::Relaxed))
    }

    pub fn set_uncommit_delay_millis(&self, value: u64) -> Result<(), ConfigError> {
        check_uncommit_delay(value)?;
        self.uncommit_delay_millis.store(value, Ordering::Relaxed);
        Ok(())
    }

    pub fn min_regions_to_uncommit(&self) -> usize {
        self.min_regions_to_uncommit.load(Ordering::Relaxed)
    }

    pub fn set_min_regions_to_uncommit(&self, value: usize) -> Result<(), ConfigError> {
        check_min_regions_to_uncommit(value)?;
        self.min_regions_to_uncommit.store(value, Ordering::Relaxed);
        Ok(())
    }

    pub fn growth_threshold(&self) -> f64 {
        self.growth_threshold.load(Ordering::Relaxed)
    }

    pub fn growth_factor(&self) -> f64 {
        self.growth_factor.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid_and_disabled() {
        let config = SizingConfig::default();
        assert!(config.validate().is_ok());
        assert!(!config.use_time_based_heap_sizing);
        assert_eq!(config.evaluation_interval_millis, 60_000);
    }

    #[test]
    fn rejects_invalid_settings() {
        let config = SizingConfig {
            evaluation_interval_millis: 0,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::EvaluationInterval { value: 0, min: 1 })
        );

        let config = SizingConfig {
            uncommit_delay_millis: 100,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UncommitDelay { value: 100, .. })
        ));

        let config = SizingConfig {
            min_regions_to_uncommit: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::MinRegionsToUncommit));

        let config = SizingConfig {
            growth_factor: 1.0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::GrowthFactor(1.0)));
    }

    #[test]
    fn accepts_boundary_settings() {
        let config = SizingConfig {
            use_time_based_heap_sizing: true,
            evaluation_interval_millis: 1,
            uncommit_delay_millis: MIN_UNCOMMIT_DELAY_MILLIS,
            min_regions_to_uncommit: 100,
            growth_threshold: 1.0,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn dynamic_updates_are_validated() {
        let flags = SizingFlags::new(&SizingConfig::default()).unwrap();

        flags.set_evaluation_interval_millis(45_000).unwrap();
        flags.set_uncommit_delay_millis(90_000).unwrap();
        assert_eq!(flags.evaluation_interval(), Duration::from_millis(45_000));
        assert_eq!(flags.uncommit_delay(), Duration::from_millis(90_000));

        assert!(flags.set_evaluation_interval_millis(0).is_err());
        assert!(flags.set_uncommit_delay_millis(100).is_err());
        assert!(flags.set_min_regions_to_uncommit(0).is_err());

        // rejected updates leave the live values alone
        let snapshot = flags.snapshot();
        assert_eq!(snapshot.evaluation_interval_millis, 45_000);
        assert_eq!(snapshot.uncommit_delay_millis, 90_000);
        assert_eq!(snapshot.min_regions_to_uncommit, DEFAULT_MIN_REGIONS_TO_UNCOMMIT);
    }

    #[test]
    fn new_flags_reject_invalid_config() {
        let config = SizingConfig {
            growth_threshold: 0.0,
            ..Default::default()
        };
        assert!(SizingFlags::new(&config).is_err());
    }
}
