use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::{
    DEFAULT_DENSIFY_LEVELS, DEFAULT_MAX_MEMORY_BYTES, DEFAULT_MAX_MEMORY_FRACTION,
    PROGRESS_INTERVAL_SECS,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to parse mapper config RON: {0}")]
    Parse(String),
    #[error("Invalid mapper config: {0}")]
    Invalid(String),
}

/// Tunables of the volume mapper. Every field has a default, so a RON file
/// only needs to name the values it overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapperConfig {
    /// Total GPU memory the mapper may assume is available, in bytes.
    pub max_memory_bytes: u64,
    /// Fraction of `max_memory_bytes` one resident volume may occupy.
    pub max_memory_fraction: f64,
    /// Derive sample distances from the volume spacing and the time budget.
    pub auto_adjust_sample_distances: bool,
    /// World-space ray step when auto adjustment is off.
    pub sample_distance: f64,
    /// Pixels per ray when auto adjustment is off.
    pub image_sample_distance: f64,
    pub minimum_image_sample_distance: f64,
    pub maximum_image_sample_distance: f64,
    /// Centroid-fan subdivision passes applied to every clipped hull.
    pub densify_levels: u32,
    pub report_progress: bool,
    pub progress_interval_secs: f64,
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            max_memory_bytes: DEFAULT_MAX_MEMORY_BYTES,
            max_memory_fraction: DEFAULT_MAX_MEMORY_FRACTION,
            auto_adjust_sample_distances: true,
            sample_distance: 1.0,
            image_sample_distance: 1.0,
            minimum_image_sample_distance: 1.0,
            maximum_image_sample_distance: 10.0,
            densify_levels: DEFAULT_DENSIFY_LEVELS,
            report_progress: true,
            progress_interval_secs: PROGRESS_INTERVAL_SECS,
        }
    }
}

impl MapperConfig {
    /// Parse and validate a config from RON text.
    pub fn from_ron_str(ron_str: &str) -> Result<Self, ConfigError> {
        let options = ron::Options::default();
        let config: MapperConfig = options
            .from_str(ron_str)
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Byte budget a single texture set may use.
    pub fn memory_budget_bytes(&self) -> u64 {
        (self.max_memory_bytes as f64 * self.max_memory_fraction) as u64
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_memory_bytes == 0 {
            return Err(ConfigError::Invalid("max_memory_bytes must be positive".into()));
        }
        if !(self.max_memory_fraction > 0.0 && self.max_memory_fraction <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "max_memory_fraction {} outside (0, 1]",
                self.max_memory_fraction
            )));
        }
        if !(self.sample_distance > 0.0) {
            return Err(ConfigError::Invalid("sample_distance must be positive".into()));
        }
        if !(self.minimum_image_sample_distance > 0.0) {
            return Err(ConfigError::Invalid(
                "minimum_image_sample_distance must be positive".into(),
            ));
        }
        if self.minimum_image_sample_distance > self.maximum_image_sample_distance {
            return Err(ConfigError::Invalid(format!(
                "minimum_image_sample_distance {} exceeds maximum {}",
                self.minimum_image_sample_distance, self.maximum_image_sample_distance
            )));
        }
        if self.maximum_image_sample_distance < 1.0 {
            return Err(ConfigError::Invalid(
                "maximum_image_sample_distance must be at least 1".into(),
            ));
        }
        if self.image_sample_distance < 1.0 {
            return Err(ConfigError::Invalid(
                "image_sample_distance must be at least 1".into(),
            ));
        }
        if self.progress_interval_secs < 0.0 {
            return Err(ConfigError::Invalid(
                "progress_interval_secs must not be negative".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        MapperConfig::default().validate().expect("defaults validate");
    }

    #[test]
    fn test_partial_ron_overrides() {
        let config = MapperConfig::from_ron_str(
            "(max_memory_bytes: 1048576, auto_adjust_sample_distances: false, sample_distance: 0.5)",
        )
        .expect("config should parse");
        assert_eq!(config.max_memory_bytes, 1_048_576);
        assert!(!config.auto_adjust_sample_distances);
        assert_eq!(config.sample_distance, 0.5);
        assert_eq!(config.densify_levels, DEFAULT_DENSIFY_LEVELS);
        assert_eq!(config.memory_budget_bytes(), 786_432);
    }

    #[test]
    fn test_rejects_inverted_sample_range() {
        let err = MapperConfig::from_ron_str(
            "(minimum_image_sample_distance: 4.0, maximum_image_sample_distance: 2.0)",
        )
        .expect_err("range is inverted");
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_parse_error_is_reported() {
        let err = MapperConfig::from_ron_str("(max_memory_bytes: \"lots\")").expect_err("bad type");
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
