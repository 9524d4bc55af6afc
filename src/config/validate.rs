//! Configuration validation

use super::schema::{GptqConfig, LayerQuantConfig};
use regex::Regex;

/// Validation error type
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Invalid quantization bits for {layer}: {bits} (must be 1..=16)")]
    InvalidBits { layer: String, bits: u8 },

    #[error("Ternary mode cannot be combined with MSE search ({0})")]
    TritsWithMseSearch(String),

    #[error("Invalid block size for {0}: must be > 0")]
    InvalidBlockSize(String),

    #[error("Invalid damp_fraction for {layer}: {value} (must be finite and >= 0)")]
    InvalidDampFraction { layer: String, value: f64 },

    #[error("Invalid MSE search settings for {layer}: {reason}")]
    InvalidSearch { layer: String, reason: String },

    #[error("Invalid layer pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Invalid calibration settings: {0}")]
    InvalidCalibration(String),
}

fn validate_layer(layer: &str, cfg: &LayerQuantConfig) -> Result<(), ValidationError> {
    if cfg.bits == 0 || cfg.bits > 16 {
        return Err(ValidationError::InvalidBits {
            layer: layer.to_string(),
            bits: cfg.bits,
        });
    }
    if cfg.trits && cfg.use_mse_search {
        return Err(ValidationError::TritsWithMseSearch(layer.to_string()));
    }
    if cfg.block_size == 0 {
        return Err(ValidationError::InvalidBlockSize(layer.to_string()));
    }
    if !(cfg.damp_fraction.is_finite() && cfg.damp_fraction >= 0.0) {
        return Err(ValidationError::InvalidDampFraction {
            layer: layer.to_string(),
            value: cfg.damp_fraction,
        });
    }
    if cfg.use_mse_search {
        let reason = if cfg.grid == 0 {
            Some("grid must be > 0".to_string())
        } else if !(cfg.max_shrink > 0.0 && cfg.max_shrink <= 1.0) {
            Some(format!("max_shrink {} must be in (0, 1]", cfg.max_shrink))
        } else if !(cfg.norm.is_finite() && cfg.norm > 0.0) {
            Some(format!("norm {} must be finite and > 0", cfg.norm))
        } else {
            None
        };
        if let Some(reason) = reason {
            return Err(ValidationError::InvalidSearch {
                layer: layer.to_string(),
                reason,
            });
        }
    }
    Ok(())
}

fn validate_pattern(pattern: &str) -> Result<(), ValidationError> {
    Regex::new(pattern)
        .map(|_| ())
        .map_err(|e| ValidationError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })
}

/// Validate a quantization config
///
/// Checks:
/// - Bit widths and mode combinations for the defaults and every override
/// - Numeric ranges (block size, damping, MSE search grid)
/// - Layer and exclude patterns compile
/// - Calibration sizes are non-zero
pub fn validate_config(config: &GptqConfig) -> Result<(), ValidationError> {
    validate_layer("defaults", &config.defaults)?;

    for (pattern, layer_override) in &config.layers {
        validate_pattern(pattern)?;
        validate_layer(pattern, &layer_override.apply(&config.defaults))?;
    }

    for pattern in &config.exclude {
        validate_pattern(pattern)?;
    }

    if config.calibration.nsamples == 0 {
        return Err(ValidationError::InvalidCalibration(
            "nsamples must be > 0".to_string(),
        ));
    }
    if config.calibration.pad_max_length == 0 {
        return Err(ValidationError::InvalidCalibration(
            "pad_max_length must be > 0".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::LayerOverride;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&GptqConfig::default()).is_ok());
    }

    #[test]
    fn test_invalid_bits() {
        let mut config = GptqConfig::default();
        config.defaults.bits = 0;
        assert!(matches!(
            validate_config(&config),
            Err(ValidationError::InvalidBits { bits: 0, .. })
        ));
    }

    #[test]
    fn test_override_checked_against_defaults() {
        let mut config = GptqConfig::default();
        config.layers.push((
            "layers.0.q".to_string(),
            LayerOverride {
                bits: Some(17),
                ..LayerOverride::default()
            },
        ));
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("layers.0.q"));
    }

    #[test]
    fn test_trits_with_mse_rejected() {
        let mut config = GptqConfig::default();
        config.defaults.trits = true;
        config.defaults.use_mse_search = true;
        assert!(matches!(
            validate_config(&config),
            Err(ValidationError::TritsWithMseSearch(_))
        ));
    }

    #[test]
    fn test_bad_search_grid() {
        let mut config = GptqConfig::default();
        config.defaults.use_mse_search = true;
        config.defaults.max_shrink = 1.5;
        assert!(matches!(
            validate_config(&config),
            Err(ValidationError::InvalidSearch { .. })
        ));
    }

    #[test]
    fn test_bad_pattern() {
        let mut config = GptqConfig::default();
        config.exclude.push("layers.(".to_string());
        assert!(matches!(
            validate_config(&config),
            Err(ValidationError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_negative_damp() {
        let mut config = GptqConfig::default();
        config.defaults.damp_fraction = -0.1;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_zero_samples() {
        let mut config = GptqConfig::default();
        config.calibration.nsamples = 0;
        assert!(matches!(
            validate_config(&config),
            Err(ValidationError::InvalidCalibration(_))
        ));
    }
}
