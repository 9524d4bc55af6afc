//! Loading configuration files and resolving per-layer settings

use super::schema::{GptqConfig, LayerQuantConfig};
use super::validate::validate_config;
use crate::error::{Error, Result};
use regex::Regex;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Load and validate a quantization config from a YAML file
///
/// # Errors
/// Returns `Error::ConfigError` if the file cannot be read, parsed or validated
pub fn load_config<P: AsRef<Path>>(config_path: P) -> Result<GptqConfig> {
    let yaml_content = fs::read_to_string(config_path.as_ref()).map_err(|e| {
        Error::ConfigError(format!(
            "Failed to read config file {}: {}",
            config_path.as_ref().display(),
            e
        ))
    })?;

    parse_config(&yaml_content)
}

/// Parse and validate a config from YAML text
pub fn parse_config(yaml_content: &str) -> Result<GptqConfig> {
    let config: GptqConfig = serde_yaml::from_str(yaml_content)
        .map_err(|e| Error::ConfigError(format!("Failed to parse YAML config: {}", e)))?;

    validate_config(&config).map_err(|e| Error::ConfigError(format!("Invalid config: {}", e)))?;

    Ok(config)
}

fn anchored(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("^(?:{pattern})$"))
        .map_err(|e| Error::ConfigError(format!("Invalid layer pattern {pattern:?}: {e}")))
}

/// Resolves the settings of a full layer name.
///
/// Lookup order: exact override key, then the first override pattern that
/// matches the whole name, then the defaults. Patterns are matched against the
/// entire name so `layers.1` never matches `layers.10`.
#[derive(Debug, Clone)]
pub struct LayerResolver {
    defaults: LayerQuantConfig,
    exact: HashMap<String, LayerQuantConfig>,
    patterns: Vec<(Regex, LayerQuantConfig)>,
    exclude: Vec<(String, Regex)>,
}

impl LayerResolver {
    pub fn new(config: &GptqConfig) -> Result<Self> {
        let mut exact = HashMap::new();
        let mut patterns = Vec::with_capacity(config.layers.len());
        for (key, layer_override) in &config.layers {
            let resolved = layer_override.apply(&config.defaults);
            exact.entry(key.clone()).or_insert(resolved);
            patterns.push((anchored(key)?, resolved));
        }

        let exclude = config
            .exclude
            .iter()
            .map(|p| Ok((p.clone(), anchored(p)?)))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            defaults: config.defaults,
            exact,
            patterns,
            exclude,
        })
    }

    pub fn is_excluded(&self, name: &str) -> bool {
        self.exclude
            .iter()
            .any(|(raw, re)| raw == name || re.is_match(name))
    }

    /// Settings for `name`, or `None` when the layer is excluded
    pub fn resolve(&self, name: &str) -> Option<LayerQuantConfig> {
        if self.is_excluded(name) {
            return None;
        }
        if let Some(cfg) = self.exact.get(name) {
            return Some(*cfg);
        }
        self.patterns
            .iter()
            .find(|(re, _)| re.is_match(name))
            .map(|(_, cfg)| *cfg)
            .or(Some(self.defaults))
    }
}
