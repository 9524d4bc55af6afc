//! Serialization format definitions

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Supported artifact and tensor file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArtifactFormat {
    /// JSON format (human-readable, larger file size)
    Json,

    /// YAML format (human-readable)
    Yaml,

    /// SafeTensors format (HuggingFace compatible, efficient binary)
    SafeTensors,
}

impl ArtifactFormat {
    /// Get file extension for this format
    pub fn extension(&self) -> &str {
        match self {
            ArtifactFormat::Json => "json",
            ArtifactFormat::Yaml => "yaml",
            ArtifactFormat::SafeTensors => "safetensors",
        }
    }

    /// Detect format from file extension
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "json" => Some(ArtifactFormat::Json),
            "yaml" | "yml" => Some(ArtifactFormat::Yaml),
            "safetensors" => Some(ArtifactFormat::SafeTensors),
            _ => None,
        }
    }

    /// Detect format from a path's extension
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|s| s.to_str())
            .and_then(Self::from_extension)
    }
}

/// Configuration for saving artifacts
#[derive(Debug, Clone)]
pub struct SaveConfig {
    /// Serialization format
    pub format: ArtifactFormat,

    /// Whether to pretty-print (JSON only)
    pub pretty: bool,
}

impl SaveConfig {
    /// Create new save config with format
    pub fn new(format: ArtifactFormat) -> Self {
        Self {
            format,
            pretty: true,
        }
    }

    /// Format inferred from the output path, JSON when unknown
    pub fn for_path(path: &Path) -> Self {
        Self::new(ArtifactFormat::from_path(path).unwrap_or(ArtifactFormat::Json))
    }

    /// Enable/disable pretty printing
    pub fn with_pretty(mut self, pretty: bool) -> Self {
        self.pretty = pretty;
        self
    }
}

impl Default for SaveConfig {
    fn default() -> Self {
        Self::new(ArtifactFormat::Json)
    }
}
