//! Startup configuration (SPEC_FULL.md §2a), loaded once from a TOML file
//! given on the CLI. A malformed file is a startup error, never silently
//! defaulted, the same contract `braid-config-data` enforces for Braid's
//! own config.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to expand path {raw}: {source}")]
    ShellExpand {
        raw: String,
        #[source]
        source: shellexpand::LookupError<std::env::VarError>,
    },
}

fn default_http_addr() -> String {
    "127.0.0.1:7879".to_string()
}

fn default_min_fps() -> f64 {
    5.0
}

fn default_log_level() -> String {
    "info".to_string()
}

/// One calibration control point, deserialized directly from TOML/CSV
/// (spec.md §4.A: "Calibration points are loaded once").
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ControlPointConfig {
    pub lat: f64,
    pub lng: f64,
    pub ref_x: f64,
    pub ref_y: f64,
}

/// Overrides for one cascade level; any field left unset falls back to
/// `viewport_core`'s own default for that level.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct CascadeLevelOverride {
    pub tau_conf: Option<f64>,
    pub n_min: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Path to the immutable grayscale reference-map image.
    pub reference_map_path: PathBuf,
    /// Path the feature-pyramid cache is persisted to/loaded from.
    #[serde(default = "default_pyramid_cache_path")]
    pub pyramid_cache_path: PathBuf,
    /// Calibration control points; at least 3 required.
    pub control_points: Vec<ControlPointConfig>,
    /// Address the HTTP/WebSocket surface binds to.
    #[serde(default = "default_http_addr")]
    pub http_bind_addr: String,
    /// Scheduler floor (spec.md §4.H step 5 clamp).
    #[serde(default = "default_min_fps")]
    pub min_fps: f64,
    /// Optional scheduler ceiling; spec.md §4.H default is uncapped.
    pub max_fps: Option<f64>,
    /// Initial `target_fps` before the first adaptation.
    #[serde(default = "default_min_fps")]
    pub initial_target_fps: f64,
    /// Per-level overrides, keyed by level name (`"coarse"`, `"medium"`,
    /// `"fine"` by default).
    #[serde(default)]
    pub cascade_overrides: std::collections::HashMap<String, CascadeLevelOverride>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_pyramid_cache_path() -> PathBuf {
    PathBuf::from("pyramid_cache.bin")
}

impl Config {
    /// Loads and parses the config file; a missing or malformed file is a
    /// startup error (SPEC_FULL.md §2a).
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config = toml::from_str(&raw).map_err(|source| ConfigError::Toml {
            path: path.to_path_buf(),
            source,
        })?;

        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        config.reference_map_path = Self::fixup_relative(&config.reference_map_path, dir)?;
        config.pyramid_cache_path = Self::fixup_relative(&config.pyramid_cache_path, dir)?;
        Ok(config)
    }

    /// Expands shell variables/`~` and resolves relative paths against
    /// the config file's own directory, exactly as `braid-config-data`
    /// does for its own path fields.
    fn fixup_relative(path: &PathBuf, dir: &std::path::Path) -> Result<PathBuf, ConfigError> {
        let raw = path.to_string_lossy().to_string();
        let expanded = shellexpand::full(&raw).map_err(|source| ConfigError::ShellExpand {
            raw: raw.clone(),
            source,
        })?;
        let mut out = PathBuf::from(expanded.to_string());
        if out.is_relative() {
            out = dir.join(out);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_fields() {
        let toml_src = r#"
            reference_map_path = "map.png"
            control_points = []
            bogus_field = 1
        "#;
        let parsed: Result<Config, _> = toml::from_str(toml_src);
        assert!(parsed.is_err());
    }

    #[test]
    fn defaults_apply_when_fields_missing() {
        let toml_src = r#"
            reference_map_path = "map.png"
            control_points = []
        "#;
        let parsed: Config = toml::from_str(toml_src).unwrap();
        assert_eq!(parsed.http_bind_addr, "127.0.0.1:7879");
        assert_eq!(parsed.pyramid_cache_path, PathBuf::from("pyramid_cache.bin"));
    }
}
