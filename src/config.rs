use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level configuration loaded from procwatch.toml.
#[derive(Debug, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct WatchConfig {
    pub python: PythonConfig,
    pub sampler: SamplerConfig,
    pub reconcile: ReconcileConfig,
    pub drain: DrainConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct PythonConfig {
    /// Explicit interpreter path. Overrides auto-resolution but not the
    /// `--python` CLI flag.
    pub interpreter: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Process-tree sampling cadence in milliseconds. Also bounds how long a
    /// cancellation request can go unnoticed by the sampling loop.
    pub interval_ms: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Grace period before the leak scan, giving the OS time to tear down
    /// descendants of an exited child. A heuristic tunable.
    pub grace_ms: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DrainConfig {
    /// Bound on waiting for each output reader to finish after the child
    /// exits. A leaked descendant can hold the pipe open forever.
    pub join_timeout_ms: u64,
}

// --- Default implementations ---

impl Default for SamplerConfig {
    fn default() -> Self {
        Self { interval_ms: 100 }
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self { grace_ms: 400 }
    }
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            join_timeout_ms: 2000,
        }
    }
}

/// Errors that can occur while loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read the config file.
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Failed to parse the config file as TOML.
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

/// Load configuration from `path`. A missing file is not an error: all
/// sections fall back to their defaults.
pub fn load(path: &Path) -> Result<WatchConfig, ConfigError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(WatchConfig::default());
        }
        Err(e) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            });
        }
    };
    toml::from_str(&raw).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}
