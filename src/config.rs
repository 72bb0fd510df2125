//! Server configuration.
//!
//! Handles loading, validating and merging `variant-forge.toml`. User values
//! are merged on top of stock defaults, so a config file only needs the keys
//! it wants to change.
//!
//! ## Configuration Options
//!
//! ```toml
//! # All options are optional - defaults shown below
//!
//! public_root = "public"            # Where originals live
//! cache_root = "public/processed"   # Where variants are written
//!
//! [lock]
//! backend = "memory"      # "memory" (one process) or "file" (shared lock dir)
//! dir = "var/locks"       # Lock file directory for the file backend
//! max_attempts = 10       # Acquire attempts before answering 503
//! poll_interval_ms = 100  # Sleep after each failed attempt
//! stale_after_secs = 300  # File locks older than this are taken over (0 = never)
//!
//! [formats]
//! webp = true             # Generate a .webp sibling next to each variant
//! avif = true             # Generate an .avif sibling next to each variant
//!
//! [processing]
//! max_threads = 4         # Encoder threads (omit for auto = CPU cores)
//! max_dimension = 10000   # Largest output side; bigger requests are refused
//!
//! [server]
//! bind = "127.0.0.1:8080"
//! ```
//!
//! Unknown keys are rejected to catch typos early.

use crate::lock::{FileLocks, Gate, LockError, LockStrategy, MemoryLocks};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Config file looked up when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "variant-forge.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Directory holding the originals that variant paths refer to.
    pub public_root: PathBuf,
    /// Directory the variants are written to.
    pub cache_root: PathBuf,
    pub lock: LockConfig,
    pub formats: FormatsConfig,
    pub processing: ProcessingConfig,
    pub server: ServerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            public_root: PathBuf::from("public"),
            cache_root: PathBuf::from("public/processed"),
            lock: LockConfig::default(),
            formats: FormatsConfig::default(),
            processing: ProcessingConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl Config {
    /// Validate config values are within acceptable ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lock.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "lock.max_attempts must be at least 1".into(),
            ));
        }
        if self.lock.poll_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "lock.poll_interval_ms must be non-zero".into(),
            ));
        }
        if self.processing.max_dimension == 0 {
            return Err(ConfigError::Validation(
                "processing.max_dimension must be at least 1".into(),
            ));
        }
        if self.public_root.as_os_str().is_empty() || self.cache_root.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "public_root and cache_root must not be empty".into(),
            ));
        }
        if self.server.bind.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::Validation(format!(
                "server.bind is not a socket address: {}",
                self.server.bind
            )));
        }
        Ok(())
    }
}

/// Which [`LockStrategy`] backs the gate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockBackend {
    #[default]
    Memory,
    File,
}

/// Lock backend and retry budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LockConfig {
    pub backend: LockBackend,
    pub dir: PathBuf,
    pub max_attempts: u32,
    pub poll_interval_ms: u64,
    /// Age after which a file lock counts as abandoned. 0 disables takeover.
    pub stale_after_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            backend: LockBackend::Memory,
            dir: PathBuf::from("var/locks"),
            max_attempts: 10,
            poll_interval_ms: 100,
            stale_after_secs: 300,
        }
    }
}

impl LockConfig {
    pub fn strategy(&self) -> Result<Arc<dyn LockStrategy>, LockError> {
        Ok(match self.backend {
            LockBackend::Memory => Arc::new(MemoryLocks::new()),
            LockBackend::File => {
                let stale_after =
                    (self.stale_after_secs > 0).then(|| Duration::from_secs(self.stale_after_secs));
                Arc::new(FileLocks::new(&self.dir, stale_after)?)
            }
        })
    }

    pub fn gate(&self) -> Result<Gate, LockError> {
        Ok(Gate::new(
            self.strategy()?,
            self.max_attempts,
            Duration::from_millis(self.poll_interval_ms),
        ))
    }
}

/// Next-gen siblings generated next to every variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FormatsConfig {
    pub webp: bool,
    pub avif: bool,
}

impl Default for FormatsConfig {
    fn default() -> Self {
        Self {
            webp: true,
            avif: true,
        }
    }
}

/// Largest width or height a variant may have by default.
pub const DEFAULT_MAX_DIMENSION: u32 = 10_000;

/// Parallel processing settings and output limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessingConfig {
    /// Maximum number of encoder threads.
    /// When absent, defaults to the number of CPU cores.
    /// Values larger than the core count are clamped down.
    pub max_threads: Option<usize>,
    /// Largest side, in pixels, of a variant or of the intermediate image a
    /// cover resize scales to before cropping.
    pub max_dimension: u32,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_threads: None,
            max_dimension: DEFAULT_MAX_DIMENSION,
        }
    }
}

/// Resolve the effective thread count from config.
///
/// - `None` → use all available cores
/// - `Some(n)` → use `min(n, cores)` (user can constrain down, not up)
pub fn effective_threads(config: &ProcessingConfig) -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    config.max_threads.map(|n| n.clamp(1, cores)).unwrap_or(cores)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

/// Returns the stock default config as a `toml::Value::Table`.
pub fn stock_defaults_value() -> Result<toml::Value, ConfigError> {
    Ok(toml::Value::try_from(Config::default())?)
}

/// Recursively merge `overlay` on top of `base`.
///
/// - Tables are merged key-by-key (overlay keys override base keys).
/// - Non-table values in overlay replace base values entirely.
/// - Keys in base that are not in overlay are preserved.
pub fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                let merged = match base_table.remove(&key) {
                    Some(base_val) => merge_toml(base_val, overlay_val),
                    None => overlay_val,
                };
                base_table.insert(key, merged);
            }
            toml::Value::Table(base_table)
        }
        (_, overlay) => overlay,
    }
}

/// Merge an optional overlay onto the stock defaults, then deserialize and validate.
pub fn resolve_config(overlay: Option<toml::Value>) -> Result<Config, ConfigError> {
    let base = stock_defaults_value()?;
    let merged = match overlay {
        Some(ov) => merge_toml(base, ov),
        None => base,
    };
    let config: Config = merged.try_into()?;
    config.validate()?;
    Ok(config)
}

/// Load a config file. A missing file yields the stock defaults.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return resolve_config(None);
    }
    let content = fs::read_to_string(path)?;
    let value: toml::Value = toml::from_str(&content)?;
    resolve_config(Some(value))
}

/// Returns a fully-commented stock config file with all keys and explanations.
///
/// Used by the `gen-config` CLI command.
pub fn stock_config_toml() -> &'static str {
    r##"# variant-forge configuration
# ===========================
# All settings are optional. Remove or comment out any you don't need.
# Values shown below are the defaults. Unknown keys will cause an error.

# Directory holding the original images. A request for
#   /processed/images/photo.w800.jpg
# reads <public_root>/images/photo.jpg.
public_root = "public"

# Directory the generated variants are written to. Nothing here is ever
# evicted; use `variant-forge purge` to start over.
cache_root = "public/processed"

# ---------------------------------------------------------------------------
# Locking
# ---------------------------------------------------------------------------
[lock]
# "memory" serializes generation within one process.
# "file" uses lock files in `dir`, for several processes sharing a cache.
backend = "memory"
dir = "var/locks"

# A request tries max_attempts times and sleeps poll_interval_ms after each
# failed try, so it waits at most max_attempts * poll_interval_ms for a busy
# variant before answering 503.
max_attempts = 10
poll_interval_ms = 100

# File locks older than this many seconds are treated as abandoned.
# 0 disables takeover.
stale_after_secs = 300

# ---------------------------------------------------------------------------
# Sibling formats
# ---------------------------------------------------------------------------
[formats]
# Encode these next to every variant and serve them in preference
# (AVIF first, then WebP). Clients can opt out per request with
# ?skipWebP=1 / ?skipAvif=1.
webp = true
avif = true

# ---------------------------------------------------------------------------
# Processing
# ---------------------------------------------------------------------------
[processing]
# Maximum encoder threads. Omit to use all CPU cores.
# Values above the core count are clamped down.
# max_threads = 4

# Largest width or height of a generated variant. Requests that would
# produce anything larger are refused with 404 instead of allocating it.
max_dimension = 10000

# ---------------------------------------------------------------------------
# HTTP server
# ---------------------------------------------------------------------------
[server]
bind = "127.0.0.1:8080"
"##
}
