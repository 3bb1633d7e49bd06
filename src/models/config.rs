//! Configuration models for harvest.
//!
//! All I^R (resolvable ignorance) is parameterized here.
//! The user resolves these unknowns at runtime via config file.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration for harvest.
///
/// I^R resolved: All configurable parameters are explicit. Every section is
/// optional in the TOML file and falls back to its defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Sliding-window rate limit applied to every outbound call
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Retry and backoff for transient faults
    #[serde(default)]
    pub retry: RetryConfig,

    /// Bounded-concurrency batch settings
    #[serde(default)]
    pub batch: BatchConfig,

    /// Durable progress store
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Optional record cache for fetched keys
    #[serde(default)]
    pub cache: CacheConfig,

    /// HTTP source adapter
    #[serde(default)]
    pub http: HttpConfig,

    /// Merge-by-key settings
    #[serde(default)]
    pub merge: MergeConfig,

    /// Deduplication settings
    #[serde(default)]
    pub dedup: DedupConfig,
}

/// Sliding-window rate limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum calls within the trailing window
    #[serde(default = "default_max_calls")]
    pub max_calls: usize,

    /// Window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Minimum spacing between consecutive calls in milliseconds
    #[serde(default = "default_min_spacing_ms")]
    pub min_spacing_ms: u64,
}

fn default_max_calls() -> usize {
    100
}

fn default_window_secs() -> u64 {
    3600
}

fn default_min_spacing_ms() -> u64 {
    100
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_calls: default_max_calls(),
            window_secs: default_window_secs(),
            min_spacing_ms: default_min_spacing_ms(),
        }
    }
}

/// Retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay in milliseconds (doubled per attempt)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Backoff cap in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Batch (bounded-concurrency) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Maximum fetches in flight
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Keys per chunk
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Pause between chunks in milliseconds
    #[serde(default = "default_chunk_pause_ms")]
    pub chunk_pause_ms: u64,
}

fn default_concurrency() -> usize {
    5
}

fn default_chunk_size() -> usize {
    100
}

fn default_chunk_pause_ms() -> u64 {
    500
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            chunk_size: default_chunk_size(),
            chunk_pause_ms: default_chunk_pause_ms(),
        }
    }
}

impl BatchConfig {
    pub fn chunk_pause(&self) -> Duration {
        Duration::from_millis(self.chunk_pause_ms)
    }
}

/// Checkpoint store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Directory holding `<operation>_progress.json` / `<operation>_partial.json`
    #[serde(default = "default_checkpoint_dir")]
    pub dir: PathBuf,

    /// Write a checkpoint after this many completions. Interrupted and
    /// finished runs always flush.
    #[serde(default = "default_checkpoint_every")]
    pub every: usize,

    /// Delete saved progress once a run finishes every key
    #[serde(default = "default_true")]
    pub clear_on_complete: bool,
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from(".cache/progress")
}

fn default_checkpoint_every() -> usize {
    100
}

fn default_true() -> bool {
    true
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            dir: default_checkpoint_dir(),
            every: default_checkpoint_every(),
            clear_on_complete: default_true(),
        }
    }
}

/// Record cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Whether fetched records are cached on disk
    #[serde(default)]
    pub enabled: bool,

    /// Cache directory (one file per key)
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(".cache/records")
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: default_cache_dir(),
        }
    }
}

/// HTTP source configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// URL template; `{key}` is replaced by the work item key
    #[serde(default)]
    pub url_template: Option<String>,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Extra request headers; values may contain ${ENV_VAR}
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

fn default_timeout() -> u64 {
    30
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            url_template: None,
            timeout_secs: default_timeout(),
            headers: HashMap::new(),
        }
    }
}

/// Merge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Candidate business key fields, highest priority first
    #[serde(default = "default_key_fields")]
    pub key_fields: Vec<String>,

    /// Source names, highest priority first
    #[serde(default)]
    pub field_priority: Vec<String>,

    /// Prefix every field with its source name
    #[serde(default = "default_true")]
    pub prefix_fields: bool,

    /// Field name holding the business key in merged output
    #[serde(default = "default_output_key")]
    pub output_key: String,
}

fn default_key_fields() -> Vec<String> {
    vec!["key".to_string(), "id".to_string()]
}

fn default_output_key() -> String {
    "key".to_string()
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            key_fields: default_key_fields(),
            field_priority: Vec::new(),
            prefix_fields: default_true(),
            output_key: default_output_key(),
        }
    }
}

/// Deduplication strategy selector.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    /// First record per business key
    #[default]
    Identity,
    /// Identical canonical record hash
    Exact,
    /// Composite case-folded key over several fields
    Fuzzy,
}

impl std::str::FromStr for StrategyKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "identity" | "key" => Ok(Self::Identity),
            "exact" | "hash" => Ok(Self::Exact),
            "fuzzy" => Ok(Self::Fuzzy),
            other => Err(ConfigError::Invalid(format!(
                "unknown dedup strategy '{other}' (expected identity, exact or fuzzy)"
            ))),
        }
    }
}

/// Deduplication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    #[serde(default)]
    pub strategy: StrategyKind,

    /// Fields combined into the fuzzy composite key
    #[serde(default = "default_fuzzy_fields")]
    pub fuzzy_fields: Vec<String>,

    /// Fold duplicate groups into one most-complete record instead of dropping
    #[serde(default)]
    pub merge: bool,
}

fn default_fuzzy_fields() -> Vec<String> {
    vec!["key".to_string(), "name".to_string()]
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::default(),
            fuzzy_fields: default_fuzzy_fields(),
            merge: false,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// B_i(file exists) → Result
    /// B_i(file is valid TOML) → Result
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        let mut config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_owned(),
            source: e,
        })?;
        config.expand_paths();
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall or break a run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rate_limit.max_calls == 0 {
            return Err(ConfigError::Invalid(
                "rate_limit.max_calls must be at least 1".to_string(),
            ));
        }
        if self.rate_limit.window_secs == 0 {
            return Err(ConfigError::Invalid(
                "rate_limit.window_secs must be at least 1".to_string(),
            ));
        }
        if self.batch.concurrency == 0 {
            return Err(ConfigError::Invalid(
                "batch.concurrency must be at least 1".to_string(),
            ));
        }
        if self.batch.chunk_size == 0 {
            return Err(ConfigError::Invalid(
                "batch.chunk_size must be at least 1".to_string(),
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::Invalid(
                "retry.base_delay_ms must not exceed retry.max_delay_ms".to_string(),
            ));
        }
        if self.merge.key_fields.is_empty() {
            return Err(ConfigError::Invalid(
                "merge.key_fields must name at least one field".to_string(),
            ));
        }
        Ok(())
    }

    /// Expand ${VAR} in directory paths.
    fn expand_paths(&mut self) {
        let expand = |p: &PathBuf| PathBuf::from(expand_env_vars(&p.to_string_lossy()));
        self.checkpoint.dir = expand(&self.checkpoint.dir);
        self.cache.dir = expand(&self.cache.dir);
    }
}

/// Expand environment variables in a string.
///
/// Supports ${VAR_NAME} syntax.
/// If the variable is not set, the placeholder is left unchanged.
pub fn expand_env_vars(s: &str) -> String {
    let mut result = s.to_string();
    let re = match regex::Regex::new(r"\$\{([^}]+)\}") {
        Ok(re) => re,
        Err(_) => return result,
    };

    for cap in re.captures_iter(s) {
        let var_name = &cap[1];
        if let Ok(value) = std::env::var(var_name) {
            result = result.replace(&cap[0], &value);
        }
    }

    result
}

/// Expand environment variables in all headers.
pub fn expand_headers(headers: &HashMap<String, String>) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(k, v)| (k.clone(), expand_env_vars(v)))
        .collect()
}

/// Configuration errors.
///
/// Epistemic origin:
/// - B_i falsified: File not found, parse error
/// - I^B materialized: Values that cannot drive a run
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
