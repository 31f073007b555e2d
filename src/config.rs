//! Consumer configuration from environment variables

use crate::error::ConfigError;
use crate::register::RegisterLayout;
use std::env;
use std::str::FromStr;

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(key).and_then(|s| s.trim().parse().ok())
}

/// Configuration for one consumer run
///
/// Loaded from environment variables with sensible defaults. Channel
/// directives live in a separate JSON file (`directives_path`).
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Path to SQLite database file
    pub db_path: String,

    /// Channel directive file (JSON)
    pub directives_path: String,

    /// JSON-lines alert source, required by the binary only
    pub alerts_path: Option<String>,

    pub register_dir: String,
    pub register_prefix: String,
    pub register_layout: RegisterLayout,

    /// Track whether rejected stocks were ever accepted before
    pub register_active: bool,

    /// Blocks per register file before rotation
    pub register_max_blocks: u64,

    pub register_retries: u32,
    pub register_retry_base_ms: u64,
    pub register_retry_max_ms: u64,

    /// Accepted alerts buffered before one store flush
    pub updates_buffer_size: usize,

    pub store_max_retries: u32,
    pub store_retry_base_ms: u64,
    pub store_retry_max_ms: u64,

    /// Evaluate filter blocks on scoped threads
    pub parallel_filters: bool,

    /// Cancel the run after this many per-alert errors
    pub error_max: Option<u64>,

    /// Stop after this many alerts
    pub iter_max: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            db_path: "/var/lib/alertflow/alertflow.db".to_string(),
            directives_path: "directives.json".to_string(),
            alerts_path: None,
            register_dir: "/var/lib/alertflow/register".to_string(),
            register_prefix: "rejected".to_string(),
            register_layout: RegisterLayout::General,
            register_active: true,
            register_max_blocks: 1_000_000,
            register_retries: 3,
            register_retry_base_ms: 10,
            register_retry_max_ms: 500,
            updates_buffer_size: 500,
            store_max_retries: 5,
            store_retry_base_ms: 100,
            store_retry_max_ms: 5_000,
            parallel_filters: false,
            error_max: Some(100),
            iter_max: None,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `ALERTFLOW_DB_PATH` (default: /var/lib/alertflow/alertflow.db)
    /// - `ALERTFLOW_DIRECTIVES` (default: directives.json)
    /// - `ALERTFLOW_ALERTS` (no default)
    /// - `ALERTFLOW_REGISTER_DIR` (default: /var/lib/alertflow/register)
    /// - `REGISTER_PREFIX` (default: rejected)
    /// - `REGISTER_LAYOUT` minimal|general|full (default: general)
    /// - `REGISTER_ACTIVE` (default: true)
    /// - `REGISTER_MAX_BLOCKS` (default: 1000000)
    /// - `REGISTER_RETRIES` (default: 3)
    /// - `REGISTER_RETRY_BASE_MS` (default: 10)
    /// - `REGISTER_RETRY_MAX_MS` (default: 500)
    /// - `UPDATES_BUFFER_SIZE` (default: 500)
    /// - `STORE_MAX_RETRIES` (default: 5)
    /// - `STORE_RETRY_BASE_MS` (default: 100)
    /// - `STORE_RETRY_MAX_MS` (default: 5000)
    /// - `PARALLEL_FILTERS` (default: false)
    /// - `ERROR_MAX` (default: 100, 0 disables)
    /// - `ITER_MAX` (default: unlimited)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let register_layout = match lookup("REGISTER_LAYOUT") {
            Some(value) => value.parse::<RegisterLayout>().map_err(|_| {
                ConfigError::InvalidValue(format!("REGISTER_LAYOUT={}", value))
            })?,
            None => defaults.register_layout,
        };

        let updates_buffer_size = parse_var(&lookup, "UPDATES_BUFFER_SIZE").unwrap_or(defaults.updates_buffer_size);
        if updates_buffer_size == 0 {
            return Err(ConfigError::InvalidValue(
                "UPDATES_BUFFER_SIZE must be positive".to_string(),
            ));
        }

        let register_max_blocks = parse_var(&lookup, "REGISTER_MAX_BLOCKS").unwrap_or(defaults.register_max_blocks);
        if register_max_blocks == 0 {
            return Err(ConfigError::InvalidValue(
                "REGISTER_MAX_BLOCKS must be positive".to_string(),
            ));
        }

        let error_max = match parse_var(&lookup, "ERROR_MAX") {
            Some(0) => None,
            Some(n) => Some(n),
            None => defaults.error_max,
        };

        Ok(Self {
            db_path: lookup("ALERTFLOW_DB_PATH").unwrap_or(defaults.db_path),
            directives_path: lookup("ALERTFLOW_DIRECTIVES").unwrap_or(defaults.directives_path),
            alerts_path: lookup("ALERTFLOW_ALERTS"),
            register_dir: lookup("ALERTFLOW_REGISTER_DIR").unwrap_or(defaults.register_dir),
            register_prefix: lookup("REGISTER_PREFIX").unwrap_or(defaults.register_prefix),
            register_layout,
            register_active: parse_var(&lookup, "REGISTER_ACTIVE").unwrap_or(defaults.register_active),
            register_max_blocks,
            register_retries: parse_var(&lookup, "REGISTER_RETRIES").unwrap_or(defaults.register_retries),
            register_retry_base_ms: parse_var(&lookup, "REGISTER_RETRY_BASE_MS")
                .unwrap_or(defaults.register_retry_base_ms),
            register_retry_max_ms: parse_var(&lookup, "REGISTER_RETRY_MAX_MS")
                .unwrap_or(defaults.register_retry_max_ms),
            updates_buffer_size,
            store_max_retries: parse_var(&lookup, "STORE_MAX_RETRIES").unwrap_or(defaults.store_max_retries),
            store_retry_base_ms: parse_var(&lookup, "STORE_RETRY_BASE_MS").unwrap_or(defaults.store_retry_base_ms),
            store_retry_max_ms: parse_var(&lookup, "STORE_RETRY_MAX_MS").unwrap_or(defaults.store_retry_max_ms),
            parallel_filters: parse_var(&lookup, "PARALLEL_FILTERS").unwrap_or(defaults.parallel_filters),
            error_max,
            iter_max: parse_var(&lookup, "ITER_MAX"),
        })
    }

    pub fn require_alerts_path(&self) -> Result<&str, ConfigError> {
        self.alerts_path
            .as_deref()
            .ok_or_else(|| ConfigError::MissingVariable("ALERTFLOW_ALERTS".to_string()))
    }
}
