//! Error taxonomy for the alert pipeline
//!
//! Each kind has a fixed blast radius:
//! - `ShapeError`: one alert
//! - `FilterError`: one channel for one alert
//! - `StoreError::Schema`: one alert
//! - `StoreError::Transient`: retried at batch flush, then escalated
//! - `StoreError::Fatal`: the run
//! - `RegisterWriteError`: never stops the run

use rusqlite::ErrorCode;

#[derive(Debug)]
pub enum ShapeError {
    InvalidIdentity { native_id: String, reason: String },
    InvalidMeasurement { alert_id: u64, reason: String },
}

impl std::fmt::Display for ShapeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShapeError::InvalidIdentity { native_id, reason } => {
                write!(f, "Invalid native id '{}': {}", native_id, reason)
            }
            ShapeError::InvalidMeasurement { alert_id, reason } => {
                write!(f, "Invalid measurement in alert {}: {}", alert_id, reason)
            }
        }
    }
}

impl std::error::Error for ShapeError {}

#[derive(Debug, Clone)]
pub struct FilterError {
    pub channel: String,
    pub reason: String,
}

impl FilterError {
    pub fn new(channel: &str, reason: impl Into<String>) -> Self {
        Self {
            channel: channel.to_string(),
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for FilterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Filter error in channel {}: {}", self.channel, self.reason)
    }
}

impl std::error::Error for FilterError {}

#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    /// Busy/locked store; worth retrying the whole batch
    Transient(String),
    /// Document rejected by the store; fatal for the owning alert only
    Schema(String),
    /// Store unusable; aborts the run
    Fatal(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _) => match e.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                    StoreError::Transient(err.to_string())
                }
                ErrorCode::ConstraintViolation | ErrorCode::TypeMismatch | ErrorCode::TooBig => {
                    StoreError::Schema(err.to_string())
                }
                _ => StoreError::Fatal(err.to_string()),
            },
            rusqlite::Error::InvalidColumnType(..)
            | rusqlite::Error::FromSqlConversionFailure(..)
            | rusqlite::Error::ToSqlConversionFailure(..) => StoreError::Schema(err.to_string()),
            _ => StoreError::Fatal(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Schema(err.to_string())
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Transient(e) => write!(f, "Transient store error: {}", e),
            StoreError::Schema(e) => write!(f, "Schema violation: {}", e),
            StoreError::Fatal(e) => write!(f, "Fatal store error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {}

#[derive(Debug)]
pub enum RegisterWriteError {
    Io(std::io::Error),
    Serialization(serde_json::Error),
    Closed,
}

impl From<std::io::Error> for RegisterWriteError {
    fn from(err: std::io::Error) -> Self {
        RegisterWriteError::Io(err)
    }
}

impl From<serde_json::Error> for RegisterWriteError {
    fn from(err: serde_json::Error) -> Self {
        RegisterWriteError::Serialization(err)
    }
}

impl std::fmt::Display for RegisterWriteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegisterWriteError::Io(e) => write!(f, "IO error: {}", e),
            RegisterWriteError::Serialization(e) => write!(f, "Serialization error: {}", e),
            RegisterWriteError::Closed => write!(f, "Register already closed"),
        }
    }
}

impl std::error::Error for RegisterWriteError {}

#[derive(Debug)]
pub enum ConfigError {
    MissingVariable(String),
    InvalidValue(String),
    Io(std::io::Error),
    Json(serde_json::Error),
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::Json(err)
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingVariable(var) => write!(f, "Missing environment variable: {}", var),
            ConfigError::InvalidValue(msg) => write!(f, "Invalid configuration value: {}", msg),
            ConfigError::Io(e) => write!(f, "Config IO error: {}", e),
            ConfigError::Json(e) => write!(f, "Config parse error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone, PartialEq)]
pub enum DirectiveError {
    NoChannels,
    DuplicateChannel(String),
    UnknownNode { referenced_by: String, name: String },
    UnknownPredicate { channel: String, unit: String },
    InvalidPredicateConfig { channel: String, reason: String },
    /// Two registers would write the same file
    RegisterClash { channel: String, prefix: String },
    Cycle(Vec<String>),
}

impl std::fmt::Display for DirectiveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DirectiveError::NoChannels => write!(f, "No channel directive loaded"),
            DirectiveError::DuplicateChannel(c) => write!(f, "Channel {} configured twice", c),
            DirectiveError::UnknownNode { referenced_by, name } => {
                write!(f, "{} references unknown directive node '{}'", referenced_by, name)
            }
            DirectiveError::UnknownPredicate { channel, unit } => {
                write!(f, "Channel {} uses unknown filter unit '{}'", channel, unit)
            }
            DirectiveError::InvalidPredicateConfig { channel, reason } => {
                write!(f, "Channel {} filter config invalid: {}", channel, reason)
            }
            DirectiveError::RegisterClash { channel, prefix } => {
                write!(f, "Channel {} register prefix '{}' is already in use", channel, prefix)
            }
            DirectiveError::Cycle(path) => write!(f, "Directive cycle: {}", path.join(" -> ")),
        }
    }
}

impl std::error::Error for DirectiveError {}

/// Run-level failure returned by `AlertConsumer::run`
#[derive(Debug)]
pub enum PipelineError {
    Config(ConfigError),
    Directive(DirectiveError),
    Store(StoreError),
    /// Register could not be opened; write failures never surface here
    Register(RegisterWriteError),
}

impl From<ConfigError> for PipelineError {
    fn from(err: ConfigError) -> Self {
        PipelineError::Config(err)
    }
}

impl From<DirectiveError> for PipelineError {
    fn from(err: DirectiveError) -> Self {
        PipelineError::Directive(err)
    }
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        PipelineError::Store(err)
    }
}

impl From<RegisterWriteError> for PipelineError {
    fn from(err: RegisterWriteError) -> Self {
        PipelineError::Register(err)
    }
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::Config(e) => write!(f, "{}", e),
            PipelineError::Directive(e) => write!(f, "{}", e),
            PipelineError::Store(e) => write!(f, "{}", e),
            PipelineError::Register(e) => write!(f, "Rejection register: {}", e),
        }
    }
}

impl std::error::Error for PipelineError {}
