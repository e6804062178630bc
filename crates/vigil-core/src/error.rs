//! Error taxonomy for the streaming pipeline.
//!
//! Every runtime error is scoped to the smallest unit it affects (one record,
//! one backend, one publish). Only [`StartupError`] is fatal.

use crate::event::Event;
use thiserror::Error;

/// Malformed inbound record. The record is logged and skipped.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ParseError {
    #[error("invalid record json: {0}")]
    Json(String),
    #[error("invalid timestamp {0:?}")]
    Timestamp(String),
}

/// The bounded queue rejected an event because it was full.
///
/// The rejected event is handed back so the caller decides what to log.
#[derive(Debug, Error)]
#[error("queue full, dropped event {}", .0.id)]
pub struct QueueFull(pub Box<Event>);

/// A single backend could not score a feature vector.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BackendError {
    #[error("backend {backend} is not trained")]
    Unready { backend: String },
    #[error("backend {backend} rejected features: {reason}")]
    Score { backend: String, reason: String },
}

impl BackendError {
    pub fn backend(&self) -> &str {
        match self {
            Self::Unready { backend } | Self::Score { backend, .. } => backend,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum EnsembleError {
    #[error("no backend could score event {event_id} ({} failed)", .failures.len())]
    NoBackendAvailable {
        event_id: String,
        failures: Vec<BackendError>,
    },
    #[error("unknown backend {0:?}")]
    UnknownBackend(String),
    #[error("backend {0:?} registered twice")]
    DuplicateBackend(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error("broker operation timed out")]
    Timeout,
    #[error("broker rejected message: {0}")]
    Rejected(String),
}

impl BrokerError {
    /// Transient failures are worth retrying; rejections are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout)
    }
}

impl From<redis::RedisError> for BrokerError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            Self::Unavailable(err.to_string())
        } else {
            Self::Rejected(err.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to serialize message for {topic}: {source}")]
    Serialize {
        topic: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("gave up publishing to {topic} after {attempts} attempts: {last}")]
    Exhausted {
        topic: String,
        attempts: u32,
        last: BrokerError,
    },
    #[error("broker rejected message for {topic}: {source}")]
    Rejected {
        topic: String,
        #[source]
        source: BrokerError,
    },
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt cache value at {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        Self::Unavailable(err.to_string())
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: String, value: String },
    #[error("invalid configuration: {0}")]
    Constraint(String),
}

/// Unrecoverable failure while bringing the pipeline up.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("broker unreachable: {0}")]
    Broker(#[from] BrokerError),
    #[error("cache unreachable: {0}")]
    Store(#[from] StoreError),
    #[error("telemetry registration failed: {0}")]
    Telemetry(#[from] prometheus::Error),
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Ensemble(#[from] EnsembleError),
    #[error("pipeline has no scoring backends")]
    NoBackends,
}
