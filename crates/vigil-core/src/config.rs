//! Pipeline configuration, resolved once at startup.

use crate::ensemble::ENSEMBLE_MODEL;
use crate::error::ConfigError;
use std::env;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_BROKER_URL: &str = "redis://127.0.0.1:6379/0";
pub const DEFAULT_CACHE_URL: &str = "redis://127.0.0.1:6379/1";

#[derive(Debug, Clone)]
pub struct Topics {
    pub input: String,
    pub output: String,
    pub alert: String,
}

impl Default for Topics {
    fn default() -> Self {
        Self {
            input: "events".to_string(),
            output: "anomaly-results".to_string(),
            alert: "anomaly-alerts".to_string(),
        }
    }
}

/// How many replicas must acknowledge each publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplicaAcks {
    /// Every replica connected to the primary.
    #[default]
    All,
    /// At most this many; 0 for the primary alone.
    Count(usize),
}

impl FromStr for ReplicaAcks {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("all") {
            Ok(Self::All)
        } else {
            s.parse().map(Self::Count)
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub broker_url: String,
    pub topics: Topics,
    pub consumer_group: String,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub queue_capacity: usize,
    /// Worker queue-pop timeout; the granularity of the batch timer check.
    pub poll_interval: Duration,
    /// Longest a single broker pull may block.
    pub ingest_poll_timeout: Duration,
    /// Upper bound on waiting for both loops to exit on stop.
    pub drain_timeout: Duration,
    pub worker_count: usize,
    pub replica_acks: ReplicaAcks,
    pub cache_url: String,
    pub alert_ttl: Duration,
    pub recent_alerts_capacity: usize,
    /// Score with this backend alone instead of the ensemble vote.
    pub model: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            broker_url: DEFAULT_BROKER_URL.to_string(),
            topics: Topics::default(),
            consumer_group: "vigil-detector".to_string(),
            batch_size: 100,
            batch_timeout: Duration::from_secs(5),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            queue_capacity: 1000,
            poll_interval: Duration::from_millis(100),
            ingest_poll_timeout: Duration::from_millis(500),
            drain_timeout: Duration::from_secs(5),
            worker_count: 1,
            replica_acks: ReplicaAcks::All,
            cache_url: DEFAULT_CACHE_URL.to_string(),
            alert_ttl: Duration::from_secs(3600),
            recent_alerts_capacity: 100,
            model: None,
        }
    }
}

impl PipelineConfig {
    /// Reads `VIGIL_*` variables over the defaults and validates the result.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// [`PipelineConfig::from_env`] over an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let config = Self {
            broker_url: lookup("VIGIL_BROKER_URL").unwrap_or(d.broker_url),
            topics: Topics {
                input: lookup("VIGIL_INPUT_TOPIC").unwrap_or(d.topics.input),
                output: lookup("VIGIL_OUTPUT_TOPIC").unwrap_or(d.topics.output),
                alert: lookup("VIGIL_ALERT_TOPIC").unwrap_or(d.topics.alert),
            },
            consumer_group: lookup("VIGIL_CONSUMER_GROUP").unwrap_or(d.consumer_group),
            batch_size: parsed(&lookup, "VIGIL_BATCH_SIZE")?.unwrap_or(d.batch_size),
            batch_timeout: secs(&lookup, "VIGIL_BATCH_TIMEOUT_SECS")?.unwrap_or(d.batch_timeout),
            max_retries: parsed(&lookup, "VIGIL_MAX_RETRIES")?.unwrap_or(d.max_retries),
            retry_delay: secs(&lookup, "VIGIL_RETRY_DELAY_SECS")?.unwrap_or(d.retry_delay),
            queue_capacity: parsed(&lookup, "VIGIL_QUEUE_CAPACITY")?.unwrap_or(d.queue_capacity),
            poll_interval: millis(&lookup, "VIGIL_POLL_INTERVAL_MS")?.unwrap_or(d.poll_interval),
            ingest_poll_timeout: millis(&lookup, "VIGIL_INGEST_POLL_TIMEOUT_MS")?
                .unwrap_or(d.ingest_poll_timeout),
            drain_timeout: secs(&lookup, "VIGIL_DRAIN_TIMEOUT_SECS")?.unwrap_or(d.drain_timeout),
            worker_count: parsed(&lookup, "VIGIL_WORKERS")?.unwrap_or(d.worker_count),
            replica_acks: parsed(&lookup, "VIGIL_REPLICA_ACKS")?.unwrap_or(d.replica_acks),
            cache_url: lookup("VIGIL_CACHE_URL").unwrap_or(d.cache_url),
            alert_ttl: secs(&lookup, "VIGIL_ALERT_TTL_SECS")?.unwrap_or(d.alert_ttl),
            recent_alerts_capacity: parsed(&lookup, "VIGIL_RECENT_ALERTS")?
                .unwrap_or(d.recent_alerts_capacity),
            model: lookup("VIGIL_MODEL").filter(|m| !m.is_empty() && m != ENSEMBLE_MODEL),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size < 1 {
            return Err(ConfigError::Constraint("batch_size must be at least 1".into()));
        }
        if self.batch_timeout.is_zero() {
            return Err(ConfigError::Constraint("batch_timeout must be positive".into()));
        }
        if self.queue_capacity < self.batch_size {
            return Err(ConfigError::Constraint(format!(
                "queue_capacity ({}) must be at least batch_size ({})",
                self.queue_capacity, self.batch_size
            )));
        }
        if self.worker_count < 1 {
            return Err(ConfigError::Constraint("worker_count must be at least 1".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Constraint("poll_interval must be positive".into()));
        }
        if self.recent_alerts_capacity < 1 {
            return Err(ConfigError::Constraint(
                "recent_alerts_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn parsed<F, T>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    lookup(key)
        .map(|raw| {
            raw.trim().parse().map_err(|_| ConfigError::Invalid {
                key: key.to_string(),
                value: raw.clone(),
            })
        })
        .transpose()
}

/// Fractional seconds, e.g. `0.5`.
fn secs<F>(lookup: &F, key: &str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    parsed::<F, f64>(lookup, key)?
        .map(|s| {
            Duration::try_from_secs_f64(s).map_err(|_| ConfigError::Invalid {
                key: key.to_string(),
                value: s.to_string(),
            })
        })
        .transpose()
}

fn millis<F>(lookup: &F, key: &str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(parsed::<F, u64>(lookup, key)?.map(Duration::from_millis))
}
