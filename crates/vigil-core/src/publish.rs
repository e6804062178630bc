//! Result Publisher
//!
//! Every evaluated event goes to the results topic; anomalies are also sent
//! to the alert topic. A failed publish is retried on transient broker
//! errors with a fixed delay, then dropped and counted. Nothing here returns
//! an error to the worker loop.

use crate::broker::EventSink;
use crate::config::{PipelineConfig, Topics};
use crate::ensemble::EnsembleResult;
use crate::error::PublishError;
use crate::event::{Event, FeatureVector, Metadata};
use crate::telemetry::Telemetry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Confidence strictly above this is a high-severity alert.
pub const HIGH_SEVERITY_CONFIDENCE: f64 = 0.8;

/// Wire shape of the results topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub is_anomaly: bool,
    pub confidence: f64,
    pub score: f64,
    pub model_used: String,
    pub features: FeatureVector,
    pub metadata: Metadata,
}

impl ResultRecord {
    pub fn new(event: &Event, result: &EnsembleResult) -> Self {
        Self {
            id: event.id.clone(),
            timestamp: event.timestamp,
            source: event.source.clone(),
            is_anomaly: result.is_anomaly,
            confidence: result.confidence,
            score: result.score,
            model_used: result.model_used.clone(),
            features: event.features.clone(),
            metadata: event.metadata.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    High,
    Medium,
}

impl Severity {
    pub fn classify(confidence: f64) -> Self {
        if confidence > HIGH_SEVERITY_CONFIDENCE {
            Self::High
        } else {
            Self::Medium
        }
    }
}

/// Wire shape of the alert topic: the result fields plus a classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    #[serde(flatten)]
    pub result: ResultRecord,
    pub severity: Severity,
    pub message: String,
}

impl AlertRecord {
    pub fn new(result: ResultRecord) -> Self {
        let severity = Severity::classify(result.confidence);
        let message = format!("Anomaly detected with {:.2} confidence", result.confidence);
        Self {
            result,
            severity,
            message,
        }
    }

    pub fn id(&self) -> &str {
        &self.result.id
    }
}

pub struct ResultPublisher {
    sink: Arc<dyn EventSink>,
    topics: Topics,
    max_retries: u32,
    retry_delay: Duration,
    telemetry: Arc<Telemetry>,
}

impl ResultPublisher {
    pub fn new(sink: Arc<dyn EventSink>, config: &PipelineConfig, telemetry: Arc<Telemetry>) -> Self {
        Self {
            sink,
            topics: config.topics.clone(),
            max_retries: config.max_retries,
            retry_delay: config.retry_delay,
            telemetry,
        }
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    /// Serializes once, then sends with up to `max_retries` retries.
    pub fn publish<T: Serialize>(&self, topic: &str, key: &str, message: &T) -> Result<(), PublishError> {
        let payload = serde_json::to_vec(message).map_err(|source| PublishError::Serialize {
            topic: topic.to_string(),
            source,
        })?;

        let attempts = self.max_retries.saturating_add(1);
        let mut attempt = 1;
        loop {
            match self.sink.send(topic, key, &payload) {
                Ok(()) => {
                    self.telemetry.published.with_label_values(&[topic]).inc();
                    debug!(topic, key, attempt, "message published");
                    return Ok(());
                }
                Err(err) if !err.is_transient() => {
                    return Err(PublishError::Rejected {
                        topic: topic.to_string(),
                        source: err,
                    });
                }
                Err(err) if attempt >= attempts => {
                    return Err(PublishError::Exhausted {
                        topic: topic.to_string(),
                        attempts,
                        last: err,
                    });
                }
                Err(err) => {
                    warn!(topic, key, attempt, error = %err, "publish failed, retrying");
                    self.telemetry.publish_retries.inc();
                    attempt += 1;
                    thread::sleep(self.retry_delay);
                }
            }
        }
    }

    /// Publishes the result and, for anomalies, the alert.
    ///
    /// Returns the alert so the caller can persist it whether or not the
    /// alert publish itself succeeded.
    pub fn publish_outcome(&self, event: &Event, result: &EnsembleResult) -> Option<AlertRecord> {
        let record = ResultRecord::new(event, result);
        self.publish_or_drop(&self.topics.output, &record.id, &record);

        if !result.is_anomaly {
            return None;
        }
        let alert = AlertRecord::new(record);
        self.publish_or_drop(&self.topics.alert, alert.id(), &alert);
        Some(alert)
    }

    fn publish_or_drop<T: Serialize>(&self, topic: &str, key: &str, message: &T) {
        if let Err(err) = self.publish(topic, key, message) {
            self.telemetry.publish_failures.inc();
            error!(topic, key, error = %err, "dropping message");
        }
    }
}
