//! Inbound events and their wire format.

use crate::error::ParseError;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Feature name to value, ordered by name.
pub type FeatureVector = BTreeMap<String, f64>;

/// Opaque key/value metadata carried through untouched.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

pub const UNKNOWN_SOURCE: &str = "unknown";

/// One feature vector with identity and timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub features: FeatureVector,
    pub source: String,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Broker record as published by producers.
///
/// `id` and `timestamp` are optional on the wire; see [`Event::parse`].
#[derive(Debug, Deserialize)]
struct InboundRecord {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    data: FeatureVector,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    metadata: Option<Metadata>,
}

impl Event {
    pub fn new(id: impl Into<String>, timestamp: DateTime<Utc>, features: FeatureVector) -> Self {
        Self {
            id: id.into(),
            timestamp,
            features,
            source: UNKNOWN_SOURCE.to_string(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Parse a raw broker payload.
    ///
    /// A missing `id` gets a time-ordered UUIDv7; a missing `timestamp`
    /// becomes the current time. Both are defaulted instead of rejected.
    pub fn parse(payload: &[u8]) -> Result<Self, ParseError> {
        let mut buf = payload.to_vec();
        let record: InboundRecord =
            simd_json::from_slice(&mut buf).map_err(|e| ParseError::Json(e.to_string()))?;

        let timestamp = match record.timestamp {
            Some(raw) => parse_timestamp(&raw)?,
            None => Utc::now(),
        };

        Ok(Self {
            id: record.id.unwrap_or_else(|| uuid::Uuid::now_v7().to_string()),
            timestamp,
            features: record.data,
            source: record.source.unwrap_or_else(|| UNKNOWN_SOURCE.to_string()),
            metadata: record.metadata.unwrap_or_default(),
        })
    }
}

/// Accepts RFC 3339 and offset-less ISO-8601 (read as UTC).
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, ParseError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
        .ok_or_else(|| ParseError::Timestamp(raw.to_string()))
}
