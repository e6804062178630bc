//! External broker seams.
//!
//! The pipeline consumes [`EventSource`] and produces to [`EventSink`]; the
//! transports behind them are interchangeable.

mod memory;
mod redis_list;

pub use memory::{MemoryBroker, MemorySink, MemorySource};
pub use redis_list::{RedisSink, RedisSource};

use crate::error::BrokerError;
use bytes::Bytes;
use std::time::Duration;

/// One undecoded broker message and its read position.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub partition: u32,
    pub offset: u64,
    pub key: Option<String>,
    pub payload: Bytes,
}

impl RawRecord {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            partition: 0,
            offset: 0,
            key: None,
            payload: payload.into(),
        }
    }
}

/// Pull side. Owned by the ingestor thread.
pub trait EventSource: Send {
    /// Blocks at most `timeout`; `Ok(None)` when nothing arrived.
    fn poll(&mut self, timeout: Duration) -> Result<Option<RawRecord>, BrokerError>;

    /// Marks the record as handled. Uncommitted records are redelivered.
    fn commit(&mut self, record: &RawRecord) -> Result<(), BrokerError>;

    fn close(&mut self) -> Result<(), BrokerError> {
        Ok(())
    }
}

/// Push side. Shared by every worker.
pub trait EventSink: Send + Sync {
    /// Returns once the broker has acknowledged the write.
    fn send(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), BrokerError>;

    fn close(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}
