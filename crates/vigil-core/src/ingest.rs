//! Ingestor
//!
//! Pulls raw records from the broker, parses them and offers them to the
//! bounded queue without ever blocking on it. The read position is committed
//! once the hand-off is decided, so a crash before that point redelivers the
//! record.

use crate::broker::{EventSource, RawRecord};
use crate::error::QueueFull;
use crate::event::Event;
use crate::queue::QueueProducer;
use crate::telemetry::Telemetry;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How a single record left the ingestor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handoff {
    Queued,
    /// Queue was full; the event was dropped.
    Dropped,
    /// Unparsable payload, skipped.
    Malformed,
}

pub struct Ingestor {
    source: Box<dyn EventSource>,
    producer: QueueProducer,
    telemetry: Arc<Telemetry>,
    poll_timeout: Duration,
    retry_delay: Duration,
}

impl Ingestor {
    pub fn new(
        source: Box<dyn EventSource>,
        producer: QueueProducer,
        telemetry: Arc<Telemetry>,
        poll_timeout: Duration,
        retry_delay: Duration,
    ) -> Self {
        Self {
            source,
            producer,
            telemetry,
            poll_timeout,
            retry_delay,
        }
    }

    /// Runs until `cancel` fires, then hands the source back so the caller
    /// can close it. Dropping `self` closes the queue for the workers.
    pub fn run(mut self, cancel: CancellationToken) -> Box<dyn EventSource> {
        info!("Ingestor active.");

        while !cancel.is_cancelled() {
            match self.source.poll(self.poll_timeout) {
                Ok(Some(record)) => {
                    self.handle(&record);
                    if let Err(err) = self.source.commit(&record) {
                        warn!(
                            partition = record.partition,
                            offset = record.offset,
                            error = %err,
                            "Commit failed, record may be redelivered"
                        );
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(error = %err, "Broker poll failed");
                    pause(&cancel, self.retry_delay);
                }
            }
        }

        info!(
            accepted = self.telemetry.ingested.get(),
            dropped = self.producer.dropped(),
            "Ingestor stopped."
        );
        self.source
    }

    /// Parses one record and offers it to the queue.
    pub fn handle(&self, record: &RawRecord) -> Handoff {
        let event = match Event::parse(&record.payload) {
            Ok(event) => event,
            Err(err) => {
                self.telemetry.parse_errors.inc();
                warn!(
                    partition = record.partition,
                    offset = record.offset,
                    error = %err,
                    "Skipping malformed record"
                );
                return Handoff::Malformed;
            }
        };

        let outcome = match self.producer.offer(event) {
            Ok(()) => {
                self.telemetry.ingested.inc();
                Handoff::Queued
            }
            Err(QueueFull(event)) => {
                self.telemetry.dropped.inc();
                warn!(
                    event_id = %event.id,
                    dropped = self.producer.dropped(),
                    "Queue full, dropping event"
                );
                Handoff::Dropped
            }
        };
        self.telemetry.queue_depth.set(self.producer.len() as i64);
        debug!(partition = record.partition, offset = record.offset, ?outcome, "record handled");
        outcome
    }
}

/// Sleeps for `delay`, waking early on cancellation.
fn pause(cancel: &CancellationToken, delay: Duration) {
    const SLICE: Duration = Duration::from_millis(50);
    let until = Instant::now() + delay;
    while !cancel.is_cancelled() {
        let left = until.saturating_duration_since(Instant::now());
        if left.is_zero() {
            break;
        }
        thread::sleep(left.min(SLICE));
    }
}
