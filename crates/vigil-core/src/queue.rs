//! Bounded hand-off between the ingestor and the workers.
//!
//! The producer never blocks: a full queue drops the newest event and counts
//! it. Consumers block up to a caller-chosen timeout. The channel disconnects
//! once every producer is dropped, which is how workers learn to drain and
//! stop.

use crate::error::QueueFull;
use crate::event::Event;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct QueueStats {
    pub accepted: AtomicU64,
    pub dropped: AtomicU64,
}

pub fn event_queue(capacity: usize) -> (QueueProducer, QueueConsumer) {
    let (tx, rx) = bounded(capacity);
    let stats = Arc::new(QueueStats::default());
    (
        QueueProducer {
            tx,
            stats: stats.clone(),
        },
        QueueConsumer { rx, stats },
    )
}

pub struct QueueProducer {
    tx: Sender<Event>,
    stats: Arc<QueueStats>,
}

impl QueueProducer {
    /// Drop-newest hand-off.
    pub fn offer(&self, event: Event) -> Result<(), QueueFull> {
        match self.tx.try_send(event) {
            Ok(()) => {
                self.stats.accepted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(event)) | Err(TrySendError::Disconnected(event)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                Err(QueueFull(Box::new(event)))
            }
        }
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.stats.dropped.load(Ordering::Relaxed)
    }
}

/// Cloneable; every clone competes for the same events.
#[derive(Clone)]
pub struct QueueConsumer {
    rx: Receiver<Event>,
    stats: Arc<QueueStats>,
}

pub enum Recv {
    Event(Event),
    /// Nothing arrived within the timeout.
    Idle,
    /// All producers are gone and the queue is empty.
    Closed,
}

impl QueueConsumer {
    pub fn recv_timeout(&self, timeout: Duration) -> Recv {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Recv::Event(event),
            Err(RecvTimeoutError::Timeout) => Recv::Idle,
            Err(RecvTimeoutError::Disconnected) => Recv::Closed,
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.rx.capacity()
    }

    pub fn accepted(&self) -> u64 {
        self.stats.accepted.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.stats.dropped.load(Ordering::Relaxed)
    }
}
