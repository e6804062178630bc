//! Batch Aggregator
//!
//! Buffers events and decides when to flush. Two triggers race: the buffer
//! reaching `batch_size`, and `batch_timeout` elapsing since the first event
//! of the current buffer. Time is passed in explicitly so the caller owns the
//! clock.

use crate::event::Event;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    /// Empty buffer, no timer.
    Idle,
    /// 1..batch_size-1 events buffered, timer running.
    Accumulating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Size,
    Timeout,
    Shutdown,
}

impl FlushTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Size => "size",
            Self::Timeout => "timeout",
            Self::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug)]
pub struct Batch {
    /// Arrival order.
    pub events: Vec<Event>,
    pub trigger: FlushTrigger,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

pub struct BatchAggregator {
    buffer: Vec<Event>,
    batch_size: usize,
    batch_timeout: Duration,
    opened_at: Option<Instant>,
}

impl BatchAggregator {
    /// `batch_size` is raised to at least 1.
    pub fn new(batch_size: usize, batch_timeout: Duration) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            buffer: Vec::with_capacity(batch_size),
            batch_size,
            batch_timeout,
            opened_at: None,
        }
    }

    pub fn state(&self) -> BatchState {
        if self.buffer.is_empty() {
            BatchState::Idle
        } else {
            BatchState::Accumulating
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// When the timer of the current buffer fires, if one is running.
    pub fn deadline(&self) -> Option<Instant> {
        self.opened_at.map(|t| t + self.batch_timeout)
    }

    /// Time left until the timer fires, zero if it already has.
    pub fn time_until_due(&self, now: Instant) -> Option<Duration> {
        self.deadline().map(|d| d.saturating_duration_since(now))
    }

    /// Appends an event, flushing when the buffer reaches `batch_size`.
    ///
    /// A buffer whose timer already expired is flushed first, and the event
    /// opens the next one.
    pub fn push(&mut self, event: Event, now: Instant) -> Option<Batch> {
        let expired = self.poll(now);
        if self.buffer.is_empty() {
            self.opened_at = Some(now);
        }
        self.buffer.push(event);

        // Only a buffer of batch_size >= 2 can expire, so the event left
        // behind never fills the next one.
        if expired.is_some() {
            expired
        } else if self.buffer.len() >= self.batch_size {
            Some(self.take(FlushTrigger::Size))
        } else {
            None
        }
    }

    /// Timer check without a new arrival.
    pub fn poll(&mut self, now: Instant) -> Option<Batch> {
        match self.deadline() {
            Some(deadline) if now >= deadline && !self.buffer.is_empty() => {
                Some(self.take(FlushTrigger::Timeout))
            }
            _ => None,
        }
    }

    /// Forced flush of whatever is buffered, used on shutdown.
    pub fn drain(&mut self) -> Option<Batch> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(self.take(FlushTrigger::Shutdown))
        }
    }

    fn take(&mut self, trigger: FlushTrigger) -> Batch {
        self.opened_at = None;
        let events = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.batch_size));
        Batch { events, trigger }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::FeatureVector;
    use chrono::Utc;

    fn ev(id: &str) -> Event {
        Event::new(id, Utc::now(), FeatureVector::new())
    }

    fn ids(batch: &Batch) -> Vec<&str> {
        batch.events.iter().map(|e| e.id.as_str()).collect()
    }

    #[test]
    fn test_flush_on_size() {
        let start = Instant::now();
        let mut agg = BatchAggregator::new(3, Duration::from_secs(5));

        assert_eq!(agg.state(), BatchState::Idle);
        assert!(agg.push(ev("a"), start).is_none());
        assert_eq!(agg.state(), BatchState::Accumulating);
        assert!(agg.push(ev("b"), start + Duration::from_secs(1)).is_none());

        let batch = agg.push(ev("c"), start + Duration::from_secs(2)).unwrap();
        assert_eq!(batch.trigger, FlushTrigger::Size);
        assert_eq!(ids(&batch), ["a", "b", "c"]);
        assert_eq!(agg.state(), BatchState::Idle);
        assert!(agg.deadline().is_none());
    }

    #[test]
    fn test_flush_on_timeout_without_new_arrivals() {
        let start = Instant::now();
        let mut agg = BatchAggregator::new(3, Duration::from_secs(5));

        agg.push(ev("a"), start);
        agg.push(ev("b"), start + Duration::from_millis(10));

        assert!(agg.poll(start + Duration::from_millis(4_999)).is_none());
        let batch = agg.poll(start + Duration::from_secs(5)).unwrap();
        assert_eq!(batch.trigger, FlushTrigger::Timeout);
        assert_eq!(batch.len(), 2);
        assert!(agg.is_empty());
    }

    #[test]
    fn test_timer_starts_at_first_message() {
        let start = Instant::now();
        let mut agg = BatchAggregator::new(10, Duration::from_secs(5));

        assert!(agg.poll(start + Duration::from_secs(60)).is_none());

        agg.push(ev("a"), start + Duration::from_secs(2));
        assert_eq!(agg.deadline(), Some(start + Duration::from_secs(7)));
        assert_eq!(
            agg.time_until_due(start + Duration::from_secs(3)),
            Some(Duration::from_secs(4))
        );
        assert!(agg.poll(start + Duration::from_secs(6)).is_none());
        assert!(agg.poll(start + Duration::from_secs(7)).is_some());
    }

    #[test]
    fn test_late_arrival_opens_next_batch() {
        let start = Instant::now();
        let mut agg = BatchAggregator::new(10, Duration::from_secs(1));

        agg.push(ev("a"), start);
        let batch = agg.push(ev("b"), start + Duration::from_secs(2)).unwrap();
        assert_eq!(batch.trigger, FlushTrigger::Timeout);
        assert_eq!(ids(&batch), ["a"]);

        assert_eq!(agg.len(), 1);
        assert_eq!(agg.deadline(), Some(start + Duration::from_secs(3)));
        assert!(agg.poll(start + Duration::from_millis(2_500)).is_none());
        let next = agg.poll(start + Duration::from_secs(3)).unwrap();
        assert_eq!(ids(&next), ["b"]);
    }

    #[test]
    fn test_timer_resets_after_flush() {
        let start = Instant::now();
        let mut agg = BatchAggregator::new(2, Duration::from_secs(5));

        agg.push(ev("a"), start);
        agg.push(ev("b"), start).unwrap();
        agg.push(ev("c"), start + Duration::from_secs(4));
        assert!(agg.poll(start + Duration::from_secs(6)).is_none());
        assert!(agg.poll(start + Duration::from_secs(9)).is_some());
    }

    #[test]
    fn test_buffer_never_exceeds_batch_size() {
        let now = Instant::now();
        let mut agg = BatchAggregator::new(4, Duration::from_secs(60));
        let mut flushed = Vec::new();

        for i in 0..10 {
            if let Some(batch) = agg.push(ev(&i.to_string()), now) {
                flushed.push(batch.len());
            }
            assert!(agg.len() < 4);
        }
        assert_eq!(flushed, [4, 4]);
        assert_eq!(agg.drain().map(|b| b.len()), Some(2));
        assert!(agg.drain().is_none());
    }

    #[test]
    fn test_batch_size_one_flushes_every_event() {
        let mut agg = BatchAggregator::new(0, Duration::from_secs(1));
        let batch = agg.push(ev("solo"), Instant::now()).unwrap();
        assert_eq!(batch.trigger, FlushTrigger::Size);
    }
}
