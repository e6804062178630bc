//! In-process partitioned broker.
//!
//! Records are routed to a partition by `xxh3(key)` and delivered in
//! partition order. Each consumer group keeps a committed low-watermark per
//! partition; anything delivered but not committed is redelivered to the
//! next source for that group, or after [`MemorySource::recover`].

use super::{EventSink, EventSource, RawRecord};
use crate::error::BrokerError;
use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct Stored {
    key: Option<String>,
    payload: Bytes,
}

#[derive(Default)]
struct State {
    topics: HashMap<String, Vec<Vec<Stored>>>,
    committed: HashMap<(String, String), Vec<u64>>,
}

struct Shared {
    partitions: usize,
    state: Mutex<State>,
    arrived: Condvar,
}

#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    pub fn new(partitions: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                partitions: partitions.max(1),
                state: Mutex::new(State::default()),
                arrived: Condvar::new(),
            }),
        }
    }

    pub fn partitions(&self) -> usize {
        self.shared.partitions
    }

    pub fn partition_for(&self, key: Option<&str>) -> u32 {
        match key {
            Some(k) => (xxhash_rust::xxh3::xxh3_64(k.as_bytes()) % self.shared.partitions as u64) as u32,
            None => 0,
        }
    }

    /// Appends a record and returns its `(partition, offset)`.
    pub fn produce(&self, topic: &str, key: Option<&str>, payload: impl Into<Bytes>) -> (u32, u64) {
        let partition = self.partition_for(key);
        let mut state = self.shared.state.lock();
        let log = state
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); self.shared.partitions]);
        let part = &mut log[partition as usize];
        part.push(Stored {
            key: key.map(str::to_string),
            payload: payload.into(),
        });
        let offset = part.len() as u64 - 1;
        drop(state);
        self.shared.arrived.notify_all();
        (partition, offset)
    }

    /// Every payload on `topic`, partition by partition.
    pub fn payloads(&self, topic: &str) -> Vec<Bytes> {
        let state = self.shared.state.lock();
        state
            .topics
            .get(topic)
            .map(|parts| parts.iter().flatten().map(|s| s.payload.clone()).collect())
            .unwrap_or_default()
    }

    pub fn len(&self, topic: &str) -> usize {
        let state = self.shared.state.lock();
        state
            .topics
            .get(topic)
            .map_or(0, |parts| parts.iter().map(Vec::len).sum())
    }

    /// Committed low-watermarks of `group` on `topic`.
    pub fn committed(&self, topic: &str, group: &str) -> Vec<u64> {
        let state = self.shared.state.lock();
        state
            .committed
            .get(&(topic.to_string(), group.to_string()))
            .cloned()
            .unwrap_or_else(|| vec![0; self.shared.partitions])
    }

    pub fn source(&self, topic: &str, group: &str) -> MemorySource {
        let cursor = self.committed(topic, group);
        MemorySource {
            broker: self.clone(),
            topic: topic.to_string(),
            group: group.to_string(),
            inflight: vec![BTreeSet::new(); cursor.len()],
            cursor,
            next_partition: 0,
        }
    }

    pub fn sink(&self) -> MemorySink {
        MemorySink {
            broker: self.clone(),
        }
    }
}

pub struct MemorySource {
    broker: MemoryBroker,
    topic: String,
    group: String,
    cursor: Vec<u64>,
    inflight: Vec<BTreeSet<u64>>,
    next_partition: usize,
}

impl MemorySource {
    /// Rewinds to the committed position, redelivering in-flight records.
    pub fn recover(&mut self) {
        self.cursor = self.broker.committed(&self.topic, &self.group);
        self.inflight.iter_mut().for_each(BTreeSet::clear);
    }

    fn next_record(&mut self, state: &State) -> Option<RawRecord> {
        let parts = state.topics.get(&self.topic)?;
        let n = parts.len();
        for step in 0..n {
            let p = (self.next_partition + step) % n;
            let offset = self.cursor[p];
            if let Some(stored) = parts[p].get(offset as usize) {
                self.cursor[p] += 1;
                self.inflight[p].insert(offset);
                self.next_partition = (p + 1) % n;
                return Some(RawRecord {
                    partition: p as u32,
                    offset,
                    key: stored.key.clone(),
                    payload: stored.payload.clone(),
                });
            }
        }
        None
    }
}

impl EventSource for MemorySource {
    fn poll(&mut self, timeout: Duration) -> Result<Option<RawRecord>, BrokerError> {
        let deadline = Instant::now() + timeout;
        let shared = self.broker.shared.clone();
        let mut state = shared.state.lock();
        loop {
            if let Some(record) = self.next_record(&state) {
                return Ok(Some(record));
            }
            if shared.arrived.wait_until(&mut state, deadline).timed_out() {
                return Ok(self.next_record(&state));
            }
        }
    }

    fn commit(&mut self, record: &RawRecord) -> Result<(), BrokerError> {
        let p = record.partition as usize;
        let inflight = self
            .inflight
            .get_mut(p)
            .ok_or_else(|| BrokerError::Rejected(format!("unknown partition {p}")))?;
        inflight.remove(&record.offset);
        let watermark = inflight.first().copied().unwrap_or(self.cursor[p]);

        let mut state = self.broker.shared.state.lock();
        let partitions = self.broker.shared.partitions;
        let committed = state
            .committed
            .entry((self.topic.clone(), self.group.clone()))
            .or_insert_with(|| vec![0; partitions]);
        committed[p] = committed[p].max(watermark);
        Ok(())
    }
}

pub struct MemorySink {
    broker: MemoryBroker,
}

impl EventSink for MemorySink {
    fn send(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), BrokerError> {
        self.broker
            .produce(topic, Some(key), Bytes::copy_from_slice(payload));
        Ok(())
    }
}
