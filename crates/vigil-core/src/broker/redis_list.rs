//! Redis-list transport.
//!
//! The source follows the reliable-queue pattern: `BLMOVE` from the input
//! list onto a per-group processing list, `LREM` once handled. Anything left
//! on the processing list after a crash is moved back by [`RedisSource::recover`].
//! A list is a single partition, so record keys only travel with the payload.

use super::{EventSink, EventSource, RawRecord};
use crate::config::ReplicaAcks;
use crate::error::BrokerError;
use bytes::Bytes;
use parking_lot::Mutex;
use redis::{Client, Connection};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// `BLMOVE` treats 0 as "block forever".
const MIN_BLOCK: Duration = Duration::from_millis(10);

fn connect(client: &Client) -> Result<Connection, BrokerError> {
    let mut conn = client.get_connection()?;
    redis::cmd("PING").query::<String>(&mut conn)?;
    Ok(conn)
}

pub struct RedisSource {
    client: Client,
    conn: Option<Connection>,
    input: String,
    processing: String,
    delivered: u64,
}

impl RedisSource {
    /// Connects eagerly so an unreachable broker fails startup.
    pub fn connect(url: &str, input: &str, group: &str) -> Result<Self, BrokerError> {
        let client = Client::open(url)?;
        let conn = connect(&client)?;
        info!(input, group, "connected to redis source");
        Ok(Self {
            client,
            conn: Some(conn),
            input: input.to_string(),
            processing: format!("{input}:processing:{group}"),
            delivered: 0,
        })
    }

    pub fn processing_list(&self) -> &str {
        &self.processing
    }

    /// Moves every uncommitted record back to the head of the input list,
    /// oldest first. Returns how many were restored.
    pub fn recover(&mut self) -> Result<usize, BrokerError> {
        let processing = self.processing.clone();
        let input = self.input.clone();
        let mut restored = 0;
        loop {
            let moved: Option<Vec<u8>> = self.with_conn(|conn| {
                redis::cmd("LMOVE")
                    .arg(&processing)
                    .arg(&input)
                    .arg("RIGHT")
                    .arg("LEFT")
                    .query(conn)
            })?;
            if moved.is_none() {
                break;
            }
            restored += 1;
        }
        if restored > 0 {
            info!(restored, input = %self.input, "requeued uncommitted records");
        }
        Ok(restored)
    }

    fn with_conn<T>(
        &mut self,
        op: impl FnOnce(&mut Connection) -> redis::RedisResult<T>,
    ) -> Result<T, BrokerError> {
        if self.conn.is_none() {
            self.conn = Some(connect(&self.client)?);
        }
        let Some(conn) = self.conn.as_mut() else {
            return Err(BrokerError::Unavailable("no connection".into()));
        };
        let result = op(conn);
        result.map_err(|err| {
            let err = BrokerError::from(err);
            if err.is_transient() {
                debug!(error = %err, "dropping redis source connection");
                self.conn = None;
            }
            err
        })
    }
}

impl EventSource for RedisSource {
    fn poll(&mut self, timeout: Duration) -> Result<Option<RawRecord>, BrokerError> {
        let block = timeout.max(MIN_BLOCK).as_secs_f64();
        let input = self.input.clone();
        let processing = self.processing.clone();
        let payload: Option<Vec<u8>> = self.with_conn(|conn| {
            redis::cmd("BLMOVE")
                .arg(&input)
                .arg(&processing)
                .arg("LEFT")
                .arg("RIGHT")
                .arg(block)
                .query(conn)
        })?;

        Ok(payload.map(|bytes| {
            let offset = self.delivered;
            self.delivered += 1;
            RawRecord {
                partition: 0,
                offset,
                key: None,
                payload: Bytes::from(bytes),
            }
        }))
    }

    fn commit(&mut self, record: &RawRecord) -> Result<(), BrokerError> {
        let processing = self.processing.clone();
        let payload = record.payload.clone();
        self.with_conn(|conn| {
            redis::cmd("LREM")
                .arg(&processing)
                .arg(1)
                .arg(payload.as_ref())
                .query::<i64>(conn)
        })?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), BrokerError> {
        self.conn = None;
        info!(input = %self.input, "redis source closed");
        Ok(())
    }
}

/// `connected_slaves` from an `INFO replication` reply.
fn connected_replicas(info: &str) -> Option<usize> {
    info.lines()
        .find_map(|line| line.trim().strip_prefix("connected_slaves:"))
        .and_then(|n| n.parse().ok())
}

/// A publish counts only once `required` replicas hold it.
fn check_acks(acked: usize, required: usize) -> Result<(), BrokerError> {
    if acked < required {
        Err(BrokerError::Timeout)
    } else {
        Ok(())
    }
}

pub struct RedisSink {
    client: Client,
    conn: Mutex<Option<Connection>>,
    acks: ReplicaAcks,
    /// Replicas each `WAIT` asks for, resolved on every (re)connect.
    required: AtomicUsize,
    ack_timeout: Duration,
}

impl RedisSink {
    pub fn connect(url: &str, acks: ReplicaAcks, ack_timeout: Duration) -> Result<Self, BrokerError> {
        let client = Client::open(url)?;
        let mut conn = connect(&client)?;
        let required = resolve_acks(&mut conn, acks)?;
        info!(?acks, required, "connected to redis sink");
        Ok(Self {
            client,
            conn: Mutex::new(Some(conn)),
            acks,
            required: AtomicUsize::new(required),
            ack_timeout,
        })
    }

    pub fn required_acks(&self) -> usize {
        self.required.load(Ordering::Relaxed)
    }
}

fn resolve_acks(conn: &mut Connection, acks: ReplicaAcks) -> Result<usize, BrokerError> {
    match acks {
        ReplicaAcks::Count(n) => Ok(n),
        ReplicaAcks::All => {
            let info: String = redis::cmd("INFO").arg("replication").query(conn)?;
            Ok(connected_replicas(&info).unwrap_or_else(|| {
                warn!("replica count missing from INFO replication, acking on primary only");
                0
            }))
        }
    }
}

impl EventSink for RedisSink {
    fn send(&self, topic: &str, _key: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let mut guard = self.conn.lock();
        if guard.is_none() {
            let mut conn = connect(&self.client)?;
            let required = resolve_acks(&mut conn, self.acks)?;
            let was = self.required.swap(required, Ordering::Relaxed);
            if required != was {
                warn!(was, now = required, "replica count changed since last connect");
            }
            *guard = Some(conn);
        }
        let Some(conn) = guard.as_mut() else {
            return Err(BrokerError::Unavailable("no connection".into()));
        };

        let required = self.required_acks();
        let result = (|| -> Result<(), BrokerError> {
            redis::cmd("RPUSH").arg(topic).arg(payload).query::<i64>(conn)?;
            if required > 0 {
                let acked: usize = redis::cmd("WAIT")
                    .arg(required)
                    .arg(self.ack_timeout.as_millis() as u64)
                    .query(conn)?;
                check_acks(acked, required)?;
            }
            Ok(())
        })();

        if let Err(err) = &result {
            if !matches!(err, BrokerError::Rejected(_)) {
                *guard = None;
            }
        }
        result
    }

    fn close(&self) -> Result<(), BrokerError> {
        *self.conn.lock() = None;
        info!("redis sink closed");
        Ok(())
    }
}
