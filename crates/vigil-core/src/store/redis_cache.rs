use super::Cache;
use crate::error::StoreError;
use parking_lot::Mutex;
use redis::{Client, Connection};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, warn};

/// [`Cache`] over one Redis connection, reopened after I/O failures.
pub struct RedisCache {
    client: Client,
    conn: Mutex<Option<Connection>>,
}

impl RedisCache {
    pub fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let cache = Self {
            conn: Mutex::new(Some(client.get_connection()?)),
            client,
        };
        cache.ping()?;
        info!("connected to redis cache");
        Ok(cache)
    }

    fn with_conn<T>(&self, op: impl FnOnce(&mut Connection) -> redis::RedisResult<T>) -> Result<T, StoreError> {
        let mut guard = self.conn.lock();
        if guard.is_none() {
            *guard = Some(self.client.get_connection()?);
        }
        let Some(conn) = guard.as_mut() else {
            return Err(StoreError::Unavailable("no connection".into()));
        };
        let result = op(conn);
        result.map_err(|err| {
            if err.is_io_error() || err.is_connection_dropped() {
                warn!(error = %err, "dropping redis cache connection");
                *guard = None;
            }
            StoreError::from(err)
        })
    }
}

impl Cache for RedisCache {
    fn incr(&self, key: &str, by: i64) -> Result<i64, StoreError> {
        self.with_conn(|conn| redis::cmd("INCRBY").arg(key).arg(by).query(conn))
    }

    fn hincr(&self, key: &str, field: &str, by: i64) -> Result<i64, StoreError> {
        self.with_conn(|conn| redis::cmd("HINCRBY").arg(key).arg(field).arg(by).query(conn))
    }

    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.with_conn(|conn| redis::cmd("GET").arg(key).query(conn))
    }

    fn hgetall(&self, key: &str) -> Result<BTreeMap<String, i64>, StoreError> {
        self.with_conn(|conn| redis::cmd("HGETALL").arg(key).query(conn))
    }

    fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let secs = ttl.as_secs().max(1);
        self.with_conn(|conn| redis::cmd("SETEX").arg(key).arg(secs).arg(value).query(conn))
    }

    fn push_front_capped(&self, key: &str, value: &str, cap: usize) -> Result<(), StoreError> {
        let last = cap.max(1) as i64 - 1;
        self.with_conn(|conn| {
            redis::pipe()
                .atomic()
                .cmd("LPUSH")
                .arg(key)
                .arg(value)
                .ignore()
                .cmd("LTRIM")
                .arg(key)
                .arg(0)
                .arg(last)
                .ignore()
                .query(conn)
        })
    }

    fn range(&self, key: &str, limit: usize) -> Result<Vec<String>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let last = limit as i64 - 1;
        self.with_conn(|conn| redis::cmd("LRANGE").arg(key).arg(0).arg(last).query(conn))
    }

    fn ping(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| redis::cmd("PING").query::<String>(conn))
            .map(|_| ())
    }
}
