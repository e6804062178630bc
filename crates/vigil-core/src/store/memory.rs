use super::Cache;
use crate::error::StoreError;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(BTreeMap<String, i64>),
    List(VecDeque<String>),
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Value::Str(_) => "string",
            Value::Hash(_) => "hash",
            Value::List(_) => "list",
        }
    }
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

fn wrong_type(key: &str, found: &Value, wanted: &str) -> StoreError {
    StoreError::Corrupt {
        key: key.to_string(),
        reason: format!("holds a {}, expected a {wanted}", found.kind()),
    }
}

/// Closest two sweeps may run; bounds the cost of a stream of short-lived keys.
const SWEEP_GAP: Duration = Duration::from_millis(10);

#[derive(Debug, Default)]
struct Entries {
    map: HashMap<String, Entry>,
    /// Soonest `expires_at` still held.
    earliest: Option<Instant>,
    last_sweep: Option<Instant>,
}

impl Entries {
    /// Drops expired entries once at least one is due.
    fn sweep(&mut self, now: Instant) {
        let due = self.earliest.is_some_and(|at| at <= now)
            && self.last_sweep.is_none_or(|at| now.duration_since(at) >= SWEEP_GAP);
        if !due {
            return;
        }
        self.map.retain(|_, e| e.live(now));
        self.earliest = self.map.values().filter_map(|e| e.expires_at).min();
        self.last_sweep = Some(now);
    }
}

/// In-process [`Cache`]. Expired keys read as absent and are reclaimed by a
/// sweep on a later write.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<Entries>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.read().map.values().filter(|e| e.live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live entry for `key`, created with `init` when absent or expired.
    fn upsert<T>(
        &self,
        key: &str,
        init: impl FnOnce() -> Value,
        op: impl FnOnce(&mut Value) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.write();
        entries.sweep(now);
        match entries.map.get_mut(key) {
            Some(entry) if entry.live(now) => op(&mut entry.value),
            _ => {
                let mut value = init();
                let out = op(&mut value)?;
                entries.map.insert(
                    key.to_string(),
                    Entry {
                        value,
                        expires_at: None,
                    },
                );
                Ok(out)
            }
        }
    }

    fn read<T>(&self, key: &str, op: impl FnOnce(Option<&Value>) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let now = Instant::now();
        let entries = self.entries.read();
        op(entries.map.get(key).filter(|e| e.live(now)).map(|e| &e.value))
    }
}

impl Cache for MemoryCache {
    fn incr(&self, key: &str, by: i64) -> Result<i64, StoreError> {
        self.upsert(
            key,
            || Value::Str("0".to_string()),
            |value| match value {
                Value::Str(raw) => {
                    let current: i64 = raw.parse().map_err(|_| StoreError::Corrupt {
                        key: key.to_string(),
                        reason: format!("{raw:?} is not an integer"),
                    })?;
                    let next = current.saturating_add(by);
                    *raw = next.to_string();
                    Ok(next)
                }
                other => Err(wrong_type(key, other, "string")),
            },
        )
    }

    fn hincr(&self, key: &str, field: &str, by: i64) -> Result<i64, StoreError> {
        self.upsert(
            key,
            || Value::Hash(BTreeMap::new()),
            |value| match value {
                Value::Hash(hash) => {
                    let slot = hash.entry(field.to_string()).or_insert(0);
                    *slot = slot.saturating_add(by);
                    Ok(*slot)
                }
                other => Err(wrong_type(key, other, "hash")),
            },
        )
    }

    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.read(key, |value| match value {
            None => Ok(None),
            Some(Value::Str(raw)) => Ok(Some(raw.clone())),
            Some(other) => Err(wrong_type(key, other, "string")),
        })
    }

    fn hgetall(&self, key: &str) -> Result<BTreeMap<String, i64>, StoreError> {
        self.read(key, |value| match value {
            None => Ok(BTreeMap::new()),
            Some(Value::Hash(hash)) => Ok(hash.clone()),
            Some(other) => Err(wrong_type(key, other, "hash")),
        })
    }

    fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.write();
        entries.sweep(now);
        // A TTL past the clock's range never expires.
        let expires_at = now.checked_add(ttl);
        if let Some(at) = expires_at {
            entries.earliest = Some(entries.earliest.map_or(at, |e| e.min(at)));
        }
        entries.map.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at,
            },
        );
        Ok(())
    }

    fn push_front_capped(&self, key: &str, value: &str, cap: usize) -> Result<(), StoreError> {
        self.upsert(
            key,
            || Value::List(VecDeque::new()),
            |slot| match slot {
                Value::List(list) => {
                    list.push_front(value.to_string());
                    list.truncate(cap);
                    Ok(())
                }
                other => Err(wrong_type(key, other, "list")),
            },
        )
    }

    fn range(&self, key: &str, limit: usize) -> Result<Vec<String>, StoreError> {
        self.read(key, |value| match value {
            None => Ok(Vec::new()),
            Some(Value::List(list)) => Ok(list.iter().take(limit).cloned().collect()),
            Some(other) => Err(wrong_type(key, other, "list")),
        })
    }

    fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incr_starts_from_zero() {
        let cache = MemoryCache::new();
        assert_eq!(cache.incr("n", 1).unwrap(), 1);
        assert_eq!(cache.incr("n", 4).unwrap(), 5);
        assert_eq!(cache.get("n").unwrap().as_deref(), Some("5"));
        assert_eq!(cache.get("missing").unwrap(), None);
    }

    #[test]
    fn test_wrong_type_is_corrupt() {
        let cache = MemoryCache::new();
        cache.hincr("h", "f", 1).unwrap();
        assert!(matches!(cache.incr("h", 1), Err(StoreError::Corrupt { .. })));
        assert!(matches!(cache.range("h", 1), Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn test_push_front_trims_tail() {
        let cache = MemoryCache::new();
        for v in ["a", "b", "c", "d"] {
            cache.push_front_capped("l", v, 3).unwrap();
        }
        assert_eq!(cache.range("l", 10).unwrap(), ["d", "c", "b"]);
        assert_eq!(cache.range("l", 2).unwrap(), ["d", "c"]);
    }

    #[test]
    fn test_expired_keys_read_as_absent() {
        let cache = MemoryCache::new();
        cache.set_ex("k", "v", Duration::from_millis(10)).unwrap();
        assert_eq!(cache.get("k").unwrap().as_deref(), Some("v"));
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(cache.get("k").unwrap(), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_expired_keys_are_reclaimed_on_write() {
        let cache = MemoryCache::new();
        for i in 0..1000 {
            cache.set_ex(&format!("alert:{i}"), "{}", Duration::from_millis(1)).unwrap();
        }
        cache.incr("counter", 1).unwrap();
        std::thread::sleep(Duration::from_millis(25));

        cache.set_ex("alert:last", "{}", Duration::from_secs(60)).unwrap();
        let entries = cache.entries.read();
        assert_eq!(entries.map.len(), 2);
        assert!(entries.map.contains_key("counter"));
        assert!(entries.map.contains_key("alert:last"));
    }

    #[test]
    fn test_concurrent_increments_are_not_lost() {
        let cache = std::sync::Arc::new(MemoryCache::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        cache.incr("n", 1).unwrap();
                        cache.hincr("h", "x", 1).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cache.get("n").unwrap().as_deref(), Some("1000"));
        assert_eq!(cache.hgetall("h").unwrap()["x"], 1000);
    }
}
