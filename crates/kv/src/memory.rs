use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

// tokio's Instant (rather than std's) so that tests driving the paused
// runtime clock observe expiry.
use tokio::time::Instant;

use crate::{Error, Result, Store};

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self) -> bool {
        self.expires_at.map_or(true, |at| at > Instant::now())
    }
}

/// In-process implementation of [`Store`] with the same TTL and
/// create-if-absent semantics as the Redis implementation. Expiry is
/// evaluated lazily on access.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<HashMap<String, Entry>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_live<T>(&self, key: &str, f: impl FnOnce(Option<&Entry>) -> T) -> T {
        let mut map = self.inner.lock().unwrap();
        if map.get(key).is_some_and(|e| !e.live()) {
            map.remove(key);
        }
        f(map.get(key))
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.with_live(key, |e| e.map(|e| e.value.clone())))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut map = self.inner.lock().unwrap();
        map.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut map = self.inner.lock().unwrap();
        if map.get(key).is_some_and(|e| e.live()) {
            return Ok(false);
        }
        map.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.lock().unwrap().remove(key);
        Ok(())
    }

    async fn incr(&self, key: &str, ttl: Duration) -> Result<u64> {
        use std::collections::hash_map::Entry as Slot;

        let mut map = self.inner.lock().unwrap();
        if map.get(key).is_some_and(|e| !e.live()) {
            map.remove(key);
        }
        match map.entry(key.to_string()) {
            Slot::Occupied(mut slot) => {
                let count: u64 = slot
                    .get()
                    .value
                    .parse()
                    .map_err(|_| Error::NotACounter(key.to_string()))?;
                slot.get_mut().value = (count + 1).to_string();
                Ok(count + 1)
            }
            Slot::Vacant(slot) => {
                slot.insert(Entry {
                    value: "1".to_string(),
                    expires_at: Some(Instant::now() + ttl),
                });
                Ok(1)
            }
        }
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        Ok(self.with_live(key, |e| {
            e.and_then(|e| e.expires_at)
                .map(|at| at.saturating_duration_since(Instant::now()))
        }))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
