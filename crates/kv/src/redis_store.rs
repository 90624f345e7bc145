use std::time::Duration;

use redis::aio::ConnectionManager;

use crate::{Error, Result, Store};

/// Redis-backed [`Store`]. `ConnectionManager` reconnects on failure and is
/// cheap to clone, so each operation works on its own handle.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(from_redis)?;
        let conn = ConnectionManager::new(client).await.map_err(from_redis)?;
        tracing::debug!(url, "connected to redis");
        Ok(Self { conn })
    }
}

fn from_redis(err: redis::RedisError) -> Error {
    Error::Unavailable(err.to_string())
}

// Redis EX arguments are whole seconds; round sub-second TTLs up so a short
// TTL is never dropped to "no expiry".
fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait::async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut self.conn.clone())
            .await
            .map_err(from_redis)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async::<_, ()>(&mut self.conn.clone())
            .await
            .map_err(from_redis)
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        // SET NX replies OK when the key was created and nil otherwise.
        let created: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async(&mut self.conn.clone())
            .await
            .map_err(from_redis)?;
        Ok(created.is_some())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        redis::cmd("DEL")
            .arg(key)
            .query_async::<_, ()>(&mut self.conn.clone())
            .await
            .map_err(from_redis)
    }

    async fn incr(&self, key: &str, ttl: Duration) -> Result<u64> {
        let mut conn = self.conn.clone();
        let count: i64 = redis::cmd("INCR")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|err| {
                if err.to_string().contains("not an integer") {
                    Error::NotACounter(key.to_string())
                } else {
                    from_redis(err)
                }
            })?;
        if count == 1 {
            redis::cmd("EXPIRE")
                .arg(key)
                .arg(ttl_secs(ttl))
                .query_async::<_, ()>(&mut conn)
                .await
                .map_err(from_redis)?;
        }
        Ok(count as u64)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let millis: i64 = redis::cmd("PTTL")
            .arg(key)
            .query_async(&mut self.conn.clone())
            .await
            .map_err(from_redis)?;
        // -2 is "no such key", -1 is "no expiry".
        if millis < 0 {
            return Ok(None);
        }
        Ok(Some(Duration::from_millis(millis as u64)))
    }

    async fn ping(&self) -> Result<()> {
        let _: String = redis::cmd("PING")
            .arg("kv")
            .query_async(&mut self.conn.clone())
            .await
            .map_err(from_redis)?;
        Ok(())
    }
}
