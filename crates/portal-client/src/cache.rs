//! KV-backed memoization of read-only tool results. Entries are keyed by a
//! fingerprint of the invocation and expire passively; writes never
//! invalidate, so readers may observe up to one TTL of staleness.

use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CachedResponse {
    pub body: String,
    pub content_type: String,
}

/// Deterministic fingerprint of (tool name, argument bindings).
/// `serde_json::Map` iterates keys in sorted order, so serializing the
/// arguments yields a canonical form.
pub fn fingerprint(tool: &str, arguments: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tool.as_bytes());
    hasher.update([0u8]);
    hasher.update(arguments.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

pub struct ResponseCache {
    kv: Arc<dyn kv::Store>,
}

impl ResponseCache {
    pub fn new(kv: Arc<dyn kv::Store>) -> Self {
        Self { kv }
    }

    /// A transient KV failure degrades to a miss: a redundant upstream read
    /// beats failing the call.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn get(&self, fingerprint: &str) -> Option<CachedResponse> {
        let raw = match self.kv.get(&key(fingerprint)).await {
            Ok(raw) => raw?,
            Err(err) => {
                tracing::warn!(%err, "cache read failed; treating as a miss");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(cached) => {
                tracing::debug!(fingerprint, "cache hit");
                Some(cached)
            }
            Err(err) => {
                tracing::warn!(%err, "malformed cache entry; treating as a miss");
                None
            }
        }
    }

    /// Only successful responses reach this point; errors are never cached.
    #[tracing::instrument(level = "debug", skip(self, response))]
    pub async fn put(&self, fingerprint: &str, response: &CachedResponse, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        let raw = match serde_json::to_string(response) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(%err, "failed to serialize cache entry");
                return;
            }
        };
        if let Err(err) = self.kv.set(&key(fingerprint), &raw, ttl).await {
            tracing::warn!(%err, "cache write failed");
        }
    }
}

fn key(fingerprint: &str) -> String {
    format!("cache:{fingerprint}")
}
