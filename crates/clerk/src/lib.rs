//! A JSON-RPC 2.0 tool-invocation adapter for a work-management portal.
//! Assistants call a closed set of tools; the adapter validates arguments,
//! performs the authenticated upstream REST call, and returns a normalized
//! result or a stable error. State shared across replicas (credentials,
//! rate counters, caches, idempotency markers) lives in the KV store.

use std::sync::Arc;
use std::time::Duration;

pub mod admission;
pub mod logging;
pub mod registry;
pub mod rpc;
pub mod server;
pub mod stdio;
pub mod tools;
pub mod webhook;

/// Shared per-process context, threaded through both transports.
pub struct App {
    pub client: portal_client::Client,
    pub tokens: Arc<portal_client::TokenManager>,
    pub cache: portal_client::ResponseCache,
    pub kv: Arc<dyn kv::Store>,
    /// TTL for read tools that do not declare their own.
    pub default_cache_ttl: Duration,
    /// Bound on one tool handler's execution.
    pub handler_timeout: Duration,
    /// Window within which identical createTask calls coalesce.
    pub idempotency_window: Duration,
}
