//! Ingestion of upstream-originated event deliveries: HMAC signature
//! verification over the raw body, an optional timestamp window, replay
//! suppression keyed on the delivery id, and fan-out to registered
//! handlers. Handler failures are logged but acknowledged, so the upstream
//! does not enter a redelivery storm.

use std::sync::Arc;
use std::time::Duration;

use hmac::{Hmac, Mac};
use sha2::Sha256;

pub const SIGNATURE_HEADER: &str = "x-portal-signature";
pub const TIMESTAMP_HEADER: &str = "x-portal-timestamp";

/// Window within which a supplied delivery timestamp must fall.
const TIMESTAMP_WINDOW: Duration = Duration::from_secs(5 * 60);
/// How long delivery ids are remembered for replay suppression.
const REPLAY_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    fn handles(&self, kind: &str) -> bool;
    async fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

/// Logs task lifecycle events. The upstream remains the system of record,
/// so observing the event is the whole downstream effect for now.
pub struct TaskEventLogger;

#[async_trait::async_trait]
impl EventHandler for TaskEventLogger {
    fn handles(&self, kind: &str) -> bool {
        kind.starts_with("task.")
    }

    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        let task_id = event.data.get("task-id").and_then(|v| v.as_str());
        tracing::info!(kind = %event.kind, delivery = %event.id, task_id, "task event received");
        Ok(())
    }
}

#[derive(Debug, PartialEq)]
pub enum Outcome {
    /// Dispatched to `handled` matching handlers.
    Accepted { handled: usize },
    /// Replayed delivery; acknowledged without dispatch.
    Duplicate,
}

#[derive(Debug, PartialEq)]
pub enum Rejection {
    /// Missing/mismatched signature, or a stale timestamp.
    BadSignature(&'static str),
    /// Verified but undecodable payload. A framework-level fault: the
    /// transport answers 5xx so the upstream redelivers.
    BadPayload(String),
}

pub struct WebhookRouter {
    secret: Vec<u8>,
    kv: Arc<dyn kv::Store>,
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl WebhookRouter {
    pub fn new(secret: Vec<u8>, kv: Arc<dyn kv::Store>) -> Self {
        Self {
            secret,
            kv,
            handlers: vec![Arc::new(TaskEventLogger)],
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn deliver(
        &self,
        signature: Option<&str>,
        timestamp: Option<&str>,
        body: &[u8],
    ) -> Result<Outcome, Rejection> {
        self.verify_signature(signature, body)?;
        self.verify_timestamp(timestamp)?;

        let event: Event = serde_json::from_slice(body)
            .map_err(|err| Rejection::BadPayload(format!("undecodable event payload: {err}")))?;

        // set_nx both records and tests the delivery id. A store hiccup
        // fails open: a rare duplicate dispatch beats dropping deliveries.
        let replay_key = format!("webhook:delivery:{}", event.id);
        match self.kv.set_nx(&replay_key, "seen", REPLAY_TTL).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!(delivery = %event.id, "suppressing replayed delivery");
                return Ok(Outcome::Duplicate);
            }
            Err(err) => {
                tracing::warn!(%err, "replay suppression unavailable; processing anyway");
            }
        }

        let mut handled = 0;
        for handler in self.handlers.iter().filter(|h| h.handles(&event.kind)) {
            match handler.handle(&event).await {
                Ok(()) => handled += 1,
                // Acknowledged regardless; the upstream must not redeliver.
                Err(err) => {
                    tracing::error!(%err, kind = %event.kind, delivery = %event.id, "event handler failed")
                }
            }
        }
        tracing::debug!(kind = %event.kind, handled, "delivery dispatched");
        Ok(Outcome::Accepted { handled })
    }

    fn verify_signature(&self, signature: Option<&str>, body: &[u8]) -> Result<(), Rejection> {
        let Some(signature) = signature else {
            return Err(Rejection::BadSignature("missing signature header"));
        };
        let Ok(signature) = hex::decode(signature.trim()) else {
            return Err(Rejection::BadSignature("signature is not hex"));
        };

        let mut mac = Hmac::<Sha256>::new_from_slice(&self.secret)
            .map_err(|_| Rejection::BadSignature("signing secret is unusable"))?;
        mac.update(body);
        // Constant-time comparison.
        mac.verify_slice(&signature)
            .map_err(|_| Rejection::BadSignature("signature mismatch"))
    }

    fn verify_timestamp(&self, timestamp: Option<&str>) -> Result<(), Rejection> {
        let Some(timestamp) = timestamp else {
            return Ok(()); // Optional header.
        };
        let Ok(timestamp) = timestamp.trim().parse::<i64>() else {
            return Err(Rejection::BadSignature("timestamp is not unix seconds"));
        };
        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        if (now - timestamp).unsigned_abs() > TIMESTAMP_WINDOW.as_secs() {
            return Err(Rejection::BadSignature("timestamp outside the accepted window"));
        }
        Ok(())
    }
}

/// Sign a body the way the upstream does. Shared with tests and operator
/// tooling.
pub fn sign(secret: &[u8], body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}
