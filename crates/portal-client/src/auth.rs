//! Access-credential management. The long-lived refresh credential is held
//! in memory for the life of the process; short-lived access credentials are
//! minted against the identity provider and shared across replicas through
//! the KV store. A KV create-if-absent lock makes the refresh single-flight:
//! whichever caller wins performs the upstream exchange, everyone else polls
//! the store until the new credential lands.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use url::Url;

use crate::error::{upstream_message, Error, Result};

/// Key under which the current access credential lives.
const ACCESS_CREDENTIAL_KEY: &str = "portal:access-credential";
/// Key of the single-flight refresh lease.
const REFRESH_LOCK_KEY: &str = "portal:refresh-lock";

/// Floor for the stored credential's KV TTL, so a mis-reported `expires_in`
/// cannot thrash the refresh path.
const MIN_STORE_TTL: Duration = Duration::from_secs(60);

const BACKOFF_START: Duration = Duration::from_millis(50);
const BACKOFF_CAP: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct TokenConfig {
    pub token_url: Url,
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    /// A credential with less than this much lifetime left is treated as
    /// expired.
    pub safety_margin: Duration,
    /// Bound on a whole refresh cycle, including waiting out a concurrent
    /// holder of the lock. Also the lock's TTL.
    pub refresh_timeout: Duration,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct StoredCredential {
    token: String,
    /// Unix seconds.
    expires_at: i64,
}

pub struct TokenManager {
    http: reqwest::Client,
    config: TokenConfig,
    kv: Arc<dyn kv::Store>,
    /// Identifies this process as a lease holder, for lock diagnostics.
    holder: String,
}

impl TokenManager {
    pub fn new(http: reqwest::Client, config: TokenConfig, kv: Arc<dyn kv::Store>) -> Self {
        let holder = hex::encode(rand::thread_rng().gen::<[u8; 6]>());
        Self {
            http,
            config,
            kv,
            holder,
        }
    }

    /// Return a currently-valid access credential, refreshing if the stored
    /// one is absent or inside the safety margin.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn current(&self) -> Result<String> {
        let deadline = tokio::time::Instant::now() + self.config.refresh_timeout;
        let mut backoff = BACKOFF_START;

        loop {
            if let Some(token) = self.stored_fresh().await? {
                return Ok(token);
            }

            if self
                .kv
                .set_nx(REFRESH_LOCK_KEY, &self.holder, self.config.refresh_timeout)
                .await?
            {
                // Re-check under the lock: another replica may have finished
                // a refresh between our read and the acquisition.
                let result = match self.stored_fresh().await? {
                    Some(token) => Ok(token),
                    None => self.refresh().await.map(|cred| cred.token),
                };
                if let Err(err) = self.kv.delete(REFRESH_LOCK_KEY).await {
                    tracing::warn!(%err, "failed to release refresh lock; it will lapse with its TTL");
                }
                return result;
            }

            // Another caller holds the lease. Back off and re-read.
            if tokio::time::Instant::now() + backoff >= deadline {
                return Err(Error::CredentialUnavailable(
                    "timed out waiting for a concurrent credential refresh".to_string(),
                ));
            }
            tokio::time::sleep(jittered(backoff)).await;
            backoff = (backoff * 2).min(BACKOFF_CAP);
        }
    }

    /// Drop the stored credential so the next `current()` refreshes. Used
    /// when the upstream rejects a credential the store still considers
    /// fresh.
    pub async fn invalidate(&self) -> Result<()> {
        tracing::info!("invalidating stored access credential");
        self.kv.delete(ACCESS_CREDENTIAL_KEY).await?;
        Ok(())
    }

    /// Whether a fresh credential is currently stored. Liveness reporting
    /// only; does not trigger a refresh.
    pub async fn has_fresh_credential(&self) -> bool {
        matches!(self.stored_fresh().await, Ok(Some(_)))
    }

    async fn stored_fresh(&self) -> Result<Option<String>> {
        let Some(raw) = self.kv.get(ACCESS_CREDENTIAL_KEY).await? else {
            return Ok(None);
        };
        let cred: StoredCredential = match serde_json::from_str(&raw) {
            Ok(cred) => cred,
            Err(err) => {
                tracing::warn!(%err, "stored access credential is malformed; treating as absent");
                return Ok(None);
            }
        };

        let remaining = cred.expires_at - time::OffsetDateTime::now_utc().unix_timestamp();
        if remaining >= self.config.safety_margin.as_secs() as i64 {
            Ok(Some(cred.token))
        } else {
            tracing::debug!(remaining, "stored access credential is inside the safety margin");
            Ok(None)
        }
    }

    #[tracing::instrument(skip(self), fields(holder = %self.holder))]
    async fn refresh(&self) -> Result<StoredCredential> {
        #[derive(serde::Deserialize)]
        struct TokenResponse {
            access_token: String,
            expires_in: i64,
        }

        let response = self
            .http
            .post(self.config.token_url.clone())
            .timeout(self.config.refresh_timeout)
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("refresh_token", self.config.refresh_token.as_str()),
            ])
            .send()
            .await
            .map_err(|err| {
                Error::CredentialUnavailable(format!("token endpoint unreachable: {err}"))
            })?;

        let status = response.status();
        let body = response.bytes().await.map_err(|err| {
            Error::CredentialUnavailable(format!("reading token endpoint response: {err}"))
        })?;

        if status.is_client_error() {
            // Terminal: the refresh credential itself was refused.
            return Err(Error::RefreshRejected {
                status: status.as_u16(),
                message: upstream_message(&body),
            });
        } else if !status.is_success() {
            return Err(Error::CredentialUnavailable(format!(
                "token endpoint returned {status}"
            )));
        }

        let token: TokenResponse = serde_json::from_slice(&body).map_err(|err| {
            Error::CredentialUnavailable(format!("malformed token endpoint response: {err}"))
        })?;

        let expires_at = time::OffsetDateTime::now_utc().unix_timestamp() + token.expires_in;
        let cred = StoredCredential {
            token: token.access_token,
            expires_at,
        };

        let store_ttl = Duration::from_secs(token.expires_in.max(0) as u64)
            .saturating_sub(self.config.safety_margin)
            .max(MIN_STORE_TTL);
        let raw = serde_json::to_string(&cred).map_err(anyhow::Error::from)?;
        self.kv.set(ACCESS_CREDENTIAL_KEY, &raw, store_ttl).await?;

        tracing::info!(expires_in = token.expires_in, "refreshed access credential");
        Ok(cred)
    }
}

fn jittered(base: Duration) -> Duration {
    base.mul_f64(rand::thread_rng().gen_range(0.8..1.2))
}
