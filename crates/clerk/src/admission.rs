//! Admission checks for the network transport, applied in order ahead of
//! dispatch: bearer verification, source-address allow-listing, then rate
//! limiting. Each check is terminal on failure. Authentication runs first
//! so the rate-limit principal is the stable token subject wherever
//! possible, rather than a shared NAT address.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use ipnetwork::IpNetwork;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};

/// Sentinel peer (TEST-NET-1) admitted when the test profile is active.
pub const TEST_SENTINEL: IpAddr = IpAddr::V4(std::net::Ipv4Addr::new(192, 0, 2, 1));

#[derive(Debug, serde::Deserialize)]
struct Claims {
    #[serde(default)]
    sub: String,
    exp: u64,
    iat: u64,
    #[serde(default)]
    #[allow(dead_code)]
    nbf: Option<u64>,
}

/// Whoever survived admission; names the rate-limit bucket and shows up in
/// logs.
#[derive(Debug, Clone)]
pub struct Principal {
    pub subject: String,
}

#[derive(Debug)]
pub enum Denial {
    Unauthorized(String),
    Forbidden(String),
    RateLimited { retry_after: Duration },
}

pub struct GateConfig {
    pub signing_key: Vec<u8>,
    pub allow_list: Vec<IpNetwork>,
    pub rate_limit: u32,
    pub rate_window: Duration,
    /// Reject tokens whose iat→exp span exceeds this, whatever the signer
    /// intended.
    pub max_token_lifetime: Duration,
    pub test_profile: bool,
}

pub struct Gate {
    decoding_key: DecodingKey,
    validation: Validation,
    allow_list: Vec<IpNetwork>,
    rate_limit: u32,
    rate_window: Duration,
    max_token_lifetime: Duration,
    test_profile: bool,
    kv: Arc<dyn kv::Store>,
}

impl Gate {
    pub fn new(config: GateConfig, kv: Arc<dyn kv::Store>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // Zero leeway: a token whose exp equals the current instant is
        // already expired.
        validation.leeway = 0;
        validation.validate_nbf = true;
        validation.set_required_spec_claims(&["exp"]);

        Self {
            decoding_key: DecodingKey::from_secret(&config.signing_key),
            validation,
            allow_list: config.allow_list,
            rate_limit: config.rate_limit,
            rate_window: config.rate_window,
            max_token_lifetime: config.max_token_lifetime,
            test_profile: config.test_profile,
            kv,
        }
    }

    /// `token` is the bearer token the transport extracted from the
    /// Authorization header, absent when the header was missing or not a
    /// bearer scheme.
    #[tracing::instrument(level = "debug", skip(self, token))]
    pub async fn admit(&self, token: Option<&str>, peer: IpAddr) -> Result<Principal, Denial> {
        let claims = self.verify_bearer(token)?;

        self.check_allow_list(peer)?;

        let subject = if claims.sub.is_empty() {
            peer.to_string()
        } else {
            claims.sub
        };
        self.check_rate_limit(&subject).await?;

        Ok(Principal { subject })
    }

    fn verify_bearer(&self, token: Option<&str>) -> Result<Claims, Denial> {
        let Some(token) = token else {
            return Err(Denial::Unauthorized("missing bearer token".to_string()));
        };

        let claims = jsonwebtoken::decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|err| Denial::Unauthorized(format!("invalid bearer token: {err}")))?
            .claims;

        let lifetime = claims.exp.saturating_sub(claims.iat);
        if lifetime > self.max_token_lifetime.as_secs() {
            return Err(Denial::Unauthorized(
                "bearer token lifetime exceeds the configured ceiling".to_string(),
            ));
        }

        Ok(claims)
    }

    fn check_allow_list(&self, peer: IpAddr) -> Result<(), Denial> {
        if self.test_profile && peer == TEST_SENTINEL {
            return Ok(());
        }
        if self.allow_list.iter().any(|network| network.contains(peer)) {
            return Ok(());
        }
        Err(Denial::Forbidden(format!(
            "source address {peer} is not allow-listed"
        )))
    }

    /// Fixed-window counter in KV. A transient store failure fails open:
    /// admitting a request beats dropping traffic on an infrastructure
    /// hiccup.
    async fn check_rate_limit(&self, subject: &str) -> Result<(), Denial> {
        let key = format!("rate:{subject}");
        let count = match self.kv.incr(&key, self.rate_window).await {
            Ok(count) => count,
            Err(err) => {
                tracing::warn!(%err, "rate-limit counter unavailable; admitting");
                return Ok(());
            }
        };

        if count <= self.rate_limit as u64 {
            return Ok(());
        }

        let retry_after = match self.kv.ttl(&key).await {
            Ok(Some(remaining)) => remaining,
            _ => self.rate_window,
        };
        Err(Denial::RateLimited { retry_after })
    }
}
