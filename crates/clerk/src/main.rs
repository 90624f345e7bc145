use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use clerk::admission::{Gate, GateConfig};
use clerk::server::ServerState;
use clerk::webhook::WebhookRouter;
use clerk::{logging, server, stdio, App};
use ipnetwork::IpNetwork;
use portal_client::{ResponseCache, TokenConfig, TokenManager};
use url::Url;

/// A JSON-RPC tool-invocation adapter for the portal's projects and files
/// services.
#[derive(Debug, Parser)]
#[command(about, version)]
pub struct Cli {
    /// OAuth client id of the portal integration.
    #[arg(long, env = "PORTAL_CLIENT_ID")]
    portal_client_id: String,
    /// OAuth client secret of the portal integration.
    #[arg(long, env = "PORTAL_CLIENT_SECRET", hide_env_values = true)]
    portal_client_secret: String,
    /// Long-lived refresh credential produced by the operator's one-off
    /// consent flow.
    #[arg(long, env = "PORTAL_REFRESH_TOKEN", hide_env_values = true)]
    portal_refresh_token: String,
    /// Tenant namespace under which projects and files reside.
    #[arg(long, env = "PORTAL_ID")]
    portal_id: String,

    /// OAuth token endpoint.
    #[arg(
        long,
        env = "PORTAL_TOKEN_URL",
        default_value = "https://accounts.portal-suite.dev/oauth/v2/token"
    )]
    token_url: Url,
    /// Base URL of the projects service.
    #[arg(
        long,
        env = "PROJECTS_BASE_URL",
        default_value = "https://projects.portal-suite.dev/api/v1/"
    )]
    projects_base_url: Url,
    /// Base URL of the files service.
    #[arg(
        long,
        env = "FILES_BASE_URL",
        default_value = "https://files.portal-suite.dev/api/v1/"
    )]
    files_base_url: Url,

    /// Key-value store endpoint (redis://, rediss://, or memory:// for
    /// stdio-only development).
    #[arg(long, env = "KV_URL")]
    kv_url: String,

    /// Symmetric key verifying client bearer tokens. Required for the
    /// network transport; must be at least 32 bytes.
    #[arg(long, env = "BEARER_SIGNING_KEY", hide_env_values = true)]
    bearer_signing_key: Option<String>,
    /// Peer addresses and CIDR blocks admitted to the RPC endpoint.
    #[arg(
        long,
        env = "ALLOW_LIST",
        default_value = "127.0.0.1,::1",
        value_delimiter = ','
    )]
    allow_list: Vec<IpNetwork>,
    /// Requests admitted per principal per window.
    #[arg(long, env = "RATE_LIMIT", default_value = "100")]
    rate_limit: u32,
    #[arg(long, env = "RATE_WINDOW", value_parser = humantime::parse_duration, default_value = "60s")]
    rate_window: Duration,
    /// Reject bearer tokens whose lifetime exceeds this, whatever the
    /// signing policy emits.
    #[arg(long, env = "MAX_TOKEN_LIFETIME", value_parser = humantime::parse_duration, default_value = "24h")]
    max_token_lifetime: Duration,

    /// Shared secret verifying webhook deliveries; ingestion is enabled iff
    /// this is set.
    #[arg(long, env = "WEBHOOK_SECRET", hide_env_values = true)]
    webhook_secret: Option<String>,

    /// TTL for read tools that do not declare their own.
    #[arg(long, env = "CACHE_TTL", value_parser = humantime::parse_duration, default_value = "300s")]
    cache_ttl: Duration,
    /// Remaining lifetime below which an access credential is refreshed.
    #[arg(long, env = "TOKEN_SAFETY_MARGIN", value_parser = humantime::parse_duration, default_value = "300s")]
    token_safety_margin: Duration,
    /// Bound on one credential refresh cycle, lock wait included.
    #[arg(long, env = "REFRESH_TIMEOUT", value_parser = humantime::parse_duration, default_value = "30s")]
    refresh_timeout: Duration,
    /// Per upstream call.
    #[arg(long, env = "UPSTREAM_CALL_TIMEOUT", value_parser = humantime::parse_duration, default_value = "10s")]
    upstream_call_timeout: Duration,
    /// Per tool handler.
    #[arg(long, env = "HANDLER_TIMEOUT", value_parser = humantime::parse_duration, default_value = "30s")]
    handler_timeout: Duration,
    /// End-to-end, per request.
    #[arg(long, env = "REQUEST_TIMEOUT", value_parser = humantime::parse_duration, default_value = "60s")]
    request_timeout: Duration,
    /// Window within which identical createTask calls coalesce.
    #[arg(long, env = "IDEMPOTENCY_WINDOW", value_parser = humantime::parse_duration, default_value = "60s")]
    idempotency_window: Duration,

    /// Upstream connection pool size.
    #[arg(long, env = "CONNECTION_POOL", default_value = "100")]
    connection_pool: usize,
    /// Port of the network transport.
    #[arg(long, env = "RPC_PORT", default_value = "8080")]
    port: u16,

    /// Serve newline-delimited JSON-RPC on stdin/stdout instead of the
    /// network transport. No admission gate applies.
    #[arg(long, action(clap::ArgAction::SetTrue))]
    stdio: bool,
    /// Admit the TEST-NET-1 sentinel peer. Test harnesses only.
    #[arg(long, hide = true, action(clap::ArgAction::SetTrue))]
    test_profile: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::install();

    let cli = Cli::parse();
    tracing::info!("starting clerk");

    let kv = kv::open(&cli.kv_url)
        .await
        .context("connecting to the key-value store")?;
    kv.ping()
        .await
        .context("key-value store unreachable at boot")?;

    let http = reqwest::Client::builder()
        .pool_max_idle_per_host(cli.connection_pool)
        .build()
        .context("building the upstream HTTP client")?;

    let tokens = Arc::new(TokenManager::new(
        http.clone(),
        TokenConfig {
            token_url: cli.token_url,
            client_id: cli.portal_client_id,
            client_secret: cli.portal_client_secret,
            refresh_token: cli.portal_refresh_token,
            safety_margin: cli.token_safety_margin,
            refresh_timeout: cli.refresh_timeout,
        },
        kv.clone(),
    ));

    let client = portal_client::Client::new(
        http,
        tokens.clone(),
        cli.projects_base_url,
        cli.files_base_url,
        cli.portal_id,
        cli.upstream_call_timeout,
    );

    let app = Arc::new(App {
        client,
        tokens,
        cache: ResponseCache::new(kv.clone()),
        kv: kv.clone(),
        default_cache_ttl: cli.cache_ttl,
        handler_timeout: cli.handler_timeout,
        idempotency_window: cli.idempotency_window,
    });

    let stop = tokio_util::sync::CancellationToken::new();
    let ctrl_c_token = stop.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for CTRL-C");
        tracing::info!("received ctrl-c, initiating shutdown");
        ctrl_c_token.cancel();
    });

    if cli.stdio {
        return stdio::serve(app, cli.request_timeout, stop).await;
    }

    let signing_key = cli
        .bearer_signing_key
        .context("--bearer-signing-key is required for the network transport")?;
    anyhow::ensure!(
        signing_key.len() >= 32,
        "bearer signing key must be at least 32 bytes"
    );

    let gate = Arc::new(Gate::new(
        GateConfig {
            signing_key: signing_key.into_bytes(),
            allow_list: cli.allow_list,
            rate_limit: cli.rate_limit,
            rate_window: cli.rate_window,
            max_token_lifetime: cli.max_token_lifetime,
            test_profile: cli.test_profile,
        },
        kv.clone(),
    ));

    let webhook = cli
        .webhook_secret
        .map(|secret| Arc::new(WebhookRouter::new(secret.into_bytes(), kv.clone())));

    let router = server::build_router(ServerState {
        app,
        gate,
        webhook,
        request_timeout: cli.request_timeout,
    });

    let addr: SocketAddr = format!("[::]:{}", cli.port).parse()?;
    tracing::info!(%addr, "serving JSON-RPC over HTTP");

    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        stop.cancelled().await;
        shutdown_handle.graceful_shutdown(Some(Duration::from_secs(5)));
    });

    axum_server::bind(addr)
        .handle(handle)
        .serve(router.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .context("serving the network transport")?;

    Ok(())
}
