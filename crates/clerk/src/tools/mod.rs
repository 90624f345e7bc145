//! Tool handlers: thin compositions over the portal client. Validation has
//! already run by the time a handler executes; handlers attach domain
//! context but never re-interpret upstream failures.

use std::sync::Arc;

use serde_json::Value;

use crate::registry::ToolSpec;
use crate::App;

mod files;
mod tasks;

#[derive(Debug)]
pub enum ToolError {
    /// Argument problems detected past schema validation (e.g. base64 that
    /// passed the cheap checks but fails to decode). The message names the
    /// parameter.
    InvalidParams(String),
    Upstream(portal_client::Error),
}

impl From<portal_client::Error> for ToolError {
    fn from(err: portal_client::Error) -> Self {
        ToolError::Upstream(err)
    }
}

impl From<kv::Error> for ToolError {
    fn from(err: kv::Error) -> Self {
        ToolError::Upstream(portal_client::Error::Kv(err))
    }
}

/// Invoke a tool behind the response cache. Mutating tools and tools with a
/// zero TTL go straight to their handler.
pub async fn invoke_cached(
    app: &Arc<App>,
    spec: &'static ToolSpec,
    args: serde_json::Map<String, Value>,
) -> Result<Value, ToolError> {
    with_cache(app, spec, &args, invoke(app, spec, &args)).await
}

pub(crate) async fn with_cache(
    app: &App,
    spec: &ToolSpec,
    args: &serde_json::Map<String, Value>,
    fetch: impl std::future::Future<Output = Result<Value, ToolError>>,
) -> Result<Value, ToolError> {
    let ttl = spec.cache_ttl.unwrap_or(app.default_cache_ttl);
    if spec.mutating || ttl.is_zero() {
        return fetch.await;
    }

    let fingerprint = portal_client::fingerprint(spec.name, &Value::Object(args.clone()));
    if let Some(hit) = app.cache.get(&fingerprint).await {
        match serde_json::from_str(&hit.body) {
            Ok(value) => return Ok(value),
            Err(err) => tracing::warn!(%err, tool = spec.name, "discarding malformed cache entry"),
        }
    }

    let value = fetch.await?;
    app.cache
        .put(
            &fingerprint,
            &portal_client::CachedResponse {
                body: value.to_string(),
                content_type: "application/json".to_string(),
            },
            ttl,
        )
        .await;
    Ok(value)
}

async fn invoke(
    app: &Arc<App>,
    spec: &'static ToolSpec,
    args: &serde_json::Map<String, Value>,
) -> Result<Value, ToolError> {
    match spec.name {
        "listTasks" => tasks::list(app, args).await,
        "createTask" => tasks::create(app, args).await,
        "updateTask" => tasks::update(app, args).await,
        "getTaskDetail" => tasks::detail(app, args).await,
        "getProjectSummary" => tasks::summary(app, args).await,
        "downloadFile" => files::download(app, args).await,
        "uploadReviewSheet" => files::upload(app, args).await,
        "searchFiles" => files::search(app, args).await,
        other => Err(ToolError::Upstream(portal_client::Error::Internal(
            anyhow::anyhow!("tool {other} is registered without a handler"),
        ))),
    }
}

/// Bind validated named arguments onto a typed parameter struct.
fn parse_args<T: serde::de::DeserializeOwned>(
    args: &serde_json::Map<String, Value>,
) -> Result<T, ToolError> {
    serde_json::from_value(Value::Object(args.clone()))
        .map_err(|err| ToolError::InvalidParams(err.to_string()))
}
