//! Handlers for the files service: pre-signed downloads, bounded uploads
//! and search.

use std::sync::Arc;

use bytes::Bytes;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{parse_args, ToolError};
use crate::registry::MAX_UPLOAD_BYTES;
use crate::App;

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct DownloadArgs {
    file_id: String,
}

/// Returns the upstream's pre-signed URL; bytes are never proxied. The URL
/// carries its own short expiry, surfaced to the caller.
pub(super) async fn download(
    app: &Arc<App>,
    args: &serde_json::Map<String, Value>,
) -> Result<Value, ToolError> {
    let DownloadArgs { file_id } = parse_args(args)?;
    let link = app.client.download_link(&file_id).await?;
    Ok(json!({
        "file-url": link.url,
        "expires-at": link.expires_at,
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct UploadArgs {
    project_id: String,
    folder_id: String,
    name: String,
    content_base64: String,
}

pub(super) async fn upload(
    app: &Arc<App>,
    args: &serde_json::Map<String, Value>,
) -> Result<Value, ToolError> {
    let UploadArgs {
        project_id,
        folder_id,
        name,
        content_base64,
    } = parse_args(args)?;

    let content = base64::decode(&content_base64).map_err(|_| {
        ToolError::InvalidParams("parameter content-base64 is not valid base64".to_string())
    })?;
    // The encoded-length check bounds the decoded size only to within the
    // final quantum; re-check exactly.
    if content.len() as u64 > MAX_UPLOAD_BYTES {
        return Err(ToolError::InvalidParams(format!(
            "parameter content-base64 exceeds the {MAX_UPLOAD_BYTES} byte size ceiling"
        )));
    }

    let content_type = media_type(&name);
    let file = app
        .client
        .upload_file(
            &project_id,
            &folder_id,
            &name,
            content_type,
            Bytes::from(content),
        )
        .await?;

    Ok(json!({ "file-id": file.id }))
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct SearchArgs {
    query: String,
    folder_id: Option<String>,
}

pub(super) async fn search(
    app: &Arc<App>,
    args: &serde_json::Map<String, Value>,
) -> Result<Value, ToolError> {
    let SearchArgs { query, folder_id } = parse_args(args)?;
    let files = app
        .client
        .search_files(&query, folder_id.as_deref())
        .await?;
    Ok(json!({ "files": files }))
}

/// Media type by filename suffix; unknown suffixes ship as opaque bytes.
fn media_type(name: &str) -> &'static str {
    let suffix = name.rsplit('.').next().unwrap_or_default();
    match suffix.to_ascii_lowercase().as_str() {
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "md" => "text/markdown",
        "txt" => "text/plain",
        "pdf" => "application/pdf",
        "csv" => "text/csv",
        _ => "application/octet-stream",
    }
}
