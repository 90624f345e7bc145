//! Stream transport: newline-delimited JSON-RPC over stdin/stdout, intended
//! for co-located supervised execution, so no admission gate applies. Each
//! inbound line is handled on its own task; concurrent in-flight requests
//! are correlated by `id`, and stdout writes are serialized through a
//! channel. Logging stays on stderr.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::TryStreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;

use crate::{rpc, App};

// Must accommodate a base64-encoded upload at the 1 GiB decoded ceiling.
const MAX_LINE_BYTES: usize = 2 << 30;

pub async fn serve(
    app: Arc<App>,
    request_timeout: Duration,
    stop: CancellationToken,
) -> anyhow::Result<()> {
    let mut lines = FramedRead::new(
        tokio::io::stdin(),
        LinesCodec::new_with_max_length(MAX_LINE_BYTES),
    );

    let (tx, mut rx) = tokio::sync::mpsc::channel::<String>(32);
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = rx.recv().await {
            stdout.write_all(line.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
        Ok::<(), std::io::Error>(())
    });

    tracing::info!("serving JSON-RPC on stdio");

    loop {
        tokio::select! {
            line = lines.try_next() => {
                let Some(line) = line.context("reading stdin")? else {
                    tracing::info!("stdin closed; shutting down");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                let app = app.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    if let Some(response) = handle_line(&app, &line, request_timeout).await {
                        // Send fails only when the writer is gone at shutdown.
                        let _ = tx.send(response.to_string()).await;
                    }
                });
            }
            _ = stop.cancelled() => {
                tracing::info!("signalled to stop");
                break;
            }
        }
    }

    drop(tx);
    writer.await.context("joining stdout writer")??;
    Ok(())
}

async fn handle_line(
    app: &Arc<App>,
    line: &str,
    request_timeout: Duration,
) -> Option<serde_json::Value> {
    let envelope = match rpc::parse(line) {
        Ok(envelope) => envelope,
        Err(response) => return Some(response),
    };
    let id = envelope.id.clone();

    match tokio::time::timeout(request_timeout, rpc::handle(app, envelope)).await {
        Ok(response) => response,
        // Notifications time out silently, like their other failures.
        Err(_) => id.map(|id| rpc::error_response(id, rpc::RpcError::timeout(None))),
    }
}
