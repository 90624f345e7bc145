//! Handlers for the projects service: task listing, creation (idempotent),
//! update, detail, and the derived project summary.

use std::sync::Arc;
use std::time::Duration;

use portal_client::models::{NewTask, Task, TaskPatch, TaskStatus};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use super::{parse_args, with_cache, ToolError};
use crate::App;

/// Marker value while a create is in flight and its id is not yet known.
const PENDING: &str = "pending";

/// How long a caller will wait on a concurrent identical create before
/// reporting a conflict.
const PENDING_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct WireTask {
    id: String,
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    owner: Option<String>,
    status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    due_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<String>,
}

impl From<Task> for WireTask {
    fn from(task: Task) -> Self {
        WireTask {
            id: task.id,
            name: task.name,
            owner: task.owner,
            status: task.status,
            due_date: task.due_date,
            url: task.url,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
struct WireComment {
    author: String,
    body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    created_at: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
struct WireHistoryEntry {
    at: String,
    actor: String,
    change: String,
}

// -- listTasks ---------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ListArgs {
    project_id: String,
    status: Option<TaskStatus>,
}

pub(super) async fn list(
    app: &Arc<App>,
    args: &serde_json::Map<String, Value>,
) -> Result<Value, ToolError> {
    let ListArgs { project_id, status } = parse_args(args)?;
    let tasks = app.client.list_tasks(&project_id, status).await?;
    let tasks: Vec<WireTask> = tasks.into_iter().map(WireTask::from).collect();
    Ok(json!({ "tasks": tasks }))
}

// -- createTask --------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct CreateArgs {
    project_id: String,
    name: String,
    owner: Option<String>,
    due_date: Option<String>,
}

/// Key of the idempotency marker for one logical create. Name matching is
/// case- and whitespace-insensitive.
fn idempotency_key(project_id: &str, name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(project_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(name.trim().to_lowercase().as_bytes());
    format!("idempotency:createTask:{}", hex::encode(hasher.finalize()))
}

/// Idempotent create. The KV marker is the sole synchronization primitive:
/// concurrent identical requests serialize through it, and retries within
/// the window read the recorded id instead of issuing a second POST. The
/// guarantee is "no duplicate from a single assistant turn", not global
/// deduplication.
#[tracing::instrument(level = "debug", skip_all)]
pub(super) async fn create(
    app: &Arc<App>,
    args: &serde_json::Map<String, Value>,
) -> Result<Value, ToolError> {
    let CreateArgs {
        project_id,
        name,
        owner,
        due_date,
    } = parse_args(args)?;

    let key = idempotency_key(&project_id, &name);
    let deadline = tokio::time::Instant::now() + PENDING_WAIT;
    let mut backoff = Duration::from_millis(50);

    loop {
        if app
            .kv
            .set_nx(&key, PENDING, app.idempotency_window)
            .await?
        {
            return create_upstream(app, &key, &project_id, &name, owner, due_date).await;
        }

        match app.kv.get(&key).await? {
            Some(id) if id != PENDING => {
                tracing::debug!(task_id = %id, "returning task recorded by an identical create");
                return Ok(json!({ "task-id": id }));
            }
            // Still pending (or the marker lapsed between set_nx and get);
            // wait for the in-flight create to record its outcome.
            _ => {}
        }

        if tokio::time::Instant::now() + backoff >= deadline {
            return Err(ToolError::Upstream(portal_client::Error::Conflict {
                message: "an identical create is still in flight".to_string(),
            }));
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(Duration::from_millis(500));
    }
}

async fn create_upstream(
    app: &Arc<App>,
    key: &str,
    project_id: &str,
    name: &str,
    owner: Option<String>,
    due_date: Option<String>,
) -> Result<Value, ToolError> {
    let new = NewTask {
        name: name.trim().to_string(),
        owner,
        due_date,
    };

    let task_id = match app.client.create_task(project_id, &new).await {
        Ok(task) => task.id,
        Err(portal_client::Error::Conflict { message }) => {
            // The task already exists upstream (e.g. created outside the
            // idempotency window). Resolve to the surviving task.
            match app.client.find_task_by_name(project_id, new.name.as_str()).await? {
                Some(task) => task.id,
                None => {
                    return Err(ToolError::Upstream(portal_client::Error::Conflict {
                        message,
                    }))
                }
            }
        }
        Err(err) => {
            // Clear the marker so a retry is not locked out for the window.
            if let Err(kv_err) = app.kv.delete(key).await {
                tracing::warn!(%kv_err, "failed to clear idempotency marker");
            }
            return Err(err.into());
        }
    };

    if let Err(err) = app.kv.set(key, &task_id, app.idempotency_window).await {
        tracing::warn!(%err, "failed to record idempotency marker");
    }
    Ok(json!({ "task-id": task_id }))
}

// -- updateTask --------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct UpdateArgs {
    task_id: String,
    status: Option<TaskStatus>,
    due_date: Option<String>,
    owner: Option<String>,
}

pub(super) async fn update(
    app: &Arc<App>,
    args: &serde_json::Map<String, Value>,
) -> Result<Value, ToolError> {
    let UpdateArgs {
        task_id,
        status,
        due_date,
        owner,
    } = parse_args(args)?;

    let patch = TaskPatch {
        status,
        due_date,
        owner,
    };
    app.client.update_task(&task_id, &patch).await?;
    Ok(json!({ "ok": true }))
}

// -- getTaskDetail -----------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct DetailArgs {
    task_id: String,
}

pub(super) async fn detail(
    app: &Arc<App>,
    args: &serde_json::Map<String, Value>,
) -> Result<Value, ToolError> {
    let DetailArgs { task_id } = parse_args(args)?;
    let task = app.client.task_detail(&task_id).await?;

    let comments: Vec<WireComment> = task
        .comments
        .into_iter()
        .map(|c| WireComment {
            author: c.author,
            body: c.body,
            created_at: c.created_at,
        })
        .collect();
    let history: Vec<WireHistoryEntry> = task
        .history
        .into_iter()
        .map(|h| WireHistoryEntry {
            at: h.at,
            actor: h.actor,
            change: h.change,
        })
        .collect();

    Ok(json!({
        "id": task.id,
        "name": task.name,
        "description": task.description,
        "status": task.status,
        "owner": task.owner,
        "due-date": task.due_date,
        "comments": comments,
        "history": history,
    }))
}

// -- getProjectSummary -------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct SummaryArgs {
    project_id: String,
    // Reporting period; aggregation is currently portfolio-wide, so this
    // only participates in validation.
    #[allow(dead_code)]
    period: Option<String>,
}

/// Derived read: three constituent status reads issued in parallel, each
/// through the listTasks cache, then aggregated. The summary itself is not
/// independently cached.
pub(super) async fn summary(
    app: &Arc<App>,
    args: &serde_json::Map<String, Value>,
) -> Result<Value, ToolError> {
    let SummaryArgs { project_id, .. } = parse_args(args)?;

    let (open, closed, overdue) = futures::try_join!(
        count_by_status(app, &project_id, TaskStatus::Open),
        count_by_status(app, &project_id, TaskStatus::Closed),
        count_by_status(app, &project_id, TaskStatus::Overdue),
    )?;

    let total = open + closed + overdue;
    let completion_rate = if total == 0 {
        0.0
    } else {
        closed as f64 / total as f64
    };

    Ok(json!({
        "project-id": project_id,
        "total-tasks": total,
        "completion-rate": completion_rate,
        "overdue-count": overdue,
    }))
}

/// One constituent read, sharing the listTasks cache entries: an identical
/// direct listTasks call within the TTL costs no extra upstream request.
async fn count_by_status(
    app: &Arc<App>,
    project_id: &str,
    status: TaskStatus,
) -> Result<usize, ToolError> {
    let mut args = serde_json::Map::new();
    args.insert("project-id".to_string(), json!(project_id));
    args.insert("status".to_string(), json!(status.as_str()));

    let spec = crate::registry::find("listTasks").expect("listTasks is registered");
    let value = with_cache(app, spec, &args, list(app, &args)).await?;

    Ok(value["tasks"].as_array().map_or(0, Vec::len))
}
