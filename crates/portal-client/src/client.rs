use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use rand::Rng;
use reqwest::{header, Method, StatusCode};
use url::Url;

use crate::auth::TokenManager;
use crate::error::{Error, Result};
use crate::models::{
    DownloadLink, FileEntry, FileEnvelope, FilesEnvelope, NewTask, Task, TaskEnvelope, TaskPatch,
    TasksEnvelope, TaskStatus,
};

/// Attempts per call, the first included.
const MAX_ATTEMPTS: u32 = 3;
/// Cap on an upstream Retry-After hint.
const RETRY_AFTER_CAP: Duration = Duration::from_secs(4);

/// Authenticated client for the portal's projects and files services.
/// Retry, backoff and error classification live here and only here;
/// handlers compose these calls without re-interpreting failures.
#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
    tokens: Arc<TokenManager>,
    projects_url: Url,
    files_url: Url,
    portal_id: String,
    call_timeout: Duration,
}

/// A successful upstream reply. The body is parsed lazily so error paths
/// can report raw bytes.
pub struct Reply {
    pub status: StatusCode,
    pub body: Bytes,
}

impl Reply {
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        let parsed = serde_json::from_slice(&self.body)
            .with_context(|| format!("malformed upstream response body ({})", self.status))?;
        Ok(parsed)
    }
}

enum Payload {
    Empty,
    Json(serde_json::Value),
    Raw { content_type: String, data: Bytes },
}

impl Client {
    pub fn new(
        http: reqwest::Client,
        tokens: Arc<TokenManager>,
        projects_url: Url,
        files_url: Url,
        portal_id: String,
        call_timeout: Duration,
    ) -> Self {
        Self {
            http,
            tokens,
            projects_url: ensure_dir(projects_url),
            files_url: ensure_dir(files_url),
            portal_id,
            call_timeout,
        }
    }

    // -- projects service ---------------------------------------------------

    pub async fn list_tasks(
        &self,
        project_id: &str,
        status: Option<TaskStatus>,
    ) -> Result<Vec<Task>> {
        let mut url = self.projects_path(&format!("projects/{project_id}/tasks"))?;
        if let Some(status) = status {
            url.query_pairs_mut().append_pair("status", status.as_str());
        }
        let reply = self.request(Method::GET, url, Payload::Empty).await?;
        Ok(reply.json::<TasksEnvelope>()?.tasks)
    }

    pub async fn create_task(&self, project_id: &str, new: &NewTask) -> Result<Task> {
        let url = self.projects_path(&format!("projects/{project_id}/tasks"))?;
        let body = serde_json::to_value(new).map_err(anyhow::Error::from)?;
        let reply = self.request(Method::POST, url, Payload::Json(body)).await?;
        Ok(reply.json::<TaskEnvelope>()?.task)
    }

    pub async fn update_task(&self, task_id: &str, patch: &TaskPatch) -> Result<()> {
        let url = self.projects_path(&format!("tasks/{task_id}"))?;
        let body = serde_json::to_value(patch).map_err(anyhow::Error::from)?;
        self.request(Method::PATCH, url, Payload::Json(body)).await?;
        Ok(())
    }

    pub async fn task_detail(&self, task_id: &str) -> Result<Task> {
        let url = self.projects_path(&format!("tasks/{task_id}"))?;
        let reply = self.request(Method::GET, url, Payload::Empty).await?;
        Ok(reply.json::<TaskEnvelope>()?.task)
    }

    /// Exact-name lookup within a project, used to resolve duplicate-create
    /// conflicts to the surviving task.
    pub async fn find_task_by_name(&self, project_id: &str, name: &str) -> Result<Option<Task>> {
        let mut url = self.projects_path(&format!("projects/{project_id}/tasks"))?;
        url.query_pairs_mut().append_pair("name", name);
        let reply = self.request(Method::GET, url, Payload::Empty).await?;
        let TasksEnvelope { tasks } = reply.json()?;
        Ok(tasks.into_iter().find(|task| task.name == name))
    }

    // -- files service ------------------------------------------------------

    pub async fn download_link(&self, file_id: &str) -> Result<DownloadLink> {
        let url = self.files_path(&format!("files/{file_id}/download-link"))?;
        let reply = self.request(Method::GET, url, Payload::Empty).await?;
        reply.json()
    }

    pub async fn upload_file(
        &self,
        project_id: &str,
        folder_id: &str,
        name: &str,
        content_type: &str,
        data: Bytes,
    ) -> Result<FileEntry> {
        let mut url =
            self.files_path(&format!("projects/{project_id}/folders/{folder_id}/files"))?;
        url.query_pairs_mut().append_pair("name", name);
        let reply = self
            .request(
                Method::POST,
                url,
                Payload::Raw {
                    content_type: content_type.to_string(),
                    data,
                },
            )
            .await?;
        Ok(reply.json::<FileEnvelope>()?.file)
    }

    pub async fn search_files(
        &self,
        query: &str,
        folder_id: Option<&str>,
    ) -> Result<Vec<FileEntry>> {
        let mut url = self.files_path("files/search")?;
        url.query_pairs_mut().append_pair("query", query);
        if let Some(folder_id) = folder_id {
            url.query_pairs_mut().append_pair("folder_id", folder_id);
        }
        let reply = self.request(Method::GET, url, Payload::Empty).await?;
        Ok(reply.json::<FilesEnvelope>()?.files)
    }

    /// Reachability probe for the liveness endpoint. Any HTTP response
    /// counts; only transport failures do not.
    pub async fn reachable(&self) -> bool {
        let Ok(url) = self.projects_path("") else {
            return false;
        };
        self.http
            .head(url)
            .timeout(Duration::from_secs(2))
            .send()
            .await
            .is_ok()
    }

    // -- plumbing -----------------------------------------------------------

    fn projects_path(&self, suffix: &str) -> Result<Url> {
        join(&self.projects_url, &self.portal_id, suffix)
    }

    fn files_path(&self, suffix: &str) -> Result<Url> {
        join(&self.files_url, &self.portal_id, suffix)
    }

    /// Issue one upstream call: bearer injection, per-call timeout, retry on
    /// network errors / 5xx / 429 with jittered exponential backoff, and a
    /// single forced credential refresh on 401.
    #[tracing::instrument(level = "debug", skip(self, payload), fields(%method, %url))]
    async fn request(&self, method: Method, url: Url, payload: Payload) -> Result<Reply> {
        let mut refreshed = false;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let token = self.tokens.current().await?;

            let mut builder = self
                .http
                .request(method.clone(), url.clone())
                .bearer_auth(&token)
                .timeout(self.call_timeout);
            builder = match &payload {
                Payload::Empty => builder,
                Payload::Json(body) => builder.json(body),
                // Bytes clones are reference-counted, so re-attempting an
                // upload does not copy the payload.
                Payload::Raw { content_type, data } => builder
                    .header(header::CONTENT_TYPE, content_type)
                    .body(data.clone()),
            };

            let response = match builder.send().await {
                Ok(response) => response,
                Err(err) if attempt < MAX_ATTEMPTS => {
                    tracing::warn!(%err, attempt, "upstream call failed; backing off");
                    tokio::time::sleep(backoff(attempt)).await;
                    continue;
                }
                Err(err) if err.is_timeout() => return Err(Error::Timeout),
                Err(err) => {
                    return Err(Error::Unavailable {
                        status: None,
                        message: err.to_string(),
                    })
                }
            };

            let status = response.status();

            if status == StatusCode::UNAUTHORIZED && !refreshed {
                // The stored credential is stale from the upstream's point
                // of view. Force one refresh and retry exactly once; a
                // second 401 is reported below.
                refreshed = true;
                attempt -= 1;
                tracing::info!("upstream returned 401; forcing a credential refresh");
                self.tokens.invalidate().await?;
                continue;
            }

            if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                if attempt < MAX_ATTEMPTS {
                    let delay = if status == StatusCode::TOO_MANY_REQUESTS {
                        retry_after(&response)
                            .unwrap_or_else(|| backoff(attempt))
                            .min(RETRY_AFTER_CAP)
                    } else {
                        backoff(attempt)
                    };
                    tracing::warn!(%status, attempt, ?delay, "upstream throttled or failed; backing off");
                    tokio::time::sleep(delay).await;
                    continue;
                }
            }

            let body = match response.bytes().await {
                Ok(body) => body,
                Err(err) => {
                    return Err(Error::Unavailable {
                        status: Some(status.as_u16()),
                        message: format!("reading response body: {err}"),
                    })
                }
            };

            if status.is_success() || status.is_redirection() {
                return Ok(Reply { status, body });
            }
            return Err(Error::from_response(status.as_u16(), &body));
        }
    }
}

fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// 0.5 s / 1 s / 2 s with ±20 % jitter.
fn backoff(attempt: u32) -> Duration {
    let base = Duration::from_millis(500 * (1 << (attempt - 1)));
    base.mul_f64(rand::thread_rng().gen_range(0.8..1.2))
}

/// Base URLs must end in a slash for relative joins to append.
fn ensure_dir(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        url.set_path(&format!("{}/", url.path()));
    }
    url
}

fn join(base: &Url, portal_id: &str, suffix: &str) -> Result<Url> {
    base.join(&format!("portals/{portal_id}/{suffix}"))
        .context("building upstream URL")
        .map_err(Error::from)
}
