use bytes::Bytes;

pub type Result<T> = std::result::Result<T, Error>;

/// Terminal failure kinds of the upstream client. Classification happens
/// once, here; callers attach domain context but do not re-interpret.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found upstream: {message}")]
    NotFound { message: String },

    #[error("upstream reported a conflict: {message}")]
    Conflict { message: String },

    #[error("upstream rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("upstream unavailable: {message}")]
    Unavailable { status: Option<u16>, message: String },

    #[error("upstream call exceeded its deadline")]
    Timeout,

    #[error("credential refresh rejected by the identity provider ({status}): {message}")]
    RefreshRejected { status: u16, message: String },

    #[error("no current access credential: {0}")]
    CredentialUnavailable(String),

    #[error(transparent)]
    Kv(#[from] kv::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    /// The upstream HTTP status that produced this error, where one exists.
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            Error::NotFound { .. } => Some(404),
            Error::Conflict { .. } => Some(409),
            Error::Rejected { status, .. } | Error::RefreshRejected { status, .. } => {
                Some(*status)
            }
            Error::Unavailable { status, .. } => *status,
            _ => None,
        }
    }

    /// Classify a non-success upstream response. Retryable statuses (5xx,
    /// 429) reach this point only once the client's retry budget is spent.
    pub(crate) fn from_response(status: u16, body: &Bytes) -> Error {
        let message = upstream_message(body);
        match status {
            404 => Error::NotFound { message },
            409 => Error::Conflict { message },
            s if s == 429 || s >= 500 => Error::Unavailable {
                status: Some(s),
                message,
            },
            s => Error::Rejected { status: s, message },
        }
    }
}

/// Pull a human-readable message out of an upstream error body, which is
/// `{"error": {"message": ...}}` or `{"message": ...}` on the happy path and
/// arbitrary bytes otherwise.
pub(crate) fn upstream_message(body: &Bytes) -> String {
    #[derive(serde::Deserialize)]
    struct Inner {
        message: String,
    }
    #[derive(serde::Deserialize)]
    #[serde(untagged)]
    enum ErrorBody {
        Wrapped { error: Inner },
        Flat { message: String },
    }

    match serde_json::from_slice::<ErrorBody>(body) {
        Ok(ErrorBody::Wrapped { error }) => error.message,
        Ok(ErrorBody::Flat { message }) => message,
        Err(_) => {
            let text = String::from_utf8_lossy(body);
            let mut text = text.trim().to_string();
            text.truncate(256);
            text
        }
    }
}
