use serde::{Deserialize, Serialize};
use std::fmt;

/// Why an operation stopped before completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    /// The caller (or an owning task) cancelled.
    Cancelled,
    /// A deadline elapsed first.
    TimedOut,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => f.write_str("cancelled"),
            Self::TimedOut => f.write_str("timed out"),
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Bad or blocked URL, malformed identifier. Always a caller mistake.
    #[error("invalid url: {0}")]
    Validation(String),
    #[error("fetch failed: {message}")]
    Fetch {
        message: String,
        status: Option<u16>,
        retry_after_s: Option<u64>,
    },
    #[error("aborted: {0}")]
    Aborted(AbortReason),
    #[error("unsupported content: {0}")]
    UnsupportedContent(String),
    #[error("task not found: {0}")]
    TaskNotFound(String),
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error("task already terminal: {0}")]
    AlreadyTerminal(String),
    #[error("not found in cache: {0}")]
    NotInCache(String),
    #[error("cache disabled")]
    CacheDisabled,
    #[error("cache error: {0}")]
    Cache(String),
    #[error("transform failed: {0}")]
    Transform(String),
    #[error("not configured: {0}")]
    NotConfigured(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Fixed status marker carried by every aborted failure.
pub const ABORTED_STATUS: &str = "aborted";

impl Error {
    pub fn fetch(message: impl Into<String>) -> Self {
        Self::Fetch {
            message: message.into(),
            status: None,
            retry_after_s: None,
        }
    }

    pub fn http_status(status: u16, retry_after_s: Option<u64>) -> Self {
        Self::Fetch {
            message: format!("HTTP {status}"),
            status: Some(status),
            retry_after_s,
        }
    }

    /// Stable, machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::Fetch { .. } => "fetch_error",
            Self::Aborted(_) => ABORTED_STATUS,
            Self::UnsupportedContent(_) => "unsupported_content",
            Self::TaskNotFound(_) => "task_not_found",
            Self::InvalidParams(_) => "invalid_params",
            Self::AlreadyTerminal(_) => "already_terminal",
            Self::NotInCache(_) => "not_in_cache",
            Self::CacheDisabled => "cache_disabled",
            Self::Cache(_) => "cache_error",
            Self::Transform(_) => "transform_error",
            Self::NotConfigured(_) => "not_configured",
        }
    }

    /// Whether retrying the same input could plausibly succeed.
    pub fn retryable(&self) -> bool {
        match self {
            Self::Fetch { status: None, .. } => true,
            Self::Fetch {
                status: Some(s), ..
            } => matches!(*s, 408 | 429) || (500..600).contains(s),
            Self::Aborted(AbortReason::TimedOut) => true,
            Self::Cache(_) => true,
            Self::Aborted(AbortReason::Cancelled)
            | Self::Validation(_)
            | Self::UnsupportedContent(_)
            | Self::TaskNotFound(_)
            | Self::InvalidParams(_)
            | Self::AlreadyTerminal(_)
            | Self::NotInCache(_)
            | Self::CacheDisabled
            | Self::Transform(_)
            | Self::NotConfigured(_) => false,
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted(_))
    }

    /// HTTP status of the remote response, when the failure came from one.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Fetch { status, .. } => *status,
            _ => None,
        }
    }

    /// User-visible failure shape: `{error, url, statusCode?, details?}`.
    pub fn to_payload(&self, url: &str) -> FailurePayload {
        let mut details = serde_json::Map::new();
        details.insert("code".to_string(), serde_json::json!(self.code()));
        details.insert("retryable".to_string(), serde_json::json!(self.retryable()));
        match self {
            Self::Fetch {
                retry_after_s: Some(s),
                ..
            } => {
                details.insert("retry_after_s".to_string(), serde_json::json!(s));
            }
            Self::Aborted(reason) => {
                details.insert("reason".to_string(), serde_json::json!(reason));
            }
            _ => {}
        }
        FailurePayload {
            error: self.to_string(),
            url: url.to_string(),
            status_code: self.status_code(),
            details: Some(serde_json::Value::Object(details)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FailurePayload {
    pub error: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Input handed to the HTML/text conversion collaborator.
#[derive(Debug, Clone)]
pub struct TransformInput {
    pub url: String,
    pub content_type: Option<String>,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransformOutput {
    pub title: Option<String>,
    pub markdown: String,
}

/// Converts decoded response text into the inline text payload.
///
/// Implementations are synchronous and CPU-bound; callers run them off the async executor.
pub trait Transform: Send + Sync {
    fn name(&self) -> &'static str;
    fn transform(&self, input: &TransformInput) -> Result<TransformOutput>;
}

/// Fired synchronously after every successful cache write.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CacheUpdate {
    pub cache_key: String,
    pub namespace: String,
    pub hash_fragment: String,
}

/// Opaque pointer at the full cached artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceRef {
    pub uri: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FetchSource {
    Cache,
    Network,
}
