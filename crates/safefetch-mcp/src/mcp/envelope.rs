use safefetch_core::Error;
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ErrorCode {
    InvalidParams,
    InvalidUrl,
    UnsupportedContent,
    FetchFailed,
    Aborted,
    TaskNotFound,
    AlreadyTerminal,
    NotInCache,
    CacheDisabled,
    CacheError,
    NotConfigured,
    UnexpectedError,
}

impl ErrorCode {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::InvalidParams => "invalid_params",
            Self::InvalidUrl => "invalid_url",
            Self::UnsupportedContent => "unsupported_content",
            Self::FetchFailed => "fetch_failed",
            Self::Aborted => "aborted",
            Self::TaskNotFound => "task_not_found",
            Self::AlreadyTerminal => "already_terminal",
            Self::NotInCache => "not_in_cache",
            Self::CacheDisabled => "cache_disabled",
            Self::CacheError => "cache_error",
            Self::NotConfigured => "not_configured",
            Self::UnexpectedError => "unexpected_error",
        }
    }

    pub(crate) fn hint(self) -> &'static str {
        match self {
            Self::InvalidParams => "Check the argument names and values, then retry.",
            Self::InvalidUrl => {
                "Only public http(s) URLs without credentials are fetched. Private, loopback, link-local and metadata hosts are blocked, including as redirect targets."
            }
            Self::UnsupportedContent => {
                "The response looked binary or used an unsupported content-encoding. Only text-like content is converted."
            }
            Self::FetchFailed => {
                "The remote server or network failed. Check error.details.retryable and retry_after_s before retrying."
            }
            Self::Aborted => {
                "The operation was cancelled or hit its deadline. Increase timeout_ms or retry if the cancellation was not intended."
            }
            Self::TaskNotFound => {
                "The task id is unknown, expired, or belongs to another session. Call task_list to see live tasks."
            }
            Self::AlreadyTerminal => "The task already finished; fetch it with task_result.",
            Self::NotInCache => {
                "The cached artifact expired or was evicted. Call web_fetch again to repopulate it."
            }
            Self::CacheDisabled => "The cache is disabled (SAFEFETCH_CACHE_ENABLED=false).",
            Self::CacheError => "A cache operation failed; the fetch can be retried.",
            Self::NotConfigured => "This surface is not configured in the server environment.",
            Self::UnexpectedError => "Unexpected failure; retry, and report it if it persists.",
        }
    }

    pub(crate) fn retryable(self) -> bool {
        match self {
            Self::FetchFailed | Self::CacheError => true,
            // Input and configuration problems need a change before a retry can help.
            Self::InvalidParams
            | Self::InvalidUrl
            | Self::UnsupportedContent
            | Self::Aborted
            | Self::TaskNotFound
            | Self::AlreadyTerminal
            | Self::NotInCache
            | Self::CacheDisabled
            | Self::NotConfigured
            | Self::UnexpectedError => false,
        }
    }

    pub(crate) fn from_error(e: &Error) -> Self {
        match e {
            Error::Validation(_) => Self::InvalidUrl,
            Error::Fetch { .. } => Self::FetchFailed,
            Error::Aborted(_) => Self::Aborted,
            Error::UnsupportedContent(_) => Self::UnsupportedContent,
            Error::TaskNotFound(_) => Self::TaskNotFound,
            Error::InvalidParams(_) => Self::InvalidParams,
            Error::AlreadyTerminal(_) => Self::AlreadyTerminal,
            Error::NotInCache(_) => Self::NotInCache,
            Error::CacheDisabled => Self::CacheDisabled,
            Error::Cache(_) => Self::CacheError,
            Error::NotConfigured(_) => Self::NotConfigured,
            Error::Transform(_) => Self::UnexpectedError,
        }
    }
}

pub(crate) fn add_envelope_fields(payload: &mut serde_json::Value, kind: &str, elapsed_ms: u128) {
    payload["schema_version"] = serde_json::json!(super::SCHEMA_VERSION);
    payload["kind"] = serde_json::json!(kind);
    payload["elapsed_ms"] = serde_json::json!(elapsed_ms);
    if payload.get("request").is_none() {
        payload["request"] = serde_json::Value::Null;
    }
}

pub(crate) fn error_obj(
    code: ErrorCode,
    message: impl ToString,
    hint: impl ToString,
) -> serde_json::Value {
    #[derive(Serialize)]
    struct ErrorObject {
        code: &'static str,
        message: String,
        hint: String,
        retryable: bool,
    }

    let e = ErrorObject {
        code: code.as_str(),
        message: message.to_string(),
        hint: hint.to_string(),
        retryable: code.retryable(),
    };
    match serde_json::to_value(e) {
        Ok(v) => v,
        Err(_) => serde_json::json!({
            "code": code.as_str(),
            "message": message.to_string(),
            "hint": hint.to_string(),
            "retryable": code.retryable()
        }),
    }
}

/// `error_obj` for a library error. Retryability comes from the error itself (a 503 is, a 404
/// is not), and the structured `{error, url, statusCode?, details?}` failure rides along.
pub(crate) fn error_from(e: &Error, url: &str) -> serde_json::Value {
    let code = ErrorCode::from_error(e);
    let mut v = error_obj(code, e, code.hint());
    v["retryable"] = serde_json::json!(e.retryable());
    v["failure"] = serde_json::to_value(e.to_payload(url)).unwrap_or(serde_json::Value::Null);
    v
}

/// Tool/CLI output: the serialized value with `ok: true`, or `ok: false` plus `error_from`.
/// `subject` names what the call was about (a URL, task id or resource URI).
pub(crate) fn payload_from<T: Serialize>(
    kind: &str,
    elapsed_ms: u128,
    subject: &str,
    result: safefetch_core::Result<T>,
) -> serde_json::Value {
    let mut payload = match result.map(|v| serde_json::to_value(v)) {
        Ok(Ok(v)) => {
            let mut v = if v.is_object() {
                v
            } else {
                serde_json::json!({ "value": v })
            };
            v["ok"] = serde_json::json!(true);
            v
        }
        Ok(Err(e)) => serde_json::json!({
            "ok": false,
            "error": error_obj(ErrorCode::UnexpectedError, e, ErrorCode::UnexpectedError.hint()),
        }),
        Err(e) => serde_json::json!({
            "ok": false,
            "error": error_from(&e, subject),
        }),
    };
    add_envelope_fields(&mut payload, kind, elapsed_ms);
    payload
}
