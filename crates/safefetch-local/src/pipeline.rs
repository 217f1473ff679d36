//! Resolve-or-fetch: validate, consult the cache, fetch, transform, store, bound.

use crate::cache::{CacheKey, CacheValue, ContentCache, NAMESPACE_MARKDOWN};
use crate::cancel::{first_of, Scope};
use crate::config::FetchConfig;
use crate::fetcher::{ContentFetcher, FetchOptions};
use crate::limiter::InlineLimiter;
use crate::tasks::{CreateTaskOptions, TaskManager, TaskRecord, TaskStatus, TaskUpdate};
use crate::url_guard::UrlGuard;
use safefetch_core::{AbortReason, Error, ResourceRef, Result, Transform, TransformInput};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Explicit per-request context; nothing here is read from task-locals or globals.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub owner_key: String,
    pub cancel: CancellationToken,
}

impl RequestContext {
    pub fn new(owner_key: impl Into<String>) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            owner_key: owner_key.into(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchRequest {
    pub url: String,
    /// Anything that makes two fetches of one URL distinct (e.g. a conversion mode).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vary: Option<String>,
    /// Per-call inline limit in characters; 0/absent defers to the global limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_inline_chars: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl FetchRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

/// What the cache stores per key (as JSON).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedDocument {
    pub url: String,
    pub final_url: String,
    pub title: Option<String>,
    pub markdown: String,
    /// The network body hit the byte ceiling.
    pub truncated_source: bool,
}

impl CachedDocument {
    pub fn decode(payload: &str) -> Option<Self> {
        match serde_json::from_str(payload) {
            Ok(d) => Some(d),
            Err(e) => {
                tracing::warn!(error = %e, "cached payload could not be decoded");
                None
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchOutcome {
    pub url: String,
    pub final_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub content: String,
    /// Inline content was cut by the limiter.
    pub truncated: bool,
    /// The network body was cut at the byte ceiling.
    pub source_truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_ref: Option<ResourceRef>,
    pub from_cache: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<String>,
}

pub struct FetchPipeline {
    guard: UrlGuard,
    fetcher: Arc<dyn ContentFetcher>,
    cache: Option<Arc<ContentCache>>,
    transform: Arc<dyn Transform>,
    limiter: InlineLimiter,
    fetch_cfg: FetchConfig,
}

impl FetchPipeline {
    pub fn new(
        guard: UrlGuard,
        fetcher: Arc<dyn ContentFetcher>,
        cache: Option<Arc<ContentCache>>,
        transform: Arc<dyn Transform>,
        limiter: InlineLimiter,
        fetch_cfg: FetchConfig,
    ) -> Self {
        Self {
            guard,
            fetcher,
            cache,
            transform,
            limiter,
            fetch_cfg,
        }
    }

    pub fn cache(&self) -> Option<&Arc<ContentCache>> {
        self.cache.as_ref()
    }

    pub async fn resolve(&self, ctx: &RequestContext, req: &FetchRequest) -> Result<FetchOutcome> {
        let span = tracing::info_span!(
            "fetch",
            request_id = %ctx.request_id,
            owner = %ctx.owner_key,
        );
        self.resolve_inner(ctx, req).instrument(span).await
    }

    async fn resolve_inner(&self, ctx: &RequestContext, req: &FetchRequest) -> Result<FetchOutcome> {
        let url = self.guard.normalize(&req.url)?;
        let key = CacheKey::derive(NAMESPACE_MARKDOWN, &url, req.vary.as_deref());

        if let Some(cache) = &self.cache {
            match cache.get(&key) {
                Some(entry) => {
                    if let Some(doc) = CachedDocument::decode(&entry.content) {
                        tracing::debug!(url = %url, cache_key = %key, "cache hit");
                        return Ok(self.outcome(doc, &key, true, req));
                    }
                }
                None => tracing::debug!(url = %url, cache_key = %key, "cache miss"),
            }
        }

        let timeout = Duration::from_millis(
            req.timeout_ms
                .filter(|t| *t > 0)
                .unwrap_or(self.fetch_cfg.timeout_ms)
                .min(self.fetch_cfg.timeout_ms.max(1)),
        );
        let scope = Scope::new(ctx.cancel.clone()).with_timeout(timeout);
        let body = self
            .fetcher
            .fetch(
                &url,
                &FetchOptions {
                    max_bytes: self.fetch_cfg.max_content_length,
                    timeout,
                    cancel: ctx.cancel.clone(),
                },
            )
            .await?;

        let input = TransformInput {
            url: body.final_url.href().to_string(),
            content_type: body.content_type.clone(),
            text: body.text(),
        };
        let transform = Arc::clone(&self.transform);
        let out = scope
            .guard(async move {
                tokio::task::spawn_blocking(move || transform.transform(&input))
                    .await
                    .map_err(|e| Error::Transform(format!("transform task failed: {e}")))?
            })
            .await?;

        let doc = CachedDocument {
            url: url.href().to_string(),
            final_url: body.final_url.href().to_string(),
            title: out.title,
            markdown: out.markdown,
            truncated_source: body.truncated,
        };
        if let Some(cache) = &self.cache {
            match serde_json::to_string(&doc) {
                Ok(payload) => {
                    cache.set(
                        &key,
                        CacheValue {
                            url: doc.url.clone(),
                            title: doc.title.clone(),
                            content: payload,
                        },
                    );
                }
                Err(e) => tracing::warn!(error = %e, cache_key = %key, "cache write skipped"),
            }
        }
        Ok(self.outcome(doc, &key, false, req))
    }

    fn outcome(
        &self,
        doc: CachedDocument,
        key: &CacheKey,
        from_cache: bool,
        req: &FetchRequest,
    ) -> FetchOutcome {
        let cached = self.cache.is_some();
        let limited = self.limiter.apply(
            &doc.markdown,
            cached.then_some(key),
            req.max_inline_chars,
        );
        FetchOutcome {
            url: doc.url,
            final_url: doc.final_url,
            title: doc.title,
            content: limited.content,
            truncated: limited.truncated,
            source_truncated: doc.truncated_source,
            resource_ref: limited.resource_ref,
            from_cache,
            cache_key: cached.then(|| key.to_string()),
        }
    }

    /// Run `resolve` as a task owned by `ctx.owner_key`.
    ///
    /// The work stops when either the caller's token or the task's own token fires. The
    /// outcome (or structured failure) is written back through the task manager, whose
    /// terminal-state stickiness keeps a prior `cancelled` from being overwritten.
    pub fn spawn_task(
        self: &Arc<Self>,
        tasks: &Arc<TaskManager>,
        ctx: RequestContext,
        req: FetchRequest,
        opts: CreateTaskOptions,
    ) -> TaskRecord {
        let message = format!("Fetching {}", req.url);
        let record = tasks.create_task(opts, Some(message), &ctx.owner_key);
        let mut parents = vec![ctx.cancel.clone()];
        parents.extend(tasks.cancel_token(&record.task_id));
        let combined = first_of(&parents);

        let pipeline = Arc::clone(self);
        let tasks = Arc::clone(tasks);
        let task_id = record.task_id.clone();
        tokio::spawn(async move {
            let run_ctx = RequestContext {
                cancel: combined.clone(),
                ..ctx
            };
            let result = pipeline.resolve(&run_ctx, &req).await;
            combined.cancel();
            let update = match result {
                Ok(outcome) => match serde_json::to_value(&outcome) {
                    Ok(v) => TaskUpdate {
                        status: Some(TaskStatus::Completed),
                        result: Some(v),
                        ..TaskUpdate::default()
                    },
                    Err(e) => failed(&Error::Cache(e.to_string()), &req.url),
                },
                Err(Error::Aborted(AbortReason::Cancelled)) => {
                    TaskUpdate::status(TaskStatus::Cancelled).message("The fetch was cancelled.")
                }
                Err(e) => failed(&e, &req.url),
            };
            if let Err(e) = tasks.update_task(&task_id, update) {
                tracing::debug!(task_id = %task_id, error = %e, "task gone before result was stored");
            }
        });
        record
    }
}

fn failed(e: &Error, url: &str) -> TaskUpdate {
    let payload = e.to_payload(url);
    TaskUpdate {
        status: Some(TaskStatus::Failed),
        status_message: Some(payload.error.clone()),
        error: serde_json::to_value(&payload).ok(),
        ..TaskUpdate::default()
    }
}
