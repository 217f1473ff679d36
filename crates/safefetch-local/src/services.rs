//! Process-wide services with an explicit lifecycle.

use crate::cache::ContentCache;
use crate::clock::{self, Clock};
use crate::config::Config;
use crate::extract::HtmlTextTransform;
use crate::fetcher::{ContentFetcher, HttpFetcher};
use crate::limiter::InlineLimiter;
use crate::pipeline::FetchPipeline;
use crate::tasks::TaskManager;
use crate::url_guard::UrlGuard;
use safefetch_core::{Result, Transform};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const SHUTDOWN_MESSAGE: &str = "The server is shutting down.";

/// Overrides for [`Services::start_with`]; anything left `None` gets the production default.
#[derive(Default)]
pub struct ServiceParts {
    pub clock: Option<Arc<dyn Clock>>,
    pub fetcher: Option<Arc<dyn ContentFetcher>>,
    pub transform: Option<Arc<dyn Transform>>,
}

pub struct Services {
    pub config: Config,
    pub clock: Arc<dyn Clock>,
    pub cache: Option<Arc<ContentCache>>,
    pub tasks: Arc<TaskManager>,
    pub pipeline: Arc<FetchPipeline>,
    stop: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Services {
    /// Build everything from `config` and start the task sweeper. Needs a tokio runtime.
    pub fn start(config: Config) -> Result<Self> {
        Self::start_with(config, ServiceParts::default())
    }

    pub fn start_with(config: Config, parts: ServiceParts) -> Result<Self> {
        let clock = parts.clock.unwrap_or_else(clock::system);
        let guard = UrlGuard::new(&config.security);
        let fetcher: Arc<dyn ContentFetcher> = match parts.fetcher {
            Some(f) => f,
            None => Arc::new(HttpFetcher::new(&config.fetch, guard.clone())?),
        };
        let transform = parts
            .transform
            .unwrap_or_else(|| Arc::new(HtmlTextTransform::default()));
        let cache = config.cache.enabled.then(|| {
            Arc::new(ContentCache::new(
                config.cache.max_keys,
                config.cache.ttl_s.saturating_mul(1000),
                Arc::clone(&clock),
            ))
        });
        let tasks = Arc::new(TaskManager::new(config.tasks.clone(), Arc::clone(&clock)));
        let pipeline = Arc::new(FetchPipeline::new(
            guard,
            fetcher,
            cache.clone(),
            transform,
            InlineLimiter::new(config.inline_limit),
            config.fetch.clone(),
        ));

        let stop = CancellationToken::new();
        let sweeper = tasks.spawn_sweeper(stop.clone());
        tracing::debug!(
            cache_enabled = config.cache.enabled,
            max_keys = config.cache.max_keys,
            "services started"
        );
        Ok(Self {
            config,
            clock,
            cache,
            tasks,
            pipeline,
            stop,
            sweeper: Mutex::new(Some(sweeper)),
        })
    }

    /// Stop the sweeper and cancel every in-flight task. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.stop.cancel();
        let cancelled = self.tasks.cancel_all(SHUTDOWN_MESSAGE);
        if !cancelled.is_empty() {
            tracing::info!(count = cancelled.len(), "cancelled in-flight tasks on shutdown");
        }
        let handle = self
            .sweeper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(h) = handle {
            if let Err(e) = h.await {
                tracing::warn!(error = %e, "task sweeper ended abnormally");
            }
        }
    }
}
