//! Local implementation of the safefetch engine.
//!
//! Layers, leaves first: [`url_guard`] (SSRF checks), [`fetcher`] (streaming retrieval with
//! [`decode`] and [`sniff`]), [`cache`], [`limiter`], [`pipeline`] (resolve-or-fetch) and
//! [`tasks`] (cancellable, owner-scoped execution). [`services`] wires them together.

pub mod cache;
pub mod cancel;
pub mod clock;
pub mod config;
pub mod cursor;
pub mod decode;
pub mod download;
pub mod extract;
pub mod fetcher;
pub mod limiter;
pub mod pipeline;
pub mod services;
pub mod sniff;
pub mod tasks;
pub mod url_guard;

pub use cache::{parse_cache_uri, CacheEntry, CacheKey, CacheValue, ContentCache, NAMESPACE_MARKDOWN};
pub use config::Config;
pub use download::{build_download, read_cached_resource, CachedResource, DownloadResponse};
pub use fetcher::{ContentFetcher, FetchOptions, FetchedBody, HttpFetcher};
pub use limiter::{InlineLimiter, LimitedContent};
pub use pipeline::{FetchOutcome, FetchPipeline, FetchRequest, RequestContext};
pub use services::{ServiceParts, Services};
pub use tasks::{CreateTaskOptions, TaskManager, TaskPage, TaskRecord, TaskStatus, TaskUpdate};
pub use url_guard::{NormalizedUrl, UrlGuard};
