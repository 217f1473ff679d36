//! SSRF-safe URL fetching with a bounded cache and cancellable tasks.
//!
//! Types and the error taxonomy come from `safefetch-core` and are always available. The engine
//! (URL guard, fetcher, cache, limiter, task manager) sits behind the default `local` feature.
//!
//! ```no_run
//! # async fn run() -> safefetch::Result<()> {
//! use safefetch::local::{Config, FetchRequest, RequestContext, Services};
//!
//! let services = Services::start(Config::from_env())?;
//! let ctx = RequestContext::new("docs");
//! let out = services
//!     .pipeline
//!     .resolve(&ctx, &FetchRequest::new("https://example.com/"))
//!     .await?;
//! println!("{} (from cache: {})", out.content, out.from_cache);
//! services.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub use safefetch_core::*;

#[cfg(feature = "local")]
pub use safefetch_local as local;
