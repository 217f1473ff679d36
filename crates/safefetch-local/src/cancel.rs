//! Composable cancellation.
//!
//! Every suspension point in the fetch path (connect, each body read, the transform stage,
//! task waits) runs under a [`Scope`]: a cancellation token plus an optional deadline.
//! Whichever fires first wins, and the two are reported as distinct [`AbortReason`]s.

use futures_util::future::select_all;
use safefetch_core::{AbortReason, Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Derive a token that is cancelled as soon as any parent is.
///
/// With two or more parents a watcher task is spawned, so this must be called inside a
/// tokio runtime. The watcher exits when a parent fires or when the returned token itself
/// is cancelled; cancel it (or hold a `drop_guard()`) once the scoped work is finished.
pub fn first_of(parents: &[CancellationToken]) -> CancellationToken {
    if parents.iter().any(|p| p.is_cancelled()) {
        let out = CancellationToken::new();
        out.cancel();
        return out;
    }
    match parents {
        [] => CancellationToken::new(),
        [only] => only.child_token(),
        _ => {
            let out = CancellationToken::new();
            let watcher = out.clone();
            let parents = parents.to_vec();
            tokio::spawn(async move {
                let any = select_all(parents.iter().map(|p| Box::pin(p.cancelled())));
                tokio::select! {
                    _ = any => watcher.cancel(),
                    _ = watcher.cancelled() => {}
                }
            });
            out
        }
    }
}

#[derive(Debug, Clone)]
pub struct Scope {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Scope {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Tighten the deadline; an earlier existing deadline is kept.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        let d = Instant::now() + timeout;
        self.deadline = Some(match self.deadline {
            Some(cur) => cur.min(d),
            None => d,
        });
        self
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Fail immediately if the scope is already done.
    pub fn check(&self) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(Error::Aborted(AbortReason::Cancelled));
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(Error::Aborted(AbortReason::TimedOut));
        }
        Ok(())
    }

    /// Run `fut`, aborting on cancellation or deadline.
    pub async fn guard<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(Error::Aborted(AbortReason::Cancelled)),
            _ = sleep_until_opt(self.deadline) => Err(Error::Aborted(AbortReason::TimedOut)),
            r = fut => r,
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending::<()>().await,
    }
}
