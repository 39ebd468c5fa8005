//! Generation tokens and guarded polling
//!
//! Long-running polls capture a token when they start. Issuing a newer token
//! for the same (scope, name) supersedes every older poll: they stop at their
//! next check without producing a result.

use dashmap::DashMap;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::{sleep, Duration};
use tracing::debug;

/// Monotonic token tied to a (scope, name) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Generation(u64);

impl Generation {
    pub fn value(&self) -> u64 {
        self.0
    }
}

/// Process-wide registry of the latest token per (scope, name)
#[derive(Debug, Default)]
pub struct GenerationRegistry {
    tokens: DashMap<(String, String), u64>,
    next: AtomicU64,
}

impl GenerationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a fresh token, superseding any previous one for the same key
    pub fn create(&self, scope: &str, name: &str) -> Generation {
        let token = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        self.tokens
            .insert((scope.to_string(), name.to_string()), token);
        debug!("Generation {} issued for {}/{}", token, scope, name);
        Generation(token)
    }

    /// True while `token` is the latest one issued for the key
    pub fn compare(&self, scope: &str, name: &str, token: Generation) -> bool {
        self.tokens
            .get(&(scope.to_string(), name.to_string()))
            .map(|current| *current == token.0)
            .unwrap_or(false)
    }

    /// Invalidate the token for one key
    pub fn remove(&self, scope: &str, name: &str) {
        self.tokens.remove(&(scope.to_string(), name.to_string()));
    }

    /// Invalidate every token of a scope (swap retired)
    pub fn remove_scope(&self, scope: &str) {
        self.tokens.retain(|(s, _), _| s != scope);
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Outcome of one polling attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt<T> {
    /// Done, hand the value back
    Ready(T),
    /// Not yet, sleep and try again
    Retry,
    /// Give up without a value
    Stop,
}

/// Run `op` every `interval` until it yields a value or stops
pub async fn repeat_async_until_result<T, F, Fut>(interval: Duration, mut op: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Attempt<T>>,
{
    loop {
        match op().await {
            Attempt::Ready(value) => return Some(value),
            Attempt::Stop => return None,
            Attempt::Retry => sleep(interval).await,
        }
    }
}

/// Poll under an already issued token.
///
/// The token is checked before every check and again before a result is
/// returned, so a superseded poll never hands back a value.
pub async fn guarded_poll<T, F, Fut>(
    registry: &GenerationRegistry,
    scope: &str,
    name: &str,
    token: Generation,
    interval: Duration,
    mut check: F,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Attempt<T>>,
{
    let result = repeat_async_until_result(interval, || {
        let current = registry.compare(scope, name, token);
        let next = if current { Some(check()) } else { None };
        async move {
            match next {
                Some(fut) => fut.await,
                None => Attempt::Stop,
            }
        }
    })
    .await;

    if registry.compare(scope, name, token) {
        result
    } else {
        debug!(
            "Poll {}/{} superseded (generation {})",
            scope,
            name,
            token.value()
        );
        crate::metrics::record_poll_superseded(name);
        None
    }
}

/// Issue a new token for (scope, name) and poll under it
pub async fn poll_with_token<T, F, Fut>(
    registry: &GenerationRegistry,
    scope: &str,
    name: &str,
    interval: Duration,
    check: F,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Attempt<T>>,
{
    let token = registry.create(scope, name);
    guarded_poll(registry, scope, name, token, interval, check).await
}
