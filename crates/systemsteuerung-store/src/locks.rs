//! Per-key write locks.
//!
//! Writers to the same document hold a [`KeyLock`] for the whole
//! historize-then-insert sequence, so they are served one at a time.
//! Writers to different keys never touch each other's locks. Entries are
//! dropped from the map once the last holder or waiter releases them.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

type Registry = Arc<DashMap<String, Arc<Mutex<()>>>>;

/// Registry of async mutexes keyed by string.
#[derive(Clone, Default)]
pub struct KeyedLocks {
    inner: Registry,
}

/// Held lock for one key. Dropping it releases the key.
pub struct KeyLock {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    registry: Registry,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`.
    ///
    /// Cancel-safe: a caller dropped while queued gives up its claim on the
    /// entry the same way a holder does.
    pub async fn lock(&self, key: impl Into<String>) -> KeyLock {
        let key = key.into();
        let mutex = self.inner.entry(key.clone()).or_default().clone();
        let guard = Waiting {
            key: key.clone(),
            registry: Arc::clone(&self.inner),
            acquire: Some(Box::pin(mutex.lock_owned())),
        }
        .await;
        KeyLock {
            key,
            guard: Some(guard),
            registry: Arc::clone(&self.inner),
        }
    }

    /// Number of keys currently locked or waited on.
    pub fn active(&self) -> usize {
        self.inner.len()
    }
}

impl KeyLock {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyLock {
    fn drop(&mut self) {
        drop(self.guard.take());
        release(&self.registry, &self.key);
    }
}

/// A queued `lock` call.
struct Waiting {
    key: String,
    registry: Registry,
    /// `None` once the lock was handed out.
    acquire: Option<Pin<Box<dyn Future<Output = OwnedMutexGuard<()>> + Send>>>,
}

impl Future for Waiting {
    type Output = OwnedMutexGuard<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Some(acquire) = self.acquire.as_mut() else {
            return Poll::Pending;
        };
        let guard = ready!(acquire.as_mut().poll(cx));
        self.acquire = None;
        Poll::Ready(guard)
    }
}

impl Drop for Waiting {
    fn drop(&mut self) {
        if let Some(acquire) = self.acquire.take() {
            drop(acquire);
            release(&self.registry, &self.key);
        }
    }
}

/// Remove `key` unless someone still holds or waits on it. The map owns one
/// reference; anything above that is a holder or a queued waiter.
fn release(registry: &Registry, key: &str) {
    registry.remove_if(key, |_, mutex| Arc::strong_count(mutex) == 1);
}
