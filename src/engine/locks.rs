use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use ulid::Ulid;

use super::EngineError;

/// One mutex per key, created on first use. Serializes every write that could
/// assign a room to the same professor.
#[derive(Default)]
pub(super) struct KeyedLocks {
    inner: DashMap<Ulid, Arc<Mutex<()>>>,
}

impl KeyedLocks {
    pub(super) async fn lock(&self, key: Ulid) -> OwnedMutexGuard<()> {
        let mutex = self.inner.entry(key).or_default().clone();
        mutex.lock_owned().await
    }

    /// Drop entries nobody holds or waits on. Cloning happens under the shard
    /// lock, so a count of 1 means the map's reference is the only one.
    pub(super) fn prune(&self) {
        self.inner.retain(|_, m| Arc::strong_count(m) > 1);
    }

    #[cfg(test)]
    pub(super) fn len(&self) -> usize {
        self.inner.len()
    }
}

/// Await `fut` for at most `limit`; past that the caller gets a retryable error.
pub(super) async fn timed<F: Future>(
    limit: Duration,
    what: &'static str,
    fut: F,
) -> Result<F::Output, EngineError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(out) => Ok(out),
        Err(_) => {
            metrics::counter!(crate::observability::LOCK_TIMEOUTS_TOTAL, "lock" => what)
                .increment(1);
            tracing::warn!("lock wait timed out after {limit:?}: {what}");
            Err(EngineError::Unavailable(what))
        }
    }
}
