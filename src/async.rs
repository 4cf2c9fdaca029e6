use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

use crate::{guard::Pending, KeyGuard, KeyedMutex, OwnedKeyGuard, Result};

/// Suspending acquisition. These methods never block the worker thread.
///
/// The timed variants need a tokio runtime with the time driver enabled; the
/// others run on any executor.
/// Dropping any of the returned futures before completion gives back whatever
/// the acquisition had claimed.
impl KeyedMutex {
    /// Acquires a lock for a given key.
    ///
    /// If the lock is already held by another task, this method will wait until
    /// the lock is released.
    ///
    /// When the returned `KeyGuard` is dropped, the lock is released.
    pub async fn lock_async(&self, key: &str) -> Result<KeyGuard<'_>> {
        let pending = self.lock_async_inner(key, None).await?;
        Ok(pending.into_guard(self))
    }

    /// Acquires a lock for a given key, returning an `OwnedKeyGuard`.
    ///
    /// This method is for use with `Arc<KeyedMutex>`; the guard can be moved
    /// into spawned tasks.
    pub async fn lock_owned_async(self: &Arc<Self>, key: &str) -> Result<OwnedKeyGuard> {
        let pending = self.lock_async_inner(key, None).await?;
        Ok(pending.into_guard(Arc::clone(self)))
    }

    /// Acquires a lock for a given key, giving up with
    /// [`Error::Cancelled`](crate::Error::Cancelled) when `cancel` fires.
    pub async fn lock_cancellable_async(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<KeyGuard<'_>> {
        let pending = self.lock_async_inner(key, Some(cancel)).await?;
        Ok(pending.into_guard(self))
    }

    /// Acquires a lock for a given key, waiting at most `timeout`.
    ///
    /// Returns `Ok(None)` if the lock was not obtained in time.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime with the time driver
    /// enabled, whatever the timeout and even if the lock is free.
    pub async fn try_lock_for_async(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<KeyGuard<'_>>> {
        let pending = self.try_lock_async_inner(key, timeout, None).await?;
        Ok(pending.map(|pending| pending.into_guard(self)))
    }

    /// Acquires a lock for a given key, waiting at most `timeout` and giving up
    /// when `cancel` fires.
    ///
    /// A timeout is `Ok(None)`; cancellation is
    /// [`Error::Cancelled`](crate::Error::Cancelled).
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime with the time driver
    /// enabled, whatever the timeout and even if the lock is free.
    pub async fn try_lock_for_cancellable_async(
        &self,
        key: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<KeyGuard<'_>>> {
        let pending = self.try_lock_async_inner(key, timeout, Some(cancel)).await?;
        Ok(pending.map(|pending| pending.into_guard(self)))
    }

    /// Owned counterpart of [`try_lock_for_async`](Self::try_lock_for_async).
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime with the time driver
    /// enabled, whatever the timeout and even if the lock is free.
    pub async fn try_lock_owned_for_async(
        self: &Arc<Self>,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<OwnedKeyGuard>> {
        let pending = self.try_lock_async_inner(key, timeout, None).await?;
        Ok(pending.map(|pending| pending.into_guard(Arc::clone(self))))
    }

    /// Gets or creates the entry for a key and waits for its permit.
    async fn lock_async_inner(
        &self,
        key: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<Pending<'_>> {
        let pending = self.claim(key)?;
        if let Err(err) = pending.entry().acquire(cancel).await {
            tracing::debug!(key, %err, "gave up waiting for lock");
            return Err(err);
        }
        Ok(pending)
    }

    async fn try_lock_async_inner(
        &self,
        key: &str,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<Pending<'_>>> {
        let pending = self.claim(key)?;
        match tokio::time::timeout(timeout, pending.entry().acquire(cancel)).await {
            Ok(Ok(())) => Ok(Some(pending)),
            Ok(Err(err)) => {
                tracing::debug!(key, %err, "gave up waiting for lock");
                Err(err)
            }
            Err(_elapsed) => {
                tracing::debug!(key, ?timeout, "timed out waiting for lock");
                Ok(None)
            }
        }
    }
}
