use std::{
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// A single-permit semaphore registered under one key, together with the
/// number of callers that currently reference it (waiting or holding).
///
/// The count starts at one for the caller that created the entry. Once it
/// drops to zero the entry is retired: it is unlinked from the registry, its
/// semaphore is closed, and [`Entry::retain`] refuses to revive it.
pub(crate) struct Entry {
    key: Arc<str>,
    semaphore: Semaphore,
    refs: AtomicUsize,
}

impl Entry {
    pub(crate) fn new(key: Arc<str>) -> Self {
        Self {
            key,
            semaphore: Semaphore::new(1),
            refs: AtomicUsize::new(1),
        }
    }

    pub(crate) fn key(&self) -> &Arc<str> {
        &self.key
    }

    /// Claims one more reference, unless the entry is already retired.
    pub(crate) fn retain(&self) -> bool {
        self.refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |refs| {
                (refs != 0).then(|| refs + 1)
            })
            .is_ok()
    }

    /// Drops one reference. Returns `true` when it was the last one and the
    /// caller is now responsible for retiring the entry.
    pub(crate) fn release(&self) -> bool {
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev != 0, "reference count underflow for key {:?}", self.key);
        prev == 1
    }

    #[cfg(test)]
    pub(crate) fn refs(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    /// Whether the permit is currently taken.
    pub(crate) fn is_held(&self) -> bool {
        self.semaphore.available_permits() == 0
    }

    /// Waits for the permit. The permit is not tied to a borrow; it is handed
    /// back through [`Entry::unlock`].
    ///
    /// A token that is already cancelled wins over an available permit.
    pub(crate) async fn acquire(&self, cancel: Option<&CancellationToken>) -> Result<()> {
        let permit = match cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => return Err(Error::Cancelled),
                permit = self.semaphore.acquire() => permit,
            },
            None => self.semaphore.acquire().await,
        };
        match permit {
            Ok(permit) => {
                permit.forget();
                Ok(())
            }
            Err(_closed) => {
                tracing::error!(key = %self.key, "acquired a retired lock entry");
                debug_assert!(false, "semaphore for key {:?} closed while referenced", self.key);
                Err(Error::Retired)
            }
        }
    }

    /// Returns the permit. A closed semaphore or one that already has its
    /// permit back is left alone.
    pub(crate) fn unlock(&self) {
        if !self.semaphore.is_closed() && self.semaphore.available_permits() == 0 {
            self.semaphore.add_permits(1);
        }
    }

    pub(crate) fn close(&self) {
        self.semaphore.close();
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("key", &self.key)
            .field("refs", &self.refs.load(Ordering::Relaxed))
            .field("held", &self.is_held())
            .finish()
    }
}
