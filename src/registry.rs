use std::{fmt, ptr, sync::Arc};

use dashmap::{mapref::entry::Entry as Slot, DashMap};

use crate::{
    entry::Entry,
    guard::Pending,
    key::{self, Exact, IgnoreCase, KeyPolicy},
    Result,
};

/// A lock that provides mutually exclusive access to a resource, where the
/// resource is identified by a string key.
///
/// Each key gets its own single-permit semaphore the first time somebody asks
/// for it. The semaphore is reference counted by the callers waiting on or
/// holding it, and it is dropped from the registry as soon as that count
/// reaches zero. Callers on different keys never wait for each other.
///
/// The lock is not reentrant: acquiring a key that the current caller already
/// holds waits forever.
pub struct KeyedMutex {
    map: DashMap<Arc<str>, Arc<Entry>>,
    policy: Arc<dyn KeyPolicy>,
}

impl KeyedMutex {
    /// Creates a new `KeyedMutex` comparing keys exactly.
    #[must_use]
    pub fn new() -> Self {
        Builder::default().build()
    }

    /// Starts configuring a `KeyedMutex`. See [`Builder`].
    #[must_use]
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// Number of keys currently locked or waited on.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether no key is currently locked or waited on.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Whether `key` is held right now. Invalid keys are never locked.
    ///
    /// The answer may be stale by the time the caller looks at it.
    pub fn is_locked(&self, key: &str) -> bool {
        if key::validate(key).is_err() {
            return false;
        }
        let key = self.policy.canonicalize(key);
        self.map.get(&*key).is_some_and(|entry| entry.is_held())
    }

    /// Snapshot of the tracked keys, in canonical form.
    pub fn active_keys(&self) -> Vec<String> {
        self.map.iter().map(|entry| entry.key().to_string()).collect()
    }

    /// Validates `key` and takes a reference on its entry, creating the entry
    /// if needed. The reference is given back when the returned `Pending` is
    /// dropped, unless it has been turned into a guard.
    pub(crate) fn claim(&self, key: &str) -> Result<Pending<'_>> {
        key::validate(key)?;
        let key = self.policy.canonicalize(key);
        Ok(Pending::new(self, self.find_or_create(&key)))
    }

    /// Returns a live entry for `key` with a reference already counted for
    /// the caller.
    fn find_or_create(&self, key: &str) -> Arc<Entry> {
        if let Some(entry) = self.map.get(key).map(|entry| Arc::clone(entry.value())) {
            if entry.retain() {
                return entry;
            }
        }

        match self.map.entry(Arc::from(key)) {
            Slot::Occupied(mut occupied) => {
                if occupied.get().retain() {
                    return Arc::clone(occupied.get());
                }
                // The current entry is retiring. Its conditional remove will
                // not match the replacement.
                let fresh = Arc::new(Entry::new(Arc::clone(occupied.key())));
                occupied.insert(Arc::clone(&fresh));
                tracing::trace!(key, "replaced retiring lock entry");
                fresh
            }
            Slot::Vacant(vacant) => {
                let fresh = Arc::new(Entry::new(Arc::clone(vacant.key())));
                vacant.insert(Arc::clone(&fresh));
                tracing::trace!(key, "created lock entry");
                fresh
            }
        }
    }

    /// Gives back a reference on `entry`, first returning its permit when
    /// `locked`. The last reference unlinks the entry and closes it.
    pub(crate) fn release(&self, entry: &Entry, locked: bool) {
        if locked {
            entry.unlock();
        }
        if entry.release() {
            self.map
                .remove_if(&**entry.key(), |_, current| ptr::eq(Arc::as_ptr(current), entry));
            entry.close();
            tracing::trace!(key = %entry.key(), "retired lock entry");
        }
    }

    #[cfg(test)]
    pub(crate) fn refs(&self, key: &str) -> Option<usize> {
        let key = self.policy.canonicalize(key);
        self.map.get(&*key).map(|entry| entry.refs())
    }
}

impl Default for KeyedMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for KeyedMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedMutex")
            .field("len", &self.map.len())
            .finish_non_exhaustive()
    }
}

/// Configures a [`KeyedMutex`].
///
/// ```
/// use keyed_mutex::KeyedMutex;
///
/// let locks = KeyedMutex::builder()
///     .capacity(256)
///     .concurrency(16)
///     .case_insensitive()
///     .build();
/// let _guard = locks.lock("Invoice-7").unwrap();
/// assert!(locks.is_locked("INVOICE-7"));
/// ```
#[derive(Clone)]
pub struct Builder {
    capacity: usize,
    concurrency: Option<usize>,
    policy: Arc<dyn KeyPolicy>,
}

impl Builder {
    /// Number of keys the map can track before it reallocates.
    #[must_use]
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Expected number of threads touching the registry at once. Used as the
    /// map's shard count, rounded up to a power of two no smaller than 2.
    #[must_use]
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    /// Sets the policy deciding which keys share a mutex. Defaults to [`Exact`].
    #[must_use]
    pub fn policy(mut self, policy: impl KeyPolicy) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    /// Shorthand for `policy(IgnoreCase)`.
    #[must_use]
    pub fn case_insensitive(self) -> Self {
        self.policy(IgnoreCase)
    }

    /// Creates the configured `KeyedMutex`.
    #[must_use]
    pub fn build(self) -> KeyedMutex {
        let map = match self.concurrency {
            Some(concurrency) => DashMap::with_capacity_and_shard_amount(
                self.capacity,
                concurrency.max(2).next_power_of_two(),
            ),
            None => DashMap::with_capacity(self.capacity),
        };
        KeyedMutex {
            map,
            policy: self.policy,
        }
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            capacity: 0,
            concurrency: None,
            policy: Arc::new(Exact),
        }
    }
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("capacity", &self.capacity)
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}
