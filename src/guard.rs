use std::{fmt, ops::Deref, sync::Arc};

use crate::{entry::Entry, KeyedMutex};

/// An RAII implementation of a scoped lock. When this structure is dropped
/// (falls out of scope), the lock is released.
///
/// `R` is how the guard reaches its registry: a borrow for [`KeyGuard`] or an
/// `Arc` for [`OwnedKeyGuard`]. The guard is two pointers wide and owns no
/// allocation of its own.
///
/// [`Guard::default`] is an empty guard that holds nothing. Unlocking an empty
/// or already unlocked guard does nothing.
pub struct Guard<R>
where
    R: Deref<Target = KeyedMutex>,
{
    held: Option<(R, Arc<Entry>)>,
}

/// A guard borrowing its [`KeyedMutex`].
pub type KeyGuard<'k> = Guard<&'k KeyedMutex>;

/// A guard for an `Arc<KeyedMutex>`, free to move into spawned threads or tasks.
pub type OwnedKeyGuard = Guard<Arc<KeyedMutex>>;

impl<R> Guard<R>
where
    R: Deref<Target = KeyedMutex>,
{
    /// The canonical key this guard holds, or `None` once released.
    pub fn key(&self) -> Option<&str> {
        self.held.as_ref().map(|(_, entry)| &**entry.key())
    }

    /// Whether this guard still holds its lock.
    pub fn is_held(&self) -> bool {
        self.held.is_some()
    }

    /// Releases the lock now instead of at drop. Calling it again is a no-op.
    pub fn unlock(&mut self) {
        if let Some((registry, entry)) = self.held.take() {
            registry.release(&entry, true);
        }
    }
}

impl<R> Drop for Guard<R>
where
    R: Deref<Target = KeyedMutex>,
{
    fn drop(&mut self) {
        self.unlock();
    }
}

impl<R> Default for Guard<R>
where
    R: Deref<Target = KeyedMutex>,
{
    fn default() -> Self {
        Self { held: None }
    }
}

impl<R> fmt::Debug for Guard<R>
where
    R: Deref<Target = KeyedMutex>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Guard").field("key", &self.key()).finish()
    }
}

/// A reference on an entry whose permit has not been taken yet.
///
/// Dropping it gives the reference back, which covers timeouts, cancellation,
/// and futures dropped mid-wait alike.
pub(crate) struct Pending<'k> {
    registry: &'k KeyedMutex,
    entry: Arc<Entry>,
    armed: bool,
}

impl<'k> Pending<'k> {
    pub(crate) fn new(registry: &'k KeyedMutex, entry: Arc<Entry>) -> Self {
        Self {
            registry,
            entry,
            armed: true,
        }
    }

    pub(crate) fn entry(&self) -> &Entry {
        &self.entry
    }

    /// Hands the reference to a guard. Call only after the permit is taken.
    pub(crate) fn into_guard<R>(mut self, registry: R) -> Guard<R>
    where
        R: Deref<Target = KeyedMutex>,
    {
        debug_assert!(std::ptr::eq(&*registry, self.registry));
        self.armed = false;
        Guard {
            held: Some((registry, Arc::clone(&self.entry))),
        }
    }
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.registry.release(&self.entry, false);
        }
    }
}
