use parking_lot::{Condvar, Mutex};
use std::{
    future::Future,
    pin::pin,
    sync::Arc,
    task::{Context, Poll, Wake, Waker},
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;

use crate::{guard::Pending, KeyGuard, KeyedMutex, OwnedKeyGuard, Result};

impl KeyedMutex {
    /// Acquires a lock for a given key.
    ///
    /// If the lock is already held by another thread, this method blocks until
    /// the lock is released.
    ///
    /// When the returned `KeyGuard` is dropped, the lock is released.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidKey`](crate::Error::InvalidKey) if `key` is empty or
    /// whitespace.
    pub fn lock(&self, key: &str) -> Result<KeyGuard<'_>> {
        let pending = self.lock_inner(key, None)?;
        Ok(pending.into_guard(self))
    }

    /// Acquires a lock for a given key, returning an `OwnedKeyGuard`.
    ///
    /// This method is for use with `Arc<KeyedMutex>`. If the lock is already
    /// held by another thread, this method blocks until the lock is released.
    pub fn lock_owned(self: &Arc<Self>, key: &str) -> Result<OwnedKeyGuard> {
        let pending = self.lock_inner(key, None)?;
        Ok(pending.into_guard(Arc::clone(self)))
    }

    /// Acquires a lock for a given key, giving up when `cancel` fires.
    ///
    /// # Errors
    ///
    /// [`Error::Cancelled`](crate::Error::Cancelled) if the token is cancelled
    /// before the lock is obtained, including when it was cancelled already.
    pub fn lock_cancellable(&self, key: &str, cancel: &CancellationToken) -> Result<KeyGuard<'_>> {
        let pending = self.lock_inner(key, Some(cancel))?;
        Ok(pending.into_guard(self))
    }

    /// Acquires a lock for a given key, waiting at most `timeout`.
    ///
    /// Returns `Ok(None)` if the lock was not obtained in time.
    pub fn try_lock_for(&self, key: &str, timeout: Duration) -> Result<Option<KeyGuard<'_>>> {
        let pending = self.try_lock_inner(key, timeout, None)?;
        Ok(pending.map(|pending| pending.into_guard(self)))
    }

    /// Same as [`try_lock_for`](Self::try_lock_for) with the timeout in milliseconds.
    pub fn try_lock_for_millis(&self, key: &str, millis: u64) -> Result<Option<KeyGuard<'_>>> {
        self.try_lock_for(key, Duration::from_millis(millis))
    }

    /// Acquires a lock for a given key, waiting at most `timeout` and giving up
    /// when `cancel` fires.
    ///
    /// A timeout is `Ok(None)`; cancellation is
    /// [`Error::Cancelled`](crate::Error::Cancelled).
    pub fn try_lock_for_cancellable(
        &self,
        key: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<KeyGuard<'_>>> {
        let pending = self.try_lock_inner(key, timeout, Some(cancel))?;
        Ok(pending.map(|pending| pending.into_guard(self)))
    }

    /// Owned counterpart of [`try_lock_for`](Self::try_lock_for).
    pub fn try_lock_owned_for(
        self: &Arc<Self>,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<OwnedKeyGuard>> {
        let pending = self.try_lock_inner(key, timeout, None)?;
        Ok(pending.map(|pending| pending.into_guard(Arc::clone(self))))
    }

    /// Gets or creates the entry for a key and blocks until its permit is taken.
    fn lock_inner(&self, key: &str, cancel: Option<&CancellationToken>) -> Result<Pending<'_>> {
        let pending = self.claim(key)?;
        if let Err(err) = futures::executor::block_on(pending.entry().acquire(cancel)) {
            tracing::debug!(key, %err, "gave up waiting for lock");
            return Err(err);
        }
        Ok(pending)
    }

    fn try_lock_inner(
        &self,
        key: &str,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<Pending<'_>>> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return self.lock_inner(key, cancel).map(Some);
        };
        let pending = self.claim(key)?;
        match block_on_until(pending.entry().acquire(cancel), deadline) {
            Some(Ok(())) => Ok(Some(pending)),
            Some(Err(err)) => {
                tracing::debug!(key, %err, "gave up waiting for lock");
                Err(err)
            }
            None => {
                tracing::debug!(key, ?timeout, "timed out waiting for lock");
                Ok(None)
            }
        }
    }
}

/// Wakes a thread parked in [`block_on_until`].
#[derive(Default)]
struct Signal {
    woken: Mutex<bool>,
    cond: Condvar,
}

impl Signal {
    /// Parks until woken. Returns `false` if `deadline` passed first.
    fn park(&self, deadline: Instant) -> bool {
        let mut woken = self.woken.lock();
        while !*woken {
            if self.cond.wait_until(&mut woken, deadline).timed_out() && !*woken {
                return false;
            }
        }
        *woken = false;
        true
    }
}

impl Wake for Signal {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        *self.woken.lock() = true;
        self.cond.notify_one();
    }
}

/// Drives `future` on the calling thread until it completes or `deadline`
/// passes. On expiry the future is polled once more and then dropped.
fn block_on_until<F: Future>(future: F, deadline: Instant) -> Option<F::Output> {
    let signal = Arc::new(Signal::default());
    let waker = Waker::from(Arc::clone(&signal));
    let mut cx = Context::from_waker(&waker);
    let mut future = pin!(future);
    loop {
        if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
            return Some(output);
        }
        if !signal.park(deadline) {
            return match future.as_mut().poll(&mut cx) {
                Poll::Ready(output) => Some(output),
                Poll::Pending => None,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;

    #[test]
    fn test_basic_lock() {
        let keyed_mutex = KeyedMutex::new();
        let _guard = keyed_mutex.lock("a").unwrap();
        // The lock is held here.
        // When _guard goes out of scope, the lock is released.
    }

    #[test]
    fn test_lock_is_released() {
        let keyed_mutex = KeyedMutex::new();
        let guard = keyed_mutex.lock("a").unwrap();
        assert!(keyed_mutex.is_locked("a"));
        drop(guard);
        assert!(!keyed_mutex.is_locked("a"));
        // The lock should be released now.
        let _guard2 = keyed_mutex.lock("a").unwrap();
    }

    #[test]
    fn test_invalid_key() {
        let keyed_mutex = KeyedMutex::new();
        assert_eq!(keyed_mutex.lock("").unwrap_err(), Error::InvalidKey);
        assert_eq!(
            keyed_mutex
                .try_lock_for(" ", Duration::from_millis(10))
                .unwrap_err(),
            Error::InvalidKey
        );
        let token = CancellationToken::new();
        assert_eq!(
            keyed_mutex.lock_cancellable("\n", &token).unwrap_err(),
            Error::InvalidKey
        );
        assert!(keyed_mutex.is_empty());
    }

    #[test]
    fn test_concurrent_access() {
        let keyed_mutex = Arc::new(KeyedMutex::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];

        for _ in 0..16 {
            let keyed_mutex = Arc::clone(&keyed_mutex);
            let inside = Arc::clone(&inside);
            handles.push(thread::spawn(move || {
                for _ in 0..50 {
                    let _guard = keyed_mutex.lock("shared").unwrap();
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    assert!(now <= 1, "{now} holders inside the critical section");
                    thread::yield_now();
                    inside.fetch_sub(1, Ordering::SeqCst);
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
        assert!(keyed_mutex.is_empty());
    }

    #[test]
    fn test_locks_different_keys() {
        let keyed_mutex = Arc::new(KeyedMutex::new());
        let _guard1 = keyed_mutex.lock("a").unwrap();

        let (tx, rx) = mpsc::channel();
        let keyed_mutex_clone = Arc::clone(&keyed_mutex);
        let handle = thread::spawn(move || {
            let _guard2 = keyed_mutex_clone.lock("b").unwrap();
            tx.send(()).unwrap();
        });

        // Locks for different keys should not block each other.
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        handle.join().unwrap();
        assert_eq!(keyed_mutex.len(), 1);
    }

    #[test]
    fn test_lock_contention() {
        let keyed_mutex = Arc::new(KeyedMutex::new());
        let guard = keyed_mutex.lock("a").unwrap();

        let keyed_mutex_clone = Arc::clone(&keyed_mutex);
        let handle = thread::spawn(move || {
            let now = Instant::now();
            let _guard = keyed_mutex_clone.lock("a").unwrap();
            now.elapsed()
        });

        thread::sleep(Duration::from_millis(200));
        assert_eq!(keyed_mutex.refs("a"), Some(2));
        drop(guard);

        assert!(handle.join().unwrap() >= Duration::from_millis(150));
        assert!(keyed_mutex.is_empty());
    }

    #[test]
    fn test_registry_cleanup_many_keys() {
        let keyed_mutex = Arc::new(KeyedMutex::new());
        let mut handles = vec![];

        for t in 0..4 {
            let keyed_mutex = Arc::clone(&keyed_mutex);
            handles.push(thread::spawn(move || {
                for i in 0..1000 {
                    // Overlapping key ranges so threads also meet on shared keys.
                    let key = format!("key-{}", (i + t * 250) % 1000);
                    let _guard = keyed_mutex.lock(&key).unwrap();
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(keyed_mutex.len(), 0);
    }

    #[test]
    fn test_try_lock_times_out() {
        let keyed_mutex = Arc::new(KeyedMutex::new());
        let (tx, rx) = mpsc::channel();

        let keyed_mutex_clone = Arc::clone(&keyed_mutex);
        let holder = thread::spawn(move || {
            let _guard = keyed_mutex_clone.lock("a").unwrap();
            tx.send(()).unwrap();
            thread::sleep(Duration::from_millis(500));
        });
        rx.recv().unwrap();

        let now = Instant::now();
        let result = keyed_mutex
            .try_lock_for("a", Duration::from_millis(100))
            .unwrap();
        let elapsed = now.elapsed();

        assert!(result.is_none());
        assert!(elapsed >= Duration::from_millis(100), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(400), "{elapsed:?}");
        assert_eq!(keyed_mutex.len(), 1);
        assert_eq!(keyed_mutex.refs("a"), Some(1));

        holder.join().unwrap();
        assert!(keyed_mutex.is_empty());
    }

    #[test]
    fn test_try_lock_succeeds_when_free() {
        let keyed_mutex = KeyedMutex::new();
        let guard = keyed_mutex.try_lock_for_millis("a", 0).unwrap();
        assert!(guard.is_some());
        assert!(keyed_mutex
            .try_lock_for("a", Duration::ZERO)
            .unwrap()
            .is_none());
        drop(guard);
        assert!(keyed_mutex
            .try_lock_for("a", Duration::MAX)
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_try_lock_waits_for_release() {
        let keyed_mutex = Arc::new(KeyedMutex::new());
        let guard = keyed_mutex.lock_owned("a").unwrap();

        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            drop(guard);
        });

        let guard = keyed_mutex
            .try_lock_owned_for("a", Duration::from_secs(5))
            .unwrap();
        assert!(guard.is_some());
        releaser.join().unwrap();
    }

    #[test]
    fn test_lock_cancellable() {
        let keyed_mutex = Arc::new(KeyedMutex::new());
        let _guard = keyed_mutex.lock("a").unwrap();
        let token = CancellationToken::new();

        let keyed_mutex_clone = Arc::clone(&keyed_mutex);
        let token_clone = token.clone();
        let waiter = thread::spawn(move || {
            keyed_mutex_clone
                .lock_cancellable("a", &token_clone)
                .map(drop)
        });

        thread::sleep(Duration::from_millis(50));
        assert_eq!(keyed_mutex.refs("a"), Some(2));
        token.cancel();

        assert_eq!(waiter.join().unwrap(), Err(Error::Cancelled));
        assert_eq!(keyed_mutex.len(), 1);
        assert_eq!(keyed_mutex.refs("a"), Some(1));
    }

    #[test]
    fn test_lock_cancellable_already_cancelled() {
        let keyed_mutex = KeyedMutex::new();
        let token = CancellationToken::new();
        token.cancel();
        assert_eq!(
            keyed_mutex.lock_cancellable("a", &token).unwrap_err(),
            Error::Cancelled
        );
        assert!(keyed_mutex.is_empty());
    }

    #[test]
    fn test_try_lock_for_cancellable() {
        let keyed_mutex = KeyedMutex::new();
        let _guard = keyed_mutex.lock("a").unwrap();
        let token = CancellationToken::new();

        // Timeout without cancellation reports `None`.
        let result = keyed_mutex
            .try_lock_for_cancellable("a", Duration::from_millis(20), &token)
            .unwrap();
        assert!(result.is_none());

        // Cancellation reports an error.
        let canceller = {
            let token = token.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                token.cancel();
            })
        };
        let result =
            keyed_mutex.try_lock_for_cancellable("a", Duration::from_secs(5), &token);
        assert_eq!(result.unwrap_err(), Error::Cancelled);
        canceller.join().unwrap();

        assert_eq!(keyed_mutex.refs("a"), Some(1));
    }

    #[test]
    fn test_non_reentrant_lock() {
        let keyed_mutex = KeyedMutex::new();
        let _guard = keyed_mutex.lock("a").unwrap();
        // The same caller asking again waits like everybody else.
        assert!(keyed_mutex
            .try_lock_for("a", Duration::from_millis(50))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_released_on_panic() {
        let keyed_mutex = Arc::new(KeyedMutex::new());

        let keyed_mutex_clone = Arc::clone(&keyed_mutex);
        let result = thread::spawn(move || {
            let _guard = keyed_mutex_clone.lock("a").unwrap();
            panic!("critical section failed");
        })
        .join();

        assert!(result.is_err());
        assert!(!keyed_mutex.is_locked("a"));
        assert!(keyed_mutex.is_empty());
        assert!(keyed_mutex
            .try_lock_for("a", Duration::ZERO)
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_case_sensitivity() {
        let exact = KeyedMutex::new();
        let _guard = exact.lock("Key").unwrap();
        assert!(exact
            .try_lock_for("key", Duration::from_millis(20))
            .unwrap()
            .is_some());

        let ignore_case = KeyedMutex::builder().case_insensitive().build();
        let _guard = ignore_case.lock("Key").unwrap();
        assert!(ignore_case
            .try_lock_for("key", Duration::from_millis(20))
            .unwrap()
            .is_none());
        assert!(ignore_case.is_locked("KEY"));
    }

    #[test]
    fn test_case_insensitive_sigma() {
        let keyed_mutex = KeyedMutex::builder().case_insensitive().build();
        let _guard = keyed_mutex.lock("ΟΔΟΣ").unwrap();
        for key in ["οδοσ", "οδος", "Οδος"] {
            assert!(keyed_mutex.is_locked(key), "{key}");
            assert!(keyed_mutex
                .try_lock_for(key, Duration::ZERO)
                .unwrap()
                .is_none());
        }
        assert_eq!(keyed_mutex.active_keys(), ["οδοσ"]);
    }

    #[test]
    fn test_independent_registries() {
        let first = KeyedMutex::new();
        let second = KeyedMutex::new();
        let _guard = first.lock("a").unwrap();
        assert!(second
            .try_lock_for("a", Duration::ZERO)
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_guard_released_on_other_thread() {
        let keyed_mutex = Arc::new(KeyedMutex::new());
        let guard = keyed_mutex.lock_owned("a").unwrap();
        thread::spawn(move || drop(guard)).join().unwrap();
        assert!(keyed_mutex.is_empty());
    }

    #[test]
    fn test_block_on_until_expires() {
        let deadline = Instant::now() + Duration::from_millis(30);
        assert_eq!(block_on_until(std::future::pending::<()>(), deadline), None);
        assert!(Instant::now() >= deadline);
        assert_eq!(block_on_until(async { 7 }, deadline), Some(7));
    }
}
