use thiserror::Error;

/// Errors returned by [`KeyedMutex`](crate::KeyedMutex) acquisition.
///
/// A timed-out wait is not an error; the `try_*` methods report it as `Ok(None)`.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The key was empty or contained only whitespace.
    #[error("lock key must not be empty or whitespace")]
    InvalidKey,

    /// The cancellation token fired before the lock was obtained.
    #[error("lock acquisition was cancelled")]
    Cancelled,

    /// The entry's semaphore was closed while a caller still referenced it.
    /// This is a bug in the registry, never a caller error.
    #[error("lock entry was retired while still referenced")]
    Retired,
}

/// Result type of this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
