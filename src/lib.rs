//! This crate provides a keyed mutex: a registry that hands out exclusive access to a resource identified by a string key. Unrelated keys never contend, and a key is forgotten as soon as nobody holds or waits for it, so memory tracks the keys in use rather than every key ever seen.
//!
//! This crate provides both synchronous and asynchronous acquisition, each with timeout and cancellation variants.
//!
//! ```
//! use keyed_mutex::KeyedMutex;
//!
//! let locks = KeyedMutex::new();
//! {
//!     let _guard = locks.lock("order-42").unwrap();
//!     assert!(locks.is_locked("order-42"));
//! }
//! assert!(locks.is_empty());
//! ```

#[cfg(not(any(feature = "sync", feature = "async")))]
compile_error!("enable at least one of the `sync` or `async` features");

mod entry;
mod error;
mod guard;
mod key;
mod registry;

#[cfg(feature = "async")]
mod r#async;
#[cfg(feature = "sync")]
mod sync;

pub use error::{Error, Result};
pub use guard::{Guard, KeyGuard, OwnedKeyGuard};
pub use key::{Exact, IgnoreCase, KeyPolicy};
pub use registry::{Builder, KeyedMutex};
pub use tokio_util::sync::CancellationToken;
