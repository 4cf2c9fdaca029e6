use std::borrow::Cow;

use crate::{Error, Result};

/// Decides which keys name the same lock.
///
/// Two keys whose canonical forms are equal share one mutex. The canonical
/// form is also what [`KeyedMutex::active_keys`](crate::KeyedMutex::active_keys)
/// reports.
pub trait KeyPolicy: Send + Sync + 'static {
    /// Maps `key` to the form used for hashing and comparison.
    fn canonicalize<'k>(&self, key: &'k str) -> Cow<'k, str>;
}

/// Keys are equal only when they are the same string. This is the default.
#[derive(Debug, Default, Clone, Copy)]
pub struct Exact;

impl KeyPolicy for Exact {
    fn canonicalize<'k>(&self, key: &'k str) -> Cow<'k, str> {
        Cow::Borrowed(key)
    }
}

/// Keys are compared after Unicode case folding, so `"Order"` and `"ORDER"`
/// share one mutex.
///
/// Each character is uppercased and then lowercased on its own, without
/// context-sensitive rules, so every case variant of a letter folds to the
/// same form (`Σ`, `σ` and `ς` all become `σ`).
#[derive(Debug, Default, Clone, Copy)]
pub struct IgnoreCase;

impl IgnoreCase {
    fn fold(key: &str) -> impl Iterator<Item = char> + '_ {
        key.chars()
            .flat_map(char::to_uppercase)
            .flat_map(char::to_lowercase)
    }
}

impl KeyPolicy for IgnoreCase {
    fn canonicalize<'k>(&self, key: &'k str) -> Cow<'k, str> {
        if Self::fold(key).eq(key.chars()) {
            Cow::Borrowed(key)
        } else {
            Cow::Owned(Self::fold(key).collect())
        }
    }
}

/// Rejects keys that are empty or contain only whitespace.
pub(crate) fn validate(key: &str) -> Result<()> {
    if key.trim().is_empty() {
        return Err(Error::InvalidKey);
    }
    Ok(())
}
