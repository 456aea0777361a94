//! Core traits and types for the cache store.

use std::fmt;

use serde::Serialize;

use super::entry::CacheEntry;
use super::key;
use crate::error::KeyError;

/// Stable fingerprint of a request under its effective query policy.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheKey(String);

impl CacheKey {
  pub fn new(key: impl Into<String>) -> Self {
    Self(key.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl AsRef<str> for CacheKey {
  fn as_ref(&self) -> &str {
    &self.0
  }
}

/// Trait for cache store backends.
///
/// The store maps fingerprints to entries. It never interprets entries;
/// expiry decisions and race resolution belong to the query client. Eviction,
/// if any, is up to the implementation.
pub trait CacheStore<D, E>: Send + Sync {
  /// Look up the entry for `key`. Must not have side effects.
  fn get(&self, key: &CacheKey) -> Option<CacheEntry<D, E>>;

  /// Insert or replace the entry for `key` and return the stored value.
  fn set(&self, key: &CacheKey, entry: CacheEntry<D, E>) -> CacheEntry<D, E>;

  /// Fingerprint an arbitrary value into a key.
  ///
  /// Structurally equal values must produce equal keys regardless of map
  /// ordering. The default renders canonical JSON and hashes it with SHA-256.
  fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<CacheKey, KeyError> {
    key::fingerprint(value)
  }
}
