//! In-memory cache store.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::entry::CacheEntry;
use super::traits::{CacheKey, CacheStore};

/// Map-backed store that keeps every entry for its own lifetime.
pub struct MemoryStore<D, E> {
  entries: Mutex<HashMap<CacheKey, CacheEntry<D, E>>>,
}

impl<D, E> MemoryStore<D, E> {
  pub fn new() -> Self {
    Self {
      entries: Mutex::new(HashMap::new()),
    }
  }

  fn lock(&self) -> MutexGuard<'_, HashMap<CacheKey, CacheEntry<D, E>>> {
    // Entries are always replaced whole, so a poisoned map is still consistent
    self.entries.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Number of keys with an entry.
  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl<D, E> Default for MemoryStore<D, E> {
  fn default() -> Self {
    Self::new()
  }
}

impl<D, E> fmt::Debug for MemoryStore<D, E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MemoryStore")
      .field("entries", &self.len())
      .finish()
  }
}

impl<D, E> CacheStore<D, E> for MemoryStore<D, E>
where
  D: Clone + Send + Sync,
  E: Clone + Send + Sync,
{
  fn get(&self, key: &CacheKey) -> Option<CacheEntry<D, E>> {
    self.lock().get(key).cloned()
  }

  fn set(&self, key: &CacheKey, entry: CacheEntry<D, E>) -> CacheEntry<D, E> {
    self.lock().insert(key.clone(), entry.clone());
    entry
  }
}
