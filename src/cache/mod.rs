//! Cache data model and the store contract.
//!
//! This module provides:
//! - `CacheEntry`: per-key record of the last outcome, loading flag, timestamps
//!   and the queue of callers waiting on the in-flight attempt
//! - `CacheStore`: the get/set/serialize contract a backend implements
//! - Deterministic request fingerprints (canonical JSON + SHA-256)
//! - `MemoryStore`: a map-backed store

mod entry;
pub mod key;
mod storage;
mod traits;

pub use entry::{AttemptStamp, CacheEntry, Outcome, WaiterQueue};
pub use storage::MemoryStore;
pub use traits::{CacheKey, CacheStore};
