//! Request caching and in-flight deduplication for async fetches.
//!
//! A [`QueryClient`] wraps a [`NetworkHandler`] and a [`CacheStore`]. Every
//! request is fingerprinted together with its effective [`QueryConfig`];
//! fresh entries are served from the store, concurrent identical requests
//! share one network call, and durable subscribers see every loading and
//! settled transition of a key.

pub mod cache;
pub mod config;
pub mod error;
pub mod network;
pub mod query;

#[cfg(test)]
mod testing;

pub use cache::{CacheEntry, CacheKey, CacheStore, MemoryStore};
pub use config::{QueryConfig, QueryOverrides};
pub use error::{KeyError, RequestError};
pub use network::NetworkHandler;
pub use query::{CacheWatcher, QueryClient, QueryResponse, QueryState, ResponseFuture, Subscription};
