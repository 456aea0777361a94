//! Request orchestration with caching and in-flight deduplication.
//!
//! Inspired by TanStack Query, `QueryClient` sits in front of a
//! [`NetworkHandler`] and:
//! - Serves fresh cache entries without touching the network
//! - Coalesces concurrent identical requests into one network call
//! - Resolves races so the cache never regresses to an answer older than the
//!   most recently initiated attempt
//! - Notifies durable subscribers of every loading/settled transition
//!
//! # Example
//!
//! ```ignore
//! let client = QueryClient::new(QueryOverrides::default(), MemoryStore::new(), GraphQlHandler::new(url));
//!
//! let (response, subscription) = client.request_and_subscribe(&films, &QueryOverrides::default(), |state| {
//!     render(state);
//! })?;
//!
//! match response.await {
//!     Ok(response) => show(response.data),
//!     Err(RequestError::Failed(response)) => show_error(response.error),
//!     Err(e) => tracing::warn!("{e}"),
//! }
//! subscription.unsubscribe();
//! ```

mod state;
mod subscribers;
mod watcher;

pub use state::{QueryResponse, QueryState};
pub use subscribers::{Callback, Subscription};
pub use watcher::CacheWatcher;

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::{self, BoxFuture, FutureExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::cache::key::fingerprint_input;
use crate::cache::{AttemptStamp, CacheEntry, CacheKey, CacheStore, Outcome, WaiterQueue};
use crate::config::{QueryConfig, QueryOverrides};
use crate::error::{KeyError, RequestError};
use crate::network::NetworkHandler;
use subscribers::Subscribers;

/// Eventual outcome of [`QueryClient::request`].
pub type ResponseFuture<D, E> =
  BoxFuture<'static, Result<QueryResponse<D, E>, RequestError<D, E>>>;

/// Caching, deduplicating front for a network handler.
///
/// Cloning is cheap and clones share the cache, the subscribers and the
/// in-flight attempts.
pub struct QueryClient<H: NetworkHandler, S> {
  inner: Arc<Inner<H, S>>,
}

struct Inner<H: NetworkHandler, S> {
  config: QueryConfig,
  cache: S,
  handler: H,
  subscribers: Arc<Subscribers<H::Data, H::Error>>,
  /// Held for every read-decide-write of an entry, never across an await
  timeline: Mutex<()>,
  next_attempt: AtomicU64,
}

/// What `request` does for a caller.
enum Decision<D, E> {
  /// Fresh or settled entry, answered right away
  Hit(QueryResponse<D, E>),
  /// An attempt is already in flight; wait for it
  Join(oneshot::Receiver<Outcome<D, E>>),
  /// Start a new attempt
  Issue(Attempt<D, E>),
}

struct Attempt<D, E> {
  stamp: AttemptStamp,
  waiters: WaiterQueue<D, E>,
  receiver: oneshot::Receiver<Outcome<D, E>>,
}

impl<H, S> QueryClient<H, S>
where
  H: NetworkHandler,
  S: CacheStore<H::Data, H::Error> + 'static,
{
  /// Create a client. `config` is laid over the defaults and applies to
  /// every request unless overridden per call.
  pub fn new(config: QueryOverrides, cache: S, handler: H) -> Self {
    Self {
      inner: Arc::new(Inner {
        config: QueryConfig::default().merge(&config),
        cache,
        handler,
        subscribers: Arc::new(Subscribers::new()),
        timeline: Mutex::new(()),
        next_attempt: AtomicU64::new(0),
      }),
    }
  }

  /// Client-wide config, before per-call overrides.
  pub fn config(&self) -> &QueryConfig {
    &self.inner.config
  }

  pub fn cache(&self) -> &S {
    &self.inner.cache
  }

  pub fn handler(&self) -> &H {
    &self.inner.handler
  }

  /// Key of `request` under the effective config for `overrides`.
  ///
  /// The key covers both the request and the policy, so the same request
  /// under different policies occupies different slots.
  pub fn cache_key(&self, request: &H::Request, overrides: &QueryOverrides) -> Result<CacheKey, KeyError> {
    let config = self.inner.config.merge(overrides);
    self.inner.key_for(request, &config)
  }

  /// Snapshot of the entry for `request` under the client-wide config.
  ///
  /// Creates an empty entry if there is none. Never touches the network.
  pub fn current_state(&self, request: &H::Request) -> Result<QueryResponse<H::Data, H::Error>, KeyError> {
    let key = self.cache_key(request, &QueryOverrides::default())?;
    let _timeline = self.inner.lock_timeline();
    Ok(self.inner.lookup_or_create(&key).response())
  }

  /// Request `request`, from the cache if possible.
  ///
  /// The lookup, the decision to call the network and the handler call all
  /// happen before this returns; the returned future only waits for the
  /// outcome. Dropping it does not cancel the network call.
  ///
  /// Durable subscribers see snapshots in the order the entry changed. The
  /// loading snapshot goes out before the handler is called, unless another
  /// thread is delivering at that moment; that thread then delivers it in
  /// turn.
  ///
  /// A fresh entry is returned as is, even when it holds a cached error. A
  /// failed network call rejects with [`RequestError::Failed`], carrying the
  /// full response.
  ///
  /// Must be called within a Tokio runtime.
  pub fn request(
    &self,
    request: &H::Request,
    overrides: &QueryOverrides,
  ) -> ResponseFuture<H::Data, H::Error> {
    let config = self.inner.config.merge(overrides);
    let key = match self.inner.key_for(request, &config) {
      Ok(key) => key,
      Err(e) => return future::ready(Err(e.into())).boxed(),
    };

    match self.inner.decide(&key, &config) {
      Decision::Hit(response) => {
        tracing::trace!(%key, "Serving cached entry");
        future::ready(Ok(response)).boxed()
      }
      Decision::Join(receiver) => {
        tracing::trace!(%key, "Joining in-flight request");
        wait_for(receiver, config.wait_timeout).boxed()
      }
      Decision::Issue(Attempt {
        stamp,
        waiters,
        receiver,
      }) => {
        tracing::debug!(
          %key,
          attempt = stamp.seq(),
          ignore_cache = config.ignore_cache,
          "Issuing network request"
        );
        self.inner.subscribers.deliver();

        let call = self.inner.handler.request(request);
        let inner = Arc::clone(&self.inner);
        let cache_expiry = config.cache_expiry;
        tokio::spawn(async move {
          match AssertUnwindSafe(call).catch_unwind().await {
            Ok(outcome) => inner.settle(&key, stamp, &waiters, cache_expiry, outcome),
            Err(_) => inner.abandon(&key, stamp, &waiters),
          }
        });

        wait_for(receiver, config.wait_timeout).boxed()
      }
    }
  }

  /// Subscribe `callback` to the key of `request`, then request it.
  ///
  /// The subscription exists before the request starts, so the callback
  /// sees the loading notification of this very call.
  pub fn request_and_subscribe<F>(
    &self,
    request: &H::Request,
    overrides: &QueryOverrides,
    callback: F,
  ) -> Result<(ResponseFuture<H::Data, H::Error>, Subscription), KeyError>
  where
    F: Fn(&QueryResponse<H::Data, H::Error>) + Send + Sync + 'static,
  {
    let key = self.cache_key(request, overrides)?;
    let subscription = self.subscribe_to_cache_key(&key, callback);
    let response = self.request(request, overrides);
    Ok((response, subscription))
  }

  /// Call `callback` on every state change of `key` until unsubscribed.
  pub fn subscribe_to_cache_key<F>(&self, key: &CacheKey, callback: F) -> Subscription
  where
    F: Fn(&QueryResponse<H::Data, H::Error>) + Send + Sync + 'static,
  {
    self.inner.subscribers.subscribe(key, Arc::new(callback))
  }

  /// Durable subscription to `key` that queues snapshots for polling.
  pub fn watch(&self, key: &CacheKey) -> CacheWatcher<H::Data, H::Error> {
    let (tx, rx) = mpsc::unbounded_channel();
    let subscription = self.subscribe_to_cache_key(key, move |response| {
      // Ignore send errors - the watcher may have been dropped
      let _ = tx.send(response.clone());
    });

    let latest = {
      let _timeline = self.inner.lock_timeline();
      self.inner.cache.get(key).map(|entry| entry.response())
    };
    CacheWatcher::new(latest, rx, subscription)
  }

  /// Number of durable subscribers of `key`.
  pub fn subscriber_count(&self, key: &CacheKey) -> usize {
    self.inner.subscribers.count(key)
  }
}

impl<H, S> Inner<H, S>
where
  H: NetworkHandler,
  S: CacheStore<H::Data, H::Error>,
{
  fn lock_timeline(&self) -> MutexGuard<'_, ()> {
    self.timeline.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn key_for(&self, request: &H::Request, config: &QueryConfig) -> Result<CacheKey, KeyError> {
    self.cache.serialize(&fingerprint_input(request, config)?)
  }

  /// Caller must hold the timeline lock.
  fn lookup_or_create(&self, key: &CacheKey) -> CacheEntry<H::Data, H::Error> {
    match self.cache.get(key) {
      Some(entry) => entry,
      None => self.cache.set(key, CacheEntry::empty()),
    }
  }

  fn decide(&self, key: &CacheKey, config: &QueryConfig) -> Decision<H::Data, H::Error> {
    let _timeline = self.lock_timeline();
    let now = Instant::now();
    let entry = self.lookup_or_create(key);

    if should_make_request(&entry, config, now) {
      let stamp = AttemptStamp::new(self.next_attempt.fetch_add(1, Ordering::Relaxed), now);
      let entry = self.cache.set(key, entry.loading(stamp));
      let receiver = entry.waiters.push();
      self.subscribers.publish(key, entry.response());
      return Decision::Issue(Attempt {
        stamp,
        waiters: entry.waiters.clone(),
        receiver,
      });
    }

    if entry.is_loading {
      return Decision::Join(entry.waiters.push());
    }

    Decision::Hit(entry.response())
  }

  /// Record the outcome of the attempt `stamp`, unless a newer attempt was
  /// started meanwhile.
  fn settle(
    &self,
    key: &CacheKey,
    stamp: AttemptStamp,
    waiters: &WaiterQueue<H::Data, H::Error>,
    cache_expiry: Duration,
    outcome: Result<H::Data, H::Error>,
  ) {
    let failed = outcome.is_err();
    {
      let _timeline = self.lock_timeline();
      match self.cache.get(key) {
        Some(entry) if !entry.is_current(stamp) => {
          tracing::debug!(%key, attempt = stamp.seq(), "Discarding superseded response");
          hand_over(&entry, waiters);
        }
        current => {
          let base = current.unwrap_or_else(|| CacheEntry {
            last_request_at: Some(stamp),
            ..CacheEntry::empty()
          });
          let entry = self
            .cache
            .set(key, base.settled(outcome, Instant::now(), cache_expiry));
          let response = entry.response();

          let mut answered = waiters.flush(&response);
          if !entry.waiters.shares_queue_with(waiters) {
            answered += entry.waiters.flush(&response);
          }
          tracing::debug!(%key, attempt = stamp.seq(), failed, answered, "Request settled");
          self.subscribers.publish(key, response);
        }
      }
    }

    self.subscribers.deliver();
  }

  /// Clear the loading state of an attempt whose handler panicked.
  ///
  /// Its waiters are dropped unanswered and observe
  /// [`RequestError::Abandoned`].
  fn abandon(&self, key: &CacheKey, stamp: AttemptStamp, waiters: &WaiterQueue<H::Data, H::Error>) {
    tracing::error!(%key, attempt = stamp.seq(), "Network handler panicked");
    {
      let _timeline = self.lock_timeline();
      match self.cache.get(key) {
        Some(entry) if !entry.is_current(stamp) => {
          hand_over(&entry, waiters);
        }
        current => {
          let entry = current.unwrap_or_default();
          let entry = self.cache.set(
            key,
            CacheEntry {
              is_loading: false,
              ..entry
            },
          );
          waiters.abandon();
          if !entry.waiters.shares_queue_with(waiters) {
            entry.waiters.abandon();
          }
          self.subscribers.publish(key, entry.response());
        }
      }
    }

    self.subscribers.deliver();
  }
}

/// Pass the waiters of a superseded attempt on to the current one.
///
/// Normally both share one queue and there is nothing to do. If the store
/// replaced the entry meanwhile, the waiters move over, or get the current
/// answer right away when the newer attempt already settled.
fn hand_over<D: Clone, E: Clone>(current: &CacheEntry<D, E>, waiters: &WaiterQueue<D, E>) {
  if current.is_loading {
    current.waiters.absorb(waiters);
  } else {
    waiters.flush(&current.response());
  }
}

fn should_make_request<D, E>(entry: &CacheEntry<D, E>, config: &QueryConfig, now: Instant) -> bool {
  if config.ignore_cache {
    return true;
  }

  !entry.is_loading
    && (entry.is_expired(now) || (config.ignore_cache_on_errors && entry.error.is_some()))
}

async fn wait_for<D, E>(
  receiver: oneshot::Receiver<Outcome<D, E>>,
  wait_timeout: Option<Duration>,
) -> Result<QueryResponse<D, E>, RequestError<D, E>> {
  let outcome = match wait_timeout {
    Some(limit) => tokio::time::timeout(limit, receiver)
      .await
      .map_err(|_| RequestError::TimedOut(limit))?,
    None => receiver.await,
  };

  match outcome {
    Ok(Ok(response)) => Ok(response),
    Ok(Err(response)) => Err(RequestError::Failed(response)),
    // The attempt's task ended without answering
    Err(_) => Err(RequestError::Abandoned),
  }
}

impl<H: NetworkHandler, S> Clone for QueryClient<H, S> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<H: NetworkHandler, S> fmt::Debug for QueryClient<H, S> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueryClient")
      .field("config", &self.inner.config)
      .field("attempts", &self.inner.next_attempt.load(Ordering::Relaxed))
      .finish_non_exhaustive()
  }
}
