//! Channel-backed cache subscriptions for poll-driven consumers.
//!
//! A `CacheWatcher` is a durable subscription whose notifications land in a
//! channel instead of a callback, for event loops that redraw on a tick.
//!
//! # Example
//!
//! ```ignore
//! let mut watcher = client.watch(&client.cache_key(&films, &QueryOverrides::default())?);
//!
//! // In event loop tick
//! if watcher.poll() {
//!     // State changed, trigger re-render
//! }
//!
//! // In render
//! match watcher.state() {
//!     QueryState::Loading => render_spinner(),
//!     QueryState::Success(data) => render_data(data),
//!     QueryState::Error(e) => render_error(e),
//!     QueryState::Idle => {}
//! }
//! ```

use std::fmt;

use tokio::sync::mpsc;

use super::state::{QueryResponse, QueryState};
use super::subscribers::Subscription;
use crate::cache::CacheKey;

pub struct CacheWatcher<D, E> {
  latest: Option<QueryResponse<D, E>>,
  receiver: mpsc::UnboundedReceiver<QueryResponse<D, E>>,
  subscription: Subscription,
}

impl<D, E> CacheWatcher<D, E> {
  pub(crate) fn new(
    latest: Option<QueryResponse<D, E>>,
    receiver: mpsc::UnboundedReceiver<QueryResponse<D, E>>,
    subscription: Subscription,
  ) -> Self {
    Self {
      latest,
      receiver,
      subscription,
    }
  }

  pub fn key(&self) -> &CacheKey {
    self.subscription.key()
  }

  /// Last snapshot seen, if any.
  pub fn latest(&self) -> Option<&QueryResponse<D, E>> {
    self.latest.as_ref()
  }

  /// Current state as of the last poll.
  pub fn state(&self) -> QueryState<&D, &E> {
    self
      .latest
      .as_ref()
      .map_or(QueryState::Idle, QueryResponse::state)
  }

  /// Drain pending notifications without blocking.
  ///
  /// Returns `true` if at least one snapshot arrived.
  /// Call this in your event loop tick handler.
  pub fn poll(&mut self) -> bool {
    let mut changed = false;
    loop {
      match self.receiver.try_recv() {
        Ok(response) => {
          self.latest = Some(response);
          changed = true;
        }
        Err(mpsc::error::TryRecvError::Empty) => break,
        // The client went away; keep the last snapshot
        Err(mpsc::error::TryRecvError::Disconnected) => break,
      }
    }
    changed
  }

  /// Wait for the next snapshot.
  ///
  /// Returns `None` once the client is gone or the watcher unsubscribed and
  /// every pending snapshot was consumed.
  pub async fn changed(&mut self) -> Option<&QueryResponse<D, E>> {
    let response = self.receiver.recv().await?;
    self.latest = Some(response);
    self.latest.as_ref()
  }

  /// Stop receiving notifications. Snapshots already queued can still be
  /// polled.
  pub fn unsubscribe(&self) {
    self.subscription.unsubscribe();
  }
}

impl<D: fmt::Debug, E: fmt::Debug> fmt::Debug for CacheWatcher<D, E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CacheWatcher")
      .field("key", self.key())
      .field("latest", &self.latest)
      .finish_non_exhaustive()
  }
}
