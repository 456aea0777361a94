//! Cache entries and the transient waiter queue attached to them.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::query::QueryResponse;

/// What a waiter receives once the attempt it is waiting on settles.
///
/// `Err` still carries the full response, so callers can branch on `error`
/// without a second unwrap.
pub type Outcome<D, E> = Result<QueryResponse<D, E>, QueryResponse<D, E>>;

/// Initiation stamp of a network attempt.
///
/// Stamps order by issue sequence first, so two attempts started within the
/// same clock tick still compare strictly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AttemptStamp {
  seq: u64,
  at: Instant,
}

impl AttemptStamp {
  pub(crate) fn new(seq: u64, at: Instant) -> Self {
    Self { seq, at }
  }

  /// Position of the attempt in issue order.
  pub fn seq(&self) -> u64 {
    self.seq
  }

  /// When the attempt was issued.
  pub fn at(&self) -> Instant {
    self.at
  }
}

/// Callers blocked on the outcome of the in-flight attempt for a key.
///
/// Clones share one queue, so copy-on-write updates of an entry keep the
/// same waiters attached.
pub struct WaiterQueue<D, E> {
  senders: Arc<Mutex<Vec<oneshot::Sender<Outcome<D, E>>>>>,
}

impl<D, E> WaiterQueue<D, E> {
  fn lock(&self) -> MutexGuard<'_, Vec<oneshot::Sender<Outcome<D, E>>>> {
    self.senders.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Enqueue a new waiter and hand back its receiving end.
  pub(crate) fn push(&self) -> oneshot::Receiver<Outcome<D, E>> {
    let (tx, rx) = oneshot::channel();
    self.lock().push(tx);
    rx
  }

  /// Move every waiter of `other` onto this queue.
  pub(crate) fn absorb(&self, other: &Self) {
    if self.shares_queue_with(other) {
      return;
    }
    let moved = std::mem::take(&mut *other.lock());
    self.lock().extend(moved);
  }

  /// Drop every waiter without answering it.
  pub(crate) fn abandon(&self) -> usize {
    let dropped = std::mem::take(&mut *self.lock());
    dropped.len()
  }

  /// Number of callers currently waiting.
  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Whether both handles point at the same underlying queue.
  pub fn shares_queue_with(&self, other: &Self) -> bool {
    Arc::ptr_eq(&self.senders, &other.senders)
  }
}

impl<D: Clone, E: Clone> WaiterQueue<D, E> {
  /// Answer and remove every waiter: resolved when `response` holds no
  /// error, rejected with the response otherwise.
  ///
  /// Returns how many waiters were answered.
  pub(crate) fn flush(&self, response: &QueryResponse<D, E>) -> usize {
    let waiters = std::mem::take(&mut *self.lock());
    let count = waiters.len();
    for tx in waiters {
      let outcome = if response.error.is_some() {
        Err(response.clone())
      } else {
        Ok(response.clone())
      };
      // Ignore send errors - the caller may have stopped waiting
      let _ = tx.send(outcome);
    }
    count
  }
}

impl<D, E> Clone for WaiterQueue<D, E> {
  fn clone(&self) -> Self {
    Self {
      senders: Arc::clone(&self.senders),
    }
  }
}

impl<D, E> Default for WaiterQueue<D, E> {
  fn default() -> Self {
    Self {
      senders: Arc::new(Mutex::new(Vec::new())),
    }
  }
}

impl<D, E> fmt::Debug for WaiterQueue<D, E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("WaiterQueue")
      .field("waiting", &self.len())
      .finish()
  }
}

/// The cache's full record for one key.
///
/// `data` and `error` are never both populated: a settled attempt writes
/// exactly one of them, and both are empty before the first attempt.
#[derive(Debug, Clone)]
pub struct CacheEntry<D, E> {
  /// Last successful payload
  pub data: Option<D>,
  /// Last failure payload
  pub error: Option<E>,
  /// A network attempt for this key is outstanding
  pub is_loading: bool,
  /// The entry is fresh while `now < expires_at`; `None` means never fetched
  pub expires_at: Option<Instant>,
  /// Stamp of the most recently initiated attempt
  pub last_request_at: Option<AttemptStamp>,
  /// When the most recent attempt completed
  pub last_response_at: Option<Instant>,
  /// Callers waiting on the in-flight attempt
  pub waiters: WaiterQueue<D, E>,
}

impl<D, E> Default for CacheEntry<D, E> {
  fn default() -> Self {
    Self::empty()
  }
}

impl<D, E> CacheEntry<D, E> {
  /// An entry that was never fetched: no payload, not loading, expired.
  pub fn empty() -> Self {
    Self {
      data: None,
      error: None,
      is_loading: false,
      expires_at: None,
      last_request_at: None,
      last_response_at: None,
      waiters: WaiterQueue::default(),
    }
  }

  pub fn is_expired(&self, now: Instant) -> bool {
    self.expires_at.map_or(true, |expires_at| now >= expires_at)
  }

  pub fn is_fresh(&self, now: Instant) -> bool {
    !self.is_expired(now)
  }

  /// Whether `stamp` belongs to the most recently initiated attempt.
  ///
  /// An entry that never saw an attempt treats any stamp as current.
  pub fn is_current(&self, stamp: AttemptStamp) -> bool {
    self
      .last_request_at
      .map_or(true, |latest| latest <= stamp)
  }
}

impl<D: Clone, E: Clone> CacheEntry<D, E> {
  /// Public view of this entry.
  pub fn response(&self) -> QueryResponse<D, E> {
    QueryResponse {
      data: self.data.clone(),
      error: self.error.clone(),
      is_loading: self.is_loading,
    }
  }

  /// Copy of this entry marked as loading for the attempt `stamp`.
  ///
  /// The previous payload stays visible while the attempt is in flight.
  pub(crate) fn loading(&self, stamp: AttemptStamp) -> Self {
    Self {
      is_loading: true,
      last_request_at: Some(stamp),
      ..self.clone()
    }
  }

  /// Copy of this entry holding the outcome of a settled attempt.
  pub(crate) fn settled(&self, outcome: Result<D, E>, now: Instant, cache_expiry: Duration) -> Self {
    let (data, error) = match outcome {
      Ok(data) => (Some(data), None),
      Err(error) => (None, Some(error)),
    };
    Self {
      data,
      error,
      is_loading: false,
      expires_at: Some(now + cache_expiry),
      last_response_at: Some(now),
      ..self.clone()
    }
  }
}
