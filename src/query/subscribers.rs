//! Durable per-key observers.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use super::state::QueryResponse;
use crate::cache::CacheKey;

/// Observer callback for every state change of a key.
pub type Callback<D, E> = Arc<dyn Fn(&QueryResponse<D, E>) + Send + Sync>;

type Registry<D, E> = HashMap<CacheKey, Vec<(u64, Callback<D, E>)>>;

/// Snapshots published but not yet delivered, in publish order.
struct Outbox<D, E> {
  pending: VecDeque<(CacheKey, QueryResponse<D, E>)>,
  /// Some thread is delivering from `pending`
  draining: bool,
}

/// Observers registered per cache key.
///
/// Unlike entry waiters, these outlive any single request and see every
/// transition (loading, settled) until they unsubscribe.
pub(crate) struct Subscribers<D, E> {
  next_id: AtomicU64,
  by_key: Mutex<Registry<D, E>>,
  outbox: Mutex<Outbox<D, E>>,
}

impl<D, E> Subscribers<D, E> {
  pub(crate) fn new() -> Self {
    Self {
      next_id: AtomicU64::new(0),
      by_key: Mutex::new(HashMap::new()),
      outbox: Mutex::new(Outbox {
        pending: VecDeque::new(),
        draining: false,
      }),
    }
  }

  fn lock(&self) -> MutexGuard<'_, Registry<D, E>> {
    self.by_key.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn lock_outbox(&self) -> MutexGuard<'_, Outbox<D, E>> {
    self.outbox.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Queue a snapshot for delivery.
  ///
  /// Called while the entry change it describes is still under the client's
  /// timeline lock, so the queue follows the timeline.
  pub(crate) fn publish(&self, key: &CacheKey, response: QueryResponse<D, E>) {
    self.lock_outbox().pending.push_back((key.clone(), response));
  }

  /// Deliver queued snapshots in publish order.
  ///
  /// Only one thread delivers at a time. If another thread (or a callback
  /// further up this stack) is already delivering, it also picks up whatever
  /// was queued here, and this returns right away.
  pub(crate) fn deliver(&self) {
    {
      let mut outbox = self.lock_outbox();
      if outbox.draining {
        return;
      }
      outbox.draining = true;
    }

    let _reset = ResetOnPanic(&self.outbox);
    loop {
      let next = {
        let mut outbox = self.lock_outbox();
        match outbox.pending.pop_front() {
          Some(next) => next,
          None => {
            outbox.draining = false;
            return;
          }
        }
      };
      self.notify(&next.0, &next.1);
    }
  }

  /// Call every observer of `key`, in registration order.
  ///
  /// Callbacks run outside the registry lock, so they may subscribe or
  /// unsubscribe themselves.
  fn notify(&self, key: &CacheKey, response: &QueryResponse<D, E>) {
    let callbacks: Vec<Callback<D, E>> = match self.lock().get(key) {
      Some(subscribers) => subscribers.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
      None => return,
    };
    for callback in callbacks {
      callback(response);
    }
  }

  pub(crate) fn count(&self, key: &CacheKey) -> usize {
    self.lock().get(key).map_or(0, Vec::len)
  }

  fn remove(&self, key: &CacheKey, id: u64) {
    let mut by_key = self.lock();
    if let Some(subscribers) = by_key.get_mut(key) {
      subscribers.retain(|(existing, _)| *existing != id);
      if subscribers.is_empty() {
        by_key.remove(key);
      }
    }
  }
}

impl<D: Send + 'static, E: Send + 'static> Subscribers<D, E> {
  pub(crate) fn subscribe(self: &Arc<Self>, key: &CacheKey, callback: Callback<D, E>) -> Subscription {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    self
      .lock()
      .entry(key.clone())
      .or_default()
      .push((id, callback));

    let registry: Weak<dyn Detach> = Arc::downgrade(self) as Weak<dyn Detach>;
    Subscription {
      key: key.clone(),
      id,
      registry,
    }
  }
}

/// Lets the next `deliver` take over if a callback panicked mid-drain.
struct ResetOnPanic<'a, D, E>(&'a Mutex<Outbox<D, E>>);

impl<D, E> Drop for ResetOnPanic<'_, D, E> {
  fn drop(&mut self) {
    if std::thread::panicking() {
      self.0.lock().unwrap_or_else(PoisonError::into_inner).draining = false;
    }
  }
}

trait Detach: Send + Sync {
  fn detach(&self, key: &CacheKey, id: u64);
}

impl<D: Send, E: Send> Detach for Subscribers<D, E> {
  fn detach(&self, key: &CacheKey, id: u64) {
    self.remove(key, id);
  }
}

/// Handle to a durable subscription.
///
/// Dropping the handle does not unsubscribe; call
/// [`unsubscribe`](Subscription::unsubscribe) to stop notifications.
#[must_use = "a subscription can only be removed through its handle"]
pub struct Subscription {
  key: CacheKey,
  id: u64,
  registry: Weak<dyn Detach>,
}

impl Subscription {
  /// The key this subscription observes.
  pub fn key(&self) -> &CacheKey {
    &self.key
  }

  /// Stop notifications. Safe to call any number of times, also after the
  /// client is gone.
  pub fn unsubscribe(&self) {
    if let Some(registry) = self.registry.upgrade() {
      registry.detach(&self.key, self.id);
    }
  }
}

impl fmt::Debug for Subscription {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Subscription")
      .field("key", &self.key)
      .field("id", &self.id)
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn loading() -> QueryResponse<u32, String> {
    QueryResponse {
      data: None,
      error: None,
      is_loading: true,
    }
  }

  #[test]
  fn test_notify_in_registration_order() {
    let subscribers: Arc<Subscribers<u32, String>> = Arc::new(Subscribers::new());
    let key = CacheKey::new("films");
    let seen = Arc::new(Mutex::new(Vec::new()));

    let _subscriptions: Vec<Subscription> = (0..3)
      .map(|i| {
        let seen = Arc::clone(&seen);
        subscribers.subscribe(&key, Arc::new(move |_: &QueryResponse<u32, String>| seen.lock().unwrap().push(i)))
      })
      .collect();

    subscribers.notify(&key, &loading());
    assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);

    // Other keys are not notified
    subscribers.notify(&CacheKey::new("other"), &loading());
    assert_eq!(seen.lock().unwrap().len(), 3);
  }

  #[test]
  fn test_unsubscribe_is_idempotent() {
    let subscribers: Arc<Subscribers<u32, String>> = Arc::new(Subscribers::new());
    let key = CacheKey::new("films");
    let first = subscribers.subscribe(&key, Arc::new(|_: &QueryResponse<u32, String>| {}));
    let second = subscribers.subscribe(&key, Arc::new(|_: &QueryResponse<u32, String>| {}));
    assert_eq!(subscribers.count(&key), 2);

    first.unsubscribe();
    first.unsubscribe();
    assert_eq!(subscribers.count(&key), 1);

    second.unsubscribe();
    assert_eq!(subscribers.count(&key), 0);
    assert!(subscribers.lock().is_empty());
  }

  #[test]
  fn test_deliver_keeps_publish_order() {
    let subscribers: Arc<Subscribers<u32, String>> = Arc::new(Subscribers::new());
    let key = CacheKey::new("films");
    let seen = Arc::new(Mutex::new(Vec::new()));

    let _subscription = {
      let seen = Arc::clone(&seen);
      subscribers.subscribe(
        &key,
        Arc::new(move |response: &QueryResponse<u32, String>| seen.lock().unwrap().push(response.data)),
      )
    };

    subscribers.publish(&key, loading());
    subscribers.publish(
      &key,
      QueryResponse {
        data: Some(1),
        error: None,
        is_loading: false,
      },
    );
    assert!(seen.lock().unwrap().is_empty());

    subscribers.deliver();
    assert_eq!(*seen.lock().unwrap(), vec![None, Some(1)]);
    assert!(subscribers.lock_outbox().pending.is_empty());
    assert!(!subscribers.lock_outbox().draining);
  }

  #[test]
  fn test_nested_publish_is_delivered_after_current_snapshot() {
    let subscribers: Arc<Subscribers<u32, String>> = Arc::new(Subscribers::new());
    let key = CacheKey::new("films");
    let seen = Arc::new(Mutex::new(Vec::new()));

    let _subscription = {
      let seen = Arc::clone(&seen);
      let registry = Arc::downgrade(&subscribers);
      let follow_up = key.clone();
      subscribers.subscribe(
        &key,
        Arc::new(move |response: &QueryResponse<u32, String>| {
          seen.lock().unwrap().push(response.is_loading);
          // A callback that starts another request publishes while delivering
          if response.is_loading {
            if let Some(registry) = registry.upgrade() {
              registry.publish(
                &follow_up,
                QueryResponse {
                  data: Some(2),
                  error: None,
                  is_loading: false,
                },
              );
              registry.deliver();
              assert_eq!(seen.lock().unwrap().len(), 1);
            }
          }
        }),
      )
    };

    subscribers.publish(&key, loading());
    subscribers.deliver();
    assert_eq!(*seen.lock().unwrap(), vec![true, false]);
  }

  #[test]
  fn test_unsubscribe_after_registry_dropped() {
    let subscribers: Arc<Subscribers<u32, String>> = Arc::new(Subscribers::new());
    let subscription = subscribers.subscribe(&CacheKey::new("films"), Arc::new(|_: &QueryResponse<u32, String>| {}));
    drop(subscribers);
    subscription.unsubscribe();
  }

  #[test]
  fn test_callback_may_unsubscribe_itself() {
    let subscribers: Arc<Subscribers<u32, String>> = Arc::new(Subscribers::new());
    let key = CacheKey::new("films");
    let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
    let calls = Arc::new(AtomicU64::new(0));

    let subscription = {
      let slot = Arc::clone(&slot);
      let calls = Arc::clone(&calls);
      subscribers.subscribe(
        &key,
        Arc::new(move |_: &QueryResponse<u32, String>| {
          calls.fetch_add(1, Ordering::SeqCst);
          if let Some(subscription) = slot.lock().unwrap().as_ref() {
            subscription.unsubscribe();
          }
        }),
      )
    };
    *slot.lock().unwrap() = Some(subscription);

    subscribers.notify(&key, &loading());
    subscribers.notify(&key, &loading());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(subscribers.count(&key), 0);
  }
}
