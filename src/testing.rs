//! Shared fixtures for the unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tracing_subscriber::{fmt, EnvFilter};

use crate::cache::MemoryStore;
use crate::config::QueryOverrides;
use crate::network::NetworkHandler;
use crate::query::{QueryClient, QueryResponse};

pub(crate) type TestClient = QueryClient<ScriptedHandler, MemoryStore<Value, String>>;

/// Route crate logs to the test output.
pub(crate) fn setup() {
  fmt()
    .with_env_filter(EnvFilter::new("query_cache=trace"))
    .with_target(false)
    .with_test_writer()
    .try_init()
    .ok();
}

pub(crate) fn client(handler: ScriptedHandler) -> TestClient {
  client_with(QueryOverrides::default(), handler)
}

pub(crate) fn client_with(config: QueryOverrides, handler: ScriptedHandler) -> TestClient {
  setup();
  QueryClient::new(config, MemoryStore::new(), handler)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct GraphQlRequest {
  pub query: String,
  pub variables: HashMap<String, Value>,
}

pub(crate) fn films() -> GraphQlRequest {
  GraphQlRequest {
    query: "query { allFilms { films { title } } }".to_string(),
    variables: HashMap::new(),
  }
}

pub(crate) fn film(id: &str) -> GraphQlRequest {
  GraphQlRequest {
    query: "query Film($id: ID!) { film(id: $id) { title } }".to_string(),
    variables: HashMap::from([("id".to_string(), json!(id))]),
  }
}

pub(crate) fn title(title: &str) -> Value {
  json!({ "title": title })
}

/// Collects every snapshot a durable subscriber receives.
pub(crate) fn recorder() -> (
  Arc<Mutex<Vec<QueryResponse<Value, String>>>>,
  impl Fn(&QueryResponse<Value, String>) + Send + Sync + 'static,
) {
  let seen = Arc::new(Mutex::new(Vec::new()));
  let sink = Arc::clone(&seen);
  let callback = move |response: &QueryResponse<Value, String>| {
    sink.lock().unwrap().push(response.clone());
  };
  (seen, callback)
}

enum Script {
  /// Calls stay in flight until released by index
  Manual,
  Reply {
    outcome: Result<Value, String>,
    delay: Duration,
  },
}

/// Network handler whose answers are decided by the test.
pub(crate) struct ScriptedHandler {
  script: Script,
  calls: AtomicUsize,
  pending: Mutex<HashMap<usize, oneshot::Sender<Result<Value, String>>>>,
}

impl ScriptedHandler {
  pub(crate) fn manual() -> Self {
    Self::new(Script::Manual)
  }

  /// Every call resolves with `outcome`.
  pub(crate) fn replying(outcome: Result<Value, String>) -> Self {
    Self::new(Script::Reply {
      outcome,
      delay: Duration::ZERO,
    })
  }

  pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
    if let Script::Reply { delay: d, .. } = &mut self.script {
      *d = delay;
    }
    self
  }

  fn new(script: Script) -> Self {
    Self {
      script,
      calls: AtomicUsize::new(0),
      pending: Mutex::new(HashMap::new()),
    }
  }

  /// Number of network calls issued so far.
  pub(crate) fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }

  /// Settle the manual call with index `call`.
  pub(crate) fn release(&self, call: usize, outcome: Result<Value, String>) {
    let tx = self
      .pending
      .lock()
      .unwrap()
      .remove(&call)
      .expect("call was never issued or already settled");
    let _ = tx.send(outcome);
  }

  /// Make the manual call with index `call` panic.
  pub(crate) fn abort(&self, call: usize) {
    self.pending.lock().unwrap().remove(&call);
  }
}

impl NetworkHandler for ScriptedHandler {
  type Request = GraphQlRequest;
  type Data = Value;
  type Error = String;

  fn request(&self, _request: &GraphQlRequest) -> BoxFuture<'static, Result<Value, String>> {
    let call = self.calls.fetch_add(1, Ordering::SeqCst);
    match &self.script {
      Script::Manual => {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(call, tx);
        Box::pin(async move {
          match rx.await {
            Ok(outcome) => outcome,
            Err(_) => panic!("scripted call {call} was aborted"),
          }
        })
      }
      Script::Reply { outcome, delay } => {
        let outcome = outcome.clone();
        let delay = *delay;
        Box::pin(async move {
          if !delay.is_zero() {
            tokio::time::sleep(delay).await;
          }
          outcome
        })
      }
    }
  }
}
