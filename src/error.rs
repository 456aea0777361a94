use std::time::Duration;

use thiserror::Error;

use crate::query::QueryResponse;

/// A request could not be turned into a cache key.
#[derive(Debug, Error)]
pub enum KeyError {
  /// The request or config has no JSON representation (e.g. a map with
  /// non-string keys).
  #[error("failed to render request fingerprint: {0}")]
  Render(#[from] serde_json::Error),
}

/// Why a request did not resolve with a response.
#[derive(Debug, Error)]
pub enum RequestError<D, E> {
  /// The network handler failed.
  ///
  /// Carries the settled response, so the handler's error is in
  /// `response.error` and `data` is empty.
  #[error("request failed")]
  Failed(QueryResponse<D, E>),
  #[error(transparent)]
  Key(#[from] KeyError),
  /// The caller's wait deadline elapsed. The attempt itself keeps running
  /// and still settles the cache.
  #[error("gave up waiting for the response after {0:?}")]
  TimedOut(Duration),
  /// The attempt ended without producing an outcome, e.g. because the
  /// network handler panicked.
  #[error("request was abandoned before it settled")]
  Abandoned,
}

impl<D, E> RequestError<D, E> {
  /// The settled response carried by a failed request.
  pub fn response(&self) -> Option<&QueryResponse<D, E>> {
    match self {
      Self::Failed(response) => Some(response),
      _ => None,
    }
  }

  /// The network handler's error, if that is what failed the request.
  pub fn handler_error(&self) -> Option<&E> {
    self.response().and_then(|response| response.error.as_ref())
  }

  pub fn into_response(self) -> Option<QueryResponse<D, E>> {
    match self {
      Self::Failed(response) => Some(response),
      _ => None,
    }
  }
}
