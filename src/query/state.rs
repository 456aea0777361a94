/// Public view of a cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResponse<D, E> {
  pub data: Option<D>,
  pub error: Option<E>,
  pub is_loading: bool,
}

impl<D, E> QueryResponse<D, E> {
  /// Project the response onto the query state machine.
  ///
  /// Loading takes precedence, so an entry refetching over stale data is
  /// `Loading`.
  pub fn state(&self) -> QueryState<&D, &E> {
    if self.is_loading {
      return QueryState::Loading;
    }
    match (&self.data, &self.error) {
      (_, Some(error)) => QueryState::Error(error),
      (Some(data), None) => QueryState::Success(data),
      (None, None) => QueryState::Idle,
    }
  }
}

/// The state of a query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState<T, E> {
  /// Nothing was fetched yet
  Idle,
  /// A network call is in flight
  Loading,
  /// The last call succeeded
  Success(T),
  /// The last call failed
  Error(E),
}

impl<T, E> QueryState<T, E> {
  pub fn is_loading(&self) -> bool {
    matches!(self, QueryState::Loading)
  }

  pub fn is_success(&self) -> bool {
    matches!(self, QueryState::Success(_))
  }

  pub fn is_error(&self) -> bool {
    matches!(self, QueryState::Error(_))
  }

  pub fn data(&self) -> Option<&T> {
    match self {
      QueryState::Success(data) => Some(data),
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&E> {
    match self {
      QueryState::Error(e) => Some(e),
      _ => None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn response(data: Option<u32>, error: Option<&'static str>, is_loading: bool) -> QueryResponse<u32, &'static str> {
    QueryResponse {
      data,
      error,
      is_loading,
    }
  }

  #[test]
  fn test_state_projection() {
    assert_eq!(response(None, None, false).state(), QueryState::Idle);
    assert_eq!(response(Some(1), None, false).state(), QueryState::Success(&1));
    assert_eq!(response(None, Some("boom"), false).state(), QueryState::Error(&"boom"));
    assert!(response(Some(1), None, true).state().is_loading());
  }

  #[test]
  fn test_state_accessors() {
    let ok = response(Some(7), None, false);
    let state = ok.state();
    assert!(state.is_success());
    assert_eq!(state.data(), Some(&&7));
    assert_eq!(state.error(), None);

    let failed = response(None, Some("boom"), false);
    assert!(failed.state().is_error());
    assert_eq!(failed.state().error(), Some(&&"boom"));
  }
}
