//! The network handler contract.

use futures::future::BoxFuture;
use serde::Serialize;

/// Performs one network operation for a request.
///
/// Implementations only perform the call: no retries, no caching, no
/// interpretation of failures. The returned future must own what it needs
/// (clone the client into it), because the query client drives it on a
/// spawned task that outlives the caller.
///
/// # Example
///
/// ```ignore
/// impl NetworkHandler for GraphQlHandler {
///   type Request = GraphQlRequest;
///   type Data = serde_json::Value;
///   type Error = String;
///
///   fn request(&self, request: &GraphQlRequest) -> BoxFuture<'static, Result<Value, String>> {
///     let http = self.http.clone();
///     let body = serde_json::json!({ "query": request.query, "variables": request.variables });
///     Box::pin(async move {
///       let response = http.post(&body).await.map_err(|e| e.to_string())?;
///       response.json().await.map_err(|e| e.to_string())
///     })
///   }
/// }
/// ```
pub trait NetworkHandler: Send + Sync + 'static {
  /// Request description. Fingerprinted to build cache keys.
  type Request: Serialize;
  /// Raw response payload.
  type Data: Clone + Send + Sync + 'static;
  /// Transport or application failure. Cached and handed to every waiter as is.
  type Error: Clone + Send + Sync + 'static;

  /// Start the network call for `request`.
  fn request(&self, request: &Self::Request) -> BoxFuture<'static, Result<Self::Data, Self::Error>>;
}
