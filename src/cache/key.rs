//! Deterministic fingerprints for requests.

use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use super::traits::CacheKey;
use crate::config::QueryConfig;
use crate::error::KeyError;

/// Config fields that only affect how one caller waits, not what is fetched.
const CALLER_FIELDS: &[&str] = &["wait_timeout"];

/// Fingerprint `value` as the SHA-256 of its canonical JSON rendering.
pub fn fingerprint<T: Serialize + ?Sized>(value: &T) -> Result<CacheKey, KeyError> {
  let value = serde_json::to_value(value)?;

  // SHA256 hash for stable, fixed-length keys
  let mut hasher = Sha256::new();
  hasher.update(canonical_json(&value).as_bytes());
  Ok(CacheKey::new(hex::encode(hasher.finalize())))
}

/// Build the value a request is fingerprinted from.
///
/// The request's fields come first and the effective query config is laid
/// over them, so a config field wins over a request field of the same name.
/// Per-caller fields such as `wait_timeout` are left out, so callers that
/// only differ in how long they wait share one slot. A request that does not
/// serialize to an object is kept under `"request"`.
pub fn fingerprint_input<R: Serialize + ?Sized>(
  request: &R,
  config: &QueryConfig,
) -> Result<Value, KeyError> {
  let mut merged = match serde_json::to_value(request)? {
    Value::Object(fields) => fields,
    other => {
      let mut fields = Map::new();
      fields.insert("request".to_string(), other);
      fields
    }
  };

  if let Value::Object(mut config) = serde_json::to_value(config)? {
    for field in CALLER_FIELDS {
      config.remove(*field);
    }
    merged.extend(config);
  }

  Ok(Value::Object(merged))
}

/// Render `value` as compact JSON with object keys sorted at every depth.
///
/// Sorting happens here rather than relying on `serde_json`'s map type, which
/// keeps insertion order when the `preserve_order` feature is enabled.
pub fn canonical_json(value: &Value) -> String {
  let mut out = String::new();
  write_canonical(value, &mut out);
  out
}

fn write_canonical(value: &Value, out: &mut String) {
  match value {
    Value::Object(fields) => {
      let mut fields: Vec<_> = fields.iter().collect();
      fields.sort_by(|(a, _), (b, _)| a.cmp(b));

      out.push('{');
      for (i, (name, field)) in fields.into_iter().enumerate() {
        if i > 0 {
          out.push(',');
        }
        out.push_str(&Value::String(name.clone()).to_string());
        out.push(':');
        write_canonical(field, out);
      }
      out.push('}');
    }
    Value::Array(items) => {
      out.push('[');
      for (i, item) in items.iter().enumerate() {
        if i > 0 {
          out.push(',');
        }
        write_canonical(item, out);
      }
      out.push(']');
    }
    scalar => out.push_str(&scalar.to_string()),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use std::collections::{BTreeMap, HashMap};
  use std::time::Duration;

  #[test]
  fn test_canonical_json_sorts_keys() {
    let value = json!({"b": [true, null, {"z": 1, "y": "\"q\""}], "a": 1.5});
    assert_eq!(
      canonical_json(&value),
      r#"{"a":1.5,"b":[true,null,{"y":"\"q\"","z":1}]}"#
    );
  }

  #[test]
  fn test_fingerprint_ignores_insertion_order() {
    let mut forward = Map::new();
    forward.insert("query".into(), json!("{ allFilms { title } }"));
    forward.insert("variables".into(), json!({"first": 3, "after": "x"}));

    let mut backward = Map::new();
    backward.insert("variables".into(), json!({"after": "x", "first": 3}));
    backward.insert("query".into(), json!("{ allFilms { title } }"));

    assert_eq!(
      fingerprint(&Value::Object(forward)).unwrap(),
      fingerprint(&Value::Object(backward)).unwrap()
    );
  }

  #[test]
  fn test_fingerprint_hash_map_variables() {
    let variables: HashMap<String, u32> = (0..32).map(|i| (format!("v{i}"), i)).collect();
    let sorted: BTreeMap<String, u32> = variables.clone().into_iter().collect();

    assert_eq!(
      fingerprint(&variables).unwrap(),
      fingerprint(&sorted).unwrap()
    );
  }

  #[test]
  fn test_fingerprint_distinguishes_values() {
    let a = fingerprint(&json!({"query": "films", "variables": {"id": 1}})).unwrap();
    let b = fingerprint(&json!({"query": "films", "variables": {"id": 2}})).unwrap();
    let c = fingerprint(&json!({"query": "films", "variables": {"id": "1"}})).unwrap();

    assert_ne!(a, b);
    assert_ne!(a, c);
    assert_eq!(a.as_str().len(), 64);
    assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
  }

  #[test]
  fn test_fingerprint_rejects_non_string_map_keys() {
    let mut map = HashMap::new();
    map.insert((1, 2), "pair");
    assert!(fingerprint(&map).is_err());
  }

  #[test]
  fn test_fingerprint_input_lays_config_over_request() {
    let config = QueryConfig {
      cache_expiry: Duration::from_secs(30),
      ..QueryConfig::default()
    };
    let input = fingerprint_input(&json!({"query": "films", "ignore_cache": "x"}), &config).unwrap();

    assert_eq!(input["query"], json!("films"));
    assert_eq!(input["ignore_cache"], json!(false));
    assert_eq!(input["cache_expiry"], json!("30s"));
  }

  #[test]
  fn test_fingerprint_input_skips_wait_timeout() {
    let config = QueryConfig {
      wait_timeout: Some(Duration::from_secs(60)),
      ..QueryConfig::default()
    };
    let input = fingerprint_input(&json!({"query": "films"}), &config).unwrap();
    assert!(input.get("wait_timeout").is_none());

    assert_eq!(
      fingerprint(&input).unwrap(),
      fingerprint(&fingerprint_input(&json!({"query": "films"}), &QueryConfig::default()).unwrap()).unwrap()
    );
  }

  #[test]
  fn test_fingerprint_input_wraps_scalar_request() {
    let input = fingerprint_input("films", &QueryConfig::default()).unwrap();
    assert_eq!(input["request"], json!("films"));
    assert_eq!(input["error_retry_count"], json!(3));
  }
}
