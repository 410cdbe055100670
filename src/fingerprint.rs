//! Deterministic identifiers for cached resources.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Identifier of a cached resource, derived from its identity and query parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
  /// Derive a fingerprint from a resource name and its query parameters.
  ///
  /// Parameter order does not matter and surrounding whitespace is ignored, so
  /// `("users", [("page", "1"), ("sort", "name")])` and
  /// `(" users ", [("sort", "name"), ("page", " 1")])` produce the same fingerprint.
  pub fn new<K, V>(resource: &str, params: impl IntoIterator<Item = (K, V)>) -> Self
  where
    K: AsRef<str>,
    V: AsRef<str>,
  {
    let params: BTreeMap<String, String> = params
      .into_iter()
      .map(|(k, v)| (k.as_ref().trim().to_string(), v.as_ref().trim().to_string()))
      .collect();

    let mut input = resource.trim().to_string();
    if !params.is_empty() {
      let query: Vec<String> = params.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
      input.push('?');
      input.push_str(&query.join("&"));
    }

    Self::digest(&input)
  }

  /// Fingerprint of a resource without parameters.
  pub fn of_resource(resource: &str) -> Self {
    Self::new::<&str, &str>(resource, [])
  }

  /// Wrap an identifier that was already derived (e.g. read back from storage).
  pub fn from_raw(raw: impl Into<String>) -> Self {
    Self(raw.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  fn digest(input: &str) -> Self {
    // SHA256 hash for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    Self(hex::encode(hasher.finalize()))
  }
}

impl fmt::Display for Fingerprint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Typed query keys that know how to fingerprint themselves.
///
/// Implement this for an application's request enum so every call site derives the
/// same fingerprint for the same logical resource.
pub trait QueryKey {
  /// Logical resource name (e.g. `"users"`).
  fn resource(&self) -> String;

  /// Query parameters that distinguish variants of the resource.
  fn params(&self) -> Vec<(String, String)> {
    Vec::new()
  }

  fn fingerprint(&self) -> Fingerprint {
    Fingerprint::new(&self.resource(), self.params())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_param_order_is_irrelevant() {
    let a = Fingerprint::new("users", [("page", "1"), ("sort", "name")]);
    let b = Fingerprint::new(" users ", [("sort", "name"), ("page", " 1")]);
    assert_eq!(a, b);
  }

  #[test]
  fn test_params_distinguish_resources() {
    let a = Fingerprint::new("users", [("page", "1")]);
    let b = Fingerprint::new("users", [("page", "2")]);
    assert_ne!(a, b);
    assert_ne!(a, Fingerprint::of_resource("users"));
  }

  #[test]
  fn test_fixed_length_hex() {
    let fp = Fingerprint::of_resource("users/1");
    assert_eq!(fp.as_str().len(), 64);
    assert!(fp.as_str().chars().all(|c| c.is_ascii_hexdigit()));
  }

  #[test]
  fn test_query_key_trait() {
    enum ApiKey {
      User { id: u64 },
    }

    impl QueryKey for ApiKey {
      fn resource(&self) -> String {
        match self {
          Self::User { .. } => "user".to_string(),
        }
      }

      fn params(&self) -> Vec<(String, String)> {
        match self {
          Self::User { id } => vec![("id".to_string(), id.to_string())],
        }
      }
    }

    assert_eq!(
      ApiKey::User { id: 7 }.fingerprint(),
      Fingerprint::new("user", [("id", "7")])
    );
  }
}
