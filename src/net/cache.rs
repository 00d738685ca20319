//! Request identity used as the cache key.

use sha2::{Digest, Sha256};
use url::Url;

use super::types::Request;

/// Normalized identity of a request: method plus URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
  method: String,
  url: String,
}

impl RequestKey {
  pub fn for_request(request: &Request) -> Self {
    Self {
      method: request.method.to_ascii_uppercase(),
      url: normalize_url(&request.url),
    }
  }

  /// Identity of a GET for `url`.
  pub fn get(url: &Url) -> Self {
    Self {
      method: "GET".to_string(),
      url: normalize_url(url),
    }
  }

  pub fn url(&self) -> &str {
    &self.url
  }

  /// Stable fixed-length storage key.
  pub fn cache_hash(&self) -> String {
    // SHA256 hash for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// Fragments never reach the server, so they don't distinguish responses.
fn normalize_url(url: &Url) -> String {
  let mut url = url.clone();
  url.set_fragment(None);
  url.to_string()
}
