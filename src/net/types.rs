//! Request and response values that cross the network boundary.

use serde::{Deserialize, Serialize};
use url::Url;

/// How the page issued the request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequestMode {
  /// Top-level navigation (the page itself)
  Navigate,
  /// Subresource or script-initiated request
  #[default]
  Other,
}

/// An intercepted request.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: String,
  pub url: Url,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
  pub mode: RequestMode,
}

impl Request {
  /// A plain GET request.
  pub fn get(url: Url) -> Self {
    Self {
      method: "GET".to_string(),
      url,
      headers: Vec::new(),
      body: None,
      mode: RequestMode::Other,
    }
  }

  /// A GET request issued as a page navigation.
  pub fn navigate(url: Url) -> Self {
    Self {
      mode: RequestMode::Navigate,
      ..Self::get(url)
    }
  }

  pub fn with_method(mut self, method: &str) -> Self {
    self.method = method.to_ascii_uppercase();
    self
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = Some(body.into());
    self
  }

  /// Look up a header value (case-insensitive name match).
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  pub fn is_get(&self) -> bool {
    self.method.eq_ignore_ascii_case("GET")
  }

  pub fn is_navigation(&self) -> bool {
    self.mode == RequestMode::Navigate
  }

  /// Only http(s) requests are intercepted; everything else passes through.
  pub fn is_http(&self) -> bool {
    matches!(self.url.scheme(), "http" | "https")
  }
}

/// Immutable copy of a response.
///
/// Snapshots are plain owned values: storing one in a partition copies it, so a
/// body is never consumed twice and no two partitions share a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseSnapshot {
  pub status: u16,
  pub status_text: String,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl ResponseSnapshot {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    let status_text = reqwest::StatusCode::from_u16(status)
      .ok()
      .and_then(|s| s.canonical_reason())
      .unwrap_or_default()
      .to_string();

    Self {
      status,
      status_text,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// True for 2xx statuses.
  pub fn is_ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn body_text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }

  /// Synthetic response returned when every fallback tier is exhausted.
  pub fn unavailable() -> Self {
    Self::new(503, "Offline").with_header("content-type", "text/plain")
  }

  /// Synthetic response telling the page its mutation was queued, not delivered.
  pub fn queued(action_id: &str) -> Self {
    let body = serde_json::json!({ "queued": true, "id": action_id });
    Self::new(202, body.to_string())
      .with_header("content-type", "application/json")
      .with_header(QUEUED_HEADER, action_id)
  }
}

/// Header carrying the offline action id on a queued reply.
pub const QUEUED_HEADER: &str = "x-offline-queued";
