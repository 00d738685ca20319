//! Failure taxonomy for request resolution.
//!
//! Strategies return these so each fallback tier can tell a cache miss from a
//! dead network. Everything outside the strategy path uses `color_eyre::Result`.

use std::fmt::Display;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
  /// No cached snapshot for the request. Recoverable.
  #[error("no cached response for {url}")]
  CacheMiss { url: String },

  /// The network could not be reached. Recoverable via cache or the offline queue.
  #[error("network request to {url} failed: {reason}")]
  Network { url: String, reason: String },

  /// The request could not be built (bad method or header). Retrying or
  /// queueing it cannot help.
  #[error("invalid request to {url}: {reason}")]
  InvalidRequest { url: String, reason: String },

  /// Durable storage I/O failed.
  #[error("storage failure: {0}")]
  Storage(String),

  /// Terminal for one request; answered with a synthetic unavailable response.
  #[error("all strategies exhausted for {url}")]
  AllStrategiesExhausted { url: String },
}

impl WorkerError {
  pub fn network(url: impl Display, reason: impl Display) -> Self {
    Self::Network {
      url: url.to_string(),
      reason: reason.to_string(),
    }
  }

  pub fn invalid_request(url: impl Display, reason: impl Display) -> Self {
    Self::InvalidRequest {
      url: url.to_string(),
      reason: reason.to_string(),
    }
  }

  pub fn cache_miss(url: impl Display) -> Self {
    Self::CacheMiss {
      url: url.to_string(),
    }
  }

  pub fn is_network(&self) -> bool {
    matches!(self, Self::Network { .. })
  }
}

impl From<color_eyre::Report> for WorkerError {
  fn from(e: color_eyre::Report) -> Self {
    Self::Storage(format!("{:#}", e))
  }
}
