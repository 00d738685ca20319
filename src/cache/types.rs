//! Core types for the caching system.

use tokio::task::JoinHandle;

use crate::net::ResponseSnapshot;

/// Resolution policy for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  CacheFirst,
  NetworkFirst,
  StaleWhileRevalidate,
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Served from the strategy's partition without touching the network
  Cache,
  /// Offline mode - network unavailable, serving cached data
  Offline,
  /// Found by the fallback chain in some partition, or the document shell
  Fallback,
  /// Synthetic 503, nothing else was available
  Unavailable,
  /// Mutating request captured into the offline queue
  Queued,
}

/// A response plus metadata about how it was obtained.
#[derive(Debug)]
pub struct Resolved {
  /// The response handed back to the page
  pub response: ResponseSnapshot,
  /// Where the response came from
  pub source: CacheSource,
  /// Background refresh started by stale-while-revalidate, if any
  pub revalidation: Option<JoinHandle<()>>,
}

impl Resolved {
  pub fn new(response: ResponseSnapshot, source: CacheSource) -> Self {
    Self {
      response,
      source,
      revalidation: None,
    }
  }

  pub fn from_network(response: ResponseSnapshot) -> Self {
    Self::new(response, CacheSource::Network)
  }

  pub fn from_cache(response: ResponseSnapshot) -> Self {
    Self::new(response, CacheSource::Cache)
  }

  pub fn offline(response: ResponseSnapshot) -> Self {
    Self::new(response, CacheSource::Offline)
  }

  pub fn unavailable() -> Self {
    Self::new(ResponseSnapshot::unavailable(), CacheSource::Unavailable)
  }

  pub fn revalidating(response: ResponseSnapshot, revalidation: JoinHandle<()>) -> Self {
    Self {
      response,
      source: CacheSource::Cache,
      revalidation: Some(revalidation),
    }
  }
}

/// The static/dynamic partition pair belonging to one cache version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionNames {
  pub static_name: String,
  pub dynamic_name: String,
}

impl PartitionNames {
  pub fn for_version(prefix: Option<&str>, version: &str) -> Self {
    Self {
      static_name: prefixed(prefix, &format!("static-{}", version)),
      dynamic_name: prefixed(prefix, &format!("dynamic-{}", version)),
    }
  }

  pub fn contains(&self, name: &str) -> bool {
    self.static_name == name || self.dynamic_name == name
  }
}

/// Version tag reported to pages, e.g. `lockgram-v1.0.0`.
pub fn version_tag(prefix: Option<&str>, version: &str) -> String {
  prefixed(prefix, version)
}

fn prefixed(prefix: Option<&str>, name: &str) -> String {
  match prefix {
    Some(p) if !p.is_empty() => format!("{}-{}", p, name),
    _ => name.to_string(),
  }
}
