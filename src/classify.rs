//! Request classification.
//!
//! A request is matched against an ordered predicate table; the first matching
//! row decides the category. Static rows come first so the document shell is
//! cached as a static asset even though it is same-origin.

use url::Url;

use crate::cache::Strategy;
use crate::config::ClassifierConfig;
use crate::net::Request;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
  /// Build assets, the document shell, allowed font hosts
  Static,
  /// Same-origin pages not classified as static
  Dynamic,
  /// Reserved API paths or structured-data requests
  Api,
  /// Anything else; served network-first
  Uncategorized,
}

impl Category {
  pub fn strategy(self) -> Strategy {
    match self {
      Category::Static => Strategy::CacheFirst,
      Category::Api => Strategy::StaleWhileRevalidate,
      Category::Dynamic | Category::Uncategorized => Strategy::NetworkFirst,
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Category::Static => "static",
      Category::Dynamic => "dynamic",
      Category::Api => "api",
      Category::Uncategorized => "uncategorized",
    }
  }
}

/// One row of the predicate table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
  /// Last path segment ends in `.ext`
  Extension(String),
  /// Path equals exactly
  ExactPath(String),
  /// Hostname contains the fragment
  HostContains(String),
  /// Path starts with the prefix
  PathPrefix(String),
  /// Query string carries the parameter
  QueryParam(String),
  /// Accept header contains the fragment
  AcceptContains(String),
  /// Same hostname as the application origin
  SameOrigin,
}

impl Predicate {
  fn matches(&self, request: &Request, origin: &Url) -> bool {
    let url = &request.url;

    match self {
      Predicate::Extension(ext) => url
        .path()
        .rsplit('/')
        .next()
        .and_then(|segment| segment.rsplit_once('.'))
        .is_some_and(|(_, e)| e.eq_ignore_ascii_case(ext)),
      Predicate::ExactPath(path) => url.path() == path,
      Predicate::HostContains(fragment) => url.host_str().is_some_and(|h| h.contains(fragment.as_str())),
      Predicate::PathPrefix(prefix) => url.path().starts_with(prefix.as_str()),
      Predicate::QueryParam(name) => url.query_pairs().any(|(k, _)| k == name.as_str()),
      Predicate::AcceptContains(fragment) => request
        .header("accept")
        .is_some_and(|accept| accept.contains(fragment.as_str())),
      Predicate::SameOrigin => url.host_str().is_some() && url.host_str() == origin.host_str(),
    }
  }
}

/// Maps requests to categories via an explicit predicate table.
#[derive(Debug, Clone)]
pub struct Classifier {
  origin: Url,
  table: Vec<(Predicate, Category)>,
}

impl Classifier {
  pub fn new(origin: Url, rules: &ClassifierConfig) -> Self {
    let mut table = Vec::new();

    for ext in &rules.static_extensions {
      table.push((Predicate::Extension(ext.clone()), Category::Static));
    }
    for path in &rules.static_paths {
      table.push((Predicate::ExactPath(path.clone()), Category::Static));
    }
    for host in &rules.font_hosts {
      table.push((Predicate::HostContains(host.clone()), Category::Static));
    }

    for prefix in &rules.api_prefixes {
      table.push((Predicate::PathPrefix(prefix.clone()), Category::Api));
    }
    for marker in &rules.api_host_markers {
      table.push((Predicate::HostContains(marker.clone()), Category::Api));
    }
    if let Some(param) = &rules.api_query_param {
      table.push((Predicate::QueryParam(param.clone()), Category::Api));
    }
    if let Some(accept) = &rules.api_accept {
      table.push((Predicate::AcceptContains(accept.clone()), Category::Api));
    }

    table.push((Predicate::SameOrigin, Category::Dynamic));

    Self { origin, table }
  }

  pub fn classify(&self, request: &Request) -> Category {
    self
      .table
      .iter()
      .find(|(predicate, _)| predicate.matches(request, &self.origin))
      .map(|(_, category)| *category)
      .unwrap_or(Category::Uncategorized)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn classifier() -> Classifier {
    Classifier::new(
      Url::parse("https://app.test/").unwrap(),
      &ClassifierConfig::default(),
    )
  }

  fn classify(url: &str) -> Category {
    classifier().classify(&Request::get(Url::parse(url).unwrap()))
  }

  #[test]
  fn test_static_extensions() {
    assert_eq!(classify("https://app.test/styles.css"), Category::Static);
    assert_eq!(classify("https://app.test/assets/app.JS"), Category::Static);
    assert_eq!(classify("https://cdn.other/logo.png"), Category::Static);
    assert_eq!(classify("https://app.test/fonts/inter.woff2"), Category::Static);
  }

  #[test]
  fn test_root_document_is_static_not_dynamic() {
    assert_eq!(classify("https://app.test/"), Category::Static);
    assert_eq!(classify("https://app.test/index.html"), Category::Static);
  }

  #[test]
  fn test_font_hosts_are_static() {
    assert_eq!(
      classify("https://fonts.googleapis.com/css2?family=Inter"),
      Category::Static
    );
    assert_eq!(classify("https://fonts.gstatic.com/s/inter/v1/x"), Category::Static);
  }

  #[test]
  fn test_api_requests() {
    assert_eq!(classify("https://app.test/api/items"), Category::Api);
    assert_eq!(classify("https://app.test/v1/users"), Category::Api);
    assert_eq!(classify("https://api.example.com/things"), Category::Api);
    assert_eq!(classify("https://app.test/data?api=1"), Category::Api);
  }

  #[test]
  fn test_json_accept_is_api() {
    let request = Request::get(Url::parse("https://app.test/profile").unwrap())
      .with_header("Accept", "application/json, text/plain");
    assert_eq!(classifier().classify(&request), Category::Api);
  }

  #[test]
  fn test_same_origin_pages_are_dynamic() {
    assert_eq!(classify("https://app.test/about"), Category::Dynamic);
    assert_eq!(classify("https://app.test/blog/post-1"), Category::Dynamic);
  }

  #[test]
  fn test_other_origins_are_uncategorized() {
    assert_eq!(classify("https://elsewhere.test/page"), Category::Uncategorized);
    assert_eq!(Category::Uncategorized.strategy(), Strategy::NetworkFirst);
  }

  #[test]
  fn test_strategy_selection() {
    assert_eq!(Category::Static.strategy(), Strategy::CacheFirst);
    assert_eq!(Category::Dynamic.strategy(), Strategy::NetworkFirst);
    assert_eq!(Category::Api.strategy(), Strategy::StaleWhileRevalidate);
  }

  #[test]
  fn test_dotted_directory_is_not_an_extension() {
    assert_eq!(classify("https://app.test/v2.css/page"), Category::Dynamic);
  }
}
