use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

use crate::cache::version_tag;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin of the application being served; same-host requests are "dynamic"
  pub origin: Url,
  /// Shown as the title of push notifications
  pub app_name: String,
  /// Prefix for partition names and the version tag (e.g. "lockgram")
  pub cache_prefix: Option<String>,
  /// Cache version; bump it to roll out a new partition pair
  pub version: String,
  /// Critical resources fetched on install, relative to `origin` or absolute
  pub precache: Vec<String>,
  pub classifier: ClassifierConfig,
  /// Sync tag that triggers offline queue replay
  pub sync_tag: String,
  /// SQLite database path (default: $XDG_DATA_HOME/pwa-cache/worker.db)
  pub database: Option<PathBuf>,
  /// Log directory (default: $XDG_DATA_HOME/pwa-cache/logs)
  pub log_dir: Option<PathBuf>,
  /// Log filter used when PWA_CACHE_LOG is unset
  pub log_level: Option<String>,
}

/// Predicate tables for request classification.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
  /// File extensions served cache-first (case-insensitive, no dot)
  pub static_extensions: Vec<String>,
  /// Exact paths treated as static (the document shell)
  pub static_paths: Vec<String>,
  /// Cross-origin hosts allowed into the static partition
  pub font_hosts: Vec<String>,
  /// Path prefixes reserved for API calls
  pub api_prefixes: Vec<String>,
  /// Hostname fragments marking an API host
  pub api_host_markers: Vec<String>,
  /// Query parameter marking an API call
  pub api_query_param: Option<String>,
  /// Accept header fragment marking a structured-data request
  pub api_accept: Option<String>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: Url::parse("http://localhost:8080/").expect("static origin URL is valid"),
      app_name: "LockGram".to_string(),
      cache_prefix: Some("lockgram".to_string()),
      version: "v1.0.0".to_string(),
      precache: [
        "/",
        "/index.html",
        "/styles.css",
        "/script.js",
        "/manifest.json",
        "https://fonts.googleapis.com/css2?family=JetBrains+Mono:wght@400;500;600;700&family=Inter:wght@300;400;500;600;700&display=swap",
      ]
      .into_iter()
      .map(String::from)
      .collect(),
      classifier: ClassifierConfig::default(),
      sync_tag: "background-sync".to_string(),
      database: None,
      log_dir: None,
      log_level: None,
    }
  }
}

impl Default for ClassifierConfig {
  fn default() -> Self {
    let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();

    Self {
      static_extensions: strings(&["css", "js", "png", "jpg", "jpeg", "svg", "ico", "woff", "woff2"]),
      static_paths: strings(&["/", "/index.html"]),
      font_hosts: strings(&["fonts.googleapis.com", "fonts.gstatic.com"]),
      api_prefixes: strings(&["/api/", "/v1/"]),
      api_host_markers: strings(&["api."]),
      api_query_param: Some("api".to_string()),
      api_accept: Some("application/json".to_string()),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./pwa-cache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/pwa-cache/config.yaml
  ///
  /// Falls back to built-in defaults when no file is found.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };
    config.validate()?;

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("pwa-cache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("pwa-cache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  fn validate(&self) -> Result<()> {
    if self.version.trim().is_empty() {
      return Err(eyre!("Config `version` must not be empty"));
    }
    if self.origin.cannot_be_a_base() {
      return Err(eyre!("Config `origin` must be an http(s) URL: {}", self.origin));
    }
    Ok(())
  }

  /// Resolve a path or absolute URL against the application origin.
  pub fn resolve_url(&self, input: &str) -> Result<Url> {
    self
      .origin
      .join(input)
      .map_err(|e| eyre!("Invalid URL '{}': {}", input, e))
  }

  /// The precache manifest as absolute URLs.
  pub fn manifest_urls(&self) -> Result<Vec<Url>> {
    self.precache.iter().map(|p| self.resolve_url(p)).collect()
  }

  /// The application's root page, also the offline document shell.
  pub fn root_url(&self) -> Url {
    let mut root = self.origin.clone();
    root.set_path("/");
    root.set_query(None);
    root.set_fragment(None);
    root
  }

  pub fn version_tag(&self) -> String {
    version_tag(self.cache_prefix.as_deref(), &self.version)
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.database {
      Some(p) => Ok(p.clone()),
      None => Ok(Self::data_dir()?.join("worker.db")),
    }
  }

  pub fn log_dir(&self) -> Result<PathBuf> {
    match &self.log_dir {
      Some(p) => Ok(p.clone()),
      None => Ok(Self::data_dir()?.join("logs")),
    }
  }

  fn data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("pwa-cache"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults() {
    let config = Config::default();
    assert_eq!(config.version_tag(), "lockgram-v1.0.0");
    assert_eq!(config.sync_tag, "background-sync");
    assert_eq!(config.precache.len(), 6);
  }

  #[test]
  fn test_partial_yaml_keeps_defaults() {
    let config = Config::from_yaml(
      r#"
origin: "https://shop.example/"
version: v2
cache_prefix: null
classifier:
  api_prefixes: ["/graphql"]
"#,
    )
    .unwrap();

    assert_eq!(config.origin.as_str(), "https://shop.example/");
    assert_eq!(config.version_tag(), "v2");
    assert_eq!(config.classifier.api_prefixes, vec!["/graphql"]);
    // Untouched tables keep their defaults
    assert_eq!(config.classifier.font_hosts.len(), 2);
    assert_eq!(config.app_name, "LockGram");
  }

  #[test]
  fn test_manifest_urls_resolve_against_origin() {
    let config = Config {
      origin: Url::parse("https://app.test/").unwrap(),
      precache: vec!["/".into(), "styles.css".into(), "https://cdn.test/font.woff2".into()],
      ..Config::default()
    };

    let urls: Vec<String> = config
      .manifest_urls()
      .unwrap()
      .into_iter()
      .map(String::from)
      .collect();
    assert_eq!(
      urls,
      vec![
        "https://app.test/",
        "https://app.test/styles.css",
        "https://cdn.test/font.woff2"
      ]
    );
  }

  #[test]
  fn test_root_url_drops_path() {
    let config = Config {
      origin: Url::parse("https://app.test/app/index.html?x=1").unwrap(),
      ..Config::default()
    };
    assert_eq!(config.root_url().as_str(), "https://app.test/");
  }

  #[test]
  fn test_empty_version_is_rejected() {
    let config = Config {
      version: " ".into(),
      ..Config::default()
    };
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_missing_explicit_path_is_an_error() {
    assert!(Config::load(Some(Path::new("/nonexistent/pwa-cache.yaml"))).is_err());
  }
}
