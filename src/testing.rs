//! Test doubles for the network and client boundaries.

use async_trait::async_trait;
use color_eyre::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use url::Url;

use crate::cache::SqliteStorage;
use crate::config::Config;
use crate::db::Database;
use crate::error::WorkerError;
use crate::net::{Fetcher, Request, ResponseSnapshot};
use crate::notify::{Clients, Notification};
use crate::worker::ServiceWorker;

/// Scriptable fetcher. Unrouted requests fail like a dead network.
#[derive(Default)]
pub struct MockFetcher {
  routes: Mutex<HashMap<String, ResponseSnapshot>>,
  invalid: Mutex<Vec<String>>,
  requests: Mutex<Vec<Request>>,
  offline: AtomicBool,
  gate: Option<Semaphore>,
}

impl MockFetcher {
  pub fn new() -> Self {
    Self::default()
  }

  /// Every fetch blocks until `release` hands out a permit.
  pub fn gated() -> Self {
    Self {
      gate: Some(Semaphore::new(0)),
      ..Self::default()
    }
  }

  pub fn release(&self, permits: usize) {
    if let Some(gate) = &self.gate {
      gate.add_permits(permits);
    }
  }

  pub fn respond(&self, method: &str, url: &str, response: ResponseSnapshot) {
    self
      .routes
      .lock()
      .unwrap()
      .insert(route(method, url), response);
  }

  /// Fail a route the way a malformed request fails to build.
  pub fn reject_invalid(&self, method: &str, url: &str) {
    self.invalid.lock().unwrap().push(route(method, url));
  }

  /// Route a GET to a 200 with `body`.
  pub fn ok(&self, url: &str, body: &str) {
    self.respond("GET", url, ResponseSnapshot::new(200, body));
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn calls(&self) -> usize {
    self.requests.lock().unwrap().len()
  }

  pub fn calls_to(&self, url: &str) -> usize {
    self
      .requests
      .lock()
      .unwrap()
      .iter()
      .filter(|r| r.url.as_str() == url)
      .count()
  }

  pub fn requests(&self) -> Vec<Request> {
    self.requests.lock().unwrap().clone()
  }
}

fn route(method: &str, url: &str) -> String {
  let url = Url::parse(url).expect("test route URL");
  format!("{} {}", method.to_ascii_uppercase(), url)
}

#[async_trait]
impl Fetcher for MockFetcher {
  async fn fetch(&self, request: &Request) -> std::result::Result<ResponseSnapshot, WorkerError> {
    self.requests.lock().unwrap().push(request.clone());

    if let Some(gate) = &self.gate {
      gate.acquire().await.expect("gate closed").forget();
    }

    if self.offline.load(Ordering::SeqCst) {
      return Err(WorkerError::network(&request.url, "offline"));
    }

    let key = format!("{} {}", request.method, request.url);
    if self.invalid.lock().unwrap().contains(&key) {
      return Err(WorkerError::invalid_request(&request.url, "builder error"));
    }
    let response = self.routes.lock().unwrap().get(&key).cloned();
    response.ok_or_else(|| WorkerError::network(&request.url, "no route"))
  }
}

/// Records everything the worker asks of connected pages.
#[derive(Default)]
pub struct RecordingClients {
  pub notifications: Mutex<Vec<Notification>>,
  pub opened: Mutex<Vec<Url>>,
  pub claims: AtomicUsize,
}

impl Clients for RecordingClients {
  fn show_notification(&self, notification: &Notification) -> Result<()> {
    self.notifications.lock().unwrap().push(notification.clone());
    Ok(())
  }

  fn open_window(&self, url: &Url) -> Result<()> {
    self.opened.lock().unwrap().push(url.clone());
    Ok(())
  }

  fn claim(&self) -> Result<()> {
    self.claims.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }
}

pub fn test_config(version: &str) -> Config {
  Config {
    origin: Url::parse("https://app.test/").unwrap(),
    cache_prefix: None,
    version: version.to_string(),
    precache: vec!["/".into(), "/styles.css".into()],
    ..Config::default()
  }
}

/// Route the default test manifest to 200s.
pub fn serve_manifest(fetcher: &MockFetcher) {
  fetcher.ok("https://app.test/", "<html>shell</html>");
  fetcher.ok("https://app.test/styles.css", "body{}");
}

pub struct Harness {
  pub worker: ServiceWorker<SqliteStorage, MockFetcher>,
  pub fetcher: Arc<MockFetcher>,
  pub clients: Arc<RecordingClients>,
  pub db: Arc<Database>,
}

pub fn harness(config: Config) -> Harness {
  harness_with(config, Arc::new(Database::open_in_memory().unwrap()), Arc::new(MockFetcher::new()))
}

/// Build a worker over an existing database, e.g. to simulate a new version
/// starting up next to an active one.
pub fn harness_with(config: Config, db: Arc<Database>, fetcher: Arc<MockFetcher>) -> Harness {
  let clients = Arc::new(RecordingClients::default());
  let storage = Arc::new(SqliteStorage::new(Arc::clone(&db)));
  let worker = ServiceWorker::new(
    config,
    Arc::clone(&db),
    storage,
    Arc::clone(&fetcher),
    Arc::clone(&clients) as Arc<dyn Clients>,
  )
  .unwrap();

  Harness {
    worker,
    fetcher,
    clients,
    db,
  }
}
