//! Install/activate transitions and cache versioning.
//!
//! Each cache version moves through `installing → waiting → active →
//! superseded`. The state is stored next to the partitions so a restarted
//! process picks up where the previous one stopped.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, info};
use url::Url;

use crate::cache::{version_tag, CacheStorage, PartitionNames};
use crate::config::Config;
use crate::db::Database;
use crate::error::WorkerError;
use crate::net::{Fetcher, Request, RequestKey};
use crate::notify::{Clients, Notification};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
  Installing,
  Waiting,
  Active,
  Superseded,
}

impl LifecycleState {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Installing => "installing",
      Self::Waiting => "waiting",
      Self::Active => "active",
      Self::Superseded => "superseded",
    }
  }
}

impl FromStr for LifecycleState {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    match s {
      "installing" => Ok(Self::Installing),
      "waiting" => Ok(Self::Waiting),
      "active" => Ok(Self::Active),
      "superseded" => Ok(Self::Superseded),
      other => Err(eyre!("Unknown lifecycle state '{}'", other)),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum InstallOutcome {
  /// Nothing else was active, so the new version took over at once
  Activated { removed: Vec<String> },
  /// The same version was already active; the manifest was refreshed
  AlreadyActive,
  /// Installed behind `active`; waits for an explicit skip-waiting signal
  Waiting { active: String },
  /// Precaching failed; nothing was stored and no state changed
  Failed { reason: String },
}

pub struct LifecycleController<S: CacheStorage, F: Fetcher> {
  db: Arc<Database>,
  storage: Arc<S>,
  fetcher: Arc<F>,
  app_name: String,
  prefix: Option<String>,
  version: String,
  manifest: Vec<Url>,
}

impl<S: CacheStorage, F: Fetcher> LifecycleController<S, F> {
  pub fn new(config: &Config, db: Arc<Database>, storage: Arc<S>, fetcher: Arc<F>) -> Result<Self> {
    Ok(Self {
      db,
      storage,
      fetcher,
      app_name: config.app_name.clone(),
      prefix: config.cache_prefix.clone(),
      version: config.version.clone(),
      manifest: config.manifest_urls()?,
    })
  }

  /// Partitions owned by this worker's version.
  pub fn partitions(&self) -> PartitionNames {
    PartitionNames::for_version(self.prefix.as_deref(), &self.version)
  }

  pub fn version_tag(&self) -> String {
    version_tag(self.prefix.as_deref(), &self.version)
  }

  pub fn state(&self, version: &str) -> Result<Option<LifecycleState>> {
    let state: Option<String> = self.db.with_conn(|conn| {
      conn
        .query_row(
          "SELECT state FROM versions WHERE version = ?",
          params![version],
          |row| row.get(0),
        )
        .optional()
        .map_err(|e| eyre!("Failed to read state of {}: {}", version, e))
    })?;

    state.map(|s| s.parse()).transpose()
  }

  pub fn active_version(&self) -> Result<Option<String>> {
    self.db.with_conn(|conn| {
      conn
        .query_row(
          "SELECT version FROM versions WHERE state = 'active'",
          [],
          |row| row.get(0),
        )
        .optional()
        .map_err(|e| eyre!("Failed to read active version: {}", e))
    })
  }

  /// Tag of the active version, or this worker's own tag before anything
  /// has been activated.
  pub fn active_tag(&self) -> Result<String> {
    Ok(match self.active_version()? {
      Some(v) => version_tag(self.prefix.as_deref(), &v),
      None => self.version_tag(),
    })
  }

  /// Partitions requests are served from: the active version's, so a
  /// waiting version never takes over pages early.
  pub fn active_partitions(&self) -> Result<PartitionNames> {
    Ok(match self.active_version()? {
      Some(v) => PartitionNames::for_version(self.prefix.as_deref(), &v),
      None => self.partitions(),
    })
  }

  /// Open this version's partitions and precache the manifest.
  ///
  /// The manifest is all-or-nothing: one failed entry aborts the install and
  /// nothing is written. Failures are reported in the outcome, not raised.
  pub async fn install(&self, clients: &dyn Clients) -> Result<InstallOutcome> {
    info!(version = %self.version, "installing");

    let previous = self.state(&self.version)?;
    if previous != Some(LifecycleState::Active) {
      self.set_state(LifecycleState::Installing)?;
    }

    // put_all creates the static partition, so a failed precache leaves none behind
    let names = self.partitions();
    if let Err(e) = self.precache(&names.static_name).await {
      error!(version = %self.version, error = %e, "failed to cache static resources");
      self.restore_state(previous)?;
      return Ok(InstallOutcome::Failed {
        reason: e.to_string(),
      });
    }
    self.storage.open_partition(&names.dynamic_name)?;
    info!(version = %self.version, entries = self.manifest.len(), "static resources cached");

    match self.active_version()? {
      None => {
        let removed = self.activate(clients)?;
        Ok(InstallOutcome::Activated { removed })
      }
      Some(active) if active == self.version => Ok(InstallOutcome::AlreadyActive),
      Some(active) => {
        self.set_state(LifecycleState::Waiting)?;
        info!(version = %self.version, active = %active, "installed, waiting for activation");
        clients.show_notification(&Notification::update_available(&self.app_name))?;
        Ok(InstallOutcome::Waiting { active })
      }
    }
  }

  async fn precache(&self, partition: &str) -> std::result::Result<(), WorkerError> {
    let requests: Vec<Request> = self.manifest.iter().cloned().map(Request::get).collect();

    let responses =
      futures::future::try_join_all(requests.iter().map(|r| self.fetcher.fetch(r))).await?;

    let mut entries = Vec::with_capacity(requests.len());
    for (request, response) in requests.iter().zip(responses) {
      if !response.is_ok() {
        return Err(WorkerError::network(
          &request.url,
          format!("unexpected status {}", response.status),
        ));
      }
      entries.push((RequestKey::for_request(request), response));
    }

    self.storage.put_all(partition, &entries)?;
    Ok(())
  }

  /// Activate the waiting version. Returns whether anything was activated.
  pub fn skip_waiting(&self, clients: &dyn Clients) -> Result<bool> {
    if self.state(&self.version)? != Some(LifecycleState::Waiting) {
      info!(version = %self.version, "skip waiting ignored, nothing is waiting");
      return Ok(false);
    }

    self.activate(clients)?;
    Ok(true)
  }

  /// Make this version active: drop every partition that isn't ours and swap
  /// the version records in one transaction, then claim open pages. Returns
  /// the removed partitions.
  ///
  /// Any other version still installing or waiting loses its partitions here,
  /// so it is superseded along with the previous active one.
  pub fn activate(&self, clients: &dyn Clients) -> Result<Vec<String>> {
    info!(version = %self.version, "activating");
    let names = self.partitions();

    let removed = self.storage.retain_partitions(
      &[names.static_name.as_str(), names.dynamic_name.as_str()],
      |tx| {
        tx.execute(
          "UPDATE versions SET state = 'superseded', updated_at = datetime('now')
           WHERE state IN ('installing', 'waiting', 'active') AND version != ?",
          params![self.version],
        )
        .map_err(|e| eyre!("Failed to supersede other versions: {}", e))?;
        tx.execute(
          "INSERT OR REPLACE INTO versions (version, state, updated_at)
           VALUES (?, 'active', datetime('now'))",
          params![self.version],
        )
        .map_err(|e| eyre!("Failed to activate {}: {}", self.version, e))?;
        Ok(())
      },
    )?;

    for name in &removed {
      info!(partition = %name, "deleted old cache");
    }

    clients.claim()?;
    info!(version = %self.version, "activated");
    Ok(removed)
  }

  fn set_state(&self, state: LifecycleState) -> Result<()> {
    self.db.with_conn(|conn| {
      conn
        .execute(
          "INSERT OR REPLACE INTO versions (version, state, updated_at)
           VALUES (?, ?, datetime('now'))",
          params![self.version, state.as_str()],
        )
        .map_err(|e| eyre!("Failed to record state of {}: {}", self.version, e))?;
      Ok(())
    })
  }

  fn restore_state(&self, previous: Option<LifecycleState>) -> Result<()> {
    match previous {
      Some(state) => self.set_state(state),
      None => self.db.with_conn(|conn| {
        conn
          .execute("DELETE FROM versions WHERE version = ?", params![self.version])
          .map_err(|e| eyre!("Failed to drop state of {}: {}", self.version, e))?;
        Ok(())
      }),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::net::ResponseSnapshot;
  use crate::testing::{serve_manifest, test_config, MockFetcher, RecordingClients};
  use std::sync::atomic::Ordering;

  struct Setup {
    db: Arc<Database>,
    lifecycle: LifecycleController<SqliteStorage, MockFetcher>,
    storage: Arc<SqliteStorage>,
    fetcher: Arc<MockFetcher>,
    clients: RecordingClients,
  }

  fn setup_with(version: &str, db: Arc<Database>) -> Setup {
    let storage = Arc::new(SqliteStorage::new(Arc::clone(&db)));
    let fetcher = Arc::new(MockFetcher::new());
    serve_manifest(&fetcher);
    let lifecycle = LifecycleController::new(
      &test_config(version),
      Arc::clone(&db),
      Arc::clone(&storage),
      Arc::clone(&fetcher),
    )
    .unwrap();

    Setup {
      db,
      lifecycle,
      storage,
      fetcher,
      clients: RecordingClients::default(),
    }
  }

  fn setup(version: &str) -> Setup {
    setup_with(version, Arc::new(Database::open_in_memory().unwrap()))
  }

  #[tokio::test]
  async fn test_first_install_activates() {
    let s = setup("v1");

    let outcome = s.lifecycle.install(&s.clients).await.unwrap();

    assert_eq!(outcome, InstallOutcome::Activated { removed: vec![] });
    assert_eq!(s.lifecycle.state("v1").unwrap(), Some(LifecycleState::Active));
    assert_eq!(s.lifecycle.active_tag().unwrap(), "v1");
    assert_eq!(
      s.storage.keys("static-v1").unwrap(),
      vec!["https://app.test/", "https://app.test/styles.css"]
    );
    assert_eq!(s.clients.claims.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_install_twice_is_idempotent() {
    let s = setup("v1");

    s.lifecycle.install(&s.clients).await.unwrap();
    let outcome = s.lifecycle.install(&s.clients).await.unwrap();

    assert_eq!(outcome, InstallOutcome::AlreadyActive);
    assert_eq!(
      s.storage.partition_names().unwrap(),
      vec!["static-v1", "dynamic-v1"]
    );
    assert_eq!(s.storage.keys("static-v1").unwrap().len(), 2);
    assert_eq!(s.lifecycle.state("v1").unwrap(), Some(LifecycleState::Active));
  }

  #[tokio::test]
  async fn test_failed_manifest_entry_aborts_install() {
    let s = setup("v1");
    s.fetcher.respond(
      "GET",
      "https://app.test/styles.css",
      ResponseSnapshot::new(404, "missing"),
    );

    let outcome = s.lifecycle.install(&s.clients).await.unwrap();

    assert!(matches!(outcome, InstallOutcome::Failed { .. }));
    assert!(s.storage.keys("static-v1").unwrap().is_empty());
    assert!(s.storage.partition_names().unwrap().is_empty());
    assert_eq!(s.lifecycle.state("v1").unwrap(), None);
    assert_eq!(s.lifecycle.active_version().unwrap(), None);
  }

  #[tokio::test]
  async fn test_unreachable_manifest_entry_aborts_install() {
    let s = setup("v1");
    s.fetcher.set_offline(true);

    let outcome = s.lifecycle.install(&s.clients).await.unwrap();

    assert!(matches!(outcome, InstallOutcome::Failed { .. }));
    assert!(s.storage.keys("static-v1").unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_activation_removes_superseded_partitions() {
    let s = setup("v2");
    for name in ["static-v1", "dynamic-v1", "static-v2", "dynamic-v2"] {
      s.storage.open_partition(name).unwrap();
    }

    let removed = s.lifecycle.activate(&s.clients).unwrap();

    assert_eq!(removed, vec!["static-v1", "dynamic-v1"]);
    assert_eq!(
      s.storage.partition_names().unwrap(),
      vec!["static-v2", "dynamic-v2"]
    );
    assert_eq!(s.lifecycle.active_version().unwrap().as_deref(), Some("v2"));
  }

  #[tokio::test]
  async fn test_new_version_waits_behind_active_one() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let old = setup_with("v1", Arc::clone(&db));
    old.lifecycle.install(&old.clients).await.unwrap();

    let new = setup_with("v2", db);
    let outcome = new.lifecycle.install(&new.clients).await.unwrap();

    assert_eq!(
      outcome,
      InstallOutcome::Waiting {
        active: "v1".to_string()
      }
    );
    assert_eq!(new.lifecycle.state("v2").unwrap(), Some(LifecycleState::Waiting));
    assert_eq!(new.lifecycle.active_tag().unwrap(), "v1");
    assert_eq!(new.lifecycle.active_partitions().unwrap().static_name, "static-v1");

    let notifications = new.clients.notifications.lock().unwrap();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].tag.as_deref(), Some("update-available"));
    // Old partitions are still there until activation
    assert_eq!(new.storage.partition_names().unwrap().len(), 4);
  }

  #[tokio::test]
  async fn test_skip_waiting_swaps_versions() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let old = setup_with("v1", Arc::clone(&db));
    old.lifecycle.install(&old.clients).await.unwrap();
    let new = setup_with("v2", db);
    new.lifecycle.install(&new.clients).await.unwrap();

    assert!(new.lifecycle.skip_waiting(&new.clients).unwrap());

    assert_eq!(new.lifecycle.state("v2").unwrap(), Some(LifecycleState::Active));
    assert_eq!(new.lifecycle.state("v1").unwrap(), Some(LifecycleState::Superseded));
    assert_eq!(
      new.storage.partition_names().unwrap(),
      vec!["static-v2", "dynamic-v2"]
    );
    assert_eq!(new.storage.keys("static-v2").unwrap().len(), 2);
  }

  #[tokio::test]
  async fn test_skip_waiting_without_waiting_version() {
    let s = setup("v1");
    s.lifecycle.install(&s.clients).await.unwrap();

    assert!(!s.lifecycle.skip_waiting(&s.clients).unwrap());
    assert_eq!(s.clients.claims.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_activation_supersedes_other_waiting_versions() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let v1 = setup_with("v1", Arc::clone(&db));
    v1.lifecycle.install(&v1.clients).await.unwrap();
    let v2 = setup_with("v2", Arc::clone(&db));
    v2.lifecycle.install(&v2.clients).await.unwrap();
    let v3 = setup_with("v3", db);
    v3.lifecycle.install(&v3.clients).await.unwrap();
    assert_eq!(v3.lifecycle.state("v3").unwrap(), Some(LifecycleState::Waiting));

    assert!(v2.lifecycle.skip_waiting(&v2.clients).unwrap());

    assert_eq!(v3.lifecycle.state("v3").unwrap(), Some(LifecycleState::Superseded));
    assert!(!v3.lifecycle.skip_waiting(&v3.clients).unwrap());
    assert_eq!(v3.lifecycle.active_version().unwrap().as_deref(), Some("v2"));
    assert_eq!(
      v3.storage.partition_names().unwrap(),
      vec!["static-v2", "dynamic-v2"]
    );
  }

  #[tokio::test]
  async fn test_failed_activation_keeps_old_caches() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let old = setup_with("v1", Arc::clone(&db));
    old.lifecycle.install(&old.clients).await.unwrap();
    let new = setup_with("v2", db);
    new.lifecycle.install(&new.clients).await.unwrap();

    new
      .db
      .with_conn(|conn| {
        conn
          .execute_batch(
            "CREATE TRIGGER reject_activation BEFORE INSERT ON versions
             WHEN NEW.state = 'active'
             BEGIN SELECT RAISE(ABORT, 'activation rejected'); END;",
          )
          .map_err(|e| eyre!("{}", e))
      })
      .unwrap();

    assert!(new.lifecycle.skip_waiting(&new.clients).is_err());

    assert_eq!(new.lifecycle.active_version().unwrap().as_deref(), Some("v1"));
    assert_eq!(new.lifecycle.state("v2").unwrap(), Some(LifecycleState::Waiting));
    assert_eq!(new.storage.keys("static-v1").unwrap().len(), 2);
    assert_eq!(new.storage.partition_names().unwrap().len(), 4);
  }
}
