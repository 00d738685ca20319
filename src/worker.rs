//! Event dispatcher.
//!
//! Every event the host delivers (install, activate, fetch, message, push,
//! notification click, sync) goes through [`ServiceWorker::dispatch`] and comes
//! back as a [`WorkerReply`] value. Handlers are plain async fns: dropping the
//! returned future abandons in-flight fetches, while a revalidation that was
//! already spawned still runs to completion.

use chrono::Utc;
use color_eyre::Result;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheLayer, CacheSource, CacheStorage, Resolved, SqliteStorage};
use crate::classify::{Category, Classifier};
use crate::config::Config;
use crate::db::Database;
use crate::error::WorkerError;
use crate::lifecycle::{InstallOutcome, LifecycleController};
use crate::messages::{MessageReply, WorkerMessage};
use crate::net::{Fetcher, HttpFetcher, Request, RequestKey, ResponseSnapshot};
use crate::notify::{click_outcome, ClickOutcome, Clients, Notification};
use crate::queue::{OfflineQueue, ReplaySummary};

/// Events delivered to the worker
#[derive(Debug)]
pub enum WorkerEvent {
  Install,
  Activate,
  Fetch(Request),
  /// Posted message from a page
  Message(Value),
  /// Push message, with its JSON payload if it carried one
  Push(Option<Value>),
  /// Notification click; `None` is a click on the notification itself
  NotificationClick(Option<String>),
  /// Background sync with its tag
  Sync(String),
}

#[derive(Debug)]
pub enum WorkerReply {
  Installed(InstallOutcome),
  Activated { removed: Vec<String> },
  Response(Resolved),
  /// Not ours to handle (non-http scheme); the host fetches it directly
  Passthrough,
  Message(Option<MessageReply>),
  /// Shown through the injected `Clients`
  Notified,
  Clicked(ClickOutcome),
  Synced(ReplaySummary),
  Ignored,
}

pub struct ServiceWorker<S: CacheStorage, F: Fetcher> {
  config: Config,
  classifier: Classifier,
  layer: CacheLayer<S, F>,
  queue: OfflineQueue,
  lifecycle: LifecycleController<S, F>,
  fetcher: Arc<F>,
  clients: Arc<dyn Clients>,
}

impl ServiceWorker<SqliteStorage, HttpFetcher> {
  /// Open the worker over the configured database with a real HTTP client.
  pub fn open(config: Config, clients: Arc<dyn Clients>) -> Result<Self> {
    let db = Arc::new(Database::open(&config.database_path()?)?);
    let storage = Arc::new(SqliteStorage::new(Arc::clone(&db)));
    let fetcher = Arc::new(HttpFetcher::new()?);

    Self::new(config, db, storage, fetcher, clients)
  }
}

impl<S: CacheStorage, F: Fetcher> ServiceWorker<S, F> {
  pub fn new(
    config: Config,
    db: Arc<Database>,
    storage: Arc<S>,
    fetcher: Arc<F>,
    clients: Arc<dyn Clients>,
  ) -> Result<Self> {
    let classifier = Classifier::new(config.origin.clone(), &config.classifier);
    let layer = CacheLayer::new(Arc::clone(&storage), Arc::clone(&fetcher));
    let queue = OfflineQueue::new(Arc::clone(&db));
    let lifecycle = LifecycleController::new(&config, db, storage, Arc::clone(&fetcher))?;

    Ok(Self {
      config,
      classifier,
      layer,
      queue,
      lifecycle,
      fetcher,
      clients,
    })
  }

  pub fn queue(&self) -> &OfflineQueue {
    &self.queue
  }

  pub fn lifecycle(&self) -> &LifecycleController<S, F> {
    &self.lifecycle
  }

  pub fn storage(&self) -> &Arc<S> {
    self.layer.storage()
  }

  pub async fn dispatch(&self, event: WorkerEvent) -> Result<WorkerReply> {
    match event {
      WorkerEvent::Install => Ok(WorkerReply::Installed(
        self.lifecycle.install(self.clients.as_ref()).await?,
      )),
      WorkerEvent::Activate => Ok(WorkerReply::Activated {
        removed: self.lifecycle.activate(self.clients.as_ref())?,
      }),
      WorkerEvent::Fetch(request) => Ok(match self.handle_fetch(request).await {
        Some(resolved) => WorkerReply::Response(resolved),
        None => WorkerReply::Passthrough,
      }),
      WorkerEvent::Message(value) => self.handle_message(&value),
      WorkerEvent::Push(payload) => {
        let notification = Notification::from_push(&self.config.app_name, payload.as_ref(), Utc::now());
        self.clients.show_notification(&notification)?;
        Ok(WorkerReply::Notified)
      }
      WorkerEvent::NotificationClick(action) => self.handle_click(action.as_deref()),
      WorkerEvent::Sync(tag) => {
        if tag != self.config.sync_tag {
          debug!(tag = %tag, "ignoring sync with unknown tag");
          return Ok(WorkerReply::Ignored);
        }
        info!("background sync triggered");
        Ok(WorkerReply::Synced(self.queue.replay(self.fetcher.as_ref()).await?))
      }
    }
  }

  /// Resolve an intercepted request. `None` means the request is not
  /// intercepted at all.
  ///
  /// Never fails: the worst case is a synthetic 503.
  pub async fn handle_fetch(&self, request: Request) -> Option<Resolved> {
    if !request.is_http() {
      return None;
    }

    if !request.is_get() {
      return Some(self.forward_mutation(&request).await);
    }

    let category = self.classifier.classify(&request);
    let partitions = self.lifecycle.active_partitions().unwrap_or_else(|e| {
      warn!(error = %e, "could not read active version, using own partitions");
      self.lifecycle.partitions()
    });
    let partition = match category {
      Category::Static => &partitions.static_name,
      _ => &partitions.dynamic_name,
    };
    debug!(url = %request.url, category = category.as_str(), partition = %partition, "fetch");

    match self.layer.resolve(category.strategy(), partition, &request).await {
      Ok(resolved) => Some(resolved),
      Err(err) => {
        warn!(url = %request.url, error = %err, "fetch failed, trying fallbacks");
        Some(self.fallback(&request))
      }
    }
  }

  /// Fallback chain: any cached copy, then the document shell for
  /// navigations, then a synthetic 503.
  fn fallback(&self, request: &Request) -> Resolved {
    let exact = self.match_cached(&RequestKey::for_request(request));
    let shell = || {
      if request.is_navigation() {
        self.match_cached(&RequestKey::get(&self.config.root_url()))
      } else {
        Err(WorkerError::cache_miss(&request.url))
      }
    };

    match exact.or_else(|_| shell()) {
      Ok(response) => Resolved::new(response, CacheSource::Fallback),
      Err(_) => {
        let err = WorkerError::AllStrategiesExhausted {
          url: request.url.to_string(),
        };
        warn!(error = %err, "serving offline response");
        Resolved::unavailable()
      }
    }
  }

  fn match_cached(&self, key: &RequestKey) -> std::result::Result<ResponseSnapshot, WorkerError> {
    match self.storage().match_any(key) {
      Ok(Some(cached)) => Ok(cached.response),
      Ok(None) => Err(WorkerError::cache_miss(key.url())),
      Err(e) => {
        warn!(url = key.url(), error = %e, "cache lookup failed");
        Err(e.into())
      }
    }
  }

  /// Mutating requests skip the cache. If the network is unreachable they
  /// are queued and the page is told so.
  async fn forward_mutation(&self, request: &Request) -> Resolved {
    let err = match self.fetcher.fetch(request).await {
      Ok(response) => return Resolved::from_network(response),
      Err(err) if err.is_network() => err,
      Err(err) => {
        error!(url = %request.url, error = %err, "failed to forward request");
        return Resolved::unavailable();
      }
    };

    match self.queue.enqueue(request) {
      Ok(id) => {
        info!(url = %request.url, id = %id, error = %err, "network unavailable, action queued");
        Resolved::new(ResponseSnapshot::queued(&id), CacheSource::Queued)
      }
      Err(e) => {
        error!(url = %request.url, error = %e, "failed to queue offline action");
        Resolved::unavailable()
      }
    }
  }

  fn handle_message(&self, value: &Value) -> Result<WorkerReply> {
    match WorkerMessage::parse(value) {
      Some(WorkerMessage::SkipWaiting) => {
        self.lifecycle.skip_waiting(self.clients.as_ref())?;
        Ok(WorkerReply::Message(None))
      }
      Some(WorkerMessage::GetVersion) => Ok(WorkerReply::Message(Some(MessageReply::Version {
        version: self.lifecycle.active_tag()?,
      }))),
      Some(WorkerMessage::ClearCache) => {
        let success = match self.clear_cache() {
          Ok(()) => true,
          Err(e) => {
            error!(error = %e, "failed to clear caches");
            false
          }
        };
        Ok(WorkerReply::Message(Some(MessageReply::Cleared { success })))
      }
      Some(WorkerMessage::Unknown) | None => {
        debug!(message = %value, "ignoring unknown message");
        Ok(WorkerReply::Ignored)
      }
    }
  }

  fn clear_cache(&self) -> Result<()> {
    for name in self.storage().partition_names()? {
      self.storage().delete_partition(&name)?;
    }
    info!("cleared all caches");
    Ok(())
  }

  fn handle_click(&self, action: Option<&str>) -> Result<WorkerReply> {
    let outcome = click_outcome(action);

    match outcome {
      ClickOutcome::OpenRoot => self.clients.open_window(&self.config.root_url())?,
      ClickOutcome::UpdateAndOpenRoot => {
        self.lifecycle.skip_waiting(self.clients.as_ref())?;
        self.clients.open_window(&self.config.root_url())?;
      }
      ClickOutcome::Dismissed => {}
    }

    Ok(WorkerReply::Clicked(outcome))
  }
}
