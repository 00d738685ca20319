//! Durable queue of mutating requests that could not be delivered.
//!
//! Delivery is at-least-once: an action is removed only after a 2xx replay,
//! and a replay that succeeds on the server but fails in transit is sent again.

use chrono::{DateTime, SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

use crate::db::Database;
use crate::net::{Fetcher, Request};

/// A queued mutating request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OfflineAction {
  /// Assigned at enqueue; the key for removal
  pub id: String,
  pub method: String,
  pub url: String,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
  pub created_at: DateTime<Utc>,
}

impl OfflineAction {
  /// Rebuild the request for delivery.
  pub fn to_request(&self) -> Result<Request> {
    let url =
      Url::parse(&self.url).map_err(|e| eyre!("Invalid URL in offline action {}: {}", self.id, e))?;

    Ok(Request {
      method: self.method.clone(),
      url,
      headers: self.headers.clone(),
      body: self.body.clone(),
      mode: Default::default(),
    })
  }
}

/// Outcome of one replay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplaySummary {
  pub attempted: usize,
  pub delivered: usize,
  pub remaining: usize,
}

pub struct OfflineQueue {
  db: Arc<Database>,
}

impl OfflineQueue {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }

  /// Persist a request and return its new identity.
  pub fn enqueue(&self, request: &Request) -> Result<String> {
    let id = uuid::Uuid::new_v4().to_string();
    let headers = serde_json::to_string(&request.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;
    let created_at = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);

    self.db.with_conn(|conn| {
      conn
        .execute(
          "INSERT INTO offline_actions (id, method, url, headers, body, created_at)
           VALUES (?, ?, ?, ?, ?, ?)",
          params![
            id,
            request.method,
            request.url.as_str(),
            headers,
            request.body,
            created_at
          ],
        )
        .map_err(|e| eyre!("Failed to store offline action: {}", e))?;
      Ok(())
    })?;

    info!(id = %id, method = %request.method, url = %request.url, "queued offline action");
    Ok(id)
  }

  /// All pending actions, oldest first.
  pub fn list(&self) -> Result<Vec<OfflineAction>> {
    self.db.with_conn(|conn| {
      let mut stmt = conn
        .prepare(
          "SELECT id, method, url, headers, body, created_at FROM offline_actions
           ORDER BY created_at, seq",
        )
        .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

      let rows = stmt
        .query_map([], read_action)
        .map_err(|e| eyre!("Failed to list offline actions: {}", e))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| eyre!("Failed to read offline action: {}", e))?;

      rows.into_iter().map(decode_action).collect()
    })
  }

  pub fn get(&self, id: &str) -> Result<Option<OfflineAction>> {
    self.db.with_conn(|conn| {
      let row = conn
        .query_row(
          "SELECT id, method, url, headers, body, created_at FROM offline_actions WHERE id = ?",
          params![id],
          read_action,
        )
        .optional()
        .map_err(|e| eyre!("Failed to read offline action {}: {}", id, e))?;

      row.map(decode_action).transpose()
    })
  }

  /// Delete one action. Removing an unknown id is a no-op.
  pub fn remove(&self, id: &str) -> Result<bool> {
    self.db.with_conn(|conn| {
      let removed = conn
        .execute("DELETE FROM offline_actions WHERE id = ?", params![id])
        .map_err(|e| eyre!("Failed to remove offline action {}: {}", id, e))?;
      Ok(removed > 0)
    })
  }

  pub fn len(&self) -> Result<usize> {
    self.db.with_conn(|conn| {
      let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM offline_actions", [], |row| row.get(0))
        .map_err(|e| eyre!("Failed to count offline actions: {}", e))?;
      Ok(count as usize)
    })
  }

  /// Try to deliver every pending action in creation order.
  ///
  /// A failed action stays queued for the next trigger and never blocks the
  /// ones after it. There is no backoff and no retry limit.
  pub async fn replay<F: Fetcher>(&self, fetcher: &F) -> Result<ReplaySummary> {
    let actions = self.list()?;
    let mut summary = ReplaySummary::default();

    for action in actions {
      summary.attempted += 1;

      let request = match action.to_request() {
        Ok(r) => r,
        Err(e) => {
          warn!(id = %action.id, error = %e, "skipping undeliverable offline action");
          continue;
        }
      };

      match fetcher.fetch(&request).await {
        Ok(response) if response.is_ok() => {
          summary.delivered += 1;
          match self.remove(&action.id) {
            Ok(_) => info!(id = %action.id, status = response.status, "synced offline action"),
            Err(e) => {
              warn!(id = %action.id, error = %e, "delivered offline action but could not remove it")
            }
          }
        }
        Ok(response) => {
          warn!(id = %action.id, status = response.status, "offline action rejected, keeping it queued");
        }
        Err(e) => {
          warn!(id = %action.id, error = %e, "failed to sync offline action");
        }
      }
    }

    summary.remaining = self.len()?;
    Ok(summary)
  }
}

type ActionRow = (String, String, String, String, Option<Vec<u8>>, String);

fn read_action(row: &rusqlite::Row<'_>) -> rusqlite::Result<ActionRow> {
  Ok((
    row.get(0)?,
    row.get(1)?,
    row.get(2)?,
    row.get(3)?,
    row.get(4)?,
    row.get(5)?,
  ))
}

fn decode_action((id, method, url, headers, body, created_at): ActionRow) -> Result<OfflineAction> {
  let headers =
    serde_json::from_str(&headers).map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;
  let created_at = DateTime::parse_from_rfc3339(&created_at)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", created_at, e))?;

  Ok(OfflineAction {
    id,
    method,
    url,
    headers,
    body,
    created_at,
  })
}
