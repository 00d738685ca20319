//! Push payloads, notifications and the connected-pages collaborator.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};
use url::Url;

const ICON: &str = "/icon-192x192.png";
const BADGE: &str = "/badge-72x72.png";
const DEFAULT_PUSH_BODY: &str = "New update available!";

/// Pages controlled by the worker.
///
/// Injected so the worker never reaches for ambient globals; the CLI host
/// prints, tests record.
pub trait Clients: Send + Sync {
  fn show_notification(&self, notification: &Notification) -> Result<()>;

  fn open_window(&self, url: &Url) -> Result<()>;

  /// Take control of pages that are already open.
  fn claim(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationAction {
  Explore,
  Close,
  Update,
  Dismiss,
}

impl NotificationAction {
  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "explore" => Some(Self::Explore),
      "close" => Some(Self::Close),
      "update" => Some(Self::Update),
      "dismiss" => Some(Self::Dismiss),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationButton {
  pub action: NotificationAction,
  pub title: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub icon: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub tag: Option<String>,
  pub require_interaction: bool,
  pub vibrate: Vec<u32>,
  pub data: Value,
  pub actions: Vec<NotificationButton>,
}

/// Inbound push payload; every field is optional.
#[derive(Debug, Default, Deserialize)]
struct PushPayload {
  #[serde(default)]
  body: Option<String>,
  #[serde(default)]
  data: Option<Map<String, Value>>,
}

impl Notification {
  /// Build the notification shown for a push message.
  pub fn from_push(app_name: &str, payload: Option<&Value>, now: DateTime<Utc>) -> Self {
    let payload = match payload {
      Some(value) => serde_json::from_value::<PushPayload>(value.clone()).unwrap_or_else(|e| {
        warn!(error = %e, "malformed push payload, using defaults");
        PushPayload::default()
      }),
      None => PushPayload::default(),
    };

    let mut data = Map::new();
    data.insert("dateOfArrival".into(), Value::from(now.timestamp_millis()));
    data.insert("primaryKey".into(), Value::from("1"));
    if let Some(extra) = payload.data {
      data.extend(extra);
    }

    Self {
      title: app_name.to_string(),
      body: payload.body.unwrap_or_else(|| DEFAULT_PUSH_BODY.to_string()),
      icon: ICON.to_string(),
      badge: BADGE.to_string(),
      tag: None,
      require_interaction: false,
      vibrate: vec![100, 50, 100],
      data: Value::Object(data),
      actions: vec![
        NotificationButton {
          action: NotificationAction::Explore,
          title: "Explore".to_string(),
          icon: Some("/explore-icon.png".to_string()),
        },
        NotificationButton {
          action: NotificationAction::Close,
          title: "Close".to_string(),
          icon: Some("/close-icon.png".to_string()),
        },
      ],
    }
  }

  /// Shown when a new version is installed and waiting behind the active one.
  pub fn update_available(app_name: &str) -> Self {
    Self {
      title: "Update Available".to_string(),
      body: format!(
        "A new version of {} is available. Click to update.",
        app_name
      ),
      icon: ICON.to_string(),
      badge: BADGE.to_string(),
      tag: Some("update-available".to_string()),
      require_interaction: true,
      vibrate: Vec::new(),
      data: Value::Object(Map::new()),
      actions: vec![
        NotificationButton {
          action: NotificationAction::Update,
          title: "Update Now".to_string(),
          icon: None,
        },
        NotificationButton {
          action: NotificationAction::Dismiss,
          title: "Later".to_string(),
          icon: None,
        },
      ],
    }
  }
}

/// What a notification click asks the worker to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClickOutcome {
  /// Open the application's root page
  OpenRoot,
  /// Activate the waiting version, then open the root page
  UpdateAndOpenRoot,
  /// Nothing beyond closing the notification
  Dismissed,
}

/// Map a clicked action (None = the notification body) to an outcome.
pub fn click_outcome(action: Option<&str>) -> ClickOutcome {
  match action.and_then(NotificationAction::parse) {
    Some(NotificationAction::Close) | Some(NotificationAction::Dismiss) => ClickOutcome::Dismissed,
    Some(NotificationAction::Update) => ClickOutcome::UpdateAndOpenRoot,
    Some(NotificationAction::Explore) | None => ClickOutcome::OpenRoot,
  }
}

/// Clients implementation for the command-line host: logs and prints JSON.
pub struct ConsoleClients;

impl Clients for ConsoleClients {
  fn show_notification(&self, notification: &Notification) -> Result<()> {
    info!(title = %notification.title, "showing notification");
    let json = serde_json::to_string(notification)
      .map_err(|e| eyre!("Failed to serialize notification: {}", e))?;
    println!("notification {}", json);
    Ok(())
  }

  fn open_window(&self, url: &Url) -> Result<()> {
    info!(%url, "opening window");
    println!("open {}", url);
    Ok(())
  }

  fn claim(&self) -> Result<()> {
    info!("claimed clients");
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_push_without_payload_uses_defaults() {
    let now = Utc::now();
    let n = Notification::from_push("LockGram", None, now);

    assert_eq!(n.title, "LockGram");
    assert_eq!(n.body, "New update available!");
    assert_eq!(n.data["primaryKey"], "1");
    assert_eq!(n.data["dateOfArrival"], now.timestamp_millis());
    let actions: Vec<_> = n.actions.iter().map(|a| a.action).collect();
    assert_eq!(actions, vec![NotificationAction::Explore, NotificationAction::Close]);
  }

  #[test]
  fn test_push_payload_overrides_body_and_merges_data() {
    let payload = json!({ "body": "3 new messages", "data": { "thread": 42, "primaryKey": "7" } });
    let n = Notification::from_push("LockGram", Some(&payload), Utc::now());

    assert_eq!(n.body, "3 new messages");
    assert_eq!(n.data["thread"], 42);
    assert_eq!(n.data["primaryKey"], "7");
    assert!(n.data.get("dateOfArrival").is_some());
  }

  #[test]
  fn test_malformed_push_payload_falls_back() {
    let n = Notification::from_push("LockGram", Some(&json!("just text")), Utc::now());
    assert_eq!(n.body, "New update available!");
  }

  #[test]
  fn test_update_notification() {
    let n = Notification::update_available("LockGram");
    assert_eq!(n.tag.as_deref(), Some("update-available"));
    assert!(n.require_interaction);
    assert!(n.body.contains("LockGram"));
    let actions: Vec<_> = n.actions.iter().map(|a| a.action).collect();
    assert_eq!(actions, vec![NotificationAction::Update, NotificationAction::Dismiss]);
  }

  #[test]
  fn test_click_outcomes() {
    assert_eq!(click_outcome(Some("explore")), ClickOutcome::OpenRoot);
    assert_eq!(click_outcome(None), ClickOutcome::OpenRoot);
    assert_eq!(click_outcome(Some("unknown")), ClickOutcome::OpenRoot);
    assert_eq!(click_outcome(Some("close")), ClickOutcome::Dismissed);
    assert_eq!(click_outcome(Some("dismiss")), ClickOutcome::Dismissed);
    assert_eq!(click_outcome(Some("update")), ClickOutcome::UpdateAndOpenRoot);
  }

  #[test]
  fn test_notification_serializes_camel_case() {
    let value = serde_json::to_value(Notification::update_available("App")).unwrap();
    assert_eq!(value["requireInteraction"], true);
    assert_eq!(value["actions"][0]["action"], "update");
  }
}
