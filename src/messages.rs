//! Typed messages pages post to the worker, and the replies it sends back.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
  /// Activate a waiting version now
  SkipWaiting,
  /// Ask for the active version tag
  GetVersion,
  /// Delete every cache partition
  ClearCache,
  /// Any other `type`; ignored
  #[serde(other)]
  Unknown,
}

impl WorkerMessage {
  /// Parse a posted message. Anything without a string `type` is not a
  /// worker message.
  pub fn parse(value: &Value) -> Option<Self> {
    serde_json::from_value(value.clone()).ok()
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum MessageReply {
  Version { version: String },
  Cleared { success: bool },
}
