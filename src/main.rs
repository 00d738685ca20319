mod cache;
mod classify;
mod config;
mod db;
mod error;
mod lifecycle;
mod logging;
mod messages;
mod net;
mod notify;
mod queue;
#[cfg(test)]
mod testing;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::cache::CacheStorage;
use crate::net::{Request, QUEUED_HEADER};
use crate::notify::ConsoleClients;
use crate::worker::{ServiceWorker, WorkerEvent, WorkerReply};

#[derive(Parser, Debug)]
#[command(name = "pwa-cache")]
#[command(about = "Offline-first request interception and caching for static web apps")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/pwa-cache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Install the configured version and precache its manifest
  Install,
  /// Activate the configured version and drop superseded caches
  Activate,
  /// Resolve a request through the cache strategies
  Fetch {
    /// Absolute URL, or a path relative to the configured origin
    url: String,
    /// HTTP method
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
    /// Request header as "Name: value" (repeatable)
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,
    /// Request body
    #[arg(short, long)]
    data: Option<String>,
    /// Treat the request as a page navigation
    #[arg(long)]
    navigate: bool,
  },
  /// Post a JSON message, e.g. '{"type":"GET_VERSION"}'
  Message { json: String },
  /// Deliver a push message with an optional JSON payload
  Push { payload: Option<String> },
  /// Click a notification action (explore, close, update, dismiss)
  Click { action: Option<String> },
  /// Signal restored connectivity and replay queued actions
  Sync { tag: Option<String> },
  /// List queued offline actions, or show one in full
  Queue { id: Option<String> },
  /// List cache partitions
  Partitions,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config)?;

  let worker = ServiceWorker::open(config.clone(), Arc::new(ConsoleClients))?;
  info!(version = %config.version_tag(), origin = %config.origin, "worker opened");

  let event = match args.command {
    Command::Install => WorkerEvent::Install,
    Command::Activate => WorkerEvent::Activate,
    Command::Fetch {
      url,
      method,
      headers,
      data,
      navigate,
    } => {
      let url = config.resolve_url(&url)?;
      let mut request = if navigate {
        Request::navigate(url)
      } else {
        Request::get(url)
      }
      .with_method(&method);
      for header in &headers {
        let (name, value) = header
          .split_once(':')
          .ok_or_else(|| eyre!("Invalid header '{}', expected \"Name: value\"", header))?;
        request = request.with_header(name.trim(), value.trim());
      }
      if let Some(body) = data {
        request = request.with_body(body);
      }
      WorkerEvent::Fetch(request)
    }
    Command::Message { json } => WorkerEvent::Message(
      serde_json::from_str(&json).map_err(|e| eyre!("Invalid message JSON: {}", e))?,
    ),
    Command::Push { payload } => WorkerEvent::Push(
      payload
        .map(|p| serde_json::from_str(&p))
        .transpose()
        .map_err(|e| eyre!("Invalid push payload: {}", e))?,
    ),
    Command::Click { action } => WorkerEvent::NotificationClick(action),
    Command::Sync { tag } => WorkerEvent::Sync(tag.unwrap_or_else(|| config.sync_tag.clone())),
    Command::Queue { id: Some(id) } => {
      let action = worker
        .queue()
        .get(&id)?
        .ok_or_else(|| eyre!("No queued action with id {}", id))?;
      println!("{} {}", action.method, action.url);
      for (name, value) in &action.headers {
        println!("{}: {}", name, value);
      }
      if let Some(body) = &action.body {
        println!();
        println!("{}", String::from_utf8_lossy(body));
      }
      return Ok(());
    }
    Command::Queue { id: None } => {
      for action in worker.queue().list()? {
        println!(
          "{}  {}  {} {}",
          action.created_at.to_rfc3339(),
          action.id,
          action.method,
          action.url
        );
      }
      return Ok(());
    }
    Command::Partitions => {
      let active = worker.lifecycle().active_partitions()?;
      for name in worker.storage().partition_names()? {
        let marker = if active.contains(&name) { "*" } else { " " };
        println!("{} {} ({} entries)", marker, name, worker.storage().keys(&name)?.len());
      }
      return Ok(());
    }
  };

  let reply = worker.dispatch(event).await?;
  print_reply(reply).await
}

async fn print_reply(reply: WorkerReply) -> Result<()> {
  match reply {
    WorkerReply::Installed(outcome) => println!("{}", to_json(&outcome)?),
    WorkerReply::Activated { removed } => {
      println!("activated");
      for name in removed {
        println!("removed {}", name);
      }
    }
    WorkerReply::Response(resolved) => {
      let response = &resolved.response;
      println!(
        "HTTP {} {} ({:?})",
        response.status, response.status_text, resolved.source
      );
      for (name, value) in &response.headers {
        println!("{}: {}", name, value);
      }
      println!();
      println!("{}", response.body_text());
      if let Some(id) = response.header(QUEUED_HEADER) {
        eprintln!("queued offline action {}, run `pwa-cache sync` once back online", id);
      }

      // Let the background refresh land before the process exits
      if let Some(revalidation) = resolved.revalidation {
        revalidation
          .await
          .map_err(|e| eyre!("Revalidation task failed: {}", e))?;
      }
    }
    WorkerReply::Passthrough => println!("passthrough"),
    WorkerReply::Message(Some(reply)) => println!("{}", to_json(&reply)?),
    WorkerReply::Message(None) => println!("ok"),
    // ConsoleClients already printed it
    WorkerReply::Notified => {}
    WorkerReply::Clicked(outcome) => println!("{}", to_json(&outcome)?),
    WorkerReply::Synced(summary) => println!("{}", to_json(&summary)?),
    WorkerReply::Ignored => println!("ignored"),
  }

  Ok(())
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
  serde_json::to_string(value).map_err(|e| eyre!("Failed to serialize reply: {}", e))
}
