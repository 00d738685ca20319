//! Versioned cache partitions and the strategies that read and fill them.
//!
//! This module provides:
//! - Named partitions of request → response snapshots in SQLite
//! - Cache-first, network-first and stale-while-revalidate resolution
//! - Basic offline mode (serve cached copies when the network is unavailable)

mod layer;
mod storage;
mod types;

pub use layer::CacheLayer;
pub use storage::{CacheStorage, SqliteStorage};
pub use types::{version_tag, CacheSource, PartitionNames, Resolved, Strategy};
