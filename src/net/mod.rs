//! Network boundary: request/response values, request identity, and the fetcher.

mod cache;
mod client;
mod types;

pub use cache::RequestKey;
pub use client::{Fetcher, HttpFetcher};
pub use types::{Request, ResponseSnapshot, QUEUED_HEADER};
