//! Download engine
//!
//! - Per-provider token sessions with coalesced refresh
//! - Per-host token buckets with adaptive backoff
//! - Byte-range chunks written in place
//! - Atomic resume records
//! - Cooperative pause and resume

mod auth;
mod chunk_fetcher;
mod chunk_worker;
mod download_task;
mod manager;
mod rate_controller;
mod resume_store;
mod retry;
mod throughput;

pub use auth::*;
pub use chunk_fetcher::*;
pub use chunk_worker::*;
pub use download_task::*;
pub use manager::*;
pub use rate_controller::*;
pub use resume_store::*;
pub use retry::*;
pub use throughput::*;
