//! vodfetch core - download engine for IPTV VOD portals
//!
//! Files are split into byte-range chunks that download concurrently
//! straight into the destination, with resumable progress, token refresh
//! and per-host rate control.

pub mod config;
pub mod engine;
mod error;
pub mod naming;

pub use engine::{DownloadManager, TaskRequest};
pub use error::*;
