//! Shared types for vodfetch
//!
//! This crate contains the data structures shared between the download
//! engine and the runner: task and chunk state, resume records, events
//! and configuration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

// ============================================================================
// Task Types
// ============================================================================

/// Lifecycle state of a download task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Probing,
    Downloading,
    Paused,
    Completed,
    Failed,
}

impl TaskState {
    /// Completed and Failed are final; Paused can be resumed in a later run
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Pending => "pending",
            TaskState::Probing => "probing",
            TaskState::Downloading => "downloading",
            TaskState::Paused => "paused",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Status of a single byte-range chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    Pending,
    InFlight,
    Done,
    Failed,
}

/// A byte range of a download.
///
/// `end` is inclusive. An open-ended chunk (total size unknown) uses
/// `u64::MAX` as its end until the stream finishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub index: u32,
    pub start: u64,
    pub end: u64,
    pub received: u64,
    pub status: ChunkStatus,
}

impl Chunk {
    pub fn new(index: u32, start: u64, end: u64) -> Self {
        Self {
            index,
            start,
            end,
            received: 0,
            status: ChunkStatus::Pending,
        }
    }

    /// A single chunk covering a stream of unknown length
    pub fn open_ended(index: u32, start: u64) -> Self {
        Self::new(index, start, u64::MAX)
    }

    /// Check if this chunk has no known end
    pub fn is_open_ended(&self) -> bool {
        self.end == u64::MAX
    }

    /// Length of the range in bytes, `None` while open-ended
    pub fn len(&self) -> Option<u64> {
        if self.is_open_ended() {
            None
        } else {
            Some(self.end - self.start + 1)
        }
    }

    pub fn is_done(&self) -> bool {
        self.status == ChunkStatus::Done
    }

    /// Rebuild a chunk from its persisted form
    pub fn from_record(index: u32, record: &ChunkRecord) -> Self {
        let mut chunk = Chunk::new(index, record.start, record.end);
        chunk.received = match chunk.len() {
            Some(len) => record.received.min(len),
            None => record.received,
        };
        if chunk.len() == Some(chunk.received) {
            chunk.status = ChunkStatus::Done;
        }
        chunk
    }
}

/// Reason category reported for a failed task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureCategory {
    Network,
    Auth,
    Disk,
    Server,
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureCategory::Network => "network",
            FailureCategory::Auth => "auth",
            FailureCategory::Disk => "disk",
            FailureCategory::Server => "server",
        };
        f.write_str(s)
    }
}

/// Human-readable failure attached to a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub category: FailureCategory,
    pub message: String,
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.category, self.message)
    }
}

/// Snapshot of one download task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: Uuid,
    pub destination: PathBuf,
    pub source_url: String,
    pub total_size: Option<u64>,
    pub supports_range: bool,
    pub chunks: Vec<Chunk>,
    pub state: TaskState,
    pub last_error: Option<TaskError>,
    pub speed_bps: u64,
}

impl TaskInfo {
    pub fn new(source_url: String, destination: PathBuf) -> Self {
        Self {
            id: Uuid::new_v4(),
            destination,
            source_url,
            total_size: None,
            supports_range: false,
            chunks: Vec::new(),
            state: TaskState::Pending,
            last_error: None,
            speed_bps: 0,
        }
    }

    /// Bytes received across all chunks
    pub fn bytes_done(&self) -> u64 {
        self.chunks.iter().map(|c| c.received).sum()
    }

    pub fn progress(&self) -> f64 {
        match self.total_size {
            Some(size) if size > 0 => (self.bytes_done() as f64 / size as f64) * 100.0,
            _ => 0.0,
        }
    }
}

// ============================================================================
// Resume Types
// ============================================================================

/// Server-side identity of the content, used to detect changes between runs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentValidator {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub size: Option<u64>,
}

impl ContentValidator {
    /// Compare against the validator the server reports now.
    ///
    /// Strongest common field wins: ETag, then Last-Modified, then size.
    /// With nothing in common the content is assumed changed.
    pub fn matches(&self, current: &ContentValidator) -> bool {
        if let (Some(a), Some(b)) = (&self.etag, &current.etag) {
            return a == b;
        }
        if let (Some(a), Some(b)) = (&self.last_modified, &current.last_modified) {
            return a == b && self.size == current.size;
        }
        match (self.size, current.size) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

/// Persisted progress of one chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub start: u64,
    pub end: u64,
    pub received: u64,
}

/// Durable snapshot of an incomplete task, keyed by destination path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeRecord {
    pub destination: PathBuf,
    pub source_url: String,
    pub total_size: Option<u64>,
    pub supports_range: bool,
    pub validator: ContentValidator,
    pub chunks: Vec<ChunkRecord>,
    pub updated_at: DateTime<Utc>,
}

impl ResumeRecord {
    /// Bytes already on disk according to this record
    pub fn completed_bytes(&self) -> u64 {
        self.chunks.iter().map(|c| c.received).sum()
    }

    /// Chunks rebuilt from the record, in offset order
    pub fn restore_chunks(&self) -> Vec<Chunk> {
        let mut chunks: Vec<Chunk> = self
            .chunks
            .iter()
            .enumerate()
            .map(|(i, rec)| Chunk::from_record(i as u32, rec))
            .collect();
        chunks.sort_by_key(|c| c.start);
        for (i, chunk) in chunks.iter_mut().enumerate() {
            chunk.index = i as u32;
        }
        chunks
    }

    pub fn progress(&self) -> f64 {
        match self.total_size {
            Some(size) if size > 0 => (self.completed_bytes() as f64 / size as f64) * 100.0,
            _ => 0.0,
        }
    }
}

// ============================================================================
// Input Types
// ============================================================================

/// Kind of playlist entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    #[default]
    Vod,
    Series,
}

/// A named download target produced by the playlist collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaylistEntry {
    pub name: String,
    pub source_url: String,
    #[serde(default)]
    pub kind: EntryKind,
}

// ============================================================================
// Event Types
// ============================================================================

/// Events emitted by the engine to the presentation layer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum EngineEvent {
    TaskAdded {
        task_id: Uuid,
        destination: PathBuf,
        source_url: String,
    },
    TaskProgress {
        task_id: Uuid,
        bytes_done: u64,
        bytes_total: Option<u64>,
        speed_bps: u64,
    },
    TaskStateChanged {
        task_id: Uuid,
        new_state: TaskState,
        error: Option<TaskError>,
    },
    ResumeInvalidated {
        task_id: Uuid,
        destination: PathBuf,
    },
    ProviderAuthFailed {
        provider: String,
        message: String,
    },
    BatchCompleted {
        succeeded: usize,
        failed: usize,
    },
}

/// Outcome counts of one manager run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub paused: usize,
}

// ============================================================================
// Settings Types
// ============================================================================

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding resume records (None = platform data dir)
    pub state_dir: Option<PathBuf>,
    /// Default root for playlist entries
    pub output_dir: PathBuf,
    pub max_concurrent_tasks: usize,
    /// Chunks per file on a fresh start without throughput history
    pub chunks_per_file: u32,
    pub max_chunks_per_file: u32,
    /// Concurrent chunk fetches per task
    pub chunk_concurrency: usize,
    pub chunk_retries: u32,
    pub task_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub min_chunk_size: u64,
    pub max_chunk_size: u64,
    /// Chunk duration the adaptive sizing aims for
    pub target_chunk_secs: u64,
    pub host_connection_limit: usize,
    /// Bytes per second per host (0 = unlimited)
    pub host_speed_limit: u64,
    pub max_backoff_multiplier: u32,
    pub throttle_base_delay_ms: u64,
    /// Consecutive successes before a throttled host recovers one step
    pub recovery_successes: u32,
    pub progress_interval_ms: u64,
    pub user_agent: String,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    /// Statuses that mean the bearer token expired (458 is portal-specific)
    pub auth_expired_statuses: Vec<u16>,
    pub throttle_statuses: Vec<u16>,
    pub max_auth_refreshes: u32,
    pub token_refresh_skew_secs: u64,
    pub providers: Vec<ProviderConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_dir: None,
            output_dir: dirs::download_dir()
                .map(|p| p.join("vodfetch"))
                .unwrap_or_else(|| PathBuf::from(".")),
            max_concurrent_tasks: 3,
            chunks_per_file: 4,
            max_chunks_per_file: 16,
            chunk_concurrency: 4,
            chunk_retries: 3,
            task_retries: 2,
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 32_000,
            min_chunk_size: 1024 * 1024,
            max_chunk_size: 64 * 1024 * 1024,
            target_chunk_secs: 20,
            host_connection_limit: 6,
            host_speed_limit: 0,
            max_backoff_multiplier: 16,
            throttle_base_delay_ms: 2000,
            recovery_successes: 4,
            progress_interval_ms: 500,
            user_agent: "VLC/3.0.16 LibVLC/3.0.16".to_string(),
            connect_timeout_secs: 60,
            read_timeout_secs: 60,
            auth_expired_statuses: vec![401, 458],
            throttle_statuses: vec![429],
            max_auth_refreshes: 3,
            token_refresh_skew_secs: 30,
            providers: Vec::new(),
        }
    }
}

/// Credentials for one IPTV portal, supplied at engine start
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub base_url: String,
    pub username: String,
    /// Never written back out
    #[serde(default, skip_serializing)]
    pub password: String,
    /// Query parameter carrying the token instead of a bearer header
    #[serde(default)]
    pub token_param: Option<String>,
    /// Lifetime assumed when the portal does not report one
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,
}

fn default_token_ttl() -> u64 {
    600
}

impl ProviderConfig {
    /// Host this provider serves, lowercased
    pub fn host(&self) -> Option<String> {
        url::Url::parse(&self.base_url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_lowercase()))
    }

    /// Check if a source URL belongs to this provider
    pub fn matches_url(&self, url: &str) -> bool {
        let Some(own_host) = self.host() else {
            return false;
        };
        match url::Url::parse(url).ok().and_then(|u| u.host_str().map(|h| h.to_lowercase())) {
            Some(host) => host == own_host || host.ends_with(&format!(".{}", own_host)),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restored_chunk_marks_full_ranges_done() {
        let rec = ChunkRecord { start: 0, end: 99, received: 100 };
        let chunk = Chunk::from_record(0, &rec);
        assert!(chunk.is_done());

        let rec = ChunkRecord { start: 100, end: 199, received: 40 };
        let chunk = Chunk::from_record(1, &rec);
        assert_eq!(chunk.status, ChunkStatus::Pending);
        assert_eq!(chunk.received, 40);
    }

    #[test]
    fn restored_chunk_clamps_overreported_progress() {
        let rec = ChunkRecord { start: 0, end: 9, received: 50 };
        let chunk = Chunk::from_record(0, &rec);
        assert_eq!(chunk.received, 10);
        assert!(chunk.is_done());
    }

    #[test]
    fn validator_prefers_etag() {
        let saved = ContentValidator {
            etag: Some("\"abc\"".into()),
            last_modified: Some("Mon, 01 Jan 2024 00:00:00 GMT".into()),
            size: Some(10),
        };
        let mut now = saved.clone();
        now.last_modified = Some("Tue, 02 Jan 2024 00:00:00 GMT".into());
        assert!(saved.matches(&now));

        now.etag = Some("\"def\"".into());
        assert!(!saved.matches(&now));
    }

    #[test]
    fn validator_falls_back_to_size() {
        let saved = ContentValidator { size: Some(10), ..Default::default() };
        assert!(saved.matches(&ContentValidator { size: Some(10), ..Default::default() }));
        assert!(!saved.matches(&ContentValidator { size: Some(11), ..Default::default() }));
        assert!(!saved.matches(&ContentValidator::default()));
    }

    #[test]
    fn provider_matches_subdomains() {
        let provider = ProviderConfig {
            name: "portal".into(),
            base_url: "http://portal.example.com:8080".into(),
            username: "u".into(),
            password: "p".into(),
            token_param: None,
            token_ttl_secs: 600,
        };
        assert!(provider.matches_url("http://portal.example.com:8080/movie/1.mkv"));
        assert!(provider.matches_url("http://cdn.portal.example.com/movie/1.mkv"));
        assert!(!provider.matches_url("http://other.example.com/movie/1.mkv"));
    }

    #[test]
    fn provider_password_is_not_serialized() {
        let provider = ProviderConfig {
            name: "portal".into(),
            base_url: "http://portal.example.com".into(),
            username: "user".into(),
            password: "secret".into(),
            token_param: Some("play_token".into()),
            token_ttl_secs: 600,
        };
        let json = serde_json::to_string(&provider).unwrap();
        assert!(!json.contains("secret"));
    }

    #[test]
    fn record_restores_chunks_in_offset_order() {
        let record = ResumeRecord {
            destination: PathBuf::from("/tmp/a.mkv"),
            source_url: "http://x/a.mkv".into(),
            total_size: Some(30),
            supports_range: true,
            validator: ContentValidator::default(),
            chunks: vec![
                ChunkRecord { start: 20, end: 29, received: 0 },
                ChunkRecord { start: 0, end: 9, received: 10 },
                ChunkRecord { start: 10, end: 19, received: 5 },
            ],
            updated_at: Utc::now(),
        };
        let chunks = record.restore_chunks();
        assert_eq!(chunks.iter().map(|c| c.start).collect::<Vec<_>>(), vec![0, 10, 20]);
        assert_eq!(chunks.iter().map(|c| c.index).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(record.completed_bytes(), 15);
    }
}
