//! Download task - probes, plans and runs the chunks of one file
//!
//! This is the orchestrator for a single download. It learns size and
//! range support from the server, decides between a fresh start and a
//! resume, runs chunk workers under a per-task limit and finalizes the
//! file in place once every chunk is done.

use crate::engine::auth::{AuthSession, AuthToken};
use crate::engine::chunk_fetcher::{content_range_total, ChunkFetcher};
use crate::engine::chunk_worker::{ChunkContext, ChunkWorker};
use crate::engine::rate_controller::{host_key, RateController};
use crate::engine::resume_store::ResumeStore;
use crate::engine::retry::{parse_retry_after, Backoff};
use crate::engine::throughput::SpeedMeter;
use crate::error::EngineError;
use crate::naming;
use chrono::Utc;
use reqwest::header::{
    ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, ETAG, LAST_MODIFIED, RANGE,
    RETRY_AFTER,
};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::{self, OpenOptions};
use tokio::sync::{broadcast, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vodfetch_types::{
    Chunk, ChunkRecord, ChunkStatus, ContentValidator, EngineConfig, EngineEvent, ResumeRecord,
    TaskError, TaskInfo, TaskState,
};

/// How often the progress reporter rewrites the resume record
const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(2);

/// Numbered variants tried before giving up on a destination
const MAX_NAME_SUFFIX: u32 = 10_000;

/// A source URL and where it should end up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub source_url: String,
    pub destination: PathBuf,
}

impl TaskRequest {
    pub fn new(source_url: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            source_url: source_url.into(),
            destination: destination.into(),
        }
    }
}

/// Collaborators shared by every task of one manager
#[derive(Clone)]
pub struct TaskEnv {
    pub config: Arc<EngineConfig>,
    pub client: Client,
    pub fetcher: Arc<ChunkFetcher>,
    pub rate: Arc<RateController>,
    pub store: Arc<ResumeStore>,
    pub events: broadcast::Sender<EngineEvent>,
}

#[derive(Debug, Default)]
struct ProbeResult {
    total_size: Option<u64>,
    supports_range: bool,
    validator: ContentValidator,
    content_type: Option<String>,
}

enum ProbeStep {
    Done(ProbeResult),
    AuthExpired,
    Throttled(Option<Duration>),
}

/// A download task that runs the chunks of one file
pub struct DownloadTask {
    pub info: TaskInfo,
    env: TaskEnv,
    auth: Option<Arc<AuthSession>>,
    cancel: CancellationToken,
    host: String,
    validator: ContentValidator,
    /// Live byte count across all chunks
    task_bytes: Arc<AtomicU64>,
    /// Highest byte count reported so far; progress never goes backwards
    high_water: Arc<AtomicU64>,
    speed: Arc<AtomicU64>,
    prepared: bool,
    /// The file at `info.destination` is this task's to overwrite
    owns_destination: bool,
}

/// What the store holds for a destination
enum StoredRecord {
    Usable(ResumeRecord),
    /// Our record, but the content changed; the partial file is ours to reuse
    Invalidated,
    /// No record of ours
    Missing,
}

impl DownloadTask {
    pub fn new(
        info: TaskInfo,
        env: TaskEnv,
        auth: Option<Arc<AuthSession>>,
        cancel: CancellationToken,
    ) -> Self {
        let host = host_key(&info.source_url);
        Self {
            info,
            env,
            auth,
            cancel,
            host,
            validator: ContentValidator::default(),
            task_bytes: Arc::new(AtomicU64::new(0)),
            high_water: Arc::new(AtomicU64::new(0)),
            speed: Arc::new(AtomicU64::new(0)),
            prepared: false,
            owns_destination: false,
        }
    }

    pub fn id(&self) -> uuid::Uuid {
        self.info.id
    }

    /// Run the task until it completes, fails or is paused
    pub async fn run(mut self) -> TaskInfo {
        info!(
            task_id = %self.info.id,
            "Starting download task for {:?}",
            self.info.destination
        );
        let config = Arc::clone(&self.env.config);
        let backoff = Backoff::new(
            Duration::from_millis(config.retry_base_delay_ms),
            Duration::from_millis(config.retry_max_delay_ms),
        );
        let mut attempt: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                self.set_state(TaskState::Paused, None);
                break;
            }

            match self.attempt().await {
                Ok(()) => {
                    self.set_state(TaskState::Completed, None);
                    info!(task_id = %self.info.id, "Download completed: {:?}", self.info.destination);
                    break;
                }
                Err(EngineError::Cancelled) => {
                    info!(task_id = %self.info.id, "Download paused: {:?}", self.info.destination);
                    self.set_state(TaskState::Paused, None);
                    break;
                }
                Err(e) => {
                    attempt += 1;
                    if e.is_fatal() || attempt > config.task_retries {
                        error!(
                            task_id = %self.info.id,
                            "Download failed: {:?} - {}",
                            self.info.destination,
                            e
                        );
                        self.set_state(TaskState::Failed, Some(e.to_task_error()));
                        break;
                    }

                    let delay = backoff.delay(attempt);
                    warn!(
                        task_id = %self.info.id,
                        "Task attempt {}/{} failed: {}. Retrying in {:?}",
                        attempt,
                        config.task_retries,
                        e,
                        delay
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        self.info.speed_bps = 0;
        self.info
    }

    async fn attempt(&mut self) -> Result<(), EngineError> {
        if !self.prepared {
            self.prepare().await?;
            self.prepared = true;
        }

        loop {
            match self.download().await {
                Ok(()) => break,
                Err(EngineError::RangeUnsupported) if self.info.supports_range => {
                    self.degrade_to_single_stream().await?;
                }
                Err(e) => return Err(e),
            }
        }

        self.finalize().await
    }

    /// Probe the server and build the chunk plan, fresh or resumed
    async fn prepare(&mut self) -> Result<(), EngineError> {
        self.set_state(TaskState::Probing, None);
        let probe = self.probe().await?;
        info!(
            task_id = %self.info.id,
            size = ?probe.total_size,
            supports_range = probe.supports_range,
            "Probed {}",
            self.host
        );

        // Naming is settled before any byte is written
        let destination = naming::resolve_destination(
            &self.info.destination,
            &self.info.source_url,
            probe.content_type.as_deref(),
        );
        if destination != self.info.destination {
            debug!(task_id = %self.info.id, "Destination resolved to {:?}", destination);
            self.info.destination = destination;
        }
        self.info.total_size = probe.total_size;
        self.info.supports_range = probe.supports_range;
        self.validator = probe.validator;

        let overwrite = match self.stored_record().await? {
            StoredRecord::Usable(record) => {
                self.info.chunks = record.restore_chunks();
                self.owns_destination = true;
                info!(
                    task_id = %self.info.id,
                    "Resuming {:?} at {} of {:?} bytes",
                    self.info.destination,
                    record.completed_bytes(),
                    record.total_size
                );
                return Ok(());
            }
            StoredRecord::Invalidated => true,
            StoredRecord::Missing => self.owns_destination,
        };

        self.info.chunks = self.plan_chunks();
        self.prepare_file(overwrite).await?;
        self.owns_destination = true;
        info!(
            task_id = %self.info.id,
            "Planned {} chunk(s) for {:?}",
            self.info.chunks.len(),
            self.info.destination
        );
        Ok(())
    }

    /// The stored record for this destination and whether it still
    /// describes the server's content
    async fn stored_record(&self) -> Result<StoredRecord, EngineError> {
        let destination = &self.info.destination;
        let Some(record) = self.env.store.load(destination).await? else {
            return Ok(StoredRecord::Missing);
        };
        if record.source_url != self.info.source_url {
            // Another download owns this path
            return Ok(StoredRecord::Missing);
        }

        let file_present = fs::try_exists(destination).await?;
        let valid = file_present
            && !record.chunks.is_empty()
            && record.validator.matches(&self.validator)
            && record.total_size == self.info.total_size
            && record.supports_range == self.info.supports_range;
        if valid {
            return Ok(StoredRecord::Usable(record));
        }

        warn!(
            task_id = %self.info.id,
            "Resume record for {:?} no longer matches the server, starting over",
            destination
        );
        self.env.store.delete(destination).await?;
        self.emit(EngineEvent::ResumeInvalidated {
            task_id: self.info.id,
            destination: destination.clone(),
        });
        Ok(StoredRecord::Invalidated)
    }

    fn plan_chunks(&self) -> Vec<Chunk> {
        match self.info.total_size {
            Some(0) => Vec::new(),
            Some(total) if self.info.supports_range => {
                calculate_chunks(total, self.chunk_count(total))
            }
            Some(total) => vec![Chunk::new(0, 0, total - 1)],
            None => vec![Chunk::open_ended(0, 0)],
        }
    }

    /// Chunks for a fresh start: the configured count, or sized from
    /// measured throughput once the host has history
    fn chunk_count(&self, total: u64) -> u32 {
        let config = &self.env.config;
        let max = config.max_chunks_per_file.max(1) as u64;
        let wanted = match self.env.rate.suggest_chunk_size(&self.host) {
            Some(size) => total.div_ceil(size.max(1)),
            None => config.chunks_per_file.max(1) as u64,
        };
        let by_min_size = (total / config.min_chunk_size.max(1)).max(1);
        wanted.min(by_min_size).min(max).max(1) as u32
    }

    /// Create the destination at its final size.
    ///
    /// Only a file this task owns is truncated; anything else already on
    /// disk is left alone and the next free `Name_N.ext` is claimed instead.
    async fn prepare_file(&mut self, overwrite: bool) -> Result<(), EngineError> {
        if let Some(parent) = self.info.destination.parent() {
            fs::create_dir_all(parent).await?;
        }

        let file = if overwrite {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&self.info.destination)
                .await?
        } else {
            self.claim_destination().await?
        };
        if let Some(total) = self.info.total_size {
            file.set_len(total).await?;
        }
        Ok(())
    }

    /// Atomically create the first unused numbered variant of the destination
    async fn claim_destination(&mut self) -> Result<fs::File, EngineError> {
        let requested = self.info.destination.clone();
        for n in 0..MAX_NAME_SUFFIX {
            let candidate = naming::numbered_destination(&requested, n);
            // A record means a paused download still expects this file
            if self.env.store.load(&candidate).await?.is_some() {
                continue;
            }
            let opened = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&candidate)
                .await;
            match opened {
                Ok(file) => {
                    if candidate != requested {
                        info!(
                            task_id = %self.info.id,
                            "{:?} already exists, saving as {:?}",
                            requested,
                            candidate
                        );
                        self.info.destination = candidate;
                    }
                    return Ok(file);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(EngineError::Unknown(format!(
            "no free file name next to {:?}",
            requested
        )))
    }

    async fn degrade_to_single_stream(&mut self) -> Result<(), EngineError> {
        warn!(
            task_id = %self.info.id,
            "Server stopped honouring byte ranges, switching to a single stream"
        );
        self.info.supports_range = false;
        self.info.chunks = match self.info.total_size {
            Some(0) => Vec::new(),
            Some(total) => vec![Chunk::new(0, 0, total - 1)],
            None => vec![Chunk::open_ended(0, 0)],
        };
        self.task_bytes.store(0, Ordering::Release);
        self.checkpoint(Vec::new()).save().await
    }

    /// Run every incomplete chunk once
    async fn download(&mut self) -> Result<(), EngineError> {
        self.set_state(TaskState::Downloading, None);

        let counters: Vec<Arc<AtomicU64>> = self
            .info
            .chunks
            .iter()
            .map(|c| Arc::new(AtomicU64::new(c.received)))
            .collect();
        self.task_bytes.store(self.info.bytes_done(), Ordering::Release);
        self.emit_progress();

        let pending: Vec<Chunk> = self
            .info
            .chunks
            .iter()
            .filter(|c| !c.is_done())
            .cloned()
            .collect();
        if pending.is_empty() {
            return Ok(());
        }

        let checkpoint = Arc::new(self.checkpoint(counters.clone()));
        checkpoint.save().await?;

        let attempt_cancel = self.cancel.child_token();
        let stop_reporter = CancellationToken::new();
        let reporter = self.spawn_progress_reporter(Arc::clone(&checkpoint), stop_reporter.clone());

        let config = &self.env.config;
        let ctx = Arc::new(ChunkContext {
            task_id: self.info.id,
            url: self.info.source_url.clone(),
            destination: self.info.destination.clone(),
            host: self.host.clone(),
            fetcher: Arc::clone(&self.env.fetcher),
            rate: Arc::clone(&self.env.rate),
            auth: self.auth.clone(),
            retries: config.chunk_retries,
            max_auth_refreshes: config.max_auth_refreshes,
            backoff: Backoff::new(
                Duration::from_millis(config.retry_base_delay_ms),
                Duration::from_millis(config.retry_max_delay_ms),
            ),
            task_bytes: Arc::clone(&self.task_bytes),
            cancel: attempt_cancel.clone(),
        });

        let slots = Arc::new(Semaphore::new(config.chunk_concurrency.max(1)));
        let mut join_set = JoinSet::new();
        for chunk in pending {
            let index = chunk.index;
            self.info.chunks[index as usize].status = ChunkStatus::InFlight;
            let worker = ChunkWorker::new(
                Arc::clone(&ctx),
                chunk,
                self.info.supports_range,
                Arc::clone(&counters[index as usize]),
            );
            let slots = Arc::clone(&slots);
            let cancel = attempt_cancel.clone();

            join_set.spawn(async move {
                // Cancellation is checked before a chunk starts, too
                let slot = tokio::select! {
                    _ = cancel.cancelled() => return (index, Err(EngineError::Cancelled)),
                    slot = slots.acquire_owned() => slot,
                };
                let Ok(_slot) = slot else {
                    return (index, Err(EngineError::Cancelled));
                };
                (index, worker.run().await)
            });
        }

        let mut failure: Option<EngineError> = None;
        let mut degrade = false;

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, Ok(received))) => {
                    let chunk = &mut self.info.chunks[index as usize];
                    chunk.received = received;
                    chunk.status = ChunkStatus::Done;
                    if chunk.is_open_ended() {
                        // Stream length is only known now
                        self.info.total_size = Some(chunk.start + received);
                    }
                    debug!(task_id = %self.info.id, chunk = index, "chunk done");
                    if let Err(e) = checkpoint.save().await {
                        attempt_cancel.cancel();
                        failure = Some(prefer_fatal(failure, e));
                    }
                }
                Ok((index, Err(EngineError::Cancelled))) => {
                    self.info.chunks[index as usize].status = ChunkStatus::Pending;
                }
                Ok((index, Err(EngineError::RangeUnsupported))) => {
                    self.info.chunks[index as usize].status = ChunkStatus::Pending;
                    degrade = true;
                    attempt_cancel.cancel();
                }
                Ok((index, Err(e))) => {
                    self.info.chunks[index as usize].status = ChunkStatus::Failed;
                    warn!(task_id = %self.info.id, chunk = index, "chunk failed: {}", e);
                    // Siblings finish on their own unless nothing can succeed now
                    if e.is_fatal() {
                        attempt_cancel.cancel();
                    }
                    failure = Some(prefer_fatal(failure, e));
                }
                Err(e) => {
                    error!(task_id = %self.info.id, "Chunk task panicked: {}", e);
                    attempt_cancel.cancel();
                    failure = Some(prefer_fatal(
                        failure,
                        EngineError::Unknown(format!("chunk task panicked: {}", e)),
                    ));
                }
            }
        }

        stop_reporter.cancel();
        let _ = reporter.await;
        self.info.speed_bps = self.speed.load(Ordering::Acquire);

        for (chunk, counter) in self.info.chunks.iter_mut().zip(&counters) {
            if !chunk.is_done() {
                chunk.received = counter.load(Ordering::Acquire);
            }
        }
        checkpoint.save().await?;
        self.emit_progress();

        if let Some(e) = failure {
            return Err(e);
        }
        if degrade {
            return Err(EngineError::RangeUnsupported);
        }
        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        if !self.info.chunks.iter().all(|c| c.is_done()) {
            return Err(EngineError::Unknown("chunks left incomplete".to_string()));
        }
        Ok(())
    }

    /// Verify the byte count, settle the file length and drop the resume record
    async fn finalize(&mut self) -> Result<(), EngineError> {
        let received = self.info.bytes_done();
        let total = *self.info.total_size.get_or_insert(received);
        if received != total {
            // Start over on the next attempt
            self.prepared = false;
            self.env.store.delete(&self.info.destination).await?;
            return Err(EngineError::SizeMismatch {
                expected: total,
                actual: received,
            });
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&self.info.destination)
            .await?;
        if file.metadata().await?.len() != total {
            file.set_len(total).await?;
        }
        file.sync_all().await?;

        self.env.store.delete(&self.info.destination).await?;
        self.emit_progress();
        Ok(())
    }

    /// Learn size, range support and validators, retrying auth and throttle answers
    async fn probe(&self) -> Result<ProbeResult, EngineError> {
        let config = &self.env.config;
        let mut token = match &self.auth {
            Some(auth) => Some(auth.acquire().await?),
            None => None,
        };
        let mut refreshes: u32 = 0;
        let mut throttles: u32 = 0;

        loop {
            let step = tokio::select! {
                _ = self.cancel.cancelled() => return Err(EngineError::Cancelled),
                step = self.probe_once(token.as_deref()) => step?,
            };

            match step {
                ProbeStep::Done(result) => return Ok(result),
                ProbeStep::AuthExpired => {
                    refreshes += 1;
                    let (Some(auth), Some(rejected)) = (&self.auth, token.as_deref()) else {
                        return Err(EngineError::AuthFailure {
                            provider: self.host.clone(),
                            message: "server requires credentials that are not configured"
                                .to_string(),
                        });
                    };
                    if refreshes > config.max_auth_refreshes {
                        return Err(EngineError::AuthFailure {
                            provider: auth.provider_name().to_string(),
                            message: format!("token still rejected after {} refreshes", refreshes - 1),
                        });
                    }
                    token = Some(auth.report_rejected(rejected).await?);
                }
                ProbeStep::Throttled(retry_after) => {
                    throttles += 1;
                    let backoff = self.env.rate.report_throttled(&self.host);
                    if throttles > config.chunk_retries {
                        return Err(EngineError::Throttled {
                            host: self.host.clone(),
                        });
                    }
                    let delay = retry_after.unwrap_or_default().max(backoff);
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(EngineError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// HEAD first; a one-byte ranged GET when HEAD leaves questions open
    async fn probe_once(&self, token: Option<&AuthToken>) -> Result<ProbeStep, EngineError> {
        let _permit = self.env.rate.acquire(&self.host, 0).await;
        let mut result = ProbeResult::default();
        let mut head_ok = false;

        match self.send(self.request(token, Method::HEAD)?).await {
            Ok(response) => {
                if let Some(step) = self.rejection(&response) {
                    return Ok(step);
                }
                if response.status().is_success() {
                    head_ok = true;
                    result.total_size = header_u64(&response, CONTENT_LENGTH).filter(|&n| n > 0);
                    result.supports_range = response
                        .headers()
                        .get(ACCEPT_RANGES)
                        .and_then(|v| v.to_str().ok())
                        .map(|s| s.eq_ignore_ascii_case("bytes"))
                        .unwrap_or(false);
                    fill_metadata(&mut result, &response);
                } else {
                    debug!(status = response.status().as_u16(), "HEAD not usable, probing with GET");
                }
            }
            Err(e) => debug!("HEAD failed ({}), probing with GET", e),
        }

        if head_ok && result.supports_range && result.total_size.is_some() {
            result.validator.size = result.total_size;
            return Ok(ProbeStep::Done(result));
        }

        let response = self
            .send(self.request(token, Method::GET)?.header(RANGE, "bytes=0-0"))
            .await?;
        if let Some(step) = self.rejection(&response) {
            return Ok(step);
        }

        let status = response.status();
        if status == StatusCode::PARTIAL_CONTENT {
            result.supports_range = true;
            let total = response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(content_range_total);
            if total.is_some() {
                result.total_size = total;
            }
        } else if status.is_success() {
            // Full body for a partial request
            result.supports_range = false;
            if result.total_size.is_none() {
                result.total_size = header_u64(&response, CONTENT_LENGTH);
            }
        } else if status == StatusCode::RANGE_NOT_SATISFIABLE {
            // Only an empty resource refuses the first byte
            result.supports_range = false;
            result.total_size = Some(0);
        } else if !head_ok {
            return Err(EngineError::ServerError {
                status: status.as_u16(),
                message: format!("probe of {} failed", self.host),
            });
        }
        fill_metadata(&mut result, &response);

        result.validator.size = result.total_size;
        Ok(ProbeStep::Done(result))
    }

    /// Send with the read timeout applied to the response headers
    async fn send(&self, builder: RequestBuilder) -> Result<Response, EngineError> {
        let deadline = Duration::from_secs(self.env.config.read_timeout_secs.max(1));
        match tokio::time::timeout(deadline, builder.send()).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(EngineError::Timeout),
        }
    }

    fn rejection(&self, response: &Response) -> Option<ProbeStep> {
        let code = response.status().as_u16();
        if self.env.fetcher.is_auth_status(code) {
            return Some(ProbeStep::AuthExpired);
        }
        if self.env.fetcher.is_throttle_status(code) {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            return Some(ProbeStep::Throttled(retry_after));
        }
        None
    }

    fn request(&self, token: Option<&AuthToken>, method: Method) -> Result<RequestBuilder, EngineError> {
        match token {
            Some(token) => token.request(&self.env.client, method, &self.info.source_url),
            None => Ok(self.env.client.request(method, &self.info.source_url)),
        }
    }

    fn checkpoint(&self, counters: Vec<Arc<AtomicU64>>) -> Checkpoint {
        let counters = if counters.is_empty() {
            self.info
                .chunks
                .iter()
                .map(|c| Arc::new(AtomicU64::new(c.received)))
                .collect()
        } else {
            counters
        };
        Checkpoint {
            store: Arc::clone(&self.env.store),
            template: ResumeRecord {
                destination: self.info.destination.clone(),
                source_url: self.info.source_url.clone(),
                total_size: self.info.total_size,
                supports_range: self.info.supports_range,
                validator: self.validator.clone(),
                chunks: Vec::new(),
                updated_at: Utc::now(),
            },
            ranges: self.info.chunks.iter().map(|c| (c.start, c.end)).collect(),
            counters,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Spawn a background task to report progress periodically
    fn spawn_progress_reporter(
        &self,
        checkpoint: Arc<Checkpoint>,
        stop: CancellationToken,
    ) -> JoinHandle<()> {
        let task_id = self.info.id;
        let total = self.info.total_size;
        let task_bytes = Arc::clone(&self.task_bytes);
        let high_water = Arc::clone(&self.high_water);
        let speed = Arc::clone(&self.speed);
        let events = self.env.events.clone();
        let interval = Duration::from_millis(self.env.config.progress_interval_ms.max(50));

        tokio::spawn(async move {
            let mut meter = SpeedMeter::new();
            let mut last_bytes = task_bytes.load(Ordering::Acquire);
            let mut last_time = Instant::now();
            let mut last_save = Instant::now();

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                let now = Instant::now();
                let bytes = task_bytes.load(Ordering::Acquire);
                let current_speed =
                    meter.sample(bytes.saturating_sub(last_bytes), now.duration_since(last_time));
                speed.store(current_speed, Ordering::Release);
                let reported = high_water.fetch_max(bytes, Ordering::AcqRel).max(bytes);

                let _ = events.send(EngineEvent::TaskProgress {
                    task_id,
                    bytes_done: reported,
                    bytes_total: total,
                    speed_bps: current_speed,
                });

                if last_save.elapsed() >= CHECKPOINT_INTERVAL {
                    if let Err(e) = checkpoint.save().await {
                        warn!(task_id = %task_id, "Failed to checkpoint progress: {}", e);
                    }
                    last_save = now;
                }

                last_bytes = bytes;
                last_time = now;
            }
        })
    }

    fn emit_progress(&self) {
        let bytes = self.task_bytes.load(Ordering::Acquire);
        let reported = self.high_water.fetch_max(bytes, Ordering::AcqRel).max(bytes);
        self.emit(EngineEvent::TaskProgress {
            task_id: self.info.id,
            bytes_done: reported,
            bytes_total: self.info.total_size,
            speed_bps: self.speed.load(Ordering::Acquire),
        });
    }

    fn set_state(&mut self, state: TaskState, error: Option<TaskError>) {
        if self.info.state == state && error.is_none() {
            return;
        }
        if self.info.state.is_terminal() {
            warn!(task_id = %self.info.id, "ignoring {} after {}", state, self.info.state);
            return;
        }
        debug!(task_id = %self.info.id, "{} -> {}", self.info.state, state);
        self.info.state = state;
        self.info.last_error = error.clone();
        self.emit(EngineEvent::TaskStateChanged {
            task_id: self.info.id,
            new_state: state,
            error,
        });
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.env.events.send(event);
    }
}

/// Serialized writer of one task's resume record
struct Checkpoint {
    store: Arc<ResumeStore>,
    template: ResumeRecord,
    ranges: Vec<(u64, u64)>,
    counters: Vec<Arc<AtomicU64>>,
    write_lock: tokio::sync::Mutex<()>,
}

impl Checkpoint {
    async fn save(&self) -> Result<(), EngineError> {
        let _guard = self.write_lock.lock().await;
        let mut record = self.template.clone();
        record.chunks = self
            .ranges
            .iter()
            .zip(&self.counters)
            .map(|(&(start, end), counter)| ChunkRecord {
                start,
                end,
                received: counter.load(Ordering::Acquire),
            })
            .collect();
        record.updated_at = Utc::now();
        self.store.save(&record).await
    }
}

/// Split `total` bytes into `count` equal chunks; the last takes the remainder
pub fn calculate_chunks(total: u64, count: u32) -> Vec<Chunk> {
    if total == 0 {
        return Vec::new();
    }
    let count = (count.max(1) as u64).min(total);
    let chunk_size = total / count;

    (0..count)
        .map(|i| {
            let start = i * chunk_size;
            let end = if i == count - 1 {
                total - 1
            } else {
                (i + 1) * chunk_size - 1
            };
            Chunk::new(i as u32, start, end)
        })
        .collect()
}

fn prefer_fatal(current: Option<EngineError>, new: EngineError) -> EngineError {
    match current {
        Some(existing) if existing.is_fatal() || !new.is_fatal() => existing,
        _ => new,
    }
}

fn header_u64(response: &Response, name: reqwest::header::HeaderName) -> Option<u64> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse().ok())
}

fn header_string(response: &Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Copy validators and content type, keeping values already known
fn fill_metadata(result: &mut ProbeResult, response: &Response) {
    if result.validator.etag.is_none() {
        result.validator.etag = header_string(response, ETAG);
    }
    if result.validator.last_modified.is_none() {
        result.validator.last_modified = header_string(response, LAST_MODIFIED);
    }
    if result.content_type.is_none() {
        result.content_type = header_string(response, CONTENT_TYPE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::rate_controller::RateSettings;
    use wiremock::matchers::{header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn chunks_cover_the_whole_file() {
        let chunks = calculate_chunks(10 * 1024 * 1024, 4);
        assert_eq!(chunks.len(), 4);
        assert!(chunks.iter().all(|c| c.len() == Some(2_621_440)));
        assert_eq!(chunks[0].start, 0);
        assert_eq!(chunks[3].end, 10 * 1024 * 1024 - 1);
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].end + 1, pair[1].start);
        }
    }

    #[test]
    fn last_chunk_takes_remainder() {
        let chunks = calculate_chunks(10, 3);
        let lens: Vec<u64> = chunks.iter().map(|c| c.len().unwrap()).collect();
        assert_eq!(lens, vec![3, 3, 4]);
    }

    #[test]
    fn tiny_files_get_at_most_one_chunk_per_byte() {
        assert_eq!(calculate_chunks(2, 8).len(), 2);
        assert!(calculate_chunks(0, 4).is_empty());
    }

    #[test]
    fn fatal_errors_win() {
        let network = EngineError::Timeout;
        let disk = EngineError::Io(std::io::Error::new(std::io::ErrorKind::Other, "full"));
        assert!(prefer_fatal(Some(network), disk).is_fatal());

        let disk = EngineError::Io(std::io::Error::new(std::io::ErrorKind::Other, "full"));
        assert!(prefer_fatal(Some(disk), EngineError::Timeout).is_fatal());
    }

    async fn task_for(url: String, dir: &std::path::Path, config: EngineConfig) -> DownloadTask {
        let (events, _) = broadcast::channel(64);
        let config = Arc::new(config);
        let client = Client::new();
        let env = TaskEnv {
            fetcher: Arc::new(ChunkFetcher::new(client.clone(), &config)),
            rate: Arc::new(RateController::new(RateSettings::from(config.as_ref()))),
            store: Arc::new(ResumeStore::new(dir.join("state")).await.unwrap()),
            config,
            client,
            events,
        };
        let info = TaskInfo::new(url, dir.join("out"));
        DownloadTask::new(info, env, None, CancellationToken::new())
    }

    #[tokio::test]
    async fn probe_prefers_head() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(vec![0u8; 5000])
                    .insert_header("Accept-Ranges", "bytes")
                    .insert_header("ETag", "\"v1\""),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let task = task_for(format!("{}/movie/9.mkv", server.uri()), dir.path(), EngineConfig::default()).await;
        let probe = task.probe().await.unwrap();

        assert_eq!(probe.total_size, Some(5000));
        assert!(probe.supports_range);
        assert_eq!(probe.validator.etag.as_deref(), Some("\"v1\""));
        assert_eq!(probe.validator.size, Some(5000));
    }

    #[tokio::test]
    async fn probe_falls_back_to_ranged_get() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(405))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(header("Range", "bytes=0-0"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("Content-Range", "bytes 0-0/123456")
                    .insert_header("Content-Type", "video/x-matroska")
                    .set_body_bytes(vec![0u8]),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let task = task_for(format!("{}/play/9", server.uri()), dir.path(), EngineConfig::default()).await;
        let probe = task.probe().await.unwrap();

        assert_eq!(probe.total_size, Some(123_456));
        assert!(probe.supports_range);
        assert_eq!(probe.content_type.as_deref(), Some("video/x-matroska"));
    }

    #[tokio::test]
    async fn chunk_count_respects_minimum_size() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.min_chunk_size = 1000;
        config.chunks_per_file = 8;
        let task = task_for("http://h/x.mkv".into(), dir.path(), config).await;

        assert_eq!(task.chunk_count(100_000), 8);
        assert_eq!(task.chunk_count(3_500), 3);
        assert_eq!(task.chunk_count(10), 1);
    }

    fn head_ok(len: usize) -> ResponseTemplate {
        ResponseTemplate::new(200)
            .set_body_bytes(vec![0u8; len])
            .insert_header("Accept-Ranges", "bytes")
            .insert_header("ETag", "\"v1\"")
    }

    #[tokio::test]
    async fn probe_gives_up_on_stalled_headers() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(head_ok(100).set_delay(Duration::from_secs(4)))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(206).set_delay(Duration::from_secs(4)))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            read_timeout_secs: 1,
            ..Default::default()
        };
        let task = task_for(format!("{}/movie/9.mkv", server.uri()), dir.path(), config).await;

        let started = Instant::now();
        let err = task.probe().await.unwrap_err();
        assert!(matches!(err, EngineError::Timeout));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn fresh_start_never_overwrites_an_existing_file() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(head_ok(5000))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("out.mkv"), b"finished earlier").unwrap();

        let mut task = task_for(format!("{}/movie/9.mkv", server.uri()), dir.path(), EngineConfig::default()).await;
        task.prepare().await.unwrap();

        assert_eq!(task.info.destination, dir.path().join("out_1.mkv"));
        assert_eq!(std::fs::read(dir.path().join("out.mkv")).unwrap(), b"finished earlier");
        assert_eq!(std::fs::metadata(dir.path().join("out_1.mkv")).unwrap().len(), 5000);

        // A second preparation of the same task reuses its own file
        task.prepare().await.unwrap();
        assert_eq!(task.info.destination, dir.path().join("out_1.mkv"));
        assert!(!dir.path().join("out_2.mkv").exists());
    }

    #[tokio::test]
    async fn terminal_state_is_final() {
        let dir = tempfile::tempdir().unwrap();
        let mut task = task_for("http://h/x.mkv".into(), dir.path(), EngineConfig::default()).await;
        let mut events = task.env.events.subscribe();

        task.set_state(TaskState::Completed, None);
        task.set_state(TaskState::Paused, None);

        assert_eq!(task.info.state, TaskState::Completed);
        assert!(matches!(
            events.try_recv(),
            Ok(EngineEvent::TaskStateChanged { new_state: TaskState::Completed, .. })
        ));
        assert!(events.try_recv().is_err());
    }
}
