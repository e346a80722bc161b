//! Chunk worker - fetches one chunk into its slot of the destination file
//!
//! Every chunk writes straight into its own offset of the destination, so
//! there is nothing to merge afterwards. The worker owns the retry policy
//! for a single chunk: token refreshes and throttling are retried without
//! touching the network retry budget.

use crate::engine::auth::{AuthSession, AuthToken};
use crate::engine::chunk_fetcher::{ByteCounters, ByteRange, ChunkFetcher, FetchOutcome, FetchRequest};
use crate::engine::rate_controller::RateController;
use crate::engine::retry::Backoff;
use crate::error::EngineError;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::OpenOptions;
use tokio::io::AsyncSeekExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vodfetch_types::Chunk;

/// Everything the chunks of one task share
pub struct ChunkContext {
    pub task_id: Uuid,
    pub url: String,
    pub destination: PathBuf,
    pub host: String,
    pub fetcher: Arc<ChunkFetcher>,
    pub rate: Arc<RateController>,
    pub auth: Option<Arc<AuthSession>>,
    pub retries: u32,
    pub max_auth_refreshes: u32,
    pub backoff: Backoff,
    /// Live byte total for the whole task
    pub task_bytes: Arc<AtomicU64>,
    pub cancel: CancellationToken,
}

/// A worker that downloads one chunk
pub struct ChunkWorker {
    ctx: Arc<ChunkContext>,
    chunk: Chunk,
    /// Send a `Range` header; off in single-stream mode
    ranged: bool,
    /// Bytes of this chunk on disk, shared with the task's checkpointing
    received: Arc<AtomicU64>,
}

impl ChunkWorker {
    pub fn new(ctx: Arc<ChunkContext>, chunk: Chunk, ranged: bool, received: Arc<AtomicU64>) -> Self {
        Self {
            ctx,
            chunk,
            ranged,
            received,
        }
    }

    /// Run the chunk to completion; returns the bytes it now holds
    pub async fn run(self) -> Result<u64, EngineError> {
        let index = self.chunk.index;
        debug!(
            task_id = %self.ctx.task_id,
            chunk = index,
            "starting chunk (bytes {}-{})",
            self.chunk.start,
            self.chunk.end
        );

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(&self.ctx.destination)
            .await?;

        let mut token = self.acquire_token().await?;
        let mut attempt: u32 = 0;
        let mut auth_refreshes: u32 = 0;

        loop {
            if self.ctx.cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let range = self.next_range();
            if range.expected_len() == Some(0) {
                return Ok(self.received.load(Ordering::Acquire));
            }
            file.seek(std::io::SeekFrom::Start(range.start)).await?;

            if token.as_ref().is_some_and(|t| t.is_expired()) {
                // Held across retries long enough to lapse
                token = self.acquire_token().await?;
            }

            let estimated = range.expected_len().unwrap_or(0);
            let mut permit = tokio::select! {
                _ = self.ctx.cancel.cancelled() => return Err(EngineError::Cancelled),
                permit = self.ctx.rate.acquire(&self.ctx.host, estimated) => permit,
            };
            let started = Instant::now();

            let outcome = self
                .ctx
                .fetcher
                .fetch(
                    FetchRequest {
                        url: &self.ctx.url,
                        token: token.as_deref(),
                        range,
                        ranged: self.ranged,
                    },
                    &mut file,
                    ByteCounters {
                        chunk: &self.received,
                        task: &self.ctx.task_bytes,
                    },
                    &mut permit,
                    &self.ctx.cancel,
                )
                .await;

            match outcome {
                FetchOutcome::Success(bytes) => {
                    self.ctx.rate.release(permit, bytes, started.elapsed());
                    file.sync_data().await?;
                    let total = self.received.load(Ordering::Acquire);
                    info!(
                        task_id = %self.ctx.task_id,
                        chunk = index,
                        "chunk complete ({} bytes)",
                        total
                    );
                    return Ok(total);
                }
                FetchOutcome::AuthExpired => {
                    drop(permit);
                    auth_refreshes += 1;
                    token = Some(self.refresh_token(token.as_deref(), auth_refreshes).await?);
                }
                FetchOutcome::RangeUnsupported => {
                    warn!(task_id = %self.ctx.task_id, chunk = index, "server refused byte range");
                    return Err(EngineError::RangeUnsupported);
                }
                FetchOutcome::Throttled { retry_after } => {
                    drop(permit);
                    let backoff = self.ctx.rate.report_throttled(&self.ctx.host);
                    attempt += 1;
                    if attempt > self.ctx.retries {
                        return Err(EngineError::Throttled {
                            host: self.ctx.host.clone(),
                        });
                    }
                    self.sleep(retry_after.unwrap_or_default().max(backoff)).await?;
                }
                FetchOutcome::Cancelled => {
                    debug!(task_id = %self.ctx.task_id, chunk = index, "chunk cancelled");
                    return Err(EngineError::Cancelled);
                }
                FetchOutcome::NetworkFailure(e) => {
                    drop(permit);
                    if e.is_fatal() {
                        return Err(e);
                    }
                    attempt += 1;
                    if attempt > self.ctx.retries {
                        warn!(
                            task_id = %self.ctx.task_id,
                            chunk = index,
                            "chunk failed after {} retries: {}",
                            self.ctx.retries,
                            e
                        );
                        return Err(e);
                    }
                    let delay = self.ctx.backoff.delay(attempt);
                    debug!(
                        task_id = %self.ctx.task_id,
                        chunk = index,
                        attempt,
                        "chunk attempt failed ({}), retrying in {:?}",
                        e,
                        delay
                    );
                    self.sleep(delay).await?;
                }
            }
        }
    }

    /// Range still to fetch. Without range support the chunk restarts from zero.
    fn next_range(&self) -> ByteRange {
        let end = if self.chunk.is_open_ended() {
            None
        } else {
            Some(self.chunk.end)
        };

        if self.ranged {
            let received = self.received.load(Ordering::Acquire);
            return ByteRange::new(self.chunk.start + received, end);
        }

        let stale = self.received.swap(0, Ordering::AcqRel);
        if stale > 0 {
            self.ctx.task_bytes.fetch_sub(stale, Ordering::AcqRel);
            debug!(
                task_id = %self.ctx.task_id,
                "single-stream retry discards {} bytes",
                stale
            );
        }
        ByteRange::new(self.chunk.start, end)
    }

    async fn acquire_token(&self) -> Result<Option<Arc<AuthToken>>, EngineError> {
        match &self.ctx.auth {
            Some(auth) => Ok(Some(auth.acquire().await?)),
            None => Ok(None),
        }
    }

    async fn refresh_token(
        &self,
        rejected: Option<&AuthToken>,
        refreshes: u32,
    ) -> Result<Arc<AuthToken>, EngineError> {
        let (Some(auth), Some(rejected)) = (&self.ctx.auth, rejected) else {
            return Err(EngineError::AuthFailure {
                provider: self.ctx.host.clone(),
                message: "server requires credentials that are not configured".to_string(),
            });
        };
        if refreshes > self.ctx.max_auth_refreshes {
            return Err(EngineError::AuthFailure {
                provider: auth.provider_name().to_string(),
                message: format!("token still rejected after {} refreshes", refreshes - 1),
            });
        }
        debug!(
            task_id = %self.ctx.task_id,
            chunk = self.chunk.index,
            generation = rejected.generation,
            "token rejected, requesting a fresh one"
        );
        auth.report_rejected(rejected).await
    }

    /// Sleep unless cancelled first
    async fn sleep(&self, delay: Duration) -> Result<(), EngineError> {
        tokio::select! {
            _ = self.ctx.cancel.cancelled() => Err(EngineError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}
