//! Single ranged GET, streamed into a sink
//!
//! The fetcher knows nothing about tasks or retries. It issues one
//! request, copies the body into whatever it is handed, and classifies
//! how the attempt ended.

use crate::engine::auth::AuthToken;
use crate::engine::rate_controller::BudgetPermit;
use crate::engine::retry::parse_retry_after;
use crate::error::EngineError;
use futures::StreamExt;
use reqwest::header::{CONTENT_RANGE, RANGE, RETRY_AFTER};
use reqwest::{Client, Method, StatusCode};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use vodfetch_types::EngineConfig;

/// Publish durable progress at least this often
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Inclusive byte range; `end: None` reads to the end of the resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn new(start: u64, end: Option<u64>) -> Self {
        Self { start, end }
    }

    /// `Range` header value, `None` when the whole resource is wanted
    pub fn header_value(&self) -> Option<String> {
        match self.end {
            Some(end) => Some(format!("bytes={}-{}", self.start, end)),
            None if self.start > 0 => Some(format!("bytes={}-", self.start)),
            None => None,
        }
    }

    pub fn expected_len(&self) -> Option<u64> {
        self.end.map(|end| (end + 1).saturating_sub(self.start))
    }
}

/// How one fetch attempt ended
#[derive(Debug)]
pub enum FetchOutcome {
    /// Body fully written
    Success(u64),
    /// Server rejected the token
    AuthExpired,
    /// Server ignored or refused the range
    RangeUnsupported,
    /// Server asked us to slow down
    Throttled { retry_after: Option<Duration> },
    /// Cancellation was requested mid-fetch
    Cancelled,
    NetworkFailure(EngineError),
}

/// Counters bumped as bytes arrive
pub struct ByteCounters<'a> {
    /// Bytes of this range flushed to the sink, across attempts
    pub chunk: &'a AtomicU64,
    /// Live task-wide total, fed to speed and progress
    pub task: &'a AtomicU64,
}

/// One request to make
pub struct FetchRequest<'a> {
    pub url: &'a str,
    pub token: Option<&'a AuthToken>,
    pub range: ByteRange,
    /// Send a `Range` header; without one `range` must start at 0 and
    /// only bounds how much is read
    pub ranged: bool,
}

pub struct ChunkFetcher {
    client: Client,
    auth_statuses: Vec<u16>,
    throttle_statuses: Vec<u16>,
    read_timeout: Duration,
}

impl ChunkFetcher {
    pub fn new(client: Client, config: &EngineConfig) -> Self {
        Self {
            client,
            auth_statuses: config.auth_expired_statuses.clone(),
            throttle_statuses: config.throttle_statuses.clone(),
            read_timeout: Duration::from_secs(config.read_timeout_secs.max(1)),
        }
    }

    /// Status codes meaning the bearer token is no longer accepted
    pub fn is_auth_status(&self, status: u16) -> bool {
        self.auth_statuses.contains(&status)
    }

    pub fn is_throttle_status(&self, status: u16) -> bool {
        self.throttle_statuses.contains(&status)
    }

    /// Issue the request and stream the body into `sink`.
    ///
    /// `counters.chunk` is only advanced once bytes are flushed, so it can
    /// be persisted as a resume offset. `counters.task` moves on every read.
    pub async fn fetch<W>(
        &self,
        request: FetchRequest<'_>,
        sink: &mut W,
        counters: ByteCounters<'_>,
        permit: &mut BudgetPermit,
        cancel: &CancellationToken,
    ) -> FetchOutcome
    where
        W: AsyncWrite + Unpin + Send,
    {
        let builder = match request.token {
            Some(token) => match token.request(&self.client, Method::GET, request.url) {
                Ok(builder) => builder,
                Err(e) => return FetchOutcome::NetworkFailure(e),
            },
            None => self.client.get(request.url),
        };
        let range_header = if request.ranged {
            request.range.header_value()
        } else {
            None
        };
        let builder = match &range_header {
            Some(value) => builder.header(RANGE, value.as_str()),
            None => builder,
        };

        // Headers are held to the same deadline as each body read
        let response = tokio::select! {
            _ = cancel.cancelled() => return FetchOutcome::Cancelled,
            result = tokio::time::timeout(self.read_timeout, builder.send()) => match result {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => return FetchOutcome::NetworkFailure(EngineError::Network(e)),
                Err(_) => return FetchOutcome::NetworkFailure(EngineError::Timeout),
            },
        };

        let status = response.status();
        if let Some(outcome) = self.classify(&response, &request.range, range_header.is_some()) {
            debug!(url = %request.url, status = status.as_u16(), "fetch rejected: {:?}", outcome);
            return outcome;
        }

        let expected = request.range.expected_len();
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;
        let mut published: u64 = 0;
        let mut flushed_at = tokio::time::Instant::now();

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    let outcome = FetchOutcome::Cancelled;
                    return self.finish(sink, &counters, written - published, outcome).await;
                }
                next = tokio::time::timeout(self.read_timeout, stream.next()) => next,
            };

            let read = match next {
                Ok(Some(Ok(bytes))) => Ok(bytes),
                Ok(None) => break,
                Ok(Some(Err(e))) => Err(EngineError::Network(e)),
                Err(_) => Err(EngineError::Timeout),
            };
            let bytes = match read {
                Ok(bytes) => bytes,
                Err(e) => {
                    let outcome = FetchOutcome::NetworkFailure(e);
                    return self.finish(sink, &counters, written - published, outcome).await;
                }
            };

            // Never write past the end of the range, even if the server overshoots
            let take = match expected {
                Some(expected) => (bytes.len() as u64).min(expected - written) as usize,
                None => bytes.len(),
            };
            if take == 0 {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    let outcome = FetchOutcome::Cancelled;
                    return self.finish(sink, &counters, written - published, outcome).await;
                }
                _ = permit.consume(take as u64) => {}
            }
            if let Err(e) = sink.write_all(&bytes[..take]).await {
                let outcome = FetchOutcome::NetworkFailure(EngineError::Io(e));
                return self.finish(sink, &counters, written - published, outcome).await;
            }
            written += take as u64;
            counters.task.fetch_add(take as u64, Ordering::AcqRel);
            trace!(written, "chunk bytes written");

            if flushed_at.elapsed() >= FLUSH_INTERVAL {
                if let Err(e) = sink.flush().await {
                    // Unflushed bytes will be fetched again
                    counters.task.fetch_sub(written - published, Ordering::AcqRel);
                    return FetchOutcome::NetworkFailure(EngineError::Io(e));
                }
                counters.chunk.fetch_add(written - published, Ordering::AcqRel);
                published = written;
                flushed_at = tokio::time::Instant::now();
            }

            if expected == Some(written) {
                break;
            }
        }

        let outcome = match expected {
            Some(expected) if written < expected => {
                FetchOutcome::NetworkFailure(EngineError::SizeMismatch {
                    expected,
                    actual: written,
                })
            }
            _ => FetchOutcome::Success(written),
        };
        self.finish(sink, &counters, written - published, outcome).await
    }

    /// Map a response status to an early outcome, `None` when the body should be read
    fn classify(
        &self,
        response: &reqwest::Response,
        range: &ByteRange,
        ranged: bool,
    ) -> Option<FetchOutcome> {
        let status = response.status();
        let code = status.as_u16();

        if self.is_auth_status(code) {
            return Some(FetchOutcome::AuthExpired);
        }
        if self.is_throttle_status(code) {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            return Some(FetchOutcome::Throttled { retry_after });
        }
        if status == StatusCode::RANGE_NOT_SATISFIABLE {
            return Some(FetchOutcome::RangeUnsupported);
        }
        if !status.is_success() {
            return Some(FetchOutcome::NetworkFailure(EngineError::ServerError {
                status: code,
                message: status.canonical_reason().unwrap_or("request failed").to_string(),
            }));
        }

        if ranged {
            if status != StatusCode::PARTIAL_CONTENT {
                // Full content for a partial request
                return Some(FetchOutcome::RangeUnsupported);
            }
            let served_start = response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(content_range_start);
            if let Some(served) = served_start {
                if served != range.start {
                    warn!(requested = range.start, served, "server answered a different range");
                    return Some(FetchOutcome::RangeUnsupported);
                }
            }
        }
        None
    }

    /// Flush what was written and publish it before returning `outcome`
    async fn finish<W>(
        &self,
        sink: &mut W,
        counters: &ByteCounters<'_>,
        unpublished: u64,
        outcome: FetchOutcome,
    ) -> FetchOutcome
    where
        W: AsyncWrite + Unpin + Send,
    {
        if let Err(e) = sink.flush().await {
            counters.task.fetch_sub(unpublished, Ordering::AcqRel);
            return FetchOutcome::NetworkFailure(EngineError::Io(e));
        }
        counters.chunk.fetch_add(unpublished, Ordering::AcqRel);
        outcome
    }
}

/// First byte offset from a `Content-Range: bytes a-b/total` header
fn content_range_start(value: &str) -> Option<u64> {
    let range = value.trim().strip_prefix("bytes")?.trim_start();
    let (start, _) = range.split_once('-')?;
    start.trim().parse().ok()
}

/// Total length from a `Content-Range` header, `None` when unknown (`*`)
pub fn content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.rsplit_once('/')?;
    total.trim().parse().ok()
}
