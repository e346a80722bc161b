//! Backoff delays for chunk and task retries

use rand::Rng;
use std::time::{Duration, SystemTime};
use tracing::debug;

/// Upper bound on the random jitter added to a delay
const MAX_JITTER: Duration = Duration::from_millis(500);

/// Longest Retry-After the engine will honour
const MAX_RETRY_AFTER: Duration = Duration::from_secs(300);

/// Exponential backoff: `min(base * 2^(attempt-1), max) + jitter`
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    /// Delay before retry number `attempt` (1-indexed)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let scaled = self.base.saturating_mul(1u32 << exponent);
        let capped = scaled.min(self.max);
        capped + jitter(capped)
    }
}

/// Random jitter of at most half the delay, never above `MAX_JITTER`
fn jitter(delay: Duration) -> Duration {
    let ceiling = (delay / 2).min(MAX_JITTER).as_millis() as u64;
    if ceiling == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling))
}

/// Parse a Retry-After header: integer seconds or an HTTP date
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds).min(MAX_RETRY_AFTER));
    }

    let when = httpdate::parse_http_date(value).ok()?;
    match when.duration_since(SystemTime::now()) {
        Ok(wait) => Some(wait.min(MAX_RETRY_AFTER)),
        Err(_) => {
            debug!("Retry-After date {} already passed", value);
            Some(Duration::ZERO)
        }
    }
}
