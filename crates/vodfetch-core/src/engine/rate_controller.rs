//! Per-host token bucket with adaptive backoff
//!
//! Every chunk fetch against a host holds a [`BudgetPermit`] for its whole
//! lifetime. A permit is one connection slot plus a byte reservation drawn
//! from the host's bucket; bytes streamed beyond the reservation are drawn
//! incrementally as they arrive.
//!
//! When a host answers with a throttle status the backoff multiplier
//! doubles (capped), the connection ceiling halves, and the refill rate
//! drops to the measured throughput divided by the multiplier. After enough
//! consecutive successes the host recovers one step at a time.

use crate::engine::throughput::{adaptive_chunk_size, ThroughputWindow};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use vodfetch_types::EngineConfig;

/// Largest slice drawn from the bucket per wait, so concurrent chunks share fairly
const MAX_DRAW: u64 = 16 * 1024;

/// Upper bound on a single wait, keeps waiters responsive to refills
const MAX_WAIT: Duration = Duration::from_millis(50);

/// Tunables for the controller, taken from the engine config
#[derive(Debug, Clone)]
pub struct RateSettings {
    pub connection_limit: usize,
    /// Bytes per second per host, 0 = unlimited
    pub speed_limit: u64,
    pub max_backoff: u32,
    pub throttle_base_delay: Duration,
    pub recovery_successes: u32,
    pub min_chunk_size: u64,
    pub max_chunk_size: u64,
    pub target_chunk_duration: Duration,
}

impl From<&EngineConfig> for RateSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            connection_limit: config.host_connection_limit.max(1),
            speed_limit: config.host_speed_limit,
            max_backoff: config.max_backoff_multiplier.max(1),
            throttle_base_delay: Duration::from_millis(config.throttle_base_delay_ms),
            recovery_successes: config.recovery_successes.max(1),
            min_chunk_size: config.min_chunk_size,
            max_chunk_size: config.max_chunk_size,
            target_chunk_duration: Duration::from_secs(config.target_chunk_secs.max(1)),
        }
    }
}

impl Default for RateSettings {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

/// Host key for a URL: lowercased host plus explicit port
pub fn host_key(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(parsed) => {
            let host = parsed.host_str().unwrap_or("").to_lowercase();
            match parsed.port() {
                Some(port) => format!("{}:{}", host, port),
                None => host,
            }
        }
        Err(_) => url.to_lowercase(),
    }
}

struct BudgetState {
    tokens: f64,
    last_refill: Instant,
    in_use: usize,
    ceiling: usize,
    backoff: u32,
    successes: u32,
    throughput: ThroughputWindow,
}

impl BudgetState {
    fn new(settings: &RateSettings) -> Self {
        Self {
            tokens: settings.speed_limit as f64,
            last_refill: Instant::now(),
            in_use: 0,
            ceiling: settings.connection_limit,
            backoff: 1,
            successes: 0,
            throughput: ThroughputWindow::default(),
        }
    }

    /// Refill rate in bytes/sec, `None` when the host is unlimited
    fn rate(&self, settings: &RateSettings) -> Option<f64> {
        let base = if settings.speed_limit > 0 {
            Some(settings.speed_limit as f64)
        } else {
            None
        };
        if self.backoff <= 1 {
            return base;
        }
        base.or_else(|| self.throughput.average())
            .map(|rate| (rate / self.backoff as f64).max(1.0))
    }

    /// Bucket capacity: one second worth of refill
    fn capacity(&self, settings: &RateSettings) -> Option<f64> {
        self.rate(settings)
    }

    fn refill(&mut self, settings: &RateSettings) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        match (self.rate(settings), self.capacity(settings)) {
            (Some(rate), Some(capacity)) => {
                self.tokens = (self.tokens + elapsed * rate).min(capacity);
            }
            _ => self.tokens = 0.0,
        }
    }

    /// Largest draw that can ever succeed, `None` when unlimited
    fn max_draw(&self, settings: &RateSettings) -> Option<u64> {
        self.capacity(settings)
            .map(|capacity| (capacity as u64).clamp(1, MAX_DRAW))
    }

    /// Try to take `bytes`; on shortfall returns how long to wait
    fn try_take(&mut self, bytes: u64, settings: &RateSettings) -> Result<(), Duration> {
        self.refill(settings);
        let Some(rate) = self.rate(settings) else {
            return Ok(());
        };
        if self.tokens >= bytes as f64 {
            self.tokens -= bytes as f64;
            return Ok(());
        }
        let needed = bytes as f64 - self.tokens;
        Err(Duration::from_secs_f64(needed / rate).min(MAX_WAIT))
    }
}

struct HostBudget {
    host: String,
    state: Mutex<BudgetState>,
    slot_freed: Notify,
}

/// Shared limiter for all chunk fetches, keyed by host
pub struct RateController {
    settings: RateSettings,
    hosts: DashMap<String, Arc<HostBudget>>,
}

impl RateController {
    pub fn new(settings: RateSettings) -> Self {
        Self {
            settings,
            hosts: DashMap::new(),
        }
    }

    fn budget(&self, host: &str) -> Arc<HostBudget> {
        // Clone the Arc out so the shard lock is not held across awaits
        self.hosts
            .entry(host.to_string())
            .or_insert_with(|| {
                Arc::new(HostBudget {
                    host: host.to_string(),
                    state: Mutex::new(BudgetState::new(&self.settings)),
                    slot_freed: Notify::new(),
                })
            })
            .clone()
    }

    /// Wait for a connection slot and an up-front byte reservation.
    ///
    /// Dropping the returned permit gives back the slot and any unused
    /// reservation, so a cancelled or failed fetch never leaks budget.
    pub async fn acquire(&self, host: &str, estimated_bytes: u64) -> BudgetPermit {
        let budget = self.budget(host);
        loop {
            let slot_freed = budget.slot_freed.notified();
            let wait = {
                let mut state = budget.state.lock();
                if state.in_use >= state.ceiling {
                    None
                } else {
                    let reserve = match state.capacity(&self.settings) {
                        Some(capacity) => estimated_bytes.min(capacity as u64).min(MAX_DRAW * 4),
                        None => 0,
                    };
                    match state.try_take(reserve, &self.settings) {
                        Ok(()) => {
                            state.in_use += 1;
                            debug!(
                                host = %budget.host,
                                in_use = state.in_use,
                                ceiling = state.ceiling,
                                "budget acquired"
                            );
                            return BudgetPermit {
                                budget: Arc::clone(&budget),
                                settings: self.settings.clone(),
                                reserved: reserve,
                                reserve_used: 0,
                                returned: false,
                            };
                        }
                        Err(wait) => Some(wait),
                    }
                }
            };

            match wait {
                Some(wait) => tokio::time::sleep(wait).await,
                None => slot_freed.await,
            }
        }
    }

    /// Reconcile a finished fetch and feed its throughput sample.
    ///
    /// Counts as a success for recovery after throttling.
    pub fn release(&self, mut permit: BudgetPermit, actual_bytes: u64, elapsed: Duration) {
        let budget = Arc::clone(&permit.budget);
        {
            let mut state = budget.state.lock();
            state.throughput.record(actual_bytes, elapsed);
            state.successes += 1;

            let throttled = state.backoff > 1 || state.ceiling < self.settings.connection_limit;
            if throttled && state.successes >= self.settings.recovery_successes {
                state.successes = 0;
                state.backoff = (state.backoff / 2).max(1);
                state.ceiling = (state.ceiling * 2).min(self.settings.connection_limit);
                info!(
                    host = %budget.host,
                    backoff = state.backoff,
                    ceiling = state.ceiling,
                    "host recovering from throttling"
                );
            }
        }
        permit.give_back();
    }

    /// Record a rate-limit response from `host`.
    ///
    /// Returns how long the caller should wait before retrying.
    pub fn report_throttled(&self, host: &str) -> Duration {
        let budget = self.budget(host);
        let mut state = budget.state.lock();
        state.backoff = (state.backoff.saturating_mul(2)).min(self.settings.max_backoff);
        state.ceiling = (state.ceiling / 2).max(1);
        state.successes = 0;
        state.tokens = 0.0;
        warn!(
            host = %host,
            backoff = state.backoff,
            ceiling = state.ceiling,
            "host throttled us, backing off"
        );
        self.settings.throttle_base_delay * state.backoff
    }

    /// Preferred size for new chunks on `host`, if it has throughput history
    pub fn suggest_chunk_size(&self, host: &str) -> Option<u64> {
        let budget = self.hosts.get(host)?.clone();
        let average = budget.state.lock().throughput.average()?;
        Some(adaptive_chunk_size(
            average,
            self.settings.target_chunk_duration,
            self.settings.min_chunk_size,
            self.settings.max_chunk_size,
        ))
    }

    #[cfg(test)]
    pub(crate) fn ceiling(&self, host: &str) -> usize {
        self.budget(host).state.lock().ceiling
    }

    #[cfg(test)]
    pub(crate) fn in_use(&self, host: &str) -> usize {
        self.budget(host).state.lock().in_use
    }

    #[cfg(test)]
    pub(crate) fn backoff(&self, host: &str) -> u32 {
        self.budget(host).state.lock().backoff
    }
}

/// A held connection slot plus byte reservation on one host
pub struct BudgetPermit {
    budget: Arc<HostBudget>,
    settings: RateSettings,
    reserved: u64,
    reserve_used: u64,
    returned: bool,
}

impl BudgetPermit {
    /// Account for `bytes` just read, waiting for budget when the host is limited.
    ///
    /// Not cancel-aware on its own; callers race it against their token.
    pub async fn consume(&mut self, bytes: u64) {
        let from_reserve = bytes.min(self.reserved - self.reserve_used);
        self.reserve_used += from_reserve;
        let mut remaining = bytes - from_reserve;

        while remaining > 0 {
            let wait = {
                let mut state = self.budget.state.lock();
                // The bucket never holds more than its capacity, so a larger
                // slice would never be granted
                let slice = match state.max_draw(&self.settings) {
                    Some(max) => remaining.min(max),
                    None => remaining,
                };
                state.try_take(slice, &self.settings).map(|()| slice)
            };
            match wait {
                Ok(taken) => remaining -= taken,
                // Wait outside the lock so other chunks can draw too
                Err(wait) => tokio::time::sleep(wait).await,
            }
        }
    }

    /// Return the slot and the unused part of the reservation
    fn give_back(&mut self) {
        if self.returned {
            return;
        }
        self.returned = true;
        let unused = self.reserved - self.reserve_used;
        {
            let mut state = self.budget.state.lock();
            if unused > 0 {
                if let Some(capacity) = state.capacity(&self.settings) {
                    state.tokens = (state.tokens + unused as f64).min(capacity);
                }
            }
            state.in_use = state.in_use.saturating_sub(1);
        }
        self.budget.slot_freed.notify_waiters();
    }
}

impl fmt::Debug for BudgetPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BudgetPermit")
            .field("host", &self.budget.host)
            .field("reserved", &self.reserved)
            .field("reserve_used", &self.reserve_used)
            .finish()
    }
}

impl Drop for BudgetPermit {
    fn drop(&mut self) {
        self.give_back();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn settings(limit: usize) -> RateSettings {
        RateSettings {
            connection_limit: limit,
            speed_limit: 0,
            max_backoff: 16,
            throttle_base_delay: Duration::from_millis(10),
            recovery_successes: 2,
            min_chunk_size: 1024,
            max_chunk_size: 1024 * 1024,
            target_chunk_duration: Duration::from_secs(1),
        }
    }

    #[test]
    fn host_key_keeps_port() {
        assert_eq!(host_key("http://Portal.Example.com:8080/a.mkv"), "portal.example.com:8080");
        assert_eq!(host_key("https://cdn.example.com/a.mkv"), "cdn.example.com");
    }

    #[tokio::test]
    async fn never_exceeds_connection_ceiling() {
        let controller = Arc::new(RateController::new(settings(3)));
        let peak = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..12 {
            let controller = Arc::clone(&controller);
            let peak = Arc::clone(&peak);
            let current = Arc::clone(&current);
            handles.push(tokio::spawn(async move {
                let permit = controller.acquire("h", 1000).await;
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                controller.release(permit, 1000, Duration::from_millis(20));
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(controller.in_use("h"), 0);
    }

    #[tokio::test]
    async fn dropped_permit_frees_slot() {
        let controller = RateController::new(settings(1));
        let permit = controller.acquire("h", 10).await;
        assert_eq!(controller.in_use("h"), 1);

        let mut waiter = tokio_test::task::spawn(controller.acquire("h", 10));
        tokio_test::assert_pending!(waiter.poll());

        drop(permit);
        assert_eq!(controller.in_use("h"), 0);
        assert!(waiter.is_woken());
        let second = tokio_test::assert_ready!(waiter.poll());
        assert_eq!(controller.in_use("h"), 1);
        drop(second);
    }

    #[tokio::test]
    async fn throttle_shrinks_ceiling_then_recovers() {
        let controller = RateController::new(settings(8));
        controller.acquire("h", 0).await;

        let delay = controller.report_throttled("h");
        assert_eq!(controller.ceiling("h"), 4);
        assert_eq!(controller.backoff("h"), 2);
        assert_eq!(delay, Duration::from_millis(20));

        controller.report_throttled("h");
        assert_eq!(controller.ceiling("h"), 2);
        assert_eq!(controller.backoff("h"), 4);

        // Two consecutive successes per recovery step
        for _ in 0..2 {
            let permit = controller.acquire("h", 0).await;
            controller.release(permit, 0, Duration::ZERO);
        }
        assert_eq!(controller.ceiling("h"), 4);
        assert_eq!(controller.backoff("h"), 2);

        for _ in 0..2 {
            let permit = controller.acquire("h", 0).await;
            controller.release(permit, 0, Duration::ZERO);
        }
        assert_eq!(controller.ceiling("h"), 8);
        assert_eq!(controller.backoff("h"), 1);
    }

    #[tokio::test]
    async fn backoff_is_capped() {
        let controller = RateController::new(settings(2));
        for _ in 0..10 {
            controller.report_throttled("h");
        }
        assert_eq!(controller.backoff("h"), 16);
        assert_eq!(controller.ceiling("h"), 1);
    }

    #[tokio::test]
    async fn speed_limit_paces_consumption() {
        let mut s = settings(4);
        s.speed_limit = 20_000;
        let controller = RateController::new(s);

        let start = Instant::now();
        let mut permit = controller.acquire("h", 20_000).await;
        // First second comes from the full bucket, the next 10 KB must wait
        permit.consume(30_000).await;
        assert!(start.elapsed() >= Duration::from_millis(400));
        controller.release(permit, 30_000, start.elapsed());
    }

    #[tokio::test]
    async fn limit_below_draw_size_still_progresses() {
        let mut s = settings(2);
        s.speed_limit = 10_000;
        let controller = RateController::new(s);

        let mut permit = controller.acquire("h", 0).await;
        let done = tokio::time::timeout(Duration::from_secs(5), permit.consume(16_384)).await;
        assert!(done.is_ok(), "consume stalled below the draw size");
    }

    #[tokio::test]
    async fn throttled_slow_host_keeps_draining() {
        let controller = RateController::new(settings(2));
        let permit = controller.acquire("h", 0).await;
        controller.release(permit, 4_000, Duration::from_secs(1));
        // Measured 4 KB/s halved by the backoff: 2 KB/s, far below one draw
        controller.report_throttled("h");

        let mut permit = controller.acquire("h", 0).await;
        let done = tokio::time::timeout(Duration::from_secs(5), permit.consume(4_000)).await;
        assert!(done.is_ok(), "consume stalled after throttling");
    }

    #[tokio::test]
    async fn chunk_size_follows_measured_throughput() {
        let controller = RateController::new(settings(4));
        assert_eq!(controller.suggest_chunk_size("h"), None);

        let permit = controller.acquire("h", 0).await;
        controller.release(permit, 200_000, Duration::from_secs(1));
        assert_eq!(controller.suggest_chunk_size("h"), Some(200_000));

        let permit = controller.acquire("slow", 0).await;
        controller.release(permit, 100, Duration::from_secs(1));
        assert_eq!(controller.suggest_chunk_size("slow"), Some(1024));
    }
}
