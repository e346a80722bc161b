//! Throughput math shared by the rate controller and progress reporting
//!
//! Everything here is pure: samples in, numbers out.

use std::collections::VecDeque;
use std::time::Duration;

/// Number of per-chunk samples kept for adaptive sizing
pub const THROUGHPUT_SAMPLES: usize = 5;

/// Moving average over the most recent throughput samples (bytes/sec)
#[derive(Debug, Clone)]
pub struct ThroughputWindow {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl ThroughputWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Record a transfer of `bytes` over `elapsed`.
    /// Transfers too short to measure are ignored.
    pub fn record(&mut self, bytes: u64, elapsed: Duration) {
        if bytes == 0 || elapsed < Duration::from_millis(50) {
            return;
        }
        self.push(bytes as f64 / elapsed.as_secs_f64());
    }

    pub fn push(&mut self, bytes_per_sec: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(bytes_per_sec);
    }

    pub fn average(&self) -> Option<f64> {
        if self.samples.is_empty() {
            None
        } else {
            Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl Default for ThroughputWindow {
    fn default() -> Self {
        Self::new(THROUGHPUT_SAMPLES)
    }
}

/// Chunk size proportional to measured throughput, clamped to [min, max].
///
/// A chunk should take roughly `target` to fetch: slow links get small,
/// cheap-to-redo chunks, fast links get fewer large ones.
pub fn adaptive_chunk_size(avg_bps: f64, target: Duration, min: u64, max: u64) -> u64 {
    let max = max.max(min);
    let ideal = avg_bps * target.as_secs_f64();
    if !ideal.is_finite() || ideal <= 0.0 {
        return min;
    }
    (ideal as u64).clamp(min, max)
}

/// Smoothed speed for progress display.
///
/// A sliding window of instant speeds, fed through an exponential moving
/// average so the number does not jump around.
#[derive(Debug, Clone)]
pub struct SpeedMeter {
    window: VecDeque<f64>,
    smoothed: f64,
    alpha: f64,
}

impl SpeedMeter {
    pub fn new() -> Self {
        Self {
            window: VecDeque::with_capacity(10),
            smoothed: 0.0,
            alpha: 0.15,
        }
    }

    /// Feed bytes transferred since the last sample; returns bytes/sec
    pub fn sample(&mut self, delta_bytes: u64, elapsed: Duration) -> u64 {
        let secs = elapsed.as_secs_f64();
        let instant = if secs > 0.0 { delta_bytes as f64 / secs } else { 0.0 };

        // Last 10 samples
        if self.window.len() == 10 {
            self.window.pop_front();
        }
        self.window.push_back(instant);

        let window_avg = self.window.iter().sum::<f64>() / self.window.len() as f64;
        self.smoothed = self.alpha * window_avg + (1.0 - self.alpha) * self.smoothed;
        self.smoothed as u64
    }
}

impl Default for SpeedMeter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_keeps_most_recent_samples() {
        let mut window = ThroughputWindow::new(3);
        for s in [10.0, 20.0, 30.0, 40.0] {
            window.push(s);
        }
        assert_eq!(window.len(), 3);
        assert_eq!(window.average(), Some(30.0));
    }

    #[test]
    fn short_transfers_are_not_sampled() {
        let mut window = ThroughputWindow::default();
        window.record(1000, Duration::from_millis(10));
        window.record(0, Duration::from_secs(1));
        assert!(window.is_empty());

        window.record(2000, Duration::from_secs(2));
        assert_eq!(window.average(), Some(1000.0));
    }

    #[test]
    fn chunk_size_scales_with_throughput() {
        let target = Duration::from_secs(10);
        let slow = adaptive_chunk_size(50_000.0, target, 1 << 20, 64 << 20);
        let fast = adaptive_chunk_size(4_000_000.0, target, 1 << 20, 64 << 20);
        assert_eq!(slow, 1 << 20);
        assert_eq!(fast, 40_000_000);
        assert!(fast > slow);
    }

    #[test]
    fn chunk_size_is_clamped_to_max() {
        let size = adaptive_chunk_size(1e12, Duration::from_secs(10), 1 << 20, 8 << 20);
        assert_eq!(size, 8 << 20);
    }

    #[test]
    fn speed_meter_converges() {
        let mut meter = SpeedMeter::new();
        let mut speed = 0;
        for _ in 0..60 {
            speed = meter.sample(1000, Duration::from_secs(1));
        }
        assert!(speed > 950 && speed <= 1000, "speed was {}", speed);
    }
}
