//! Backpressure manager (C10): hysteretic stream start/stop plus dynamic
//! processor concurrency, driven by [`super::watermark::WatermarkBand`].
//!
//! Mirrors the hysteresis shape of [`crate::reliability`]'s circuit breaker —
//! asymmetric thresholds so a metric oscillating near a boundary doesn't
//! flap the stream or the concurrency multiplier every tick.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::watermark::WatermarkBand;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackpressureConfig {
    pub base_concurrency: usize,
    pub high_multiplier: f64,
    pub critical_multiplier: f64,
    #[serde(with = "duration_millis")]
    pub min_stream_duration: Duration,
    #[serde(with = "duration_millis")]
    pub stop_stream_delay: Duration,
    #[serde(with = "duration_millis")]
    pub start_cooldown: Duration,
    #[serde(with = "duration_millis")]
    pub adjustment_interval: Duration,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            base_concurrency: 10,
            high_multiplier: 0.5,
            critical_multiplier: 0.1,
            min_stream_duration: Duration::from_secs(5),
            stop_stream_delay: Duration::from_secs(10),
            start_cooldown: Duration::from_secs(5),
            adjustment_interval: Duration::from_secs(5),
        }
    }
}

/// Tracks stream lifecycle and the last-computed concurrency multiplier.
///
/// All timing state uses `tokio::time::Instant` rather than wall-clock time:
/// monotonic, and safe to construct outside the workflow-replay restriction
/// that forbids `Instant::now()` at the crate's pure-calculation edges
/// (callers pass `now` explicitly where that matters).
pub struct BackpressureManager {
    config: BackpressureConfig,
    stream_active: AtomicBool,
    stream_started_at: RwLock<Option<Instant>>,
    condition_since: RwLock<Option<Instant>>,
    last_stopped_at: RwLock<Option<Instant>>,
    last_adjusted_at: RwLock<Option<Instant>>,
    current_multiplier_bits: AtomicU64,
}

impl BackpressureManager {
    pub fn new(config: BackpressureConfig) -> Self {
        Self {
            config,
            stream_active: AtomicBool::new(false),
            stream_started_at: RwLock::new(None),
            condition_since: RwLock::new(None),
            last_stopped_at: RwLock::new(None),
            last_adjusted_at: RwLock::new(None),
            current_multiplier_bits: AtomicU64::new(1.0f64.to_bits()),
        }
    }

    pub fn is_stream_active(&self) -> bool {
        self.stream_active.load(Ordering::Relaxed)
    }

    /// Should-start check. Starting is edge-triggered by the caller: once
    /// this returns true the caller is expected to call [`Self::mark_started`].
    pub fn should_start_stream(&self, band: WatermarkBand, now: Instant) -> bool {
        if self.is_stream_active() {
            return false;
        }
        if !matches!(band, WatermarkBand::Empty | WatermarkBand::Low) {
            return false;
        }
        match *self.last_stopped_at.read() {
            Some(stopped) => now.saturating_duration_since(stopped) >= self.config.start_cooldown,
            None => true,
        }
    }

    pub fn mark_started(&self, now: Instant) {
        self.stream_active.store(true, Ordering::Relaxed);
        *self.stream_started_at.write() = Some(now);
        *self.condition_since.write() = None;
    }

    /// Should-stop check, with the mandatory two-stage hysteresis: the
    /// high/critical condition must have held for `stop_stream_delay`, and
    /// the stream itself must be at least `min_stream_duration` old.
    pub fn should_stop_stream(&self, band: WatermarkBand, now: Instant) -> bool {
        if !self.is_stream_active() {
            return false;
        }
        if !matches!(band, WatermarkBand::High | WatermarkBand::Critical) {
            *self.condition_since.write() = None;
            return false;
        }
        let since = {
            let mut guard = self.condition_since.write();
            *guard.get_or_insert(now)
        };
        let condition_held = now.saturating_duration_since(since) >= self.config.stop_stream_delay;

        let stream_old_enough = self
            .stream_started_at
            .read()
            .map(|started| now.saturating_duration_since(started) >= self.config.min_stream_duration)
            .unwrap_or(false);

        condition_held && stream_old_enough
    }

    pub fn mark_stopped(&self, now: Instant) {
        self.stream_active.store(false, Ordering::Relaxed);
        *self.stream_started_at.write() = None;
        *self.condition_since.write() = None;
        *self.last_stopped_at.write() = Some(now);
    }

    /// Asserted at `high`, enforced (callers should actively shed/slow) at `critical`.
    pub fn is_backpressure_active(&self, band: WatermarkBand) -> bool {
        matches!(band, WatermarkBand::High | WatermarkBand::Critical)
    }

    fn multiplier_for(&self, band: WatermarkBand) -> f64 {
        match band {
            WatermarkBand::Empty | WatermarkBand::Low | WatermarkBand::Normal => 1.0,
            WatermarkBand::High => self.config.high_multiplier,
            WatermarkBand::Critical => self.config.critical_multiplier,
        }
    }

    /// Effective concurrency, rate-limited to `adjustment_interval`: calling
    /// this more often than that returns the previously computed value.
    pub fn effective_concurrency(&self, band: WatermarkBand, now: Instant) -> usize {
        let should_adjust = match *self.last_adjusted_at.read() {
            Some(last) => now.saturating_duration_since(last) >= self.config.adjustment_interval,
            None => true,
        };
        let multiplier = if should_adjust {
            let m = self.multiplier_for(band);
            self.current_multiplier_bits.store(m.to_bits(), Ordering::Relaxed);
            *self.last_adjusted_at.write() = Some(now);
            m
        } else {
            f64::from_bits(self.current_multiplier_bits.load(Ordering::Relaxed))
        };
        ((self.config.base_concurrency as f64) * multiplier).max(1.0).round() as usize
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BackpressureConfig {
        BackpressureConfig {
            base_concurrency: 10,
            high_multiplier: 0.5,
            critical_multiplier: 0.1,
            min_stream_duration: Duration::from_millis(50),
            stop_stream_delay: Duration::from_millis(50),
            start_cooldown: Duration::from_millis(50),
            adjustment_interval: Duration::ZERO,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stream_does_not_stop_before_min_duration_even_if_condition_holds() {
        let mgr = BackpressureManager::new(config());
        let t0 = Instant::now();
        mgr.mark_started(t0);

        assert!(!mgr.should_stop_stream(WatermarkBand::Critical, t0));

        tokio::time::advance(Duration::from_millis(60)).await;
        let t1 = Instant::now();
        assert!(mgr.should_stop_stream(WatermarkBand::Critical, t1));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_condition_resets_when_band_drops_below_high() {
        let mgr = BackpressureManager::new(config());
        let t0 = Instant::now();
        mgr.mark_started(t0);
        tokio::time::advance(Duration::from_millis(60)).await;

        assert!(!mgr.should_stop_stream(WatermarkBand::Normal, Instant::now()));
        // Condition window was cleared; immediately re-entering high must wait again.
        assert!(!mgr.should_stop_stream(WatermarkBand::High, Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn start_respects_cooldown_after_stop() {
        let mgr = BackpressureManager::new(config());
        let t0 = Instant::now();
        mgr.mark_stopped(t0);
        assert!(!mgr.should_start_stream(WatermarkBand::Low, t0));

        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(mgr.should_start_stream(WatermarkBand::Low, Instant::now()));
    }

    #[test]
    fn concurrency_scales_down_at_high_and_critical() {
        let mgr = BackpressureManager::new(config());
        let now = Instant::now();
        assert_eq!(mgr.effective_concurrency(WatermarkBand::Normal, now), 10);
        assert_eq!(mgr.effective_concurrency(WatermarkBand::High, now), 5);
        assert_eq!(mgr.effective_concurrency(WatermarkBand::Critical, now), 1);
    }
}
