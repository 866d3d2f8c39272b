//! Watermark monitor (C9): classifies queue depth into bands.
//!
//! Thresholds are ordered `low < normal < high < critical`. Classification
//! is monotonic in the sense the spec requires: repeated observation of a
//! strictly increasing length never moves to a lower band, since the
//! mapping from length to band is a pure step function.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatermarkBand {
    Empty,
    Low,
    Normal,
    High,
    Critical,
}

impl WatermarkBand {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Empty,
            1 => Self::Low,
            2 => Self::Normal,
            3 => Self::High,
            _ => Self::Critical,
        }
    }
}

impl std::fmt::Display for WatermarkBand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "empty"),
            Self::Low => write!(f, "low"),
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatermarkConfig {
    pub low: i64,
    pub normal: i64,
    pub high: i64,
    pub critical: i64,
}

impl Default for WatermarkConfig {
    fn default() -> Self {
        Self { low: 100, normal: 500, high: 1000, critical: 2000 }
    }
}

impl WatermarkConfig {
    pub fn classify(&self, len: i64) -> WatermarkBand {
        if len == 0 {
            WatermarkBand::Empty
        } else if len <= self.low {
            WatermarkBand::Low
        } else if len <= self.normal {
            WatermarkBand::Normal
        } else if len <= self.high {
            WatermarkBand::High
        } else {
            WatermarkBand::Critical
        }
    }
}

/// A band transition, emitted only when the band actually changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandTransition {
    pub from: WatermarkBand,
    pub to: WatermarkBand,
}

/// Tracks the current band across repeated `observe` calls; debounced so a
/// scan that re-reads the same length twice in a row emits no transition.
pub struct WatermarkMonitor {
    config: WatermarkConfig,
    current: AtomicU8,
    last_len: AtomicU64,
}

impl WatermarkMonitor {
    pub fn new(config: WatermarkConfig) -> Self {
        Self { config, current: AtomicU8::new(0), last_len: AtomicU64::new(0) }
    }

    pub fn band(&self) -> WatermarkBand {
        WatermarkBand::from_u8(self.current.load(Ordering::Relaxed))
    }

    pub fn config(&self) -> &WatermarkConfig {
        &self.config
    }

    /// Classifies `len` and returns `Some(transition)` iff the band changed
    /// since the previous observation.
    pub fn observe(&self, len: i64) -> Option<BandTransition> {
        self.last_len.store(len.max(0) as u64, Ordering::Relaxed);
        let new_band = self.config.classify(len);
        let old = WatermarkBand::from_u8(self.current.swap(new_band as u8, Ordering::Relaxed));
        if old == new_band {
            None
        } else {
            Some(BandTransition { from: old, to: new_band })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_boundaries_inclusive_of_upper_bound() {
        let config = WatermarkConfig::default();
        assert_eq!(config.classify(0), WatermarkBand::Empty);
        assert_eq!(config.classify(100), WatermarkBand::Low);
        assert_eq!(config.classify(101), WatermarkBand::Normal);
        assert_eq!(config.classify(500), WatermarkBand::Normal);
        assert_eq!(config.classify(1000), WatermarkBand::High);
        assert_eq!(config.classify(1001), WatermarkBand::Critical);
    }

    #[test]
    fn repeated_observation_of_same_band_emits_no_transition() {
        let monitor = WatermarkMonitor::new(WatermarkConfig::default());
        assert!(monitor.observe(10).is_some());
        assert!(monitor.observe(20).is_none());
    }

    #[test]
    fn rising_then_falling_traverses_every_band() {
        let monitor = WatermarkMonitor::new(WatermarkConfig::default());
        let seq = [0, 50, 300, 800, 1500];
        let mut bands = vec![];
        for len in seq {
            if let Some(t) = monitor.observe(len) {
                bands.push(t.to);
            }
        }
        assert_eq!(
            bands,
            vec![WatermarkBand::Low, WatermarkBand::Normal, WatermarkBand::High, WatermarkBand::Critical]
        );
    }
}
