//! Quality levels and latency smoothing

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

/// The monitor's classification of usable bandwidth/latency
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QualityLevel {
    /// No probe has completed yet
    Unknown,

    /// Link is down or probes fail consistently
    Offline,

    /// Reachable but barely; syncing would likely time out
    VerySlow,

    /// Usable with care (small batches)
    Slow,

    /// Full quality
    Normal,
}

impl QualityLevel {
    /// Whether the synchronizer may attempt a drain at this level
    pub fn usable(&self) -> bool {
        matches!(self, QualityLevel::Slow | QualityLevel::Normal)
    }
}

impl fmt::Display for QualityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QualityLevel::Unknown => write!(f, "unknown"),
            QualityLevel::Offline => write!(f, "offline"),
            QualityLevel::VerySlow => write!(f, "very-slow"),
            QualityLevel::Slow => write!(f, "slow"),
            QualityLevel::Normal => write!(f, "normal"),
        }
    }
}

/// Fixed-capacity ring of recent probe durations, oldest evicted first
#[derive(Debug, Clone)]
pub(crate) struct LatencyWindow {
    samples: VecDeque<Duration>,
    capacity: usize,
}

impl LatencyWindow {
    pub(crate) fn new(capacity: usize) -> Self {
        Self { samples: VecDeque::with_capacity(capacity), capacity: capacity.max(1) }
    }

    pub(crate) fn push(&mut self, sample: Duration) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// Arithmetic mean of the window, `None` while empty
    pub(crate) fn mean(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let total: Duration = self.samples.iter().sum();
        Some(total / self.samples.len() as u32)
    }

    pub(crate) fn len(&self) -> usize {
        self.samples.len()
    }
}

/// Classify a smoothed latency against the two configured thresholds
pub(crate) fn classify(mean: Duration, fast: Duration, medium: Duration) -> QualityLevel {
    if mean < fast {
        QualityLevel::Normal
    } else if mean < medium {
        QualityLevel::Slow
    } else {
        QualityLevel::VerySlow
    }
}
