//! Connectivity monitor
//!
//! Single writer of the network state. Level changes are broadcast to
//! subscribers (UI, synchronizer); a re-detection of the current level emits
//! nothing.
//!
//! Entering the offline state is instant on a link-down signal. Leaving it is
//! deliberately harder: a link-up signal only triggers a probe, and the state
//! improves when that probe passes. Three consecutive probe failures also
//! escalate to offline, covering hosts that never deliver link signals.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::quality::{classify, LatencyWindow, QualityLevel};

/// Monitor error types
#[derive(Debug, Error)]
pub enum MonitorError {
    /// Failed to build the probe HTTP client
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Monitor configuration
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Endpoint probed for round-trip timing (lightweight, same-origin)
    pub probe_url: String,
    /// How often to probe when idle
    pub probe_interval: Duration,
    /// Per-probe deadline; a timed-out probe counts as a failure
    pub probe_timeout: Duration,
    /// Mean latency below this classifies as normal
    pub fast_threshold: Duration,
    /// Mean latency below this (but above fast) classifies as slow
    pub medium_threshold: Duration,
    /// Latency window size for smoothing
    pub window: usize,
    /// Consecutive probe failures before escalating to offline
    pub failure_escalation: u32,
    /// Event channel capacity
    pub event_capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            probe_url: "http://localhost/ping".to_string(),
            probe_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            fast_threshold: Duration::from_millis(300),
            medium_threshold: Duration::from_millis(1000),
            window: 5,
            failure_escalation: 3,
            event_capacity: 32,
        }
    }
}

impl MonitorConfig {
    /// Create a configuration probing the given URL
    pub fn new(probe_url: impl Into<String>) -> Self {
        Self { probe_url: probe_url.into(), ..Default::default() }
    }

    /// Set the probe interval
    pub fn probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    /// Set the per-probe deadline
    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Set the classification thresholds
    pub fn thresholds(mut self, fast: Duration, medium: Duration) -> Self {
        self.fast_threshold = fast;
        self.medium_threshold = medium;
        self
    }

    /// Set the latency window size
    pub fn window(mut self, window: usize) -> Self {
        self.window = window;
        self
    }

    /// Set how many consecutive probe failures escalate to offline
    pub fn failure_escalation(mut self, count: u32) -> Self {
        self.failure_escalation = count;
        self
    }
}

#[derive(Debug)]
struct Inner {
    link_up: bool,
    quality: QualityLevel,
    last_probe_at: Option<Instant>,
    latencies: LatencyWindow,
    consecutive_failures: u32,
    skip_next_cycle: bool,
}

/// Read-only view of the current network state
#[derive(Debug, Clone)]
pub struct NetworkSnapshot {
    /// Host-reported link signal
    pub link_up: bool,
    /// Current quality classification
    pub quality: QualityLevel,
    /// When the last probe completed, if any
    pub last_probe_at: Option<Instant>,
    /// Number of latency samples in the smoothing window
    pub samples: usize,
    /// Probe failures since the last success
    pub consecutive_failures: u32,
}

/// Network quality monitor
pub struct ConnectivityMonitor {
    config: MonitorConfig,
    http: reqwest::Client,
    state: RwLock<Inner>,
    probe_in_flight: AtomicBool,
    events: broadcast::Sender<QualityLevel>,
}

impl ConnectivityMonitor {
    /// Create a monitor; no probe is issued until [`probe_now`](Self::probe_now)
    /// or the periodic task runs
    pub fn new(config: MonitorConfig) -> Result<Self, MonitorError> {
        let http = reqwest::Client::builder()
            .timeout(config.probe_timeout)
            .build()?;
        let (events, _events_rx) = broadcast::channel(config.event_capacity);

        Ok(Self {
            state: RwLock::new(Inner {
                link_up: true,
                quality: QualityLevel::Unknown,
                last_probe_at: None,
                latencies: LatencyWindow::new(config.window),
                consecutive_failures: 0,
                skip_next_cycle: false,
            }),
            config,
            http,
            probe_in_flight: AtomicBool::new(false),
            events,
        })
    }

    /// Subscribe to confirmed quality-level changes
    pub fn subscribe(&self) -> broadcast::Receiver<QualityLevel> {
        self.events.subscribe()
    }

    /// Current quality level
    pub async fn quality(&self) -> QualityLevel {
        self.state.read().await.quality
    }

    /// Snapshot of the full network state
    pub async fn snapshot(&self) -> NetworkSnapshot {
        let inner = self.state.read().await;
        NetworkSnapshot {
            link_up: inner.link_up,
            quality: inner.quality,
            last_probe_at: inner.last_probe_at,
            samples: inner.latencies.len(),
            consecutive_failures: inner.consecutive_failures,
        }
    }

    /// Feed a host connectivity signal
    ///
    /// A down signal enters the offline state immediately, bypassing
    /// smoothing, and discards the latency window so samples from before the
    /// outage do not feed post-recovery classification. An up signal alone
    /// never clears offline; it triggers an immediate probe, and the passing
    /// probe is what restores a usable level.
    pub async fn set_link_up(&self, up: bool) {
        let (was_up, changed_to) = {
            let mut inner = self.state.write().await;
            let was_up = inner.link_up;
            inner.link_up = up;
            if up {
                (was_up, None)
            } else {
                inner.latencies = LatencyWindow::new(self.config.window);
                inner.consecutive_failures = 0;
                (was_up, Self::transition(&mut inner, QualityLevel::Offline))
            }
        };

        if let Some(level) = changed_to {
            tracing::debug!(%level, "link signal forced quality change");
            let _ = self.events.send(level);
        }

        if up && !was_up {
            self.probe_now().await;
        }
    }

    /// Feed a "very constrained connection" hint
    ///
    /// Forces the very-slow level immediately and skips the next scheduled
    /// probe cycle. Ignored while offline: a hint is not proof of
    /// connectivity, and only a passing probe clears the offline state.
    pub async fn hint_constrained(&self) {
        let changed_to = {
            let mut inner = self.state.write().await;
            if inner.quality == QualityLevel::Offline {
                None
            } else {
                inner.skip_next_cycle = true;
                Self::transition(&mut inner, QualityLevel::VerySlow)
            }
        };

        if let Some(level) = changed_to {
            tracing::debug!(%level, "constrained hint forced quality change");
            let _ = self.events.send(level);
        }
    }

    /// The tab/app became visible again; re-probe immediately
    pub async fn visibility_regained(&self) {
        self.probe_now().await;
    }

    /// Issue one timed probe and fold the result into the state
    ///
    /// Single-flight: a call made while another probe is in flight returns
    /// the current level without issuing a second request.
    pub async fn probe_now(&self) -> QualityLevel {
        if self
            .probe_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return self.quality().await;
        }

        let latency = self.probe_once().await;
        let level = self.apply_probe_outcome(latency).await;
        self.probe_in_flight.store(false, Ordering::SeqCst);
        level
    }

    async fn probe_once(&self) -> Option<Duration> {
        let started = Instant::now();
        match self.http.head(&self.config.probe_url).send().await {
            Ok(response) if response.status().is_success() => Some(started.elapsed()),
            Ok(response) => {
                tracing::debug!(status = %response.status(), "probe returned error status");
                None
            }
            Err(e) => {
                tracing::debug!("probe failed: {}", e);
                None
            }
        }
    }

    async fn apply_probe_outcome(&self, latency: Option<Duration>) -> QualityLevel {
        let (changed_to, level) = {
            let mut inner = self.state.write().await;
            inner.last_probe_at = Some(Instant::now());
            match latency {
                Some(sample) => {
                    inner.consecutive_failures = 0;
                    // A passing probe is itself proof the link is up.
                    inner.link_up = true;
                    inner.latencies.push(sample);
                    let mean = inner.latencies.mean().unwrap_or(sample);
                    let next = classify(
                        mean,
                        self.config.fast_threshold,
                        self.config.medium_threshold,
                    );
                    let changed = Self::transition(&mut inner, next);
                    (changed, inner.quality)
                }
                None => {
                    inner.consecutive_failures += 1;
                    if inner.consecutive_failures >= self.config.failure_escalation {
                        let changed = Self::transition(&mut inner, QualityLevel::Offline);
                        (changed, inner.quality)
                    } else {
                        (None, inner.quality)
                    }
                }
            }
        };

        if let Some(next) = changed_to {
            tracing::debug!(level = %next, "network quality changed");
            let _ = self.events.send(next);
        }
        level
    }

    fn transition(inner: &mut Inner, next: QualityLevel) -> Option<QualityLevel> {
        if inner.quality == next {
            None
        } else {
            inner.quality = next;
            Some(next)
        }
    }

    /// Start the periodic probe task
    pub fn spawn(monitor: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(monitor.config.probe_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                let skip = {
                    let mut inner = monitor.state.write().await;
                    std::mem::take(&mut inner.skip_next_cycle)
                };
                if skip {
                    continue;
                }
                monitor.probe_now().await;
            }
        })
    }
}
