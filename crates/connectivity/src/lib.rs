//! Network quality monitoring for Mandara Offline
//!
//! This crate estimates connection usability on networks where the link
//! flaps and a "connected" signal says nothing about throughput. Passive
//! link signals give a fast path into the offline state; timed active probes
//! against a lightweight endpoint, smoothed over a small latency window,
//! classify everything else.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod monitor;
pub mod quality;

pub use monitor::{ConnectivityMonitor, MonitorConfig, MonitorError, NetworkSnapshot};
pub use quality::QualityLevel;
