//! Public facade over the capture pipeline, the statistics engine, and the
//! packet store.
//!
//! The display surfaces (console loop, any future UI) depend only on this
//! handle: lifecycle, configuration, subscription, snapshot reads, and store
//! queries. The facade owns its components outright; none of them keeps a
//! back-reference to it.

use crate::capture::{CaptureConfig, CaptureError};
use crate::logger::SharedLogger;
use crate::pipeline::{Pipeline, PipelineState, Subscriber, SubscriberToken};
use crate::record::Protocol;
use crate::stats::{BandwidthSample, StatsEngine, StatsSnapshot};
use crate::storage::{PacketRow, PacketStore, StoreError};
use chrono::{DateTime, Utc};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Startup faults surfaced out of [`Monitor::new`] and [`Monitor::start`].
#[derive(Debug)]
pub enum MonitorError {
    Capture(CaptureError),
    Store(StoreError),
}

impl fmt::Display for MonitorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorError::Capture(e) => write!(f, "{}", e),
            MonitorError::Store(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for MonitorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MonitorError::Capture(e) => Some(e),
            MonitorError::Store(e) => Some(e),
        }
    }
}

impl From<CaptureError> for MonitorError {
    fn from(e: CaptureError) -> Self {
        MonitorError::Capture(e)
    }
}

impl From<StoreError> for MonitorError {
    fn from(e: StoreError) -> Self {
        MonitorError::Store(e)
    }
}

/// Settings for building a [`Monitor`].
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub capture: CaptureConfig,
    pub database: PathBuf,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            capture: CaptureConfig::default(),
            database: PathBuf::from("netwatch.db"),
        }
    }
}

/// One live-monitoring instance: one interface, one statistics engine, one
/// store. Capturing several interfaces means several monitors.
pub struct Monitor {
    stats: Arc<StatsEngine>,
    store: Arc<PacketStore>,
    pipeline: Pipeline,
    logger: SharedLogger,
}

impl Monitor {
    /// Build the component stack. Opening the database is the only fallible
    /// step; the capture interface is opened at [`Monitor::start`].
    pub fn new(config: MonitorConfig, logger: SharedLogger) -> Result<Monitor, MonitorError> {
        let stats = Arc::new(StatsEngine::new());
        let store = Arc::new(PacketStore::open(&config.database, logger.clone())?);
        let pipeline = Pipeline::new(config.capture, stats.clone(), store.clone(), logger.clone());
        Ok(Monitor {
            stats,
            store,
            pipeline,
            logger,
        })
    }

    pub fn set_interface(&self, name: &str) {
        self.pipeline.set_interface(name);
    }

    pub fn set_filter(&self, expr: &str) {
        self.pipeline.set_filter(expr);
    }

    /// Start capturing. Idempotent; interface and filter faults propagate.
    pub fn start(&self) -> Result<(), MonitorError> {
        self.pipeline.start().map_err(MonitorError::Capture)
    }

    /// Stop capturing, drain in-flight packets, and flush the store.
    /// Idempotent.
    pub fn stop(&self) {
        self.pipeline.stop();
    }

    pub fn is_running(&self) -> bool {
        self.pipeline.state() == PipelineState::Running
    }

    pub fn add_packet_callback(&self, callback: Subscriber) -> SubscriberToken {
        self.pipeline.add_packet_callback(callback)
    }

    pub fn remove_packet_callback(&self, token: SubscriberToken) -> bool {
        self.pipeline.remove_packet_callback(token)
    }

    /// The read-only statistics interface display surfaces poll.
    pub fn stats(&self) -> &StatsEngine {
        &self.stats
    }

    /// Consolidated owned snapshot of the aggregates.
    pub fn snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn bandwidth_history(&self) -> Vec<BandwidthSample> {
        self.stats.bandwidth_history()
    }

    /// Reset every aggregate; the store is unaffected.
    pub fn reset_stats(&self) {
        self.stats.reset();
        self.logger.info("statistics reset");
    }

    // Store queries, forwarded as-is.

    pub fn stored_by_protocol(
        &self,
        protocol: Protocol,
        limit: usize,
    ) -> Result<Vec<PacketRow>, StoreError> {
        self.store.packets_by_protocol(protocol, limit)
    }

    pub fn stored_by_host(&self, host: &str, limit: usize) -> Result<Vec<PacketRow>, StoreError> {
        self.store.packets_by_host(host, limit)
    }

    pub fn stored_by_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PacketRow>, StoreError> {
        self.store.packets_by_time_range(start, end, limit)
    }

    pub fn stored_by_flow(
        &self,
        host_a: &str,
        host_b: &str,
        limit: usize,
    ) -> Result<Vec<PacketRow>, StoreError> {
        self.store.packets_by_flow(host_a, host_b, limit)
    }

    pub fn stored_packet_count(&self) -> Result<u64, StoreError> {
        self.store.packet_count()
    }

    pub fn stored_byte_count(&self) -> Result<u64, StoreError> {
        self.store.byte_count()
    }

    pub fn stored_protocol_distribution(&self) -> Result<Vec<(Protocol, u64)>, StoreError> {
        self.store.protocol_distribution()
    }

    pub fn stored_host_distribution(&self) -> Result<Vec<(String, u64)>, StoreError> {
        self.store.host_distribution()
    }

    pub fn stored_connection_distribution(&self) -> Result<Vec<(String, u64)>, StoreError> {
        self.store.connection_distribution()
    }

    /// Stop the pipeline and close the store (final flush included).
    pub fn shutdown(&self) {
        self.pipeline.stop();
        self.store.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::{Level, Logger};

    #[test]
    fn monitor_builds_and_shuts_down_cleanly() {
        let mut dir = std::env::temp_dir();
        dir.push(format!("netwatch-monitor-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        let logger = Arc::new(Logger::open(dir.join("test.log"), Level::Error).unwrap());
        let config = MonitorConfig {
            capture: CaptureConfig::default(),
            database: dir.join("packets.db"),
        };
        let monitor = Monitor::new(config, logger).unwrap();

        assert!(!monitor.is_running());
        assert_eq!(monitor.snapshot().total_packets, 0);
        assert_eq!(monitor.stored_packet_count().unwrap(), 0);

        let token = monitor.add_packet_callback(Arc::new(|_| {}));
        assert!(monitor.remove_packet_callback(token));

        monitor.stop(); // no-op on idle
        monitor.shutdown();
        monitor.shutdown(); // idempotent

        let _ = std::fs::remove_dir_all(dir);
    }
}
