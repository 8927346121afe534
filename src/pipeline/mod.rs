//! Capture pipeline: lifecycle, work distribution, and the subscriber
//! registry.
//!
//! Thread topology at steady state:
//!
//! ```text
//! nw-capture (sole producer)
//!   | decode -> Arc<PacketRecord>
//!   +--[bounded intake channel]--> nw-dispatch
//!                                    |-- clone --> [bounded channel] --> nw-stats
//!                                    |-- clone --> store queue --> nw-store (storage writer)
//!                                    +-- subscriber callbacks, registration order
//! ```
//!
//! For any one packet the dispatcher forwards to the statistics channel and
//! enqueues to the store before reading the next packet, and callbacks see
//! packets in arrival order. The bounded channels provide backpressure: a
//! full intake channel blocks the capture thread rather than dropping
//! frames.

use crate::capture::{CaptureConfig, CaptureError, CaptureSource};
use crate::logger::SharedLogger;
use crate::protocol;
use crate::record::PacketRecord;
use crate::stats::StatsEngine;
use crate::storage::PacketStore;
use crossbeam_channel::{bounded, Receiver, Sender};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// Capacity of the intake and statistics channels.
const CHANNEL_CAPACITY: usize = 1024;

/// A registered packet observer. Callbacks run on the dispatch thread and
/// must not block it indefinitely.
pub type Subscriber = Arc<dyn Fn(&PacketRecord) + Send + Sync>;

/// Identity handle returned by [`Pipeline::add_packet_callback`]; the only
/// way to unregister a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberToken(u64);

/// Pipeline lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running,
    Stopping,
}

type SubscriberList = Arc<Mutex<Vec<(SubscriberToken, Subscriber)>>>;

/// Owns the capture source and worker threads, fanning every decoded packet
/// out to the statistics engine, the packet store, and subscribers.
pub struct Pipeline {
    state: Mutex<PipelineState>,
    capture_config: Mutex<CaptureConfig>,
    subscribers: SubscriberList,
    next_token: AtomicU64,
    running: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<StatsEngine>,
    store: Arc<PacketStore>,
    logger: SharedLogger,
}

impl Pipeline {
    pub fn new(
        capture_config: CaptureConfig,
        stats: Arc<StatsEngine>,
        store: Arc<PacketStore>,
        logger: SharedLogger,
    ) -> Pipeline {
        Pipeline {
            state: Mutex::new(PipelineState::Idle),
            capture_config: Mutex::new(capture_config),
            subscribers: Arc::new(Mutex::new(Vec::new())),
            next_token: AtomicU64::new(1),
            running: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(Vec::new()),
            stats,
            store,
            logger,
        }
    }

    pub fn state(&self) -> PipelineState {
        *self.lock_state()
    }

    /// Record the capture interface; takes effect at the next `start`.
    pub fn set_interface(&self, name: &str) {
        self.lock_capture().interface = Some(name.to_string());
    }

    /// Record the BPF filter expression; takes effect at the next `start`.
    /// An empty expression disables filtering.
    pub fn set_filter(&self, expr: &str) {
        self.lock_capture().filter = if expr.is_empty() {
            None
        } else {
            Some(expr.to_string())
        };
    }

    /// Register a packet observer, invoked once per packet in arrival order.
    pub fn add_packet_callback(&self, callback: Subscriber) -> SubscriberToken {
        let token = SubscriberToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.lock_subscribers().push((token, callback));
        token
    }

    /// Unregister a previously added callback. Returns false for unknown
    /// tokens.
    pub fn remove_packet_callback(&self, token: SubscriberToken) -> bool {
        let mut subs = self.lock_subscribers();
        let before = subs.len();
        subs.retain(|(t, _)| *t != token);
        subs.len() != before
    }

    /// Open the capture source and spin up the worker threads. Idempotent:
    /// a running pipeline stays untouched. Open and filter failures are
    /// startup faults and propagate.
    pub fn start(&self) -> Result<(), CaptureError> {
        let mut state = self.lock_state();
        if *state != PipelineState::Idle {
            return Ok(());
        }

        let config = self.lock_capture().clone();
        let mut source = CaptureSource::open(&config)?;
        self.logger.info(&format!(
            "pipeline started on interface {} (filter: {})",
            config.interface.as_deref().unwrap_or("(default)"),
            config.filter.as_deref().unwrap_or("none"),
        ));

        self.running.store(true, Ordering::SeqCst);
        let (intake_tx, intake_rx) = bounded::<Arc<PacketRecord>>(CHANNEL_CAPACITY);
        let (stats_tx, stats_rx) = bounded::<Arc<PacketRecord>>(CHANNEL_CAPACITY);

        let mut workers = self.lock_workers();

        let running = self.running.clone();
        let capture_logger = self.logger.clone();
        workers.push(
            thread::Builder::new()
                .name("nw-capture".into())
                .spawn(move || capture_loop(&mut source, intake_tx, running, capture_logger))
                .expect("failed to spawn capture thread"),
        );

        let store = self.store.clone();
        let subscribers = self.subscribers.clone();
        let dispatch_logger = self.logger.clone();
        workers.push(
            thread::Builder::new()
                .name("nw-dispatch".into())
                .spawn(move || {
                    dispatch_loop(intake_rx, stats_tx, store, subscribers, dispatch_logger)
                })
                .expect("failed to spawn dispatch thread"),
        );

        let stats = self.stats.clone();
        workers.push(
            thread::Builder::new()
                .name("nw-stats".into())
                .spawn(move || stats_loop(stats_rx, stats))
                .expect("failed to spawn stats thread"),
        );

        *state = PipelineState::Running;
        Ok(())
    }

    /// Stop capturing, drain the channels, join every worker, and flush the
    /// store. Idempotent: stopping an idle pipeline is a no-op.
    pub fn stop(&self) {
        {
            let mut state = self.lock_state();
            if *state != PipelineState::Running {
                return;
            }
            *state = PipelineState::Stopping;
        }

        // The capture thread notices the flag within its read timeout and
        // drops the intake sender; the consumers drain and exit in turn.
        self.running.store(false, Ordering::SeqCst);

        let workers: Vec<JoinHandle<()>> = self.lock_workers().drain(..).collect();
        for handle in workers {
            let _ = handle.join();
        }

        self.store.flush();
        self.logger.info("pipeline stopped");
        *self.lock_state() = PipelineState::Idle;
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, PipelineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_capture(&self) -> std::sync::MutexGuard<'_, CaptureConfig> {
        self.capture_config.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_subscribers(
        &self,
    ) -> std::sync::MutexGuard<'_, Vec<(SubscriberToken, Subscriber)>> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_workers(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.workers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn capture_loop(
    source: &mut CaptureSource,
    intake_tx: Sender<Arc<PacketRecord>>,
    running: Arc<AtomicBool>,
    logger: SharedLogger,
) {
    while running.load(Ordering::SeqCst) {
        match source.next_frame() {
            Ok(Some(frame)) => {
                let record = Arc::new(protocol::decode(frame.data, frame.wire_len, frame.timestamp));
                if intake_tx.send(record).is_err() {
                    break;
                }
            }
            // Read timeout: loop around and re-check the running flag.
            Ok(None) => {}
            Err(e) => {
                logger.error(&format!("error reading packet: {}", e));
            }
        }
    }
    // Dropping intake_tx here lets the dispatcher drain and exit.
}

fn dispatch_loop(
    intake_rx: Receiver<Arc<PacketRecord>>,
    stats_tx: Sender<Arc<PacketRecord>>,
    store: Arc<PacketStore>,
    subscribers: SubscriberList,
    logger: SharedLogger,
) {
    for record in intake_rx.iter() {
        // Analyzer forward and persistence enqueue both happen before the
        // next packet is read from the intake channel.
        let _ = stats_tx.send(record.clone());
        if let Err(e) = store.store(record.clone()) {
            logger.error(&format!("failed to enqueue packet for storage: {}", e));
        }

        let current: Vec<(SubscriberToken, Subscriber)> = subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for (token, callback) in current {
            if catch_unwind(AssertUnwindSafe(|| callback(&record))).is_err() {
                logger.error(&format!(
                    "packet callback {:?} panicked; continuing",
                    token
                ));
            }
        }
    }
    // Dropping stats_tx lets the statistics thread drain and exit.
}

fn stats_loop(stats_rx: Receiver<Arc<PacketRecord>>, stats: Arc<StatsEngine>) {
    for record in stats_rx.iter() {
        stats.update(&record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::{Level, Logger};
    use crate::record::Protocol;
    use crate::storage::StoreError;
    use chrono::Utc;
    use std::path::PathBuf;

    fn temp_dir(tag: &str) -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("netwatch-pipeline-{}-{}", tag, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn fixture(dir: &PathBuf) -> (SharedLogger, Arc<StatsEngine>, Arc<PacketStore>) {
        let logger = Arc::new(Logger::open(dir.join("test.log"), Level::Error).unwrap());
        let stats = Arc::new(StatsEngine::new());
        let store = Arc::new(PacketStore::open(dir.join("packets.db"), logger.clone()).unwrap());
        (logger, stats, store)
    }

    fn make_record(n: u32) -> Arc<PacketRecord> {
        let mut rec = PacketRecord::new(&[0u8; 60], 60, Utc::now());
        rec.protocol = Protocol::Tcp;
        rec.source_address = "10.0.0.1".into();
        rec.destination_address = "10.0.0.2".into();
        rec.source_port = 50000;
        rec.destination_port = 9000;
        rec.sequence_number = n;
        Arc::new(rec)
    }

    #[test]
    fn subscriber_tokens_register_and_remove() {
        let dir = temp_dir("tokens");
        let (logger, stats, store) = fixture(&dir);
        let pipeline = Pipeline::new(CaptureConfig::default(), stats, store, logger);

        let a = pipeline.add_packet_callback(Arc::new(|_| {}));
        let b = pipeline.add_packet_callback(Arc::new(|_| {}));
        assert_ne!(a, b);
        assert!(pipeline.remove_packet_callback(a));
        assert!(!pipeline.remove_packet_callback(a));
        assert!(pipeline.remove_packet_callback(b));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn stop_on_idle_pipeline_is_a_noop() {
        let dir = temp_dir("idle");
        let (logger, stats, store) = fixture(&dir);
        let pipeline = Pipeline::new(CaptureConfig::default(), stats, store, logger);
        assert_eq!(pipeline.state(), PipelineState::Idle);
        pipeline.stop();
        pipeline.stop();
        assert_eq!(pipeline.state(), PipelineState::Idle);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn start_on_missing_interface_fails_and_stays_idle() {
        let dir = temp_dir("badiface");
        let (logger, stats, store) = fixture(&dir);
        let pipeline = Pipeline::new(CaptureConfig::default(), stats, store, logger);
        pipeline.set_interface("definitely-not-a-real-interface-0");
        assert!(pipeline.start().is_err());
        assert_eq!(pipeline.state(), PipelineState::Idle);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn dispatch_reaches_every_consumer_in_order() {
        let dir = temp_dir("dispatch");
        let (logger, stats, store) = fixture(&dir);

        let (intake_tx, intake_rx) = bounded::<Arc<PacketRecord>>(16);
        let (stats_tx, stats_rx) = bounded::<Arc<PacketRecord>>(16);

        let seen: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        let subscribers: SubscriberList = Arc::new(Mutex::new(Vec::new()));
        subscribers.lock().unwrap().push((
            SubscriberToken(1),
            Arc::new(move |rec: &PacketRecord| {
                seen_cb.lock().unwrap().push(rec.sequence_number);
            }) as Subscriber,
        ));
        // A panicking subscriber must not take down the dispatcher or
        // starve later subscribers of later packets.
        subscribers.lock().unwrap().push((
            SubscriberToken(2),
            Arc::new(|_: &PacketRecord| panic!("bad subscriber")) as Subscriber,
        ));

        let store_for_dispatch = store.clone();
        let dispatcher = thread::spawn({
            let subscribers = subscribers.clone();
            let logger = logger.clone();
            move || dispatch_loop(intake_rx, stats_tx, store_for_dispatch, subscribers, logger)
        });
        let stats_for_loop = stats.clone();
        let stats_thread = thread::spawn(move || stats_loop(stats_rx, stats_for_loop));

        for n in 0..50 {
            intake_tx.send(make_record(n)).unwrap();
        }
        drop(intake_tx);
        dispatcher.join().unwrap();
        stats_thread.join().unwrap();

        assert_eq!(stats.total_packets(), 50);
        store.flush();
        assert_eq!(store.packet_count().unwrap(), 50);

        let order = seen.lock().unwrap().clone();
        assert_eq!(order, (0..50).collect::<Vec<u32>>());

        drop(store);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn dispatch_absorbs_store_closure() {
        let dir = temp_dir("closedstore");
        let (logger, stats, store) = fixture(&dir);
        store.close();
        assert!(matches!(store.store(make_record(0)), Err(StoreError::Closed)));

        let (intake_tx, intake_rx) = bounded::<Arc<PacketRecord>>(4);
        let (stats_tx, stats_rx) = bounded::<Arc<PacketRecord>>(4);
        let subscribers: SubscriberList = Arc::new(Mutex::new(Vec::new()));

        let store_for_dispatch = store.clone();
        let dispatcher = thread::spawn(move || {
            dispatch_loop(intake_rx, stats_tx, store_for_dispatch, subscribers, logger)
        });
        let stats_for_loop = stats.clone();
        let stats_thread = thread::spawn(move || stats_loop(stats_rx, stats_for_loop));

        intake_tx.send(make_record(1)).unwrap();
        drop(intake_tx);
        dispatcher.join().unwrap();
        stats_thread.join().unwrap();

        // the analyzer still saw the packet even though storage refused it
        assert_eq!(stats.total_packets(), 1);

        drop(store);
        let _ = std::fs::remove_dir_all(dir);
    }
}
