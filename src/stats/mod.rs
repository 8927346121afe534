//! Statistics engine: totals, per-protocol, per-host and per-connection
//! counters, a TCP retransmission heuristic, and a one-second bandwidth
//! sampler.
//!
//! All aggregate state lives behind a single mutex. `update` runs on the
//! statistics thread; every query locks briefly and hands back owned values,
//! so callers never hold references into engine state.
//!
//! Time comes from the capture timestamps of the packets themselves, not
//! from the wall clock at update time. Updates only ever happen because a
//! packet arrived, and the kernel timestamps are wall-clock anyway, so this
//! changes nothing live while keeping the window and eviction logic
//! deterministic under test.

use crate::record::{PacketRecord, Protocol};
use chrono::{DateTime, Duration, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Upper bound on the bandwidth history: one hour at one-second samples.
pub const MAX_BANDWIDTH_HISTORY: usize = 3600;

/// A connection idle longer than this is dropped from the table.
pub const CONNECTION_TIMEOUT_SECS: i64 = 300;

/// The eviction sweep runs at most this often (in packet time).
const SWEEP_INTERVAL_SECS: i64 = 1;

/// Monotonic counters kept per protocol tag, globally and nested per host.
#[derive(Debug, Clone, Serialize)]
pub struct ProtocolCounters {
    pub packets: u64,
    pub bytes: u64,
    pub errors: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl ProtocolCounters {
    fn new(now: DateTime<Utc>) -> Self {
        ProtocolCounters {
            packets: 0,
            bytes: 0,
            errors: 0,
            first_seen: now,
            last_seen: now,
        }
    }

    fn record(&mut self, bytes: u64, malformed: bool, now: DateTime<Utc>) {
        self.packets += 1;
        self.bytes += bytes;
        if malformed {
            self.errors += 1;
        }
        self.last_seen = now;
    }
}

/// Per-host aggregate with a nested per-protocol breakdown. Hosts are never
/// evicted.
#[derive(Debug, Clone, Serialize)]
pub struct HostCounters {
    pub packets: u64,
    pub bytes: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub protocols: IndexMap<Protocol, ProtocolCounters>,
}

impl HostCounters {
    fn new(now: DateTime<Utc>) -> Self {
        HostCounters {
            packets: 0,
            bytes: 0,
            first_seen: now,
            last_seen: now,
            protocols: IndexMap::new(),
        }
    }
}

/// Per-connection aggregate, keyed by the canonical flow id.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionCounters {
    pub packets: u64,
    pub bytes: u64,
    pub retransmission_count: u64,
    pub start_time: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub is_active: bool,
}

/// One closed one-second window: the instant it closed and the bits credited
/// to it.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BandwidthSample {
    pub at: DateTime<Utc>,
    pub bits: f64,
}

#[derive(Debug)]
struct BandwidthSampler {
    history: VecDeque<BandwidthSample>,
    current_bits: f64,
    average: f64,
    window_started: Option<DateTime<Utc>>,
}

impl BandwidthSampler {
    fn new() -> Self {
        BandwidthSampler {
            history: VecDeque::new(),
            current_bits: 0.0,
            average: 0.0,
            window_started: None,
        }
    }

    fn record(&mut self, now: DateTime<Utc>, bits: f64) {
        match self.window_started {
            None => self.window_started = Some(now),
            Some(started) if now - started >= Duration::seconds(1) => {
                self.history.push_back(BandwidthSample {
                    at: now,
                    bits: self.current_bits,
                });
                while self.history.len() > MAX_BANDWIDTH_HISTORY {
                    self.history.pop_front();
                }
                self.average =
                    self.history.iter().map(|s| s.bits).sum::<f64>() / self.history.len() as f64;
                self.current_bits = 0.0;
                self.window_started = Some(now);
            }
            Some(_) => {}
        }
        self.current_bits += bits;
    }
}

/// Consolidated point-in-time view for display surfaces, cheap to build at
/// ~1 Hz.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub total_packets: u64,
    pub total_bytes: u64,
    pub total_errors: u64,
    pub current_bandwidth_bits: f64,
    pub average_bandwidth_bits: f64,
    pub hosts_seen: usize,
    pub active_connections: usize,
    pub top_protocols: Vec<(Protocol, u64)>,
    pub top_hosts: Vec<(String, u64)>,
    pub top_connections: Vec<(String, u64)>,
}

struct StatsInner {
    total_packets: u64,
    total_bytes: u64,
    total_errors: u64,
    protocols: IndexMap<Protocol, ProtocolCounters>,
    hosts: IndexMap<String, HostCounters>,
    connections: IndexMap<String, ConnectionCounters>,
    // Retransmission heuristic state: last sequence number seen per flow.
    last_seq: HashMap<String, u32>,
    bandwidth: BandwidthSampler,
    last_sweep: Option<DateTime<Utc>>,
}

impl StatsInner {
    fn new() -> Self {
        StatsInner {
            total_packets: 0,
            total_bytes: 0,
            total_errors: 0,
            protocols: IndexMap::new(),
            hosts: IndexMap::new(),
            connections: IndexMap::new(),
            last_seq: HashMap::new(),
            bandwidth: BandwidthSampler::new(),
            last_sweep: None,
        }
    }
}

/// The statistics engine. Shared as `Arc<StatsEngine>` between the pipeline
/// and snapshot readers.
pub struct StatsEngine {
    inner: Mutex<StatsInner>,
}

impl Default for StatsEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Canonical bidirectional flow id: the lexicographically smaller
/// `addr:port` endpoint, a dash, then the larger, so both directions of a
/// conversation collapse to one key.
pub fn canonical_flow_id(record: &PacketRecord) -> String {
    let src = format!("{}:{}", record.source_address, record.source_port);
    let dst = format!("{}:{}", record.destination_address, record.destination_port);
    if src <= dst {
        format!("{}-{}", src, dst)
    } else {
        format!("{}-{}", dst, src)
    }
}

impl StatsEngine {
    pub fn new() -> Self {
        StatsEngine {
            inner: Mutex::new(StatsInner::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StatsInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fold one record into every aggregate. Malformed packets count as
    /// errors but otherwise move all the same counters.
    pub fn update(&self, record: &PacketRecord) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let now = record.timestamp;
        let bytes = record.length as u64;

        inner.total_packets += 1;
        inner.total_bytes += bytes;
        if record.is_malformed {
            inner.total_errors += 1;
        }

        inner
            .protocols
            .entry(record.protocol)
            .or_insert_with(|| ProtocolCounters::new(now))
            .record(bytes, record.is_malformed, now);

        for addr in [&record.source_address, &record.destination_address] {
            if addr.is_empty() {
                continue;
            }
            let host = inner
                .hosts
                .entry(addr.clone())
                .or_insert_with(|| HostCounters::new(now));
            host.packets += 1;
            host.bytes += bytes;
            host.last_seen = now;
            host.protocols
                .entry(record.protocol)
                .or_insert_with(|| ProtocolCounters::new(now))
                .record(bytes, record.is_malformed, now);
        }

        if record.protocol.is_transport() {
            let id = canonical_flow_id(record);
            let conn = inner
                .connections
                .entry(id.clone())
                .or_insert_with(|| ConnectionCounters {
                    packets: 0,
                    bytes: 0,
                    retransmission_count: 0,
                    start_time: now,
                    last_seen: now,
                    is_active: true,
                });
            conn.packets += 1;
            conn.bytes += bytes;
            conn.last_seen = now;

            // Last-sequence retransmission heuristic: a repeat of the
            // previous sequence number on the flow counts, nothing else.
            if record.protocol.is_tcp() {
                if inner.last_seq.get(&id) == Some(&record.sequence_number) {
                    conn.retransmission_count += 1;
                }
                inner.last_seq.insert(id, record.sequence_number);
            }
        }

        inner.bandwidth.record(now, (bytes * 8) as f64);

        let due = match inner.last_sweep {
            None => true,
            Some(at) => now - at >= Duration::seconds(SWEEP_INTERVAL_SECS),
        };
        if due {
            inner.last_sweep = Some(now);
            sweep_connections(inner, now);
        }
    }

    /// Drop every aggregate and restart the bandwidth window at the next
    /// update.
    pub fn reset(&self) {
        let mut guard = self.lock();
        *guard = StatsInner::new();
    }

    pub fn total_packets(&self) -> u64 {
        self.lock().total_packets
    }

    pub fn total_bytes(&self) -> u64 {
        self.lock().total_bytes
    }

    pub fn total_errors(&self) -> u64 {
        self.lock().total_errors
    }

    pub fn protocol_packets(&self, protocol: Protocol) -> u64 {
        self.lock()
            .protocols
            .get(&protocol)
            .map_or(0, |c| c.packets)
    }

    pub fn protocol_bytes(&self, protocol: Protocol) -> u64 {
        self.lock().protocols.get(&protocol).map_or(0, |c| c.bytes)
    }

    /// Protocols ranked by packet count. Ties keep first-seen order (the
    /// maps are insertion-ordered and the sort is stable).
    pub fn top_protocols(&self, count: usize) -> Vec<(Protocol, u64)> {
        let guard = self.lock();
        let mut ranked: Vec<(Protocol, u64)> = guard
            .protocols
            .iter()
            .map(|(proto, c)| (*proto, c.packets))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1));
        ranked.truncate(count);
        ranked
    }

    /// Hosts ranked by packet count.
    pub fn top_hosts(&self, count: usize) -> Vec<(String, u64)> {
        let guard = self.lock();
        let mut ranked: Vec<(String, u64)> = guard
            .hosts
            .iter()
            .map(|(host, c)| (host.clone(), c.packets))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1));
        ranked.truncate(count);
        ranked
    }

    /// Connections ranked by packet count.
    pub fn top_connections(&self, count: usize) -> Vec<(String, u64)> {
        let guard = self.lock();
        let mut ranked: Vec<(String, u64)> = guard
            .connections
            .iter()
            .map(|(id, c)| (id.clone(), c.packets))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1));
        ranked.truncate(count);
        ranked
    }

    /// Error-producing protocols ranked by error count.
    pub fn top_errors(&self, count: usize) -> Vec<(String, u64)> {
        let guard = self.lock();
        let mut ranked: Vec<(String, u64)> = guard
            .protocols
            .iter()
            .filter(|(_, c)| c.errors > 0)
            .map(|(proto, c)| (proto.to_string(), c.errors))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1));
        ranked.truncate(count);
        ranked
    }

    pub fn host(&self, address: &str) -> Option<HostCounters> {
        self.lock().hosts.get(address).cloned()
    }

    pub fn connection(&self, flow_id: &str) -> Option<ConnectionCounters> {
        self.lock().connections.get(flow_id).cloned()
    }

    pub fn active_hosts(&self) -> Vec<String> {
        self.lock().hosts.keys().cloned().collect()
    }

    /// Flow ids of connections currently marked active.
    pub fn active_connections(&self) -> Vec<String> {
        self.lock()
            .connections
            .iter()
            .filter(|(_, c)| c.is_active)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn bandwidth_history(&self) -> Vec<BandwidthSample> {
        self.lock().bandwidth.history.iter().copied().collect()
    }

    /// Bits accumulated in the currently open one-second window.
    pub fn current_bandwidth(&self) -> f64 {
        self.lock().bandwidth.current_bits
    }

    /// Mean of the closed windows in the history.
    pub fn average_bandwidth(&self) -> f64 {
        self.lock().bandwidth.average
    }

    /// One consolidated owned snapshot for the display poll.
    pub fn snapshot(&self) -> StatsSnapshot {
        const TOP_N: usize = 10;
        let guard = self.lock();

        let mut top_protocols: Vec<(Protocol, u64)> = guard
            .protocols
            .iter()
            .map(|(proto, c)| (*proto, c.packets))
            .collect();
        top_protocols.sort_by(|a, b| b.1.cmp(&a.1));
        top_protocols.truncate(TOP_N);

        let mut top_hosts: Vec<(String, u64)> = guard
            .hosts
            .iter()
            .map(|(host, c)| (host.clone(), c.packets))
            .collect();
        top_hosts.sort_by(|a, b| b.1.cmp(&a.1));
        top_hosts.truncate(TOP_N);

        let mut top_connections: Vec<(String, u64)> = guard
            .connections
            .iter()
            .map(|(id, c)| (id.clone(), c.packets))
            .collect();
        top_connections.sort_by(|a, b| b.1.cmp(&a.1));
        top_connections.truncate(TOP_N);

        StatsSnapshot {
            total_packets: guard.total_packets,
            total_bytes: guard.total_bytes,
            total_errors: guard.total_errors,
            current_bandwidth_bits: guard.bandwidth.current_bits,
            average_bandwidth_bits: guard.bandwidth.average,
            hosts_seen: guard.hosts.len(),
            active_connections: guard.connections.values().filter(|c| c.is_active).count(),
            top_protocols,
            top_hosts,
            top_connections,
        }
    }
}

fn sweep_connections(inner: &mut StatsInner, now: DateTime<Utc>) {
    let timeout = Duration::seconds(CONNECTION_TIMEOUT_SECS);
    let expired: Vec<String> = inner
        .connections
        .iter()
        .filter(|(_, c)| now - c.last_seen > timeout)
        .map(|(id, _)| id.clone())
        .collect();
    for id in expired {
        if let Some(conn) = inner.connections.get_mut(&id) {
            conn.is_active = false;
        }
        inner.connections.shift_remove(&id);
        inner.last_seq.remove(&id);
    }
}
