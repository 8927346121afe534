//! Batched SQLite persistence for decoded packets.
//!
//! A bounded queue feeds a single writer thread that owns its own database
//! connection. The writer commits a transaction once `BATCH_SIZE` rows are
//! queued or `FLUSH_INTERVAL` has elapsed, whichever comes first. A failed
//! commit is rolled back and retried on the next tick; a second failure
//! drops the batch with an error log so the ingest path never stalls on a
//! sick database.
//!
//! Queries run synchronously on a separate connection to the same file; WAL
//! journaling keeps readers consistent at commit boundaries.

use crate::logger::SharedLogger;
use crate::record::{PacketRecord, Protocol};
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use rusqlite::{params, Connection};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Rows per write transaction.
pub const BATCH_SIZE: usize = 1000;

/// Longest a queued row waits before it is committed.
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Capacity of the queue between the dispatcher and the writer.
const QUEUE_BOUND: usize = 4096;

/// Errors from the packet store.
#[derive(Debug)]
pub enum StoreError {
    /// The database file could not be opened or initialized.
    Open(rusqlite::Error),
    /// A prepared statement or step failed while querying.
    Query(rusqlite::Error),
    /// `store` was called after `close`.
    Closed,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Open(e) => write!(f, "failed to open packet store: {}", e),
            StoreError::Query(e) => write!(f, "query failed: {}", e),
            StoreError::Closed => write!(f, "packet store is closed"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Open(e) | StoreError::Query(e) => Some(e),
            StoreError::Closed => None,
        }
    }
}

/// One persisted packet read back from the store: the record minus its raw
/// frame bytes, payload as an opaque blob.
#[derive(Debug, Clone, PartialEq)]
pub struct PacketRow {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub protocol: Protocol,
    pub source_address: String,
    pub destination_address: String,
    pub source_port: u16,
    pub destination_port: u16,
    pub length: usize,
    pub is_fragmented: bool,
    pub is_malformed: bool,
    pub sequence_number: u32,
    pub acknowledgment_number: u32,
    pub window_size: u16,
    pub ttl: u8,
    pub tos: u8,
    pub payload: Vec<u8>,
}

enum Job {
    Insert(Arc<PacketRecord>),
    Flush(Sender<()>),
}

/// Append-only packet store over a single SQLite file.
pub struct PacketStore {
    job_tx: Mutex<Option<Sender<Job>>>,
    query_conn: Mutex<Connection>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

const CREATE_SQL: &str = "
    CREATE TABLE IF NOT EXISTS packets (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp_us INTEGER NOT NULL,
        protocol TEXT NOT NULL,
        source_address TEXT NOT NULL,
        destination_address TEXT NOT NULL,
        source_port INTEGER,
        destination_port INTEGER,
        length INTEGER NOT NULL,
        is_fragmented BOOLEAN NOT NULL,
        is_malformed BOOLEAN NOT NULL,
        sequence_number INTEGER,
        acknowledgment_number INTEGER,
        window_size INTEGER,
        ttl INTEGER,
        tos INTEGER,
        payload BLOB
    );

    CREATE INDEX IF NOT EXISTS idx_packets_timestamp ON packets(timestamp_us);
    CREATE INDEX IF NOT EXISTS idx_packets_protocol ON packets(protocol);
    CREATE INDEX IF NOT EXISTS idx_packets_source ON packets(source_address);
    CREATE INDEX IF NOT EXISTS idx_packets_destination ON packets(destination_address);
";

const INSERT_SQL: &str = "
    INSERT INTO packets (
        timestamp_us, protocol, source_address, destination_address,
        source_port, destination_port, length, is_fragmented, is_malformed,
        sequence_number, acknowledgment_number, window_size, ttl, tos, payload
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
";

const SELECT_COLUMNS: &str = "
    id, timestamp_us, protocol, source_address, destination_address,
    source_port, destination_port, length, is_fragmented, is_malformed,
    sequence_number, acknowledgment_number, window_size, ttl, tos, payload
";

impl PacketStore {
    /// Open (creating if needed) the store and start the writer thread.
    /// Failure here is a startup fault.
    pub fn open(path: impl AsRef<Path>, logger: SharedLogger) -> Result<PacketStore, StoreError> {
        PacketStore::with_tuning(path, logger, BATCH_SIZE, FLUSH_INTERVAL)
    }

    /// `open` with an explicit batch size and flush interval; tests shrink
    /// both.
    pub fn with_tuning(
        path: impl AsRef<Path>,
        logger: SharedLogger,
        batch_size: usize,
        flush_interval: Duration,
    ) -> Result<PacketStore, StoreError> {
        let path: PathBuf = path.as_ref().into();

        let writer_conn = open_connection(&path)?;
        writer_conn
            .execute_batch(CREATE_SQL)
            .map_err(StoreError::Open)?;
        let query_conn = open_connection(&path)?;

        let (job_tx, job_rx) = bounded::<Job>(QUEUE_BOUND);
        let writer = thread::Builder::new()
            .name("nw-store".into())
            .spawn(move || writer_loop(writer_conn, job_rx, logger, batch_size, flush_interval))
            .expect("failed to spawn store writer thread");

        Ok(PacketStore {
            job_tx: Mutex::new(Some(job_tx)),
            query_conn: Mutex::new(query_conn),
            writer: Mutex::new(Some(writer)),
        })
    }

    /// Queue one record for insertion. Blocks only on queue backpressure.
    pub fn store(&self, record: Arc<PacketRecord>) -> Result<(), StoreError> {
        let guard = self.lock_tx();
        match guard.as_ref() {
            Some(tx) => tx.send(Job::Insert(record)).map_err(|_| StoreError::Closed),
            None => Err(StoreError::Closed),
        }
    }

    /// Commit everything queued so far and wait for the transaction.
    pub fn flush(&self) {
        let tx = match self.lock_tx().as_ref() {
            Some(tx) => tx.clone(),
            None => return,
        };
        let (ack_tx, ack_rx) = bounded(1);
        if tx.send(Job::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }

    /// Stop accepting rows, commit the remainder, and join the writer.
    /// Queries keep working afterwards; calling `close` again is a no-op.
    pub fn close(&self) {
        self.lock_tx().take();
        let handle = self
            .writer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    fn lock_tx(&self) -> std::sync::MutexGuard<'_, Option<Sender<Job>>> {
        self.job_tx.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.query_conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Most recent packets of one protocol tag.
    pub fn packets_by_protocol(
        &self,
        protocol: Protocol,
        limit: usize,
    ) -> Result<Vec<PacketRow>, StoreError> {
        let sql = format!(
            "SELECT {} FROM packets WHERE protocol = ?1 ORDER BY timestamp_us DESC LIMIT ?2",
            SELECT_COLUMNS
        );
        self.select_rows(&sql, params![protocol.as_str(), limit as i64])
    }

    /// Most recent packets sent or received by one host.
    pub fn packets_by_host(&self, host: &str, limit: usize) -> Result<Vec<PacketRow>, StoreError> {
        let sql = format!(
            "SELECT {} FROM packets
             WHERE source_address = ?1 OR destination_address = ?1
             ORDER BY timestamp_us DESC LIMIT ?2",
            SELECT_COLUMNS
        );
        self.select_rows(&sql, params![host, limit as i64])
    }

    /// Most recent packets captured inside `[start, end]`.
    pub fn packets_by_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PacketRow>, StoreError> {
        let sql = format!(
            "SELECT {} FROM packets
             WHERE timestamp_us >= ?1 AND timestamp_us <= ?2
             ORDER BY timestamp_us DESC LIMIT ?3",
            SELECT_COLUMNS
        );
        self.select_rows(
            &sql,
            params![start.timestamp_micros(), end.timestamp_micros(), limit as i64],
        )
    }

    /// Most recent packets between two hosts, either direction.
    pub fn packets_by_flow(
        &self,
        host_a: &str,
        host_b: &str,
        limit: usize,
    ) -> Result<Vec<PacketRow>, StoreError> {
        let sql = format!(
            "SELECT {} FROM packets
             WHERE (source_address = ?1 AND destination_address = ?2)
                OR (source_address = ?2 AND destination_address = ?1)
             ORDER BY timestamp_us DESC LIMIT ?3",
            SELECT_COLUMNS
        );
        self.select_rows(&sql, params![host_a, host_b, limit as i64])
    }

    pub fn packet_count(&self) -> Result<u64, StoreError> {
        let conn = self.lock_conn();
        conn.query_row("SELECT COUNT(*) FROM packets", [], |row| {
            row.get::<_, i64>(0)
        })
        .map(|n| n as u64)
        .map_err(StoreError::Query)
    }

    pub fn byte_count(&self) -> Result<u64, StoreError> {
        let conn = self.lock_conn();
        conn.query_row("SELECT COALESCE(SUM(length), 0) FROM packets", [], |row| {
            row.get::<_, i64>(0)
        })
        .map(|n| n as u64)
        .map_err(StoreError::Query)
    }

    /// Packet counts per protocol tag, busiest first.
    pub fn protocol_distribution(&self) -> Result<Vec<(Protocol, u64)>, StoreError> {
        let conn = self.lock_conn();
        let mut stmt = conn
            .prepare(
                "SELECT protocol, COUNT(*) AS n FROM packets
                 GROUP BY protocol ORDER BY n DESC",
            )
            .map_err(StoreError::Query)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    parse_protocol_column(&row.get::<_, String>(0)?, 0)?,
                    row.get::<_, i64>(1)? as u64,
                ))
            })
            .map_err(StoreError::Query)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StoreError::Query)
    }

    /// Packet counts per host address (as source or destination), busiest
    /// first.
    pub fn host_distribution(&self) -> Result<Vec<(String, u64)>, StoreError> {
        let conn = self.lock_conn();
        let mut stmt = conn
            .prepare(
                "SELECT addr, COUNT(*) AS n FROM (
                     SELECT source_address AS addr FROM packets
                     UNION ALL
                     SELECT destination_address FROM packets
                 ) WHERE addr <> '' GROUP BY addr ORDER BY n DESC",
            )
            .map_err(StoreError::Query)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })
            .map_err(StoreError::Query)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StoreError::Query)
    }

    /// Packet counts per host pair, direction-collapsed, busiest first.
    pub fn connection_distribution(&self) -> Result<Vec<(String, u64)>, StoreError> {
        let conn = self.lock_conn();
        let mut stmt = conn
            .prepare(
                "SELECT CASE WHEN source_address <= destination_address
                             THEN source_address || '-' || destination_address
                             ELSE destination_address || '-' || source_address
                        END AS pair, COUNT(*) AS n
                 FROM packets WHERE source_address <> ''
                 GROUP BY pair ORDER BY n DESC",
            )
            .map_err(StoreError::Query)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })
            .map_err(StoreError::Query)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StoreError::Query)
    }

    fn select_rows(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<PacketRow>, StoreError> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(sql).map_err(StoreError::Query)?;
        let rows = stmt.query_map(params, row_to_packet).map_err(StoreError::Query)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StoreError::Query)
    }
}

impl Drop for PacketStore {
    fn drop(&mut self) {
        self.close();
    }
}

fn open_connection(path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open(path).map_err(StoreError::Open)?;
    conn.busy_timeout(Duration::from_secs(5))
        .map_err(StoreError::Open)?;
    // journal_mode returns the resulting mode as a row, so query it.
    conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))
        .map_err(StoreError::Open)?;
    Ok(conn)
}

/// Rebuild a `Protocol` from a stored name; a row that no longer parses is
/// a query failure, not an `Unknown` tag.
fn parse_protocol_column(name: &str, column: usize) -> rusqlite::Result<Protocol> {
    name.parse::<Protocol>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_to_packet(row: &rusqlite::Row<'_>) -> rusqlite::Result<PacketRow> {
    Ok(PacketRow {
        id: row.get(0)?,
        timestamp: DateTime::from_timestamp_micros(row.get::<_, i64>(1)?)
            .unwrap_or_else(|| DateTime::<Utc>::MIN_UTC),
        protocol: parse_protocol_column(&row.get::<_, String>(2)?, 2)?,
        source_address: row.get(3)?,
        destination_address: row.get(4)?,
        source_port: row.get::<_, i64>(5)? as u16,
        destination_port: row.get::<_, i64>(6)? as u16,
        length: row.get::<_, i64>(7)? as usize,
        is_fragmented: row.get(8)?,
        is_malformed: row.get(9)?,
        sequence_number: row.get::<_, i64>(10)? as u32,
        acknowledgment_number: row.get::<_, i64>(11)? as u32,
        window_size: row.get::<_, i64>(12)? as u16,
        ttl: row.get::<_, i64>(13)? as u8,
        tos: row.get::<_, i64>(14)? as u8,
        payload: row.get::<_, Option<Vec<u8>>>(15)?.unwrap_or_default(),
    })
}

fn writer_loop(
    mut conn: Connection,
    rx: Receiver<Job>,
    logger: SharedLogger,
    batch_size: usize,
    flush_interval: Duration,
) {
    let mut batch: Vec<Arc<PacketRecord>> = Vec::with_capacity(batch_size);
    let mut retried = false;
    let mut deadline = Instant::now() + flush_interval;

    loop {
        let timeout = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(timeout) {
            Ok(Job::Insert(record)) => {
                batch.push(record);
                if batch.len() >= batch_size {
                    commit_batch(&mut conn, &mut batch, &mut retried, &logger);
                    deadline = Instant::now() + flush_interval;
                }
            }
            Ok(Job::Flush(ack)) => {
                commit_batch(&mut conn, &mut batch, &mut retried, &logger);
                deadline = Instant::now() + flush_interval;
                let _ = ack.send(());
            }
            Err(RecvTimeoutError::Timeout) => {
                commit_batch(&mut conn, &mut batch, &mut retried, &logger);
                deadline = Instant::now() + flush_interval;
            }
            Err(RecvTimeoutError::Disconnected) => {
                // Final flush: the channel has drained and the store closed.
                commit_batch(&mut conn, &mut batch, &mut retried, &logger);
                break;
            }
        }
    }
}

fn commit_batch(
    conn: &mut Connection,
    batch: &mut Vec<Arc<PacketRecord>>,
    retried: &mut bool,
    logger: &SharedLogger,
) {
    if batch.is_empty() {
        return;
    }
    match insert_all(conn, batch) {
        Ok(()) => {
            batch.clear();
            *retried = false;
        }
        Err(e) if !*retried => {
            logger.error(&format!(
                "packet batch commit failed ({} rows), retrying next tick: {}",
                batch.len(),
                e
            ));
            *retried = true;
        }
        Err(e) => {
            logger.error(&format!(
                "dropping packet batch of {} rows after second commit failure: {}",
                batch.len(),
                e
            ));
            batch.clear();
            *retried = false;
        }
    }
}

fn insert_all(conn: &mut Connection, batch: &[Arc<PacketRecord>]) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare_cached(INSERT_SQL)?;
        for record in batch {
            let payload = if record.payload_length > 0 {
                Some(record.payload())
            } else {
                None
            };
            stmt.execute(params![
                record.timestamp.timestamp_micros(),
                record.protocol.as_str(),
                record.source_address,
                record.destination_address,
                record.source_port as i64,
                record.destination_port as i64,
                record.length as i64,
                record.is_fragmented,
                record.is_malformed,
                record.sequence_number as i64,
                record.acknowledgment_number as i64,
                record.window_size as i64,
                record.ttl as i64,
                record.tos as i64,
                payload,
            ])?;
        }
    }
    tx.commit()
}
