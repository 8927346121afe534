//! Process-wide log sink.
//!
//! One [`Logger`] is opened in `main` and handed to components as an
//! [`Arc`] at construction time; tests build their own against temp paths.
//! Records are plain text, one per line:
//!
//! ```text
//! 2026-08-02 14:03:51.284 [INFO] capture started on eth0
//! ```
//!
//! The file rotates once it exceeds the size cap: `file.N` backups shift up
//! by one, the oldest is deleted, and the live file becomes `file.1`.

use chrono::Local;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

/// Default rotation threshold: 10 MiB.
pub const DEFAULT_MAX_SIZE: u64 = 10 * 1024 * 1024;

/// Default number of rotated backups kept on disk.
pub const DEFAULT_MAX_BACKUPS: usize = 5;

/// Log severity, ordered from chattiest to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug = 0,
    Info = 1,
    Warning = 2,
    Error = 3,
    Fatal = 4,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warning => "WARNING",
            Level::Error => "ERROR",
            Level::Fatal => "FATAL",
        }
    }

    fn from_u8(value: u8) -> Level {
        match value {
            0 => Level::Debug,
            1 => Level::Info,
            2 => Level::Warning,
            3 => Level::Error,
            _ => Level::Fatal,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for unrecognized `--log-level` values.
#[derive(Debug)]
pub struct ParseLevelError(pub String);

impl fmt::Display for ParseLevelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown log level '{}' (expected debug|info|warning|error|fatal)",
            self.0
        )
    }
}

impl std::error::Error for ParseLevelError {}

impl FromStr for Level {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(Level::Debug),
            "info" => Ok(Level::Info),
            "warning" => Ok(Level::Warning),
            "error" => Ok(Level::Error),
            "fatal" => Ok(Level::Fatal),
            other => Err(ParseLevelError(other.into())),
        }
    }
}

struct LogSink {
    path: PathBuf,
    file: File,
    written: u64,
    max_size: u64,
    max_backups: usize,
}

/// Severity-filtered rotating file logger.
pub struct Logger {
    level: AtomicU8,
    sink: Mutex<LogSink>,
}

/// How components hold the logger.
pub type SharedLogger = Arc<Logger>;

impl Logger {
    /// Open (or append to) the log file with the default rotation policy.
    pub fn open(path: impl Into<PathBuf>, level: Level) -> io::Result<Logger> {
        Logger::with_rotation(path, level, DEFAULT_MAX_SIZE, DEFAULT_MAX_BACKUPS)
    }

    pub fn with_rotation(
        path: impl Into<PathBuf>,
        level: Level,
        max_size: u64,
        max_backups: usize,
    ) -> io::Result<Logger> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();
        Ok(Logger {
            level: AtomicU8::new(level as u8),
            sink: Mutex::new(LogSink {
                path,
                file,
                written,
                max_size,
                max_backups,
            }),
        })
    }

    pub fn level(&self) -> Level {
        Level::from_u8(self.level.load(Ordering::Relaxed))
    }

    pub fn set_level(&self, level: Level) {
        self.level.store(level as u8, Ordering::Relaxed);
    }

    pub fn debug(&self, message: &str) {
        self.log(Level::Debug, message);
    }

    pub fn info(&self, message: &str) {
        self.log(Level::Info, message);
    }

    pub fn warning(&self, message: &str) {
        self.log(Level::Warning, message);
    }

    pub fn error(&self, message: &str) {
        self.log(Level::Error, message);
    }

    pub fn fatal(&self, message: &str) {
        self.log(Level::Fatal, message);
    }

    pub fn log(&self, level: Level, message: &str) {
        if level < self.level() {
            return;
        }

        let line = format!(
            "{} [{}] {}",
            Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            level,
            message
        );

        if let Ok(mut sink) = self.sink.lock() {
            if sink.write_line(&line).is_err() {
                // The sink is gone; stderr is all that's left.
                eprintln!("{}", line);
                return;
            }
        }

        // Severe records are mirrored to the console as well.
        if level >= Level::Error {
            eprintln!("{}", line);
        }
    }
}

impl LogSink {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        let len = line.len() as u64 + 1;
        if self.written + len > self.max_size {
            self.rotate()?;
        }
        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;
        self.file.flush()?;
        self.written += len;
        Ok(())
    }

    /// Shift `file.N -> file.N+1`, drop the oldest, move the live file to
    /// `file.1`, and start a fresh one.
    fn rotate(&mut self) -> io::Result<()> {
        if self.max_backups > 0 {
            let oldest = backup_path(&self.path, self.max_backups);
            if oldest.exists() {
                fs::remove_file(&oldest)?;
            }
            for n in (1..self.max_backups).rev() {
                let from = backup_path(&self.path, n);
                if from.exists() {
                    fs::rename(&from, backup_path(&self.path, n + 1))?;
                }
            }
            fs::rename(&self.path, backup_path(&self.path, 1))?;
        } else {
            fs::remove_file(&self.path)?;
        }

        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

fn backup_path(path: &Path, n: usize) -> PathBuf {
    PathBuf::from(format!("{}.{}", path.display(), n))
}
