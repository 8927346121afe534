use clap::Parser;
use std::path::PathBuf;

/// netwatch: live network traffic monitor and analyzer
#[derive(Parser, Debug)]
#[command(name = "netwatch", version, about)]
pub struct Cli {
    /// Network interface to capture on (e.g. "eth0").
    /// Required to start monitoring.
    #[arg(short, long)]
    pub interface: Option<String>,

    /// BPF filter expression (e.g. "tcp port 443"). Empty = no filter.
    #[arg(short, long)]
    pub filter: Option<String>,

    /// Log file path
    #[arg(short = 'l', long)]
    pub log_file: Option<PathBuf>,

    /// Log level: debug, info, warning, error, or fatal
    #[arg(long)]
    pub log_level: Option<String>,

    /// Configuration file ([section] / key=value format)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// SQLite file backing the packet store
    #[arg(short, long)]
    pub database: Option<PathBuf>,

    /// Stop after this many seconds (0 = run until Ctrl-C)
    #[arg(long, default_value_t = 0)]
    pub duration: u64,

    /// Seconds between console statistics updates
    #[arg(long, default_value_t = 1)]
    pub stats_interval: u64,

    /// Write the final statistics snapshot to this JSON file on exit
    #[arg(long)]
    pub export_json: Option<PathBuf>,

    /// List available network interfaces and exit
    #[arg(long)]
    pub list_interfaces: bool,
}
