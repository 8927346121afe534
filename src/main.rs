use clap::Parser;
use std::error::Error;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use netwatch::capture::{self, CaptureConfig};
use netwatch::cli::Cli;
use netwatch::config::ConfigStore;
use netwatch::display;
use netwatch::logger::{Level, Logger, DEFAULT_MAX_BACKUPS, DEFAULT_MAX_SIZE};
use netwatch::{Monitor, MonitorConfig};

fn main() {
    let args = Cli::parse();

    if args.list_interfaces {
        list_interfaces();
        return;
    }

    // Any failure up to and including start() is a startup fault: report the
    // cause and exit non-zero.
    if let Err(e) = run(args) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

fn list_interfaces() {
    match capture::list_interfaces() {
        Ok(devices) => {
            println!("Available network interfaces:");
            for device in &devices {
                let desc = device.desc.as_deref().unwrap_or("");
                println!("  {:<16} {}", device.name, desc);
            }
            if devices.is_empty() {
                println!("  (none found - try running with elevated privileges)");
            }
        }
        Err(e) => {
            eprintln!("error listing interfaces: {}", e);
            eprintln!("hint: capture usually needs elevated privileges");
        }
    }
}

/// Settings after merging defaults, the config file, and CLI flags (CLI
/// wins).
struct RuntimeConfig {
    capture: CaptureConfig,
    database: PathBuf,
    log_file: PathBuf,
    log_level: Level,
    log_max_size: u64,
    log_max_backups: usize,
    stats_interval: Duration,
    duration: Option<Duration>,
    export_json: Option<PathBuf>,
}

fn load_config(args: &Cli) -> Result<RuntimeConfig, Box<dyn Error>> {
    let file = match &args.config {
        Some(path) => ConfigStore::load(path)?,
        None => ConfigStore::new(),
    };

    let mut capture = CaptureConfig::default();
    capture.interface = args
        .interface
        .clone()
        .or_else(|| file.get_str("capture", "interface").map(String::from));
    capture.filter = args
        .filter
        .clone()
        .or_else(|| file.get_str("capture", "filter").map(String::from));
    if let Some(promisc) = file.get_bool("capture", "promiscuous") {
        capture.promiscuous = promisc;
    }
    if let Some(snaplen) = file.get_int("capture", "snaplen") {
        capture.snaplen = snaplen as i32;
    }
    if let Some(timeout) = file.get_int("capture", "timeout_ms") {
        capture.timeout_ms = timeout as i32;
    }

    let database = args
        .database
        .clone()
        .or_else(|| file.get_str("storage", "database").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("netwatch.db"));

    let log_file = args
        .log_file
        .clone()
        .or_else(|| file.get_str("logging", "file").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("netwatch.log"));
    let log_level = args
        .log_level
        .as_deref()
        .or_else(|| file.get_str("logging", "level"))
        .map(|s| s.parse::<Level>())
        .transpose()?
        .unwrap_or(Level::Info);
    let log_max_size = file
        .get_int("logging", "max_size")
        .map(|n| n as u64)
        .unwrap_or(DEFAULT_MAX_SIZE);
    let log_max_backups = file
        .get_int("logging", "max_backups")
        .map(|n| n as usize)
        .unwrap_or(DEFAULT_MAX_BACKUPS);

    let stats_interval = Duration::from_secs(args.stats_interval.max(1));
    let duration = match args.duration {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    };

    Ok(RuntimeConfig {
        capture,
        database,
        log_file,
        log_level,
        log_max_size,
        log_max_backups,
        stats_interval,
        duration,
        export_json: args.export_json.clone(),
    })
}

fn run(args: Cli) -> Result<(), Box<dyn Error>> {
    let config = load_config(&args)?;

    let logger = Arc::new(Logger::with_rotation(
        &config.log_file,
        config.log_level,
        config.log_max_size,
        config.log_max_backups,
    )?);
    logger.info("netwatch starting");

    if config.capture.interface.is_none() {
        return Err("no capture interface specified (use --interface, or [capture] \
                    interface in the config file)"
            .into());
    }

    let monitor = Monitor::new(
        MonitorConfig {
            capture: config.capture.clone(),
            database: config.database.clone(),
        },
        logger.clone(),
    )?;

    let running = Arc::new(AtomicBool::new(true));
    let running_handler = running.clone();
    ctrlc::set_handler(move || {
        running_handler.store(false, Ordering::SeqCst);
        eprintln!("\ninterrupt received, stopping capture...");
    })
    .expect("failed to set Ctrl-C handler");

    monitor.start()?;

    println!("netwatch v{}", env!("CARGO_PKG_VERSION"));
    println!(
        "Capturing on {} (filter: {})",
        config.capture.interface.as_deref().unwrap_or("(default)"),
        config.capture.filter.as_deref().unwrap_or("none"),
    );
    println!("Storing packets in {}", config.database.display());
    match config.duration {
        Some(d) => println!("Running for {} seconds...", d.as_secs()),
        None => println!("Running until Ctrl-C..."),
    }
    println!();

    let started = Instant::now();
    let mut last_print = Instant::now();
    while running.load(Ordering::SeqCst) {
        if let Some(limit) = config.duration {
            if started.elapsed() >= limit {
                break;
            }
        }
        std::thread::sleep(Duration::from_millis(100));
        if last_print.elapsed() >= config.stats_interval {
            display::print_stats_line(&monitor.snapshot());
            last_print = Instant::now();
        }
    }

    logger.info("netwatch shutting down");
    monitor.stop();

    let snapshot = monitor.snapshot();
    display::print_summary(&snapshot);

    if let Some(path) = &config.export_json {
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(file, &snapshot)?;
        println!("  Snapshot export (JSON): {}", path.display());
    }

    monitor.shutdown();
    Ok(())
}
