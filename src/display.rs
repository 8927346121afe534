//! Console rendering for the statistics poll.
//!
//! This is the textual display surface: it only ever reads owned snapshots
//! from the statistics interface, never raw frames.

use crate::stats::StatsSnapshot;

/// Humanize a byte count (binary units).
pub fn format_bytes(n: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = n as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", n, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Humanize a bit rate.
pub fn format_bitrate(bits: f64) -> String {
    const UNITS: [&str; 4] = ["bps", "Kbps", "Mbps", "Gbps"];
    let mut value = bits;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

/// One-line rolling status for the periodic poll.
pub fn print_stats_line(snapshot: &StatsSnapshot) {
    let top = snapshot
        .top_protocols
        .first()
        .map(|(proto, n)| format!("{} ({})", proto, n))
        .unwrap_or_else(|| "-".into());
    println!(
        "[stats] {} pkts | {} | {} avg | {} errors | {} hosts | {} flows | top: {}",
        snapshot.total_packets,
        format_bytes(snapshot.total_bytes),
        format_bitrate(snapshot.average_bandwidth_bits),
        snapshot.total_errors,
        snapshot.hosts_seen,
        snapshot.active_connections,
        top,
    );
}

/// Closing summary printed after capture stops.
pub fn print_summary(snapshot: &StatsSnapshot) {
    println!();
    println!("{}", "=".repeat(60));
    println!("Capture complete.");
    println!("  Packets:   {}", snapshot.total_packets);
    println!("  Bytes:     {}", format_bytes(snapshot.total_bytes));
    println!("  Errors:    {}", snapshot.total_errors);
    println!("  Hosts:     {}", snapshot.hosts_seen);
    println!(
        "  Bandwidth: {} average",
        format_bitrate(snapshot.average_bandwidth_bits)
    );

    if !snapshot.top_protocols.is_empty() {
        println!("  Top protocols:");
        for (rank, (proto, count)) in snapshot.top_protocols.iter().take(5).enumerate() {
            println!("    {}. {:<8} {} packets", rank + 1, proto.to_string(), count);
        }
    }
    if !snapshot.top_hosts.is_empty() {
        println!("  Top hosts:");
        for (rank, (host, count)) in snapshot.top_hosts.iter().take(5).enumerate() {
            println!("    {}. {:<40} {} packets", rank + 1, host, count);
        }
    }
    println!("{}", "=".repeat(60));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_units_scale() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MiB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.0 GiB");
    }

    #[test]
    fn bitrate_units_scale() {
        assert_eq!(format_bitrate(800.0), "800.0 bps");
        assert_eq!(format_bitrate(800_000.0), "800.0 Kbps");
        assert_eq!(format_bitrate(2_500_000.0), "2.5 Mbps");
    }
}
