//! Statistics display and formatting

use nettest::PortStats;
use std::io::Write;
use std::time::Duration;

/// Format bytes in human-readable form
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Format bandwidth in human-readable form
pub fn format_bandwidth(bps: u64) -> String {
    const KBPS: u64 = 1000;
    const MBPS: u64 = KBPS * 1000;
    const GBPS: u64 = MBPS * 1000;

    if bps >= GBPS {
        format!("{:.2} Gbps", bps as f64 / GBPS as f64)
    } else if bps >= MBPS {
        format!("{:.2} Mbps", bps as f64 / MBPS as f64)
    } else if bps >= KBPS {
        format!("{:.2} Kbps", bps as f64 / KBPS as f64)
    } else {
        format!("{} bps", bps)
    }
}

/// Format a delay or jitter in microseconds
pub fn format_delay_us(us: u32) -> String {
    if us >= 1_000_000 {
        format!("{:.2}s", us as f64 / 1_000_000.0)
    } else if us >= 1_000 {
        format!("{:.2}ms", us as f64 / 1_000.0)
    } else {
        format!("{}µs", us)
    }
}

/// Format duration in human-readable form
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {:02}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Display full port statistics
pub fn display_port_stats(name: &str, stats: &PortStats) {
    println!("\n┌─────────────────────────────────────────────────────────────┐");
    println!("│ PORT {:<55}│", name);
    println!("├─────────────────────────────────────────────────────────────┤");
    println!(
        "│ TX: {:>10} pkts  {:>12}  {:>10} pps  {:>12}",
        stats.tx_pkts,
        format_bytes(stats.tx_bytes),
        stats.tx_pps,
        format_bandwidth(stats.tx_bps)
    );
    println!(
        "│ RX: {:>10} pkts  {:>12}  {:>10} pps  {:>12}",
        stats.rx_pkts,
        format_bytes(stats.rx_bytes),
        stats.rx_pps,
        format_bandwidth(stats.rx_bps)
    );
    println!(
        "│ RX errors: drop {} / error {} / fifo {} / frame {}",
        stats.rx_drops, stats.rx_errors, stats.rx_fifo_errors, stats.rx_frame_errors
    );
    println!("├─────────────────────────────────────────────────────────────┤");
    println!("│ TEST FLOW                                                   │");
    println!("├──────────┬──────────┬──────────┬──────────┬──────────┬──────┤");
    println!("│          │ Avg      │ MMO      │ Min      │ Max      │      │");
    println!("├──────────┼──────────┼──────────┼──────────┼──────────┼──────┤");
    println!(
        "│ Delay    │ {:8} │ {:8} │ {:8} │ {:8} │      │",
        format_delay_us(stats.nt_avg_delay_us),
        format_delay_us(stats.nt_mmo_delay_us),
        format_delay_us(stats.nt_min_delay_us),
        format_delay_us(stats.nt_max_delay_us)
    );
    println!(
        "│ Jitter   │ {:8} │ {:8} │ {:8} │ {:8} │      │",
        format_delay_us(stats.nt_avg_jitter_us),
        format_delay_us(stats.nt_mmo_jitter_us),
        format_delay_us(stats.nt_min_jitter_us),
        format_delay_us(stats.nt_max_jitter_us)
    );
    println!("└──────────┴──────────┴──────────┴──────────┴──────────┴──────┘");
    println!(
        "  Received {} ({}) | lost {} ({:.3}%, mmo {:.3}%) | out of window {} ({:.3}%)",
        stats.nt_pkts,
        format_bytes(stats.nt_bytes),
        stats.nt_loss_count,
        stats.nt_loss_percent,
        stats.nt_mmo_loss_percent,
        stats.nt_out_of_wnd_count,
        stats.nt_out_of_wnd_percent
    );
    println!(
        "  Duplicates {} | reordered {} | clock anomalies {}",
        stats.nt_duplicates, stats.nt_reordered, stats.nt_clock_anomalies
    );
}

/// One-line summary for continuous updates
pub fn compact_line(stats: &PortStats, elapsed: Duration) -> String {
    format!(
        "[{:8}] TX {} ({}) | RX {} ({}) | loss {:.3}% | delay {}",
        format_duration(elapsed),
        stats.tx_pkts,
        format_bandwidth(stats.tx_bps),
        stats.rx_pkts,
        format_bandwidth(stats.rx_bps),
        stats.nt_loss_percent,
        format_delay_us(stats.nt_avg_delay_us)
    )
}

/// Display compact stats on one line, overwriting the previous one
pub fn display_compact_stats(stats: &PortStats, elapsed: Duration) {
    print!("\r{}         ", compact_line(stats, elapsed));
    let _ = std::io::stdout().flush();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(500), "500 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(2 * 1024 * 1024), "2.00 MB");
    }

    #[test]
    fn test_format_bandwidth() {
        assert_eq!(format_bandwidth(500), "500 bps");
        assert_eq!(format_bandwidth(10_000), "10.00 Kbps");
        assert_eq!(format_bandwidth(10_000_000), "10.00 Mbps");
    }

    #[test]
    fn test_format_delay() {
        assert_eq!(format_delay_us(500), "500µs");
        assert_eq!(format_delay_us(50_000), "50.00ms");
        assert_eq!(format_delay_us(2_000_000), "2.00s");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
        assert_eq!(format_duration(Duration::from_secs(3661)), "1h 01m 01s");
    }

    #[test]
    fn test_compact_line() {
        let stats = PortStats {
            tx_pkts: 10,
            rx_pkts: 9,
            nt_loss_percent: 10.0,
            ..Default::default()
        };
        let line = compact_line(&stats, Duration::from_secs(5));
        assert!(line.contains("TX 10"));
        assert!(line.contains("RX 9"));
        assert!(line.contains("10.000%"));
    }
}
