//! Run statistics display

use crate::state::{FilterAnalysis, RegistryStats};

/// Renders a byte count with a binary unit
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64;
    let mut unit = "B";
    for next in UNITS {
        if value < 1024.0 {
            break;
        }
        value /= 1024.0;
        unit = next;
    }
    format!("{:.1} {}", value, unit)
}

/// Share of finished URLs that were mirrored, in percent
pub fn success_rate(stats: &RegistryStats) -> f64 {
    let finished = stats.downloaded + stats.skipped;
    if finished > 0 {
        (stats.downloaded as f64 / finished as f64) * 100.0
    } else {
        0.0
    }
}

/// Prints registry statistics to stdout
pub fn print_statistics(stats: &RegistryStats) {
    println!("=== Mirror Statistics ===\n");

    println!("Filter:");
    println!("  Allowed URLs: {}", stats.allowed);
    println!("  Denied URLs: {}", stats.denied);
    println!();

    println!("Resources:");
    println!("  Downloaded: {}", stats.downloaded);
    println!("  Skipped: {}", stats.skipped);
    if stats.queued > 0 {
        println!("  Still queued: {}", stats.queued);
    }
    println!();

    println!("Transfer:");
    println!("  Bytes received: {}", format_bytes(stats.bytes_total));
    println!(
        "  Average throughput: {:.2} KiB/s",
        // bytes per ms is numerically KB/s
        stats.average_throughput * 1000.0 / 1024.0
    );
    println!();

    println!(
        "Success Rate: {:.1}% ({} / {} resources mirrored)",
        success_rate(stats),
        stats.downloaded,
        stats.downloaded + stats.skipped
    );
}

/// Prints the most frequently referenced URLs per filter decision
///
/// # Arguments
///
/// * `analysis` - Result of [`crate::UrlRegistry::filter_analysis`]
/// * `limit` - Maximum number of URLs listed per decision
pub fn print_filter_analysis(analysis: &FilterAnalysis, limit: usize) {
    println!("=== Filter Analysis ===\n");

    for (title, urls) in [("Allowed", &analysis.allowed), ("Denied", &analysis.denied)] {
        println!("{} ({}):", title, urls.len());
        for (url, asked) in urls.iter().take(limit) {
            println!("  {:>6}  {}", asked, url);
        }
        if urls.len() > limit {
            println!("  ... and {} more", urls.len() - limit);
        }
        println!();
    }
}
