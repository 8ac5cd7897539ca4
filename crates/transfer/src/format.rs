//! Human-readable rendering of sizes, speeds and durations.

const KIB: f64 = 1024.0;
const MIB: f64 = KIB * 1024.0;

/// Formats a transfer rate: `512 B/s`, `1.5 KB/s`, `3.2 MB/s`.
pub fn format_speed(bytes_per_second: f64) -> String {
    if bytes_per_second < KIB {
        format!("{bytes_per_second:.0} B/s")
    } else if bytes_per_second < MIB {
        format!("{:.1} KB/s", bytes_per_second / KIB)
    } else {
        format!("{:.1} MB/s", bytes_per_second / MIB)
    }
}

/// Formats a remaining time in whole seconds, minutes or hours.
pub fn format_eta(seconds: f64) -> String {
    if seconds < 60.0 {
        format!("{}s", seconds.round() as u64)
    } else if seconds < 3600.0 {
        format!("{}m", (seconds / 60.0).round() as u64)
    } else {
        format!("{}h", (seconds / 3600.0).round() as u64)
    }
}

/// Formats a byte count with one decimal: `0 B`, `1.5 KB`, `2.0 GB`.
pub fn format_file_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if bytes == 0 {
        return "0 B".into();
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= KIB && unit < UNITS.len() - 1 {
        value /= KIB;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}
