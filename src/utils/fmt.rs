//! Human-readable formatting helpers for sizes, speeds and time intervals.

/// A special value indicating that an interval of time is unknown.
pub const UNKNOWN_INTERVAL: u64 = u64::MAX;

/// Converts a size in bytes to a human-readable format.
pub fn format_size(bytes: u64) -> String {
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

/// Converts a transfer speed in bytes per second to a human-readable format.
pub fn format_speed(speed: f64) -> String {
    if !speed.is_finite() {
        return "-".to_string();
    }
    format!("{}/s", format_size(speed as u64))
}

/// Converts a time interval in milliseconds to a human-readable format.
pub fn format_interval(ms: u64) -> String {
    if ms == UNKNOWN_INTERVAL {
        return "unknown".to_string();
    }

    let secs = ms / 1000;
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}
