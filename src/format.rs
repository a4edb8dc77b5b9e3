// src/format.rs

const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];

/// Render a byte count with base-1024 units and one decimal place.
pub fn humanize(bytes: u64) -> String {
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    // Unit choice uses integer thresholds, so 1_048_575 stays in KB.
    let mut threshold = 1024u64 * 1024;
    while bytes >= threshold && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
        threshold = threshold.saturating_mul(1024);
    }
    format!("{:.1} {}", value, UNITS[unit])
}
