//! Human-readable throughput summaries.

use super::ThroughputResult;

/// One line per direction, e.g. `RX 100 MB in 812 ms @ 123.2 MB/s (985.6 Mbps)`.
pub fn format_summary(result: &ThroughputResult) -> String {
    let mbytes_per_sec = result.bytes_per_second() / 1e6;
    let mbits_per_sec = result.bits_per_second() / 1e6;

    let line_rate = if mbits_per_sec >= 1000.0 {
        format!("{:.2} Gbps", mbits_per_sec / 1000.0)
    } else {
        format!("{:.1} Mbps", mbits_per_sec)
    };

    format!(
        "{} {:.0} MB in {} ms @ {:.1} MB/s ({})",
        result.direction,
        result.bytes_transferred as f64 / 1e6,
        result.duration.as_millis(),
        mbytes_per_sec,
        line_rate,
    )
}
