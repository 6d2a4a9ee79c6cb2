//! Prometheus metrics HTTP server.
//!
//! Exposes ingestion statistics in Prometheus text format via HTTP endpoint.

use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use tokio::net::TcpListener;
use tracing::info;

use crate::stats::IngestStats;

/// Start the Prometheus metrics HTTP server.
///
/// Runs until the listener fails and serves metrics at `/metrics`.
/// Returns an error if the server fails to bind to the port.
pub async fn start_metrics_server(
    port: u16,
    stats: Arc<IngestStats>,
) -> Result<(), std::io::Error> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(stats);

    let listener = TcpListener::bind(addr).await?;
    info!("Prometheus metrics server listening on http://{}/metrics", addr);

    axum::serve(listener, app)
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))
}

/// Health check endpoint.
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Prometheus metrics endpoint.
async fn metrics_handler(State(stats): State<Arc<IngestStats>>) -> impl IntoResponse {
    let output = format_prometheus_metrics(&stats);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        output,
    )
}

fn counter(output: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} counter");
    let _ = writeln!(output, "{name} {value}");
}

/// Format statistics as Prometheus text format.
fn format_prometheus_metrics(stats: &IngestStats) -> String {
    let summary = stats.summary();
    let mut output = String::with_capacity(4096);

    output.push_str("# HELP dxwatch_uptime_seconds Time since ingestion started\n");
    output.push_str("# TYPE dxwatch_uptime_seconds gauge\n");
    let _ = writeln!(output, "dxwatch_uptime_seconds {:.3}", summary.elapsed_secs);

    // Stored spots by mode
    output.push_str("# HELP dxwatch_spots_total Spots accepted into the store\n");
    output.push_str("# TYPE dxwatch_spots_total counter\n");
    for (mode, count) in &summary.spots_by_mode {
        let _ = writeln!(output, "dxwatch_spots_total{{mode=\"{mode}\"}} {count}");
    }
    if summary.spots_by_mode.is_empty() {
        let _ = writeln!(output, "dxwatch_spots_total {}", summary.total_spots);
    }

    counter(
        &mut output,
        "dxwatch_highlighted_spots_total",
        "Stored spots highlighted by the watch list",
        summary.highlighted_spots,
    );
    counter(
        &mut output,
        "dxwatch_suppressed_spots_total",
        "Spots hidden by the watch list",
        summary.suppressed_spots,
    );
    counter(
        &mut output,
        "dxwatch_duplicate_spots_total",
        "Spots dropped as duplicates",
        summary.duplicate_spots,
    );
    counter(
        &mut output,
        "dxwatch_unlocated_spots_total",
        "Spots dropped because a call could not be located",
        summary.unlocated_spots,
    );
    counter(
        &mut output,
        "dxwatch_lines_total",
        "Cluster lines received",
        summary.lines_received,
    );
    counter(
        &mut output,
        "dxwatch_parse_failures_total",
        "Number of lines that failed to parse",
        summary.parse_failures,
    );
    counter(
        &mut output,
        "dxwatch_non_spot_lines_total",
        "Number of non-spot lines received",
        summary.non_spot_lines,
    );
    counter(
        &mut output,
        "dxwatch_datagrams_total",
        "WSJT-X datagrams received",
        summary.datagrams_received,
    );
    counter(
        &mut output,
        "dxwatch_datagrams_rejected_total",
        "WSJT-X datagrams without a usable status",
        summary.datagrams_rejected,
    );
    counter(
        &mut output,
        "dxwatch_bytes_processed_total",
        "Total bytes of raw input processed",
        summary.bytes_processed,
    );
    counter(
        &mut output,
        "dxwatch_connection_failures_total",
        "Sessions that ended in a failure",
        summary.connection_failures,
    );

    // Spots by band
    output.push_str("# HELP dxwatch_spots_by_band_total Spots broken down by amateur band\n");
    output.push_str("# TYPE dxwatch_spots_by_band_total counter\n");
    for (band, count) in &summary.spots_by_band {
        let _ = writeln!(output, "dxwatch_spots_by_band_total{{band=\"{band}\"}} {count}");
    }

    if let Some(ref age) = summary.age_percentiles {
        output.push_str("# HELP dxwatch_spot_age_seconds Spot age when it arrived\n");
        output.push_str("# TYPE dxwatch_spot_age_seconds summary\n");
        let _ = writeln!(output, "dxwatch_spot_age_seconds{{quantile=\"0.5\"}} {}", age.p50);
        let _ = writeln!(output, "dxwatch_spot_age_seconds{{quantile=\"0.9\"}} {}", age.p90);
        let _ = writeln!(output, "dxwatch_spot_age_seconds{{quantile=\"0.99\"}} {}", age.p99);
        let _ = writeln!(output, "dxwatch_spot_age_seconds_count {}", summary.total_spots);
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spot::Spot;
    use crate::watchlist::Disposition;
    use chrono::Utc;

    #[test]
    fn test_format_prometheus_metrics_empty() {
        let stats = IngestStats::new();
        let output = format_prometheus_metrics(&stats);

        assert!(output.contains("dxwatch_uptime_seconds"));
        assert!(output.contains("dxwatch_spots_total 0"));
        assert!(output.contains("dxwatch_parse_failures_total 0"));
        assert!(output.contains("dxwatch_non_spot_lines_total 0"));
        assert!(output.contains("dxwatch_bytes_processed_total 0"));
        assert!(!output.contains("dxwatch_spot_age_seconds"));
    }

    #[test]
    fn test_format_prometheus_metrics_with_data() {
        let stats = IngestStats::new();

        let mut spot = Spot::new("W1AW", "K1TTT", 14025.0, Utc::now());
        spot.mode = "CW".to_string();
        stats.record_spot(&spot, Disposition::Show, Utc::now());
        stats.record_line(100);
        stats.record_suppressed();

        let output = format_prometheus_metrics(&stats);

        assert!(output.contains("dxwatch_spots_total{mode=\"CW\"} 1"));
        assert!(output.contains("dxwatch_bytes_processed_total 100"));
        assert!(output.contains("dxwatch_suppressed_spots_total 1"));
        assert!(output.contains("dxwatch_spots_by_band_total{band=\"20m\"} 1"));
        assert!(output.contains("dxwatch_spot_age_seconds_count 1"));
    }

    #[test]
    fn test_prometheus_format_validity() {
        let stats = IngestStats::new();
        let output = format_prometheus_metrics(&stats);

        // Check that each non-comment, non-empty line has proper format
        for line in output.lines() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let parts: Vec<&str> = line.split_whitespace().collect();
            assert!(parts.len() >= 2, "Invalid metric line: {}", line);
        }
    }
}
