//! Statistics tracking for spot ingestion.
//!
//! Counts what happened to every line and datagram on its way to the spot
//! store, with breakdowns by band, mode and spotter and a histogram of how
//! old spots are when they arrive.

use chrono::{DateTime, Utc};
use hdrhistogram::Histogram;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::spot::Spot;
use crate::watchlist::Disposition;

/// Longest spot age tracked, two days in seconds.
const MAX_AGE_SECS: u64 = 172_800;

const TOP_SPOTTERS: usize = 10;

/// Thread-safe statistics collector, shared with the metrics server.
#[derive(Debug)]
pub struct IngestStats {
    /// Cluster lines received
    pub lines_received: AtomicU64,

    /// Total bytes of raw input processed
    pub bytes_processed: AtomicU64,

    /// Spots accepted into the store
    pub total_spots: AtomicU64,

    /// Accepted spots a watch list highlighted
    pub highlighted_spots: AtomicU64,

    /// Spots a watch list hid
    pub suppressed_spots: AtomicU64,

    /// Spots dropped as repeats of a stored spot
    pub duplicate_spots: AtomicU64,

    /// Spots dropped because a call could not be located
    pub unlocated_spots: AtomicU64,

    /// Spot-looking lines that failed to parse
    pub parse_failures: AtomicU64,

    /// Lines that were not spots (filtered early)
    pub non_spot_lines: AtomicU64,

    /// WSJT-X datagrams received
    pub datagrams_received: AtomicU64,

    /// WSJT-X datagrams that did not decode to a usable Status
    pub datagrams_rejected: AtomicU64,

    /// Sessions that ended in a failure
    pub connection_failures: AtomicU64,

    /// Seconds between `spotted_at` and arrival
    age_histogram: RwLock<Histogram<u64>>,

    breakdown: RwLock<Breakdown>,

    start_time: Instant,
}

/// Accepted spots counted per band, mode and hearing station.
#[derive(Debug, Default)]
struct Breakdown {
    band: HashMap<String, u64>,
    mode: HashMap<String, u64>,
    spotter: HashMap<String, u64>,
}

impl Breakdown {
    fn count(&mut self, spot: &Spot) {
        if let Some(band) = spot.band() {
            *self.band.entry(band.name()).or_default() += 1;
        }
        let mode = match spot.mode.as_str() {
            "" => "unknown",
            mode => mode,
        };
        *self.mode.entry(mode.to_string()).or_default() += 1;
        *self.spotter.entry(spot.rx_call.clone()).or_default() += 1;
    }

    /// Busiest spotters first, ties by call.
    fn top_spotters(&self, n: usize) -> Vec<(String, u64)> {
        let mut ranked: Vec<(String, u64)> = self
            .spotter
            .iter()
            .map(|(call, count)| (call.clone(), *count))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(n);
        ranked
    }
}

impl IngestStats {
    pub fn new() -> Self {
        Self {
            lines_received: AtomicU64::new(0),
            bytes_processed: AtomicU64::new(0),
            total_spots: AtomicU64::new(0),
            highlighted_spots: AtomicU64::new(0),
            suppressed_spots: AtomicU64::new(0),
            duplicate_spots: AtomicU64::new(0),
            unlocated_spots: AtomicU64::new(0),
            parse_failures: AtomicU64::new(0),
            non_spot_lines: AtomicU64::new(0),
            datagrams_received: AtomicU64::new(0),
            datagrams_rejected: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            // 1 s to two days, 2 significant figures; bounds are constant and valid
            age_histogram: RwLock::new(
                Histogram::new_with_bounds(1, MAX_AGE_SECS, 2)
                    .expect("Failed to create age histogram"),
            ),
            breakdown: RwLock::new(Breakdown::default()),
            start_time: Instant::now(),
        }
    }

    /// Record a spot accepted into the store.
    pub fn record_spot(&self, spot: &Spot, disposition: Disposition, now: DateTime<Utc>) {
        self.total_spots.fetch_add(1, Ordering::Relaxed);

        if disposition == Disposition::Highlight {
            self.highlighted_spots.fetch_add(1, Ordering::Relaxed);
        }

        let age = (now - spot.spotted_at).num_seconds().max(1) as u64;
        if let Ok(mut hist) = self.age_histogram.write() {
            let _ = hist.record(age.min(MAX_AGE_SECS));
        }

        if let Ok(mut breakdown) = self.breakdown.write() {
            breakdown.count(spot);
        }
    }

    /// Record one received line.
    pub fn record_line(&self, bytes: usize) {
        self.lines_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_processed.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record one received datagram.
    pub fn record_datagram(&self, bytes: usize) {
        self.datagrams_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_processed.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_datagram_rejected(&self) {
        self.datagrams_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_parse_failure(&self) {
        self.parse_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_non_spot(&self) {
        self.non_spot_lines.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unlocated(&self) {
        self.unlocated_spots.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicate_spots.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_suppressed(&self) {
        self.suppressed_spots.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_failure(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Get the elapsed time since stats collection started.
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Accepted spots per minute since start.
    pub fn spots_per_minute(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.total_spots.load(Ordering::Relaxed) as f64 * 60.0 / elapsed
        } else {
            0.0
        }
    }

    /// Generate a summary report.
    pub fn summary(&self) -> StatsSummary {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        let age_percentiles = self
            .age_histogram
            .read()
            .ok()
            .filter(|h| !h.is_empty())
            .map(|h| HistogramPercentiles {
                p50: h.value_at_quantile(0.50),
                p90: h.value_at_quantile(0.90),
                p99: h.value_at_quantile(0.99),
                min: h.min(),
                max: h.max(),
                mean: h.mean(),
            });

        let (spots_by_band, spots_by_mode, top_spotters) = match self.breakdown.read() {
            Ok(b) => (b.band.clone(), b.mode.clone(), b.top_spotters(TOP_SPOTTERS)),
            Err(_) => Default::default(),
        };

        StatsSummary {
            elapsed_secs: self.elapsed().as_secs_f64(),
            lines_received: load(&self.lines_received),
            bytes_processed: load(&self.bytes_processed),
            total_spots: load(&self.total_spots),
            highlighted_spots: load(&self.highlighted_spots),
            suppressed_spots: load(&self.suppressed_spots),
            duplicate_spots: load(&self.duplicate_spots),
            unlocated_spots: load(&self.unlocated_spots),
            parse_failures: load(&self.parse_failures),
            non_spot_lines: load(&self.non_spot_lines),
            datagrams_received: load(&self.datagrams_received),
            datagrams_rejected: load(&self.datagrams_rejected),
            connection_failures: load(&self.connection_failures),
            spots_per_minute: self.spots_per_minute(),
            age_percentiles,
            spots_by_band,
            spots_by_mode,
            top_spotters,
        }
    }
}

impl Default for IngestStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Percentile values from a histogram.
#[derive(Debug, Clone, Serialize)]
pub struct HistogramPercentiles {
    pub p50: u64,
    pub p90: u64,
    pub p99: u64,
    pub min: u64,
    pub max: u64,
    pub mean: f64,
}

/// Summary of collected statistics.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSummary {
    pub elapsed_secs: f64,
    pub lines_received: u64,
    pub bytes_processed: u64,
    pub total_spots: u64,
    pub highlighted_spots: u64,
    pub suppressed_spots: u64,
    pub duplicate_spots: u64,
    pub unlocated_spots: u64,
    pub parse_failures: u64,
    pub non_spot_lines: u64,
    pub datagrams_received: u64,
    pub datagrams_rejected: u64,
    pub connection_failures: u64,
    pub spots_per_minute: f64,
    pub age_percentiles: Option<HistogramPercentiles>,
    pub spots_by_band: HashMap<String, u64>,
    pub spots_by_mode: HashMap<String, u64>,
    pub top_spotters: Vec<(String, u64)>,
}

impl std::fmt::Display for StatsSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "═══════════════════════════════════════════════════════")?;
        writeln!(f, "                 DX SPOT STATISTICS")?;
        writeln!(f, "═══════════════════════════════════════════════════════")?;
        writeln!(f)?;
        writeln!(f, "Uptime: {:.1}s", self.elapsed_secs)?;
        writeln!(f, "Spots stored: {}", self.total_spots)?;
        writeln!(f, "  Highlighted: {}", self.highlighted_spots)?;
        writeln!(f, "Suppressed by watch list: {}", self.suppressed_spots)?;
        writeln!(f, "Duplicates: {}", self.duplicate_spots)?;
        writeln!(f, "Unlocated: {}", self.unlocated_spots)?;
        writeln!(f, "Lines received: {}", self.lines_received)?;
        writeln!(f, "Parse failures: {}", self.parse_failures)?;
        writeln!(f, "Non-spot lines: {}", self.non_spot_lines)?;
        if self.datagrams_received > 0 {
            writeln!(
                f,
                "Datagrams: {} ({} rejected)",
                self.datagrams_received, self.datagrams_rejected
            )?;
        }
        writeln!(f, "Bytes processed: {} KB", self.bytes_processed / 1024)?;
        writeln!(f, "Connection failures: {}", self.connection_failures)?;
        writeln!(f, "Rate: {:.1} spots/min", self.spots_per_minute)?;
        writeln!(f)?;

        if let Some(age) = &self.age_percentiles {
            writeln!(
                f,
                "Spot age at arrival: median {}s, p90 {}s, p99 {}s (min {}s, max {}s, mean {:.1}s)",
                age.p50, age.p90, age.p99, age.min, age.max, age.mean
            )?;
            writeln!(f)?;
        }

        write_counts(f, "Spots by Band", &self.spots_by_band)?;
        write_counts(f, "Spots by Mode", &self.spots_by_mode)?;

        if !self.top_spotters.is_empty() {
            writeln!(f, "Busiest Spotters:")?;
            for (rank, (call, count)) in (1..).zip(&self.top_spotters) {
                writeln!(f, "  {rank:>2}. {call:<12} {count}")?;
            }
        }

        Ok(())
    }
}

/// One titled block, largest count first.
fn write_counts(
    f: &mut std::fmt::Formatter<'_>,
    title: &str,
    counts: &HashMap<String, u64>,
) -> std::fmt::Result {
    if counts.is_empty() {
        return Ok(());
    }
    let mut rows: Vec<_> = counts.iter().collect();
    rows.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
    writeln!(f, "{title}:")?;
    for (name, count) in rows {
        writeln!(f, "  {name:<8} {count}")?;
    }
    writeln!(f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn make_test_spot(mode: &str) -> Spot {
        let at = Utc.with_ymd_and_hms(2026, 10, 17, 12, 0, 0).unwrap();
        let mut spot = Spot::new("W1AW", "K1TTT-#", 14025.0, at);
        spot.mode = mode.to_string();
        spot
    }

    fn arrival() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 17, 12, 0, 30).unwrap()
    }

    #[test]
    fn test_record_spot() {
        let stats = IngestStats::new();
        stats.record_spot(&make_test_spot("CW"), Disposition::Highlight, arrival());

        assert_eq!(stats.total_spots.load(Ordering::Relaxed), 1);
        assert_eq!(stats.highlighted_spots.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_summary_generation() {
        let stats = IngestStats::new();

        for _ in 0..10 {
            stats.record_spot(&make_test_spot("FT8"), Disposition::Show, arrival());
        }
        stats.record_spot(&make_test_spot(""), Disposition::Show, arrival());
        stats.record_parse_failure();
        stats.record_non_spot();
        stats.record_duplicate();
        stats.record_line(1000);

        let summary = stats.summary();

        assert_eq!(summary.total_spots, 11);
        assert_eq!(summary.highlighted_spots, 0);
        assert_eq!(summary.parse_failures, 1);
        assert_eq!(summary.non_spot_lines, 1);
        assert_eq!(summary.duplicate_spots, 1);
        assert_eq!(summary.bytes_processed, 1000);
        assert_eq!(summary.spots_by_band.get("20m"), Some(&11));
        assert_eq!(summary.spots_by_mode.get("FT8"), Some(&10));
        assert_eq!(summary.spots_by_mode.get("unknown"), Some(&1));
        assert_eq!(summary.top_spotters, vec![("K1TTT-#".to_string(), 11)]);

        let age = summary.age_percentiles.as_ref().unwrap();
        assert_eq!(age.min, 30);
        assert!(summary.to_string().contains("Spots stored: 11"));
    }

    #[test]
    fn test_empty_summary_has_no_age() {
        assert!(IngestStats::new().summary().age_percentiles.is_none());
    }
}
