//! Bounded, ordered spot history with de-duplication.
//!
//! The store is owned by the ingestion facade; readers get clones or shared
//! borrows. Each accepted spot gets a sequence number so a display can ask
//! only for what it has not drawn yet.

use chrono::Duration;
use std::collections::VecDeque;

use serde::Serialize;
use tracing::{debug, trace};

use crate::config::StorageConfig;
use crate::spot::Spot;
use crate::watchlist::Disposition;

/// Frequencies closer than this are the same signal.
const DUPLICATE_KHZ: f64 = 1.0;

/// A spot with its sequence number and watch-list disposition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredSpot {
    /// Monotonically increasing, starting at 1.
    pub seq: u64,
    pub spot: Spot,
    pub disposition: Disposition,
}

/// Result of offering a spot to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Added { seq: u64 },
    Duplicate,
    /// Missing a call on either side.
    Rejected,
}

/// The spot history.
#[derive(Debug)]
pub struct SpotStore {
    max_spots: usize,
    dedup_window: Duration,
    spots: VecDeque<StoredSpot>,
    next_seq: u64,
    evicted: u64,
    scroll: usize,
}

impl SpotStore {
    pub fn new(max_spots: usize, dedup_window: Duration) -> Self {
        let max_spots = max_spots.max(1);
        Self {
            max_spots,
            dedup_window,
            spots: VecDeque::with_capacity(max_spots),
            next_seq: 1,
            evicted: 0,
            scroll: 0,
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(
            config.max_spots,
            Duration::seconds(config.dedup_window_secs as i64),
        )
    }

    pub fn len(&self) -> usize {
        self.spots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_spots
    }

    /// Spots dropped to make room since creation.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Sequence number of the newest spot, 0 when empty.
    pub fn latest_seq(&self) -> u64 {
        self.spots.back().map(|s| s.seq).unwrap_or(0)
    }

    pub fn latest(&self) -> Option<&StoredSpot> {
        self.spots.back()
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &StoredSpot> {
        self.spots.iter()
    }

    /// Spots with a sequence number greater than `seq`, oldest first.
    pub fn since(&self, seq: u64) -> Vec<StoredSpot> {
        self.spots.iter().filter(|s| s.seq > seq).cloned().collect()
    }

    /// Whether `spot` repeats one already stored.
    ///
    /// Same heard and hearing call, within 1 kHz and within the dedup window.
    pub fn is_duplicate(&self, spot: &Spot) -> bool {
        self.spots.iter().rev().any(|s| {
            s.spot.tx_call == spot.tx_call
                && s.spot.rx_call == spot.rx_call
                && (s.spot.frequency_khz - spot.frequency_khz).abs() < DUPLICATE_KHZ
                && (s.spot.spotted_at - spot.spotted_at).abs() <= self.dedup_window
        })
    }

    /// Append a spot, evicting the oldest when full.
    pub fn push(&mut self, spot: Spot, disposition: Disposition) -> StoreOutcome {
        if !spot.has_calls() {
            return StoreOutcome::Rejected;
        }
        if self.is_duplicate(&spot) {
            trace!(tx = %spot.tx_call, rx = %spot.rx_call, "Duplicate spot dropped");
            return StoreOutcome::Duplicate;
        }

        while self.spots.len() >= self.max_spots {
            self.spots.pop_front();
            self.evicted += 1;
            self.scroll = self.scroll.saturating_sub(1);
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.spots.push_back(StoredSpot {
            seq,
            spot,
            disposition,
        });
        StoreOutcome::Added { seq }
    }

    /// Forget every spot and reset the scroll position.
    ///
    /// Sequence numbers keep counting so cursors held by readers stay valid.
    pub fn clear(&mut self) {
        debug!(dropped = self.spots.len(), "Spot history cleared");
        self.spots.clear();
        self.scroll = 0;
    }

    /// Index of the first row shown by the display.
    pub fn scroll(&self) -> usize {
        self.scroll
    }

    pub fn set_scroll(&mut self, row: usize) {
        self.scroll = row.min(self.spots.len().saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn make_spot(tx: &str, khz: f64, minute: u32) -> Spot {
        let at = Utc.with_ymd_and_hms(2026, 10, 17, 12, minute, 0).unwrap();
        Spot::new(tx, "K1TTT", khz, at)
    }

    fn store(max: usize) -> SpotStore {
        SpotStore::new(max, Duration::minutes(10))
    }

    #[test]
    fn test_push_assigns_sequence() {
        let mut s = store(10);
        assert_eq!(s.latest_seq(), 0);
        assert_eq!(
            s.push(make_spot("W1AW", 14025.0, 0), Disposition::Show),
            StoreOutcome::Added { seq: 1 }
        );
        assert_eq!(
            s.push(make_spot("JA1XYZ", 21074.0, 1), Disposition::Highlight),
            StoreOutcome::Added { seq: 2 }
        );
        assert_eq!(s.len(), 2);
        assert_eq!(s.latest_seq(), 2);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut s = store(3);
        for (i, call) in ["A1A", "B1B", "C1C", "D1D", "E1E"].iter().enumerate() {
            s.push(make_spot(call, 14000.0 + i as f64 * 10.0, 0), Disposition::Show);
        }
        let calls: Vec<_> = s.iter().map(|s| s.spot.tx_call.as_str()).collect();
        assert_eq!(calls, vec!["C1C", "D1D", "E1E"]);
        assert_eq!(s.evicted(), 2);
    }

    #[test]
    fn test_rejects_missing_calls() {
        let mut s = store(3);
        assert_eq!(s.push(make_spot("", 14025.0, 0), Disposition::Show), StoreOutcome::Rejected);
        assert!(s.is_empty());
    }

    #[test]
    fn test_duplicates() {
        let mut s = store(10);
        s.push(make_spot("W1AW", 14025.0, 0), Disposition::Show);

        assert_eq!(
            s.push(make_spot("W1AW", 14025.5, 5), Disposition::Show),
            StoreOutcome::Duplicate
        );
        // Each of these differs from the first in one respect.
        assert!(matches!(
            s.push(make_spot("W1AW", 14027.0, 5), Disposition::Show),
            StoreOutcome::Added { .. }
        ));
        assert!(matches!(
            s.push(make_spot("W1AW", 14025.0, 20), Disposition::Show),
            StoreOutcome::Added { .. }
        ));
        let mut other = make_spot("W1AW", 14025.0, 1);
        other.rx_call = "N2XYZ".to_string();
        assert!(matches!(s.push(other, Disposition::Show), StoreOutcome::Added { .. }));
    }

    #[test]
    fn test_since_cursor() {
        let mut s = store(2);
        s.push(make_spot("A1A", 7000.0, 0), Disposition::Show);
        s.push(make_spot("B1B", 7010.0, 0), Disposition::Show);
        s.push(make_spot("C1C", 7020.0, 0), Disposition::Show);

        let seqs: Vec<u64> = s.since(0).iter().map(|s| s.seq).collect();
        assert_eq!(seqs, vec![2, 3]);
        assert_eq!(s.since(2).len(), 1);
        assert!(s.since(3).is_empty());
    }

    #[test]
    fn test_clear_resets_scroll_keeps_sequence() {
        let mut s = store(5);
        for call in ["A1A", "B1B", "C1C"] {
            s.push(make_spot(call, 7000.0, 0), Disposition::Show);
        }
        s.set_scroll(10);
        assert_eq!(s.scroll(), 2);

        s.clear();
        assert!(s.is_empty());
        assert_eq!(s.scroll(), 0);
        assert_eq!(
            s.push(make_spot("D1D", 7000.0, 0), Disposition::Show),
            StoreOutcome::Added { seq: 4 }
        );
    }
}
