//! The spot ingestion facade.
//!
//! [`SpotIngestion`] owns the session, the spot store and the watch lists.
//! Each [`SpotIngestion::poll`] pumps the session once and pushes whatever
//! arrived through decode, locate, classify and store, reporting accepted
//! spots and connection problems to a [`SpotSink`].

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::StorageConfig;
use crate::error::SessionError;
use crate::locate::LocationResolver;
use crate::maidenhead;
use crate::parser::{looks_like_spot, parse_cluster_line};
use crate::persist::KvStore;
use crate::session::{ClusterSession, Inbound, SessionConfig};
use crate::spot::Spot;
use crate::stats::IngestStats;
use crate::store::{SpotStore, StoreOutcome, StoredSpot};
use crate::watchlist::{Disposition, WatchListError, WatchListId, WatchListState, WatchLists};
use crate::wsjtx::{StatusMessage, decode_datagram};

/// Receives what the ingestion produces; the display side of the engine.
pub trait SpotSink {
    /// A spot was stored. Suppressed spots are never reported.
    fn new_spot(&mut self, spot: &StoredSpot);

    /// The session failed or was refused; `message` is operator-facing.
    fn connection_error(&mut self, message: &str);
}

/// Ingestion behavior around the session.
#[derive(Debug, Clone)]
pub struct IngestOptions {
    /// Which watch list classifies incoming spots.
    pub watch_list: WatchListId,
    pub auto_reconnect: bool,
    pub reconnect_delay: Duration,
    pub storage: StorageConfig,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            watch_list: WatchListId::DxCluster,
            auto_reconnect: true,
            reconnect_delay: Duration::from_secs(10),
            storage: StorageConfig::default(),
        }
    }
}

/// Orchestrates one spot source end to end.
pub struct SpotIngestion {
    session: ClusterSession,
    store: SpotStore,
    watch_lists: WatchLists,
    options: IngestOptions,
    resolver: Box<dyn LocationResolver>,
    kv: Box<dyn KvStore>,
    sink: Box<dyn SpotSink>,
    stats: Arc<IngestStats>,
    last_status: Option<StatusMessage>,
    /// When the next automatic connect is due.
    reconnect_at: Option<Instant>,
    /// Set by a rate-limit refusal; only [`SpotIngestion::start`] clears it.
    halted: bool,
}

fn unix_now() -> u32 {
    Utc::now().timestamp().clamp(0, i64::from(u32::MAX)) as u32
}

impl SpotIngestion {
    pub fn new(
        session: SessionConfig,
        options: IngestOptions,
        resolver: Box<dyn LocationResolver>,
        kv: Box<dyn KvStore>,
        sink: Box<dyn SpotSink>,
    ) -> Self {
        let watch_lists = WatchLists::load(kv.as_ref());
        Self {
            session: ClusterSession::new(session),
            store: SpotStore::from_config(&options.storage),
            watch_lists,
            options,
            resolver,
            kv,
            sink,
            stats: Arc::new(IngestStats::new()),
            last_status: None,
            reconnect_at: None,
            halted: false,
        }
    }

    pub fn session(&self) -> &ClusterSession {
        &self.session
    }

    /// Read-only view of the spot history.
    pub fn spots(&self) -> &SpotStore {
        &self.store
    }

    pub fn set_scroll(&mut self, row: usize) {
        self.store.set_scroll(row);
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        Arc::clone(&self.stats)
    }

    pub fn watch_lists(&self) -> &WatchLists {
        &self.watch_lists
    }

    /// The most recent WSJT-X status, if any.
    pub fn last_status(&self) -> Option<&StatusMessage> {
        self.last_status.as_ref()
    }

    /// A rate-limit refusal stopped automatic reconnects.
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn reconnect_pending(&self) -> bool {
        self.reconnect_at.is_some()
    }

    /// Connect the session.
    pub async fn start(&mut self) -> Result<(), SessionError> {
        self.halted = false;
        self.reconnect_at = None;
        self.expire_history();

        match self.session.connect(self.kv.as_mut(), unix_now()).await {
            Ok(()) => {
                info!(kind = ?self.session.transport_kind(), "Ingestion started");
                Ok(())
            }
            Err(e) => {
                self.report_failure(&e);
                Err(e)
            }
        }
    }

    /// Disconnect on request; no reconnect is scheduled.
    pub async fn stop(&mut self) {
        self.reconnect_at = None;
        self.session.disconnect().await;
    }

    /// Pump the session once. Returns how many spots were stored.
    ///
    /// While disconnected this only checks whether an automatic reconnect
    /// is due.
    pub async fn poll(&mut self) -> Result<usize, SessionError> {
        if !self.session.state().is_connected() {
            return match self.reconnect_at {
                Some(at) if !self.halted && Instant::now() >= at => {
                    info!("Reconnecting");
                    self.start().await.map(|()| 0)
                }
                _ => Ok(0),
            };
        }

        match self.session.pump(self.kv.as_mut()).await {
            Ok(Inbound::Lines(lines)) => {
                let now = Utc::now();
                Ok(lines
                    .iter()
                    .filter(|line| self.ingest_line(line, now).is_some())
                    .count())
            }
            Ok(Inbound::Datagrams(datagrams)) => Ok(self.ingest_datagrams(&datagrams)),
            Err(e) => {
                self.report_failure(&e);
                Err(e)
            }
        }
    }

    fn report_failure(&mut self, e: &SessionError) {
        self.stats.record_connection_failure();
        self.sink.connection_error(&e.to_string());
        self.expire_history();

        if e.is_terminal() {
            warn!(error = %e, "Automatic reconnect halted");
            self.halted = true;
            self.reconnect_at = None;
        } else if self.options.auto_reconnect {
            info!(
                "Reconnecting in {} seconds...",
                self.options.reconnect_delay.as_secs()
            );
            self.reconnect_at = Some(Instant::now() + self.options.reconnect_delay);
        }
    }

    /// Clear the history once the source has been quiet past retention.
    fn expire_history(&mut self) {
        let retention = Duration::from_secs(self.options.storage.retention_secs);
        if !self.store.is_empty()
            && self.session.idle_for().is_some_and(|idle| idle > retention)
        {
            info!(idle_secs = retention.as_secs(), "Spot history expired");
            self.store.clear();
        }
    }

    /// Run one cluster line through parse, locate, classify and store.
    ///
    /// Returns the sequence number when the spot was stored.
    pub fn ingest_line(&mut self, line: &str, now: DateTime<Utc>) -> Option<u64> {
        self.stats.record_line(line.len());

        if !looks_like_spot(line) {
            self.stats.record_non_spot();
            debug!("Non-spot line: {}", line);
            return None;
        }

        let mut spot = match parse_cluster_line(line, now) {
            Ok(spot) => spot,
            Err(e) => {
                self.stats.record_parse_failure();
                debug!("Parse error for '{}': {}", line, e);
                return None;
            }
        };

        if !self.locate(&mut spot) {
            self.stats.record_unlocated();
            debug!(tx = %spot.tx_call, rx = %spot.rx_call, "Spot not located");
            return None;
        }
        self.accept(spot, now)
    }

    fn locate(&self, spot: &mut Spot) -> bool {
        let (Some(tx), Some(rx)) = (
            self.resolver.resolve(&spot.tx_call),
            self.resolver.resolve(&spot.rx_call),
        ) else {
            return false;
        };
        spot.tx_location = tx;
        spot.tx_grid = maidenhead::from_latlon(tx).unwrap_or_default();
        spot.rx_location = rx;
        spot.rx_grid = maidenhead::from_latlon(rx).unwrap_or_default();
        true
    }

    fn ingest_datagrams(&mut self, datagrams: &[Vec<u8>]) -> usize {
        let mut latest = None;
        for datagram in datagrams {
            self.stats.record_datagram(datagram.len());
            match decode_datagram(datagram) {
                Some(status) => latest = Some(status),
                None => self.stats.record_datagram_rejected(),
            }
        }
        match latest {
            Some(status) => usize::from(self.ingest_status(status, Utc::now()).is_some()),
            None => 0,
        }
    }

    /// Turn a WSJT-X status into a spot: the local operator heard the DX.
    pub fn ingest_status(&mut self, status: StatusMessage, now: DateTime<Utc>) -> Option<u64> {
        let mut spot = Spot::new(&status.dx_call, &status.de_call, status.frequency_khz(), now);
        spot.mode = status.mode.clone();
        spot.tx_grid = status.dx_grid.clone();
        spot.tx_location = status.dx_location;
        spot.rx_grid = status.de_grid.clone();
        spot.rx_location = status.de_location;
        self.last_status = Some(status);
        self.accept(spot, now)
    }

    fn accept(&mut self, spot: Spot, now: DateTime<Utc>) -> Option<u64> {
        let disposition = self
            .watch_lists
            .disposition(self.options.watch_list, &spot);
        if disposition == Disposition::Suppress {
            self.stats.record_suppressed();
            return None;
        }

        match self.store.push(spot, disposition) {
            StoreOutcome::Added { seq } => {
                if let Some(stored) = self.store.latest() {
                    self.stats.record_spot(&stored.spot, disposition, now);
                    self.sink.new_spot(stored);
                }
                Some(seq)
            }
            StoreOutcome::Duplicate => {
                self.stats.record_duplicate();
                None
            }
            StoreOutcome::Rejected => None,
        }
    }

    /// Compile, persist and activate a watch list.
    pub fn set_watch_list(
        &mut self,
        id: WatchListId,
        state: WatchListState,
        spec: &str,
    ) -> Result<(), WatchListError> {
        self.watch_lists.set(self.kv.as_mut(), id, state, spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locate::PrefixTable;
    use crate::persist::MemoryStore;
    use chrono::TimeZone;
    use std::cell::RefCell;
    use std::rc::Rc;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    const SPOT: &str =
        "DX de KD0AA:     18100.0  JR1FYS       FT8 LOUD in FL!                2156Z EL98";

    #[derive(Default)]
    struct Recorded {
        spots: Vec<StoredSpot>,
        errors: Vec<String>,
    }

    #[derive(Clone, Default)]
    struct RecordingSink(Rc<RefCell<Recorded>>);

    impl SpotSink for RecordingSink {
        fn new_spot(&mut self, spot: &StoredSpot) {
            self.0.borrow_mut().spots.push(spot.clone());
        }

        fn connection_error(&mut self, message: &str) {
            self.0.borrow_mut().errors.push(message.to_string());
        }
    }

    fn resolver() -> Box<PrefixTable> {
        Box::new(PrefixTable::from_grids([("K", "EM48"), ("JR", "PM95"), ("W", "FN31")]))
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 17, 22, 0, 0).unwrap()
    }

    fn facade(session: SessionConfig, kv: MemoryStore) -> (SpotIngestion, RecordingSink) {
        let sink = RecordingSink::default();
        let ingestion = SpotIngestion::new(
            session,
            IngestOptions::default(),
            resolver(),
            Box::new(kv),
            Box::new(sink.clone()),
        );
        (ingestion, sink)
    }

    #[test]
    fn test_line_becomes_located_spot() {
        let (mut ingest, sink) = facade(SessionConfig::default(), MemoryStore::new());

        assert_eq!(ingest.ingest_line(SPOT, now()), Some(1));

        let recorded = sink.0.borrow();
        assert_eq!(recorded.spots.len(), 1);
        let stored = &recorded.spots[0];
        assert_eq!(stored.disposition, Disposition::Show);
        assert_eq!(stored.spot.tx_call, "JR1FYS");
        assert_eq!(stored.spot.rx_call, "KD0AA");
        assert_eq!(&stored.spot.tx_grid[..4], "PM95");
        assert_eq!(&stored.spot.rx_grid[..4], "EM48");
        assert_eq!(ingest.spots().len(), 1);
    }

    #[test]
    fn test_dropped_lines_are_counted() {
        let (mut ingest, sink) = facade(SessionConfig::default(), MemoryStore::new());

        assert!(ingest.ingest_line("Hello N0CALL, this is GB7DJK", now()).is_none());
        assert!(ingest.ingest_line("DX de K1TTT: not a frequency at all", now()).is_none());
        let unknown = SPOT.replace("JR1FYS", "ZL1ABC");
        assert!(ingest.ingest_line(&unknown, now()).is_none());
        assert!(ingest.ingest_line(SPOT, now()).is_some());
        assert!(ingest.ingest_line(SPOT, now()).is_none());

        let summary = ingest.stats().summary();
        assert_eq!(summary.lines_received, 5);
        assert_eq!(summary.non_spot_lines, 1);
        assert_eq!(summary.parse_failures, 1);
        assert_eq!(summary.unlocated_spots, 1);
        assert_eq!(summary.duplicate_spots, 1);
        assert_eq!(summary.total_spots, 1);
        assert_eq!(sink.0.borrow().spots.len(), 1);
    }

    #[test]
    fn test_watch_list_classifies() {
        let (mut ingest, sink) = facade(SessionConfig::default(), MemoryStore::new());

        ingest
            .set_watch_list(WatchListId::DxCluster, WatchListState::Only, "W")
            .unwrap();
        assert!(ingest.ingest_line(SPOT, now()).is_none());
        assert_eq!(ingest.stats().summary().suppressed_spots, 1);
        assert!(ingest.spots().is_empty());

        ingest
            .set_watch_list(WatchListId::DxCluster, WatchListState::Flag, "JR 17m")
            .unwrap();
        assert!(ingest.ingest_line(SPOT, now()).is_some());
        assert_eq!(sink.0.borrow().spots[0].disposition, Disposition::Highlight);

        assert!(
            ingest
                .set_watch_list(WatchListId::DxCluster, WatchListState::Flag, "123")
                .is_err()
        );
        assert_eq!(ingest.watch_lists().get(WatchListId::DxCluster).spec(), "JR 17m");
    }

    #[test]
    fn test_status_becomes_spot() {
        let (mut ingest, sink) = facade(SessionConfig::wsjtx("127.0.0.1", 0), MemoryStore::new());
        let status = StatusMessage {
            id: "WSJT-X".to_string(),
            frequency_hz: 14_074_000,
            mode: "FT8".to_string(),
            dx_call: "JA1XYZ".to_string(),
            dx_grid: "PM95".to_string(),
            dx_location: maidenhead::to_latlon("PM95").unwrap(),
            de_call: "W1AW".to_string(),
            de_grid: "FN31".to_string(),
            de_location: maidenhead::to_latlon("FN31").unwrap(),
        };

        assert!(ingest.ingest_status(status.clone(), now()).is_some());
        // The same status repeats every few seconds.
        assert!(ingest.ingest_status(status, now()).is_none());

        let recorded = sink.0.borrow();
        let spot = &recorded.spots[0].spot;
        assert_eq!(spot.tx_call, "JA1XYZ");
        assert_eq!(spot.rx_call, "W1AW");
        assert_eq!(spot.frequency_khz, 14074.0);
        assert_eq!(spot.mode, "FT8");
        assert_eq!(ingest.last_status().map(|s| s.id.as_str()), Some("WSJT-X"));
    }

    #[tokio::test]
    async fn test_cluster_end_to_end() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            let mut conn = BufReader::new(sock);
            let mut login = String::new();
            conn.read_line(&mut login).await.unwrap();
            conn.get_mut()
                .write_all(b"DXSpider node\r\nN0CALL de GB7DJK >\r\n")
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(300)).await;
            conn.get_mut()
                .write_all(format!("{SPOT}\r\n").as_bytes())
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(300)).await;
        });

        let mut session = SessionConfig::cluster("127.0.0.1", port, "N0CALL");
        session.read_wait = Duration::from_millis(100);
        session.classify_timeout = Duration::from_secs(2);
        let (mut ingest, sink) = facade(session, MemoryStore::new());

        ingest.start().await.unwrap();
        let mut stored = 0;
        let mut failure = None;
        for _ in 0..40 {
            match ingest.poll().await {
                Ok(n) => stored += n,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        assert_eq!(stored, 1);
        let failure = failure.unwrap();
        assert!(!failure.is_terminal());
        assert!(ingest.reconnect_pending());
        assert!(!ingest.is_halted());
        // History survives a failure inside the retention window.
        assert_eq!(ingest.spots().len(), 1);
        assert_eq!(sink.0.borrow().errors, vec!["Lost cluster connection".to_string()]);
    }

    #[tokio::test]
    async fn test_stale_history_cleared_on_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            let mut conn = BufReader::new(sock);
            let mut login = String::new();
            conn.read_line(&mut login).await.unwrap();
            conn.get_mut()
                .write_all(b"DXSpider node\r\nN0CALL de GB7DJK >\r\n")
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(300)).await;
        });

        let mut session = SessionConfig::cluster("127.0.0.1", port, "N0CALL");
        session.read_wait = Duration::from_millis(100);
        session.classify_timeout = Duration::from_secs(2);
        let mut options = IngestOptions::default();
        options.storage.retention_secs = 0;
        let sink = RecordingSink::default();
        let mut ingest = SpotIngestion::new(
            session,
            options,
            resolver(),
            Box::new(MemoryStore::new()),
            Box::new(sink.clone()),
        );

        ingest.start().await.unwrap();
        assert!(ingest.ingest_line(SPOT, now()).is_some());
        let other = SPOT.replace("JR1FYS", "W1AW");
        assert!(ingest.ingest_line(&other, now()).is_some());
        ingest.set_scroll(1);
        assert_eq!(ingest.spots().scroll(), 1);

        let mut failed = false;
        for _ in 0..40 {
            if ingest.poll().await.is_err() {
                failed = true;
                break;
            }
        }

        assert!(failed);
        assert!(ingest.spots().is_empty());
        assert_eq!(ingest.spots().scroll(), 0);
        assert!(ingest.reconnect_pending());
        assert_eq!(sink.0.borrow().spots.len(), 2);
    }

    #[tokio::test]
    async fn test_rate_limit_halts_reconnect() {
        let mut kv = MemoryStore::new();
        kv.set_u32("lost_connections.count", 11).unwrap();
        kv.set_u32("lost_connections.window_start", unix_now()).unwrap();
        let (mut ingest, sink) = facade(SessionConfig::cluster("127.0.0.1", 9, "N0CALL"), kv);

        let err = ingest.start().await.unwrap_err();
        assert!(err.is_terminal());
        assert!(ingest.is_halted());
        assert!(!ingest.reconnect_pending());
        assert_eq!(ingest.poll().await.unwrap(), 0);
        assert!(sink.0.borrow().errors[0].starts_with("too many lost connections"));
    }
}
