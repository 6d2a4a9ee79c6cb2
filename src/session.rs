//! The connection state machine for one spot source.
//!
//! A cluster session walks
//! `Disconnected -> Connecting -> Classifying -> LoggedIn -> SteadyState`.
//! Any failure passes through `Failed(reason)`, bumps the persisted lost
//! connection counter once and lands back in `Disconnected`. A WSJT-X
//! session only binds and unbinds a UDP socket, so it goes straight from
//! `Connecting` to `SteadyState`.
//!
//! Nothing here spawns tasks: the owner calls [`ClusterSession::pump`] from
//! its loop and every read is bounded by a short wait.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{FailureReason, SessionError};
use crate::maidenhead;
use crate::parser::mentions_multi_login;
use crate::persist::KvStore;
use crate::reconnect::ReconnectPolicy;
use crate::spot::LatLon;
use crate::transport::{LineEvent, TcpLink, UdpLink};

/// Default cluster port.
pub const CLUSTER_PORT: u16 = 7300;

/// Default WSJT-X UDP port.
pub const WSJTX_PORT: u16 = 2237;

/// Which source a session talks to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportKind {
    #[default]
    #[serde(rename = "cluster")]
    TcpClusterText,
    #[serde(rename = "wsjtx")]
    UdpWsjtx,
}

/// Cluster node software, detected from the login banner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Dialect {
    #[default]
    Unknown,
    DxSpider,
    ArCluster,
}

impl Dialect {
    /// Case-insensitive banner match.
    pub fn detect(text: &str) -> Option<Dialect> {
        let lower = text.to_ascii_lowercase();
        if lower.contains("spider") {
            Some(Dialect::DxSpider)
        } else if lower.contains("ar-cluster") {
            Some(Dialect::ArCluster)
        } else {
            None
        }
    }

    /// Commands that tell the node where we are.
    pub fn announce_commands(&self, grid: &str, pos: LatLon) -> Vec<String> {
        let grid = grid.to_ascii_uppercase();
        let latlon = format!(
            "{} {}",
            degrees_minutes(pos.lat, 'N', 'S'),
            degrees_minutes(pos.lon, 'E', 'W')
        );
        match self {
            Dialect::DxSpider => vec![format!("set/qra {grid}"), format!("set/location {latlon}")],
            Dialect::ArCluster => vec![
                format!("set station grid {grid}"),
                format!("set station latlon {latlon}"),
            ],
            Dialect::Unknown => Vec::new(),
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Dialect::Unknown => "unknown",
            Dialect::DxSpider => "DXSpider",
            Dialect::ArCluster => "AR-Cluster",
        })
    }
}

/// `41 43 N` style whole degrees and minutes.
fn degrees_minutes(value: f64, positive: char, negative: char) -> String {
    let hemisphere = if value < 0.0 { negative } else { positive };
    let total_minutes = (value.abs() * 60.0).round() as u32;
    format!("{} {} {}", total_minutes / 60, total_minutes % 60, hemisphere)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Classifying,
    LoggedIn,
    SteadyState,
    Failed(FailureReason),
    ShuttingDown,
}

impl SessionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::SteadyState)
    }
}

/// Settings for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub kind: TransportKind,

    /// Cluster host and port.
    pub host: String,
    pub port: u16,

    /// Line sent right after connecting, usually our callsign.
    pub login: String,

    /// Our Maidenhead locator, announced to the node when valid.
    pub grid: String,

    /// Extra commands sent after the location announcement.
    pub commands: Vec<String>,

    pub connect_timeout: Duration,

    /// How long to wait for the login prompt.
    pub classify_timeout: Duration,

    /// Longest single read wait.
    pub read_wait: Duration,

    /// Longest time one pump may spend reading.
    pub pump_budget: Duration,

    /// Idle time before a heartbeat is sent.
    pub keepalive: Duration,
    pub heartbeat: String,

    /// WSJT-X listen address and port.
    pub wsjtx_address: String,
    pub wsjtx_port: u16,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::TcpClusterText,
            host: String::new(),
            port: CLUSTER_PORT,
            login: "N0CALL".to_string(),
            grid: String::new(),
            commands: Vec::new(),
            connect_timeout: Duration::from_secs(30),
            classify_timeout: Duration::from_secs(10),
            read_wait: Duration::from_millis(50),
            pump_budget: Duration::from_millis(250),
            keepalive: Duration::from_secs(600),
            heartbeat: String::new(),
            wsjtx_address: "127.0.0.1".to_string(),
            wsjtx_port: WSJTX_PORT,
        }
    }
}

impl SessionConfig {
    /// A cluster session logging in as `login`.
    pub fn cluster(host: impl Into<String>, port: u16, login: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            login: login.into(),
            ..Default::default()
        }
    }

    /// A WSJT-X session listening on `address:port`.
    pub fn wsjtx(address: impl Into<String>, port: u16) -> Self {
        Self {
            kind: TransportKind::UdpWsjtx,
            wsjtx_address: address.into(),
            wsjtx_port: port,
            ..Default::default()
        }
    }

    pub fn with_grid(mut self, grid: impl Into<String>) -> Self {
        self.grid = grid.into();
        self
    }
}

/// What one pump produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Cluster lines, oldest first, possibly empty.
    Lines(Vec<String>),
    /// Raw WSJT-X datagrams, oldest first, possibly empty.
    Datagrams(Vec<Vec<u8>>),
}

enum Link {
    Tcp(TcpLink),
    Udp(UdpLink),
}

impl Link {
    async fn close(self) {
        match self {
            Link::Tcp(tcp) => tcp.close().await,
            Link::Udp(_) => {}
        }
    }
}

/// One logical connection to one source.
pub struct ClusterSession {
    config: SessionConfig,
    state: SessionState,
    dialect: Dialect,
    link: Option<Link>,
    policy: ReconnectPolicy,
    last_activity_at: Option<Instant>,
    last_heartbeat_at: Option<Instant>,
    multi_login_detected: bool,
    /// Lines read during login, handed out by the first pump.
    backlog: VecDeque<String>,
    /// The peer closed after a pump that still had lines to return.
    peer_closed: bool,
    last_failure: Option<FailureReason>,
}

impl ClusterSession {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            state: SessionState::Disconnected,
            dialect: Dialect::Unknown,
            link: None,
            policy: ReconnectPolicy::default(),
            last_activity_at: None,
            last_heartbeat_at: None,
            multi_login_detected: false,
            backlog: VecDeque::new(),
            peer_closed: false,
            last_failure: None,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.config.kind
    }

    pub fn multi_login_detected(&self) -> bool {
        self.multi_login_detected
    }

    pub fn last_failure(&self) -> Option<&FailureReason> {
        self.last_failure.as_ref()
    }

    pub fn lost_connection_count(&self) -> u32 {
        self.policy.count()
    }

    /// Time since a line or datagram last arrived.
    pub fn idle_for(&self) -> Option<Duration> {
        self.last_activity_at.map(|at| at.elapsed())
    }

    /// Bound UDP address, for WSJT-X sessions.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.link {
            Some(Link::Udp(udp)) => udp.local_addr().ok(),
            _ => None,
        }
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "Session state");
            self.state = state;
        }
    }

    /// Open the session. `now` is Unix time in seconds, for the rate limiter.
    ///
    /// A rate-limit denial returns before any socket is opened.
    pub async fn connect(&mut self, store: &mut dyn KvStore, now: u32) -> Result<(), SessionError> {
        if self.link.is_some() {
            return Ok(());
        }

        self.policy = ReconnectPolicy::load(store);
        self.policy.check(store, now)?;

        self.dialect = Dialect::Unknown;
        self.multi_login_detected = false;
        self.peer_closed = false;
        self.backlog.clear();
        self.set_state(SessionState::Connecting);

        let result = match self.config.kind {
            TransportKind::UdpWsjtx => self.open_udp().await,
            TransportKind::TcpClusterText => self.open_cluster().await,
        };
        match result {
            Ok(()) => {
                let now = Instant::now();
                self.last_activity_at = Some(now);
                self.last_heartbeat_at = Some(now);
                self.last_failure = None;
                self.set_state(SessionState::SteadyState);
                Ok(())
            }
            Err(reason) => Err(self.fail(store, reason).await),
        }
    }

    async fn open_udp(&mut self) -> Result<(), FailureReason> {
        let udp = UdpLink::bind(&self.config.wsjtx_address, self.config.wsjtx_port).await?;
        self.link = Some(Link::Udp(udp));
        Ok(())
    }

    async fn open_cluster(&mut self) -> Result<(), FailureReason> {
        let tcp = TcpLink::connect(&self.config.host, self.config.port, self.config.connect_timeout)
            .await?;
        self.link = Some(Link::Tcp(tcp));

        // Any I/O trouble before steady state means the node turned us away.
        match self.handshake().await {
            Err(FailureReason::Io(e)) => {
                debug!(error = %e, "I/O error during login");
                Err(self.login_failure())
            }
            other => other,
        }
    }

    async fn handshake(&mut self) -> Result<(), FailureReason> {
        self.set_state(SessionState::Classifying);
        let login = self.config.login.clone();
        self.send(&login).await?;

        let dialect = self.classify().await?;
        self.dialect = dialect;
        info!(%dialect, "Cluster identified");
        self.set_state(SessionState::LoggedIn);

        for command in self.login_commands() {
            self.send(&command).await?;
        }

        // A node that refuses us closes right after the commands. A busy node
        // never goes quiet, so the settle read stops at the pump budget.
        let deadline = Instant::now() + self.config.pump_budget;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.read_line(remaining.min(self.config.read_wait)).await? {
                LineEvent::Line(line) => self.backlog.push_back(line),
                LineEvent::Idle => break,
                LineEvent::Closed => return Err(self.login_failure()),
            }
        }
        Ok(())
    }

    /// Read until a `>` prompt or the classify timeout, watching for the
    /// node software name along the way.
    async fn classify(&mut self) -> Result<Dialect, FailureReason> {
        let deadline = Instant::now() + self.config.classify_timeout;
        let mut dialect = None;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!("No cluster prompt before timeout");
                break;
            }
            match self.read_line(remaining.min(self.config.read_wait * 4)).await? {
                LineEvent::Line(line) => {
                    dialect = dialect.or(Dialect::detect(&line));
                    if line.ends_with('>') {
                        break;
                    }
                }
                LineEvent::Idle => {
                    if let Some(Link::Tcp(tcp)) = &mut self.link
                        && tcp.pending_prompt()
                    {
                        let prompt = tcp.pending_text();
                        tcp.discard_partial();
                        debug!(prompt = %prompt, "Prompt");
                        dialect = dialect.or(Dialect::detect(&prompt));
                        break;
                    }
                }
                LineEvent::Closed => return Err(self.login_failure()),
            }
        }

        dialect.ok_or(FailureReason::UnknownDialect)
    }

    fn login_commands(&self) -> Vec<String> {
        let mut commands = match maidenhead::to_latlon(&self.config.grid) {
            Some(pos) => self.dialect.announce_commands(&self.config.grid, pos),
            None => {
                if !self.config.grid.is_empty() {
                    warn!(grid = %self.config.grid, "Not announcing location, invalid grid");
                }
                Vec::new()
            }
        };
        commands.extend(self.config.commands.iter().cloned());
        commands
    }

    fn login_failure(&self) -> FailureReason {
        if self.multi_login_detected {
            FailureReason::MultipleLogins
        } else {
            FailureReason::LoginRejected
        }
    }

    async fn send(&mut self, text: &str) -> Result<(), FailureReason> {
        match &mut self.link {
            Some(Link::Tcp(tcp)) => tcp
                .send_line(text)
                .await
                .map_err(|e| FailureReason::Io(e.to_string())),
            _ => Err(FailureReason::LostConnection),
        }
    }

    /// One bounded TCP read. Every line is checked for duplicate-login
    /// notices regardless of what else it is.
    async fn read_line(&mut self, wait: Duration) -> Result<LineEvent, FailureReason> {
        let Some(Link::Tcp(tcp)) = &mut self.link else {
            return Err(FailureReason::LostConnection);
        };
        let event = tcp
            .next_line(wait)
            .await
            .map_err(|e| FailureReason::Io(e.to_string()))?;
        if let LineEvent::Line(line) = &event
            && mentions_multi_login(line)
        {
            warn!(line = %line, "Cluster reports another login with this call");
            self.multi_login_detected = true;
        }
        Ok(event)
    }

    /// Collect what has arrived, spending at most the pump budget.
    pub async fn pump(&mut self, store: &mut dyn KvStore) -> Result<Inbound, SessionError> {
        match self.link {
            None => Err(SessionError::NotConnected),
            Some(Link::Udp(_)) => self.pump_udp(store).await,
            Some(Link::Tcp(_)) => self.pump_cluster(store).await,
        }
    }

    async fn pump_udp(&mut self, store: &mut dyn KvStore) -> Result<Inbound, SessionError> {
        let wait = self.config.read_wait;
        let drained = match &mut self.link {
            Some(Link::Udp(udp)) => udp.drain(wait).await,
            _ => return Err(SessionError::NotConnected),
        };
        match drained {
            Ok(datagrams) => {
                if !datagrams.is_empty() {
                    self.last_activity_at = Some(Instant::now());
                }
                Ok(Inbound::Datagrams(datagrams))
            }
            Err(e) => Err(self.fail(store, FailureReason::Io(e.to_string())).await),
        }
    }

    async fn pump_cluster(&mut self, store: &mut dyn KvStore) -> Result<Inbound, SessionError> {
        if self.peer_closed {
            return Err(self.fail(store, FailureReason::LostConnection).await);
        }

        let mut lines: Vec<String> = self.backlog.drain(..).collect();
        let deadline = Instant::now() + self.config.pump_budget;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.read_line(remaining.min(self.config.read_wait)).await {
                Ok(LineEvent::Line(line)) => {
                    self.last_activity_at = Some(Instant::now());
                    lines.push(line);
                }
                Ok(LineEvent::Idle) => break,
                Ok(LineEvent::Closed) => {
                    if lines.is_empty() {
                        return Err(self.fail(store, FailureReason::LostConnection).await);
                    }
                    self.peer_closed = true;
                    return Ok(Inbound::Lines(lines));
                }
                Err(reason) => return Err(self.fail(store, reason).await),
            }
        }

        if let Err(reason) = self.keepalive().await {
            return Err(self.fail(store, reason).await);
        }
        Ok(Inbound::Lines(lines))
    }

    /// Send the heartbeat when nothing has moved for the keepalive time.
    async fn keepalive(&mut self) -> Result<(), FailureReason> {
        let last = self.last_activity_at.max(self.last_heartbeat_at);
        if last.is_some_and(|at| at.elapsed() < self.config.keepalive) {
            return Ok(());
        }
        debug!("Sending keepalive");
        let heartbeat = self.config.heartbeat.clone();
        self.send(&heartbeat).await?;
        self.last_heartbeat_at = Some(Instant::now());
        Ok(())
    }

    /// Record a failure: count it, close the link and return to
    /// `Disconnected`. Returns the error to hand to the caller.
    async fn fail(&mut self, store: &mut dyn KvStore, reason: FailureReason) -> SessionError {
        warn!(reason = %reason, "Session failed");
        self.set_state(SessionState::Failed(reason.clone()));
        if let Some(link) = self.link.take() {
            link.close().await;
        }
        if let Err(e) = self.policy.record_failure(store) {
            warn!(error = %e, "Could not save lost connection count");
        }
        self.backlog.clear();
        self.peer_closed = false;
        self.last_failure = Some(reason.clone());
        self.set_state(SessionState::Disconnected);
        SessionError::Failed(reason)
    }

    /// Close on request. Does not count as a lost connection.
    pub async fn disconnect(&mut self) {
        if self.link.is_none() {
            self.set_state(SessionState::Disconnected);
            return;
        }
        self.set_state(SessionState::ShuttingDown);
        if let Some(link) = self.link.take() {
            link.close().await;
        }
        self.backlog.clear();
        self.peer_closed = false;
        info!("Session closed");
        self.set_state(SessionState::Disconnected);
    }
}
