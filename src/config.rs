//! Configuration file support for dxwatch.
//!
//! Loads settings from `~/.config/dxwatch/config.toml` on Linux
//! (or platform-appropriate location on other OSes).

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ingest::IngestOptions;
use crate::locate::PrefixTable;
use crate::maidenhead;
use crate::session::{CLUSTER_PORT, SessionConfig, TransportKind, WSJTX_PORT};
use crate::watchlist::{WatchList, WatchListId, WatchListState};

/// Configuration for the spot store.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Spots kept before the oldest is evicted.
    pub max_spots: usize,

    /// Window in seconds within which a repeat spot is a duplicate.
    pub dedup_window_secs: u64,

    /// History is cleared after this many idle seconds.
    pub retention_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_spots: 50,
            dedup_window_secs: 600,
            retention_secs: 300,
        }
    }
}

/// DX cluster connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub host: String,
    pub port: u16,

    /// Login line, defaults to the callsign.
    pub login: Option<String>,

    /// Extra commands sent after logging in.
    pub commands: Vec<String>,

    /// Connection timeout in seconds.
    pub connect_timeout: u64,

    /// Seconds to wait for the login prompt.
    pub classify_timeout: u64,

    /// Longest single read wait in milliseconds.
    pub read_wait_ms: u64,

    /// Longest time one poll may spend reading, in milliseconds.
    pub pump_budget_ms: u64,

    /// Idle seconds before a heartbeat is sent.
    pub keepalive_secs: u64,

    /// Text sent as the heartbeat.
    pub heartbeat: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: CLUSTER_PORT,
            login: None,
            commands: Vec::new(),
            connect_timeout: 30,
            classify_timeout: 10,
            read_wait_ms: 50,
            pump_budget_ms: 250,
            keepalive_secs: 600,
            heartbeat: String::new(),
        }
    }
}

/// WSJT-X UDP settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WsjtxConfig {
    /// Address to listen on; a multicast group is joined.
    pub address: String,
    pub port: u16,
}

impl Default for WsjtxConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: WSJTX_PORT,
        }
    }
}

/// One `[watchlists.<id>]` table.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WatchListConfig {
    pub state: WatchListState,
    pub spec: String,
}

/// Application configuration loaded from TOML file.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Our callsign, used as the cluster login by default.
    pub callsign: String,

    /// Our Maidenhead locator.
    pub grid: String,

    /// Which source to ingest from.
    pub source: TransportKind,

    /// Milliseconds between polls.
    pub poll_interval_ms: u64,

    /// Whether to reconnect after a failure.
    pub auto_reconnect: bool,

    /// Seconds to wait before reconnecting.
    pub reconnect_delay: u64,

    /// Print statistics every N seconds.
    pub stats_interval: u64,

    /// Enable Prometheus metrics HTTP endpoint.
    pub metrics_enabled: bool,

    /// Port for Prometheus metrics HTTP endpoint.
    pub metrics_port: u16,

    /// Where counters and watch lists persist.
    pub state_file: Option<PathBuf>,

    pub cluster: ClusterConfig,

    pub wsjtx: WsjtxConfig,

    pub storage: StorageConfig,

    /// Callsign prefix to grid, for locating spots.
    pub locations: BTreeMap<String, String>,

    /// Watch lists keyed by list name, applied over the stored ones.
    pub watchlists: HashMap<String, WatchListConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            callsign: "N0CALL".to_string(),
            grid: String::new(),
            source: TransportKind::TcpClusterText,
            poll_interval_ms: 1000,
            auto_reconnect: true,
            reconnect_delay: 10,
            stats_interval: 60,
            metrics_enabled: false,
            metrics_port: 9090,
            state_file: None,
            cluster: ClusterConfig::default(),
            wsjtx: WsjtxConfig::default(),
            storage: StorageConfig::default(),
            locations: BTreeMap::new(),
            watchlists: HashMap::new(),
        }
    }
}

impl Config {
    /// Load configuration from `path`, or the default location.
    ///
    /// A missing file at the default location gives the default config; an
    /// explicitly named file must exist. A malformed file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match Self::config_path() {
                Some(p) if p.exists() => p,
                _ => return Ok(Config::default()),
            },
        };
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Parse configuration text.
    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Returns the path to the config file.
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("dxwatch/config.toml"))
    }

    /// The state file, defaulting to the platform data directory.
    pub fn state_path(&self) -> PathBuf {
        self.state_file.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .map(|p| p.join("dxwatch/state.json"))
                .unwrap_or_else(|| PathBuf::from("dxwatch-state.json"))
        })
    }

    /// Validate all configuration settings.
    pub fn validate(&self) -> Result<()> {
        if self.callsign.trim().is_empty() {
            bail!("callsign is not set");
        }
        if !self.grid.is_empty() && !maidenhead::is_grid(&self.grid) {
            bail!("grid '{}' is not a Maidenhead locator", self.grid);
        }
        if self.source == TransportKind::TcpClusterText && self.cluster.host.trim().is_empty() {
            bail!("cluster host is not set");
        }
        for (prefix, grid) in &self.locations {
            if !maidenhead::is_grid(grid) {
                bail!("location for '{}': '{}' is not a Maidenhead locator", prefix, grid);
            }
        }
        self.watch_lists()?;
        Ok(())
    }

    /// The configured watch lists, compiled.
    pub fn watch_lists(&self) -> Result<Vec<(WatchListId, WatchList)>> {
        let mut lists = Vec::new();
        for (name, list) in &self.watchlists {
            let id: WatchListId = name
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid watch list [{}]: {}", name, e))?;
            let compiled = WatchList::new(list.state, &list.spec)
                .with_context(|| format!("Invalid watch list [{}]", name))?;
            lists.push((id, compiled));
        }
        Ok(lists)
    }

    /// Session settings for the configured source.
    pub fn session_config(&self) -> SessionConfig {
        let cluster = &self.cluster;
        SessionConfig {
            kind: self.source,
            host: cluster.host.clone(),
            port: cluster.port,
            login: cluster
                .login
                .clone()
                .unwrap_or_else(|| self.callsign.clone()),
            grid: self.grid.clone(),
            commands: cluster.commands.clone(),
            connect_timeout: Duration::from_secs(cluster.connect_timeout),
            classify_timeout: Duration::from_secs(cluster.classify_timeout),
            read_wait: Duration::from_millis(cluster.read_wait_ms),
            pump_budget: Duration::from_millis(cluster.pump_budget_ms),
            keepalive: Duration::from_secs(cluster.keepalive_secs),
            heartbeat: cluster.heartbeat.clone(),
            wsjtx_address: self.wsjtx.address.clone(),
            wsjtx_port: self.wsjtx.port,
        }
    }

    pub fn ingest_options(&self) -> IngestOptions {
        IngestOptions {
            auto_reconnect: self.auto_reconnect,
            reconnect_delay: Duration::from_secs(self.reconnect_delay),
            storage: self.storage.clone(),
            ..Default::default()
        }
    }

    pub fn prefix_table(&self) -> PrefixTable {
        PrefixTable::from_grids(
            self.locations
                .iter()
                .map(|(prefix, grid)| (prefix.as_str(), grid.as_str())),
        )
    }
}
