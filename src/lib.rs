//! dxwatch - Live DX spot ingestion from DX cluster nodes and WSJT-X.
//!
//! This crate provides:
//! - A nom-based parser for DX cluster spot lines
//! - A decoder for WSJT-X Status datagrams
//! - A cluster session that logs in, classifies the node and survives drops
//! - Watch lists that highlight or hide spots by prefix, band or frequency
//! - A bounded, de-duplicated spot store and ingestion statistics
//!
//! # Example
//!
//! ```rust,no_run
//! use chrono::Utc;
//! use dxwatch::{parser::parse_cluster_line, watchlist::{WatchList, WatchListState}};
//!
//! let line = "DX de KD0AA:     18100.0  JR1FYS       FT8 LOUD in FL!                2156Z EL98";
//! let spot = parse_cluster_line(line, Utc::now()).expect("Failed to parse spot");
//!
//! let list = WatchList::new(WatchListState::Flag, "JR 17m").expect("Bad watch list");
//! println!("{} -> {:?}", spot, list.disposition(&spot));
//! ```

pub mod config;
pub mod error;
pub mod ingest;
pub mod locate;
pub mod maidenhead;
pub mod metrics;
pub mod parser;
pub mod persist;
pub mod reconnect;
pub mod session;
pub mod spot;
pub mod stats;
pub mod store;
pub mod transport;
pub mod watchlist;
pub mod wsjtx;

pub use config::{Config, StorageConfig};
pub use error::{ErrorClass, FailureReason, SessionError};
pub use ingest::{IngestOptions, SpotIngestion, SpotSink};
pub use locate::{LocationResolver, PrefixTable};
pub use parser::{ParseError, looks_like_spot, parse_cluster_line};
pub use persist::{JsonFileStore, KvStore, MemoryStore};
pub use session::{ClusterSession, Dialect, SessionConfig, SessionState, TransportKind};
pub use spot::{LatLon, Spot};
pub use stats::{IngestStats, StatsSummary};
pub use store::{SpotStore, StoredSpot};
pub use watchlist::{Disposition, WatchList, WatchListId, WatchListState, WatchLists};
pub use wsjtx::{StatusMessage, decode_datagram};
