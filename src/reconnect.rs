//! Rate-limited reconnect policy.
//!
//! Every failed session bumps a persisted counter. Once more than
//! [`MAX_LOST_CONNECTIONS`] failures land inside one [`WINDOW_SECS`] window,
//! connecting is refused until the window has passed.

use tracing::{info, warn};

use crate::error::SessionError;
use crate::persist::{KvStore, StoreError};

pub const MAX_LOST_CONNECTIONS: u32 = 10;
pub const WINDOW_SECS: u32 = 3600;

const COUNT_KEY: &str = "lost_connections.count";
const WINDOW_KEY: &str = "lost_connections.window_start";

/// Failure counter and the start of its window, in Unix seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconnectPolicy {
    count: u32,
    window_start: u32,
}

impl ReconnectPolicy {
    pub fn new(count: u32, window_start: u32) -> Self {
        Self {
            count,
            window_start,
        }
    }

    pub fn load(store: &dyn KvStore) -> Self {
        Self {
            count: store.get_u32(COUNT_KEY).unwrap_or(0),
            window_start: store.get_u32(WINDOW_KEY).unwrap_or(0),
        }
    }

    pub fn save(&self, store: &mut dyn KvStore) -> Result<(), StoreError> {
        store.set_u32(COUNT_KEY, self.count)?;
        store.set_u32(WINDOW_KEY, self.window_start)
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn window_start(&self) -> u32 {
        self.window_start
    }

    fn window_end(&self) -> u32 {
        self.window_start.saturating_add(WINDOW_SECS)
    }

    /// Decide whether a connect attempt at `now` may proceed.
    ///
    /// An expired window is reset and saved before returning `Ok`.
    pub fn check(&mut self, store: &mut dyn KvStore, now: u32) -> Result<(), SessionError> {
        if now < self.window_end() {
            if self.count > MAX_LOST_CONNECTIONS {
                let retry_after_secs = self.window_end() - now;
                warn!(count = self.count, retry_after_secs, "Connect refused by rate limit");
                return Err(SessionError::TooManyLostConnections { retry_after_secs });
            }
            return Ok(());
        }

        if self.count > 0 {
            info!(count = self.count, "Lost connection window expired, counter reset");
        }
        self.count = 0;
        self.window_start = now;
        self.save(store)?;
        Ok(())
    }

    /// Count one failure. Called exactly once per entry into `Failed`.
    pub fn record_failure(&mut self, store: &mut dyn KvStore) -> Result<(), StoreError> {
        self.count = self.count.saturating_add(1);
        self.save(store)
    }
}
