//! Callsign and grid to location resolution.

use std::collections::HashMap;
use tracing::warn;

use crate::maidenhead;
use crate::spot::LatLon;
use crate::watchlist::split_call;

/// Resolves a call or a Maidenhead grid to a position.
pub trait LocationResolver {
    fn resolve(&self, call_or_grid: &str) -> Option<LatLon>;

    /// The grid for a call or grid, when one is known.
    fn grid(&self, call_or_grid: &str) -> Option<String> {
        self.resolve(call_or_grid).and_then(maidenhead::from_latlon)
    }
}

/// Strip a spotter SSID: `W3LPL-2-#` is `W3LPL`.
pub fn base_call(call: &str) -> &str {
    call.split('-').next().unwrap_or(call).trim()
}

/// Longest-prefix table from callsign prefixes to grids.
///
/// Grids passed in are decoded directly. Calls drop any SSID and resolve on
/// the dx part of a split call, so `W1AW/VE1` is looked up as `VE1`.
#[derive(Debug, Clone, Default)]
pub struct PrefixTable {
    entries: HashMap<String, LatLon>,
    longest: usize,
}

impl PrefixTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from prefix to grid pairs, skipping entries with a bad grid.
    pub fn from_grids<'a, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut table = Self::new();
        for (prefix, grid) in pairs {
            if let Some(pos) = maidenhead::to_latlon(grid) {
                table.insert(prefix, pos);
            } else {
                warn!(prefix, grid, "Skipping location with invalid grid");
            }
        }
        table
    }

    pub fn insert(&mut self, prefix: &str, pos: LatLon) {
        let prefix = prefix.trim().to_ascii_uppercase();
        self.longest = self.longest.max(prefix.len());
        self.entries.insert(prefix, pos);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn lookup(&self, call: &str) -> Option<LatLon> {
        (1..=call.len().min(self.longest))
            .rev()
            .find_map(|n| call.get(..n).and_then(|p| self.entries.get(p)))
            .copied()
    }
}

impl LocationResolver for PrefixTable {
    fn resolve(&self, call_or_grid: &str) -> Option<LatLon> {
        if let Some(pos) = maidenhead::to_latlon(call_or_grid) {
            return Some(pos);
        }
        let split = split_call(base_call(call_or_grid));
        self.lookup(&split.dx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> PrefixTable {
        PrefixTable::from_grids([
            ("W", "FN31"),
            ("W6", "CM87"),
            ("VE1", "FN74"),
            ("JA", "PM95"),
            ("XX", "bogus"),
        ])
    }

    #[test]
    fn test_longest_prefix_wins() {
        let t = table();
        assert_eq!(t.len(), 4);
        assert_eq!(t.grid("W6ABC").as_deref(), t.grid("CM87").as_deref());
        assert_eq!(t.resolve("W1AW"), maidenhead::to_latlon("FN31"));
        assert!(t.resolve("ZL2ABC").is_none());
    }

    #[test]
    fn test_grid_passthrough() {
        let t = PrefixTable::new();
        assert_eq!(t.resolve("EL98"), maidenhead::to_latlon("EL98"));
    }

    #[test]
    fn test_ssid_and_split_calls() {
        let t = table();
        assert_eq!(base_call("W3LPL-2-#"), "W3LPL");
        assert_eq!(t.resolve("W3LPL-2-#"), maidenhead::to_latlon("FN31"));
        assert_eq!(t.resolve("W1AW/VE1"), maidenhead::to_latlon("FN74"));
        assert_eq!(t.resolve("JA1XYZ/P"), maidenhead::to_latlon("PM95"));
    }
}
