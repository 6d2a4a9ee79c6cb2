//! Watch lists: a small filter language over spots.
//!
//! A watch list is free text such as `"K1 W1, VE1/ 20m, 14.0-14.1"`. Commas
//! separate OR-groups; blanks separate tokens inside a group. Each token is
//! one of:
//!
//! - a frequency range in MHz, `min-max`, both within 1 to 200
//! - a band, `20m`, resolved through the band table
//! - a call prefix, `K1`, matched against the home part of the DX call
//! - a dx prefix, `VE1/`, matched only against the dx part of a split call
//!
//! A group matches when its prefixes match (or it has none) and its ranges
//! match (or it has none). The list matches when any group does.

use nom::{
    IResult, Parser,
    character::complete::{char, digit1},
    combinator::{all_consuming, map_res, opt, recognize},
    sequence::{separated_pair, terminated},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::persist::{KvStore, StoreError};
use crate::spot::{Spot, band_by_meters};

/// Longest watch-list text accepted.
pub const MAX_SPEC_LEN: usize = 100;

const MIN_RANGE_MHZ: f64 = 1.0;
const MAX_RANGE_MHZ: f64 = 200.0;

/// Operating modifiers that are not part of a location prefix.
const CALL_MODIFIERS: &[&str] = &["P", "M", "MM", "AM", "QRP", "QRPP", "LH", "B"];

/// How a watch list affects the spots it is applied to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchListState {
    /// List is ignored.
    #[default]
    Off,
    /// Highlight matches, show everything.
    Flag,
    /// Show matches only.
    Only,
    /// Hide matches, show the rest.
    Not,
}

impl fmt::Display for WatchListState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WatchListState::Off => "off",
            WatchListState::Flag => "flag",
            WatchListState::Only => "only",
            WatchListState::Not => "not",
        };
        f.write_str(name)
    }
}

impl FromStr for WatchListState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(WatchListState::Off),
            "flag" => Ok(WatchListState::Flag),
            "only" => Ok(WatchListState::Only),
            "not" => Ok(WatchListState::Not),
            other => Err(format!("unknown watch list state '{other}'")),
        }
    }
}

/// What to do with one spot after classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Disposition {
    Show,
    Highlight,
    Suppress,
}

impl Disposition {
    pub fn is_visible(&self) -> bool {
        !matches!(self, Disposition::Suppress)
    }
}

/// Why a watch-list text was rejected.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CompileError {
    #[error("watch list is empty")]
    Empty,

    #[error("bad frequency range '{0}': use MHz min-max within 1-200")]
    BadRange(String),

    #[error("unknown band '{0}'")]
    UnknownBand(String),

    #[error("bad prefix '{0}'")]
    BadPrefix(String),

    #[error("watch list is {0} characters, the limit is 100")]
    TooLong(usize),
}

/// Inclusive frequency range in MHz.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FreqRange {
    pub min_mhz: f64,
    pub max_mhz: f64,
}

impl FreqRange {
    pub fn contains_khz(&self, khz: f64) -> bool {
        (self.min_mhz..=self.max_mhz).contains(&(khz / 1000.0))
    }
}

/// One OR-group of a compiled list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WatchGroup {
    prefixes: Vec<String>,
    ranges: Vec<FreqRange>,
}

impl WatchGroup {
    pub fn prefixes(&self) -> &[String] {
        &self.prefixes
    }

    pub fn ranges(&self) -> &[FreqRange] {
        &self.ranges
    }

    fn is_empty(&self) -> bool {
        self.prefixes.is_empty() && self.ranges.is_empty()
    }

    fn matches(&self, call: &SplitCall, khz: f64) -> bool {
        let prefix_ok = self.prefixes.is_empty()
            || self.prefixes.iter().any(|p| match p.strip_suffix('/') {
                Some(dx_prefix) => call.is_split() && call.dx.starts_with(dx_prefix),
                None => call.home.starts_with(p.as_str()),
            });
        let freq_ok = self.ranges.is_empty() || self.ranges.iter().any(|r| r.contains_khz(khz));
        prefix_ok && freq_ok
    }
}

/// A watch list ready for matching.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledWatchList {
    groups: Vec<WatchGroup>,
    canonical: String,
}

impl CompiledWatchList {
    pub fn groups(&self) -> &[WatchGroup] {
        &self.groups
    }

    pub fn matches(&self, spot: &Spot) -> bool {
        let call = split_call(&spot.tx_call);
        self.groups
            .iter()
            .any(|g| g.matches(&call, spot.frequency_khz))
    }
}

impl fmt::Display for CompiledWatchList {
    /// Upper case, one blank between tokens, `", "` between groups.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

type TokenResult<'a, O> = IResult<&'a str, O>;

fn mhz(input: &str) -> TokenResult<'_, f64> {
    map_res(recognize((digit1, opt((char('.'), digit1)))), str::parse::<f64>).parse(input)
}

fn range_token(input: &str) -> TokenResult<'_, (f64, f64)> {
    all_consuming(separated_pair(mhz, char('-'), mhz)).parse(input)
}

fn band_token(input: &str) -> TokenResult<'_, &str> {
    all_consuming(terminated(digit1, char('M'))).parse(input)
}

fn compile_range(token: &str) -> Result<FreqRange, CompileError> {
    let (_, (min_mhz, max_mhz)) =
        range_token(token).map_err(|_| CompileError::BadRange(token.to_string()))?;
    let in_limits = |v: f64| (MIN_RANGE_MHZ..=MAX_RANGE_MHZ).contains(&v);
    if !in_limits(min_mhz) || !in_limits(max_mhz) || min_mhz >= max_mhz {
        return Err(CompileError::BadRange(token.to_string()));
    }
    Ok(FreqRange { min_mhz, max_mhz })
}

fn compile_band(token: &str, digits: &str) -> Result<FreqRange, CompileError> {
    let band = digits
        .parse::<u16>()
        .ok()
        .and_then(band_by_meters)
        .ok_or_else(|| CompileError::UnknownBand(token.to_string()))?;
    Ok(FreqRange {
        min_mhz: band.min_khz / 1000.0,
        max_mhz: band.max_khz / 1000.0,
    })
}

fn check_prefix(token: &str) -> Result<(), CompileError> {
    let bad = || CompileError::BadPrefix(token.to_string());
    let body = token.strip_suffix('/').unwrap_or(token);
    if body.is_empty()
        || body.bytes().all(|b| b.is_ascii_digit())
        || !body.bytes().all(|b| b.is_ascii_alphanumeric())
    {
        return Err(bad());
    }
    Ok(())
}

/// Compile watch-list text.
///
/// Input is case-insensitive. Groups left empty by stray commas are skipped;
/// a text with no tokens at all is [`CompileError::Empty`].
pub fn compile(spec: &str) -> Result<CompiledWatchList, CompileError> {
    let spec = spec.trim();
    if spec.len() > MAX_SPEC_LEN {
        return Err(CompileError::TooLong(spec.len()));
    }
    let upper = spec.to_ascii_uppercase();

    let mut groups = Vec::new();
    let mut rendered = Vec::new();
    for group_text in upper.split(',') {
        let mut group = WatchGroup::default();
        let mut tokens = Vec::new();
        for token in group_text.split_whitespace() {
            if token.contains('-') {
                group.ranges.push(compile_range(token)?);
            } else if let Ok((_, digits)) = band_token(token) {
                group.ranges.push(compile_band(token, digits)?);
            } else {
                check_prefix(token)?;
                group.prefixes.push(token.to_string());
            }
            tokens.push(token);
        }
        if !group.is_empty() {
            groups.push(group);
            rendered.push(tokens.join(" "));
        }
    }

    if groups.is_empty() {
        return Err(CompileError::Empty);
    }
    Ok(CompiledWatchList {
        groups,
        canonical: rendered.join(", "),
    })
}

/// Whether a spot matches a compiled list.
pub fn matches(list: &CompiledWatchList, spot: &Spot) -> bool {
    list.matches(spot)
}

/// Map a watch-list state and match result onto a disposition.
pub fn classify(state: WatchListState, matched: bool) -> Disposition {
    match (state, matched) {
        (WatchListState::Off, _) => Disposition::Show,
        (WatchListState::Flag, true) => Disposition::Highlight,
        (WatchListState::Flag, false) => Disposition::Show,
        (WatchListState::Only, true) => Disposition::Show,
        (WatchListState::Only, false) => Disposition::Suppress,
        (WatchListState::Not, true) => Disposition::Suppress,
        (WatchListState::Not, false) => Disposition::Show,
    }
}

/// A callsign split into the home call and the location it operates from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitCall {
    pub home: String,
    pub dx: String,
}

impl SplitCall {
    /// True for `HOME/DX` style calls.
    pub fn is_split(&self) -> bool {
        self.home != self.dx
    }
}

/// Split a call such as `W1AW/VE1` into home `W1AW` and dx `VE1`.
///
/// Modifiers like `/P` or `/QRP` are dropped. Of two remaining parts the
/// longer is the home call; on a tie the first is the dx prefix. A lone call
/// area digit replaces the digit of the home prefix, `W1AW/4` is dx `W4`.
pub fn split_call(call: &str) -> SplitCall {
    let call = call.trim().to_ascii_uppercase();
    let parts: Vec<&str> = call
        .split('/')
        .filter(|p| !p.is_empty() && !CALL_MODIFIERS.contains(p))
        .collect();

    let (home, dx) = match parts.as_slice() {
        [] => (call.clone(), call.clone()),
        [only] => (only.to_string(), only.to_string()),
        [a, b, ..] => {
            if let Some(dx) = call_area(a, b) {
                (a.to_string(), dx)
            } else if let Some(dx) = call_area(b, a) {
                (b.to_string(), dx)
            } else if b.len() >= a.len() {
                (b.to_string(), a.to_string())
            } else {
                (a.to_string(), b.to_string())
            }
        }
    };
    SplitCall { home, dx }
}

fn call_area(home: &str, suffix: &str) -> Option<String> {
    let [digit] = suffix.as_bytes() else {
        return None;
    };
    if !digit.is_ascii_digit() {
        return None;
    }
    let pos = home.bytes().position(|b| b.is_ascii_digit())?;
    Some(format!("{}{}", &home[..pos], *digit as char))
}

/// One user watch list: its state, its text and the compiled form.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WatchList {
    state: WatchListState,
    spec: String,
    compiled: Option<CompiledWatchList>,
}

impl WatchList {
    /// Build a list. Text is compiled whenever present, so an `Off` list
    /// still rejects bad text; blank text is only accepted with `Off`.
    pub fn new(state: WatchListState, spec: &str) -> Result<Self, CompileError> {
        let spec = spec.trim();
        if spec.is_empty() {
            return match state {
                WatchListState::Off => Ok(Self::default()),
                _ => Err(CompileError::Empty),
            };
        }
        let compiled = compile(spec)?;
        Ok(Self {
            state,
            spec: spec.to_string(),
            compiled: Some(compiled),
        })
    }

    /// An `Off` list that keeps uncompilable text for later editing.
    fn disabled(spec: String) -> Self {
        Self {
            state: WatchListState::Off,
            spec,
            compiled: None,
        }
    }

    pub fn state(&self) -> WatchListState {
        self.state
    }

    pub fn spec(&self) -> &str {
        &self.spec
    }

    pub fn compiled(&self) -> Option<&CompiledWatchList> {
        self.compiled.as_ref()
    }

    pub fn matches(&self, spot: &Spot) -> bool {
        self.compiled.as_ref().is_some_and(|c| c.matches(spot))
    }

    pub fn disposition(&self, spot: &Spot) -> Disposition {
        classify(self.state, self.matches(spot))
    }
}

/// The independent watch lists a user can keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchListId {
    DxCluster,
    PskReporter,
    Pota,
    Sota,
    Adif,
}

impl WatchListId {
    pub const ALL: [WatchListId; 5] = [
        WatchListId::DxCluster,
        WatchListId::PskReporter,
        WatchListId::Pota,
        WatchListId::Sota,
        WatchListId::Adif,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            WatchListId::DxCluster => "dx_cluster",
            WatchListId::PskReporter => "psk_reporter",
            WatchListId::Pota => "pota",
            WatchListId::Sota => "sota",
            WatchListId::Adif => "adif",
        }
    }

    fn state_key(&self) -> String {
        format!("watchlist.{}.state", self.name())
    }

    fn spec_key(&self) -> String {
        format!("watchlist.{}.spec", self.name())
    }
}

impl fmt::Display for WatchListId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for WatchListId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        WatchListId::ALL
            .into_iter()
            .find(|id| id.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown watch list '{s}'"))
    }
}

/// Failure to change a watch list.
#[derive(Debug, Error)]
pub enum WatchListError {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Every watch list, backed by a [`KvStore`].
#[derive(Debug, Clone, Default)]
pub struct WatchLists {
    lists: HashMap<WatchListId, WatchList>,
}

impl WatchLists {
    /// Read every list from the store.
    ///
    /// Stored text that no longer compiles turns its list off instead of
    /// failing the load.
    pub fn load(store: &dyn KvStore) -> Self {
        let mut lists = HashMap::new();
        for id in WatchListId::ALL {
            let state = store
                .get_str(&id.state_key())
                .and_then(|s| s.parse().ok())
                .unwrap_or_default();
            let spec = store.get_str(&id.spec_key()).unwrap_or_default();
            let list = match WatchList::new(state, &spec) {
                Ok(list) => list,
                Err(e) => {
                    warn!(list = %id, error = %e, "Disabling stored watch list");
                    WatchList::disabled(spec)
                }
            };
            debug!(list = %id, state = %list.state(), spec = list.spec(), "Watch list loaded");
            lists.insert(id, list);
        }
        Self { lists }
    }

    /// The list for `id`, `Off` if never set.
    pub fn get(&self, id: WatchListId) -> WatchList {
        self.lists.get(&id).cloned().unwrap_or_default()
    }

    /// Compile and then persist a new list.
    ///
    /// On a compile error neither the stored text nor the active list change.
    pub fn set(
        &mut self,
        store: &mut dyn KvStore,
        id: WatchListId,
        state: WatchListState,
        spec: &str,
    ) -> Result<(), WatchListError> {
        let list = WatchList::new(state, spec)?;
        store.set_str(&id.spec_key(), list.spec())?;
        store.set_str(&id.state_key(), &list.state().to_string())?;
        info!(list = %id, state = %list.state(), spec = list.spec(), "Watch list saved");
        self.lists.insert(id, list);
        Ok(())
    }

    pub fn disposition(&self, id: WatchListId, spot: &Spot) -> Disposition {
        self.lists
            .get(&id)
            .map_or(Disposition::Show, |l| l.disposition(spot))
    }
}
