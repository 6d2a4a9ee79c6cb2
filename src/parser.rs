//! Parser for DX cluster spot lines.
//!
//! This module uses the `nom` parsing library for the leading fields of a
//! cluster spot. Everything after the DX call is free text except the UTC
//! time of day, which sits at a fixed column.
//!
//! # Spot Format
//!
//! ```text
//! DX de SPOTTER:  FREQ  DXCALL  COMMENT...                      HHMMZ [LOC]
//! ```
//!
//! Example:
//! ```text
//! DX de KD0AA:     18100.0  JR1FYS       FT8 LOUD in FL!                2156Z EL98
//! ```

use chrono::{DateTime, Duration, NaiveTime, Utc};
use nom::{
    IResult, Parser,
    bytes::complete::{tag_no_case, take_while1},
    character::complete::{char, digit1, multispace1, space0, space1},
    combinator::{map_res, opt, recognize, value},
    sequence::terminated,
};
use thiserror::Error;

use crate::spot::Spot;

/// Longest callsign accepted in either call field.
pub const MAX_CALL_LEN: usize = 11;

/// Column of the `HHMMZ` field in a standard width spot line.
pub const TIME_COLUMN: usize = 70;

/// How far in the future a time of day may be before it is taken as yesterday.
const FUTURE_SLACK_MINUTES: i64 = 5;

/// Text fragments servers emit when a second login with our call is seen.
///
/// This is a heuristic. No cluster dialect has a structured signal for it,
/// so a match only changes the wording of the failure shown to the user.
pub const MULTI_LOGIN_BREADCRUMBS: &[&str] = &["econnected", "Dupe call"];

/// Mode names recognized in the spot comment.
const KNOWN_MODES: &[&str] = &[
    "CW", "SSB", "USB", "LSB", "AM", "FM", "RTTY", "FT8", "FT4", "JT65", "JT9", "PSK31", "PSK",
    "MSK144", "Q65", "JS8", "OLIVIA", "SSTV", "DATA", "DIGI",
];

/// Errors that can occur while parsing a cluster line.
#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("malformed spot line: {0}")]
    Malformed(String),

    #[error("callsign longer than 11 characters: {0}")]
    CallTooLong(String),

    #[error("no HHMMZ time found")]
    MissingTime,

    #[error("invalid time: {0}")]
    InvalidTime(String),
}

/// Result type for parsing operations.
pub type ParseResult<T> = Result<T, ParseError>;

fn is_spotter_char(c: char) -> bool {
    c != ':' && !c.is_whitespace()
}

/// Parse the "DX de " prefix that starts every spot line.
fn parse_dx_de_prefix(input: &str) -> IResult<&str, ()> {
    value(
        (),
        (
            tag_no_case("DX"),
            multispace1,
            tag_no_case("de"),
            multispace1,
        ),
    )
    .parse(input)
}

/// Parse the spotter callsign followed by a colon.
fn parse_spotter(input: &str) -> IResult<&str, &str> {
    terminated(take_while1(is_spotter_char), (char(':'), space0)).parse(input)
}

/// Parse a floating-point frequency in kHz.
fn parse_frequency(input: &str) -> IResult<&str, f64> {
    map_res(recognize((digit1, opt((char('.'), digit1)))), |s: &str| {
        s.parse::<f64>()
    })
    .parse(input)
}

/// Parse the DX callsign.
fn parse_callsign(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| !c.is_whitespace()).parse(input)
}

/// Parse `DX de RX: FREQ TX`, leaving the comment.
fn parse_header(input: &str) -> IResult<&str, (&str, f64, &str)> {
    let (input, _) = parse_dx_de_prefix(input)?;
    let (input, rx_call) = parse_spotter(input)?;
    let (input, frequency_khz) = parse_frequency(input)?;
    let (input, _) = space1(input)?;
    let (input, tx_call) = parse_callsign(input)?;
    Ok((input, (rx_call, frequency_khz, tx_call)))
}

/// Whether a token has the `HHMMZ` shape, regardless of value.
fn is_time_token(token: &str) -> bool {
    let b = token.as_bytes();
    b.len() == 5 && b[..4].iter().all(u8::is_ascii_digit) && b[4].eq_ignore_ascii_case(&b'Z')
}

fn time_of_day(token: &str) -> ParseResult<NaiveTime> {
    let hour: u32 = token[0..2]
        .parse()
        .map_err(|_| ParseError::InvalidTime(token.to_string()))?;
    let min: u32 = token[2..4]
        .parse()
        .map_err(|_| ParseError::InvalidTime(token.to_string()))?;
    NaiveTime::from_hms_opt(hour, min, 0).ok_or_else(|| ParseError::InvalidTime(token.to_string()))
}

/// Locate the time of day: the fixed column first, else the last `HHMMZ` token.
///
/// Returns the time and the byte offset where it starts.
fn find_time(line: &str) -> ParseResult<(NaiveTime, usize)> {
    if let Some(token) = line.get(TIME_COLUMN..TIME_COLUMN + 5)
        && is_time_token(token)
    {
        return Ok((time_of_day(token)?, TIME_COLUMN));
    }

    let mut found = None;
    let mut offset = 0;
    for token in line.split(' ') {
        if is_time_token(token) {
            found = Some((token, offset));
        }
        offset += token.len() + 1;
    }

    match found {
        Some((token, at)) => Ok((time_of_day(token)?, at)),
        None => Err(ParseError::MissingTime),
    }
}

/// Pick the first known mode name out of a spot comment.
fn mode_from_comment(comment: &str) -> String {
    comment
        .split_whitespace()
        .map(str::to_ascii_uppercase)
        .find(|word| KNOWN_MODES.contains(&word.as_str()))
        .unwrap_or_default()
}

/// Combine a time of day with the UTC date of `now`.
///
/// A time more than a few minutes ahead of `now` belongs to the previous day.
fn spot_datetime(time: NaiveTime, now: DateTime<Utc>) -> DateTime<Utc> {
    let at = now.date_naive().and_time(time).and_utc();
    if at > now + Duration::minutes(FUTURE_SLACK_MINUTES) {
        at - Duration::days(1)
    } else {
        at
    }
}

/// Parse a cluster spot line received at `now`.
///
/// The returned spot has calls, frequency, mode and time but no location;
/// see [`crate::locate`] for that step.
///
/// # Example
///
/// ```
/// use chrono::{TimeZone, Timelike, Utc};
/// use dxwatch::parser::parse_cluster_line;
///
/// let now = Utc.with_ymd_and_hms(2026, 10, 17, 22, 0, 0).unwrap();
/// let line = "DX de KD0AA:     18100.0  JR1FYS       FT8 LOUD in FL!                2156Z EL98";
/// let spot = parse_cluster_line(line, now).unwrap();
/// assert_eq!(spot.rx_call, "KD0AA");
/// assert_eq!(spot.tx_call, "JR1FYS");
/// assert_eq!(spot.spotted_at.hour(), 21);
/// ```
pub fn parse_cluster_line(line: &str, now: DateTime<Utc>) -> ParseResult<Spot> {
    let line = line.trim_end();
    let body = line.trim_start();

    let (rest, (rx_call, frequency_khz, tx_call)) =
        parse_header(body).map_err(|e| ParseError::Malformed(format!("{:?}", e)))?;

    for call in [rx_call, tx_call] {
        if call.len() > MAX_CALL_LEN {
            return Err(ParseError::CallTooLong(call.to_string()));
        }
    }

    let (time, time_at) = find_time(line)?;

    // The comment runs from the DX call to the time field.
    let comment_start = line.len() - rest.len();
    let comment = line.get(comment_start..time_at).unwrap_or("");

    let mut spot = Spot::new(tx_call, rx_call, frequency_khz, spot_datetime(time, now));
    spot.mode = mode_from_comment(comment);
    Ok(spot)
}

/// Parse a cluster spot line received now.
pub fn parse_spot(line: &str) -> ParseResult<Spot> {
    parse_cluster_line(line, Utc::now())
}

/// Check if a line looks like a spot (quick pre-filter).
#[inline]
pub fn looks_like_spot(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.len() > 20 && trimmed.get(..6).is_some_and(|p| p.eq_ignore_ascii_case("DX de "))
}

/// Scan any received line for the multiple-login breadcrumbs.
pub fn mentions_multi_login(line: &str) -> bool {
    MULTI_LOGIN_BREADCRUMBS.iter().any(|crumb| line.contains(crumb))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 17, 22, 0, 0).unwrap()
    }

    #[test]
    fn test_parse_dxspider_line_with_locator() {
        let line = "DX de KD0AA:     18100.0  JR1FYS       FT8 LOUD in FL!                2156Z EL98";
        let spot = parse_cluster_line(line, now()).expect("Should parse successfully");

        assert_eq!(spot.rx_call, "KD0AA");
        assert_eq!(spot.tx_call, "JR1FYS");
        assert!((spot.frequency_khz - 18100.0).abs() < 0.01);
        assert_eq!(spot.mode, "FT8");
        assert_eq!(spot.spotted_at.hour(), 21);
        assert_eq!(spot.spotted_at.minute(), 56);
        assert_eq!(spot.spotted_at.date_naive(), now().date_naive());
        assert!(spot.tx_grid.is_empty());
    }

    #[test]
    fn test_parse_rbn_skimmer_line() {
        let line = "DX de EA5WU-#:    7018.3  RW1M           CW    19 dB  18 WPM  CQ      2159Z";
        let spot = parse_cluster_line(line, now()).expect("Should parse successfully");

        assert_eq!(spot.rx_call, "EA5WU-#");
        assert_eq!(spot.tx_call, "RW1M");
        assert_eq!(spot.mode, "CW");
        assert_eq!(spot.spotted_at.hour(), 21);
        assert_eq!(spot.spotted_at.minute(), 59);
    }

    #[test]
    fn test_calls_are_normalized_to_upper_case() {
        let line = "dx de k1ttt:     14025.0  w1aw/ve1     cw                             2100z";
        let spot = parse_cluster_line(line, now()).expect("Should parse case-insensitively");
        assert_eq!(spot.rx_call, "K1TTT");
        assert_eq!(spot.tx_call, "W1AW/VE1");
        assert_eq!(spot.mode, "CW");
    }

    #[test]
    fn test_short_line_uses_last_time_token() {
        let line = "DX de W3LPL: 14025.0 K1ABC up 2 1830Z";
        let spot = parse_cluster_line(line, now()).expect("Should parse");
        assert_eq!(spot.spotted_at.hour(), 18);
        assert_eq!(spot.spotted_at.minute(), 30);
        assert_eq!(spot.mode, "");
    }

    #[test]
    fn test_time_after_now_is_yesterday() {
        let line = "DX de W3LPL: 14025.0 K1ABC CW 2355Z";
        let early = Utc.with_ymd_and_hms(2026, 10, 18, 0, 3, 0).unwrap();
        let spot = parse_cluster_line(line, early).expect("Should parse");
        assert_eq!(
            spot.spotted_at,
            Utc.with_ymd_and_hms(2026, 10, 17, 23, 55, 0).unwrap()
        );
    }

    #[test]
    fn test_malformed_lines() {
        assert!(matches!(
            parse_cluster_line("Hello N0CALL, welcome", now()),
            Err(ParseError::Malformed(_))
        ));
        assert!(matches!(
            parse_cluster_line("DX de : 14025.0 K1ABC 1830Z", now()),
            Err(ParseError::Malformed(_))
        ));
        assert!(matches!(
            parse_cluster_line("DX de W3LPL: abc K1ABC 1830Z", now()),
            Err(ParseError::Malformed(_))
        ));
        assert!(parse_cluster_line("", now()).is_err());
    }

    #[test]
    fn test_missing_and_invalid_time() {
        assert_eq!(
            parse_cluster_line("DX de W3LPL: 14025.0 K1ABC CQ", now()),
            Err(ParseError::MissingTime)
        );
        assert!(matches!(
            parse_cluster_line("DX de W3LPL: 14025.0 K1ABC CQ 2575Z", now()),
            Err(ParseError::InvalidTime(_))
        ));
    }

    #[test]
    fn test_overlong_call_rejected() {
        let line = "DX de W3LPL: 14025.0 ABCDEFGHIJKL CQ 1830Z";
        assert_eq!(
            parse_cluster_line(line, now()),
            Err(ParseError::CallTooLong("ABCDEFGHIJKL".to_string()))
        );
    }

    #[test]
    fn test_display_output_parses_back() {
        let line = "DX de KD0AA:     18100.0  JR1FYS       FT8 LOUD in FL!                2156Z EL98";
        let spot = parse_cluster_line(line, now()).unwrap();
        let echoed = parse_cluster_line(&spot.to_string(), now()).unwrap();
        assert_eq!(echoed, spot);
    }

    #[test]
    fn test_looks_like_spot() {
        assert!(looks_like_spot(
            "DX de EA5WU-#:    7018.3  RW1M           CW    19 dB  18 WPM  CQ      2259Z"
        ));
        assert!(looks_like_spot("  dx de W3LPL: 14025.0 K1ABC up 2 1830Z  "));
        assert!(!looks_like_spot("Hello world"));
        assert!(!looks_like_spot(""));
        assert!(!looks_like_spot("DX de "));
    }

    // Heuristic only: these are the phrasings seen from DXSpider and AR-Cluster.
    #[test]
    fn test_multi_login_breadcrumbs() {
        assert!(mentions_multi_login("N0CALL reconnected from another node"));
        assert!(mentions_multi_login("Dupe call N0CALL, disconnecting"));
        assert!(!mentions_multi_login("Hello N0CALL, this is GB7DJK"));
        assert!(!mentions_multi_login(""));
    }
}
