//! Data structures representing normalized spots.
//!
//! A [`Spot`] is the common shape every source is reduced to, whether it
//! came from a DX cluster text line or a WSJT-X status datagram.

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A geographic position in degrees, north and east positive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatLon {
    pub lat: f64,
    pub lon: f64,
}

impl LatLon {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Whether both coordinates are within the valid ranges.
    pub fn is_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.lat) && (-180.0..=180.0).contains(&self.lon)
    }
}

/// One amateur band: name plus inclusive edges in kHz.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Band {
    pub meters: u16,
    pub min_khz: f64,
    pub max_khz: f64,
}

impl Band {
    pub fn name(&self) -> String {
        format!("{}m", self.meters)
    }

    pub fn contains_khz(&self, khz: f64) -> bool {
        (self.min_khz..=self.max_khz).contains(&khz)
    }
}

/// The fixed ham band table, low to high.
#[rustfmt::skip]
pub const BANDS: &[Band] = &[
    Band { meters: 160, min_khz: 1800.0, max_khz: 2000.0 },
    Band { meters: 80, min_khz: 3500.0, max_khz: 4000.0 },
    Band { meters: 60, min_khz: 5250.0, max_khz: 5450.0 },
    Band { meters: 40, min_khz: 7000.0, max_khz: 7300.0 },
    Band { meters: 30, min_khz: 10100.0, max_khz: 10150.0 },
    Band { meters: 20, min_khz: 14000.0, max_khz: 14350.0 },
    Band { meters: 17, min_khz: 18068.0, max_khz: 18168.0 },
    Band { meters: 15, min_khz: 21000.0, max_khz: 21450.0 },
    Band { meters: 12, min_khz: 24890.0, max_khz: 24990.0 },
    Band { meters: 10, min_khz: 28000.0, max_khz: 29700.0 },
    Band { meters: 6, min_khz: 50000.0, max_khz: 54000.0 },
    Band { meters: 2, min_khz: 144000.0, max_khz: 148000.0 },
];

/// Look up a band by its wavelength in meters.
pub fn band_by_meters(meters: u16) -> Option<&'static Band> {
    BANDS.iter().find(|b| b.meters == meters)
}

/// A reported contact or beacon, normalized across sources.
///
/// `tx_*` describes the station that was heard, `rx_*` the station that
/// heard it (the spotter, or the local operator for WSJT-X).
///
/// # Example
///
/// The cluster line
/// ```text
/// DX de KD0AA:     18100.0  JR1FYS       FT8 LOUD in FL!                2156Z EL98
/// ```
/// becomes a `Spot` with `rx_call` "KD0AA", `tx_call` "JR1FYS",
/// `frequency_khz` 18100.0, `mode` "FT8" and a 21:56 UTC `spotted_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spot {
    /// Callsign of the station that was heard, upper case.
    pub tx_call: String,
    pub tx_grid: String,
    pub tx_location: LatLon,

    /// Callsign of the station that heard it, upper case.
    pub rx_call: String,
    pub rx_grid: String,
    pub rx_location: LatLon,

    /// Short mode name such as "FT8" or "CW", empty when unknown.
    pub mode: String,

    /// Frequency as reported by the source. No band check is applied.
    pub frequency_khz: f64,

    pub spotted_at: DateTime<Utc>,

    /// Signal report when the source provides one.
    pub snr: Option<i32>,
}

impl Spot {
    /// Create an unlocated spot. Calls are upper-cased.
    pub fn new(
        tx_call: &str,
        rx_call: &str,
        frequency_khz: f64,
        spotted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            tx_call: tx_call.trim().to_ascii_uppercase(),
            tx_grid: String::new(),
            tx_location: LatLon::default(),
            rx_call: rx_call.trim().to_ascii_uppercase(),
            rx_grid: String::new(),
            rx_location: LatLon::default(),
            mode: String::new(),
            frequency_khz,
            spotted_at,
            snr: None,
        }
    }

    /// Both calls are present, the minimum for the spot store.
    pub fn has_calls(&self) -> bool {
        !self.tx_call.is_empty() && !self.rx_call.is_empty()
    }

    /// Returns the amateur band for this spot's frequency, if any.
    pub fn band(&self) -> Option<&'static Band> {
        BANDS.iter().find(|b| b.contains_khz(self.frequency_khz))
    }
}

impl fmt::Display for Spot {
    /// Renders the fixed-column cluster format, UTC time at column 70.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rx = format!("{}:", self.rx_call);
        let head = format!(
            "DX de {:<10}{:>9.1}  {:<13}{}",
            rx, self.frequency_khz, self.tx_call, self.mode
        );
        write!(
            f,
            "{:<70}{:02}{:02}Z",
            head,
            self.spotted_at.hour(),
            self.spotted_at.minute()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn make_spot(freq: f64) -> Spot {
        let at = Utc.with_ymd_and_hms(2026, 10, 17, 12, 0, 0).unwrap();
        Spot::new("w1aw", "k1ttt-#", freq, at)
    }

    #[test]
    fn test_calls_are_uppercased() {
        let spot = make_spot(14025.0);
        assert_eq!(spot.tx_call, "W1AW");
        assert_eq!(spot.rx_call, "K1TTT-#");
        assert!(spot.has_calls());
    }

    #[test]
    fn test_band_detection() {
        assert_eq!(make_spot(14025.0).band().map(Band::name), Some("20m".to_string()));
        assert_eq!(make_spot(7000.0).band().map(Band::name), Some("40m".to_string()));
        assert_eq!(make_spot(7300.0).band().map(Band::name), Some("40m".to_string()));
        assert_eq!(make_spot(6999.0).band(), None);
        assert_eq!(make_spot(144174.0).band().map(|b| b.meters), Some(2));
    }

    #[test]
    fn test_band_by_meters() {
        assert_eq!(band_by_meters(17).map(|b| b.min_khz), Some(18068.0));
        assert!(band_by_meters(11).is_none());
    }

    #[test]
    fn test_display_puts_time_at_column_70() {
        let mut spot = make_spot(18100.0);
        spot.mode = "FT8".to_string();
        let line = spot.to_string();
        assert!(line.starts_with("DX de K1TTT-#:"));
        assert_eq!(&line[70..75], "1200Z");
    }

    #[test]
    fn test_latlon_validity() {
        assert!(LatLon::new(41.7, -72.7).is_valid());
        assert!(!LatLon::new(91.0, 0.0).is_valid());
        assert!(!LatLon::new(0.0, -181.0).is_valid());
    }
}
