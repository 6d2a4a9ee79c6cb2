//! Maidenhead grid locator conversion.
//!
//! Supports 4 and 6 character locators. Decoding returns the center of
//! the square or subsquare.

use crate::spot::LatLon;

/// Check that a locator is a well-formed 4 or 6 character grid.
pub fn is_grid(grid: &str) -> bool {
    to_latlon(grid).is_some()
}

/// Convert a 4 or 6 character locator to the lat/lon of its center.
///
/// Returns `None` for anything that is not a valid locator.
pub fn to_latlon(grid: &str) -> Option<LatLon> {
    let bytes = grid.trim().as_bytes();
    if bytes.len() != 4 && bytes.len() != 6 {
        return None;
    }

    let field_lon = bytes[0].to_ascii_uppercase();
    let field_lat = bytes[1].to_ascii_uppercase();
    if !(b'A'..=b'R').contains(&field_lon) || !(b'A'..=b'R').contains(&field_lat) {
        return None;
    }
    if !bytes[2].is_ascii_digit() || !bytes[3].is_ascii_digit() {
        return None;
    }

    // Origin is -180, -90. Fields are 20x10 degrees, squares 2x1.
    let mut lon = -180.0 + f64::from(field_lon - b'A') * 20.0 + f64::from(bytes[2] - b'0') * 2.0;
    let mut lat = -90.0 + f64::from(field_lat - b'A') * 10.0 + f64::from(bytes[3] - b'0');

    if bytes.len() == 6 {
        let sub_lon = bytes[4].to_ascii_lowercase();
        let sub_lat = bytes[5].to_ascii_lowercase();
        if !(b'a'..=b'x').contains(&sub_lon) || !(b'a'..=b'x').contains(&sub_lat) {
            return None;
        }
        // Subsquares are 5' x 2.5'
        lon += f64::from(sub_lon - b'a') * (2.0 / 24.0) + 1.0 / 24.0;
        lat += f64::from(sub_lat - b'a') * (1.0 / 24.0) + 0.5 / 24.0;
    } else {
        lon += 1.0;
        lat += 0.5;
    }

    Some(LatLon::new(lat, lon))
}

/// Encode a position as a 6 character locator, e.g. "FN31pr".
pub fn from_latlon(pos: LatLon) -> Option<String> {
    if !pos.is_valid() {
        return None;
    }

    // Keep the east and north edges inside the last field.
    let lon = (pos.lon + 180.0).clamp(0.0, 359.999_999);
    let lat = (pos.lat + 90.0).clamp(0.0, 179.999_999);

    let field_lon = (lon / 20.0) as u8;
    let field_lat = (lat / 10.0) as u8;
    let square_lon = ((lon % 20.0) / 2.0) as u8;
    let square_lat = (lat % 10.0) as u8;
    let sub_lon = (((lon % 2.0) * 12.0) as u8).min(23);
    let sub_lat = (((lat % 1.0) * 24.0) as u8).min(23);

    Some(
        [
            (b'A' + field_lon) as char,
            (b'A' + field_lat) as char,
            (b'0' + square_lon) as char,
            (b'0' + square_lat) as char,
            (b'a' + sub_lon) as char,
            (b'a' + sub_lat) as char,
        ]
        .iter()
        .collect(),
    )
}
