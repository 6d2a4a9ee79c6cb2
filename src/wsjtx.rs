//! WSJT-X UDP datagram codec.
//!
//! WSJT-X broadcasts its state as big-endian Qt `QDataStream` records:
//!
//! ```text
//! magic u32 (0xADBCCBDA) | schema u32 | type u32 | id utf8 | payload...
//! ```
//!
//! Only the Status message (type 1) is decoded. Every read goes through
//! [`Cursor`], which checks the remaining length first, so a short or
//! hostile datagram can only ever produce `None`.

use tracing::trace;

use crate::maidenhead;
use crate::spot::LatLon;

/// WSJT-X magic number.
pub const WSJTX_MAGIC: u32 = 0xadbc_cbda;

/// Highest schema number this decoder was written against.
pub const KNOWN_SCHEMA: u32 = 3;

/// Status message type.
pub const MSG_STATUS: u32 = 1;

/// Length prefix marking a null string.
const NULL_STRING: u32 = 0xffff_ffff;

/// Bounds-checked big-endian reader over a datagram.
#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let bytes = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(bytes)
    }

    fn take_array<const N: usize>(&mut self) -> Option<[u8; N]> {
        self.take(N)?.try_into().ok()
    }

    pub fn read_bool(&mut self) -> Option<bool> {
        self.take_array::<1>().map(|[b]| b != 0)
    }

    pub fn read_u32(&mut self) -> Option<u32> {
        self.take_array().map(u32::from_be_bytes)
    }

    pub fn read_u64(&mut self) -> Option<u64> {
        self.take_array().map(u64::from_be_bytes)
    }

    /// Read a length-prefixed UTF-8 string. The null marker reads as empty.
    pub fn read_utf8(&mut self) -> Option<String> {
        let len = self.read_u32()?;
        if len == NULL_STRING {
            return Some(String::new());
        }
        let bytes = self.take(usize::try_from(len).ok()?)?;
        Some(String::from_utf8_lossy(bytes).into_owned())
    }
}

/// Writer for the same grammar [`Cursor`] reads.
#[derive(Debug, Default)]
struct Writer {
    out: Vec<u8>,
}

impl Writer {
    fn bool(&mut self, v: bool) -> &mut Self {
        self.out.push(u8::from(v));
        self
    }

    fn u32(&mut self, v: u32) -> &mut Self {
        self.out.extend_from_slice(&v.to_be_bytes());
        self
    }

    fn u64(&mut self, v: u64) -> &mut Self {
        self.out.extend_from_slice(&v.to_be_bytes());
        self
    }

    fn utf8(&mut self, s: &str) -> &mut Self {
        if s.is_empty() {
            return self.u32(NULL_STRING);
        }
        // Status fields are short; a string over 4 GiB cannot be produced here.
        self.u32(s.len() as u32);
        self.out.extend_from_slice(s.as_bytes());
        self
    }
}

/// The fields of a Status message this crate cares about.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusMessage {
    /// Client id, e.g. "WSJT-X".
    pub id: String,
    /// Dial frequency in Hz, never zero.
    pub frequency_hz: u64,
    pub mode: String,
    /// The station being worked.
    pub dx_call: String,
    pub dx_grid: String,
    pub dx_location: LatLon,
    /// The local operator.
    pub de_call: String,
    pub de_grid: String,
    pub de_location: LatLon,
}

impl StatusMessage {
    /// Dial frequency in kHz.
    pub fn frequency_khz(&self) -> f64 {
        self.frequency_hz as f64 / 1000.0
    }

    /// Encode as a Status datagram in the layout [`decode_datagram`] reads.
    ///
    /// Fields WSJT-X sends but this crate ignores are written as empty or zero.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::default();
        w.u32(WSJTX_MAGIC)
            .u32(KNOWN_SCHEMA)
            .u32(MSG_STATUS)
            .utf8(&self.id)
            .u64(self.frequency_hz)
            .utf8(&self.mode)
            .utf8(&self.dx_call)
            .utf8("") // report
            .utf8(&self.mode) // tx mode
            .bool(false) // tx enabled
            .bool(false) // transmitting
            .bool(false) // decoding
            .u32(0) // rx df
            .u32(0) // tx df
            .utf8(&self.de_call)
            .utf8(&self.de_grid)
            .utf8(&self.dx_grid);
        w.out
    }
}

/// Decode one datagram.
///
/// Returns `None` for bad magic, any message other than Status, a zero
/// frequency, a grid that is not a valid locator, or too few bytes for any
/// field.
pub fn decode_datagram(bytes: &[u8]) -> Option<StatusMessage> {
    let mut cur = Cursor::new(bytes);

    if cur.read_u32()? != WSJTX_MAGIC {
        return None;
    }
    let schema = cur.read_u32()?;
    if schema > KNOWN_SCHEMA {
        trace!(schema, "newer WSJT-X schema, decoding known fields only");
    }
    let msg_type = cur.read_u32()?;
    if msg_type != MSG_STATUS {
        trace!(msg_type, "ignoring WSJT-X message");
        return None;
    }

    let id = cur.read_utf8()?;
    let frequency_hz = cur.read_u64()?;
    let mode = cur.read_utf8()?;
    let dx_call = cur.read_utf8()?;
    let _report = cur.read_utf8()?;
    let _tx_mode = cur.read_utf8()?;
    let _tx_enabled = cur.read_bool()?;
    let _transmitting = cur.read_bool()?;
    let _decoding = cur.read_bool()?;
    let _rx_df = cur.read_u32()?;
    let _tx_df = cur.read_u32()?;
    let de_call = cur.read_utf8()?;
    let de_grid = cur.read_utf8()?;
    let dx_grid = cur.read_utf8()?;

    if frequency_hz == 0 {
        return None;
    }
    let de_location = maidenhead::to_latlon(&de_grid)?;
    let dx_location = maidenhead::to_latlon(&dx_grid)?;

    Some(StatusMessage {
        id,
        frequency_hz,
        mode,
        dx_call: dx_call.trim().to_ascii_uppercase(),
        dx_grid,
        dx_location,
        de_call: de_call.trim().to_ascii_uppercase(),
        de_grid,
        de_location,
    })
}

/// Decode a batch of datagrams received in one drain cycle.
///
/// Only the last Status that decodes is kept; WSJT-X status is a snapshot
/// of the current state, so older ones in the same batch are stale.
pub fn decode_latest<'a, I>(datagrams: I) -> Option<StatusMessage>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    datagrams.into_iter().filter_map(decode_datagram).last()
}
