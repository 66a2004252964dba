//! Bit-interleaved (Z-order) keys over event start time, longitude and latitude.
//!
//! Layout: 96 interleaved bits (time, lon, lat per round, most significant bit
//! first) followed by an 8-byte trailer. A single byte-range scan between a
//! `Min` key and a `Max` key approximates "events near here, in this window".
//!
//! Time uses the low 32 bits of the Unix start time (seconds, clamped to
//! `0..=u32::MAX`), so keys stay ordered through 2106.

use chrono::{DateTime, TimeZone, Utc};

/// Interleaved prefix length in bytes (3 x 32 bits).
pub const PREFIX_LEN: usize = 12;
/// Full key length in bytes.
pub const KEY_LEN: usize = PREFIX_LEN + 8;

const EARTH_RADIUS_KM: f64 = 6378.0;
const MILES_PER_KM: f64 = 0.621371;

/// Trailer selection for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    /// Lower range bound.
    Min,
    /// Upper range bound.
    Max,
    /// A stored record, stamped with its index creation time.
    Point { created_at: DateTime<Utc> },
}

/// Map an IEEE-754 float onto a `u32` whose unsigned order matches numeric order.
pub fn sortable_u32(value: f32) -> u32 {
    let bits = value.to_bits();
    if value.is_sign_negative() && value != 0.0 {
        !bits
    } else {
        (bits & 0x7FFF_FFFF) ^ 0x8000_0000
    }
}

fn from_sortable_u32(sortable: u32) -> f32 {
    if sortable & 0x8000_0000 != 0 {
        f32::from_bits(sortable ^ 0x8000_0000)
    } else {
        f32::from_bits(!sortable)
    }
}

fn unix_u32(time: DateTime<Utc>) -> u32 {
    time.timestamp().clamp(0, u32::MAX as i64) as u32
}

pub fn encode(start: DateTime<Utc>, lat: f64, lon: f64, kind: IndexKind) -> [u8; KEY_LEN] {
    let streams = [
        unix_u32(start),
        sortable_u32(lon as f32),
        sortable_u32(lat as f32),
    ];

    let mut key = [0u8; KEY_LEN];
    for round in 0..32 {
        for (dim, stream) in streams.iter().enumerate() {
            let bit = (stream >> (31 - round)) & 1;
            let pos = round * 3 + dim;
            key[pos / 8] |= (bit as u8) << (7 - pos % 8);
        }
    }

    let trailer: [u8; 8] = match kind {
        IndexKind::Min => [0, 0, 0, 0, 0, 0, 0, 0xFF],
        IndexKind::Max => [0xFF; 8],
        IndexKind::Point { created_at } => (created_at.timestamp() as u64).to_be_bytes(),
    };
    key[PREFIX_LEN..].copy_from_slice(&trailer);
    key
}

/// The dimensions recovered from a key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodedKey {
    pub start: DateTime<Utc>,
    pub lat: f32,
    pub lon: f32,
    pub trailer: [u8; 8],
}

pub fn decode(key: &[u8]) -> Option<DecodedKey> {
    if key.len() != KEY_LEN {
        return None;
    }

    let mut streams = [0u32; 3];
    for round in 0..32 {
        for (dim, stream) in streams.iter_mut().enumerate() {
            let pos = round * 3 + dim;
            let bit = (key[pos / 8] >> (7 - pos % 8)) & 1;
            *stream |= (bit as u32) << (31 - round);
        }
    }

    let mut trailer = [0u8; 8];
    trailer.copy_from_slice(&key[PREFIX_LEN..]);

    Some(DecodedKey {
        start: Utc.timestamp_opt(streams[0] as i64, 0).single()?,
        lon: from_sortable_u32(streams[1]),
        lat: from_sortable_u32(streams[2]),
        trailer,
    })
}

/// Offset a center point to the upper-left or lower-right corner of a square
/// whose side is `radius_miles`.
fn corner(radius_miles: f64, lat: f64, lon: f64, upper_left: bool) -> (f64, f64) {
    let half_km = radius_miles / MILES_PER_KM / 2.0;
    let lat_offset = (half_km / EARTH_RADIUS_KM).to_degrees();
    let lon_offset = lat_offset / lat.to_radians().cos();
    if upper_left {
        (lat + lat_offset, lon - lon_offset)
    } else {
        (lat - lat_offset, lon + lon_offset)
    }
}

/// Scan bounds for events starting in `[start, end]` within roughly
/// `radius_miles` of `(lat, lon)`.
pub fn range_bounds(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    lat: f64,
    lon: f64,
    radius_miles: f64,
) -> ([u8; KEY_LEN], [u8; KEY_LEN]) {
    let (max_lat, min_lon) = corner(radius_miles, lat, lon, true);
    let (min_lat, max_lon) = corner(radius_miles, lat, lon, false);
    (
        encode(start, min_lat, min_lon, IndexKind::Min),
        encode(end, max_lat, max_lon, IndexKind::Max),
    )
}
