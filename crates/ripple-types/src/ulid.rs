//! Sortable message ids: 26-char Crockford base32 strings whose first 10
//! characters encode a millisecond timestamp, so lexicographic order equals
//! creation order and the creation time can be decoded back out.

use chrono::{DateTime, TimeZone, Utc};
use rand::Rng;

const ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";
const TIME_CHARS: usize = 10;
const RAND_CHARS: usize = 16;
pub const ID_LEN: usize = TIME_CHARS + RAND_CHARS;

/// Generate a fresh id for the current instant.
pub fn generate() -> String {
    from_timestamp(Utc::now())
}

/// Generate an id whose timestamp prefix encodes `at`, with a random tail.
pub fn from_timestamp(at: DateTime<Utc>) -> String {
    let mut rng = rand::rng();
    let mut out = encode_time(at.timestamp_millis().max(0) as u64);
    for _ in 0..RAND_CHARS {
        out.push(ALPHABET[rng.random_range(0..32) as usize] as char);
    }
    out
}

/// The smallest possible id for `at`: timestamp prefix with an all-zero
/// tail. Every id created at or after `at` compares >= this bound.
pub fn min_for_timestamp(at: DateTime<Utc>) -> String {
    let mut out = encode_time(at.timestamp_millis().max(0) as u64);
    for _ in 0..RAND_CHARS {
        out.push('0');
    }
    out
}

/// Decode the creation time from an id's timestamp prefix. Returns `None`
/// for ids that are too short or contain characters outside the alphabet.
pub fn decode_timestamp(id: &str) -> Option<DateTime<Utc>> {
    let bytes = id.as_bytes();
    if bytes.len() < TIME_CHARS {
        return None;
    }
    let mut millis: u64 = 0;
    for &b in &bytes[..TIME_CHARS] {
        millis = (millis << 5) | u64::from(decode_char(b)?);
    }
    Utc.timestamp_millis_opt(millis as i64).single()
}

fn encode_time(mut millis: u64) -> String {
    let mut buf = [b'0'; TIME_CHARS];
    for slot in buf.iter_mut().rev() {
        *slot = ALPHABET[(millis & 0x1F) as usize];
        millis >>= 5;
    }
    String::from_utf8_lossy(&buf).into_owned()
}

fn decode_char(c: u8) -> Option<u8> {
    let c = c.to_ascii_uppercase();
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'A'..=b'H' => Some(c - b'A' + 10),
        b'J' | b'K' => Some(c - b'J' + 18),
        b'M' | b'N' => Some(c - b'M' + 20),
        b'P'..=b'T' => Some(c - b'P' + 22),
        b'V'..=b'Z' => Some(c - b'V' + 27),
        _ => None,
    }
}
