//! Line scanner for search engine output.
//!
//! The engine prints free-form progress text. Two line shapes matter:
//!
//! ```text
//!   Time:  12s Score:  10 Private: 0x<64 hex> Address: 0x<40 hex>
//!   Transaction Hash: 0x<64 hex>
//! ```
//!
//! The first is a match; the second only appears when the engine also funds
//! the found address. Everything else is ignored.
//!
//! Progress is redrawn in place with `\r`, so both `\r` and `\n` end a line.

use std::io::{self, BufRead};

/// Longest line kept from the engine; longer lines keep their end.
pub const MAX_LINE_LEN: usize = 4096;

const PRIVATE_MARKER: &str = "private: 0x";
const ADDRESS_MARKER: &str = "address: 0x";
const TX_HASH_MARKER: &str = "transaction hash: 0x";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    /// Offset scalar and the address the engine claims it produces.
    Match { offset: String, address: String },
    TransactionHash(String),
}

/// Reads `len` hex digits right after `marker`, lowercased.
fn hex_after(line: &str, marker: &str, len: usize) -> Option<(String, usize)> {
    let start = line.find(marker)? + marker.len();
    let digits = line.get(start..start + len)?;
    if !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    // A longer hex run is a different token.
    if line[start + len..]
        .bytes()
        .next()
        .is_some_and(|b| b.is_ascii_hexdigit())
    {
        return None;
    }
    Some((digits.to_ascii_lowercase(), start + len))
}

/// Classifies one line of engine output.
pub fn scan_line(line: &str) -> Option<ScanEvent> {
    let lowered = line.to_ascii_lowercase();

    if let Some((hash, _)) = hex_after(&lowered, TX_HASH_MARKER, 64) {
        return Some(ScanEvent::TransactionHash(format!("0x{}", hash)));
    }

    let (offset, end) = hex_after(&lowered, PRIVATE_MARKER, 64)?;
    let (address, _) = hex_after(&lowered[end..], ADDRESS_MARKER, 40)?;
    Some(ScanEvent::Match { offset, address })
}

/// Reads one line ended by `\r` or `\n` into `line`, without the
/// terminator. At most the last [`MAX_LINE_LEN`] bytes are held.
///
/// Returns the number of bytes consumed, `0` at end of input.
pub fn read_line_bounded(reader: &mut impl BufRead, line: &mut Vec<u8>) -> io::Result<usize> {
    line.clear();
    let mut consumed = 0;
    loop {
        let available = match reader.fill_buf() {
            Ok(available) => available,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        if available.is_empty() {
            return Ok(consumed);
        }

        let (used, done) = match available.iter().position(|&b| b == b'\n' || b == b'\r') {
            Some(end) => {
                line.extend_from_slice(&available[..end]);
                (end + 1, true)
            }
            None => {
                line.extend_from_slice(available);
                (available.len(), false)
            }
        };
        reader.consume(used);
        consumed += used;

        if line.len() > MAX_LINE_LEN {
            line.drain(..line.len() - MAX_LINE_LEN);
        }
        if done {
            return Ok(consumed);
        }
    }
}
