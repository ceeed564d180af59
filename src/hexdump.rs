use std::fmt::{self, Write as _};

pub const DEFAULT_BYTES_PER_ROW: usize = 16;

const PLACEHOLDER: char = '.';

/// One rendered line of a hex dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HexRow {
    pub offset: usize,
    /// Space separated octets, padded to the full row width.
    pub hex: String,
    /// Printable ASCII gloss of the same octets (not padded).
    pub ascii: String,
}

impl fmt::Display for HexRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}  {}  |{}|", self.offset, self.hex, self.ascii)
    }
}

/// Splits `bytes` into rows of at most `bytes_per_row` octets.
///
/// A `bytes_per_row` of zero is treated as one; configuration validation
/// rejects it before it can reach here.
pub fn format_rows(bytes: &[u8], bytes_per_row: usize) -> Vec<HexRow> {
    let width = bytes_per_row.max(1);
    bytes
        .chunks(width)
        .enumerate()
        .map(|(index, row)| {
            let mut hex = hex_string(row);
            let missing = width - row.len();
            // "XX" plus the separating space per absent octet
            hex.extend(std::iter::repeat(' ').take(missing * 3));
            HexRow {
                offset: index * width,
                hex,
                ascii: ascii_gloss(row),
            }
        })
        .collect()
}

/// Uppercase octets separated by single spaces.
pub fn hex_string(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, byte) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{byte:02X}");
    }
    out
}

/// Printable ASCII (0x20..=0x7E) kept verbatim, everything else replaced by `.`.
pub fn ascii_gloss(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| {
            if (0x20..=0x7e).contains(&b) {
                b as char
            } else {
                PLACEHOLDER
            }
        })
        .collect()
}
