//! Stock row transforms.
//!
//! All of these work on ASCII only and pass other bytes through untouched,
//! so they are safe on arbitrary binary rows.

/// Drop empty rows, keep everything else unchanged.
pub fn drop_empty(row: &[u8]) -> Option<Vec<u8>> {
    if row.is_empty() {
        return None;
    }
    Some(row.to_vec())
}

/// Strip leading and trailing ASCII whitespace.
pub fn trim_space(row: &[u8]) -> Option<Vec<u8>> {
    Some(row.trim_ascii().to_vec())
}

pub fn to_lower(row: &[u8]) -> Option<Vec<u8>> {
    Some(row.to_ascii_lowercase())
}

pub fn to_upper(row: &[u8]) -> Option<Vec<u8>> {
    Some(row.to_ascii_uppercase())
}

/// Upper-case the first letter of every word.
///
/// A word starts after any byte that is not alphanumeric, `_`, or non-ASCII.
pub fn title_case(row: &[u8]) -> Option<Vec<u8>> {
    let mut prev_is_separator = true;
    let out = row
        .iter()
        .map(|&b| {
            let out = if prev_is_separator {
                b.to_ascii_uppercase()
            } else {
                b
            };
            prev_is_separator = is_separator(b);
            out
        })
        .collect();
    Some(out)
}

/// Alternate upper and lower case by byte position, starting upper.
pub fn alternating_caps(row: &[u8]) -> Option<Vec<u8>> {
    let out = row
        .iter()
        .enumerate()
        .map(|(n, b)| {
            if n % 2 == 0 {
                b.to_ascii_uppercase()
            } else {
                b.to_ascii_lowercase()
            }
        })
        .collect();
    Some(out)
}

fn is_separator(b: u8) -> bool {
    !(b.is_ascii_alphanumeric() || b == b'_' || !b.is_ascii())
}
