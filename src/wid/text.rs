//! Pull values out of PTS dialog descriptions.
//!
//! Descriptions are free text such as
//! `Please send a notification to handle = '0003'O with value '1234'O`.

use bt_hci::param::{AddrKind, BdAddr};

use crate::btp::Address;

fn words(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| !c.is_ascii_alphanumeric()).filter(|w| !w.is_empty())
}

/// Hex tokens of exactly `digits` digits, with or without a `0x` prefix.
pub fn hex_values(text: &str, digits: usize) -> Vec<u64> {
    words(text)
        .filter_map(|w| {
            let w = w.strip_prefix("0x").or_else(|| w.strip_prefix("0X")).unwrap_or(w);
            if w.len() == digits && digits <= 16 && w.chars().all(|c| c.is_ascii_hexdigit()) {
                u64::from_str_radix(w, 16).ok()
            } else {
                None
            }
        })
        .collect()
}

/// First hex token of `digits` digits.
pub fn hex_value(text: &str, digits: usize) -> Option<u64> {
    hex_values(text, digits).into_iter().next()
}

/// Decimal numbers standing on their own.
pub fn numbers(text: &str) -> Vec<u64> {
    words(text)
        .filter(|w| w.chars().all(|c| c.is_ascii_digit()))
        .filter_map(|w| w.parse().ok())
        .collect()
}

/// Contents of `'single'` or `"double"` quoted strings.
pub fn quoted(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find(|c: char| c == '\'' || c == '"') {
        let quote = &rest[start..start + 1];
        let after = &rest[start + 1..];
        match after.find(quote) {
            Some(end) => {
                out.push(&after[..end]);
                rest = &after[end + 1..];
            }
            None => break,
        }
    }
    out
}

/// Bluetooth addresses, either `AA:BB:CC:DD:EE:FF` or 12 bare hex digits,
/// most significant byte first.
pub fn addresses(text: &str) -> Vec<BdAddr> {
    text.split(|c: char| !(c.is_ascii_hexdigit() || c == ':'))
        .filter(|w| is_address(w))
        .filter_map(|w| Address::parse(AddrKind::PUBLIC, w).ok())
        .map(|a| a.addr)
        .collect()
}

fn is_address(w: &str) -> bool {
    let b = w.as_bytes();
    match b.len() {
        12 => !w.contains(':'),
        17 => (0..17).all(|i| (i % 3 == 2) == (b[i] == b':')),
        _ => false,
    }
}
