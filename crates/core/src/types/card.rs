//! Card-read events produced by the scanner

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::timestamp_now;

/// Card number layout detected from the raw token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardFormat {
    Numeric,
    Hex,
    PrefixedNumeric,
    Unknown,
}

/// One completed scanner read, as sent in `card_scanned`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CardReadEvent {
    pub raw_data: String,
    pub card_id: String,
    pub format: CardFormat,
    /// ISO-8601 UTC with milliseconds
    pub timestamp: String,
}

impl CardReadEvent {
    /// Build event from a terminated, trimmed raw token
    pub fn from_raw(raw: impl Into<String>) -> Self {
        let raw_data = raw.into();
        Self {
            card_id: extract_card_id(&raw_data),
            format: detect_format(&raw_data),
            timestamp: timestamp_now(),
            raw_data,
        }
    }
}

/// Extract the card id.
///
/// Checked in order: uppercase prefix + digits yields the digits, all digits
/// yields the token, hex yields the lower-cased token, anything else is kept.
pub fn extract_card_id(raw: &str) -> String {
    if let Some(digits) = prefixed_digits(raw) {
        return digits.to_string();
    }
    if is_numeric(raw) {
        return raw.to_string();
    }
    if is_hex(raw) {
        return raw.to_ascii_lowercase();
    }
    raw.to_string()
}

/// Classify the raw token: numeric, then hex, then prefixed numeric.
///
/// A token like `ABC123` therefore reports `hex` while its id comes from the
/// prefixed rule.
pub fn detect_format(raw: &str) -> CardFormat {
    if is_numeric(raw) {
        CardFormat::Numeric
    } else if is_hex(raw) {
        CardFormat::Hex
    } else if prefixed_digits(raw).is_some() {
        CardFormat::PrefixedNumeric
    } else {
        CardFormat::Unknown
    }
}

static PREFIXED_NUMERIC: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"^[A-Z]+([0-9]+)$").ok());
static NUMERIC: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"^[0-9]+$").ok());
static HEX: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"^[0-9A-Fa-f]+$").ok());

/// Digit group of an uppercase-prefixed token
fn prefixed_digits(raw: &str) -> Option<&str> {
    let captures = PREFIXED_NUMERIC.as_ref()?.captures(raw)?;
    captures.get(1).map(|digits| digits.as_str())
}

fn is_numeric(s: &str) -> bool {
    NUMERIC.as_ref().is_some_and(|re| re.is_match(s))
}

fn is_hex(s: &str) -> bool {
    HEX.as_ref().is_some_and(|re| re.is_match(s))
}
