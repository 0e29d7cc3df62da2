//! Domain types for the device channel

mod card;
mod envelope;
mod print;

pub use card::{detect_format, extract_card_id, CardFormat, CardReadEvent};
pub use envelope::{events, Envelope, InboundEvent, RefGenerator, JOIN_REF, PHOENIX_TOPIC};
pub use print::{PrintAck, PrintCommand, PrintId, PrintOptions, PrintStatus};

/// Current UTC time as ISO-8601 with milliseconds (`2024-01-01T00:00:00.000Z`)
pub fn timestamp_now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
