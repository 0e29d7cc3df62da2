//! Channel envelope: the message unit exchanged with the control server

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};

/// Fixed ref of the join message so its reply can be matched deterministically
pub const JOIN_REF: &str = "join_ref_1";

/// Topic used for socket-level heartbeats
pub const PHOENIX_TOPIC: &str = "phoenix";

/// Event names recognized on the device channel
pub mod events {
    pub const PHX_JOIN: &str = "phx_join";
    pub const PHX_REPLY: &str = "phx_reply";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const PRINT_HTML: &str = "print_html";
    pub const PRINT_COMPLETED: &str = "print_completed";
    pub const CARD_SCANNED: &str = "card_scanned";
}

/// Wire envelope `{topic, event, payload, ref}`
///
/// Server pushes carry a null `ref`, so it is optional on decode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub topic: String,
    pub event: String,
    #[serde(default = "empty_payload")]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
}

fn empty_payload() -> Value {
    json!({})
}

impl Envelope {
    /// Create envelope with explicit ref
    pub fn new(
        topic: impl Into<String>,
        event: impl Into<String>,
        payload: Value,
        reference: impl Into<String>,
    ) -> Self {
        Self {
            topic: topic.into(),
            event: event.into(),
            payload,
            reference: Some(reference.into()),
        }
    }

    /// Topic of the channel owned by one device
    pub fn device_topic(device_id: &str) -> String {
        format!("device:{}", device_id)
    }

    /// Join request for `device:<device_id>` with the fixed join ref
    pub fn join(device_id: &str, token: &str) -> Self {
        Self::new(
            Self::device_topic(device_id),
            events::PHX_JOIN,
            json!({ "token": token }),
            JOIN_REF,
        )
    }

    /// Socket heartbeat on the `phoenix` topic
    pub fn heartbeat(reference: impl Into<String>) -> Self {
        Self::new(PHOENIX_TOPIC, events::HEARTBEAT, json!({}), reference)
    }

    pub fn is_reply(&self) -> bool {
        self.event == events::PHX_REPLY
    }

    /// `payload.status` of a reply, if present
    pub fn reply_status(&self) -> Option<&str> {
        self.payload.get("status").and_then(Value::as_str)
    }

    pub fn reference(&self) -> Option<&str> {
        self.reference.as_deref()
    }
}

/// Server-initiated event handed to the command consumer
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    pub event: String,
    pub payload: Value,
}

/// Generates unique outbound refs: `<event>_<unix millis>_<seq>`
///
/// The sequence suffix keeps refs unique when two messages share a millisecond.
#[derive(Debug, Default)]
pub struct RefGenerator {
    seq: AtomicU64,
}

impl RefGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self, event: &str) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        format!("{}_{}_{}", event, chrono::Utc::now().timestamp_millis(), seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_envelope() {
        let join = Envelope::join("42", "secret");
        assert_eq!(join.topic, "device:42");
        assert_eq!(join.event, "phx_join");
        assert_eq!(join.payload, json!({ "token": "secret" }));
        assert_eq!(join.reference(), Some(JOIN_REF));
    }

    #[test]
    fn test_heartbeat_envelope() {
        let hb = Envelope::heartbeat("heartbeat_1_0");
        assert_eq!(hb.topic, "phoenix");
        assert_eq!(hb.event, "heartbeat");
        assert_eq!(hb.payload, json!({}));
    }

    #[test]
    fn test_reply_status() {
        let reply = Envelope::new(
            "device:1",
            events::PHX_REPLY,
            json!({ "status": "ok", "response": {} }),
            JOIN_REF,
        );
        assert!(reply.is_reply());
        assert_eq!(reply.reply_status(), Some("ok"));
    }

    #[test]
    fn test_refs_are_unique() {
        let refs = RefGenerator::new();
        let a = refs.next("card_scanned");
        let b = refs.next("card_scanned");
        assert_ne!(a, b);
        assert!(a.starts_with("card_scanned_"));
    }
}
