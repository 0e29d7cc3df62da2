//! Byte-stream framing for card scanners
//!
//! Scanners deliver keyboard-style bytes with no message boundaries. A token
//! ends at CR or LF; only printable ASCII is kept.

use tracing::{trace, warn};

use crate::types::CardReadEvent;

/// Longest token accepted before the buffer is discarded
pub const MAX_TOKEN_LEN: usize = 4096;

/// Receiver of completed card reads
pub type CardSubscriber = Box<dyn FnMut(CardReadEvent) + Send>;

/// Turns raw scanner bytes into `CardReadEvent`s
pub struct ScannerFrameParser {
    buffer: String,
    /// Set when the current token overflowed; bytes are dropped until the next terminator
    overflowed: bool,
    subscriber: Option<CardSubscriber>,
}

impl ScannerFrameParser {
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            overflowed: false,
            subscriber: None,
        }
    }

    /// Register the single subscriber, replacing any previous one
    pub fn subscribe<F>(&mut self, subscriber: F)
    where
        F: FnMut(CardReadEvent) + Send + 'static,
    {
        self.subscriber = Some(Box::new(subscriber));
    }

    /// Feed a chunk of raw bytes
    ///
    /// Events are delivered synchronously before this returns.
    /// Returns the number of events emitted.
    pub fn feed(&mut self, data: &[u8]) -> usize {
        let mut emitted = 0;

        for &byte in data {
            match byte {
                0x00 => continue,
                b'\r' | b'\n' => {
                    if self.terminate() {
                        emitted += 1;
                    }
                }
                0x20..=0x7E => self.push(byte),
                other => trace!("Dropping non-printable scanner byte 0x{:02X}", other),
            }
        }

        emitted
    }

    /// Bytes accumulated for the current, unterminated token
    pub fn pending(&self) -> &str {
        &self.buffer
    }

    fn push(&mut self, byte: u8) {
        if self.overflowed {
            return;
        }
        if self.buffer.len() >= MAX_TOKEN_LEN {
            warn!("Scanner token exceeded {} bytes without terminator, discarding", MAX_TOKEN_LEN);
            self.buffer.clear();
            self.overflowed = true;
            return;
        }
        // Printable ASCII only, so every byte is a char
        self.buffer.push(byte as char);
    }

    /// Complete the current token; true if an event was emitted
    fn terminate(&mut self) -> bool {
        if self.overflowed {
            self.overflowed = false;
            self.buffer.clear();
            return false;
        }
        if self.buffer.is_empty() {
            return false;
        }

        let raw = self.buffer.trim().to_string();
        self.buffer.clear();

        // Whitespace-only token
        if raw.is_empty() {
            return false;
        }

        let event = CardReadEvent::from_raw(raw);
        trace!("Card read: {} ({:?})", event.card_id, event.format);

        match self.subscriber.as_mut() {
            Some(subscriber) => subscriber(event),
            None => warn!("Card read with no subscriber registered, dropping"),
        }
        true
    }
}

impl Default for ScannerFrameParser {
    fn default() -> Self {
        Self::new()
    }
}
