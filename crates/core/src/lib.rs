//! Station Link Core - device channel for a point-of-sale station
//!
//! This crate provides:
//! - Wire envelope and its JSON codec
//! - Channel connection with join handshake and heartbeat
//! - Supervisor with backoff and persistent retry
//! - Scanner byte framing into card-read events
//! - Print command dispatch with guaranteed acks
//! - Device capability traits and error types

// Version constants
pub const APP_VERSION_STRING: &str = env!("CARGO_PKG_VERSION");

pub mod device;
pub mod dispatch;
pub mod error;
pub mod protocol;
pub mod scanner;
pub mod session;
pub mod transport;
pub mod types;

// Re-export common types
pub use device::{DeviceStatus, MockPrinter, PrinterCapability, ScannerCapability};
pub use dispatch::{CommandDispatcher, Outbound};
pub use error::{ConnectError, CoreError, JoinError, PrintError, Result};
pub use protocol::FrameCodec;
pub use scanner::{spawn_scanner, ScannerFrameParser};
pub use session::{Session, SessionProvider, SessionStore};
pub use transport::{
    ChannelConfig, ChannelStatus, ConnectOutcome, ConnectionSupervisor, RetryConfig, SupervisorState, WsTransport,
};
pub use types::{CardReadEvent, Envelope, InboundEvent, PrintAck, PrintCommand};
