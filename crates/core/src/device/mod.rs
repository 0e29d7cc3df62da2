//! Device capability interfaces
//!
//! The channel core talks to hardware only through these traits. Real
//! drivers and simulated devices are interchangeable implementations.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::io::AsyncRead;

use crate::error::{PrintError, Result};
use crate::types::PrintOptions;

/// Boxed byte source produced by a scanner
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// Device availability as reported on the status surface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub available: bool,
    pub ready: bool,
    /// `ready`, `mock_mode`, `disconnected`, `error`, `not_initialized`
    pub status: String,
}

impl DeviceStatus {
    pub fn new(available: bool, ready: bool, status: impl Into<String>) -> Self {
        Self {
            available,
            ready,
            status: status.into(),
        }
    }

    pub fn not_initialized() -> Self {
        Self::new(false, false, "not_initialized")
    }
}

/// Receipt printer
#[async_trait]
pub trait PrinterCapability: Send + Sync {
    fn is_ready(&self) -> bool;

    fn status(&self) -> DeviceStatus;

    /// Print an HTML document
    async fn print_html(&self, html: &str, options: &PrintOptions) -> std::result::Result<(), PrintError>;
}

/// Card scanner
#[async_trait]
pub trait ScannerCapability: Send + Sync {
    fn is_ready(&self) -> bool;

    fn status(&self) -> DeviceStatus;

    /// Open the raw byte stream of the peripheral
    async fn open(&self) -> Result<ByteStream>;
}

/// Mock printer for testing
pub struct MockPrinter {
    ready: AtomicBool,
    failure: Mutex<Option<String>>,
    panic_on_print: AtomicBool,
    printed: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl MockPrinter {
    /// Create ready mock printer
    pub fn new() -> Self {
        Self {
            ready: AtomicBool::new(true),
            failure: Mutex::new(None),
            panic_on_print: AtomicBool::new(false),
            printed: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Make subsequent prints fail with `message`
    pub fn fail_with(&self, message: impl Into<String>) {
        if let Ok(mut failure) = self.failure.lock() {
            *failure = Some(message.into());
        }
    }

    /// Make subsequent prints panic inside the driver
    pub fn panic_on_print(&self) {
        self.panic_on_print.store(true, Ordering::SeqCst);
    }

    /// Number of `print_html` invocations
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Documents printed successfully
    pub fn printed(&self) -> Vec<String> {
        self.printed.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

impl Default for MockPrinter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PrinterCapability for MockPrinter {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn status(&self) -> DeviceStatus {
        let ready = self.is_ready();
        DeviceStatus::new(true, ready, if ready { "mock_mode" } else { "error" })
    }

    async fn print_html(&self, html: &str, _options: &PrintOptions) -> std::result::Result<(), PrintError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.panic_on_print.load(Ordering::SeqCst) {
            panic!("mock printer driver crashed");
        }
        if let Some(message) = self.failure.lock().ok().and_then(|f| f.clone()) {
            return Err(PrintError::Failed(message));
        }
        if let Ok(mut printed) = self.printed.lock() {
            printed.push(html.to_string());
        }
        Ok(())
    }
}
