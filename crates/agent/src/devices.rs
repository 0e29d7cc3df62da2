//! Device implementations for the station
//!
//! Printers:
//! - `SimulatedPrinter`: logs a preview and succeeds (or reports offline)
//! - `SpoolPrinter`: drops each document into a directory for an external renderer
//!
//! Scanners:
//! - `DeviceScanner`: raw byte device such as `/dev/hidraw0`
//! - `StdinScanner`: typed lines on stdin stand in for a card reader

use async_trait::async_trait;
use stationlink_core::device::ByteStream;
use stationlink_core::types::PrintOptions;
use stationlink_core::{DeviceStatus, PrintError, PrinterCapability, ScannerCapability};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info};

/// Characters of a document shown in mock-print logs
const PREVIEW_CHARS: usize = 100;

fn preview(html: &str) -> String {
    let mut preview: String = html.chars().take(PREVIEW_CHARS).collect();
    if html.chars().count() > PREVIEW_CHARS {
        preview.push_str("...");
    }
    preview
}

/// Printer with no hardware behind it
pub struct SimulatedPrinter {
    online: AtomicBool,
}

impl SimulatedPrinter {
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
        }
    }
}

#[async_trait]
impl PrinterCapability for SimulatedPrinter {
    fn is_ready(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn status(&self) -> DeviceStatus {
        if self.is_ready() {
            DeviceStatus::new(true, true, "mock_mode")
        } else {
            DeviceStatus::new(true, false, "disconnected")
        }
    }

    async fn print_html(&self, html: &str, options: &PrintOptions) -> Result<(), PrintError> {
        if !self.is_ready() {
            return Err(PrintError::NotReady);
        }
        info!("MOCK PRINT: {}", preview(html));
        if !options.is_empty() {
            debug!("Print options: {:?}", options);
        }
        Ok(())
    }
}

/// Writes documents into a spool directory
///
/// Each job becomes `<timestamp>_<seq>.html`, with a `.json` sidecar for
/// non-empty options.
pub struct SpoolPrinter {
    dir: PathBuf,
    seq: AtomicU64,
}

impl SpoolPrinter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            seq: AtomicU64::new(0),
        }
    }

    /// Create the spool directory if missing
    pub async fn prepare(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl PrinterCapability for SpoolPrinter {
    fn is_ready(&self) -> bool {
        self.dir.is_dir()
    }

    fn status(&self) -> DeviceStatus {
        if self.is_ready() {
            DeviceStatus::new(true, true, "ready")
        } else {
            DeviceStatus::new(false, false, "disconnected")
        }
    }

    async fn print_html(&self, html: &str, options: &PrintOptions) -> Result<(), PrintError> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let stem = format!("{}_{:04}", chrono::Utc::now().format("%Y%m%dT%H%M%S%.3f"), seq);
        let document = self.dir.join(format!("{}.html", stem));

        tokio::fs::write(&document, html)
            .await
            .map_err(|e| PrintError::Failed(format!("Spool write failed: {}", e)))?;

        if !options.is_empty() {
            let sidecar = serde_json::to_vec_pretty(options)
                .map_err(|e| PrintError::Failed(format!("Invalid print options: {}", e)))?;
            tokio::fs::write(self.dir.join(format!("{}.json", stem)), sidecar)
                .await
                .map_err(|e| PrintError::Failed(format!("Spool write failed: {}", e)))?;
        }

        info!("Spooled print job to {}", document.display());
        Ok(())
    }
}

/// Raw byte scanner device
pub struct DeviceScanner {
    path: PathBuf,
}

impl DeviceScanner {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ScannerCapability for DeviceScanner {
    fn is_ready(&self) -> bool {
        self.path.exists()
    }

    fn status(&self) -> DeviceStatus {
        if self.is_ready() {
            DeviceStatus::new(true, true, "ready")
        } else {
            DeviceStatus::new(false, false, "disconnected")
        }
    }

    async fn open(&self) -> stationlink_core::Result<ByteStream> {
        let file = tokio::fs::File::open(&self.path).await?;
        info!("Opened scanner device {}", self.path.display());
        Ok(Box::new(file))
    }
}

/// Reads scanner bytes from stdin
pub struct StdinScanner;

#[async_trait]
impl ScannerCapability for StdinScanner {
    fn is_ready(&self) -> bool {
        true
    }

    fn status(&self) -> DeviceStatus {
        DeviceStatus::new(true, true, "mock_mode")
    }

    async fn open(&self) -> stationlink_core::Result<ByteStream> {
        info!("Simulated scanner: type a card number and press Enter");
        Ok(Box::new(tokio::io::stdin()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stationlink_core::spawn_scanner;
    use stationlink_core::types::CardFormat;
    use std::sync::Arc;

    fn scratch_dir(name: &str) -> PathBuf {
        let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        std::env::temp_dir().join(format!("stationlink-{}-{}-{}", name, std::process::id(), nanos))
    }

    #[test]
    fn test_preview_truncates() {
        let long = "x".repeat(250);
        assert_eq!(preview(&long).len(), PREVIEW_CHARS + 3);
        assert_eq!(preview("<p/>"), "<p/>");
    }

    #[tokio::test]
    async fn test_simulated_printer() {
        let printer = SimulatedPrinter::new(true);
        assert!(printer.is_ready());
        assert_eq!(printer.status().status, "mock_mode");
        assert!(printer.print_html("<p>ok</p>", &PrintOptions::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_offline_printer_refuses() {
        let printer = SimulatedPrinter::new(false);
        assert!(!printer.status().ready);
        assert_eq!(
            printer.print_html("<p/>", &PrintOptions::new()).await,
            Err(PrintError::NotReady)
        );
    }

    #[tokio::test]
    async fn test_spool_printer_writes_document() {
        let dir = scratch_dir("spool");
        let printer = SpoolPrinter::new(&dir);
        assert!(!printer.is_ready());

        printer.prepare().await.unwrap();
        assert!(printer.is_ready());

        let mut options = PrintOptions::new();
        options.insert("copies".into(), 2.into());
        printer.print_html("<h1>Receipt</h1>", &options).await.unwrap();

        let mut names: Vec<String> = std::fs::read_dir(&dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names.len(), 2);
        assert!(names[0].ends_with(".html"));
        assert!(names[1].ends_with(".json"));

        let html = std::fs::read_to_string(dir.join(&names[0])).unwrap();
        assert_eq!(html, "<h1>Receipt</h1>");

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_device_scanner_reads_cards() {
        let dir = scratch_dir("scanner");
        std::fs::create_dir_all(&dir).unwrap();
        let device = dir.join("hidraw");
        std::fs::write(&device, b"CARD123456\r\x004001234567\n").unwrap();

        let scanner = Arc::new(DeviceScanner::new(&device));
        assert!(scanner.is_ready());

        let (task, mut cards) = spawn_scanner(scanner);
        task.await.unwrap().unwrap();

        let first = cards.recv().await.unwrap();
        assert_eq!(first.card_id, "123456");
        assert_eq!(first.format, CardFormat::PrefixedNumeric);
        let second = cards.recv().await.unwrap();
        assert_eq!(second.format, CardFormat::Numeric);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_missing_scanner_device() {
        let scanner = DeviceScanner::new("/nonexistent/hidraw9");
        assert_eq!(scanner.status().status, "disconnected");
        assert!(scanner.open().await.is_err());
    }
}
