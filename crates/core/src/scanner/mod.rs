//! Card scanner input
//!
//! Bytes from the scanner capability are framed by `ScannerFrameParser` and
//! forwarded as `CardReadEvent`s to a single channel subscriber.

pub mod parser;

pub use parser::{CardSubscriber, ScannerFrameParser, MAX_TOKEN_LEN};

use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::device::ScannerCapability;
use crate::types::CardReadEvent;
use crate::Result;

/// Pump bytes from a scanner stream through the parser until EOF
pub async fn pump_scanner<R>(mut reader: R, parser: &mut ScannerFrameParser) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
{
    let mut buf = vec![0u8; 1024];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            debug!("Scanner stream EOF");
            break;
        }

        let emitted = parser.feed(&buf[..n]);
        tracing::trace!("Read {} scanner bytes, {} card events", n, emitted);
    }

    Ok(())
}

/// Open the scanner and forward card reads into a channel
///
/// # Returns
/// * `(JoinHandle, Receiver)` - reader task and the card-scan subscription
pub fn spawn_scanner(
    scanner: Arc<dyn ScannerCapability>,
) -> (JoinHandle<Result<()>>, mpsc::UnboundedReceiver<CardReadEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();

    let task = tokio::spawn(async move {
        let stream = scanner.open().await?;
        info!("Card scanner stream opened");

        let mut parser = ScannerFrameParser::new();
        parser.subscribe(move |event| {
            let _ = tx.send(event);
        });

        pump_scanner(stream, &mut parser).await
    });

    (task, rx)
}
