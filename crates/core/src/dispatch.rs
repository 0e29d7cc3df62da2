//! Inbound command dispatch
//!
//! Every `print_html` command produces exactly one `print_completed` ack,
//! whatever happens to the print: success, driver error, driver panic, a
//! stuck driver or a printer that is not ready.
//!
//! Commands run concurrently, so one slow job never holds up the others.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::device::PrinterCapability;
use crate::error::{PrintError, Result};
use crate::transport::{ConnectionSupervisor, Transport};
use crate::types::{events, InboundEvent, PrintAck, PrintCommand, PrintId};

/// Outbound path for acks and notifications
#[async_trait]
pub trait Outbound: Send + Sync {
    /// Send on the device topic; `Ok(false)` when the channel is not joined
    async fn send_event(&self, event: &str, payload: Value) -> Result<bool>;
}

#[async_trait]
impl<T: Transport> Outbound for ConnectionSupervisor<T> {
    async fn send_event(&self, event: &str, payload: Value) -> Result<bool> {
        self.send(event, payload).await
    }
}

/// Longest a driver may spend on one document
pub const PRINT_TIMEOUT: Duration = Duration::from_secs(120);

/// Routes remote commands to device capabilities
#[derive(Clone)]
pub struct CommandDispatcher {
    printer: Arc<dyn PrinterCapability>,
    print_timeout: Duration,
}

impl CommandDispatcher {
    pub fn new(printer: Arc<dyn PrinterCapability>) -> Self {
        Self {
            printer,
            print_timeout: PRINT_TIMEOUT,
        }
    }

    pub fn with_print_timeout(mut self, print_timeout: Duration) -> Self {
        self.print_timeout = print_timeout;
        self
    }

    /// Consume inbound events until the stream ends
    ///
    /// Each print command runs in its own task; jobs still running when the
    /// stream ends are awaited before returning.
    pub async fn run(self, mut inbound: mpsc::UnboundedReceiver<InboundEvent>, outbound: Arc<dyn Outbound>) {
        info!("Command dispatcher started");
        let mut jobs = JoinSet::new();

        loop {
            tokio::select! {
                received = inbound.recv() => {
                    let Some(InboundEvent { event, payload }) = received else {
                        break;
                    };
                    match event.as_str() {
                        events::PRINT_HTML => {
                            let dispatcher = self.clone();
                            let outbound = outbound.clone();
                            jobs.spawn(async move {
                                if let Some(ack) = dispatcher.handle_print(payload).await {
                                    dispatcher.send_ack(&ack, outbound.as_ref()).await;
                                }
                            });
                        }
                        other => debug!("Ignoring inbound event '{}'", other),
                    }
                }
                Some(finished) = jobs.join_next(), if !jobs.is_empty() => {
                    if let Err(e) = finished {
                        error!("Print task failed: {}", e);
                    }
                }
            }
        }

        while let Some(finished) = jobs.join_next().await {
            if let Err(e) = finished {
                error!("Print task failed: {}", e);
            }
        }
        info!("Command dispatcher stopped");
    }

    /// Run one print command and build its ack
    ///
    /// Returns `None` only when the payload carries no usable `print_id`,
    /// since an ack cannot be correlated without one.
    pub async fn handle_print(&self, payload: Value) -> Option<PrintAck> {
        let command: PrintCommand = match serde_json::from_value(payload.clone()) {
            Ok(command) => command,
            Err(e) => {
                let print_id = payload
                    .get("print_id")
                    .cloned()
                    .and_then(|id| serde_json::from_value::<PrintId>(id).ok());
                return match print_id {
                    Some(id) => {
                        warn!("Invalid print command {}: {}", id, e);
                        Some(PrintAck::failed(id, format!("Invalid print command: {}", e)))
                    }
                    None => {
                        warn!("Dropping print command without print_id: {}", e);
                        None
                    }
                };
            }
        };

        let print_id = command.print_id.clone();
        info!("Print job {} received ({} bytes of HTML)", print_id, command.html.len());

        if !self.printer.is_ready() {
            warn!("Print job {} refused: printer not ready", print_id);
            return Some(PrintAck::failed(print_id, PrintError::NotReady.to_string()));
        }

        // Spawned so a panicking driver still yields an ack
        let printer = self.printer.clone();
        let options = command.options();
        let html = command.html;
        let mut job = tokio::spawn(async move { printer.print_html(&html, &options).await });
        let outcome = match timeout(self.print_timeout, &mut job).await {
            Ok(outcome) => outcome,
            Err(_) => {
                job.abort();
                warn!("Print job {} timed out after {:?}", print_id, self.print_timeout);
                return Some(PrintAck::failed(
                    print_id,
                    format!("Print timed out after {}s", self.print_timeout.as_secs()),
                ));
            }
        };

        let ack = match outcome {
            Ok(Ok(())) => {
                info!("Print job {} completed", print_id);
                PrintAck::success(print_id)
            }
            Ok(Err(e)) => {
                warn!("Print job {} failed: {}", print_id, e);
                PrintAck::failed(print_id, e.to_string())
            }
            Err(e) => {
                error!("Print job {} crashed the printer driver: {}", print_id, e);
                PrintAck::failed(print_id, format!("Printer error: {}", e))
            }
        };

        Some(ack)
    }

    async fn send_ack(&self, ack: &PrintAck, outbound: &dyn Outbound) {
        let payload = match serde_json::to_value(ack) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to encode ack for print job {}: {}", ack.print_id, e);
                return;
            }
        };

        match outbound.send_event(events::PRINT_COMPLETED, payload).await {
            Ok(true) => debug!("Ack sent for print job {}", ack.print_id),
            Ok(false) => warn!("Ack for print job {} not sent: channel not joined", ack.print_id),
            Err(e) => error!("Failed to send ack for print job {}: {}", ack.print_id, e),
        }
    }
}
