//! Channel heartbeat timer
//!
//! Sends a `heartbeat` envelope on the `phoenix` topic at a fixed interval
//! while the socket is open. Replies are not tracked: a socket that accepts
//! writes but never answers looks healthy until the transport reports closure.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::FrameCodec;
use crate::types::{events, Envelope, RefGenerator};

/// Handle to a running heartbeat task
///
/// Dropping the handle cancels the task.
pub struct Heartbeat {
    handle: JoinHandle<()>,
}

impl Heartbeat {
    /// Spawn heartbeat task
    ///
    /// This task:
    /// 1. Ticks every `period` (first tick one period after spawn)
    /// 2. Stops itself if `open` is false
    /// 3. Queues a heartbeat frame on `outbox` otherwise
    pub fn spawn(
        outbox: mpsc::UnboundedSender<Message>,
        period: Duration,
        refs: Arc<RefGenerator>,
        open: Arc<AtomicBool>,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                if !open.load(Ordering::SeqCst) {
                    tracing::debug!("Socket not open, stopping heartbeat");
                    return;
                }

                let envelope = Envelope::heartbeat(refs.next(events::HEARTBEAT));
                match FrameCodec::encode(&envelope) {
                    Ok(frame) => {
                        if outbox.send(Message::Text(frame)).is_err() {
                            tracing::debug!("Writer gone, stopping heartbeat");
                            return;
                        }
                        tracing::debug!("Heartbeat sent");
                    }
                    Err(e) => {
                        tracing::error!("Failed to encode heartbeat: {}", e);
                        return;
                    }
                }
            }
        });

        Self { handle }
    }

    /// Whether the timer task is still scheduled
    pub fn is_active(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Cancel the timer
    pub fn cancel(&self) {
        self.handle.abort();
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn_heartbeat(
        open: bool,
    ) -> (Heartbeat, mpsc::UnboundedReceiver<Message>, Arc<AtomicBool>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(open));
        let hb = Heartbeat::spawn(tx, Duration::from_secs(30), Arc::new(RefGenerator::new()), open.clone());
        (hb, rx, open)
    }

    #[tokio::test(start_paused = true)]
    async fn test_sends_heartbeat_each_period() {
        let (hb, mut rx, _open) = spawn_heartbeat(true);

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(rx.try_recv().is_err(), "No heartbeat before first period");

        tokio::time::sleep(Duration::from_secs(2)).await;
        let Message::Text(frame) = rx.try_recv().unwrap() else {
            panic!("expected text frame");
        };
        let envelope = FrameCodec::decode(&frame).unwrap();
        assert_eq!(envelope.topic, "phoenix");
        assert_eq!(envelope.event, "heartbeat");
        assert!(hb.is_active());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_itself_when_socket_closed() {
        let (hb, mut rx, open) = spawn_heartbeat(true);
        open.store(false, Ordering::SeqCst);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(rx.try_recv().is_err());
        assert!(!hb.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_firing() {
        let (hb, mut rx, _open) = spawn_heartbeat(true);
        hb.cancel();

        tokio::time::sleep(Duration::from_secs(90)).await;
        assert!(rx.try_recv().is_err());
        assert!(!hb.is_active());
    }
}
