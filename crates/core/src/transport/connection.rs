//! One socket to the control server, joined to the device channel
//!
//! A connection is created per attempt and never reused: any terminal
//! transition (local disconnect, peer close, socket error, failed join)
//! leaves it Disconnected with its heartbeat cancelled and socket closed.

use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, trace, warn};

use super::heartbeat::Heartbeat;
use super::url::socket_url;
use super::{lock, ChannelConfig, Transport};
use crate::error::{ConnectError, CoreError, JoinError, Result};
use crate::protocol::FrameCodec;
use crate::session::Session;
use crate::types::{Envelope, RefGenerator, JOIN_REF};

/// Bound on a single frame write before the socket is considered dead
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    AwaitingJoin,
    Joined,
}

/// Notifications from a connection to its owner
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelSignal {
    /// Non-reply envelope received on the socket
    Inbound {
        connection_id: u64,
        event: String,
        payload: Value,
    },
    /// Socket closed by the peer or failed
    Closed { connection_id: u64 },
}

/// State shared between the connection handle and its socket tasks
struct Shared {
    id: u64,
    state: watch::Sender<ConnectionState>,
    open: Arc<AtomicBool>,
    heartbeat: Mutex<Option<Heartbeat>>,
    join_reply: Mutex<Option<oneshot::Sender<Envelope>>>,
    signals: mpsc::UnboundedSender<ChannelSignal>,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Connection {}: {:?} -> {:?}", self.id, previous, state);
        }
    }

    /// Move to Disconnected, cancelling the heartbeat.
    ///
    /// Returns false if the connection was already Disconnected.
    fn terminate(&self) -> bool {
        self.open.store(false, Ordering::SeqCst);
        if let Some(heartbeat) = lock(&self.heartbeat).take() {
            heartbeat.cancel();
        }
        // Drops the join sender so a pending join sees the socket loss
        lock(&self.join_reply).take();

        let previous = self.state.send_replace(ConnectionState::Disconnected);
        previous != ConnectionState::Disconnected
    }

    /// Socket failed underneath us: terminate and tell the owner
    fn socket_lost(&self, reason: &str) {
        if self.terminate() {
            info!("Channel socket {} closed: {}", self.id, reason);
            let _ = self.signals.send(ChannelSignal::Closed {
                connection_id: self.id,
            });
        }
    }

    fn route(&self, envelope: Envelope) {
        if envelope.is_reply() {
            if envelope.reference() == Some(JOIN_REF) {
                let pending = lock(&self.join_reply).take();
                if let Some(tx) = pending {
                    let _ = tx.send(envelope);
                    return;
                }
            }
            trace!(
                "Reply ref={:?} status={:?}",
                envelope.reference(),
                envelope.reply_status()
            );
            return;
        }

        trace!("Inbound event '{}' on {}", envelope.event, envelope.topic);
        let _ = self.signals.send(ChannelSignal::Inbound {
            connection_id: self.id,
            event: envelope.event,
            payload: envelope.payload,
        });
    }
}

/// Live socket joined (or joining) to `device:<id>`
pub struct ChannelConnection {
    shared: Arc<Shared>,
    topic: String,
    outbox: mpsc::UnboundedSender<Message>,
    refs: Arc<RefGenerator>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl ChannelConnection {
    /// Open the socket and complete the join handshake
    ///
    /// # Behavior
    /// 1. Derive the socket URL and open it within `open_timeout`
    /// 2. Send `phx_join` with the fixed join ref
    /// 3. Wait `join_timeout` for a matching `phx_reply` with status `ok`
    /// 4. Start the heartbeat, then report Joined
    ///
    /// On a failed join the socket is closed before the error is returned.
    ///
    /// # Errors
    /// * `ConnectError` - socket did not open, or dropped before the join completed
    /// * `JoinError` - handshake rejected or timed out
    pub async fn connect<T: Transport>(
        transport: &T,
        session: &Session,
        config: &ChannelConfig,
        id: u64,
        signals: mpsc::UnboundedSender<ChannelSignal>,
    ) -> Result<Self> {
        let url = socket_url(&session.server_url, &config.socket_path)?;
        info!("Opening channel socket {} (connection {})", url, id);

        let (state, _) = watch::channel(ConnectionState::Connecting);

        let socket = timeout(config.open_timeout, transport.open(&url))
            .await
            .map_err(|_| ConnectError::Timeout(config.open_timeout.as_millis() as u64))??;

        let (sink, stream) = socket.split();
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let (join_tx, join_rx) = oneshot::channel();

        let shared = Arc::new(Shared {
            id,
            state,
            open: Arc::new(AtomicBool::new(true)),
            heartbeat: Mutex::new(None),
            join_reply: Mutex::new(Some(join_tx)),
            signals,
        });

        let writer = tokio::spawn(write_loop(sink, outbox_rx, shared.clone()));
        let reader = tokio::spawn(read_loop(stream, shared.clone()));

        let mut conn = Self {
            shared,
            topic: session.topic(),
            outbox,
            refs: Arc::new(RefGenerator::new()),
            reader,
            writer,
        };

        if let Err(e) = conn.join(session, join_rx, config.join_timeout).await {
            warn!("Join of {} failed: {}", conn.topic, e);
            conn.disconnect();
            return Err(e);
        }

        conn.start_heartbeat(config.heartbeat_interval);
        let joined = conn.shared.state.send_if_modified(|state| {
            if *state == ConnectionState::AwaitingJoin {
                *state = ConnectionState::Joined;
                true
            } else {
                false
            }
        });
        if !joined {
            // Socket dropped between the reply and here
            conn.disconnect();
            return Err(ConnectError::Transport("Socket closed during join".to_string()).into());
        }
        info!("Channel {} joined (connection {})", conn.topic, id);

        Ok(conn)
    }

    async fn join(
        &self,
        session: &Session,
        reply: oneshot::Receiver<Envelope>,
        join_timeout: Duration,
    ) -> Result<()> {
        self.shared.set_state(ConnectionState::AwaitingJoin);
        debug!("Joining channel {}", self.topic);
        self.enqueue(&Envelope::join(&session.device_id, &session.auth_token))?;

        let reply = match timeout(join_timeout, reply).await {
            Err(_) => return Err(JoinError::Timeout(join_timeout.as_millis() as u64).into()),
            Ok(Err(_)) => {
                return Err(ConnectError::Transport("Socket closed during join".to_string()).into())
            }
            Ok(Ok(reply)) => reply,
        };

        match reply.reply_status() {
            Some("ok") => Ok(()),
            _ => Err(JoinError::Rejected(reply.payload.to_string()).into()),
        }
    }

    fn start_heartbeat(&self, period: Duration) {
        let heartbeat = Heartbeat::spawn(
            self.outbox.clone(),
            period,
            self.refs.clone(),
            self.shared.open.clone(),
        );
        *lock(&self.shared.heartbeat) = Some(heartbeat);
    }

    /// Queue one whole frame for the writer task
    fn enqueue(&self, envelope: &Envelope) -> Result<()> {
        let frame = FrameCodec::encode(envelope)?;
        self.outbox
            .send(Message::Text(frame))
            .map_err(|_| CoreError::NotJoined)
    }

    /// Send an event on the device topic with a fresh ref
    ///
    /// No-op (returns `Ok(false)`) with a warning when not Joined.
    pub fn send(&self, event: &str, payload: Value) -> Result<bool> {
        if !self.is_joined() {
            warn!("Cannot send '{}': channel not joined", event);
            return Ok(false);
        }

        let envelope = Envelope::new(self.topic.clone(), event, payload, self.refs.next(event));
        self.enqueue(&envelope)?;
        trace!("Queued '{}' on {}", event, self.topic);
        Ok(true)
    }

    /// Close the socket and cancel the heartbeat. Idempotent.
    pub fn disconnect(&mut self) {
        let was_live = self.shared.terminate();
        // Writer flushes the close frame, then closes the sink
        let _ = self.outbox.send(Message::Close(None));
        self.reader.abort();
        if was_live {
            info!("Channel {} disconnected (connection {})", self.topic, self.shared.id);
        }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    pub fn is_joined(&self) -> bool {
        self.state() == ConnectionState::Joined && self.is_open()
    }

    /// Whether a heartbeat timer is scheduled
    pub fn has_heartbeat(&self) -> bool {
        lock(&self.shared.heartbeat)
            .as_ref()
            .map(Heartbeat::is_active)
            .unwrap_or(false)
    }
}

impl Drop for ChannelConnection {
    fn drop(&mut self) {
        self.disconnect();
        if !self.writer.is_finished() {
            // Outbox sender drops with us; the writer drains the close frame and exits
            trace!("Connection {} dropped, writer draining", self.shared.id);
        }
    }
}

/// Drain the outbox into the socket, one frame at a time
async fn write_loop<K>(mut sink: K, mut outbox: mpsc::UnboundedReceiver<Message>, shared: Arc<Shared>)
where
    K: Sink<Message, Error = WsError> + Unpin + Send,
{
    while let Some(msg) = outbox.recv().await {
        let closing = matches!(msg, Message::Close(_));

        match timeout(WRITE_TIMEOUT, sink.send(msg)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if !closing {
                    shared.socket_lost(&format!("write failed: {}", e));
                }
                break;
            }
            Err(_) => {
                shared.socket_lost("write timed out");
                break;
            }
        }

        if closing {
            break;
        }
    }

    let _ = timeout(WRITE_TIMEOUT, sink.close()).await;
}

/// Decode inbound frames and route them until the socket ends
async fn read_loop<S>(mut stream: S, shared: Arc<Shared>)
where
    S: Stream<Item = std::result::Result<Message, WsError>> + Unpin + Send,
{
    let reason = loop {
        let decoded = match stream.next().await {
            Some(Ok(Message::Text(text))) => FrameCodec::decode(&text),
            Some(Ok(Message::Binary(data))) => FrameCodec::decode_bytes(&data),
            Some(Ok(Message::Close(frame))) => {
                break match frame {
                    Some(frame) => format!("close frame ({})", frame.code),
                    None => "close frame".to_string(),
                };
            }
            // Ping/pong are answered by the protocol layer
            Some(Ok(_)) => continue,
            Some(Err(e)) => break format!("socket error: {}", e),
            None => break "stream ended".to_string(),
        };

        match decoded {
            Ok(envelope) => shared.route(envelope),
            Err(e) => warn!("Dropping undecodable frame: {}", e),
        }
    };

    shared.socket_lost(&reason);
}
