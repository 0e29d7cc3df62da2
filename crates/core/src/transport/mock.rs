//! In-memory control server for tests
//!
//! `MockTransport` hands out WebSocket streams over `tokio::io::duplex` and
//! answers joins and heartbeats the way the control server does. Behavior is
//! scripted per socket open.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use super::{lock, Transport};
use crate::error::ConnectError;
use crate::protocol::FrameCodec;
use crate::types::{events, Envelope};

/// How the mock server treats one socket open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockBehavior {
    /// Open and accept the join
    Accept,
    /// Fail the open with a transport error
    Refuse,
    /// Never finish opening
    Hang,
    /// Open, then reply `error` to the join
    RejectJoin,
    /// Open, never reply to the join
    IgnoreJoin,
    /// Open, accept the join, then close the socket
    AcceptThenClose,
}

enum PeerCommand {
    Push(Envelope),
    Close,
}

struct MockShared {
    script: Mutex<VecDeque<MockBehavior>>,
    default: Mutex<MockBehavior>,
    opens: AtomicUsize,
    live: AtomicUsize,
    received: Mutex<Vec<Envelope>>,
    peer: Mutex<Option<mpsc::UnboundedSender<PeerCommand>>>,
    urls: Mutex<Vec<String>>,
}

/// Scriptable transport backed by an in-process server
#[derive(Clone)]
pub struct MockTransport {
    shared: Arc<MockShared>,
}

impl MockTransport {
    /// Create transport applying `default` to every open
    pub fn new(default: MockBehavior) -> Self {
        Self {
            shared: Arc::new(MockShared {
                script: Mutex::new(VecDeque::new()),
                default: Mutex::new(default),
                opens: AtomicUsize::new(0),
                live: AtomicUsize::new(0),
                received: Mutex::new(Vec::new()),
                peer: Mutex::new(None),
                urls: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Queue behaviors for the next opens, ahead of the default
    pub fn script(&self, behaviors: impl IntoIterator<Item = MockBehavior>) {
        lock(&self.shared.script).extend(behaviors);
    }

    pub fn set_default(&self, behavior: MockBehavior) {
        *lock(&self.shared.default) = behavior;
    }

    /// Number of `open` calls so far
    pub fn opens(&self) -> usize {
        self.shared.opens.load(Ordering::SeqCst)
    }

    /// Server sides still attached to a socket
    pub fn live_connections(&self) -> usize {
        self.shared.live.load(Ordering::SeqCst)
    }

    pub fn received_events(&self, event: &str) -> Vec<Envelope> {
        lock(&self.shared.received)
            .iter()
            .filter(|e| e.event == event)
            .cloned()
            .collect()
    }

    /// Push an envelope down the most recent socket
    pub fn push(&self, envelope: Envelope) -> bool {
        self.command(PeerCommand::Push(envelope))
    }

    /// Close the most recent socket from the server side
    pub fn close_peer(&self) -> bool {
        self.command(PeerCommand::Close)
    }

    /// URLs passed to `open`
    pub fn urls(&self) -> Vec<String> {
        lock(&self.shared.urls).clone()
    }

    fn command(&self, command: PeerCommand) -> bool {
        lock(&self.shared.peer)
            .as_ref()
            .map(|tx| tx.send(command).is_ok())
            .unwrap_or(false)
    }

    fn next_behavior(&self) -> MockBehavior {
        let scripted = lock(&self.shared.script).pop_front();
        scripted.unwrap_or_else(|| *lock(&self.shared.default))
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Io = DuplexStream;

    async fn open(&self, url: &str) -> Result<WebSocketStream<DuplexStream>, ConnectError> {
        self.shared.opens.fetch_add(1, Ordering::SeqCst);
        lock(&self.shared.urls).push(url.to_string());

        let behavior = self.next_behavior();
        match behavior {
            MockBehavior::Refuse => {
                return Err(ConnectError::Transport("Connection refused".to_string()));
            }
            MockBehavior::Hang => return std::future::pending().await,
            _ => {}
        }

        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;

        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.shared.peer) = Some(tx);
        self.shared.live.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(serve(server, behavior, rx, self.shared.clone()));

        Ok(client)
    }
}

fn reply_for(envelope: &Envelope, behavior: MockBehavior) -> Option<Envelope> {
    let payload = match envelope.event.as_str() {
        events::PHX_JOIN => match behavior {
            MockBehavior::RejectJoin => json!({ "status": "error", "response": { "reason": "unauthorized" } }),
            MockBehavior::IgnoreJoin => return None,
            _ => json!({ "status": "ok", "response": {} }),
        },
        events::HEARTBEAT => json!({ "status": "ok", "response": {} }),
        _ => return None,
    };

    Some(Envelope {
        topic: envelope.topic.clone(),
        event: events::PHX_REPLY.to_string(),
        payload,
        reference: envelope.reference.clone(),
    })
}

async fn serve(
    mut socket: WebSocketStream<DuplexStream>,
    behavior: MockBehavior,
    mut commands: mpsc::UnboundedReceiver<PeerCommand>,
    shared: Arc<MockShared>,
) {
    let mut commands_open = true;

    loop {
        tokio::select! {
            frame = socket.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                };
                let Ok(envelope) = FrameCodec::decode(&text) else {
                    continue;
                };
                lock(&shared.received).push(envelope.clone());

                if let Some(reply) = reply_for(&envelope, behavior) {
                    let Ok(frame) = FrameCodec::encode(&reply) else {
                        continue;
                    };
                    if socket.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                    if behavior == MockBehavior::AcceptThenClose && envelope.event == events::PHX_JOIN {
                        let _ = socket.close(None).await;
                        break;
                    }
                }
            }
            command = commands.recv(), if commands_open => match command {
                Some(PeerCommand::Push(envelope)) => {
                    let Ok(frame) = FrameCodec::encode(&envelope) else {
                        continue;
                    };
                    if socket.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
                Some(PeerCommand::Close) => {
                    let _ = socket.close(None).await;
                    break;
                }
                None => commands_open = false,
            },
        }
    }

    shared.live.fetch_sub(1, Ordering::SeqCst);
}
