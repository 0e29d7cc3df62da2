//! Connection supervision with exponential backoff and persistent retry
//!
//! The supervisor is the only owner of `ChannelConnection` values. It keeps at
//! most one alive, tearing the old one down before opening the next.
//!
//! # States
//! - `Idle`: nothing scheduled
//! - `Retrying`: a bounded backoff sequence is running
//! - `Connected`: the channel is joined
//! - `PersistentRetry`: one attempt per fixed interval, until joined or
//!   credentials are cleared

use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::connection::{ChannelConnection, ChannelSignal, ConnectionState};
use super::{lock, ChannelConfig, Transport};
use crate::error::{ConnectError, CoreError, JoinError, Result};
use crate::session::{Session, SessionProvider};
use crate::types::InboundEvent;

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts in one backoff sequence
    pub max_attempts: u32,
    /// Base delay
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    /// Tick of the indefinite retry after the sequence is exhausted
    pub persistent_interval: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(2),
            backoff_factor: 1.5,
            persistent_interval: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Delay before attempt `attempt` (0-based): `initial_delay × factor^attempt`
    ///
    /// Attempt 0 runs immediately; this is the value slept before attempts ≥ 1.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let millis = self.initial_delay.as_millis() as f64 * self.backoff_factor.powi(attempt as i32);
        Duration::from_millis(millis.round() as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Idle,
    Retrying,
    Connected,
    PersistentRetry,
}

/// Result of a top-level connect request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectOutcome {
    Connected,
    /// Backoff exhausted; persistent retry continues in the background
    RetryingInBackground,
    /// Interrupted by `disconnect()`
    Cancelled,
}

/// Observable connection status
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelStatus {
    /// Socket is open
    pub connected: bool,
    pub joined: bool,
    pub auto_retry_active: bool,
    pub state: SupervisorState,
    pub connection: ConnectionState,
    pub attempt: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
}

type SequenceResult = std::result::Result<ConnectOutcome, JoinError>;

/// The connect sequence currently running, shared by every caller
struct InFlight {
    generation: u64,
    result: watch::Receiver<Option<SequenceResult>>,
}

struct Inner<T: Transport> {
    transport: T,
    sessions: Arc<dyn SessionProvider>,
    retry: RetryConfig,
    channel: ChannelConfig,
    connection: tokio::sync::Mutex<Option<ChannelConnection>>,
    state: watch::Sender<SupervisorState>,
    attempt: AtomicU32,
    last_error: Mutex<Option<String>>,
    in_flight: Mutex<Option<InFlight>>,
    generation: AtomicU64,
    persistent: Mutex<Option<JoinHandle<()>>>,
    cancel: Mutex<CancellationToken>,
    next_connection_id: AtomicU64,
    signals: mpsc::UnboundedSender<ChannelSignal>,
}

/// Supervises the single device channel connection
pub struct ConnectionSupervisor<T: Transport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for ConnectionSupervisor<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Transport> ConnectionSupervisor<T> {
    /// Create supervisor and its inbound event stream
    ///
    /// Must be called within a tokio runtime: spawns the task that routes
    /// connection signals.
    pub fn new(
        transport: T,
        sessions: Arc<dyn SessionProvider>,
        retry: RetryConfig,
        channel: ChannelConfig,
    ) -> (Self, mpsc::UnboundedReceiver<InboundEvent>) {
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(SupervisorState::Idle);

        let inner = Arc::new(Inner {
            transport,
            sessions,
            retry,
            channel,
            connection: tokio::sync::Mutex::new(None),
            state,
            attempt: AtomicU32::new(0),
            last_error: Mutex::new(None),
            in_flight: Mutex::new(None),
            generation: AtomicU64::new(0),
            persistent: Mutex::new(None),
            cancel: Mutex::new(CancellationToken::new()),
            next_connection_id: AtomicU64::new(0),
            signals: signals_tx,
        });

        tokio::spawn(signal_loop(Arc::downgrade(&inner), signals_rx, inbound_tx));

        (Self { inner }, inbound_rx)
    }

    /// Connect with bounded backoff, then fall back to persistent retry
    ///
    /// # Behavior
    /// 1. Attempt up to `max_attempts` times, sleeping `delay_for(i)` before attempt i ≥ 1
    /// 2. Return `Connected` on the first attempt that opens and joins
    /// 3. If every attempt fails, enter persistent retry and return `RetryingInBackground`
    ///
    /// A call made while a sequence is running awaits that sequence instead
    /// of starting another one.
    ///
    /// # Errors
    /// * `CoreError::MissingCredentials` - no session to connect with
    /// * `CoreError::Join` - the server rejected the join or never replied
    pub async fn connect_with_retry(&self) -> Result<ConnectOutcome> {
        if !self.inner.sessions.has_credentials() {
            warn!("Cannot connect: no credentials");
            return Err(CoreError::MissingCredentials);
        }

        let mut result = {
            let mut slot = lock(&self.inner.in_flight);
            match slot.as_ref() {
                Some(flight) => {
                    debug!("Connect sequence already running, awaiting it");
                    flight.result.clone()
                }
                None => {
                    let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
                    let (tx, rx) = watch::channel(None);
                    *slot = Some(InFlight {
                        generation,
                        result: rx.clone(),
                    });

                    let inner = self.inner.clone();
                    let cancel = lock(&inner.cancel).clone();
                    tokio::spawn(async move {
                        let outcome = inner.run_sequence(&cancel).await;
                        {
                            let mut slot = lock(&inner.in_flight);
                            if slot.as_ref().map(|f| f.generation) == Some(generation) {
                                *slot = None;
                            }
                        }
                        // A close handled while the sequence was in flight was deferred to here
                        if outcome == Ok(ConnectOutcome::Connected)
                            && !cancel.is_cancelled()
                            && !inner.is_joined().await
                        {
                            inner.recover_lost_connection(cancel);
                        }
                        let _ = tx.send(Some(outcome));
                    });
                    rx
                }
            }
        };

        let outcome = match result.wait_for(Option::is_some).await {
            Ok(done) => done.clone(),
            // Sequence task went away without reporting
            Err(_) => None,
        };

        match outcome {
            Some(Ok(outcome)) => Ok(outcome),
            Some(Err(e)) => Err(e.into()),
            None => Ok(ConnectOutcome::Cancelled),
        }
    }

    /// Stop all retrying and tear down the live connection
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        {
            let mut cancel = lock(&inner.cancel);
            cancel.cancel();
            *cancel = CancellationToken::new();
        }
        inner.stop_persistent();
        lock(&inner.in_flight).take();

        if let Some(mut conn) = inner.connection.lock().await.take() {
            conn.disconnect();
        }

        inner.attempt.store(0, Ordering::SeqCst);
        *lock(&inner.last_error) = None;
        inner.set_state(SupervisorState::Idle);
        info!("Channel supervisor stopped");
    }

    /// Send on the live connection
    ///
    /// Returns `Ok(false)` with a warning when there is no joined channel.
    pub async fn send(&self, event: &str, payload: Value) -> Result<bool> {
        match self.inner.connection.lock().await.as_ref() {
            Some(conn) => conn.send(event, payload),
            None => {
                warn!("Cannot send '{}': no channel connection", event);
                Ok(false)
            }
        }
    }

    pub async fn status(&self) -> ChannelStatus {
        let (connected, connection) = match self.inner.connection.lock().await.as_ref() {
            Some(conn) => (conn.is_open(), conn.state()),
            None => (false, ConnectionState::Disconnected),
        };
        let state = self.state();

        ChannelStatus {
            connected,
            joined: connection == ConnectionState::Joined,
            auto_retry_active: matches!(
                state,
                SupervisorState::Retrying | SupervisorState::PersistentRetry
            ),
            state,
            connection,
            attempt: self.inner.attempt.load(Ordering::SeqCst),
            max_attempts: self.inner.retry.max_attempts,
            last_error: lock(&self.inner.last_error).clone(),
        }
    }

    pub fn state(&self) -> SupervisorState {
        *self.inner.state.borrow()
    }

    pub async fn is_joined(&self) -> bool {
        self.inner.is_joined().await
    }
}

impl<T: Transport> Inner<T> {
    fn set_state(&self, state: SupervisorState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!("Supervisor: {:?} -> {:?}", previous, state);
        }
    }

    fn record_error(&self, error: &CoreError) {
        *lock(&self.last_error) = Some(error.to_string());
    }

    fn sequence_in_flight(&self) -> bool {
        lock(&self.in_flight).is_some()
    }

    async fn is_joined(&self) -> bool {
        self.connection
            .lock()
            .await
            .as_ref()
            .map(ChannelConnection::is_joined)
            .unwrap_or(false)
    }

    async fn run_sequence(self: &Arc<Self>, cancel: &CancellationToken) -> SequenceResult {
        if cancel.is_cancelled() {
            return Ok(ConnectOutcome::Cancelled);
        }

        self.stop_persistent();
        self.attempt.store(0, Ordering::SeqCst);
        self.set_state(SupervisorState::Retrying);

        let max = self.retry.max_attempts;
        for i in 0..max {
            if i > 0 {
                let delay = self.retry.delay_for(i);
                info!("Retrying channel connect in {:?} (attempt {}/{})", delay, i + 1, max);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(ConnectOutcome::Cancelled),
                    _ = sleep(delay) => {}
                }
            }

            self.attempt.store(i + 1, Ordering::SeqCst);
            match self.attempt_once(cancel).await {
                Ok(true) => {
                    *lock(&self.last_error) = None;
                    self.set_state(SupervisorState::Connected);
                    return Ok(ConnectOutcome::Connected);
                }
                Ok(false) => return Ok(ConnectOutcome::Cancelled),
                Err(e) if e.is_transient() => {
                    warn!("Connect attempt {}/{} failed: {}", i + 1, max, e);
                    self.record_error(&e);
                }
                Err(CoreError::Join(e)) => {
                    warn!("Channel join rejected, not retrying: {}", e);
                    *lock(&self.last_error) = Some(e.to_string());
                    self.set_state(SupervisorState::Idle);
                    return Err(e);
                }
                Err(CoreError::MissingCredentials) => {
                    info!("Credentials cleared during connect sequence");
                    self.set_state(SupervisorState::Idle);
                    return Ok(ConnectOutcome::Cancelled);
                }
                Err(e) => {
                    warn!("Connect sequence aborted: {}", e);
                    self.record_error(&e);
                    self.set_state(SupervisorState::Idle);
                    return Ok(ConnectOutcome::Cancelled);
                }
            }
        }

        warn!(
            "All {} connect attempts failed, retrying every {:?}",
            max, self.retry.persistent_interval
        );
        self.start_persistent(cancel.clone());
        Ok(ConnectOutcome::RetryingInBackground)
    }

    /// One connect attempt, replacing any previous connection
    ///
    /// Returns `Ok(false)` if cancelled; a connection finished after
    /// cancellation is torn down, never installed.
    async fn attempt_once(&self, cancel: &CancellationToken) -> Result<bool> {
        let session = self
            .sessions
            .current()
            .filter(Session::has_credentials)
            .ok_or(CoreError::MissingCredentials)?;

        if let Some(mut old) = self.connection.lock().await.take() {
            old.disconnect();
        }

        let id = self.next_connection_id.fetch_add(1, Ordering::SeqCst) + 1;
        let connect =
            ChannelConnection::connect(&self.transport, &session, &self.channel, id, self.signals.clone());

        let conn = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(false),
            result = connect => result?,
        };

        let mut slot = self.connection.lock().await;
        if cancel.is_cancelled() {
            return Ok(false);
        }
        // A close signal for `id` seen before install was ignored as stale
        if !conn.is_joined() {
            return Err(ConnectError::Transport("Socket closed right after join".to_string()).into());
        }
        if let Some(mut previous) = slot.replace(conn) {
            previous.disconnect();
        }
        Ok(true)
    }

    fn start_persistent(self: &Arc<Self>, cancel: CancellationToken) {
        let mut slot = lock(&self.persistent);
        if cancel.is_cancelled() {
            return;
        }
        if slot.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return;
        }

        self.set_state(SupervisorState::PersistentRetry);
        *slot = Some(tokio::spawn(persistent_loop(
            Arc::downgrade(self),
            self.retry.persistent_interval,
            cancel,
        )));
    }

    fn stop_persistent(&self) {
        if let Some(handle) = lock(&self.persistent).take() {
            handle.abort();
            debug!("Persistent retry stopped");
        }
    }

    async fn on_connection_closed(self: &Arc<Self>, id: u64) {
        {
            let mut slot = self.connection.lock().await;
            if slot.as_ref().map(ChannelConnection::id) != Some(id) {
                trace!("Ignoring close of stale connection {}", id);
                return;
            }
            if let Some(mut conn) = slot.take() {
                conn.disconnect();
            }
        }
        *lock(&self.last_error) = Some("Connection lost".to_string());

        if self.sequence_in_flight() {
            return;
        }
        let cancel = lock(&self.cancel).clone();
        self.recover_lost_connection(cancel);
    }

    /// Re-enter persistent retry after the joined channel went away
    fn recover_lost_connection(self: &Arc<Self>, cancel: CancellationToken) {
        if !self.sessions.has_credentials() {
            self.set_state(SupervisorState::Idle);
            return;
        }

        warn!("Channel connection lost, entering persistent retry");
        self.start_persistent(cancel);
    }
}

async fn persistent_loop<T: Transport>(weak: Weak<Inner<T>>, period: Duration, cancel: CancellationToken) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut tries: u64 = 0;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let Some(inner) = weak.upgrade() else {
            return;
        };

        if !inner.sessions.has_credentials() {
            info!("Credentials cleared, stopping persistent retry");
            inner.set_state(SupervisorState::Idle);
            return;
        }
        if inner.is_joined().await {
            inner.set_state(SupervisorState::Connected);
            return;
        }
        if inner.sequence_in_flight() {
            debug!("Connect sequence running, skipping persistent tick");
            continue;
        }

        tries += 1;
        info!("Persistent retry attempt {}", tries);
        match inner.attempt_once(&cancel).await {
            Ok(true) => {
                *lock(&inner.last_error) = None;
                inner.set_state(SupervisorState::Connected);
                info!("Reconnected after {} persistent attempts", tries);
                return;
            }
            Ok(false) => return,
            Err(e) => {
                warn!("Persistent retry attempt {} failed: {}", tries, e);
                inner.record_error(&e);
            }
        }
    }
}

/// Route connection signals: inbound events out, closures into recovery
async fn signal_loop<T: Transport>(
    weak: Weak<Inner<T>>,
    mut signals: mpsc::UnboundedReceiver<ChannelSignal>,
    inbound: mpsc::UnboundedSender<InboundEvent>,
) {
    while let Some(signal) = signals.recv().await {
        let Some(inner) = weak.upgrade() else {
            break;
        };

        match signal {
            ChannelSignal::Inbound {
                connection_id,
                event,
                payload,
            } => {
                trace!("Event '{}' from connection {}", event, connection_id);
                if inbound.send(InboundEvent { event, payload }).is_err() {
                    debug!("Inbound consumer gone, dropping event from connection {}", connection_id);
                }
            }
            ChannelSignal::Closed { connection_id } => {
                inner.on_connection_closed(connection_id).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionStore;
    use crate::transport::mock::{MockBehavior, MockTransport};
    use crate::types::{events, Envelope};
    use serde_json::json;

    fn store() -> Arc<SessionStore> {
        Arc::new(SessionStore::with_session(Session::new(
            "secret",
            "7",
            None,
            "http://pos.local:4001",
        )))
    }

    fn supervisor(
        transport: &MockTransport,
        sessions: Arc<SessionStore>,
    ) -> (ConnectionSupervisor<MockTransport>, mpsc::UnboundedReceiver<InboundEvent>) {
        ConnectionSupervisor::new(
            transport.clone(),
            sessions,
            RetryConfig::default(),
            ChannelConfig::default(),
        )
    }

    async fn settle() {
        sleep(Duration::from_millis(100)).await;
    }

    #[test]
    fn test_backoff_delays() {
        let config = RetryConfig::default();
        let delays: Vec<u64> = (0..5).map(|i| config.delay_for(i).as_millis() as u64).collect();
        assert_eq!(delays, vec![2000, 3000, 4500, 6750, 10125]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connects_on_first_attempt() {
        let transport = MockTransport::new(MockBehavior::Accept);
        let (sup, _rx) = supervisor(&transport, store());

        assert_eq!(sup.connect_with_retry().await.unwrap(), ConnectOutcome::Connected);

        let status = sup.status().await;
        assert!(status.connected);
        assert!(status.joined);
        assert!(!status.auto_retry_active);
        assert_eq!(status.state, SupervisorState::Connected);
        assert_eq!(status.attempt, 1);
        assert_eq!(transport.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backs_off_between_attempts() {
        let transport = MockTransport::new(MockBehavior::Accept);
        transport.script([MockBehavior::Refuse, MockBehavior::Refuse]);
        let (sup, _rx) = supervisor(&transport, store());

        let started = Instant::now();
        assert_eq!(sup.connect_with_retry().await.unwrap(), ConnectOutcome::Connected);
        let elapsed = started.elapsed();

        assert_eq!(transport.opens(), 3);
        assert!(elapsed >= Duration::from_millis(3000 + 4500));
        assert!(elapsed < Duration::from_millis(3000 + 4500 + 100));
        assert_eq!(sup.status().await.attempt, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_enters_persistent_retry() {
        let transport = MockTransport::new(MockBehavior::Refuse);
        let (sup, _rx) = supervisor(&transport, store());

        assert_eq!(
            sup.connect_with_retry().await.unwrap(),
            ConnectOutcome::RetryingInBackground
        );
        assert_eq!(transport.opens(), 5);

        let status = sup.status().await;
        assert_eq!(status.state, SupervisorState::PersistentRetry);
        assert!(status.auto_retry_active);
        assert!(status.attempt <= status.max_attempts);
        assert!(status.last_error.is_some());

        // Exactly one attempt per tick
        sleep(Duration::from_millis(30_100)).await;
        assert_eq!(transport.opens(), 6);
        sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.opens(), 7);

        transport.set_default(MockBehavior::Accept);
        sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.opens(), 8);
        assert_eq!(sup.state(), SupervisorState::Connected);
        assert!(sup.is_joined().await);

        sleep(Duration::from_secs(90)).await;
        assert_eq!(transport.opens(), 8, "No attempts once joined");
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_requests_share_one_sequence() {
        let transport = MockTransport::new(MockBehavior::Accept);
        transport.script([MockBehavior::Refuse]);
        let (sup, _rx) = supervisor(&transport, store());
        let other = sup.clone();

        let (a, b) = tokio::join!(sup.connect_with_retry(), other.connect_with_retry());
        assert_eq!(a.unwrap(), ConnectOutcome::Connected);
        assert_eq!(b.unwrap(), ConnectOutcome::Connected);
        assert_eq!(transport.opens(), 2);

        settle().await;
        assert_eq!(transport.live_connections(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_rejection_is_surfaced_without_retry() {
        let transport = MockTransport::new(MockBehavior::RejectJoin);
        let (sup, _rx) = supervisor(&transport, store());

        let result = sup.connect_with_retry().await;
        assert!(matches!(result, Err(CoreError::Join(JoinError::Rejected(_)))));
        assert_eq!(sup.state(), SupervisorState::Idle);

        sleep(Duration::from_secs(120)).await;
        assert_eq!(transport.opens(), 1);
        assert_eq!(transport.live_connections(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_socket_dropped_after_join_reply_is_retried() {
        let transport = MockTransport::new(MockBehavior::Accept);
        transport.script([MockBehavior::AcceptThenClose]);
        let (sup, _rx) = supervisor(&transport, store());

        // Either the drop fails the first attempt and backoff retries, or the
        // connection is installed and its close hands over to persistent retry
        let outcome = sup.connect_with_retry().await.unwrap();
        assert_eq!(outcome, ConnectOutcome::Connected);

        sleep(Duration::from_millis(30_100)).await;
        assert_eq!(transport.opens(), 2);
        assert_eq!(sup.state(), SupervisorState::Connected);
        assert!(sup.is_joined().await);
        assert_eq!(transport.live_connections(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_timeout_is_surfaced_without_retry() {
        let transport = MockTransport::new(MockBehavior::IgnoreJoin);
        let (sup, _rx) = supervisor(&transport, store());

        let result = sup.connect_with_retry().await;
        assert!(matches!(result, Err(CoreError::Join(JoinError::Timeout(5_000)))));
        assert_eq!(sup.state(), SupervisorState::Idle);
        assert_eq!(transport.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requires_credentials() {
        let transport = MockTransport::new(MockBehavior::Accept);
        let (sup, _rx) = supervisor(&transport, Arc::new(SessionStore::new()));

        assert!(matches!(
            sup.connect_with_retry().await,
            Err(CoreError::MissingCredentials)
        ));
        assert_eq!(transport.opens(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_timers() {
        let transport = MockTransport::new(MockBehavior::Refuse);
        let (sup, _rx) = supervisor(&transport, store());

        sup.connect_with_retry().await.unwrap();
        sup.disconnect().await;

        let status = sup.status().await;
        assert_eq!(status.state, SupervisorState::Idle);
        assert_eq!(status.attempt, 0);
        assert!(!status.auto_retry_active);

        sleep(Duration::from_secs(300)).await;
        assert_eq!(transport.opens(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_stops_heartbeat() {
        let transport = MockTransport::new(MockBehavior::Accept);
        let (sup, _rx) = supervisor(&transport, store());

        sup.connect_with_retry().await.unwrap();
        sup.disconnect().await;

        sleep(Duration::from_secs(300)).await;
        assert!(transport.received_events(events::HEARTBEAT).is_empty());
        assert_eq!(transport.live_connections(), 0);
        assert!(!sup.send(events::CARD_SCANNED, json!({})).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_interrupts_backoff() {
        let transport = MockTransport::new(MockBehavior::Refuse);
        let (sup, _rx) = supervisor(&transport, store());

        let pending = tokio::spawn({
            let sup = sup.clone();
            async move { sup.connect_with_retry().await }
        });
        sleep(Duration::from_secs(1)).await;
        sup.disconnect().await;

        assert_eq!(pending.await.unwrap().unwrap(), ConnectOutcome::Cancelled);
        sleep(Duration::from_secs(120)).await;
        assert_eq!(transport.opens(), 1);
        assert_eq!(sup.state(), SupervisorState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_close_reenters_persistent_retry() {
        let transport = MockTransport::new(MockBehavior::Accept);
        let (sup, _rx) = supervisor(&transport, store());

        sup.connect_with_retry().await.unwrap();
        assert!(transport.close_peer());
        settle().await;

        let status = sup.status().await;
        assert_eq!(status.state, SupervisorState::PersistentRetry);
        assert!(!status.joined);

        sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.opens(), 2);
        assert_eq!(sup.state(), SupervisorState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleared_credentials_end_persistent_retry() {
        let transport = MockTransport::new(MockBehavior::Refuse);
        let sessions = store();
        let (sup, _rx) = supervisor(&transport, sessions.clone());

        sup.connect_with_retry().await.unwrap();
        sessions.clear();

        sleep(Duration::from_millis(30_100)).await;
        assert_eq!(transport.opens(), 5);
        assert_eq!(sup.state(), SupervisorState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_events_are_forwarded() {
        let transport = MockTransport::new(MockBehavior::Accept);
        let (sup, mut rx) = supervisor(&transport, store());

        sup.connect_with_retry().await.unwrap();
        transport.push(Envelope {
            topic: "device:7".into(),
            event: events::PRINT_HTML.into(),
            payload: json!({ "print_id": 1, "html": "<b>hi</b>" }),
            reference: None,
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event, "print_html");
        assert_eq!(event.payload["print_id"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_on_joined_channel() {
        let transport = MockTransport::new(MockBehavior::Accept);
        let (sup, _rx) = supervisor(&transport, store());

        assert!(!sup.send(events::CARD_SCANNED, json!({})).await.unwrap());
        sup.connect_with_retry().await.unwrap();
        assert!(sup.send(events::CARD_SCANNED, json!({ "card_data": {} })).await.unwrap());

        settle().await;
        assert_eq!(transport.received_events(events::CARD_SCANNED).len(), 1);
    }
}
