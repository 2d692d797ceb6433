//! Channel manager: the single live connection, re-pointed per session
//!
//! At most one connection task exists at a time. Every `open` bumps a
//! generation counter; signals from older generations are ignored, so a
//! closed connection can never write into the message log.

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use shared::{ClientFrame, ServerFrame};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backoff::Backoff;
use crate::config::EngineConfig;
use crate::error::ChatError;
use crate::transport::{Connector, FrameSink, FrameStream};

/// How long `close` waits for the connection task to wind down
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Lifecycle of the live channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// What happened on a connection
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Handshake completed; `reconnect` is false for the first one
    Connected { reconnect: bool },
    /// Parsed inbound frame
    Frame(ServerFrame),
    /// Transport lost (or connect failed); retrying after `delay`
    Reconnecting { attempt: u32, delay: Duration },
    /// Reconnect budget exhausted; the task has stopped
    Offline,
}

/// A channel event tagged with the connection instance that produced it
#[derive(Debug, Clone)]
pub struct ChannelSignal {
    pub generation: u64,
    pub session_id: Uuid,
    pub event: ChannelEvent,
}

/// Reconnect schedule
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl From<&EngineConfig> for ReconnectPolicy {
    fn from(config: &EngineConfig) -> Self {
        Self {
            base: config.backoff_base,
            max: config.backoff_max,
            max_attempts: config.max_reconnect_attempts,
        }
    }
}

impl ReconnectPolicy {
    fn backoff(&self) -> Backoff {
        Backoff::new(self.base, self.max, self.max_attempts)
    }
}

struct ActiveChannel {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    outbound: mpsc::UnboundedSender<ClientFrame>,
}

/// Owns the connection state and the one live connection task.
pub struct ChannelManager {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    signals: mpsc::UnboundedSender<ChannelSignal>,
    state: ConnectionState,
    session_id: Option<Uuid>,
    generation: u64,
    active: Option<ActiveChannel>,
}

impl ChannelManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        policy: ReconnectPolicy,
        signals: mpsc::UnboundedSender<ChannelSignal>,
    ) -> Self {
        Self {
            connector,
            policy,
            signals,
            state: ConnectionState::Disconnected,
            session_id: None,
            generation: 0,
            active: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.session_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Token cancelled when the current connection instance is closed.
    ///
    /// Timers tied to this connection should select on a child of it.
    pub fn instance_token(&self) -> Option<CancellationToken> {
        self.active.as_ref().map(|a| a.cancel.child_token())
    }

    /// Connect to `session_id`, closing any other connection first.
    ///
    /// No-op (returns false) if a connection to the same session is already
    /// live or being established.
    pub async fn open(&mut self, session_id: Uuid) -> bool {
        if self.session_id == Some(session_id) && self.state != ConnectionState::Disconnected {
            debug!("Channel already open for session {}", session_id);
            return false;
        }

        self.close().await;

        self.generation += 1;
        self.session_id = Some(session_id);
        self.state = ConnectionState::Connecting;

        let cancel = CancellationToken::new();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_channel(
            self.connector.clone(),
            self.policy,
            session_id,
            self.generation,
            outbound_rx,
            self.signals.clone(),
            cancel.clone(),
        ));

        info!(
            "Opening channel for session {} (generation {})",
            session_id, self.generation
        );
        self.active = Some(ActiveChannel {
            cancel,
            task,
            outbound,
        });
        true
    }

    /// Tear down the current connection.
    ///
    /// Returns once the connection task has finished, so its transport is
    /// released before anything else is opened.
    pub async fn close(&mut self) {
        if let Some(active) = self.active.take() {
            active.cancel.cancel();
            drop(active.outbound);
            let mut task = active.task;
            if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
                warn!("Channel task did not stop in time, aborting");
                task.abort();
                let _ = task.await;
            }
            info!("Closed channel (generation {})", self.generation);
        }
        self.state = ConnectionState::Disconnected;
    }

    /// Apply a signal from a connection task.
    ///
    /// Returns false for signals from a previous connection instance, which
    /// the caller must then ignore.
    pub fn apply(&mut self, signal: &ChannelSignal) -> bool {
        if signal.generation != self.generation || self.active.is_none() {
            debug!(
                "Ignoring stale channel signal (generation {}, current {})",
                signal.generation, self.generation
            );
            return false;
        }

        match &signal.event {
            ChannelEvent::Connected { reconnect } => {
                if *reconnect {
                    info!("Channel for session {} restored", signal.session_id);
                }
                self.state = ConnectionState::Connected;
            }
            ChannelEvent::Reconnecting { attempt, delay } => {
                info!(
                    "Channel for session {} lost, reconnect attempt {} in {:?}",
                    signal.session_id, attempt, delay
                );
                self.state = ConnectionState::Reconnecting;
            }
            ChannelEvent::Offline => {
                warn!(
                    "Channel for session {} offline after {} attempts",
                    signal.session_id, self.policy.max_attempts
                );
                self.state = ConnectionState::Disconnected;
                self.active = None;
            }
            ChannelEvent::Frame(_) => {}
        }
        true
    }

    /// Queue a frame for transmission.
    ///
    /// While connecting or reconnecting the frame is only accepted if
    /// `allow_queue` is set; it is flushed once the handshake completes.
    pub fn send(&self, frame: ClientFrame, allow_queue: bool) -> Result<(), ChatError> {
        let queueable = matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Reconnecting
        );
        if !(self.is_connected() || (allow_queue && queueable)) {
            return Err(ChatError::NotConnected);
        }
        let active = self.active.as_ref().ok_or(ChatError::NotConnected)?;
        active
            .outbound
            .send(frame)
            .map_err(|_| ChatError::NotConnected)
    }
}

enum PumpExit {
    Cancelled,
    Lost(String),
    EngineGone,
}

/// Connection task: connect, pump frames, reconnect with backoff.
async fn run_channel(
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    session_id: Uuid,
    generation: u64,
    mut outbound: mpsc::UnboundedReceiver<ClientFrame>,
    signals: mpsc::UnboundedSender<ChannelSignal>,
    cancel: CancellationToken,
) {
    let emit = |event: ChannelEvent| {
        signals
            .send(ChannelSignal {
                generation,
                session_id,
                event,
            })
            .is_ok()
    };

    let mut backoff = policy.backoff();
    let mut connected_before = false;

    loop {
        let attempt = tokio::select! {
            _ = cancel.cancelled() => return,
            attempt = connector.connect(session_id) => attempt,
        };

        match attempt {
            Ok((sink, stream)) => {
                backoff.reset();
                if !emit(ChannelEvent::Connected {
                    reconnect: connected_before,
                }) {
                    return;
                }
                connected_before = true;

                match pump(sink, stream, &mut outbound, &emit, &cancel).await {
                    PumpExit::Cancelled | PumpExit::EngineGone => return,
                    PumpExit::Lost(reason) => {
                        warn!("Channel for session {} lost: {}", session_id, reason);
                    }
                }
            }
            Err(e) => {
                error!("Failed to connect channel for session {}: {}", session_id, e);
            }
        }

        let Some(delay) = backoff.next_delay() else {
            emit(ChannelEvent::Offline);
            return;
        };
        if !emit(ChannelEvent::Reconnecting {
            attempt: backoff.attempts(),
            delay,
        }) {
            return;
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn pump(
    mut sink: FrameSink,
    mut stream: FrameStream,
    outbound: &mut mpsc::UnboundedReceiver<ClientFrame>,
    emit: &impl Fn(ChannelEvent) -> bool,
    cancel: &CancellationToken,
) -> PumpExit {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.close().await;
                return PumpExit::Cancelled;
            }

            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    return PumpExit::EngineGone;
                };
                let json = match serde_json::to_string(&frame) {
                    Ok(json) => json,
                    Err(e) => {
                        error!("Failed to serialize outgoing frame: {}", e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(json).await {
                    return PumpExit::Lost(e.to_string());
                }
            }

            incoming = stream.next() => match incoming {
                Some(Ok(text)) => match ServerFrame::parse(&text) {
                    Ok(frame) => {
                        if !emit(ChannelEvent::Frame(frame)) {
                            return PumpExit::EngineGone;
                        }
                    }
                    Err(e) => {
                        warn!("{}; dropping {:?}", ChatError::MalformedFrame(e), text);
                    }
                },
                Some(Err(e)) => return PumpExit::Lost(e.to_string()),
                None => return PumpExit::Lost("stream ended".to_string()),
            },
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::transport::{FrameSink, FrameStream};
    use async_trait::async_trait;
    use futures_util::{sink, stream};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// Server side of one fake connection
    pub(crate) struct ServerEnd {
        pub session_id: Uuid,
        pub from_client: mpsc::UnboundedReceiver<String>,
        pub to_client: mpsc::UnboundedSender<Result<String, ChatError>>,
    }

    impl ServerEnd {
        pub fn push(&self, frame: &ServerFrame) {
            let _ = self.to_client.send(Ok(serde_json::to_string(frame).unwrap()));
        }

        pub fn push_raw(&self, text: &str) {
            let _ = self.to_client.send(Ok(text.to_string()));
        }

        pub fn is_closed(&self) -> bool {
            self.to_client.is_closed()
        }
    }

    /// In-memory connector recording every connect attempt
    #[derive(Default)]
    pub(crate) struct FakeConnector {
        pub refuse: AtomicBool,
        pub ends: Mutex<Vec<ServerEnd>>,
        /// (session, live connections at the moment of connecting)
        pub attempts: Mutex<Vec<(Uuid, usize)>>,
    }

    impl FakeConnector {
        pub fn attempt_count(&self) -> usize {
            self.attempts.lock().unwrap().len()
        }

        /// Take the most recent server end for a session
        pub fn take_end(&self, session_id: Uuid) -> Option<ServerEnd> {
            let mut ends = self.ends.lock().unwrap();
            let index = ends.iter().rposition(|e| e.session_id == session_id)?;
            Some(ends.remove(index))
        }

        pub fn live_connections(&self) -> usize {
            self.ends
                .lock()
                .unwrap()
                .iter()
                .filter(|e| !e.is_closed())
                .count()
        }
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn connect(
            &self,
            session_id: Uuid,
        ) -> Result<(FrameSink, FrameStream), ChatError> {
            let live = self.live_connections();
            self.attempts.lock().unwrap().push((session_id, live));
            if self.refuse.load(Ordering::SeqCst) {
                return Err(ChatError::Transport("connection refused".to_string()));
            }

            let (client_tx, from_client) = mpsc::unbounded_channel::<String>();
            let (to_client, client_rx) = mpsc::unbounded_channel::<Result<String, ChatError>>();

            let sink = sink::unfold(client_tx, |tx, text: String| async move {
                tx.send(text)
                    .map_err(|e| ChatError::Transport(e.to_string()))?;
                Ok::<_, ChatError>(tx)
            });
            let stream = stream::unfold(client_rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            });

            self.ends.lock().unwrap().push(ServerEnd {
                session_id,
                from_client,
                to_client,
            });
            Ok((Box::pin(sink), Box::pin(stream)))
        }
    }

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            max_attempts: 5,
        }
    }

    async fn next_event(
        manager: &mut ChannelManager,
        rx: &mut mpsc::UnboundedReceiver<ChannelSignal>,
    ) -> ChannelEvent {
        loop {
            let signal = tokio::time::timeout(Duration::from_secs(120), rx.recv())
                .await
                .expect("timed out waiting for channel signal")
                .expect("signal channel closed");
            if manager.apply(&signal) {
                return signal.event;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_connects_and_is_idempotent() {
        let connector = Arc::new(FakeConnector::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut manager = ChannelManager::new(connector.clone(), policy(), tx);
        let session = Uuid::new_v4();

        assert!(manager.open(session).await);
        assert_eq!(manager.state(), ConnectionState::Connecting);
        assert_eq!(
            next_event(&mut manager, &mut rx).await,
            ChannelEvent::Connected { reconnect: false }
        );
        assert!(manager.is_connected());

        assert!(!manager.open(session).await);
        assert_eq!(connector.attempt_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_closes_previous_before_connecting() {
        let connector = Arc::new(FakeConnector::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut manager = ChannelManager::new(connector.clone(), policy(), tx);
        let (x, y) = (Uuid::new_v4(), Uuid::new_v4());

        manager.open(x).await;
        next_event(&mut manager, &mut rx).await;
        let first_generation = manager.generation();

        manager.open(y).await;
        assert_ne!(manager.generation(), first_generation);
        assert_eq!(
            next_event(&mut manager, &mut rx).await,
            ChannelEvent::Connected { reconnect: false }
        );

        let attempts = connector.attempts.lock().unwrap().clone();
        assert_eq!(attempts, vec![(x, 0), (y, 0)]);
        assert_eq!(manager.session_id(), Some(y));
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_flow_both_ways() {
        let connector = Arc::new(FakeConnector::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut manager = ChannelManager::new(connector.clone(), policy(), tx);
        let session = Uuid::new_v4();

        manager.open(session).await;
        next_event(&mut manager, &mut rx).await;
        let mut end = connector.take_end(session).unwrap();

        manager
            .send(
                ClientFrame::Message {
                    content: "hello".to_string(),
                    client_id: None,
                },
                false,
            )
            .unwrap();
        let sent = end.from_client.recv().await.unwrap();
        assert_eq!(sent, r#"{"type":"message","content":"hello"}"#);

        end.push_raw("{not json");
        let ack = ServerFrame::Ack {
            client_id: Uuid::new_v4(),
            server_id: Uuid::new_v4(),
            created_at: None,
        };
        end.push(&ack);
        assert_eq!(
            next_event(&mut manager, &mut rx).await,
            ChannelEvent::Frame(ack)
        );
        assert!(manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_loss_reconnects() {
        let connector = Arc::new(FakeConnector::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut manager = ChannelManager::new(connector.clone(), policy(), tx);
        let session = Uuid::new_v4();

        manager.open(session).await;
        next_event(&mut manager, &mut rx).await;
        drop(connector.take_end(session));

        assert!(matches!(
            next_event(&mut manager, &mut rx).await,
            ChannelEvent::Reconnecting { attempt: 1, .. }
        ));
        assert_eq!(manager.state(), ConnectionState::Reconnecting);
        assert!(!manager.is_connected());

        assert_eq!(
            next_event(&mut manager, &mut rx).await,
            ChannelEvent::Connected { reconnect: true }
        );
        assert!(manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_attempts_go_offline() {
        let connector = Arc::new(FakeConnector::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut manager = ChannelManager::new(connector.clone(), policy(), tx);
        let session = Uuid::new_v4();

        manager.open(session).await;
        next_event(&mut manager, &mut rx).await;
        connector.refuse.store(true, Ordering::SeqCst);
        drop(connector.take_end(session));

        let start = tokio::time::Instant::now();
        let mut delays = Vec::new();
        loop {
            match next_event(&mut manager, &mut rx).await {
                ChannelEvent::Reconnecting { delay, .. } => delays.push(delay.as_secs()),
                ChannelEvent::Offline => break,
                other => panic!("unexpected event {:?}", other),
            }
        }

        assert_eq!(delays, vec![1, 2, 4, 8, 16]);
        assert_eq!(start.elapsed(), Duration::from_secs(31));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(connector.attempt_count(), 6);
        assert!(matches!(
            manager.send(
                ClientFrame::Message {
                    content: "x".to_string(),
                    client_id: None
                },
                true
            ),
            Err(ChatError::NotConnected)
        ));

        // Re-selecting the session starts over.
        connector.refuse.store(false, Ordering::SeqCst);
        assert!(manager.open(session).await);
        assert_eq!(
            next_event(&mut manager, &mut rx).await,
            ChannelEvent::Connected { reconnect: false }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_policy_while_connecting() {
        let connector = Arc::new(FakeConnector::default());
        connector.refuse.store(true, Ordering::SeqCst);
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut manager = ChannelManager::new(connector, policy(), tx);
        let frame = || ClientFrame::Message {
            content: "queued".to_string(),
            client_id: None,
        };

        assert!(matches!(
            manager.send(frame(), true),
            Err(ChatError::NotConnected)
        ));

        manager.open(Uuid::new_v4()).await;
        assert!(manager.send(frame(), false).is_err());
        assert!(manager.send(frame(), true).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_ignores_late_signals() {
        let connector = Arc::new(FakeConnector::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut manager = ChannelManager::new(connector.clone(), policy(), tx);
        let session = Uuid::new_v4();

        manager.open(session).await;
        let signal = rx.recv().await.unwrap();
        manager.close().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(!manager.apply(&signal));
        assert_eq!(connector.live_connections(), 0);
        assert!(manager.instance_token().is_none());
    }
}
