//! The chat engine: one reducer fed by the directory poller, the channel
//! and the caller.
//!
//! All state lives in a single task. The poll timer and the channel's own
//! timers only send events into it, so the session switch in
//! `select_session` is the one place where connection state changes hands.

use chrono::Utc;
use serde::Serialize;
use shared::{ApiError, ChatApi, ChatSession, ClientFrame, MessageRecord, ServerFrame};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::{ChannelEvent, ChannelManager, ChannelSignal, ConnectionState, ReconnectPolicy};
use crate::config::EngineConfig;
use crate::directory::{spawn_poller, PollOutcome, SessionDirectory};
use crate::error::ChatError;
use crate::grouping::{present, MessageView};
use crate::message_log::{AckOutcome, AppendOutcome, Message, MessageLog};
use crate::transport::Connector;

/// Everything a presentation layer renders
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChatView {
    /// Sessions, newest activity first
    pub sessions: Vec<ChatSession>,
    /// False until the first directory refresh succeeds
    pub sessions_loaded: bool,
    pub total_unread: u32,
    pub selected: Option<Uuid>,
    /// Messages of the selected session with grouping metadata
    pub messages: Vec<MessageView>,
    pub connection: ConnectionState,
    pub is_connected: bool,
    /// True between selecting a session and its first history load
    pub is_loading: bool,
    /// Last history load failure for the selected session
    pub history_error: Option<String>,
}

enum Command {
    Select {
        session_id: Uuid,
        reply: oneshot::Sender<()>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
    Send {
        text: String,
        reply: oneshot::Sender<Result<Message, ChatError>>,
    },
    Resend {
        client_id: Uuid,
        reply: oneshot::Sender<Result<Message, ChatError>>,
    },
}

enum Internal {
    History {
        generation: u64,
        session_id: Uuid,
        initial: bool,
        result: Result<Vec<MessageRecord>, ApiError>,
    },
    AckTimeout {
        generation: u64,
        session_id: Uuid,
        client_id: Uuid,
    },
    MarkRead {
        session_id: Uuid,
        result: Result<(), ApiError>,
    },
}

/// Caller-facing handle to a running engine. Cheap to clone.
#[derive(Clone)]
pub struct ChatHandle {
    commands: mpsc::UnboundedSender<Command>,
    view: watch::Receiver<ChatView>,
    shutdown: CancellationToken,
}

impl ChatHandle {
    /// Current session list, newest activity first
    pub fn sessions(&self) -> Vec<ChatSession> {
        self.view.borrow().sessions.clone()
    }

    /// Messages of the selected session
    pub fn messages(&self) -> Vec<MessageView> {
        self.view.borrow().messages.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.view.borrow().is_connected
    }

    pub fn is_loading(&self) -> bool {
        self.view.borrow().is_loading
    }

    pub fn view(&self) -> ChatView {
        self.view.borrow().clone()
    }

    /// Receiver that changes whenever the view does
    pub fn subscribe(&self) -> watch::Receiver<ChatView> {
        self.view.clone()
    }

    /// Make `session_id` the open conversation.
    ///
    /// Its unread count is zeroed before this returns; the previous channel
    /// is fully closed before the new one starts connecting.
    pub async fn select_session(&self, session_id: Uuid) -> Result<(), ChatError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Select { session_id, reply }, rx).await
    }

    /// Close the open conversation and its channel
    pub async fn close_session(&self) -> Result<(), ChatError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Close { reply }, rx).await
    }

    /// Send text to the open conversation.
    ///
    /// Returns the local pending message right away; confirmation arrives
    /// later through the view.
    pub async fn send_message(&self, text: impl Into<String>) -> Result<Message, ChatError> {
        let (reply, rx) = oneshot::channel();
        let text = text.into();
        self.request(Command::Send { text, reply }, rx).await?
    }

    /// Send a failed message again as a new pending message
    pub async fn resend(&self, client_id: Uuid) -> Result<Message, ChatError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Resend { client_id, reply }, rx).await?
    }

    /// Stop the poller and the channel
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn request<T>(&self, command: Command, rx: oneshot::Receiver<T>) -> Result<T, ChatError> {
        self.commands
            .send(command)
            .map_err(|_| ChatError::EngineStopped)?;
        rx.await.map_err(|_| ChatError::EngineStopped)
    }
}

/// Reducer state. Owned by the engine task.
pub struct ChatEngine {
    config: EngineConfig,
    api: Arc<dyn ChatApi>,
    directory: SessionDirectory,
    channel: ChannelManager,
    log: MessageLog,
    /// When each armed ack timer fires, by client id
    ack_deadlines: HashMap<Uuid, Instant>,
    loading: bool,
    history_error: Option<String>,
    internal: mpsc::UnboundedSender<Internal>,
    view: watch::Sender<ChatView>,
}

impl ChatEngine {
    /// Start the engine and its directory poller.
    ///
    /// The returned task finishes after `ChatHandle::shutdown` or once every
    /// handle is dropped.
    pub fn spawn(
        config: EngineConfig,
        api: Arc<dyn ChatApi>,
        connector: Arc<dyn Connector>,
    ) -> (ChatHandle, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (poll_tx, poll_rx) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (view_tx, view_rx) = watch::channel(ChatView::default());
        let shutdown = CancellationToken::new();

        let poller = spawn_poller(
            api.clone(),
            config.poll_interval,
            poll_tx,
            shutdown.child_token(),
        );

        let engine = ChatEngine {
            channel: ChannelManager::new(connector, ReconnectPolicy::from(&config), signal_tx),
            log: MessageLog::new(config.local_role),
            directory: SessionDirectory::new(),
            ack_deadlines: HashMap::new(),
            loading: false,
            history_error: None,
            internal: internal_tx,
            view: view_tx,
            config,
            api,
        };

        let task = tokio::spawn(engine.run(
            command_rx,
            poll_rx,
            signal_rx,
            internal_rx,
            shutdown.clone(),
            poller,
        ));

        let handle = ChatHandle {
            commands: command_tx,
            view: view_rx,
            shutdown,
        };
        (handle, task)
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut polls: mpsc::UnboundedReceiver<PollOutcome>,
        mut signals: mpsc::UnboundedReceiver<ChannelSignal>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
        shutdown: CancellationToken,
        poller: JoinHandle<()>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },

                Some(outcome) = polls.recv() => self.handle_poll(outcome),

                Some(signal) = signals.recv() => self.handle_signal(signal),

                Some(event) = internal.recv() => self.handle_internal(event),
            }
            self.publish();
        }

        info!("Chat engine stopping");
        shutdown.cancel();
        self.channel.close().await;
        let _ = poller.await;
        self.publish();
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Select { session_id, reply } => {
                self.select(session_id).await;
                self.publish();
                let _ = reply.send(());
            }
            Command::Close { reply } => {
                self.leave_current().await;
                self.directory.deselect();
                self.publish();
                let _ = reply.send(());
            }
            Command::Send { text, reply } => {
                let result = self.send(text);
                self.publish();
                let _ = reply.send(result);
            }
            Command::Resend { client_id, reply } => {
                let result = self.resend(client_id);
                self.publish();
                let _ = reply.send(result);
            }
        }
    }

    async fn select(&mut self, session_id: Uuid) {
        self.directory.mark_read_local(session_id);
        self.spawn_mark_read(session_id);

        let reopening = self.channel.session_id() == Some(session_id)
            && self.channel.state() != ConnectionState::Disconnected;
        if reopening {
            self.directory.select(session_id);
            return;
        }

        self.leave_current().await;
        // Observers see the old channel down before the new one starts.
        self.publish();

        self.directory.select(session_id);
        self.loading = true;
        self.history_error = None;
        self.channel.open(session_id).await;
    }

    /// Close the current channel and fail sends whose timers die with it
    async fn leave_current(&mut self) {
        if let Some(previous) = self.channel.session_id() {
            let failed = self.log.session_mut(previous).fail_pending();
            if !failed.is_empty() {
                warn!(
                    "{} unacknowledged message(s) in session {} marked failed",
                    failed.len(),
                    previous
                );
            }
        }
        self.channel.close().await;
        self.ack_deadlines.clear();
        self.loading = false;
    }

    fn spawn_mark_read(&self, session_id: Uuid) {
        let api = self.api.clone();
        let internal = self.internal.clone();
        tokio::spawn(async move {
            let result = api.mark_read(session_id).await;
            let _ = internal.send(Internal::MarkRead { session_id, result });
        });
    }

    fn spawn_history(&self, session_id: Uuid, generation: u64, initial: bool) {
        let api = self.api.clone();
        let internal = self.internal.clone();
        tokio::spawn(async move {
            let result = api.session_messages(session_id).await;
            let _ = internal.send(Internal::History {
                generation,
                session_id,
                initial,
                result,
            });
        });
    }

    fn send(&mut self, text: String) -> Result<Message, ChatError> {
        if text.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let session_id = self.current_session()?;
        self.ensure_can_send()?;
        let message = self
            .log
            .session_mut(session_id)
            .push_pending(text, Utc::now());
        self.transmit(session_id, &message);
        Ok(message)
    }

    fn resend(&mut self, client_id: Uuid) -> Result<Message, ChatError> {
        let session_id = self.current_session()?;
        self.ensure_can_send()?;
        let message = self
            .log
            .session_mut(session_id)
            .take_for_resend(client_id, Utc::now())?;
        self.transmit(session_id, &message);
        Ok(message)
    }

    fn current_session(&self) -> Result<Uuid, ChatError> {
        self.channel
            .session_id()
            .filter(|id| self.directory.selected() == Some(*id))
            .ok_or(ChatError::NoSessionSelected)
    }

    fn ensure_can_send(&self) -> Result<(), ChatError> {
        match self.channel.state() {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Connecting | ConnectionState::Reconnecting
                if self.config.queue_while_reconnecting =>
            {
                Ok(())
            }
            _ => Err(ChatError::NotConnected),
        }
    }

    fn transmit(&mut self, session_id: Uuid, message: &Message) {
        let Some(client_id) = message.client_id else {
            return;
        };
        let frame = ClientFrame::Message {
            content: message.content.clone(),
            client_id: Some(client_id),
        };
        if let Err(e) = self
            .channel
            .send(frame, self.config.queue_while_reconnecting)
        {
            warn!("Failed to queue message {}: {}", client_id, e);
            self.log.session_mut(session_id).mark_failed(client_id);
            return;
        }

        self.arm_ack_timer(session_id, client_id);
    }

    fn arm_ack_timer(&mut self, session_id: Uuid, client_id: Uuid) {
        let Some(token) = self.channel.instance_token() else {
            return;
        };
        let internal = self.internal.clone();
        let generation = self.channel.generation();
        let timeout = self.config.ack_timeout;
        self.ack_deadlines.insert(client_id, Instant::now() + timeout);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    let _ = internal.send(Internal::AckTimeout {
                        generation,
                        session_id,
                        client_id,
                    });
                }
            }
        });
    }

    fn handle_poll(&mut self, outcome: PollOutcome) {
        // Errors are logged by the poller; known sessions stay as they are.
        if let Ok(sessions) = outcome {
            debug!("Directory refresh: {} session(s)", sessions.len());
            self.directory.apply_refresh(sessions);
        }
    }

    fn handle_signal(&mut self, signal: ChannelSignal) {
        if !self.channel.apply(&signal) {
            return;
        }
        let session_id = signal.session_id;

        match signal.event {
            ChannelEvent::Connected { reconnect } => {
                self.spawn_history(session_id, signal.generation, !reconnect);
            }
            ChannelEvent::Frame(ServerFrame::Ack {
                client_id,
                server_id,
                created_at,
            }) => {
                let log = self.log.session_mut(session_id);
                match log.acknowledge(client_id, server_id, created_at) {
                    AckOutcome::Unknown => debug!("Ack for unknown message {}", client_id),
                    AckOutcome::Confirmed => {
                        self.ack_deadlines.remove(&client_id);
                    }
                    AckOutcome::Reassigned(other) => {
                        self.ack_deadlines.remove(&client_id);
                        // The other send showed as sent while its timer ran out.
                        let armed = self
                            .ack_deadlines
                            .get(&other)
                            .is_some_and(|deadline| *deadline > Instant::now());
                        if !armed && log.mark_failed(other) {
                            self.ack_deadlines.remove(&other);
                            warn!("{}", ChatError::AckTimeout { client_id: other });
                        }
                    }
                }
            }
            ChannelEvent::Frame(ServerFrame::Message {
                id,
                sender,
                content,
                created_at,
            }) => {
                let record = MessageRecord {
                    id,
                    sender,
                    content,
                    created_at,
                };
                if let AppendOutcome::Reconciled(client_id) =
                    self.log.session_mut(session_id).append(record)
                {
                    debug!("Echo of {} reconciled by content", client_id);
                }
            }
            ChannelEvent::Reconnecting { .. } => {}
            ChannelEvent::Offline => {
                self.loading = false;
            }
        }
    }

    fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::History {
                generation,
                session_id,
                initial,
                result,
            } => {
                if generation != self.channel.generation()
                    || self.channel.session_id() != Some(session_id)
                {
                    debug!("Dropping history for closed channel of session {}", session_id);
                    return;
                }
                match result {
                    Ok(records) => {
                        let added = self.log.session_mut(session_id).history_loaded(records);
                        debug!("Loaded {} new message(s) for session {}", added, session_id);
                        self.history_error = None;
                    }
                    Err(e) => {
                        warn!("Failed to load history for session {}: {}", session_id, e);
                        self.history_error = Some(e.to_string());
                    }
                }
                if initial {
                    self.loading = false;
                }
            }
            Internal::AckTimeout {
                generation,
                session_id,
                client_id,
            } => {
                if generation != self.channel.generation() {
                    return;
                }
                self.ack_deadlines.remove(&client_id);
                if self.log.session_mut(session_id).mark_failed(client_id) {
                    warn!("{}", ChatError::AckTimeout { client_id });
                }
            }
            Internal::MarkRead { session_id, result } => match result {
                Ok(()) => debug!("Session {} marked read", session_id),
                Err(e) => warn!("Failed to mark session {} read: {}", session_id, e),
            },
        }
    }

    fn publish(&self) {
        let selected = self.directory.selected();
        let messages = selected
            .map(|id| {
                present(
                    self.log.messages(id),
                    self.config.local_role,
                    self.config.group_gap,
                )
            })
            .unwrap_or_default();

        self.view.send_replace(ChatView {
            sessions: self.directory.sorted(),
            sessions_loaded: self.directory.is_loaded(),
            total_unread: self.directory.total_unread(),
            selected,
            messages,
            connection: self.channel.state(),
            is_connected: self.channel.is_connected(),
            is_loading: self.loading,
            history_error: self.history_error.clone(),
        });
    }
}
