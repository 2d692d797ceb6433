//! Interactive chat loop on top of a running engine

use anyhow::{Context, Result};
use chat_engine::{ChatError, ChatHandle, ChatView, ConnectionState, DeliveryState, MessageView};
use std::collections::HashMap;
use tokio::io::{AsyncBufReadExt, BufReader};
use uuid::Uuid;

use crate::ui;

/// One line typed by the operator
#[derive(Debug, PartialEq, Eq)]
pub enum Input {
    Text(String),
    Retry,
    /// Reopen the current conversation, or switch to another one
    Open(Option<Uuid>),
    Sessions,
    Quit,
    Empty,
    Unknown(String),
}

pub fn parse_input(line: &str) -> Input {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Input::Empty;
    }
    let Some(command) = trimmed.strip_prefix('/') else {
        return Input::Text(trimmed.to_string());
    };

    let mut parts = command.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("quit" | "q" | "exit"), None) => Input::Quit,
        (Some("retry" | "r"), None) => Input::Retry,
        (Some("sessions" | "ls"), None) => Input::Sessions,
        (Some("open"), None) => Input::Open(None),
        (Some("open"), Some(id)) => match Uuid::parse_str(id) {
            Ok(id) => Input::Open(Some(id)),
            Err(_) => Input::Unknown(trimmed.to_string()),
        },
        _ => Input::Unknown(trimmed.to_string()),
    }
}

/// What changed between two views
#[derive(Debug, PartialEq)]
pub enum Update {
    Opened(Uuid),
    Connection(ConnectionState),
    Message(MessageView),
    Failed(MessageView),
    HistoryError(String),
}

/// Tracks what has been printed so each view only prints the difference
#[derive(Debug, Default)]
pub struct Transcript {
    session: Option<Uuid>,
    connection: ConnectionState,
    /// Message key -> last printed state
    seen: HashMap<Uuid, DeliveryState>,
    history_error: Option<String>,
}

fn key(view: &MessageView) -> Uuid {
    view.message.client_id.unwrap_or(view.message.id)
}

impl Transcript {
    pub fn diff(&mut self, view: &ChatView) -> Vec<Update> {
        let mut updates = Vec::new();

        if view.selected != self.session {
            self.session = view.selected;
            self.seen.clear();
            self.history_error = None;
            if let Some(id) = view.selected {
                updates.push(Update::Opened(id));
            }
        }

        if view.connection != self.connection {
            self.connection = view.connection;
            updates.push(Update::Connection(view.connection));
        }

        if view.history_error != self.history_error {
            self.history_error = view.history_error.clone();
            if let Some(error) = &view.history_error {
                updates.push(Update::HistoryError(error.clone()));
            }
        }

        for message in &view.messages {
            let state = message.message.state;
            match self.seen.insert(key(message), state) {
                None => updates.push(Update::Message(message.clone())),
                Some(previous)
                    if previous != DeliveryState::Failed && state == DeliveryState::Failed =>
                {
                    updates.push(Update::Failed(message.clone()))
                }
                Some(_) => {}
            }
        }

        updates
    }
}

fn last_failed(view: &ChatView) -> Option<Uuid> {
    view.messages
        .iter()
        .rev()
        .find(|m| m.message.state == DeliveryState::Failed)
        .and_then(|m| m.message.client_id)
}

fn counterpart(view: &ChatView) -> String {
    view.selected
        .and_then(|id| view.sessions.iter().find(|s| s.id == id))
        .map(|s| s.customer_name.clone())
        .unwrap_or_else(|| "Customer".to_string())
}

fn render(transcript: &mut Transcript, view: &ChatView) {
    for update in transcript.diff(view) {
        match update {
            Update::Opened(_) => ui::print_chat_header(&counterpart(view)),
            Update::Connection(state) => ui::print_connection(state),
            Update::Message(message) => ui::print_message(&message, &counterpart(view)),
            Update::Failed(message) => ui::print_failed(&message),
            Update::HistoryError(error) => {
                ui::print_error(&format!("Could not load history: {}", error))
            }
        }
    }
}

fn list_sessions(view: &ChatView) {
    if !view.sessions_loaded {
        ui::print_error("Session list not loaded yet");
        return;
    }
    ui::print_sessions(&view.sessions);
    ui::print_unread_total(view.total_unread);
}

/// Open `session_id` and relay stdin to it until the operator quits
pub async fn run(chat: &ChatHandle, session_id: Uuid) -> Result<()> {
    let mut views = chat.subscribe();
    let mut transcript = Transcript::default();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    chat.select_session(session_id)
        .await
        .context("Failed to open session")?;
    let initial = views.borrow_and_update().clone();
    render(&mut transcript, &initial);

    loop {
        tokio::select! {
            changed = views.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = views.borrow_and_update().clone();
                render(&mut transcript, &view);
            }

            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read from stdin")? else {
                    break;
                };
                match parse_input(&line) {
                    Input::Quit => break,
                    Input::Empty => {}
                    Input::Text(text) => {
                        if let Err(e) = chat.send_message(text).await {
                            ui::print_error(&e.to_string());
                        }
                    }
                    Input::Retry => match last_failed(&chat.view()) {
                        Some(client_id) => {
                            if let Err(e) = chat.resend(client_id).await {
                                ui::print_error(&e.to_string());
                            }
                        }
                        None => ui::print_error("Nothing to resend"),
                    },
                    Input::Open(target) => {
                        let target = target.or(chat.view().selected).unwrap_or(session_id);
                        chat.select_session(target).await?;
                    }
                    Input::Sessions => list_sessions(&chat.view()),
                    Input::Unknown(command) => {
                        ui::print_error(&format!("Unknown command: {}", command))
                    }
                }
            }
        }
    }

    match chat.close_session().await {
        Ok(()) | Err(ChatError::EngineStopped) => Ok(()),
        Err(e) => Err(e.into()),
    }
}
