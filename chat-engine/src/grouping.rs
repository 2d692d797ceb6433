//! Presentation-neutral grouping of consecutive messages

use serde::Serialize;
use shared::Sender;
use std::time::Duration;

use crate::message_log::Message;

/// A message plus the metadata a renderer needs
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageView {
    pub message: Message,
    /// Authored by the local operator
    pub is_mine: bool,
    /// Begins a new visual block
    pub group_start: bool,
}

/// Group-start flag for each message of an ordered list.
///
/// A message starts a group when it is the first one, when its sender differs
/// from the previous message's, or when more than `gap` passed since the
/// previous message.
pub fn group_starts(messages: &[Message], gap: Duration) -> Vec<bool> {
    messages
        .iter()
        .enumerate()
        .map(|(i, current)| match i.checked_sub(1).map(|p| &messages[p]) {
            None => true,
            Some(prev) if prev.sender != current.sender => true,
            Some(prev) => match (current.created_at - prev.created_at).to_std() {
                Ok(elapsed) => elapsed > gap,
                Err(_) => false,
            },
        })
        .collect()
}

/// Build render-ready views for an ordered message list
pub fn present(messages: &[Message], local_role: Sender, gap: Duration) -> Vec<MessageView> {
    group_starts(messages, gap)
        .into_iter()
        .zip(messages)
        .map(|(group_start, message)| MessageView {
            is_mine: message.sender == local_role,
            group_start,
            message: message.clone(),
        })
        .collect()
}
