//! # Messages and the conversation transcript
//!
//! [`Message`] is a closed set of roles, each carrying its text. A
//! [`Conversation`] is the transcript of one session: it only grows by a User
//! message followed by exactly one Assistant message, or is cleared outright.

use serde::{Deserialize, Serialize};

use crate::error::{GreptError, Result};

/// One chat message.
///
/// Serialized as `{"role": "...", "content": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", content = "content", rename_all = "lowercase")]
pub enum Message {
    System(String),
    User(String),
    Assistant(String),
}

impl Message {
    /// The text payload regardless of role.
    pub fn content(&self) -> &str {
        match self {
            Message::System(text) | Message::User(text) | Message::Assistant(text) => text,
        }
    }

    pub fn role(&self) -> &'static str {
        match self {
            Message::System(_) => "system",
            Message::User(_) => "user",
            Message::Assistant(_) => "assistant",
        }
    }
}

/// Ordered transcript of user and assistant turns.
///
/// The transcript never holds an Assistant message that does not answer the
/// User message directly before it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new turn with the user's content.
    ///
    /// # Errors
    /// Fails if the previous turn has not been answered yet.
    pub fn push_user(&mut self, content: impl Into<String>) -> Result<()> {
        if self.awaiting_reply() {
            return Err(GreptError::Conversation(
                "previous user message has no reply",
            ));
        }
        self.messages.push(Message::User(content.into()));
        Ok(())
    }

    /// Close the open turn with the assistant's reply.
    ///
    /// # Errors
    /// Fails if there is no open User turn.
    pub fn push_assistant(&mut self, content: impl Into<String>) -> Result<()> {
        if !self.awaiting_reply() {
            return Err(GreptError::Conversation(
                "assistant reply without a user message",
            ));
        }
        self.messages.push(Message::Assistant(content.into()));
        Ok(())
    }

    /// True when the last message is a User message waiting for a reply.
    pub fn awaiting_reply(&self) -> bool {
        matches!(self.messages.last(), Some(Message::User(_)))
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// The most recent assistant reply, if any.
    pub fn last_reply(&self) -> Option<&str> {
        self.messages.iter().rev().find_map(|m| match m {
            Message::Assistant(text) => Some(text.as_str()),
            _ => None,
        })
    }
}
