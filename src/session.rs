//! session.rs
//!
//! Conversation history for one generation target.

use serde::{Deserialize, Serialize};

use crate::state::{Message, Role, TestRecord};

/// Ordered, append-only (during a run) chat history.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Session {
    messages: Vec<Message>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, role: Role, content: impl Into<String>) -> &Message {
        self.messages.push(Message::new(role, content));
        &self.messages[self.messages.len() - 1]
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.clone()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Clears everything. Only ever called on explicit user request.
    pub fn reset(&mut self) {
        self.messages.clear();
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn has_system_prompt(&self) -> bool {
        self.messages.iter().any(|m| m.role == Role::System)
    }

    /// Replays messages through `append`, keeping their roles and content.
    pub fn replay<'a>(&mut self, messages: impl IntoIterator<Item = &'a Message>) {
        for m in messages {
            self.append(m.role, m.content.clone());
        }
    }

    /// Few-shot continuation from a stored exchange.
    pub fn seed_from(&mut self, record: &TestRecord) {
        self.replay(&record.messages);
    }

    /// Content of the most recent assistant reply, if any.
    pub fn last_assistant(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .map(|m| m.content.as_str())
    }
}
