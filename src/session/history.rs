//! Ordered conversation history.
//!
//! The base (system) message is always the first element. `reset` drops
//! every other turn and reinstates the same base message, id included.

use uuid::Uuid;

use crate::inference::llama_ffi::ChatMessage;
use crate::session::message::Message;

#[derive(Debug, Clone)]
pub struct ConversationHistory {
    base: Message,
    messages: Vec<Message>,
}

impl ConversationHistory {
    /// Start a history whose base message is `base_prompt`, trimmed.
    pub fn new(base_prompt: &str) -> Self {
        let base = Message::system(base_prompt.trim());
        Self {
            messages: vec![base.clone()],
            base,
        }
    }

    pub fn base(&self) -> &Message {
        &self.base
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Never true: the base message is always present.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Remove the message with `id` if it is the most recent one.
    pub fn pop_if_last(&mut self, id: Uuid) -> Option<Message> {
        match self.messages.last() {
            Some(last) if last.id() == id && last.id() != self.base.id() => self.messages.pop(),
            _ => None,
        }
    }

    pub fn reset(&mut self) {
        self.messages.clear();
        self.messages.push(self.base.clone());
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.clone()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    /// Native payload: every turn in order.
    pub fn to_chat(&self) -> Vec<ChatMessage> {
        self.messages.iter().map(Message::to_chat).collect()
    }
}
