//! Bounded conversation history.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Author of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Ordered user/assistant turn history with an optional system prompt.
///
/// With `max_history_length > 0` the history is a FIFO: inserting past the
/// bound drops the oldest entry. The system prompt is never dropped.
pub struct ConversationContext {
    system: Option<ChatMessage>,
    history: VecDeque<ChatMessage>,
    max_history_length: usize,
}

impl ConversationContext {
    /// Create a context. `max_history_length = 0` means unbounded.
    pub fn new(system_prompt: Option<String>, max_history_length: usize) -> Self {
        Self {
            system: system_prompt.map(|s| ChatMessage::new(Role::System, s)),
            history: VecDeque::new(),
            max_history_length,
        }
    }

    /// Append a user turn.
    pub fn add_user(&mut self, content: impl Into<String>) {
        self.push(ChatMessage::new(Role::User, content));
    }

    /// Append an assistant turn.
    pub fn add_assistant(&mut self, content: impl Into<String>) {
        self.push(ChatMessage::new(Role::Assistant, content));
    }

    fn push(&mut self, message: ChatMessage) {
        self.history.push_back(message);
        if self.max_history_length > 0 {
            while self.history.len() > self.max_history_length {
                let _ = self.history.pop_front();
            }
        }
    }

    /// Drop all turns, preserving the system prompt.
    pub fn clear(&mut self) {
        self.history.clear();
    }

    /// Replace (or remove) the system prompt.
    pub fn set_system(&mut self, prompt: Option<String>) {
        self.system = prompt.map(|s| ChatMessage::new(Role::System, s));
    }

    /// The system prompt (if any) followed by the history, oldest first.
    pub fn messages(&self) -> Vec<ChatMessage> {
        let mut out = Vec::with_capacity(self.history.len() + 1);
        if let Some(ref system) = self.system {
            out.push(system.clone());
        }
        out.extend(self.history.iter().cloned());
        out
    }

    /// Number of stored turns, excluding the system prompt.
    pub fn len(&self) -> usize {
        self.history.len()
    }

    /// Whether the history holds no turns.
    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_prompt_prepended() {
        let mut ctx = ConversationContext::new(Some("be brief".to_owned()), 10);
        ctx.add_user("hi");
        let messages = ctx.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[0].content, "be brief");
        assert_eq!(messages[1].role, Role::User);
    }

    #[test]
    fn fifo_bound_drops_oldest() {
        let mut ctx = ConversationContext::new(None, 3);
        for i in 0..5 {
            ctx.add_user(format!("m{i}"));
        }
        let messages = ctx.messages();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].content, "m2");
        assert_eq!(messages[2].content, "m4");
    }

    #[test]
    fn bound_excludes_system_prompt() {
        let mut ctx = ConversationContext::new(Some("sys".to_owned()), 2);
        ctx.add_user("a");
        ctx.add_assistant("b");
        ctx.add_user("c");
        let messages = ctx.messages();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].content, "sys");
        assert_eq!(messages[1].content, "b");
        assert_eq!(messages[2].content, "c");
    }

    #[test]
    fn zero_bound_is_unbounded() {
        let mut ctx = ConversationContext::new(None, 0);
        for i in 0..100 {
            ctx.add_user(format!("m{i}"));
        }
        assert_eq!(ctx.len(), 100);
    }

    #[test]
    fn clear_preserves_system_prompt() {
        let mut ctx = ConversationContext::new(Some("sys".to_owned()), 10);
        ctx.add_user("a");
        ctx.clear();
        assert!(ctx.is_empty());
        let messages = ctx.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::System);
    }

    #[test]
    fn set_system_replaces_and_removes() {
        let mut ctx = ConversationContext::new(None, 10);
        ctx.set_system(Some("new".to_owned()));
        assert_eq!(ctx.messages()[0].content, "new");
        ctx.set_system(None);
        assert!(ctx.messages().is_empty());
    }

    #[test]
    fn insertion_order_preserved() {
        let mut ctx = ConversationContext::new(None, 10);
        ctx.add_user("q1");
        ctx.add_assistant("a1");
        ctx.add_user("q2");
        let roles: Vec<Role> = ctx.messages().iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::User]);
    }
}
