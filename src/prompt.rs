//! Conversation prompt building
//!
//! Turns role-tagged history into the text handed to prefill. The session
//! itself never looks at roles; it only sees the rendered prompt.

use crate::types::message::{Message, Role};

/// Renders a message history into a prompt
pub trait PromptBuilder {
    /// `open_reply` appends the header of an assistant turn so the model
    /// continues as the assistant.
    fn build(&self, messages: &[Message], open_reply: bool) -> String;
}

/// ChatML, as used by Qwen: `<|im_start|>role\ncontent<|im_end|>\n`
#[derive(Debug, Clone, Copy, Default)]
pub struct ChatMlBuilder;

impl PromptBuilder for ChatMlBuilder {
    fn build(&self, messages: &[Message], open_reply: bool) -> String {
        let mut prompt = String::new();
        for message in messages {
            prompt.push_str("<|im_start|>");
            prompt.push_str(message.role.as_str());
            prompt.push('\n');
            prompt.push_str(&message.content);
            prompt.push_str("<|im_end|>\n");
        }
        if open_reply {
            prompt.push_str("<|im_start|>assistant\n");
        }
        prompt
    }
}

/// In-memory chat history
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a conversation with a system prompt (skipped when blank)
    pub fn with_system_prompt(system_prompt: &str) -> Self {
        let mut conversation = Self::new();
        if !system_prompt.trim().is_empty() {
            conversation.push(Message::system(system_prompt));
        }
        conversation
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Last message, if it came from the given role
    pub fn last_from(&self, role: Role) -> Option<&Message> {
        self.messages.last().filter(|m| m.role == role)
    }

    /// Prompt for the model's next reply.
    pub fn render(&self, builder: &dyn PromptBuilder) -> String {
        builder.build(&self.messages, true)
    }

    /// Drops everything except the system prompt.
    pub fn reset(&mut self) {
        self.messages.retain(|m| m.role == Role::System);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chatml_layout() {
        let mut conversation = Conversation::with_system_prompt("Be brief.");
        conversation.push(Message::user("Hello"));

        let prompt = conversation.render(&ChatMlBuilder);
        assert_eq!(
            prompt,
            "<|im_start|>system\nBe brief.<|im_end|>\n\
             <|im_start|>user\nHello<|im_end|>\n\
             <|im_start|>assistant\n"
        );
    }

    #[test]
    fn test_blank_system_prompt_skipped() {
        let conversation = Conversation::with_system_prompt("  ");
        assert!(conversation.messages().is_empty());
    }

    #[test]
    fn test_history_and_reset() {
        let mut conversation = Conversation::with_system_prompt("sys");
        conversation.push(Message::user("a"));
        conversation.push(Message::assistant("b"));
        assert_eq!(conversation.last_from(Role::Assistant).unwrap().content, "b");
        assert!(conversation.last_from(Role::User).is_none());

        let closed = ChatMlBuilder.build(conversation.messages(), false);
        assert!(closed.ends_with("b<|im_end|>\n"));

        conversation.reset();
        assert_eq!(conversation.messages().len(), 1);
        assert_eq!(conversation.messages()[0].role, Role::System);
    }
}
