pub mod conversation;

pub use conversation::{ChatMessage, Conversation, Role};
