pub mod conversation;
pub mod escalation;
pub mod message;
pub mod tier;

pub use conversation::{
    Assignee, Conversation, ConversationId, NewConversation, SentimentSnapshot,
};
pub use escalation::{EscalationEvent, EscalationId, EscalationReason, EscalationStatus};
pub use message::{Channel, Classification, Intent, Message, MessageOrigin, NewMessage};
pub use tier::Tier;
