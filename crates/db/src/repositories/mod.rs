use async_trait::async_trait;
use thiserror::Error;

use concierge_core::chrono::{DateTime, Utc};
use concierge_core::domain::conversation::{
    Assignee, Conversation, ConversationId, NewConversation, SentimentSnapshot,
};
use concierge_core::domain::escalation::{EscalationEvent, EscalationId};
use concierge_core::domain::message::{Message, NewMessage};
use concierge_core::flows::ConversationState;
use concierge_core::sentiment::SentimentPolicy;

pub mod conversation;
pub mod escalation;
pub mod memory;

pub use conversation::SqlConversationStore;
pub use escalation::SqlHumanQueue;
pub use memory::{InMemoryConversationStore, InMemoryHumanQueue};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("conversation `{0}` not found")]
    NotFound(ConversationId),
    #[error("conversation state changed: expected {expected}, found {actual}")]
    Conflict { expected: ConversationState, actual: ConversationState },
    #[error("conversation store unavailable: {0}")]
    Unavailable(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

impl StoreError {
    /// Infrastructure failures, as opposed to answers about the data.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Database(_) | Self::Decode(_))
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("escalation `{0}` not found")]
    NotFound(EscalationId),
    #[error("escalation `{id}` already claimed by `{operator}`")]
    AlreadyClaimed { id: EscalationId, operator: String },
    #[error("escalation `{0}` already resolved")]
    AlreadyResolved(EscalationId),
    #[error("human queue unavailable: {0}")]
    Unavailable(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

/// Durable conversation state. Every mutation is atomic per conversation.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn load(&self, id: &ConversationId) -> Result<Conversation, StoreError>;

    async fn create(&self, request: NewConversation) -> Result<Conversation, StoreError>;

    /// Appends a message, assigning the next sequence number and the timestamp.
    async fn append(&self, id: &ConversationId, message: NewMessage)
        -> Result<Message, StoreError>;

    /// Compare-and-swap on the conversation state. `assignee` of `None` keeps the
    /// current assignment. The returned conversation is the post-transition snapshot.
    async fn transition(
        &self,
        id: &ConversationId,
        expected: ConversationState,
        new: ConversationState,
        assignee: Option<Assignee>,
    ) -> Result<Conversation, StoreError>;

    /// Folds `score` into the stored trend and streak under `policy`.
    async fn record_sentiment(
        &self,
        id: &ConversationId,
        score: f64,
        policy: &SentimentPolicy,
    ) -> Result<SentimentSnapshot, StoreError>;

    /// Open conversations whose last activity is strictly before `cutoff`.
    async fn list_idle(&self, cutoff: DateTime<Utc>) -> Result<Vec<ConversationId>, StoreError>;
}

/// Human operator queue. Ordered by tier priority, then arrival.
#[async_trait]
pub trait HumanQueue: Send + Sync {
    /// Returns the 1-based position of the event within its target queue.
    async fn enqueue(&self, event: EscalationEvent) -> Result<usize, QueueError>;

    async fn claim(
        &self,
        id: &EscalationId,
        operator: &str,
    ) -> Result<EscalationEvent, QueueError>;

    async fn resolve(&self, id: &EscalationId) -> Result<EscalationEvent, QueueError>;

    async fn pending(&self, queue: &str) -> Result<Vec<EscalationEvent>, QueueError>;

    async fn find(&self, id: &EscalationId) -> Result<Option<EscalationEvent>, QueueError>;
}
