pub mod audit;
pub mod config;
pub mod domain;
pub mod errors;
pub mod flows;
pub mod rate_limit;
pub mod sentiment;

pub use chrono;

pub use audit::{AuditContext, AuditEvent, AuditSink, InMemoryAuditSink, NoopAuditSink};
pub use domain::conversation::{
    Assignee, Conversation, ConversationId, NewConversation, SentimentSnapshot,
};
pub use domain::escalation::{EscalationEvent, EscalationId, EscalationReason, EscalationStatus};
pub use domain::message::{Channel, Classification, Intent, Message, MessageOrigin, NewMessage};
pub use domain::tier::Tier;
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use flows::{ConversationEvent, ConversationFlow, ConversationState, FlowAction};
pub use rate_limit::{Admission, BucketConfig, RateLimiter, Remaining, TierLimits};
pub use sentiment::SentimentPolicy;
