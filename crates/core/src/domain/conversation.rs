use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::message::{Channel, Message, MessageOrigin};
use crate::domain::tier::Tier;
use crate::flows::ConversationState;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who currently owns the conversation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum Assignee {
    Handler(String),
    Queue(String),
    Operator(String),
}

impl Assignee {
    pub fn encode(&self) -> String {
        match self {
            Self::Handler(name) => format!("handler:{name}"),
            Self::Queue(name) => format!("queue:{name}"),
            Self::Operator(name) => format!("operator:{name}"),
        }
    }

    pub fn decode(value: &str) -> Option<Self> {
        let (kind, name) = value.split_once(':')?;
        let name = name.to_string();
        match kind {
            "handler" => Some(Self::Handler(name)),
            "queue" => Some(Self::Queue(name)),
            "operator" => Some(Self::Operator(name)),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub caller_id: String,
    pub tier: Tier,
    pub channel: Channel,
    pub state: ConversationState,
    pub assigned_agent: Option<Assignee>,
    pub messages: Vec<Message>,
    pub sentiment_trend: f64,
    pub negative_streak: u32,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl Conversation {
    pub fn open(
        id: ConversationId,
        caller_id: impl Into<String>,
        tier: Tier,
        channel: Channel,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            caller_id: caller_id.into(),
            tier,
            channel,
            state: ConversationState::New,
            assigned_agent: None,
            messages: Vec::new(),
            sentiment_trend: 0.0,
            negative_streak: 0,
            created_at: now,
            last_activity_at: now,
        }
    }

    pub fn last_sequence(&self) -> u64 {
        self.messages.last().map(|message| message.sequence).unwrap_or(0)
    }

    /// Number of customer turns so far.
    pub fn customer_turns(&self) -> usize {
        self.messages.iter().filter(|message| message.origin == MessageOrigin::Customer).count()
    }

    pub fn is_idle_since(&self, cutoff: DateTime<Utc>) -> bool {
        self.last_activity_at < cutoff
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewConversation {
    pub caller_id: String,
    pub tier: Tier,
    pub channel: Channel,
}

/// Result of an atomic sentiment update on the store side.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SentimentSnapshot {
    pub trend: f64,
    pub negative_streak: u32,
}

#[cfg(test)]
mod tests {
    use super::Assignee;

    #[test]
    fn assignee_encoding_survives_storage() {
        let cases = [
            Assignee::Handler("order_management".to_string()),
            Assignee::Queue("priority".to_string()),
            Assignee::Operator("dana@support".to_string()),
        ];

        for assignee in cases {
            assert_eq!(Assignee::decode(&assignee.encode()), Some(assignee));
        }
        assert_eq!(Assignee::decode("robot"), None);
    }
}
