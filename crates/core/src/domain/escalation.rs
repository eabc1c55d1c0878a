use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::conversation::ConversationId;
use crate::domain::message::Message;
use crate::domain::tier::Tier;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EscalationId(pub String);

impl EscalationId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for EscalationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    ExplicitRequest,
    NegativeSentiment,
    Complexity,
    AgentFailure,
    TurnLimitExceeded,
}

impl EscalationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExplicitRequest => "explicit_request",
            Self::NegativeSentiment => "negative_sentiment",
            Self::Complexity => "complexity",
            Self::AgentFailure => "agent_failure",
            Self::TurnLimitExceeded => "turn_limit_exceeded",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "explicit_request" => Some(Self::ExplicitRequest),
            "negative_sentiment" => Some(Self::NegativeSentiment),
            "complexity" => Some(Self::Complexity),
            "agent_failure" => Some(Self::AgentFailure),
            "turn_limit_exceeded" => Some(Self::TurnLimitExceeded),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationStatus {
    Pending,
    Claimed,
    Resolved,
}

impl EscalationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Resolved => "resolved",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "claimed" => Some(Self::Claimed),
            "resolved" => Some(Self::Resolved),
            _ => None,
        }
    }
}

/// Handoff record. `snapshot` is an owned copy of the history at trigger time and
/// never changes after construction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EscalationEvent {
    pub id: EscalationId,
    pub conversation_id: ConversationId,
    pub caller_id: String,
    pub tier: Tier,
    pub reason: EscalationReason,
    pub detail: String,
    pub snapshot: Vec<Message>,
    pub target_queue: String,
    pub status: EscalationStatus,
    pub claimed_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl EscalationEvent {
    pub fn pending(
        conversation_id: ConversationId,
        caller_id: impl Into<String>,
        tier: Tier,
        reason: EscalationReason,
        detail: impl Into<String>,
        snapshot: Vec<Message>,
        target_queue: impl Into<String>,
    ) -> Self {
        Self {
            id: EscalationId::generate(),
            conversation_id,
            caller_id: caller_id.into(),
            tier,
            reason,
            detail: detail.into(),
            snapshot,
            target_queue: target_queue.into(),
            status: EscalationStatus::Pending,
            claimed_by: None,
            created_at: Utc::now(),
            claimed_at: None,
            resolved_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{EscalationReason, EscalationStatus};

    #[test]
    fn escalation_reason_round_trips_from_storage_encoding() {
        let cases = [
            EscalationReason::ExplicitRequest,
            EscalationReason::NegativeSentiment,
            EscalationReason::Complexity,
            EscalationReason::AgentFailure,
            EscalationReason::TurnLimitExceeded,
        ];

        for reason in cases {
            assert_eq!(EscalationReason::parse(reason.as_str()), Some(reason));
        }
    }

    #[test]
    fn escalation_status_round_trips_from_storage_encoding() {
        for status in
            [EscalationStatus::Pending, EscalationStatus::Claimed, EscalationStatus::Resolved]
        {
            assert_eq!(EscalationStatus::parse(status.as_str()), Some(status));
        }
    }
}
