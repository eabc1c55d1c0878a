use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    New,
    Active,
    Escalating,
    HandedOff,
    Closed,
}

impl ConversationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Active => "active",
            Self::Escalating => "escalating",
            Self::HandedOff => "handed_off",
            Self::Closed => "closed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "new" => Some(Self::New),
            "active" => Some(Self::Active),
            "escalating" => Some(Self::Escalating),
            "handed_off" => Some(Self::HandedOff),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::HandedOff | Self::Closed)
    }

    /// States an idle sweep may still close.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::New | Self::Active | Self::Escalating)
    }
}

impl std::fmt::Display for ConversationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversationEvent {
    FirstMessage,
    TurnCompleted,
    EscalationTriggered,
    /// The handoff could not be queued; the escalation is undone.
    HandoffFailed,
    HandoffClaimed,
    InactivityTimeout,
    CloseRequested,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowAction {
    ClassifyMessage,
    DispatchHandler,
    SnapshotHistory,
    EnqueueHandoff,
    NotifyOperator,
    ArchiveConversation,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub from: ConversationState,
    pub to: ConversationState,
    pub event: ConversationEvent,
    pub actions: Vec<FlowAction>,
}
