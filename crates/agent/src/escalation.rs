//! Escalation triggers and the exactly-once handoff to the human queue.
//!
//! `evaluate` is pure. `escalate` is gated by a single store compare-and-swap from
//! `Active` to `Escalating`; the conversation returned by that swap is the snapshot the
//! operator receives. Losing the swap means another turn already escalated (or closed)
//! the conversation, and the attempt is abandoned without an event. A handoff that cannot
//! be queued is undone with the reverse swap, so the conversation never sits in
//! `Escalating` without a pending event.

use std::sync::Arc;

use concierge_core::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use concierge_core::config::{RoutingConfig, DEFAULT_HANDOFF_KEYWORDS};
use concierge_core::domain::conversation::{Assignee, Conversation, SentimentSnapshot};
use concierge_core::domain::escalation::{EscalationEvent, EscalationReason};
use concierge_core::domain::message::{Classification, Intent};
use concierge_core::domain::tier::Tier;
use concierge_core::flows::{ConversationEvent, ConversationFlow, ConversationState};
use concierge_db::{ConversationStore, HumanQueue, QueueError, StoreError};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::router::TurnFailure;

#[derive(Clone, Debug, PartialEq)]
pub struct EscalationPolicy {
    pub threshold: f64,
    pub negative_streak_limit: u32,
    pub max_turns: u32,
    /// Lowercase phrases that count as asking for a human.
    pub handoff_keywords: Vec<String>,
    pub priority_queue: String,
    pub standard_queue: String,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            threshold: -0.5,
            negative_streak_limit: 2,
            max_turns: 20,
            handoff_keywords: DEFAULT_HANDOFF_KEYWORDS.iter().map(ToString::to_string).collect(),
            priority_queue: "priority".to_string(),
            standard_queue: "standard".to_string(),
        }
    }
}

impl From<&RoutingConfig> for EscalationPolicy {
    fn from(config: &RoutingConfig) -> Self {
        Self {
            threshold: config.escalation_threshold,
            negative_streak_limit: config.negative_streak_limit,
            max_turns: config.max_turns,
            handoff_keywords: config
                .handoff_keywords
                .iter()
                .map(|keyword| keyword.trim().to_lowercase())
                .filter(|keyword| !keyword.is_empty())
                .collect(),
            priority_queue: config.priority_queue.clone(),
            standard_queue: config.standard_queue.clone(),
        }
    }
}

impl EscalationPolicy {
    pub fn queue_for(&self, tier: Tier) -> &str {
        match tier {
            Tier::Enterprise => &self.priority_queue,
            Tier::Free | Tier::Pro => &self.standard_queue,
        }
    }

    /// Keywords match whole words; phrases match as consecutive words.
    fn requested_human(&self, text: &str) -> Option<&str> {
        let text = text.to_lowercase();
        let tokens = words(&text);
        self.handoff_keywords
            .iter()
            .find(|keyword| {
                let phrase = words(keyword);
                !phrase.is_empty()
                    && tokens.windows(phrase.len()).any(|window| window == phrase.as_slice())
            })
            .map(String::as_str)
    }
}

fn words(text: &str) -> Vec<&str> {
    text.split(|c: char| !c.is_alphanumeric() && c != '\'')
        .map(|word| word.trim_matches('\''))
        .filter(|word| !word.is_empty())
        .collect()
}

/// What the router knows about the current turn when it asks whether to escalate.
#[derive(Clone, Copy, Debug)]
pub struct TurnSignals<'a> {
    pub text: &'a str,
    pub classification: Option<&'a Classification>,
    pub sentiment: SentimentSnapshot,
    /// Customer turns including the current one.
    pub turn_count: usize,
    pub failure: Option<&'a TurnFailure>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Trigger {
    pub reason: EscalationReason,
    pub detail: String,
}

impl Trigger {
    pub fn new(reason: EscalationReason, detail: impl Into<String>) -> Self {
        Self { reason, detail: detail.into() }
    }

    pub fn agent_failure(failure: &TurnFailure) -> Self {
        Self::new(EscalationReason::AgentFailure, failure.to_string())
    }
}

/// A successful handoff: the enqueued event and its 1-based queue position.
#[derive(Clone, Debug, PartialEq)]
pub struct Handoff {
    pub event: EscalationEvent,
    pub position: usize,
}

#[derive(Debug, Error)]
pub enum EscalationError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

pub struct EscalationManager {
    store: Arc<dyn ConversationStore>,
    queue: Arc<dyn HumanQueue>,
    policy: EscalationPolicy,
    flow: ConversationFlow,
    audit: Arc<dyn AuditSink>,
}

impl EscalationManager {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        queue: Arc<dyn HumanQueue>,
        policy: EscalationPolicy,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self { store, queue, policy, flow: ConversationFlow::new(), audit }
    }

    pub fn policy(&self) -> &EscalationPolicy {
        &self.policy
    }

    /// First matching trigger in priority order, if any.
    pub fn evaluate(&self, signals: &TurnSignals<'_>) -> Option<Trigger> {
        let policy = &self.policy;

        if let Some(keyword) = policy.requested_human(signals.text) {
            return Some(Trigger::new(
                EscalationReason::ExplicitRequest,
                format!("customer asked for a human (\"{keyword}\")"),
            ));
        }
        if signals.classification.is_some_and(|c| c.intent == Intent::Complaint) {
            return Some(Trigger::new(EscalationReason::ExplicitRequest, "complaint"));
        }

        if signals.sentiment.trend < policy.threshold {
            return Some(Trigger::new(
                EscalationReason::NegativeSentiment,
                format!(
                    "sentiment trend {:.3} below threshold {:.3}",
                    signals.sentiment.trend, policy.threshold
                ),
            ));
        }
        if signals.sentiment.negative_streak >= policy.negative_streak_limit {
            return Some(Trigger::new(
                EscalationReason::NegativeSentiment,
                format!("{} consecutive negative messages", signals.sentiment.negative_streak),
            ));
        }

        if signals.classification.is_some_and(|c| c.complexity) {
            return Some(Trigger::new(
                EscalationReason::Complexity,
                "request flagged as complex by the classifier",
            ));
        }
        if let Some(failure) = signals.failure {
            return Some(Trigger::agent_failure(failure));
        }

        if signals.turn_count > policy.max_turns as usize {
            return Some(Trigger::new(
                EscalationReason::TurnLimitExceeded,
                format!("{} turns exceeds the limit of {}", signals.turn_count, policy.max_turns),
            ));
        }

        None
    }

    /// Moves the conversation to `Escalating` and enqueues the handoff. Returns `None`
    /// when another turn won the transition.
    pub async fn escalate(
        &self,
        conversation: &Conversation,
        trigger: Trigger,
        audit: &AuditContext,
    ) -> Result<Option<Handoff>, EscalationError> {
        let target_queue = self.policy.queue_for(conversation.tier).to_string();
        let snapshot = match self
            .store
            .transition(
                &conversation.id,
                ConversationState::Active,
                ConversationState::Escalating,
                Some(Assignee::Queue(target_queue.clone())),
            )
            .await
        {
            Ok(snapshot) => snapshot,
            Err(StoreError::Conflict { actual, .. }) => {
                info!(
                    event_name = "escalation.abandoned",
                    correlation_id = %audit.correlation_id,
                    conversation_id = %conversation.id,
                    reason = trigger.reason.as_str(),
                    actual_state = %actual,
                    "escalation lost the state transition"
                );
                self.audit.emit(
                    AuditEvent::from_context(
                        audit,
                        "escalation.abandoned",
                        AuditCategory::Escalation,
                        AuditOutcome::Rejected,
                    )
                    .with_metadata("reason", trigger.reason.as_str())
                    .with_metadata("actual_state", actual.as_str()),
                );
                return Ok(None);
            }
            Err(error) => return Err(error.into()),
        };

        let event = EscalationEvent::pending(
            snapshot.id.clone(),
            snapshot.caller_id.clone(),
            snapshot.tier,
            trigger.reason,
            trigger.detail,
            snapshot.messages,
            target_queue,
        );

        let position = match self.queue.enqueue(event.clone()).await {
            Ok(position) => position,
            Err(queue_error) => {
                error!(
                    event_name = "escalation.enqueue_failed",
                    correlation_id = %audit.correlation_id,
                    conversation_id = %event.conversation_id,
                    escalation_id = %event.id,
                    error = %queue_error,
                    "handoff could not be queued"
                );
                self.audit.emit(
                    AuditEvent::from_context(
                        audit,
                        "escalation.enqueue_failed",
                        AuditCategory::Escalation,
                        AuditOutcome::Failed,
                    )
                    .with_metadata("escalation_id", event.id.0.clone())
                    .with_metadata("error", queue_error.to_string()),
                );
                self.roll_back(conversation, audit).await;
                return Err(queue_error.into());
            }
        };

        info!(
            event_name = "escalation.enqueued",
            correlation_id = %audit.correlation_id,
            conversation_id = %event.conversation_id,
            caller_id = %event.caller_id,
            escalation_id = %event.id,
            reason = event.reason.as_str(),
            queue = %event.target_queue,
            position,
            snapshot_len = event.snapshot.len(),
            "conversation handed to human queue"
        );
        self.audit.emit(
            AuditEvent::from_context(
                audit,
                "escalation.enqueued",
                AuditCategory::Escalation,
                AuditOutcome::Success,
            )
            .with_metadata("escalation_id", event.id.0.clone())
            .with_metadata("reason", event.reason.as_str())
            .with_metadata("queue", event.target_queue.clone())
            .with_metadata("position", position.to_string()),
        );

        Ok(Some(Handoff { event, position }))
    }

    /// Reverses the `Active -> Escalating` swap after a failed enqueue, restoring the
    /// assignment the conversation had before the turn.
    async fn roll_back(&self, conversation: &Conversation, audit: &AuditContext) {
        let outcome = match self
            .flow
            .apply(&ConversationState::Escalating, &ConversationEvent::HandoffFailed)
        {
            Ok(outcome) => outcome,
            Err(error) => {
                error!(
                    event_name = "escalation.rollback_failed",
                    conversation_id = %conversation.id,
                    error = %error,
                    "flow table rejected the rollback"
                );
                return;
            }
        };

        match self
            .store
            .transition(
                &conversation.id,
                outcome.from,
                outcome.to,
                conversation.assigned_agent.clone(),
            )
            .await
        {
            Ok(_) => {
                warn!(
                    event_name = "escalation.rolled_back",
                    correlation_id = %audit.correlation_id,
                    conversation_id = %conversation.id,
                    "conversation returned to active after a failed handoff"
                );
                self.audit.emit(
                    AuditEvent::from_context(
                        audit,
                        "escalation.rolled_back",
                        AuditCategory::Flow,
                        AuditOutcome::Success,
                    )
                    .with_metadata("from", outcome.from.as_str())
                    .with_metadata("to", outcome.to.as_str())
                    .with_metadata("event", format!("{:?}", outcome.event)),
                );
            }
            Err(store_error) => {
                error!(
                    event_name = "escalation.rollback_failed",
                    correlation_id = %audit.correlation_id,
                    conversation_id = %conversation.id,
                    error = %store_error,
                    "conversation could not be returned to active"
                );
                self.audit.emit(
                    AuditEvent::from_context(
                        audit,
                        "escalation.rollback_failed",
                        AuditCategory::Flow,
                        AuditOutcome::Failed,
                    )
                    .with_metadata("error", store_error.to_string()),
                );
            }
        }
    }
}
