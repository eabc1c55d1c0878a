//! Per-turn orchestration: admission, conversation lifecycle, classification, dispatch
//! and escalation.
//!
//! Every state change goes through a store compare-and-swap checked against the
//! conversation flow table first. Classifier and handler failures never reach the
//! caller; they become escalations or the generic retry reply.

use std::sync::Arc;
use std::time::Duration;

use concierge_core::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use concierge_core::chrono::{DateTime, Utc};
use concierge_core::config::RoutingConfig;
use concierge_core::domain::conversation::{
    Assignee, Conversation, ConversationId, NewConversation, SentimentSnapshot,
};
use concierge_core::domain::escalation::{EscalationEvent, EscalationId, EscalationReason};
use concierge_core::domain::message::{Channel, Classification, Message, NewMessage};
use concierge_core::domain::tier::Tier;
use concierge_core::errors::{ApplicationError, DomainError};
use concierge_core::flows::{
    ConversationEvent, ConversationFlow, ConversationState, FlowTransitionError,
};
use concierge_core::rate_limit::{Admission, RateLimiter};
use concierge_core::sentiment::SentimentPolicy;
use concierge_db::{ConversationStore, HumanQueue, QueueError, StoreError};
use serde::Serialize;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::classifier::{ClassificationError, Classifier};
use crate::escalation::{
    EscalationError, EscalationManager, EscalationPolicy, Handoff, Trigger, TurnSignals,
};
use crate::handlers::{
    AgentPool, HandlerAction, HandlerFailure, HandlerKind, HandlerRequest, Route,
};

pub const RETRY_REPLY: &str = "Sorry, something went wrong on our side. Please try again.";

#[derive(Clone, Debug, PartialEq)]
pub struct RouterSettings {
    pub max_message_chars: usize,
    pub turn_timeout: Duration,
    pub inactivity_timeout: Duration,
    pub sentiment: SentimentPolicy,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            max_message_chars: 1000,
            turn_timeout: Duration::from_secs(20),
            inactivity_timeout: Duration::from_secs(30 * 60),
            sentiment: SentimentPolicy::default(),
        }
    }
}

impl From<&RoutingConfig> for RouterSettings {
    fn from(config: &RoutingConfig) -> Self {
        Self {
            max_message_chars: config.max_message_chars,
            turn_timeout: Duration::from_secs(config.turn_timeout_secs),
            inactivity_timeout: Duration::from_secs(config.inactivity_timeout_secs),
            sentiment: config.sentiment_policy(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    pub caller_id: String,
    pub tier: Tier,
    /// `None` opens a new conversation.
    pub conversation_id: Option<ConversationId>,
    pub channel: Channel,
    pub text: String,
    pub correlation_id: String,
}

impl InboundMessage {
    pub fn new(
        caller_id: impl Into<String>,
        tier: Tier,
        channel: Channel,
        text: impl Into<String>,
    ) -> Self {
        Self {
            caller_id: caller_id.into(),
            tier,
            conversation_id: None,
            channel,
            text: text.into(),
            correlation_id: format!("req-{}", Uuid::new_v4()),
        }
    }

    pub fn in_conversation(mut self, conversation_id: ConversationId) -> Self {
        self.conversation_id = Some(conversation_id);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TurnOutcome {
    Response {
        text: String,
        handler: HandlerKind,
        action: Option<HandlerAction>,
    },
    Escalated {
        notice: String,
        escalation_id: Option<EscalationId>,
        reason: Option<EscalationReason>,
        queue_position: Option<usize>,
    },
    Retry {
        text: String,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TurnReply {
    pub conversation_id: ConversationId,
    /// Sequence number of the customer message this turn stored.
    pub sequence_number: u64,
    pub state: ConversationState,
    pub outcome: TurnOutcome,
}

impl TurnReply {
    pub fn response_text(&self) -> Option<&str> {
        match &self.outcome {
            TurnOutcome::Response { text, .. } | TurnOutcome::Retry { text } => Some(text),
            TurnOutcome::Escalated { .. } => None,
        }
    }

    pub fn escalation_notice(&self) -> Option<&str> {
        match &self.outcome {
            TurnOutcome::Escalated { notice, .. } => Some(notice),
            _ => None,
        }
    }

    pub fn action(&self) -> Option<&HandlerAction> {
        match &self.outcome {
            TurnOutcome::Response { action, .. } => action.as_ref(),
            _ => None,
        }
    }

    pub fn is_escalated(&self) -> bool {
        matches!(self.outcome, TurnOutcome::Escalated { .. })
    }
}

/// Caller-visible outcomes of router operations.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RouterError {
    #[error("admission rejected, retry after {retry_after:?}")]
    AdmissionRejected { retry_after: Duration },
    #[error("{0} not found")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

impl From<StoreError> for RouterError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound(id) => Self::NotFound(format!("conversation `{id}`")),
            StoreError::Conflict { expected, actual } => Self::Conflict(format!(
                "conversation state changed: expected {expected}, found {actual}"
            )),
            other => Self::StoreUnavailable(other.to_string()),
        }
    }
}

impl From<QueueError> for RouterError {
    fn from(error: QueueError) -> Self {
        match error {
            QueueError::NotFound(id) => Self::NotFound(format!("escalation `{id}`")),
            QueueError::AlreadyClaimed { .. } | QueueError::AlreadyResolved(_) => {
                Self::Conflict(error.to_string())
            }
            QueueError::Unavailable(_) | QueueError::Database(_) | QueueError::Decode(_) => {
                Self::StoreUnavailable(error.to_string())
            }
        }
    }
}

impl From<EscalationError> for RouterError {
    fn from(error: EscalationError) -> Self {
        match error {
            EscalationError::Store(error) => error.into(),
            EscalationError::Queue(error) => Self::StoreUnavailable(error.to_string()),
        }
    }
}

impl From<RouterError> for ApplicationError {
    fn from(error: RouterError) -> Self {
        match error {
            RouterError::AdmissionRejected { retry_after } => {
                Self::AdmissionRejected { retry_after }
            }
            RouterError::NotFound(what) => Self::NotFound(what),
            RouterError::Conflict(message) => Self::Conflict(message),
            RouterError::StoreUnavailable(message) => Self::Persistence(message),
            RouterError::InvalidMessage(message) => {
                Self::Domain(DomainError::InvalidMessage(message))
            }
        }
    }
}

/// Internal turn failures. Absorbed into escalation or the retry reply.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TurnFailure {
    #[error("conversation changed concurrently: {0}")]
    ConversationConflict(String),
    #[error("classification failed: {0}")]
    ClassificationFailure(String),
    #[error("generation failed: {0}")]
    GenerationFailure(String),
    #[error("generation timed out")]
    GenerationTimeout,
    #[error("collaborator failed: {0}")]
    Collaborator(String),
}

impl From<ClassificationError> for TurnFailure {
    fn from(error: ClassificationError) -> Self {
        Self::ClassificationFailure(error.to_string())
    }
}

impl From<HandlerFailure> for TurnFailure {
    fn from(failure: HandlerFailure) -> Self {
        match failure {
            HandlerFailure::Generation(error) => Self::GenerationFailure(error.to_string()),
            HandlerFailure::Collaborator(error) => Self::Collaborator(error.to_string()),
            other => Self::GenerationFailure(other.to_string()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QuotaSnapshot {
    pub caller_id: String,
    pub tier: Tier,
    pub enabled: bool,
    /// Minute window.
    pub remaining: u32,
    pub capacity: u32,
    pub refill_per_sec: f64,
    pub hourly_remaining: u32,
    pub hourly_capacity: u32,
}

#[derive(Debug)]
enum CasError {
    Flow(FlowTransitionError),
    Store(StoreError),
}

impl From<CasError> for RouterError {
    fn from(error: CasError) -> Self {
        match error {
            CasError::Flow(FlowTransitionError::Terminal {
                state: ConversationState::Closed, ..
            }) => Self::NotFound("conversation".to_string()),
            CasError::Flow(error) => Self::Conflict(error.to_string()),
            CasError::Store(error) => error.into(),
        }
    }
}

/// Collaborators the router is assembled from.
#[derive(Clone)]
pub struct RouterComponents {
    pub store: Arc<dyn ConversationStore>,
    pub queue: Arc<dyn HumanQueue>,
    pub limiter: Arc<RateLimiter>,
    pub classifier: Arc<dyn Classifier>,
    pub pool: Arc<AgentPool>,
    pub audit: Arc<dyn AuditSink>,
}

pub struct Router {
    store: Arc<dyn ConversationStore>,
    queue: Arc<dyn HumanQueue>,
    limiter: Arc<RateLimiter>,
    classifier: Arc<dyn Classifier>,
    pool: Arc<AgentPool>,
    escalation: EscalationManager,
    flow: ConversationFlow,
    audit: Arc<dyn AuditSink>,
    settings: RouterSettings,
}

impl Router {
    pub fn new(
        components: RouterComponents,
        policy: EscalationPolicy,
        settings: RouterSettings,
    ) -> Self {
        let escalation = EscalationManager::new(
            Arc::clone(&components.store),
            Arc::clone(&components.queue),
            policy,
            Arc::clone(&components.audit),
        );
        Self {
            store: components.store,
            queue: components.queue,
            limiter: components.limiter,
            classifier: components.classifier,
            pool: components.pool,
            escalation,
            flow: ConversationFlow::new(),
            audit: components.audit,
            settings,
        }
    }

    pub fn settings(&self) -> &RouterSettings {
        &self.settings
    }

    pub fn escalation(&self) -> &EscalationManager {
        &self.escalation
    }

    /// Handler kinds this router can dispatch to.
    pub fn handlers(&self) -> Vec<HandlerKind> {
        self.pool.registered()
    }

    /// Runs one customer turn.
    pub async fn handle(&self, inbound: InboundMessage) -> Result<TurnReply, RouterError> {
        self.validate(&inbound)?;
        let audit = AuditContext::new(
            inbound.conversation_id.clone(),
            Some(inbound.caller_id.clone()),
            inbound.correlation_id.clone(),
            "router",
        );

        if let Admission::Rejected { retry_after } =
            self.limiter.admit(&inbound.caller_id, inbound.tier)
        {
            warn!(
                event_name = "admission.rejected",
                correlation_id = %inbound.correlation_id,
                caller_id = %inbound.caller_id,
                tier = %inbound.tier,
                retry_after_ms = retry_after.as_millis() as u64,
                "caller exceeded rate budget"
            );
            self.audit.emit(
                AuditEvent::from_context(
                    &audit,
                    "admission.rejected",
                    AuditCategory::Admission,
                    AuditOutcome::Rejected,
                )
                .with_metadata("tier", inbound.tier.as_str())
                .with_metadata("retry_after_ms", retry_after.as_millis().to_string()),
            );
            return Err(RouterError::AdmissionRejected { retry_after });
        }

        let mut conversation = self.open_conversation(&inbound).await?;
        let audit = audit.for_conversation(&conversation.id);

        let mut activation_retried = false;
        loop {
            match conversation.state {
                ConversationState::Closed => {
                    return Err(RouterError::NotFound(format!("conversation `{}`", conversation.id)))
                }
                ConversationState::Escalating | ConversationState::HandedOff => {
                    return self.follow_up(&conversation, &inbound).await;
                }
                ConversationState::Active => {
                    if self.is_idle(&conversation, Utc::now()) {
                        self.expire(&conversation, &audit).await;
                        return Err(RouterError::NotFound(format!(
                            "conversation `{}`",
                            conversation.id
                        )));
                    }
                    break;
                }
                ConversationState::New => {
                    let activated = self
                        .apply(&conversation, ConversationEvent::FirstMessage, None, &audit)
                        .await;
                    match activated {
                        Ok(active) => {
                            conversation = active;
                            break;
                        }
                        Err(CasError::Store(StoreError::Conflict { .. }))
                            if !activation_retried =>
                        {
                            activation_retried = true;
                            conversation = self.store.load(&conversation.id).await?;
                        }
                        Err(CasError::Store(StoreError::Conflict { .. })) => {
                            let sequence = conversation.last_sequence();
                            return Ok(self.retry_reply(&conversation, sequence));
                        }
                        Err(error) => return Err(error.into()),
                    }
                }
            }
        }

        self.run_turn(conversation, &inbound, &audit).await
    }

    async fn run_turn(
        &self,
        conversation: Conversation,
        inbound: &InboundMessage,
        audit: &AuditContext,
    ) -> Result<TurnReply, RouterError> {
        let classified = self.classify(&inbound.text, &conversation.messages).await;

        let mut customer = NewMessage::customer(inbound.text.clone(), inbound.channel);
        if let Ok(classification) = &classified {
            customer = customer.with_classification(classification.clone());
        }
        let stored = self.store.append(&conversation.id, customer).await?;

        let sentiment = match &classified {
            Ok(classification) => {
                self.store
                    .record_sentiment(
                        &conversation.id,
                        classification.sentiment_score,
                        &self.settings.sentiment,
                    )
                    .await?
            }
            Err(_) => SentimentSnapshot {
                trend: conversation.sentiment_trend,
                negative_streak: conversation.negative_streak,
            },
        };
        let turn_count = conversation.customer_turns() + 1;

        let signals = TurnSignals {
            text: &inbound.text,
            classification: classified.as_ref().ok(),
            sentiment,
            turn_count,
            failure: classified.as_ref().err(),
        };
        if let Some(trigger) = self.escalation.evaluate(&signals) {
            return self.hand_off(&conversation, trigger, stored.sequence, audit).await;
        }

        let classification = match classified {
            Ok(classification) => classification,
            Err(failure) => {
                let trigger = Trigger::agent_failure(&failure);
                return self.hand_off(&conversation, trigger, stored.sequence, audit).await;
            }
        };

        let kind = match self.pool.route(classification.intent, inbound.channel) {
            Route::Handler(kind) => kind,
            Route::Escalate => {
                let trigger = Trigger::new(EscalationReason::ExplicitRequest, "complaint");
                return self.hand_off(&conversation, trigger, stored.sequence, audit).await;
            }
        };

        let request = HandlerRequest {
            text: &inbound.text,
            channel: inbound.channel,
            classification: &classification,
            history: &conversation.messages,
            turn: turn_count,
        };
        let response = match timeout(self.settings.turn_timeout, self.pool.dispatch(kind, request))
            .await
        {
            Ok(Ok(response)) => response,
            Ok(Err(failure)) => {
                let failure = TurnFailure::from(failure);
                warn!(
                    event_name = "turn.handler_failed",
                    correlation_id = %audit.correlation_id,
                    conversation_id = %conversation.id,
                    handler = kind.as_str(),
                    error = %failure,
                    "handler could not serve the turn"
                );
                let trigger = Trigger::agent_failure(&failure);
                return self.hand_off(&conversation, trigger, stored.sequence, audit).await;
            }
            Err(_) => {
                let failure = TurnFailure::GenerationTimeout;
                warn!(
                    event_name = "turn.handler_timeout",
                    correlation_id = %audit.correlation_id,
                    conversation_id = %conversation.id,
                    handler = kind.as_str(),
                    timeout_ms = self.settings.turn_timeout.as_millis() as u64,
                    "handler exceeded the turn timeout"
                );
                let trigger = Trigger::agent_failure(&failure);
                return self.hand_off(&conversation, trigger, stored.sequence, audit).await;
            }
        };

        let assignee = Assignee::Handler(kind.as_str().to_string());
        let completed = match self
            .apply(&conversation, ConversationEvent::TurnCompleted, Some(assignee.clone()), audit)
            .await
        {
            Ok(completed) => completed,
            Err(CasError::Store(StoreError::Conflict { .. })) => {
                let fresh = self.store.load(&conversation.id).await?;
                if fresh.state != ConversationState::Active {
                    return Ok(self.drop_turn(&fresh, stored.sequence, audit));
                }
                match self
                    .apply(&fresh, ConversationEvent::TurnCompleted, Some(assignee), audit)
                    .await
                {
                    Ok(completed) => completed,
                    Err(CasError::Store(StoreError::Conflict { .. })) => {
                        let latest = self.store.load(&conversation.id).await?;
                        return Ok(self.drop_turn(&latest, stored.sequence, audit));
                    }
                    Err(error) => return Err(error.into()),
                }
            }
            Err(error) => return Err(error.into()),
        };

        let reply = NewMessage::agent(&response.text, inbound.channel, kind.as_str());
        self.store.append(&conversation.id, reply).await?;
        debug!(
            event_name = "turn.completed",
            correlation_id = %audit.correlation_id,
            conversation_id = %conversation.id,
            handler = kind.as_str(),
            intent = classification.intent.as_str(),
            sequence = stored.sequence,
            "turn answered by handler"
        );

        Ok(TurnReply {
            conversation_id: completed.id,
            sequence_number: stored.sequence,
            state: completed.state,
            outcome: TurnOutcome::Response {
                text: response.text,
                handler: kind,
                action: response.action,
            },
        })
    }

    /// Claims a pending escalation for `operator` and hands the conversation over.
    pub async fn claim(
        &self,
        id: &EscalationId,
        operator: &str,
        correlation_id: &str,
    ) -> Result<EscalationEvent, RouterError> {
        let operator = operator.trim();
        if operator.is_empty() {
            return Err(RouterError::InvalidMessage("operator must not be empty".to_string()));
        }

        let event = self.queue.claim(id, operator).await?;
        let audit = AuditContext::new(
            Some(event.conversation_id.clone()),
            Some(event.caller_id.clone()),
            correlation_id,
            operator,
        );
        let conversation = self.store.load(&event.conversation_id).await?;
        match self
            .apply(
                &conversation,
                ConversationEvent::HandoffClaimed,
                Some(Assignee::Operator(operator.to_string())),
                &audit,
            )
            .await
        {
            Ok(_) => {
                info!(
                    event_name = "escalation.claimed",
                    correlation_id,
                    conversation_id = %event.conversation_id,
                    escalation_id = %event.id,
                    operator,
                    "operator claimed escalation"
                );
            }
            Err(CasError::Store(error)) if error.is_unavailable() => return Err(error.into()),
            Err(error) => {
                warn!(
                    event_name = "escalation.claim_state_mismatch",
                    correlation_id,
                    conversation_id = %event.conversation_id,
                    escalation_id = %event.id,
                    state = %conversation.state,
                    error = ?error,
                    "claimed escalation for a conversation that is no longer escalating"
                );
            }
        }
        Ok(event)
    }

    pub async fn resolve(&self, id: &EscalationId) -> Result<EscalationEvent, RouterError> {
        let event = self.queue.resolve(id).await?;
        info!(
            event_name = "escalation.resolved",
            conversation_id = %event.conversation_id,
            escalation_id = %event.id,
            "escalation resolved"
        );
        Ok(event)
    }

    pub async fn pending(&self, queue: &str) -> Result<Vec<EscalationEvent>, RouterError> {
        Ok(self.queue.pending(queue).await?)
    }

    pub async fn close(
        &self,
        id: &ConversationId,
        correlation_id: &str,
    ) -> Result<Conversation, RouterError> {
        let audit = AuditContext::new(Some(id.clone()), None, correlation_id, "router");
        let conversation = self.store.load(id).await?;
        match self.apply(&conversation, ConversationEvent::CloseRequested, None, &audit).await {
            Ok(closed) => Ok(closed),
            Err(CasError::Store(StoreError::Conflict { .. })) => {
                let fresh = self.store.load(id).await?;
                Ok(self.apply(&fresh, ConversationEvent::CloseRequested, None, &audit).await?)
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Closes open conversations idle since before `now - inactivity_timeout`, and drops
    /// rate-limit buckets that have been quiet as long. Returns the number closed.
    pub async fn sweep_idle(&self, now: DateTime<Utc>) -> Result<usize, RouterError> {
        let cutoff = self.idle_cutoff(now);
        let candidates = self.store.list_idle(cutoff).await?;
        let audit = AuditContext::new(None, None, format!("sweep-{}", Uuid::new_v4()), "sweeper");

        let mut closed = 0;
        for id in candidates {
            let conversation = match self.store.load(&id).await {
                Ok(conversation) => conversation,
                Err(StoreError::NotFound(_)) => continue,
                Err(error) => return Err(error.into()),
            };
            if !conversation.state.is_open() || !conversation.is_idle_since(cutoff) {
                continue;
            }
            let audit = audit.for_conversation(&id);
            let expired = self
                .apply(&conversation, ConversationEvent::InactivityTimeout, None, &audit)
                .await;
            match expired {
                Ok(_) => closed += 1,
                Err(CasError::Store(error)) if error.is_unavailable() => return Err(error.into()),
                Err(error) => {
                    debug!(
                        event_name = "sweep.skipped",
                        conversation_id = %id,
                        error = ?error,
                        "conversation changed during sweep"
                    );
                }
            }
        }

        let evicted =
            self.limiter.evict_idle(std::time::Instant::now(), self.settings.inactivity_timeout);
        if closed > 0 || evicted > 0 {
            info!(
                event_name = "sweep.completed",
                closed,
                evicted_buckets = evicted,
                "idle sweep finished"
            );
        }
        Ok(closed)
    }

    pub fn quota(&self, caller_id: &str, tier: Tier) -> QuotaSnapshot {
        let config = self.limiter.limits().for_tier(tier);
        let remaining = self.limiter.remaining(caller_id, tier);
        QuotaSnapshot {
            caller_id: caller_id.to_string(),
            tier,
            enabled: self.limiter.is_enabled(),
            remaining: remaining.minute,
            capacity: config.capacity,
            refill_per_sec: config.refill_per_sec,
            hourly_remaining: remaining.hour,
            hourly_capacity: self.limiter.hourly_limits().for_tier(tier).capacity,
        }
    }

    /// The stored conversation with its full message history. A `caller_id` that does not
    /// own the conversation gets `NotFound`.
    pub async fn transcript(
        &self,
        id: &ConversationId,
        caller_id: Option<&str>,
    ) -> Result<Conversation, RouterError> {
        let conversation = self.store.load(id).await?;
        if caller_id.is_some_and(|caller_id| caller_id != conversation.caller_id) {
            return Err(RouterError::NotFound(format!("conversation `{id}`")));
        }
        Ok(conversation)
    }

    fn validate(&self, inbound: &InboundMessage) -> Result<(), RouterError> {
        if inbound.caller_id.trim().is_empty() {
            return Err(RouterError::InvalidMessage("caller_id must not be empty".to_string()));
        }
        if inbound.text.trim().is_empty() {
            return Err(RouterError::InvalidMessage("message text must not be empty".to_string()));
        }
        let chars = inbound.text.chars().count();
        if chars > self.settings.max_message_chars {
            return Err(RouterError::InvalidMessage(format!(
                "message has {chars} characters, the limit is {}",
                self.settings.max_message_chars
            )));
        }
        Ok(())
    }

    async fn open_conversation(
        &self,
        inbound: &InboundMessage,
    ) -> Result<Conversation, RouterError> {
        let Some(id) = &inbound.conversation_id else {
            let conversation = self
                .store
                .create(NewConversation {
                    caller_id: inbound.caller_id.clone(),
                    tier: inbound.tier,
                    channel: inbound.channel,
                })
                .await?;
            info!(
                event_name = "conversation.created",
                correlation_id = %inbound.correlation_id,
                conversation_id = %conversation.id,
                caller_id = %inbound.caller_id,
                tier = %inbound.tier,
                channel = inbound.channel.as_str(),
                "conversation opened"
            );
            return Ok(conversation);
        };

        let conversation = self.store.load(id).await?;
        if conversation.caller_id != inbound.caller_id {
            // Another caller's conversation is reported as missing.
            return Err(RouterError::NotFound(format!("conversation `{id}`")));
        }
        Ok(conversation)
    }

    async fn classify(
        &self,
        text: &str,
        history: &[Message],
    ) -> Result<Classification, TurnFailure> {
        match timeout(self.settings.turn_timeout, self.classifier.classify(text, history)).await {
            Ok(Ok(classification)) => Ok(classification),
            Ok(Err(error)) => {
                warn!(
                    event_name = "turn.classification_failed",
                    error = %error,
                    "classifier failed"
                );
                Err(error.into())
            }
            Err(_) => {
                warn!(event_name = "turn.classification_timeout", "classifier timed out");
                Err(TurnFailure::GenerationTimeout)
            }
        }
    }

    async fn follow_up(
        &self,
        conversation: &Conversation,
        inbound: &InboundMessage,
    ) -> Result<TurnReply, RouterError> {
        let stored = self
            .store
            .append(&conversation.id, NewMessage::customer(inbound.text.clone(), inbound.channel))
            .await?;
        debug!(
            event_name = "turn.follow_up",
            correlation_id = %inbound.correlation_id,
            conversation_id = %conversation.id,
            state = %conversation.state,
            sequence = stored.sequence,
            "message appended to escalated conversation"
        );
        Ok(TurnReply {
            conversation_id: conversation.id.clone(),
            sequence_number: stored.sequence,
            state: conversation.state,
            outcome: TurnOutcome::Escalated {
                notice: escalation_notice(conversation.state, None),
                escalation_id: None,
                reason: None,
                queue_position: None,
            },
        })
    }

    async fn hand_off(
        &self,
        conversation: &Conversation,
        trigger: Trigger,
        sequence: u64,
        audit: &AuditContext,
    ) -> Result<TurnReply, RouterError> {
        match self.escalation.escalate(conversation, trigger, audit).await? {
            Some(Handoff { event, position }) => {
                self.audit.emit(
                    AuditEvent::from_context(
                        audit,
                        "conversation.transition_applied",
                        AuditCategory::Flow,
                        AuditOutcome::Success,
                    )
                    .with_metadata("from", ConversationState::Active.as_str())
                    .with_metadata("to", ConversationState::Escalating.as_str())
                    .with_metadata(
                        "event",
                        format!("{:?}", ConversationEvent::EscalationTriggered),
                    ),
                );
                Ok(TurnReply {
                    conversation_id: conversation.id.clone(),
                    sequence_number: sequence,
                    state: ConversationState::Escalating,
                    outcome: TurnOutcome::Escalated {
                        notice: escalation_notice(ConversationState::Escalating, Some(position)),
                        escalation_id: Some(event.id),
                        reason: Some(event.reason),
                        queue_position: Some(position),
                    },
                })
            }
            None => {
                let fresh = self.store.load(&conversation.id).await?;
                Ok(self.drop_turn(&fresh, sequence, audit))
            }
        }
    }

    /// The turn lost a race. An escalated conversation still gets the handoff notice.
    fn drop_turn(&self, fresh: &Conversation, sequence: u64, audit: &AuditContext) -> TurnReply {
        warn!(
            event_name = "turn.dropped",
            correlation_id = %audit.correlation_id,
            conversation_id = %fresh.id,
            state = %fresh.state,
            "conversation changed under the turn"
        );
        self.audit.emit(
            AuditEvent::from_context(
                audit,
                "turn.dropped",
                AuditCategory::Flow,
                AuditOutcome::Rejected,
            )
            .with_metadata("state", fresh.state.as_str()),
        );
        match fresh.state {
            ConversationState::Escalating | ConversationState::HandedOff => TurnReply {
                conversation_id: fresh.id.clone(),
                sequence_number: sequence,
                state: fresh.state,
                outcome: TurnOutcome::Escalated {
                    notice: escalation_notice(fresh.state, None),
                    escalation_id: None,
                    reason: None,
                    queue_position: None,
                },
            },
            _ => self.retry_reply(fresh, sequence),
        }
    }

    fn retry_reply(&self, conversation: &Conversation, sequence: u64) -> TurnReply {
        TurnReply {
            conversation_id: conversation.id.clone(),
            sequence_number: sequence,
            state: conversation.state,
            outcome: TurnOutcome::Retry { text: RETRY_REPLY.to_string() },
        }
    }

    async fn expire(&self, conversation: &Conversation, audit: &AuditContext) {
        match self.apply(conversation, ConversationEvent::InactivityTimeout, None, audit).await {
            Ok(_) => info!(
                event_name = "conversation.expired",
                correlation_id = %audit.correlation_id,
                conversation_id = %conversation.id,
                "idle conversation closed on next message"
            ),
            Err(error) => debug!(
                event_name = "conversation.expire_skipped",
                conversation_id = %conversation.id,
                error = ?error,
                "idle conversation changed before it could be closed"
            ),
        }
    }

    /// Checks `event` against the flow table, then compare-and-swaps the store.
    async fn apply(
        &self,
        conversation: &Conversation,
        event: ConversationEvent,
        assignee: Option<Assignee>,
        audit: &AuditContext,
    ) -> Result<Conversation, CasError> {
        let outcome = match self.flow.apply(&conversation.state, &event) {
            Ok(outcome) => outcome,
            Err(error) => {
                self.audit.emit(
                    AuditEvent::from_context(
                        audit,
                        "conversation.transition_rejected",
                        AuditCategory::Flow,
                        AuditOutcome::Rejected,
                    )
                    .with_metadata("error", error.to_string()),
                );
                return Err(CasError::Flow(error));
            }
        };

        let updated = self
            .store
            .transition(&conversation.id, outcome.from, outcome.to, assignee)
            .await
            .map_err(CasError::Store)?;

        debug!(
            event_name = "conversation.transition_applied",
            correlation_id = %audit.correlation_id,
            conversation_id = %conversation.id,
            from = %outcome.from,
            to = %outcome.to,
            "conversation state changed"
        );
        self.audit.emit(
            AuditEvent::from_context(
                audit,
                "conversation.transition_applied",
                AuditCategory::Flow,
                AuditOutcome::Success,
            )
            .with_metadata("from", outcome.from.as_str())
            .with_metadata("to", outcome.to.as_str())
            .with_metadata("event", format!("{:?}", outcome.event)),
        );
        Ok(updated)
    }

    fn is_idle(&self, conversation: &Conversation, now: DateTime<Utc>) -> bool {
        conversation.is_idle_since(self.idle_cutoff(now))
    }

    fn idle_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        concierge_core::chrono::Duration::from_std(self.settings.inactivity_timeout)
            .ok()
            .and_then(|timeout| now.checked_sub_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

fn escalation_notice(state: ConversationState, position: Option<usize>) -> String {
    match (state, position) {
        (ConversationState::HandedOff, _) => {
            "A member of our support team has your conversation and will reply here shortly."
                .to_string()
        }
        (_, Some(position)) => format!(
            "I'm connecting you with a member of our support team. You are number {position} \
             in the queue, and they will see everything we have discussed so far."
        ),
        (_, None) => "Your conversation is with our support team. A team member will reply \
                      here as soon as possible."
            .to_string(),
    }
}
