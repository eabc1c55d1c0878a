use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use concierge_agent::{
    AgentPool, ClassificationError, Classifier, EscalationPolicy, Handler, HandlerAction,
    HandlerFailure, HandlerKind, HandlerRequest, HandlerResponse, InboundMessage,
    KeywordClassifier, OfflineLlmClient, PoolDependencies, PromptLibrary, Router,
    RouterComponents, RouterError, RouterSettings, StaticKnowledgeBase, StaticOrderBook,
    TurnOutcome,
};
use concierge_agent::router::RETRY_REPLY;
use concierge_core::audit::InMemoryAuditSink;
use concierge_core::chrono::{self, DateTime, Utc};
use concierge_core::domain::conversation::{
    Assignee, Conversation, ConversationId, NewConversation, SentimentSnapshot,
};
use concierge_core::domain::escalation::{EscalationEvent, EscalationId, EscalationReason};
use concierge_core::domain::message::{
    Channel, Classification, Intent, Message, MessageOrigin, NewMessage,
};
use concierge_core::domain::tier::Tier;
use concierge_core::flows::ConversationState;
use concierge_core::rate_limit::{BucketConfig, RateLimiter, TierLimits};
use concierge_core::sentiment::SentimentPolicy;
use concierge_db::{
    ConversationStore, HumanQueue, InMemoryConversationStore, InMemoryHumanQueue, QueueError,
    StoreError,
};

struct Harness {
    router: Arc<Router>,
    store: Arc<InMemoryConversationStore>,
    queue: Arc<InMemoryHumanQueue>,
    audit: InMemoryAuditSink,
}

struct HarnessBuilder {
    limiter: RateLimiter,
    classifier: Arc<dyn Classifier>,
    pool: AgentPool,
    policy: EscalationPolicy,
    settings: RouterSettings,
    fault: Option<(Fault, ConversationState, ConversationState)>,
    queue: Option<Arc<dyn HumanQueue>>,
}

impl HarnessBuilder {
    fn new() -> Self {
        Self {
            limiter: RateLimiter::disabled(),
            classifier: Arc::new(KeywordClassifier::new()),
            pool: standard_pool(),
            policy: EscalationPolicy::default(),
            settings: RouterSettings::default(),
            fault: None,
            queue: None,
        }
    }

    /// Fails every store transition from `from` to `to` with `fault`.
    fn store_fault(mut self, fault: Fault, from: ConversationState, to: ConversationState) -> Self {
        self.fault = Some((fault, from, to));
        self
    }

    fn queue(mut self, queue: Arc<dyn HumanQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    fn limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    fn classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = classifier;
        self
    }

    fn handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.pool = self.pool.with_handler(handler);
        self
    }

    fn policy(mut self, policy: EscalationPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn settings(mut self, settings: RouterSettings) -> Self {
        self.settings = settings;
        self
    }

    fn build(self) -> Harness {
        let store = Arc::new(InMemoryConversationStore::new());
        let queue = Arc::new(InMemoryHumanQueue::new());
        let audit = InMemoryAuditSink::default();
        let store_component: Arc<dyn ConversationStore> = match self.fault {
            Some((fault, from, to)) => Arc::new(FaultyStore::new(store.clone(), fault, from, to)),
            None => store.clone(),
        };
        let queue_component: Arc<dyn HumanQueue> = match self.queue {
            Some(queue) => queue,
            None => queue.clone(),
        };
        let router = Router::new(
            RouterComponents {
                store: store_component,
                queue: queue_component,
                limiter: Arc::new(self.limiter),
                classifier: self.classifier,
                pool: Arc::new(self.pool),
                audit: Arc::new(audit.clone()),
            },
            self.policy,
            self.settings,
        );
        Harness { router: Arc::new(router), store, queue, audit }
    }
}

fn standard_pool() -> AgentPool {
    AgentPool::standard(PoolDependencies {
        llm: Arc::new(OfflineLlmClient),
        prompts: Arc::new(PromptLibrary::new("ChromaPages").expect("templates")),
        params: Default::default(),
        orders: Arc::new(StaticOrderBook::sample()),
        knowledge: Arc::new(StaticKnowledgeBase::sample()),
    })
}

/// Returns queued classifications in order, then neutral FAQ verdicts.
struct ScriptedClassifier {
    script: Mutex<VecDeque<Classification>>,
}

impl ScriptedClassifier {
    fn new(script: impl IntoIterator<Item = Classification>) -> Self {
        Self { script: Mutex::new(script.into_iter().collect()) }
    }
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    async fn classify(
        &self,
        _text: &str,
        _history: &[Message],
    ) -> Result<Classification, ClassificationError> {
        let next = self.script.lock().expect("script").pop_front();
        Ok(next.unwrap_or_else(|| Classification::new(Intent::Faq, 0.0)))
    }
}

/// Greeter stand-in that never answers within the turn timeout.
struct StalledGreeter;

#[async_trait]
impl Handler for StalledGreeter {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Greeter
    }

    async fn respond(
        &self,
        _request: HandlerRequest<'_>,
    ) -> Result<HandlerResponse, HandlerFailure> {
        tokio::time::sleep(Duration::from_secs(120)).await;
        Ok(HandlerResponse::text("too late"))
    }
}

#[derive(Clone, Copy, Debug)]
enum Fault {
    Conflict,
    Unavailable,
}

/// In-memory store whose transitions between one pair of states always fail.
struct FaultyStore {
    inner: Arc<InMemoryConversationStore>,
    fault: Fault,
    from: ConversationState,
    to: ConversationState,
}

impl FaultyStore {
    fn new(
        inner: Arc<InMemoryConversationStore>,
        fault: Fault,
        from: ConversationState,
        to: ConversationState,
    ) -> Self {
        Self { inner, fault, from, to }
    }
}

#[async_trait]
impl ConversationStore for FaultyStore {
    async fn load(&self, id: &ConversationId) -> Result<Conversation, StoreError> {
        self.inner.load(id).await
    }

    async fn create(&self, request: NewConversation) -> Result<Conversation, StoreError> {
        self.inner.create(request).await
    }

    async fn append(
        &self,
        id: &ConversationId,
        message: NewMessage,
    ) -> Result<Message, StoreError> {
        self.inner.append(id, message).await
    }

    async fn transition(
        &self,
        id: &ConversationId,
        expected: ConversationState,
        new: ConversationState,
        assignee: Option<Assignee>,
    ) -> Result<Conversation, StoreError> {
        if expected == self.from && new == self.to {
            return Err(match self.fault {
                Fault::Conflict => StoreError::Conflict { expected, actual: new },
                Fault::Unavailable => StoreError::Unavailable("replica lost".to_string()),
            });
        }
        self.inner.transition(id, expected, new, assignee).await
    }

    async fn record_sentiment(
        &self,
        id: &ConversationId,
        score: f64,
        policy: &SentimentPolicy,
    ) -> Result<SentimentSnapshot, StoreError> {
        self.inner.record_sentiment(id, score, policy).await
    }

    async fn list_idle(&self, cutoff: DateTime<Utc>) -> Result<Vec<ConversationId>, StoreError> {
        self.inner.list_idle(cutoff).await
    }
}

/// Operator queue whose backend is down.
struct OfflineQueue;

fn queue_offline() -> QueueError {
    QueueError::Unavailable("queue offline".to_string())
}

#[async_trait]
impl HumanQueue for OfflineQueue {
    async fn enqueue(&self, _event: EscalationEvent) -> Result<usize, QueueError> {
        Err(queue_offline())
    }

    async fn claim(
        &self,
        _id: &EscalationId,
        _operator: &str,
    ) -> Result<EscalationEvent, QueueError> {
        Err(queue_offline())
    }

    async fn resolve(&self, _id: &EscalationId) -> Result<EscalationEvent, QueueError> {
        Err(queue_offline())
    }

    async fn pending(&self, _queue: &str) -> Result<Vec<EscalationEvent>, QueueError> {
        Err(queue_offline())
    }

    async fn find(&self, _id: &EscalationId) -> Result<Option<EscalationEvent>, QueueError> {
        Err(queue_offline())
    }
}

fn escalation_id(outcome: &TurnOutcome) -> EscalationId {
    match outcome {
        TurnOutcome::Escalated { escalation_id: Some(id), .. } => id.clone(),
        other => panic!("expected a fresh escalation, got {other:?}"),
    }
}

fn escalation_reason(outcome: &TurnOutcome) -> Option<EscalationReason> {
    match outcome {
        TurnOutcome::Escalated { reason, .. } => *reason,
        _ => None,
    }
}

#[tokio::test]
async fn free_tier_fourth_message_in_a_second_is_rejected() {
    let limits = TierLimits {
        free: BucketConfig { capacity: 3, refill_per_sec: 0.05 },
        ..TierLimits::default()
    };
    let harness = HarnessBuilder::new().limiter(RateLimiter::new(limits)).build();

    let first = harness
        .router
        .handle(InboundMessage::new(
            "caller-free",
            Tier::Free,
            Channel::Chat,
            "what are your hours?",
        ))
        .await
        .expect("first turn");
    assert!(first.response_text().is_some());

    for text in ["and on weekends?", "do you have a help page?"] {
        let reply = harness
            .router
            .handle(
                InboundMessage::new("caller-free", Tier::Free, Channel::Chat, text)
                    .in_conversation(first.conversation_id.clone()),
            )
            .await
            .expect("admitted turn");
        assert_eq!(reply.state, ConversationState::Active);
    }

    let rejected = harness
        .router
        .handle(
            InboundMessage::new("caller-free", Tier::Free, Channel::Chat, "hello?")
                .in_conversation(first.conversation_id.clone()),
        )
        .await
        .expect_err("fourth message exceeds the bucket");
    match rejected {
        RouterError::AdmissionRejected { retry_after } => {
            assert!(retry_after > Duration::from_secs(1));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(harness.audit.events_of_type("admission.rejected").len(), 1);

    let stored = harness.store.load(&first.conversation_id).await.expect("load");
    assert_eq!(stored.customer_turns(), 3);

    // Other callers have their own bucket.
    harness
        .router
        .handle(InboundMessage::new("caller-other", Tier::Free, Channel::Chat, "hi"))
        .await
        .expect("separate budget");
}

#[tokio::test]
async fn negative_trend_escalates_with_full_snapshot() {
    let classifier = ScriptedClassifier::new([
        Classification::new(Intent::Faq, -1.0),
        Classification::new(Intent::Faq, -1.0),
    ]);
    let policy = EscalationPolicy { negative_streak_limit: 10, ..EscalationPolicy::default() };
    let harness =
        HarnessBuilder::new().classifier(Arc::new(classifier)).policy(policy).build();

    let first = harness
        .router
        .handle(InboundMessage::new("caller-pro", Tier::Pro, Channel::Chat, "this does not work"))
        .await
        .expect("first turn");
    assert_eq!(first.state, ConversationState::Active);
    assert!(first.response_text().is_some());

    let second = harness
        .router
        .handle(
            InboundMessage::new("caller-pro", Tier::Pro, Channel::Chat, "it is still not working")
                .in_conversation(first.conversation_id.clone()),
        )
        .await
        .expect("second turn");

    assert_eq!(second.state, ConversationState::Escalating);
    assert!(second.escalation_notice().is_some());
    assert_eq!(escalation_reason(&second.outcome), Some(EscalationReason::NegativeSentiment));

    let id = escalation_id(&second.outcome);
    let event = harness.queue.find(&id).await.expect("find").expect("event stored");
    assert_eq!(event.target_queue, "standard");

    let stored = harness.store.load(&first.conversation_id).await.expect("load");
    assert_eq!(event.snapshot, stored.messages);
    let transcript: Vec<(MessageOrigin, &str)> =
        event.snapshot.iter().map(|message| (message.origin, message.text.as_str())).collect();
    assert_eq!(transcript.len(), 3);
    assert_eq!(transcript[0], (MessageOrigin::Customer, "this does not work"));
    assert_eq!(transcript[1].0, MessageOrigin::Agent);
    assert_eq!(transcript[2], (MessageOrigin::Customer, "it is still not working"));
    assert!(stored.sentiment_trend < -0.5);
}

#[tokio::test]
async fn complaint_is_an_explicit_request() {
    let harness = HarnessBuilder::new().build();

    let reply = harness
        .router
        .handle(InboundMessage::new(
            "caller-angry",
            Tier::Enterprise,
            Channel::Social,
            "This is unacceptable, the worst service ever",
        ))
        .await
        .expect("turn");

    assert_eq!(reply.state, ConversationState::Escalating);
    assert_eq!(escalation_reason(&reply.outcome), Some(EscalationReason::ExplicitRequest));
    let pending = harness.queue.pending("priority").await.expect("pending");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].tier, Tier::Enterprise);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_triggers_enqueue_exactly_one_event() {
    let harness = HarnessBuilder::new().build();
    let opening = harness
        .router
        .handle(InboundMessage::new("caller-race", Tier::Pro, Channel::Chat, "hello"))
        .await
        .expect("opening turn");

    let mut tasks = Vec::new();
    for attempt in 0..12 {
        let router = Arc::clone(&harness.router);
        let inbound = InboundMessage::new(
            "caller-race",
            Tier::Pro,
            Channel::Chat,
            format!("let me talk to an agent ({attempt})"),
        )
        .in_conversation(opening.conversation_id.clone());
        tasks.push(tokio::spawn(async move { router.handle(inbound).await }));
    }

    let mut fresh_events = 0;
    for task in tasks {
        let reply = task.await.expect("join").expect("turn");
        assert!(reply.is_escalated(), "every racer sees the handoff: {reply:?}");
        if matches!(reply.outcome, TurnOutcome::Escalated { escalation_id: Some(_), .. }) {
            fresh_events += 1;
        }
    }

    assert_eq!(fresh_events, 1);
    assert_eq!(harness.queue.all().await.len(), 1);
    let stored = harness.store.load(&opening.conversation_id).await.expect("load");
    assert_eq!(stored.state, ConversationState::Escalating);
    assert_eq!(stored.customer_turns(), 13);
}

#[tokio::test(start_paused = true)]
async fn handler_timeout_escalates_as_agent_failure() {
    let harness = HarnessBuilder::new().handler(Arc::new(StalledGreeter)).build();

    let reply = harness
        .router
        .handle(InboundMessage::new(
            "caller-slow",
            Tier::Free,
            Channel::Chat,
            "what are your hours?",
        ))
        .await
        .expect("turn");

    assert_eq!(reply.state, ConversationState::Escalating);
    assert_eq!(escalation_reason(&reply.outcome), Some(EscalationReason::AgentFailure));
    let event = harness
        .queue
        .find(&escalation_id(&reply.outcome))
        .await
        .expect("find")
        .expect("event");
    assert!(event.detail.contains("timed out"));
    assert_eq!(event.snapshot.len(), 1);
}

#[tokio::test]
async fn security_email_escalates_through_handler_failure() {
    let harness = HarnessBuilder::new().build();

    let reply = harness
        .router
        .handle(InboundMessage::new(
            "caller-mail",
            Tier::Pro,
            Channel::Email,
            "I think my account was hacked",
        ))
        .await
        .expect("turn");

    assert_eq!(escalation_reason(&reply.outcome), Some(EscalationReason::AgentFailure));
}

#[tokio::test]
async fn refund_request_returns_handler_action() {
    let harness = HarnessBuilder::new().build();

    let reply = harness
        .router
        .handle(InboundMessage::new(
            "demo",
            Tier::Pro,
            Channel::Chat,
            "I want a refund for order 1042",
        ))
        .await
        .expect("turn");

    assert_eq!(reply.action(), Some(&HandlerAction::IssueRefund { order_id: "1042".into() }));
    let stored = harness.store.load(&reply.conversation_id).await.expect("load");
    assert_eq!(stored.assigned_agent, Some(Assignee::Handler("order_management".into())));
    assert_eq!(stored.messages.len(), 2);
    assert_eq!(stored.messages[1].handler.as_deref(), Some("order_management"));
    assert!(stored.messages[0].classification.is_some());
}

#[tokio::test]
async fn claim_hands_off_and_follow_ups_do_not_touch_the_snapshot() {
    let harness = HarnessBuilder::new().build();
    let reply = harness
        .router
        .handle(InboundMessage::new("caller-h", Tier::Pro, Channel::Chat, "I need a real person"))
        .await
        .expect("turn");
    let id = escalation_id(&reply.outcome);

    let claimed = harness.router.claim(&id, "dana", "req-claim").await.expect("claim");
    assert_eq!(claimed.claimed_by.as_deref(), Some("dana"));
    assert_eq!(claimed.snapshot.len(), 1);

    let stored = harness.store.load(&reply.conversation_id).await.expect("load");
    assert_eq!(stored.state, ConversationState::HandedOff);
    assert_eq!(stored.assigned_agent, Some(Assignee::Operator("dana".into())));

    let again = harness.router.claim(&id, "lee", "req-claim-2").await.expect_err("claimed");
    assert!(matches!(again, RouterError::Conflict(_)));

    let follow_up = harness
        .router
        .handle(
            InboundMessage::new("caller-h", Tier::Pro, Channel::Chat, "are you there?")
                .in_conversation(reply.conversation_id.clone()),
        )
        .await
        .expect("follow up");
    assert_eq!(follow_up.state, ConversationState::HandedOff);
    assert_eq!(follow_up.sequence_number, 2);
    assert!(follow_up.escalation_notice().is_some());

    let event = harness.queue.find(&id).await.expect("find").expect("event");
    assert_eq!(event.snapshot.len(), 1);

    let resolved = harness.router.resolve(&id).await.expect("resolve");
    assert!(resolved.resolved_at.is_some());
}

#[tokio::test]
async fn closed_and_foreign_conversations_are_not_found() {
    let harness = HarnessBuilder::new().build();
    let reply = harness
        .router
        .handle(InboundMessage::new("caller-c", Tier::Free, Channel::Chat, "hi"))
        .await
        .expect("turn");

    let foreign = harness
        .router
        .handle(
            InboundMessage::new("someone-else", Tier::Free, Channel::Chat, "hi")
                .in_conversation(reply.conversation_id.clone()),
        )
        .await
        .expect_err("other caller");
    assert!(matches!(foreign, RouterError::NotFound(_)));

    let closed = harness.router.close(&reply.conversation_id, "req-close").await.expect("close");
    assert_eq!(closed.state, ConversationState::Closed);

    let after = harness
        .router
        .handle(
            InboundMessage::new("caller-c", Tier::Free, Channel::Chat, "still there?")
                .in_conversation(reply.conversation_id.clone()),
        )
        .await
        .expect_err("closed");
    assert!(matches!(after, RouterError::NotFound(_)));

    let twice = harness.router.close(&reply.conversation_id, "req-close-2").await;
    assert!(matches!(twice, Err(RouterError::NotFound(_))));
}

#[tokio::test]
async fn invalid_messages_are_rejected_before_admission() {
    let limits = TierLimits {
        free: BucketConfig { capacity: 1, refill_per_sec: 0.01 },
        ..TierLimits::default()
    };
    let harness = HarnessBuilder::new()
        .limiter(RateLimiter::new(limits))
        .settings(RouterSettings { max_message_chars: 10, ..RouterSettings::default() })
        .build();

    let empty = harness
        .router
        .handle(InboundMessage::new("caller-v", Tier::Free, Channel::Chat, "   "))
        .await;
    assert!(matches!(empty, Err(RouterError::InvalidMessage(_))));

    let long = harness
        .router
        .handle(InboundMessage::new("caller-v", Tier::Free, Channel::Chat, "x".repeat(11)))
        .await;
    assert!(matches!(long, Err(RouterError::InvalidMessage(_))));

    harness
        .router
        .handle(InboundMessage::new("caller-v", Tier::Free, Channel::Chat, "hello"))
        .await
        .expect("budget untouched by invalid messages");
}

#[tokio::test]
async fn idle_conversations_are_swept_and_expire_on_next_message() {
    let harness = HarnessBuilder::new().build();
    let swept = harness
        .router
        .handle(InboundMessage::new("caller-s", Tier::Free, Channel::Chat, "hi"))
        .await
        .expect("turn");

    let closed = harness
        .router
        .sweep_idle(Utc::now() + chrono::Duration::minutes(31))
        .await
        .expect("sweep");
    assert_eq!(closed, 1);
    let stored = harness.store.load(&swept.conversation_id).await.expect("load");
    assert_eq!(stored.state, ConversationState::Closed);

    let quick = HarnessBuilder::new()
        .settings(RouterSettings {
            inactivity_timeout: Duration::from_millis(5),
            ..RouterSettings::default()
        })
        .build();
    let reply = quick
        .router
        .handle(InboundMessage::new("caller-q", Tier::Free, Channel::Chat, "hi"))
        .await
        .expect("turn");
    tokio::time::sleep(Duration::from_millis(30)).await;

    let expired = quick
        .router
        .handle(
            InboundMessage::new("caller-q", Tier::Free, Channel::Chat, "back again")
                .in_conversation(reply.conversation_id.clone()),
        )
        .await
        .expect_err("expired");
    assert!(matches!(expired, RouterError::NotFound(_)));
    let stored = quick.store.load(&reply.conversation_id).await.expect("load");
    assert_eq!(stored.state, ConversationState::Closed);
}

#[tokio::test]
async fn turns_leave_an_audit_trail() {
    let harness = HarnessBuilder::new().build();
    let reply = harness
        .router
        .handle(
            InboundMessage::new("caller-a", Tier::Pro, Channel::Chat, "hi")
                .with_correlation_id("req-audit"),
        )
        .await
        .expect("turn");

    let transitions = harness.audit.events_of_type("conversation.transition_applied");
    let moves: Vec<(&str, &str)> = transitions
        .iter()
        .map(|event| {
            (
                event.metadata.get("from").map(String::as_str).unwrap_or_default(),
                event.metadata.get("to").map(String::as_str).unwrap_or_default(),
            )
        })
        .collect();
    assert_eq!(moves, vec![("new", "active"), ("active", "active")]);
    assert!(transitions.iter().all(|event| event.correlation_id == "req-audit"));
    assert!(transitions
        .iter()
        .all(|event| event.conversation_id.as_ref() == Some(&reply.conversation_id)));
}

#[tokio::test]
async fn quota_reports_remaining_budget_without_consuming() {
    let limits = TierLimits {
        pro: BucketConfig { capacity: 5, refill_per_sec: 0.01 },
        ..TierLimits::default()
    };
    let harness = HarnessBuilder::new().limiter(RateLimiter::new(limits)).build();

    assert_eq!(harness.router.quota("caller-quota", Tier::Pro).remaining, 5);
    harness
        .router
        .handle(InboundMessage::new("caller-quota", Tier::Pro, Channel::Chat, "hi"))
        .await
        .expect("turn");

    let quota = harness.router.quota("caller-quota", Tier::Pro);
    assert_eq!(quota.remaining, 4);
    assert_eq!(quota.capacity, 5);
    assert_eq!(quota.hourly_capacity, 1000);
    assert_eq!(quota.hourly_remaining, 999);
    assert!(quota.enabled);
    assert_eq!(harness.router.quota("caller-quota", Tier::Pro).remaining, 4);
}

#[tokio::test]
async fn transcript_is_served_to_the_owning_caller() {
    let harness = HarnessBuilder::new().build();
    let opened = harness
        .router
        .handle(InboundMessage::new("caller-owner", Tier::Free, Channel::Chat, "hello"))
        .await
        .expect("turn");

    let transcript = harness
        .router
        .transcript(&opened.conversation_id, Some("caller-owner"))
        .await
        .expect("owner reads the transcript");
    assert_eq!(transcript.messages.len(), 2);
    assert_eq!(transcript.messages[0].text, "hello");

    let foreign = harness
        .router
        .transcript(&opened.conversation_id, Some("caller-other"))
        .await
        .expect_err("foreign caller");
    assert!(matches!(foreign, RouterError::NotFound(_)));

    let kinds = harness.router.handlers();
    assert_eq!(kinds.len(), 5);
    assert_eq!(kinds[0], HandlerKind::Greeter);
}

#[tokio::test]
async fn repeated_activation_conflicts_ask_the_customer_to_retry() {
    let harness = HarnessBuilder::new()
        .store_fault(Fault::Conflict, ConversationState::New, ConversationState::Active)
        .build();

    let reply = harness
        .router
        .handle(InboundMessage::new("caller-race", Tier::Pro, Channel::Chat, "hello"))
        .await
        .expect("conflicts are answered, not raised");

    match &reply.outcome {
        TurnOutcome::Retry { text } => assert_eq!(text, RETRY_REPLY),
        other => panic!("expected a retry reply, got {other:?}"),
    }
    assert_eq!(reply.state, ConversationState::New);
    let stored = harness.store.load(&reply.conversation_id).await.expect("load");
    assert_eq!(stored.state, ConversationState::New);
    assert!(stored.messages.is_empty());
}

#[tokio::test]
async fn turn_completion_conflicts_drop_the_turn_with_a_retry_reply() {
    let harness = HarnessBuilder::new()
        .store_fault(Fault::Conflict, ConversationState::Active, ConversationState::Active)
        .build();

    let reply = harness
        .router
        .handle(InboundMessage::new(
            "caller-race",
            Tier::Pro,
            Channel::Chat,
            "what are your hours?",
        ))
        .await
        .expect("conflicts are answered, not raised");

    match &reply.outcome {
        TurnOutcome::Retry { text } => assert_eq!(text, RETRY_REPLY),
        other => panic!("expected a retry reply, got {other:?}"),
    }
    assert_eq!(reply.state, ConversationState::Active);
    assert_eq!(reply.sequence_number, 1);
    assert_eq!(harness.audit.events_of_type("turn.dropped").len(), 1);

    let stored = harness.store.load(&reply.conversation_id).await.expect("load");
    assert_eq!(stored.messages.len(), 1);
    assert_eq!(stored.messages[0].origin, MessageOrigin::Customer);
}

#[tokio::test]
async fn store_outage_on_transition_surfaces_as_unavailable() {
    let harness = HarnessBuilder::new()
        .store_fault(Fault::Unavailable, ConversationState::New, ConversationState::Active)
        .build();

    let error = harness
        .router
        .handle(InboundMessage::new("caller-outage", Tier::Free, Channel::Chat, "hello"))
        .await
        .expect_err("outage is not a conflict");

    assert!(matches!(error, RouterError::StoreUnavailable(_)), "unexpected error: {error:?}");
}

#[tokio::test]
async fn queue_outage_during_handoff_leaves_the_conversation_active() {
    let harness = HarnessBuilder::new().queue(Arc::new(OfflineQueue)).build();

    let opened = harness
        .router
        .handle(InboundMessage::new("caller-down", Tier::Pro, Channel::Chat, "hello"))
        .await
        .expect("first turn");

    let error = harness
        .router
        .handle(
            InboundMessage::new("caller-down", Tier::Pro, Channel::Chat, "let me talk to an agent")
                .in_conversation(opened.conversation_id.clone()),
        )
        .await
        .expect_err("handoff cannot be queued");
    assert!(matches!(error, RouterError::StoreUnavailable(_)), "unexpected error: {error:?}");

    let stored = harness.store.load(&opened.conversation_id).await.expect("load");
    assert_eq!(stored.state, ConversationState::Active);
    assert_eq!(harness.audit.events_of_type("escalation.rolled_back").len(), 1);

    let next = harness
        .router
        .handle(
            InboundMessage::new("caller-down", Tier::Pro, Channel::Chat, "what are your hours?")
                .in_conversation(opened.conversation_id.clone()),
        )
        .await
        .expect("conversation keeps working");
    assert_eq!(next.state, ConversationState::Active);
    assert!(next.response_text().is_some());
}
