use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use concierge_core::chrono::{DateTime, Utc};
use concierge_core::domain::conversation::{
    Assignee, Conversation, ConversationId, NewConversation, SentimentSnapshot,
};
use concierge_core::domain::escalation::{EscalationEvent, EscalationId, EscalationStatus};
use concierge_core::domain::message::{Message, NewMessage};
use concierge_core::flows::ConversationState;
use concierge_core::sentiment::SentimentPolicy;

use super::{ConversationStore, HumanQueue, QueueError, StoreError};

type Entry = Arc<Mutex<Conversation>>;

/// The outer map lock is only held for lookups and inserts; every mutation runs under
/// the conversation's own mutex.
#[derive(Default)]
pub struct InMemoryConversationStore {
    conversations: RwLock<HashMap<String, Entry>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn entry(&self, id: &ConversationId) -> Result<Entry, StoreError> {
        let conversations = self.conversations.read().await;
        conversations.get(&id.0).cloned().ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    pub async fn len(&self) -> usize {
        self.conversations.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait::async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn load(&self, id: &ConversationId) -> Result<Conversation, StoreError> {
        let entry = self.entry(id).await?;
        let conversation = entry.lock().await;
        Ok(conversation.clone())
    }

    async fn create(&self, request: NewConversation) -> Result<Conversation, StoreError> {
        let conversation = Conversation::open(
            ConversationId::generate(),
            request.caller_id,
            request.tier,
            request.channel,
        );
        let mut conversations = self.conversations.write().await;
        conversations
            .insert(conversation.id.0.clone(), Arc::new(Mutex::new(conversation.clone())));
        Ok(conversation)
    }

    async fn append(
        &self,
        id: &ConversationId,
        message: NewMessage,
    ) -> Result<Message, StoreError> {
        let entry = self.entry(id).await?;
        let mut conversation = entry.lock().await;
        let now = Utc::now();
        let message = message.into_message(conversation.last_sequence() + 1, now);
        conversation.messages.push(message.clone());
        conversation.last_activity_at = now;
        Ok(message)
    }

    async fn transition(
        &self,
        id: &ConversationId,
        expected: ConversationState,
        new: ConversationState,
        assignee: Option<Assignee>,
    ) -> Result<Conversation, StoreError> {
        let entry = self.entry(id).await?;
        let mut conversation = entry.lock().await;
        if conversation.state != expected {
            return Err(StoreError::Conflict { expected, actual: conversation.state });
        }
        conversation.state = new;
        if let Some(assignee) = assignee {
            conversation.assigned_agent = Some(assignee);
        }
        Ok(conversation.clone())
    }

    async fn record_sentiment(
        &self,
        id: &ConversationId,
        score: f64,
        policy: &SentimentPolicy,
    ) -> Result<SentimentSnapshot, StoreError> {
        let entry = self.entry(id).await?;
        let mut conversation = entry.lock().await;
        let previous = SentimentSnapshot {
            trend: conversation.sentiment_trend,
            negative_streak: conversation.negative_streak,
        };
        let next = policy.apply(previous, score);
        conversation.sentiment_trend = next.trend;
        conversation.negative_streak = next.negative_streak;
        Ok(next)
    }

    async fn list_idle(&self, cutoff: DateTime<Utc>) -> Result<Vec<ConversationId>, StoreError> {
        let entries: Vec<Entry> = self.conversations.read().await.values().cloned().collect();
        let mut idle = Vec::new();
        for entry in entries {
            let conversation = entry.lock().await;
            if conversation.state.is_open() && conversation.is_idle_since(cutoff) {
                idle.push(conversation.id.clone());
            }
        }
        idle.sort();
        Ok(idle)
    }
}

struct QueuedEscalation {
    arrival: u64,
    event: EscalationEvent,
}

#[derive(Default)]
struct QueueState {
    next_arrival: u64,
    events: HashMap<String, QueuedEscalation>,
}

#[derive(Default)]
pub struct InMemoryHumanQueue {
    state: RwLock<QueueState>,
}

impl InMemoryHumanQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event ever enqueued, in arrival order.
    pub async fn all(&self) -> Vec<EscalationEvent> {
        let state = self.state.read().await;
        let mut queued: Vec<&QueuedEscalation> = state.events.values().collect();
        queued.sort_by_key(|queued| queued.arrival);
        queued.into_iter().map(|queued| queued.event.clone()).collect()
    }
}

fn pending_in(state: &QueueState, queue: &str) -> Vec<EscalationEvent> {
    let mut pending: Vec<&QueuedEscalation> = state
        .events
        .values()
        .filter(|queued| {
            queued.event.target_queue == queue && queued.event.status == EscalationStatus::Pending
        })
        .collect();
    pending.sort_by_key(|queued| (std::cmp::Reverse(queued.event.tier.priority()), queued.arrival));
    pending.into_iter().map(|queued| queued.event.clone()).collect()
}

#[async_trait::async_trait]
impl HumanQueue for InMemoryHumanQueue {
    async fn enqueue(&self, event: EscalationEvent) -> Result<usize, QueueError> {
        let mut state = self.state.write().await;
        let arrival = state.next_arrival;
        state.next_arrival += 1;
        let id = event.id.clone();
        let queue = event.target_queue.clone();
        state.events.insert(id.0.clone(), QueuedEscalation { arrival, event });

        let position = pending_in(&state, &queue)
            .iter()
            .position(|pending| pending.id == id)
            .map(|index| index + 1)
            .unwrap_or(0);
        Ok(position)
    }

    async fn claim(
        &self,
        id: &EscalationId,
        operator: &str,
    ) -> Result<EscalationEvent, QueueError> {
        let mut state = self.state.write().await;
        let queued = state.events.get_mut(&id.0).ok_or_else(|| QueueError::NotFound(id.clone()))?;
        match queued.event.status {
            EscalationStatus::Pending => {}
            EscalationStatus::Claimed => {
                return Err(QueueError::AlreadyClaimed {
                    id: id.clone(),
                    operator: queued.event.claimed_by.clone().unwrap_or_default(),
                })
            }
            EscalationStatus::Resolved => return Err(QueueError::AlreadyResolved(id.clone())),
        }
        queued.event.status = EscalationStatus::Claimed;
        queued.event.claimed_by = Some(operator.to_string());
        queued.event.claimed_at = Some(Utc::now());
        Ok(queued.event.clone())
    }

    async fn resolve(&self, id: &EscalationId) -> Result<EscalationEvent, QueueError> {
        let mut state = self.state.write().await;
        let queued = state.events.get_mut(&id.0).ok_or_else(|| QueueError::NotFound(id.clone()))?;
        if queued.event.status == EscalationStatus::Resolved {
            return Err(QueueError::AlreadyResolved(id.clone()));
        }
        queued.event.status = EscalationStatus::Resolved;
        queued.event.resolved_at = Some(Utc::now());
        Ok(queued.event.clone())
    }

    async fn pending(&self, queue: &str) -> Result<Vec<EscalationEvent>, QueueError> {
        let state = self.state.read().await;
        Ok(pending_in(&state, queue))
    }

    async fn find(&self, id: &EscalationId) -> Result<Option<EscalationEvent>, QueueError> {
        let state = self.state.read().await;
        Ok(state.events.get(&id.0).map(|queued| queued.event.clone()))
    }
}
