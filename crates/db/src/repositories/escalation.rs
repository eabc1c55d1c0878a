use concierge_core::chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use concierge_core::domain::conversation::ConversationId;
use concierge_core::domain::escalation::{
    EscalationEvent, EscalationId, EscalationReason, EscalationStatus,
};
use concierge_core::domain::message::Message;
use concierge_core::domain::tier::Tier;

use super::conversation::{encode_timestamp, parse_timestamp, storage_now};
use super::{HumanQueue, QueueError};
use crate::DbPool;

const EVENT_COLUMNS: &str = "id,
    conversation_id,
    caller_id,
    tier,
    reason,
    detail,
    snapshot_json,
    target_queue,
    status,
    claimed_by,
    created_at,
    claimed_at,
    resolved_at";

pub struct SqlHumanQueue {
    pool: DbPool,
}

impl SqlHumanQueue {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl HumanQueue for SqlHumanQueue {
    async fn enqueue(&self, event: EscalationEvent) -> Result<usize, QueueError> {
        let snapshot_json = serde_json::to_string(&event.snapshot)
            .map_err(|error| QueueError::Decode(error.to_string()))?;

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO escalation_event (
                id,
                conversation_id,
                caller_id,
                tier,
                tier_priority,
                reason,
                detail,
                snapshot_json,
                target_queue,
                status,
                claimed_by,
                created_at,
                claimed_at,
                resolved_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&event.id.0)
        .bind(&event.conversation_id.0)
        .bind(&event.caller_id)
        .bind(event.tier.as_str())
        .bind(i64::from(event.tier.priority()))
        .bind(event.reason.as_str())
        .bind(&event.detail)
        .bind(snapshot_json)
        .bind(&event.target_queue)
        .bind(event.status.as_str())
        .bind(event.claimed_by.as_deref())
        .bind(encode_timestamp(event.created_at))
        .bind(event.claimed_at.map(encode_timestamp))
        .bind(event.resolved_at.map(encode_timestamp))
        .execute(&mut *tx)
        .await?;

        // Counted inside the insert transaction; a committed event always has a position.
        let ahead: i64 = sqlx::query_scalar(
            "SELECT COUNT(*)
             FROM escalation_event queued, escalation_event inserted
             WHERE inserted.id = ?
               AND queued.target_queue = inserted.target_queue
               AND queued.status = 'pending'
               AND (queued.tier_priority > inserted.tier_priority
                    OR (queued.tier_priority = inserted.tier_priority
                        AND (queued.created_at < inserted.created_at
                             OR (queued.created_at = inserted.created_at
                                 AND queued.rowid <= inserted.rowid))))",
        )
        .bind(&event.id.0)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(usize::try_from(ahead).unwrap_or(0))
    }

    async fn claim(
        &self,
        id: &EscalationId,
        operator: &str,
    ) -> Result<EscalationEvent, QueueError> {
        let claimed = sqlx::query(
            "UPDATE escalation_event
             SET status = 'claimed', claimed_by = ?, claimed_at = ?
             WHERE id = ? AND status = 'pending'",
        )
        .bind(operator)
        .bind(encode_timestamp(storage_now()))
        .bind(&id.0)
        .execute(&self.pool)
        .await?;

        let current = self.find(id).await?.ok_or_else(|| QueueError::NotFound(id.clone()))?;
        if claimed.rows_affected() == 1 {
            return Ok(current);
        }

        Err(match current.status {
            EscalationStatus::Resolved => QueueError::AlreadyResolved(id.clone()),
            EscalationStatus::Pending | EscalationStatus::Claimed => QueueError::AlreadyClaimed {
                id: id.clone(),
                operator: current.claimed_by.unwrap_or_default(),
            },
        })
    }

    async fn resolve(&self, id: &EscalationId) -> Result<EscalationEvent, QueueError> {
        let resolved = sqlx::query(
            "UPDATE escalation_event
             SET status = 'resolved', resolved_at = ?
             WHERE id = ? AND status != 'resolved'",
        )
        .bind(encode_timestamp(storage_now()))
        .bind(&id.0)
        .execute(&self.pool)
        .await?;

        let current = self.find(id).await?.ok_or_else(|| QueueError::NotFound(id.clone()))?;
        if resolved.rows_affected() == 0 {
            return Err(QueueError::AlreadyResolved(id.clone()));
        }
        Ok(current)
    }

    async fn pending(&self, queue: &str) -> Result<Vec<EscalationEvent>, QueueError> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS}
             FROM escalation_event
             WHERE target_queue = ? AND status = 'pending'
             ORDER BY tier_priority DESC, created_at ASC, rowid ASC"
        ))
        .bind(queue)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(event_from_row).collect()
    }

    async fn find(&self, id: &EscalationId) -> Result<Option<EscalationEvent>, QueueError> {
        let row = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS}
             FROM escalation_event
             WHERE id = ?"
        ))
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(event_from_row).transpose()
    }
}

fn event_from_row(row: SqliteRow) -> Result<EscalationEvent, QueueError> {
    let tier_raw = row.try_get::<String, _>("tier")?;
    let tier = Tier::parse(&tier_raw)
        .ok_or_else(|| QueueError::Decode(format!("unknown tier `{tier_raw}`")))?;
    let reason_raw = row.try_get::<String, _>("reason")?;
    let reason = EscalationReason::parse(&reason_raw)
        .ok_or_else(|| QueueError::Decode(format!("unknown escalation reason `{reason_raw}`")))?;
    let status_raw = row.try_get::<String, _>("status")?;
    let status = EscalationStatus::parse(&status_raw)
        .ok_or_else(|| QueueError::Decode(format!("unknown escalation status `{status_raw}`")))?;
    let snapshot_raw = row.try_get::<String, _>("snapshot_json")?;
    let snapshot = serde_json::from_str::<Vec<Message>>(&snapshot_raw)
        .map_err(|error| QueueError::Decode(format!("invalid snapshot json ({error})")))?;

    Ok(EscalationEvent {
        id: EscalationId(row.try_get("id")?),
        conversation_id: ConversationId(row.try_get("conversation_id")?),
        caller_id: row.try_get("caller_id")?,
        tier,
        reason,
        detail: row.try_get("detail")?,
        snapshot,
        target_queue: row.try_get("target_queue")?,
        status,
        claimed_by: row.try_get("claimed_by")?,
        created_at: decode_timestamp("created_at", row.try_get("created_at")?)?,
        claimed_at: row
            .try_get::<Option<String>, _>("claimed_at")?
            .map(|value| decode_timestamp("claimed_at", value))
            .transpose()?,
        resolved_at: row
            .try_get::<Option<String>, _>("resolved_at")?
            .map(|value| decode_timestamp("resolved_at", value))
            .transpose()?,
    })
}

fn decode_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, QueueError> {
    parse_timestamp(column, value).map_err(|error| QueueError::Decode(error.to_string()))
}

#[cfg(test)]
mod tests {
    use concierge_core::domain::conversation::NewConversation;
    use concierge_core::domain::escalation::{EscalationEvent, EscalationReason, EscalationStatus};
    use concierge_core::domain::message::{Channel, NewMessage};
    use concierge_core::domain::tier::Tier;

    use super::SqlHumanQueue;
    use crate::migrations;
    use crate::repositories::{ConversationStore, HumanQueue, QueueError, SqlConversationStore};
    use crate::{connect_with_settings, DbPool};

    #[tokio::test]
    async fn sql_queue_orders_claims_and_resolves() {
        let pool = setup_pool().await;
        let store = SqlConversationStore::new(pool.clone());
        let queue = SqlHumanQueue::new(pool.clone());

        let free = store
            .create(NewConversation {
                caller_id: "free-caller".to_string(),
                tier: Tier::Free,
                channel: Channel::Chat,
            })
            .await
            .expect("create free");
        let pro = store
            .create(NewConversation {
                caller_id: "pro-caller".to_string(),
                tier: Tier::Pro,
                channel: Channel::Chat,
            })
            .await
            .expect("create pro");
        let message = store
            .append(&pro.id, NewMessage::customer("this is broken again", Channel::Chat))
            .await
            .expect("append");

        let free_event = EscalationEvent::pending(
            free.id.clone(),
            "free-caller",
            Tier::Free,
            EscalationReason::TurnLimitExceeded,
            "21 turns",
            Vec::new(),
            "standard",
        );
        let pro_event = EscalationEvent::pending(
            pro.id.clone(),
            "pro-caller",
            Tier::Pro,
            EscalationReason::NegativeSentiment,
            "trend -0.66",
            vec![message.clone()],
            "standard",
        );

        assert_eq!(queue.enqueue(free_event.clone()).await.expect("enqueue free"), 1);
        assert_eq!(queue.enqueue(pro_event.clone()).await.expect("enqueue pro"), 1);
        let late_event = EscalationEvent::pending(
            free.id.clone(),
            "free-caller",
            Tier::Free,
            EscalationReason::AgentFailure,
            "generation timed out",
            Vec::new(),
            "standard",
        );
        assert_eq!(queue.enqueue(late_event.clone()).await.expect("enqueue late"), 3);

        let pending = queue.pending("standard").await.expect("pending");
        assert_eq!(pending.len(), 3);
        assert_eq!(pending[0].id, pro_event.id);
        assert_eq!(pending[0].snapshot, vec![message]);
        assert_eq!(pending[1].id, free_event.id);
        assert_eq!(pending[2].id, late_event.id);

        let claimed = queue.claim(&pro_event.id, "dana").await.expect("claim");
        assert_eq!(claimed.status, EscalationStatus::Claimed);
        assert_eq!(claimed.claimed_by.as_deref(), Some("dana"));

        let again = queue.claim(&pro_event.id, "lee").await;
        assert!(matches!(
            again,
            Err(QueueError::AlreadyClaimed { ref operator, .. }) if operator == "dana"
        ));

        let resolved = queue.resolve(&pro_event.id).await.expect("resolve");
        assert_eq!(resolved.status, EscalationStatus::Resolved);
        assert!(resolved.resolved_at.is_some());

        let missing = queue
            .claim(&concierge_core::EscalationId("missing".to_string()), "dana")
            .await;
        assert!(matches!(missing, Err(QueueError::NotFound(_))));

        pool.close().await;
    }

    async fn setup_pool() -> DbPool {
        let pool =
            connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }
}
