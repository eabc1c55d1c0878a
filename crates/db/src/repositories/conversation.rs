use concierge_core::chrono::{DateTime, SecondsFormat, Timelike, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection};

use concierge_core::domain::conversation::{
    Assignee, Conversation, ConversationId, NewConversation, SentimentSnapshot,
};
use concierge_core::domain::message::{
    Channel, Classification, Message, MessageOrigin, NewMessage,
};
use concierge_core::domain::tier::Tier;
use concierge_core::flows::ConversationState;
use concierge_core::sentiment::SentimentPolicy;

use super::{ConversationStore, StoreError};
use crate::DbPool;

pub struct SqlConversationStore {
    pool: DbPool,
}

impl SqlConversationStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ConversationStore for SqlConversationStore {
    async fn load(&self, id: &ConversationId) -> Result<Conversation, StoreError> {
        let mut conn = self.pool.acquire().await?;
        fetch_conversation(&mut conn, id).await
    }

    async fn create(&self, request: NewConversation) -> Result<Conversation, StoreError> {
        let mut conversation = Conversation::open(
            ConversationId::generate(),
            request.caller_id,
            request.tier,
            request.channel,
        );
        let now = storage_now();
        conversation.created_at = now;
        conversation.last_activity_at = now;

        sqlx::query(
            "INSERT INTO conversation (
                id,
                caller_id,
                tier,
                channel,
                state,
                assigned_agent,
                sentiment_trend,
                negative_streak,
                created_at,
                last_activity_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, NULL, 0.0, 0, ?, ?, ?)",
        )
        .bind(&conversation.id.0)
        .bind(&conversation.caller_id)
        .bind(conversation.tier.as_str())
        .bind(conversation.channel.as_str())
        .bind(conversation.state.as_str())
        .bind(encode_timestamp(now))
        .bind(encode_timestamp(now))
        .bind(encode_timestamp(now))
        .execute(&self.pool)
        .await?;

        Ok(conversation)
    }

    async fn append(
        &self,
        id: &ConversationId,
        message: NewMessage,
    ) -> Result<Message, StoreError> {
        let now = storage_now();
        let mut tx = self.pool.begin().await?;

        // Taking the write lock first keeps the sequence read and the insert serialized.
        let touched = sqlx::query(
            "UPDATE conversation SET last_activity_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(encode_timestamp(now))
        .bind(encode_timestamp(now))
        .bind(&id.0)
        .execute(&mut *tx)
        .await?;
        if touched.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.clone()));
        }

        let last = sqlx::query(
            "SELECT IFNULL(MAX(sequence), 0) AS last_sequence
             FROM conversation_message
             WHERE conversation_id = ?",
        )
        .bind(&id.0)
        .fetch_one(&mut *tx)
        .await?
        .try_get::<i64, _>("last_sequence")?;

        let sequence = u64::try_from(last)
            .map_err(|_| StoreError::Decode(format!("negative sequence `{last}`")))?
            + 1;
        let message = message.into_message(sequence, now);
        let classification_json = message
            .classification
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|error| StoreError::Decode(error.to_string()))?;

        sqlx::query(
            "INSERT INTO conversation_message (
                conversation_id,
                sequence,
                origin,
                text,
                channel,
                classification_json,
                handler,
                created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id.0)
        .bind(sequence as i64)
        .bind(message.origin.as_str())
        .bind(&message.text)
        .bind(message.channel.as_str())
        .bind(classification_json)
        .bind(message.handler.as_deref())
        .bind(encode_timestamp(now))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(message)
    }

    async fn transition(
        &self,
        id: &ConversationId,
        expected: ConversationState,
        new: ConversationState,
        assignee: Option<Assignee>,
    ) -> Result<Conversation, StoreError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE conversation
             SET state = ?,
                 assigned_agent = COALESCE(?, assigned_agent),
                 updated_at = ?
             WHERE id = ? AND state = ?",
        )
        .bind(new.as_str())
        .bind(assignee.as_ref().map(Assignee::encode))
        .bind(encode_timestamp(storage_now()))
        .bind(&id.0)
        .bind(expected.as_str())
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            let actual = fetch_state(&mut tx, id).await?;
            return Err(match actual {
                Some(actual) => StoreError::Conflict { expected, actual },
                None => StoreError::NotFound(id.clone()),
            });
        }

        let snapshot = fetch_conversation(&mut tx, id).await?;
        tx.commit().await?;
        Ok(snapshot)
    }

    async fn record_sentiment(
        &self,
        id: &ConversationId,
        score: f64,
        policy: &SentimentPolicy,
    ) -> Result<SentimentSnapshot, StoreError> {
        let mut tx = self.pool.begin().await?;

        let touched = sqlx::query("UPDATE conversation SET updated_at = ? WHERE id = ?")
            .bind(encode_timestamp(storage_now()))
            .bind(&id.0)
            .execute(&mut *tx)
            .await?;
        if touched.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.clone()));
        }

        let row = sqlx::query(
            "SELECT sentiment_trend, negative_streak FROM conversation WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_one(&mut *tx)
        .await?;
        let previous = SentimentSnapshot {
            trend: row.try_get("sentiment_trend")?,
            negative_streak: parse_u32("negative_streak", row.try_get("negative_streak")?)?,
        };

        let next = policy.apply(previous, score);

        sqlx::query("UPDATE conversation SET sentiment_trend = ?, negative_streak = ? WHERE id = ?")
            .bind(next.trend)
            .bind(i64::from(next.negative_streak))
            .bind(&id.0)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(next)
    }

    async fn list_idle(&self, cutoff: DateTime<Utc>) -> Result<Vec<ConversationId>, StoreError> {
        let rows = sqlx::query(
            "SELECT id
             FROM conversation
             WHERE state IN ('new', 'active', 'escalating') AND last_activity_at < ?
             ORDER BY id ASC",
        )
        .bind(encode_timestamp(cutoff))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| row.try_get::<String, _>("id").map(ConversationId).map_err(StoreError::from))
            .collect()
    }
}

async fn fetch_state(
    conn: &mut SqliteConnection,
    id: &ConversationId,
) -> Result<Option<ConversationState>, StoreError> {
    let raw = sqlx::query("SELECT state FROM conversation WHERE id = ?")
        .bind(&id.0)
        .fetch_optional(&mut *conn)
        .await?
        .map(|row| row.try_get::<String, _>("state"))
        .transpose()?;

    raw.map(|value| {
        ConversationState::parse(&value)
            .ok_or_else(|| StoreError::Decode(format!("unknown conversation state `{value}`")))
    })
    .transpose()
}

async fn fetch_conversation(
    conn: &mut SqliteConnection,
    id: &ConversationId,
) -> Result<Conversation, StoreError> {
    let row = sqlx::query(
        "SELECT
            id,
            caller_id,
            tier,
            channel,
            state,
            assigned_agent,
            sentiment_trend,
            negative_streak,
            created_at,
            last_activity_at
         FROM conversation
         WHERE id = ?",
    )
    .bind(&id.0)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| StoreError::NotFound(id.clone()))?;

    let mut conversation = conversation_from_row(row)?;

    let message_rows = sqlx::query(
        "SELECT
            sequence,
            origin,
            text,
            channel,
            classification_json,
            handler,
            created_at
         FROM conversation_message
         WHERE conversation_id = ?
         ORDER BY sequence ASC",
    )
    .bind(&id.0)
    .fetch_all(&mut *conn)
    .await?;

    conversation.messages =
        message_rows.into_iter().map(message_from_row).collect::<Result<Vec<_>, _>>()?;
    Ok(conversation)
}

fn conversation_from_row(row: SqliteRow) -> Result<Conversation, StoreError> {
    let tier_raw = row.try_get::<String, _>("tier")?;
    let tier = Tier::parse(&tier_raw)
        .ok_or_else(|| StoreError::Decode(format!("unknown tier `{tier_raw}`")))?;
    let channel_raw = row.try_get::<String, _>("channel")?;
    let channel = Channel::parse(&channel_raw)
        .ok_or_else(|| StoreError::Decode(format!("unknown channel `{channel_raw}`")))?;
    let state_raw = row.try_get::<String, _>("state")?;
    let state = ConversationState::parse(&state_raw)
        .ok_or_else(|| StoreError::Decode(format!("unknown conversation state `{state_raw}`")))?;
    let assigned_agent = row
        .try_get::<Option<String>, _>("assigned_agent")?
        .map(|value| {
            Assignee::decode(&value)
                .ok_or_else(|| StoreError::Decode(format!("unknown assignee `{value}`")))
        })
        .transpose()?;

    Ok(Conversation {
        id: ConversationId(row.try_get("id")?),
        caller_id: row.try_get("caller_id")?,
        tier,
        channel,
        state,
        assigned_agent,
        messages: Vec::new(),
        sentiment_trend: row.try_get("sentiment_trend")?,
        negative_streak: parse_u32("negative_streak", row.try_get("negative_streak")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        last_activity_at: parse_timestamp("last_activity_at", row.try_get("last_activity_at")?)?,
    })
}

fn message_from_row(row: SqliteRow) -> Result<Message, StoreError> {
    let origin_raw = row.try_get::<String, _>("origin")?;
    let origin = MessageOrigin::parse(&origin_raw)
        .ok_or_else(|| StoreError::Decode(format!("unknown message origin `{origin_raw}`")))?;
    let channel_raw = row.try_get::<String, _>("channel")?;
    let channel = Channel::parse(&channel_raw)
        .ok_or_else(|| StoreError::Decode(format!("unknown channel `{channel_raw}`")))?;
    let classification = row
        .try_get::<Option<String>, _>("classification_json")?
        .map(|raw| serde_json::from_str::<Classification>(&raw))
        .transpose()
        .map_err(|error| StoreError::Decode(format!("invalid classification json ({error})")))?;
    let sequence = row.try_get::<i64, _>("sequence")?;

    Ok(Message {
        sequence: u64::try_from(sequence)
            .map_err(|_| StoreError::Decode(format!("negative sequence `{sequence}`")))?,
        origin,
        text: row.try_get("text")?,
        channel,
        timestamp: parse_timestamp("created_at", row.try_get("created_at")?)?,
        classification,
        handler: row.try_get("handler")?,
    })
}

/// Current time at the precision the store keeps, so values read back compare equal.
pub(crate) fn storage_now() -> DateTime<Utc> {
    let now = Utc::now();
    now.with_nanosecond(now.nanosecond() / 1_000 * 1_000).unwrap_or(now)
}

/// Fixed-width RFC 3339 so lexical order matches chronological order.
pub(crate) fn encode_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| StoreError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})")),
    )
}

fn parse_u32(column: &str, value: i64) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| {
        StoreError::Decode(format!("column `{column}` value `{value}` is out of range for u32"))
    })
}
