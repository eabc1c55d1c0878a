//! JSON intake and operator routes.
//!
//! - `POST /v1/messages`                      run one customer turn
//! - `GET  /v1/conversations/{id}?caller_id=` transcript of one conversation
//! - `POST /v1/conversations/{id}/close`      close a conversation
//! - `GET  /v1/escalations?queue=`            pending escalations on a queue, oldest first
//! - `POST /v1/escalations/{id}/claim`        operator claims an escalation
//! - `POST /v1/escalations/{id}/resolve`      operator resolves a claimed escalation
//! - `GET  /v1/quota/{caller_id}?tier=`       remaining admission tokens for a caller
//! - `GET  /v1/handlers`                      the registered handler catalogue
//!
//! Message responses carry the caller's remaining minute and hour budget in the
//! `x-ratelimit-*` headers whenever admission control is enabled.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use concierge_agent::{
    HandlerAction, HandlerKind, InboundMessage, QuotaSnapshot, Router as ConversationRouter,
    RouterError, TurnOutcome, TurnReply,
};
use concierge_core::{
    ApplicationError, Channel, ConversationId, ConversationState, DomainError, EscalationEvent,
    EscalationId, EscalationReason, InterfaceError, Message, Tier,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

pub const CORRELATION_HEADER: &str = "x-correlation-id";
pub const LIMIT_MINUTE_HEADER: &str = "x-ratelimit-limit-minute";
pub const REMAINING_MINUTE_HEADER: &str = "x-ratelimit-remaining-minute";
pub const LIMIT_HOUR_HEADER: &str = "x-ratelimit-limit-hour";
pub const REMAINING_HOUR_HEADER: &str = "x-ratelimit-remaining-hour";

#[derive(Clone)]
pub struct ApiState {
    conversations: Arc<ConversationRouter>,
}

pub fn router(conversations: Arc<ConversationRouter>) -> Router {
    Router::new()
        .route("/v1/messages", post(post_message))
        .route("/v1/conversations/{id}", get(conversation_transcript))
        .route("/v1/conversations/{id}/close", post(close_conversation))
        .route("/v1/escalations", get(list_escalations))
        .route("/v1/escalations/{id}/claim", post(claim_escalation))
        .route("/v1/escalations/{id}/resolve", post(resolve_escalation))
        .route("/v1/quota/{caller_id}", get(quota))
        .route("/v1/handlers", get(list_handlers))
        .with_state(ApiState { conversations })
}

#[derive(Debug, Deserialize)]
pub struct MessageRequest {
    pub caller_id: String,
    pub tier: String,
    pub conversation_id: Option<String>,
    #[serde(default = "default_channel")]
    pub channel: String,
    pub text: String,
    /// Client clock; stored timestamps always come from the server.
    pub timestamp: Option<DateTime<Utc>>,
}

fn default_channel() -> String {
    Channel::Chat.as_str().to_string()
}

#[derive(Debug, PartialEq, Serialize)]
pub struct MessageResponse {
    pub conversation_id: ConversationId,
    pub sequence_number: u64,
    pub state: ConversationState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalation_notice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<HandlerAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handler: Option<HandlerKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalation_id: Option<EscalationId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalation_reason: Option<EscalationReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<usize>,
}

impl From<TurnReply> for MessageResponse {
    fn from(reply: TurnReply) -> Self {
        let mut response = Self {
            conversation_id: reply.conversation_id,
            sequence_number: reply.sequence_number,
            state: reply.state,
            response_text: None,
            escalation_notice: None,
            action: None,
            handler: None,
            escalation_id: None,
            escalation_reason: None,
            queue_position: None,
        };
        match reply.outcome {
            TurnOutcome::Response { text, handler, action } => {
                response.response_text = Some(text);
                response.handler = Some(handler);
                response.action = action;
            }
            TurnOutcome::Escalated { notice, escalation_id, reason, queue_position } => {
                response.escalation_notice = Some(notice);
                response.escalation_id = escalation_id;
                response.escalation_reason = reason;
                response.queue_position = queue_position;
            }
            TurnOutcome::Retry { text } => response.response_text = Some(text),
        }
        response
    }
}

#[derive(Debug, Serialize)]
pub struct ConversationSummary {
    pub conversation_id: ConversationId,
    pub caller_id: String,
    pub state: ConversationState,
    pub message_count: usize,
    pub last_activity_at: DateTime<Utc>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TranscriptQuery {
    pub caller_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TranscriptResponse {
    pub conversation_id: ConversationId,
    pub caller_id: String,
    pub tier: Tier,
    pub channel: Channel,
    pub state: ConversationState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    pub sentiment_trend: f64,
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct HandlerEntry {
    #[serde(rename = "type")]
    pub kind: HandlerKind,
    pub name: &'static str,
    pub description: &'static str,
}

#[derive(Debug, Serialize)]
pub struct HandlerCatalogue {
    pub handlers: Vec<HandlerEntry>,
}

#[derive(Debug, Deserialize)]
pub struct ClaimRequest {
    pub operator: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct PendingQuery {
    pub queue: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PendingResponse {
    pub queue: String,
    pub escalations: Vec<EscalationEvent>,
}

#[derive(Debug, Default, Deserialize)]
pub struct QuotaQuery {
    pub tier: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
    correlation_id: String,
}

/// Error response carrying the interface-level mapping of a failure.
#[derive(Debug)]
pub struct ApiError(InterfaceError);

impl ApiError {
    fn from_router(error: RouterError, correlation_id: &str) -> Self {
        debug!(
            event_name = "api.request_failed",
            correlation_id,
            error = %error,
            "router rejected request"
        );
        Self(ApplicationError::from(error).into_interface(correlation_id))
    }

    fn invalid(message: impl Into<String>, correlation_id: &str) -> Self {
        let error = ApplicationError::Domain(DomainError::InvalidMessage(message.into()));
        Self(error.into_interface(correlation_id))
    }

    fn status(&self) -> StatusCode {
        match self.0 {
            InterfaceError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            InterfaceError::NotFound { .. } => StatusCode::NOT_FOUND,
            InterfaceError::Conflict { .. } => StatusCode::CONFLICT,
            InterfaceError::TooManyRequests { .. } => StatusCode::TOO_MANY_REQUESTS,
            InterfaceError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            InterfaceError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let detail = match &self.0 {
            InterfaceError::Internal { .. } | InterfaceError::ServiceUnavailable { .. } => {
                warn!(
                    event_name = "api.server_error",
                    correlation_id = self.0.correlation_id(),
                    error = %self.0,
                    "request failed"
                );
                None
            }
            other => Some(other.to_string()),
        };
        let body = ErrorBody {
            error: self.0.user_message(),
            detail,
            correlation_id: self.0.correlation_id().to_string(),
        };

        let mut response = (status, Json(body)).into_response();
        if let InterfaceError::TooManyRequests { retry_after_secs, .. } = self.0 {
            response.headers_mut().insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
        }
        response
    }
}

fn correlation_id(headers: &HeaderMap) -> String {
    headers
        .get(CORRELATION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
        .unwrap_or_else(|| format!("req-{}", Uuid::new_v4()))
}

fn insert_rate_limit_headers(headers: &mut HeaderMap, quota: &QuotaSnapshot) {
    if !quota.enabled {
        return;
    }
    for (name, value) in [
        (LIMIT_MINUTE_HEADER, quota.capacity),
        (REMAINING_MINUTE_HEADER, quota.remaining),
        (LIMIT_HOUR_HEADER, quota.hourly_capacity),
        (REMAINING_HOUR_HEADER, quota.hourly_remaining),
    ] {
        headers.insert(HeaderName::from_static(name), HeaderValue::from(value));
    }
}

fn parse_tier(raw: &str, correlation_id: &str) -> Result<Tier, ApiError> {
    Tier::parse(raw).ok_or_else(|| {
        let message = format!("unknown tier `{raw}` (expected free|pro|enterprise)");
        ApiError::invalid(message, correlation_id)
    })
}

async fn post_message(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<MessageRequest>,
) -> Result<Response, ApiError> {
    let correlation_id = correlation_id(&headers);
    let tier = parse_tier(&body.tier, &correlation_id)?;
    let channel = Channel::parse(&body.channel).ok_or_else(|| {
        ApiError::invalid(format!("unknown channel `{}`", body.channel), &correlation_id)
    })?;
    if let Some(sent_at) = body.timestamp {
        debug!(
            event_name = "api.message_received",
            correlation_id = %correlation_id,
            client_timestamp = %sent_at,
            "client supplied a timestamp"
        );
    }

    let caller_id = body.caller_id.clone();
    let mut inbound = InboundMessage::new(body.caller_id, tier, channel, body.text)
        .with_correlation_id(correlation_id.clone());
    if let Some(id) = body.conversation_id {
        inbound = inbound.in_conversation(ConversationId(id));
    }

    let mut response = match state.conversations.handle(inbound).await {
        Ok(reply) => Json(MessageResponse::from(reply)).into_response(),
        Err(error) => ApiError::from_router(error, &correlation_id).into_response(),
    };
    let quota = state.conversations.quota(&caller_id, tier);
    insert_rate_limit_headers(response.headers_mut(), &quota);
    Ok(response)
}

async fn conversation_transcript(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(query): Query<TranscriptQuery>,
    headers: HeaderMap,
) -> Result<Json<TranscriptResponse>, ApiError> {
    let correlation_id = correlation_id(&headers);
    let conversation = state
        .conversations
        .transcript(&ConversationId(id), query.caller_id.as_deref())
        .await
        .map_err(|error| ApiError::from_router(error, &correlation_id))?;

    Ok(Json(TranscriptResponse {
        assigned_to: conversation.assigned_agent.as_ref().map(|assignee| assignee.encode()),
        conversation_id: conversation.id,
        caller_id: conversation.caller_id,
        tier: conversation.tier,
        channel: conversation.channel,
        state: conversation.state,
        sentiment_trend: conversation.sentiment_trend,
        messages: conversation.messages,
        created_at: conversation.created_at,
        last_activity_at: conversation.last_activity_at,
    }))
}

async fn close_conversation(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<ConversationSummary>, ApiError> {
    let correlation_id = correlation_id(&headers);
    let conversation = state
        .conversations
        .close(&ConversationId(id), &correlation_id)
        .await
        .map_err(|error| ApiError::from_router(error, &correlation_id))?;

    Ok(Json(ConversationSummary {
        message_count: conversation.messages.len(),
        conversation_id: conversation.id,
        caller_id: conversation.caller_id,
        state: conversation.state,
        last_activity_at: conversation.last_activity_at,
    }))
}

async fn list_escalations(
    State(state): State<ApiState>,
    Query(query): Query<PendingQuery>,
    headers: HeaderMap,
) -> Result<Json<PendingResponse>, ApiError> {
    let correlation_id = correlation_id(&headers);
    let queue = query
        .queue
        .map(|queue| queue.trim().to_string())
        .filter(|queue| !queue.is_empty())
        .ok_or_else(|| ApiError::invalid("queue parameter is required", &correlation_id))?;

    let escalations = state
        .conversations
        .pending(&queue)
        .await
        .map_err(|error| ApiError::from_router(error, &correlation_id))?;
    Ok(Json(PendingResponse { queue, escalations }))
}

async fn claim_escalation(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ClaimRequest>,
) -> Result<Json<EscalationEvent>, ApiError> {
    let correlation_id = correlation_id(&headers);
    let event = state
        .conversations
        .claim(&EscalationId(id), &body.operator, &correlation_id)
        .await
        .map_err(|error| ApiError::from_router(error, &correlation_id))?;
    Ok(Json(event))
}

async fn resolve_escalation(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<EscalationEvent>, ApiError> {
    let correlation_id = correlation_id(&headers);
    let event = state
        .conversations
        .resolve(&EscalationId(id))
        .await
        .map_err(|error| ApiError::from_router(error, &correlation_id))?;
    Ok(Json(event))
}

async fn quota(
    State(state): State<ApiState>,
    Path(caller_id): Path<String>,
    Query(query): Query<QuotaQuery>,
    headers: HeaderMap,
) -> Result<Json<QuotaSnapshot>, ApiError> {
    let correlation_id = correlation_id(&headers);
    let tier = match query.tier.as_deref() {
        Some(raw) => parse_tier(raw, &correlation_id)?,
        None => Tier::Free,
    };
    Ok(Json(state.conversations.quota(&caller_id, tier)))
}

async fn list_handlers(State(state): State<ApiState>) -> Json<HandlerCatalogue> {
    let handlers = state
        .conversations
        .handlers()
        .into_iter()
        .map(|kind| HandlerEntry {
            name: kind.display_name(),
            description: kind.description(),
            kind,
        })
        .collect();
    Json(HandlerCatalogue { handlers })
}
