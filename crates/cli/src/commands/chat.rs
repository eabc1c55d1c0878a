use std::sync::Arc;

use concierge_agent::{
    prompts::PromptError, AgentPool, EscalationPolicy, GenerationParams, InboundMessage,
    KeywordClassifier, OfflineLlmClient, PoolDependencies, PromptLibrary, Router,
    RouterComponents, RouterError, RouterSettings, StaticKnowledgeBase, StaticOrderBook,
    TurnOutcome,
};
use concierge_core::config::{AppConfig, LoadOptions};
use concierge_core::{Channel, ConversationId, ConversationState, NoopAuditSink, RateLimiter, Tier};
use concierge_db::{InMemoryConversationStore, InMemoryHumanQueue};
use serde::Serialize;
use serde_json::json;

use crate::commands::{runtime, CommandResult};

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub caller: String,
    pub tier: String,
    pub channel: String,
    pub messages: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatTurn {
    pub sequence_number: u64,
    pub state: ConversationState,
    pub speaker: String,
    pub reply: String,
    pub escalated: bool,
}

pub fn run(request: ChatRequest) -> CommandResult {
    let Some(tier) = Tier::parse(&request.tier) else {
        return CommandResult::failure(
            "chat",
            "invalid_argument",
            format!("unknown tier `{}` (expected free|pro|enterprise)", request.tier),
            2,
        );
    };
    let Some(channel) = Channel::parse(&request.channel) else {
        return CommandResult::failure(
            "chat",
            "invalid_argument",
            format!("unknown channel `{}` (expected chat|email|social)", request.channel),
            2,
        );
    };

    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "chat",
                "config_validation",
                format!("configuration issue: {error}"),
                2,
            );
        }
    };

    let runtime = match runtime() {
        Ok(runtime) => runtime,
        Err(error) => {
            return CommandResult::failure(
                "chat",
                "runtime_init",
                format!("failed to initialize async runtime: {error}"),
                3,
            );
        }
    };

    let router = match offline_router(&config) {
        Ok(router) => router,
        Err(error) => {
            return CommandResult::failure("chat", "prompt_templates", error.to_string(), 3);
        }
    };

    let (conversation_id, turns, failure) =
        runtime.block_on(converse(&router, &request.caller, tier, channel, &request.messages));
    let preamble = transcript_lines(&request.messages, &turns);

    match failure {
        None => CommandResult::success_with_data(
            "chat",
            format!("{} turn(s) completed", turns.len()),
            Some(json!({ "conversation_id": conversation_id, "turns": turns })),
        )
        .with_preamble(&preamble),
        Some(error) => {
            CommandResult::failure("chat", error_class(&error), error.to_string(), 4)
                .with_preamble(&preamble)
        }
    }
}

/// Router over in-memory adapters and the offline generator. Nothing leaves the process.
pub fn offline_router(config: &AppConfig) -> Result<Router, PromptError> {
    let prompts = Arc::new(PromptLibrary::new(config.routing.company_name.as_str())?);
    let pool = AgentPool::standard(PoolDependencies {
        llm: Arc::new(OfflineLlmClient),
        prompts,
        params: GenerationParams::from(&config.llm),
        orders: Arc::new(StaticOrderBook::sample()),
        knowledge: Arc::new(StaticKnowledgeBase::sample()),
    });
    let limiter = if config.rate_limits.enabled {
        RateLimiter::with_hourly(config.rate_limits.tiers, config.rate_limits.hourly)
    } else {
        RateLimiter::disabled()
    };

    Ok(Router::new(
        RouterComponents {
            store: Arc::new(InMemoryConversationStore::new()),
            queue: Arc::new(InMemoryHumanQueue::new()),
            limiter: Arc::new(limiter),
            classifier: Arc::new(KeywordClassifier::new()),
            pool: Arc::new(pool),
            audit: Arc::new(NoopAuditSink),
        },
        EscalationPolicy::from(&config.routing),
        RouterSettings::from(&config.routing),
    ))
}

async fn converse(
    router: &Router,
    caller: &str,
    tier: Tier,
    channel: Channel,
    messages: &[String],
) -> (Option<ConversationId>, Vec<ChatTurn>, Option<RouterError>) {
    let mut conversation_id: Option<ConversationId> = None;
    let mut turns = Vec::with_capacity(messages.len());

    for text in messages {
        let mut inbound = InboundMessage::new(caller, tier, channel, text.as_str());
        if let Some(id) = &conversation_id {
            inbound = inbound.in_conversation(id.clone());
        }

        let reply = match router.handle(inbound).await {
            Ok(reply) => reply,
            Err(error) => return (conversation_id, turns, Some(error)),
        };
        conversation_id = Some(reply.conversation_id.clone());

        let (speaker, text, escalated) = match reply.outcome {
            TurnOutcome::Response { text, handler, .. } => (handler.to_string(), text, false),
            TurnOutcome::Escalated { notice, .. } => ("concierge".to_string(), notice, true),
            TurnOutcome::Retry { text } => ("concierge".to_string(), text, false),
        };
        turns.push(ChatTurn {
            sequence_number: reply.sequence_number,
            state: reply.state,
            speaker,
            reply: text,
            escalated,
        });
    }

    (conversation_id, turns, None)
}

fn transcript_lines(messages: &[String], turns: &[ChatTurn]) -> Vec<String> {
    let mut lines = Vec::with_capacity(turns.len() * 2);
    for (message, turn) in messages.iter().zip(turns) {
        lines.push(format!("you> {message}"));
        lines.push(format!("{}> {}", turn.speaker, turn.reply));
    }
    lines
}

fn error_class(error: &RouterError) -> &'static str {
    match error {
        RouterError::AdmissionRejected { .. } => "rate_limited",
        RouterError::NotFound(_) => "not_found",
        RouterError::Conflict(_) => "conflict",
        RouterError::StoreUnavailable(_) => "store_unavailable",
        RouterError::InvalidMessage(_) => "invalid_message",
    }
}
