//! The agent pool: a closed set of specialised handlers and the static table that
//! picks one for a classified message.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use concierge_core::domain::message::{Channel, Classification, Intent, Message};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::collaborators::{CollaboratorError, KnowledgeBase, OrderLookup};
use crate::llm::{GenerationError, GenerationParams, LlmClient};
use crate::prompts::{PromptError, PromptLibrary};

pub mod email_triage;
pub mod feedback;
pub mod greeter;
pub mod order_management;
pub mod product_info;

pub use email_triage::EmailTriageHandler;
pub use feedback::FeedbackHandler;
pub use greeter::GreeterHandler;
pub use order_management::OrderManagementHandler;
pub use product_info::ProductInfoHandler;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerKind {
    Greeter,
    EmailTriage,
    OrderManagement,
    ProductInfo,
    FeedbackCollection,
}

impl HandlerKind {
    pub const ALL: [HandlerKind; 5] = [
        HandlerKind::Greeter,
        HandlerKind::EmailTriage,
        HandlerKind::OrderManagement,
        HandlerKind::ProductInfo,
        HandlerKind::FeedbackCollection,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Greeter => "greeter",
            Self::EmailTriage => "email_triage",
            Self::OrderManagement => "order_management",
            Self::ProductInfo => "product_info",
            Self::FeedbackCollection => "feedback_collection",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Greeter => "Customer Service Greeter",
            Self::EmailTriage => "Email Management Specialist",
            Self::OrderManagement => "Order Management Specialist",
            Self::ProductInfo => "Product Information Specialist",
            Self::FeedbackCollection => "Feedback Collector",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Greeter => "Initial contact and routing agent",
            Self::EmailTriage => "Handles email-related inquiries",
            Self::OrderManagement => "Looks up order status and starts refunds",
            Self::ProductInfo => "Provides product information and recommendations",
            Self::FeedbackCollection => "Records customer feedback and thanks the customer",
        }
    }
}

impl std::fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a handler may look at for one turn.
#[derive(Clone, Copy, Debug)]
pub struct HandlerRequest<'a> {
    pub text: &'a str,
    pub channel: Channel,
    pub classification: &'a Classification,
    /// Messages before the current one.
    pub history: &'a [Message],
    /// 1-based customer turn number.
    pub turn: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HandlerAction {
    IssueRefund { order_id: String },
    RecordFeedback { sentiment: f64 },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HandlerResponse {
    pub text: String,
    pub action: Option<HandlerAction>,
}

impl HandlerResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: text.into(), action: None }
    }

    pub fn with_action(mut self, action: HandlerAction) -> Self {
        self.action = Some(action);
        self
    }
}

/// The handler cannot serve this turn; the conversation should go to a human.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum HandlerFailure {
    #[error("generation failed: {0}")]
    Generation(#[from] GenerationError),
    #[error("collaborator failed: {0}")]
    Collaborator(#[from] CollaboratorError),
    #[error("prompt rendering failed: {0}")]
    Prompt(String),
    #[error("handler declined: {0}")]
    Declined(String),
    #[error("no handler registered for {0}")]
    Unregistered(HandlerKind),
}

impl From<PromptError> for HandlerFailure {
    fn from(error: PromptError) -> Self {
        Self::Prompt(error.to_string())
    }
}

#[async_trait]
pub trait Handler: Send + Sync {
    fn kind(&self) -> HandlerKind;

    async fn respond(
        &self,
        request: HandlerRequest<'_>,
    ) -> Result<HandlerResponse, HandlerFailure>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route {
    Handler(HandlerKind),
    Escalate,
}

/// Static intent to handler table.
#[derive(Clone, Debug, Default)]
pub struct RoutingTable;

impl RoutingTable {
    pub fn route(&self, intent: Intent, channel: Channel) -> Route {
        match (intent, channel) {
            (Intent::Complaint, _) => Route::Escalate,
            (Intent::Faq | Intent::Other, Channel::Email) => {
                Route::Handler(HandlerKind::EmailTriage)
            }
            (Intent::Faq | Intent::Other, _) => Route::Handler(HandlerKind::Greeter),
            (Intent::OrderStatus, _) => Route::Handler(HandlerKind::OrderManagement),
            (Intent::ProductInfo, _) => Route::Handler(HandlerKind::ProductInfo),
            (Intent::Feedback, _) => Route::Handler(HandlerKind::FeedbackCollection),
        }
    }
}

/// Shared collaborators the stock handlers are built from.
#[derive(Clone)]
pub struct PoolDependencies {
    pub llm: Arc<dyn LlmClient>,
    pub prompts: Arc<PromptLibrary>,
    pub params: GenerationParams,
    pub orders: Arc<dyn OrderLookup>,
    pub knowledge: Arc<dyn KnowledgeBase>,
}

pub struct AgentPool {
    table: RoutingTable,
    handlers: HashMap<HandlerKind, Arc<dyn Handler>>,
}

impl AgentPool {
    pub fn empty() -> Self {
        Self { table: RoutingTable, handlers: HashMap::new() }
    }

    /// The five stock handlers wired to the given collaborators.
    pub fn standard(deps: PoolDependencies) -> Self {
        Self::empty()
            .with_handler(Arc::new(GreeterHandler::new(
                Arc::clone(&deps.llm),
                Arc::clone(&deps.prompts),
                deps.params,
            )))
            .with_handler(Arc::new(EmailTriageHandler::new(
                Arc::clone(&deps.llm),
                Arc::clone(&deps.prompts),
                deps.params,
            )))
            .with_handler(Arc::new(OrderManagementHandler::new(Arc::clone(&deps.orders))))
            .with_handler(Arc::new(ProductInfoHandler::new(
                deps.llm,
                deps.prompts,
                deps.params,
                deps.knowledge,
            )))
            .with_handler(Arc::new(FeedbackHandler::new()))
    }

    /// Registers `handler`, replacing any handler of the same kind.
    pub fn with_handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.handlers.insert(handler.kind(), handler);
        self
    }

    pub fn route(&self, intent: Intent, channel: Channel) -> Route {
        self.table.route(intent, channel)
    }

    pub fn handler(&self, kind: HandlerKind) -> Option<Arc<dyn Handler>> {
        self.handlers.get(&kind).cloned()
    }

    /// Registered kinds in `HandlerKind::ALL` order.
    pub fn registered(&self) -> Vec<HandlerKind> {
        HandlerKind::ALL.into_iter().filter(|kind| self.handlers.contains_key(kind)).collect()
    }

    pub async fn dispatch(
        &self,
        kind: HandlerKind,
        request: HandlerRequest<'_>,
    ) -> Result<HandlerResponse, HandlerFailure> {
        let handler = self.handler(kind).ok_or(HandlerFailure::Unregistered(kind))?;
        handler.respond(request).await
    }
}

pub(crate) fn contains_any(text: &str, terms: &[&str]) -> bool {
    terms.iter().any(|term| text.contains(term))
}
