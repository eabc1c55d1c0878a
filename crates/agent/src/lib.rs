//! Conversation orchestration.
//!
//! The [`router::Router`] runs each customer turn: admission control, conversation
//! lifecycle, classification, dispatch to one handler of the [`handlers::AgentPool`],
//! and escalation to the human queue through [`escalation::EscalationManager`].
//!
//! The language model is only ever a text generator behind [`llm::LlmClient`]. Routing,
//! escalation and state changes are deterministic decisions made here.

pub mod classifier;
pub mod collaborators;
pub mod escalation;
pub mod handlers;
pub mod llm;
pub mod prompts;
pub mod router;

pub use classifier::{ClassificationError, Classifier, KeywordClassifier, LlmClassifier};
pub use collaborators::{
    Article, CollaboratorError, KnowledgeBase, Order, OrderLookup, OrderStatus,
    StaticKnowledgeBase, StaticOrderBook,
};
pub use escalation::{EscalationManager, EscalationPolicy, Handoff, Trigger, TurnSignals};
pub use handlers::{
    AgentPool, Handler, HandlerAction, HandlerFailure, HandlerKind, HandlerRequest,
    HandlerResponse, PoolDependencies, Route, RoutingTable,
};
pub use llm::{build_client, GenerationError, GenerationParams, LlmClient, OfflineLlmClient};
pub use prompts::PromptLibrary;
pub use router::{
    InboundMessage, QuotaSnapshot, Router, RouterComponents, RouterError, RouterSettings,
    TurnFailure, TurnOutcome, TurnReply,
};

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::llm::{GenerationError, GenerationParams, LlmClient};

    /// Fails every generation with the given error.
    pub struct FailingLlm(pub GenerationError);

    #[async_trait]
    impl LlmClient for FailingLlm {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn generate(
            &self,
            _prompt: &str,
            _params: &GenerationParams,
        ) -> Result<String, GenerationError> {
            Err(self.0.clone())
        }
    }

    /// Replies with fixed text and keeps every prompt it was given.
    pub struct PromptCapture {
        reply: String,
        prompts: Mutex<Vec<String>>,
    }

    impl PromptCapture {
        pub fn replying(reply: impl Into<String>) -> Self {
            Self { reply: reply.into(), prompts: Mutex::new(Vec::new()) }
        }

        pub fn last_prompt(&self) -> Option<String> {
            self.prompts.lock().expect("prompt log").last().cloned()
        }
    }

    #[async_trait]
    impl LlmClient for PromptCapture {
        fn name(&self) -> &'static str {
            "capture"
        }

        async fn generate(
            &self,
            prompt: &str,
            _params: &GenerationParams,
        ) -> Result<String, GenerationError> {
            self.prompts.lock().expect("prompt log").push(prompt.to_string());
            Ok(self.reply.clone())
        }
    }
}
