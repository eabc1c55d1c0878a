use std::sync::Arc;

use async_trait::async_trait;
use tera::Context;

use super::{Handler, HandlerFailure, HandlerKind, HandlerRequest, HandlerResponse};
use crate::llm::{GenerationParams, LlmClient};
use crate::prompts::{PromptLibrary, GREETER_TEMPLATE};

/// General-purpose front desk. Answers basic questions through the generation
/// collaborator and welcomes the caller on their first turn.
pub struct GreeterHandler {
    llm: Arc<dyn LlmClient>,
    prompts: Arc<PromptLibrary>,
    params: GenerationParams,
}

impl GreeterHandler {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        prompts: Arc<PromptLibrary>,
        params: GenerationParams,
    ) -> Self {
        Self { llm, prompts, params }
    }

    fn welcome(&self) -> String {
        format!("Hello! Welcome to {} customer service. ", self.prompts.company())
    }
}

#[async_trait]
impl Handler for GreeterHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Greeter
    }

    async fn respond(
        &self,
        request: HandlerRequest<'_>,
    ) -> Result<HandlerResponse, HandlerFailure> {
        let mut context = Context::new();
        context.insert("history", &PromptLibrary::history(request.history));
        context.insert("message", request.text);
        let prompt = self.prompts.render(GREETER_TEMPLATE, context)?;

        let generated = self.llm.generate(&prompt, &self.params).await?;
        let text = if request.turn <= 1 { self.welcome() + &generated } else { generated };
        Ok(HandlerResponse::text(text))
    }
}
