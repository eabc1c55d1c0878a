use std::sync::Arc;

use async_trait::async_trait;
use tera::Context;

use super::{contains_any, Handler, HandlerFailure, HandlerKind, HandlerRequest, HandlerResponse};
use crate::collaborators::KnowledgeBase;
use crate::llm::{GenerationParams, LlmClient};
use crate::prompts::{PromptLibrary, PRODUCT_INFO_TEMPLATE};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProductCategory {
    WebsiteBuilder,
    Templates,
    Ecommerce,
    Hosting,
    Integrations,
    Analytics,
}

impl ProductCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WebsiteBuilder => "website_builder",
            Self::Templates => "templates",
            Self::Ecommerce => "ecommerce",
            Self::Hosting => "hosting",
            Self::Integrations => "integrations",
            Self::Analytics => "analytics",
        }
    }

    /// Analytics is the catch-all.
    pub fn categorize(text: &str) -> Self {
        let text = text.to_lowercase();
        if contains_any(&text, &["builder", "create", "design", "edit"]) {
            Self::WebsiteBuilder
        } else if contains_any(&text, &["template", "theme", "layout"]) {
            Self::Templates
        } else if contains_any(&text, &["shop", "store", "ecommerce", "e-commerce", "payment"]) {
            Self::Ecommerce
        } else if contains_any(&text, &["host", "domain", "ssl"]) {
            Self::Hosting
        } else if contains_any(&text, &["integrat", "plugin", "connect"]) {
            Self::Integrations
        } else {
            Self::Analytics
        }
    }
}

pub struct ProductInfoHandler {
    llm: Arc<dyn LlmClient>,
    prompts: Arc<PromptLibrary>,
    params: GenerationParams,
    knowledge: Arc<dyn KnowledgeBase>,
}

impl ProductInfoHandler {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        prompts: Arc<PromptLibrary>,
        params: GenerationParams,
        knowledge: Arc<dyn KnowledgeBase>,
    ) -> Self {
        Self { llm, prompts, params, knowledge }
    }
}

#[async_trait]
impl Handler for ProductInfoHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::ProductInfo
    }

    async fn respond(
        &self,
        request: HandlerRequest<'_>,
    ) -> Result<HandlerResponse, HandlerFailure> {
        let category = ProductCategory::categorize(request.text);
        let articles = self.knowledge.search(category.as_str(), request.text).await?;

        let mut context = Context::new();
        context.insert("category", category.as_str());
        context.insert("articles", &articles);
        context.insert("message", request.text);
        let prompt = self.prompts.render(PRODUCT_INFO_TEMPLATE, context)?;

        let text = self.llm.generate(&prompt, &self.params).await?;
        Ok(HandlerResponse::text(text))
    }
}
