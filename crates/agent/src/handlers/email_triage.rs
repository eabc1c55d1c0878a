use std::sync::Arc;

use async_trait::async_trait;
use tera::Context;

use super::{contains_any, Handler, HandlerFailure, HandlerKind, HandlerRequest, HandlerResponse};
use crate::llm::{GenerationParams, LlmClient};
use crate::prompts::{PromptLibrary, EMAIL_TRIAGE_TEMPLATE};

/// Signs of an account or mailbox compromise. These always go to a human.
const SECURITY_TERMS: &[&str] = &[
    "hack",
    "breach",
    "compromised",
    "phishing",
    "unauthorized",
    "unauthorised",
    "stolen",
    "someone else logged",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmailCategory {
    Spam,
    Delivery,
    Settings,
    Notifications,
    Technical,
}

impl EmailCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Spam => "spam",
            Self::Delivery => "delivery",
            Self::Settings => "settings",
            Self::Notifications => "notifications",
            Self::Technical => "technical",
        }
    }

    pub fn categorize(text: &str) -> Self {
        let text = text.to_lowercase();
        if contains_any(&text, &["spam", "junk", "unwanted"]) {
            Self::Spam
        } else if contains_any(&text, &["deliver", "receive", "bounce", "sent", "arrive"]) {
            Self::Delivery
        } else if contains_any(&text, &["setting", "preference", "configure", "signature"]) {
            Self::Settings
        } else if contains_any(&text, &["notification", "alert", "unsubscribe", "digest"]) {
            Self::Notifications
        } else {
            Self::Technical
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Spam => "issues with spam or unwanted emails",
            Self::Delivery => "email delivery problems or delays",
            Self::Settings => "email settings and preferences",
            Self::Notifications => "notification settings and management",
            Self::Technical => "technical email issues",
        }
    }

    fn guidance(&self) -> &'static str {
        match self {
            Self::Spam => {
                "It sounds like unwanted mail is getting through. Mark the messages as spam from \
                 your inbox and we will tighten the filter for your address. If our own emails \
                 land in spam, add us to your contacts."
            }
            Self::Delivery => {
                "Sorry your email is not arriving. Please check the spam folder first, then \
                 confirm the address on your account settings page. Reply with the approximate \
                 time of the missing message and we will trace it."
            }
            Self::Settings => {
                "You can change email preferences under Account > Email settings. Changes apply \
                 immediately to new messages."
            }
            Self::Notifications => {
                "Notification emails are managed under Account > Notifications, where each type \
                 can be switched off individually or sent as a daily digest."
            }
            Self::Technical => {
                "Thanks for the details. Could you tell us the email address involved and the \
                 exact error message you see? That lets us pinpoint the problem quickly."
            }
        }
    }
}

/// Sorts inbound email issues into a fixed set of categories and has the model answer
/// from the matching guidance.
pub struct EmailTriageHandler {
    llm: Arc<dyn LlmClient>,
    prompts: Arc<PromptLibrary>,
    params: GenerationParams,
}

impl EmailTriageHandler {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        prompts: Arc<PromptLibrary>,
        params: GenerationParams,
    ) -> Self {
        Self { llm, prompts, params }
    }
}

#[async_trait]
impl Handler for EmailTriageHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::EmailTriage
    }

    async fn respond(
        &self,
        request: HandlerRequest<'_>,
    ) -> Result<HandlerResponse, HandlerFailure> {
        let lowered = request.text.to_lowercase();
        if contains_any(&lowered, SECURITY_TERMS) {
            return Err(HandlerFailure::Declined("possible account security incident".into()));
        }
        let category = EmailCategory::categorize(request.text);

        let mut context = Context::new();
        context.insert("category", category.as_str());
        context.insert("description", category.description());
        context.insert("guidance", category.guidance());
        context.insert("history", &PromptLibrary::history(request.history));
        context.insert("message", request.text);
        let prompt = self.prompts.render(EMAIL_TRIAGE_TEMPLATE, context)?;

        let text = self.llm.generate(&prompt, &self.params).await?;
        Ok(HandlerResponse::text(text))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use concierge_core::domain::message::{Channel, Intent};

    use super::{EmailCategory, EmailTriageHandler};
    use crate::handlers::test_support::{classified, request};
    use crate::handlers::{Handler, HandlerFailure};
    use crate::llm::{GenerationError, GenerationParams, LlmClient};
    use crate::prompts::PromptLibrary;
    use crate::test_support::{FailingLlm, PromptCapture};

    fn handler(llm: Arc<dyn LlmClient>) -> EmailTriageHandler {
        EmailTriageHandler::new(
            llm,
            Arc::new(PromptLibrary::new("ChromaPages").expect("templates")),
            GenerationParams::default(),
        )
    }

    #[test]
    fn categories_follow_keyword_precedence() {
        assert_eq!(EmailCategory::categorize("So much JUNK mail lately"), EmailCategory::Spam);
        assert_eq!(
            EmailCategory::categorize("my invoices never arrive"),
            EmailCategory::Delivery
        );
        assert_eq!(
            EmailCategory::categorize("where are the email settings"),
            EmailCategory::Settings
        );
        assert_eq!(
            EmailCategory::categorize("too many notification emails"),
            EmailCategory::Notifications
        );
        assert_eq!(EmailCategory::categorize("it just shows an error"), EmailCategory::Technical);
    }

    #[tokio::test]
    async fn security_keywords_decline_so_the_turn_escalates() {
        let llm = Arc::new(PromptCapture::replying("unused"));
        let handler = handler(llm.clone());
        let classification = classified(Intent::Other, -0.2);

        let error = handler
            .respond(request("I think my mailbox was hacked", Channel::Email, &classification))
            .await
            .expect_err("security incident");
        assert!(matches!(error, HandlerFailure::Declined(_)));
        assert!(llm.last_prompt().is_none());
    }

    #[tokio::test]
    async fn delivery_issue_prompts_with_delivery_guidance() {
        let llm = Arc::new(PromptCapture::replying("Please check your spam folder first."));
        let handler = handler(llm.clone());
        let classification = classified(Intent::Faq, 0.0);

        let response = handler
            .respond(request("I don't receive password emails", Channel::Email, &classification))
            .await
            .expect("triaged");

        assert_eq!(response.text, "Please check your spam folder first.");
        assert!(response.action.is_none());
        let prompt = llm.last_prompt().expect("prompt captured");
        assert!(prompt.contains("Issue category: delivery (email delivery problems or delays)"));
        assert!(prompt.contains("spam folder"));
        assert!(prompt.contains("Customer: I don't receive password emails"));
    }

    #[tokio::test]
    async fn generation_failure_surfaces_to_the_router() {
        let handler = handler(Arc::new(FailingLlm(GenerationError::RateLimited)));
        let classification = classified(Intent::Faq, 0.0);

        let error = handler
            .respond(request("my signature settings vanished", Channel::Email, &classification))
            .await
            .expect_err("generation failed");
        assert!(matches!(error, HandlerFailure::Generation(GenerationError::RateLimited)));
    }
}
