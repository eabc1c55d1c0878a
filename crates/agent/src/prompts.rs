use concierge_core::domain::message::{Message, MessageOrigin};
use serde::Serialize;
use tera::{Context, Tera};
use thiserror::Error;

pub const CLASSIFIER_TEMPLATE: &str = "classifier.txt";
pub const EMAIL_TRIAGE_TEMPLATE: &str = "email_triage.txt";
pub const GREETER_TEMPLATE: &str = "greeter.txt";
pub const PRODUCT_INFO_TEMPLATE: &str = "product_info.txt";

/// Number of prior messages rendered into prompts.
const HISTORY_WINDOW: usize = 10;

const CLASSIFIER: &str = r#"You classify customer support messages for {{ company }}.
Reply with a single JSON object and nothing else:
{"intent": one of ["faq", "order_status", "product_info", "complaint", "feedback", "other"],
 "sentiment": number between -1 (very negative) and 1 (very positive),
 "confidence": number between 0 and 1,
 "complex": true when the request needs account access, judgement or multiple steps}
{% if history %}
Conversation so far:
{% for line in history %}{{ line.speaker }}: {{ line.text }}
{% endfor %}{% endif %}
Message to classify:
Customer: {{ message }}"#;

const GREETER: &str = r#"You are the {{ company }} customer service greeter. Be warm, concise and
professional. Answer basic questions directly and ask how else you can help.
{% if history %}
Conversation so far:
{% for line in history %}{{ line.speaker }}: {{ line.text }}
{% endfor %}{% endif %}
Customer: {{ message }}"#;

const EMAIL_TRIAGE: &str = r#"You are the {{ company }} email support specialist. Identify the
problem, ask for missing details such as the address involved or when it happened, and give
step-by-step instructions in plain language.
Issue category: {{ category }} ({{ description }})
Standard guidance for this category:
{{ guidance }}
{% if history %}
Conversation so far:
{% for line in history %}{{ line.speaker }}: {{ line.text }}
{% endfor %}{% endif %}
Customer: {{ message }}"#;

const PRODUCT_INFO: &str = r#"You are the {{ company }} product specialist. Answer using only the
reference articles below. If they do not cover the question, say so plainly.
Topic: {{ category }}
{% for article in articles %}
[{{ article.title }}]
{{ article.body }}
{% endfor %}
Customer: {{ message }}"#;

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("prompt template error: {0}")]
    Template(#[from] tera::Error),
}

#[derive(Clone, Debug, Serialize)]
pub struct HistoryLine {
    pub speaker: &'static str,
    pub text: String,
}

/// Registered prompt templates.
pub struct PromptLibrary {
    tera: Tera,
    company: String,
}

impl PromptLibrary {
    pub fn new(company: impl Into<String>) -> Result<Self, PromptError> {
        let mut tera = Tera::default();
        tera.autoescape_on(Vec::new());
        tera.add_raw_templates(vec![
            (CLASSIFIER_TEMPLATE, CLASSIFIER),
            (EMAIL_TRIAGE_TEMPLATE, EMAIL_TRIAGE),
            (GREETER_TEMPLATE, GREETER),
            (PRODUCT_INFO_TEMPLATE, PRODUCT_INFO),
        ])?;
        Ok(Self { tera, company: company.into() })
    }

    pub fn company(&self) -> &str {
        &self.company
    }

    pub fn render(&self, template: &str, mut context: Context) -> Result<String, PromptError> {
        context.insert("company", &self.company);
        Ok(self.tera.render(template, &context)?)
    }

    pub fn history(messages: &[Message]) -> Vec<HistoryLine> {
        let skip = messages.len().saturating_sub(HISTORY_WINDOW);
        messages
            .iter()
            .skip(skip)
            .map(|message| HistoryLine {
                speaker: match message.origin {
                    MessageOrigin::Customer => "Customer",
                    MessageOrigin::Agent => "Assistant",
                    MessageOrigin::Human => "Operator",
                    MessageOrigin::System => "System",
                },
                text: message.text.clone(),
            })
            .collect()
    }
}
