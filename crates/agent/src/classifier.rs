use std::sync::Arc;

use async_trait::async_trait;
use concierge_core::domain::message::{clamp_score, Classification, Intent, Message};
use serde::Deserialize;
use tera::Context;
use thiserror::Error;
use tracing::debug;

use crate::llm::{GenerationError, GenerationParams, LlmClient};
use crate::prompts::{PromptLibrary, CLASSIFIER_TEMPLATE};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ClassificationError {
    #[error("classification generation failed: {0}")]
    Generation(#[from] GenerationError),
    #[error("classifier output could not be parsed: {0}")]
    Unparseable(String),
    #[error("classifier prompt could not be rendered: {0}")]
    Prompt(String),
}

#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(
        &self,
        text: &str,
        history: &[Message],
    ) -> Result<Classification, ClassificationError>;
}

const NEGATIONS: &[&str] = &[
    "not", "no", "never", "dont", "don't", "isnt", "isn't", "wasnt", "wasn't", "didnt", "didn't",
    "cant", "can't", "wont", "won't",
];

const POSITIVE: &[&str] = &[
    "thanks", "thank", "great", "good", "love", "excellent", "happy", "awesome", "perfect",
    "helpful", "appreciate", "amazing", "fantastic", "nice", "glad",
];

const NEGATIVE: &[&str] = &[
    "bad", "terrible", "awful", "hate", "angry", "broken", "worst", "useless", "frustrated",
    "frustrating", "annoyed", "unacceptable", "disappointed", "disappointing", "furious",
    "ridiculous", "slow", "problem", "wrong", "scam", "horrible", "upset", "poor", "fail",
    "failed", "failing",
];

const COMPLAINT_TERMS: &[&str] = &[
    "complaint", "complain", "unacceptable", "worst", "ridiculous", "furious", "scam",
    "disgusted", "outrageous", "terrible service", "never again",
];
const ORDER_TERMS: &[&str] = &[
    "order", "shipping", "shipped", "shipment", "delivery", "delivered", "tracking", "refund",
    "return", "package", "invoice",
];
const PRODUCT_TERMS: &[&str] = &[
    "product", "feature", "plan", "pricing", "price", "template", "ecommerce", "e-commerce",
    "hosting", "integration", "analytics", "website builder", "domain", "upgrade",
];
const FEEDBACK_TERMS: &[&str] =
    &["feedback", "suggestion", "suggest", "review", "great job", "love your", "would be nice"];
const FAQ_TERMS: &[&str] = &[
    "how do i", "how can i", "what is", "where can i", "hours", "password", "account", "login",
    "sign in", "help", "hello", "hi",
];
const COMPLEX_TERMS: &[&str] = &[
    "lawyer", "legal action", "chargeback", "gdpr", "delete my data", "data breach", "lawsuit",
    "multiple accounts", "migrate all",
];

/// Deterministic lexicon classifier. No network, same answer for the same input.
#[derive(Clone, Debug, Default)]
pub struct KeywordClassifier;

impl KeywordClassifier {
    pub fn new() -> Self {
        Self
    }

    pub fn classify_text(&self, text: &str) -> Classification {
        let normalized = text.to_lowercase();
        let tokens = tokenize(&normalized);

        let candidates = [
            (Intent::Complaint, count_terms(&normalized, &tokens, COMPLAINT_TERMS)),
            (Intent::OrderStatus, count_terms(&normalized, &tokens, ORDER_TERMS)),
            (Intent::ProductInfo, count_terms(&normalized, &tokens, PRODUCT_TERMS)),
            (Intent::Feedback, count_terms(&normalized, &tokens, FEEDBACK_TERMS)),
            (Intent::Faq, count_terms(&normalized, &tokens, FAQ_TERMS)),
        ];
        // First candidate wins ties, so the array order is the precedence.
        let (intent, hits) = candidates
            .iter()
            .copied()
            .fold((Intent::Other, 0), |best, next| if next.1 > best.1 { next } else { best });

        let confidence = if hits == 0 { 0.3 } else { (0.5 + 0.15 * hits as f64).min(0.95) };
        let complexity = count_terms(&normalized, &tokens, COMPLEX_TERMS) > 0
            || normalized.matches('?').count() >= 3;

        Classification {
            intent,
            sentiment_score: sentiment_score(&tokens),
            complexity,
            confidence,
        }
    }
}

#[async_trait]
impl Classifier for KeywordClassifier {
    async fn classify(
        &self,
        text: &str,
        _history: &[Message],
    ) -> Result<Classification, ClassificationError> {
        Ok(self.classify_text(text))
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|ch: char| !(ch.is_alphanumeric() || ch == '\'' || ch == '-'))
        .filter(|token| !token.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn count_terms(normalized: &str, tokens: &[String], terms: &[&str]) -> usize {
    terms
        .iter()
        .filter(|term| {
            if term.contains(' ') {
                normalized.contains(*term)
            } else {
                tokens.iter().any(|token| token == *term)
            }
        })
        .count()
}

/// Each lexicon hit contributes ±0.5, flipped when the previous token is a negation.
fn sentiment_score(tokens: &[String]) -> f64 {
    let mut total = 0.0;
    for (index, token) in tokens.iter().enumerate() {
        let polarity = if POSITIVE.contains(&token.as_str()) {
            1.0
        } else if NEGATIVE.contains(&token.as_str()) {
            -1.0
        } else {
            continue;
        };
        let negated = index > 0 && NEGATIONS.contains(&tokens[index - 1].as_str());
        total += if negated { -polarity } else { polarity } * 0.5;
    }
    clamp_score(total)
}

#[derive(Debug, Deserialize)]
struct Verdict {
    intent: String,
    #[serde(default)]
    sentiment: f64,
    #[serde(default = "full_confidence")]
    confidence: f64,
    #[serde(default)]
    complex: bool,
}

fn full_confidence() -> f64 {
    1.0
}

/// Asks the generation collaborator for a JSON verdict.
pub struct LlmClassifier {
    llm: Arc<dyn LlmClient>,
    prompts: Arc<PromptLibrary>,
    params: GenerationParams,
    min_confidence: f64,
}

impl LlmClassifier {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        prompts: Arc<PromptLibrary>,
        params: GenerationParams,
        min_confidence: f64,
    ) -> Self {
        let params = GenerationParams { temperature: 0.0, ..params };
        Self { llm, prompts, params, min_confidence }
    }
}

#[async_trait]
impl Classifier for LlmClassifier {
    async fn classify(
        &self,
        text: &str,
        history: &[Message],
    ) -> Result<Classification, ClassificationError> {
        let mut context = Context::new();
        context.insert("history", &PromptLibrary::history(history));
        context.insert("message", text);
        let prompt = self
            .prompts
            .render(CLASSIFIER_TEMPLATE, context)
            .map_err(|error| ClassificationError::Prompt(error.to_string()))?;

        let raw = self.llm.generate(&prompt, &self.params).await?;
        let classification = parse_verdict(&raw, self.min_confidence)?;
        debug!(
            event_name = "classifier.verdict",
            intent = classification.intent.as_str(),
            sentiment = classification.sentiment_score,
            confidence = classification.confidence,
            "llm classification"
        );
        Ok(classification)
    }
}

pub fn parse_verdict(
    raw: &str,
    min_confidence: f64,
) -> Result<Classification, ClassificationError> {
    let start = raw.find('{');
    let end = raw.rfind('}');
    let json = match (start, end) {
        (Some(start), Some(end)) if start < end => &raw[start..=end],
        _ => return Err(ClassificationError::Unparseable("no JSON object in output".to_string())),
    };

    let verdict: Verdict = serde_json::from_str(json)
        .map_err(|error| ClassificationError::Unparseable(error.to_string()))?;

    let confidence =
        if verdict.confidence.is_nan() { 0.0 } else { verdict.confidence.clamp(0.0, 1.0) };
    let intent = if confidence < min_confidence {
        Intent::Other
    } else {
        Intent::from_label(&verdict.intent)
    };

    Ok(Classification {
        intent,
        sentiment_score: clamp_score(verdict.sentiment),
        complexity: verdict.complex,
        confidence,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use concierge_core::domain::message::Intent;

    use super::{parse_verdict, ClassificationError, Classifier, KeywordClassifier, LlmClassifier};
    use crate::llm::{GenerationError, GenerationParams, LlmClient};
    use crate::prompts::PromptLibrary;

    struct CannedLlm(Result<String, GenerationError>);

    #[async_trait]
    impl LlmClient for CannedLlm {
        fn name(&self) -> &'static str {
            "canned"
        }

        async fn generate(
            &self,
            _prompt: &str,
            _params: &GenerationParams,
        ) -> Result<String, GenerationError> {
            self.0.clone()
        }
    }

    fn llm_classifier(reply: Result<String, GenerationError>) -> LlmClassifier {
        LlmClassifier::new(
            Arc::new(CannedLlm(reply)),
            Arc::new(PromptLibrary::new("Acme").expect("templates")),
            GenerationParams::default(),
            0.4,
        )
    }

    #[test]
    fn keyword_classifier_detects_order_questions() {
        let classification = KeywordClassifier::new()
            .classify_text("Where is my order? The tracking never updates.");
        assert_eq!(classification.intent, Intent::OrderStatus);
        assert!(!classification.complexity);
    }

    #[test]
    fn keyword_classifier_scores_negation() {
        let classifier = KeywordClassifier::new();
        assert!(classifier.classify_text("this is not good").sentiment_score < 0.0);
        assert!(classifier.classify_text("thanks, that was helpful").sentiment_score > 0.0);
        assert_eq!(classifier.classify_text("terrible awful horrible").sentiment_score, -1.0);
    }

    #[test]
    fn keyword_classifier_flags_complaints_and_complexity() {
        let classification = KeywordClassifier::new()
            .classify_text("This is unacceptable, I am talking to a lawyer about a chargeback");
        assert_eq!(classification.intent, Intent::Complaint);
        assert!(classification.complexity);
        assert!(classification.sentiment_score < 0.0);
    }

    #[test]
    fn unmatched_text_is_other_with_low_confidence() {
        let classification = KeywordClassifier::new().classify_text("purple elephants");
        assert_eq!(classification.intent, Intent::Other);
        assert!(classification.confidence < 0.5);
        assert_eq!(classification.sentiment_score, 0.0);
    }

    #[test]
    fn verdict_parsing_tolerates_surrounding_text() {
        let classification = parse_verdict(
            "Sure! {\"intent\": \"order_status\", \"sentiment\": -1.7, \"confidence\": 0.9} done",
            0.4,
        )
        .expect("parse");
        assert_eq!(classification.intent, Intent::OrderStatus);
        assert_eq!(classification.sentiment_score, -1.0);
    }

    #[test]
    fn low_confidence_verdict_maps_to_other() {
        let classification =
            parse_verdict("{\"intent\": \"complaint\", \"confidence\": 0.2}", 0.4).expect("parse");
        assert_eq!(classification.intent, Intent::Other);
    }

    #[tokio::test]
    async fn llm_failures_surface_as_classification_errors() {
        let unparseable = llm_classifier(Ok("no idea".to_string())).classify("hi", &[]).await;
        assert!(matches!(unparseable, Err(ClassificationError::Unparseable(_))));

        let unavailable = llm_classifier(Err(GenerationError::Unavailable("down".to_string())))
            .classify("hi", &[])
            .await;
        assert!(matches!(unavailable, Err(ClassificationError::Generation(_))));
    }

    #[tokio::test]
    async fn llm_classifier_returns_parsed_verdict() {
        let classifier = llm_classifier(Ok(
            "{\"intent\":\"feedback\",\"sentiment\":0.6,\"confidence\":0.8,\"complex\":false}"
                .to_string(),
        ));
        let classification = classifier.classify("love the new editor", &[]).await.expect("ok");
        assert_eq!(classification.intent, Intent::Feedback);
        assert!((classification.sentiment_score - 0.6).abs() < 1e-9);
    }
}
