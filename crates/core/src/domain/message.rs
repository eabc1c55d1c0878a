use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Chat,
    Email,
    Social,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Email => "email",
            Self::Social => "social",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "chat" => Some(Self::Chat),
            "email" => Some(Self::Email),
            "social" => Some(Self::Social),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageOrigin {
    Customer,
    Agent,
    Human,
    System,
}

impl MessageOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Customer => "customer",
            Self::Agent => "agent",
            Self::Human => "human",
            Self::System => "system",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "customer" => Some(Self::Customer),
            "agent" => Some(Self::Agent),
            "human" => Some(Self::Human),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Faq,
    OrderStatus,
    ProductInfo,
    Complaint,
    Feedback,
    Other,
}

impl Intent {
    pub const ALL: [Intent; 6] = [
        Intent::Faq,
        Intent::OrderStatus,
        Intent::ProductInfo,
        Intent::Complaint,
        Intent::Feedback,
        Intent::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Faq => "faq",
            Self::OrderStatus => "order_status",
            Self::ProductInfo => "product_info",
            Self::Complaint => "complaint",
            Self::Feedback => "feedback",
            Self::Other => "other",
        }
    }

    /// Unknown labels fold into `Other` rather than failing.
    pub fn from_label(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().replace([' ', '-'], "_").as_str() {
            "faq" => Self::Faq,
            "order_status" | "order" => Self::OrderStatus,
            "product_info" | "product" => Self::ProductInfo,
            "complaint" => Self::Complaint,
            "feedback" => Self::Feedback,
            _ => Self::Other,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub intent: Intent,
    pub sentiment_score: f64,
    pub complexity: bool,
    pub confidence: f64,
}

impl Classification {
    pub fn new(intent: Intent, sentiment_score: f64) -> Self {
        Self {
            intent,
            sentiment_score: clamp_score(sentiment_score),
            complexity: false,
            confidence: 1.0,
        }
    }
}

pub fn clamp_score(score: f64) -> f64 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(-1.0, 1.0)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub sequence: u64,
    pub origin: MessageOrigin,
    pub text: String,
    pub channel: Channel,
    pub timestamp: DateTime<Utc>,
    pub classification: Option<Classification>,
    pub handler: Option<String>,
}

/// A message before the store has assigned its sequence number.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewMessage {
    pub origin: MessageOrigin,
    pub text: String,
    pub channel: Channel,
    pub classification: Option<Classification>,
    pub handler: Option<String>,
}

impl NewMessage {
    pub fn customer(text: impl Into<String>, channel: Channel) -> Self {
        Self {
            origin: MessageOrigin::Customer,
            text: text.into(),
            channel,
            classification: None,
            handler: None,
        }
    }

    pub fn agent(text: impl Into<String>, channel: Channel, handler: impl Into<String>) -> Self {
        Self {
            origin: MessageOrigin::Agent,
            text: text.into(),
            channel,
            classification: None,
            handler: Some(handler.into()),
        }
    }

    pub fn with_classification(mut self, classification: Classification) -> Self {
        self.classification = Some(classification);
        self
    }

    pub fn into_message(self, sequence: u64, timestamp: DateTime<Utc>) -> Message {
        Message {
            sequence,
            origin: self.origin,
            text: self.text,
            channel: self.channel,
            timestamp,
            classification: self.classification,
            handler: self.handler,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{clamp_score, Channel, Intent, MessageOrigin};

    #[test]
    fn unknown_intent_labels_map_to_other() {
        assert_eq!(Intent::from_label("order-status"), Intent::OrderStatus);
        assert_eq!(Intent::from_label("Complaint"), Intent::Complaint);
        assert_eq!(Intent::from_label("billing_dispute"), Intent::Other);
        assert_eq!(Intent::from_label(""), Intent::Other);
    }

    #[test]
    fn sentiment_scores_are_clamped_into_unit_range() {
        assert_eq!(clamp_score(-3.2), -1.0);
        assert_eq!(clamp_score(1.7), 1.0);
        assert_eq!(clamp_score(f64::NAN), 0.0);
        assert_eq!(clamp_score(0.25), 0.25);
    }

    #[test]
    fn storage_encodings_are_stable() {
        for origin in [
            MessageOrigin::Customer,
            MessageOrigin::Agent,
            MessageOrigin::Human,
            MessageOrigin::System,
        ] {
            assert_eq!(MessageOrigin::parse(origin.as_str()), Some(origin));
        }
        assert_eq!(Channel::parse("EMAIL"), Some(Channel::Email));
        assert_eq!(Channel::parse("fax"), None);
    }
}
