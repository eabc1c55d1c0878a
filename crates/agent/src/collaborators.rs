//! Domain-data collaborators used by the handlers, with in-memory reference adapters.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CollaboratorError {
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Processing,
    Shipped,
    Delivered,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Shipped => "shipped",
            Self::Delivered => "delivered",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub caller_id: String,
    pub status: OrderStatus,
    pub summary: String,
    pub tracking_number: Option<String>,
    pub refundable: bool,
}

#[async_trait]
pub trait OrderLookup: Send + Sync {
    async fn find_order(&self, order_id: &str) -> Result<Option<Order>, CollaboratorError>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Article {
    pub id: String,
    pub category: String,
    pub title: String,
    pub body: String,
}

#[async_trait]
pub trait KnowledgeBase: Send + Sync {
    async fn search(&self, category: &str, query: &str)
        -> Result<Vec<Article>, CollaboratorError>;
}

#[derive(Clone, Debug, Default)]
pub struct StaticOrderBook {
    orders: HashMap<String, Order>,
}

impl StaticOrderBook {
    pub fn new(orders: impl IntoIterator<Item = Order>) -> Self {
        Self { orders: orders.into_iter().map(|order| (order.id.clone(), order)).collect() }
    }

    pub fn sample() -> Self {
        Self::new([
            Order {
                id: "1042".to_string(),
                caller_id: "demo".to_string(),
                status: OrderStatus::Shipped,
                summary: "Pro plan annual renewal with custom domain".to_string(),
                tracking_number: Some("1Z999AA10123456784".to_string()),
                refundable: true,
            },
            Order {
                id: "2077".to_string(),
                caller_id: "demo".to_string(),
                status: OrderStatus::Processing,
                summary: "Premium template bundle".to_string(),
                tracking_number: None,
                refundable: true,
            },
            Order {
                id: "3100".to_string(),
                caller_id: "demo".to_string(),
                status: OrderStatus::Delivered,
                summary: "Domain transfer".to_string(),
                tracking_number: None,
                refundable: false,
            },
        ])
    }
}

#[async_trait]
impl OrderLookup for StaticOrderBook {
    async fn find_order(&self, order_id: &str) -> Result<Option<Order>, CollaboratorError> {
        Ok(self.orders.get(order_id).cloned())
    }
}

#[derive(Clone, Debug, Default)]
pub struct StaticKnowledgeBase {
    articles: Vec<Article>,
}

impl StaticKnowledgeBase {
    pub fn new(articles: Vec<Article>) -> Self {
        Self { articles }
    }

    pub fn sample() -> Self {
        let article = |id: &str, category: &str, title: &str, body: &str| Article {
            id: id.to_string(),
            category: category.to_string(),
            title: title.to_string(),
            body: body.to_string(),
        };
        Self::new(vec![
            article(
                "kb-builder",
                "website_builder",
                "Drag-and-drop builder",
                "Build pages with a drag-and-drop editor, mobile-responsive layouts and custom \
                 domains. Changes publish instantly.",
            ),
            article(
                "kb-templates",
                "templates",
                "Templates",
                "Choose from over 100 professionally designed templates by industry. Every \
                 template is fully customizable.",
            ),
            article(
                "kb-ecommerce",
                "ecommerce",
                "Online store",
                "Sell products with inventory tracking, secure checkout, multiple payment \
                 gateways and order management.",
            ),
            article(
                "kb-hosting",
                "hosting",
                "Hosting",
                "All plans include SSL certificates, a global CDN, daily backups and 99.9% \
                 uptime.",
            ),
            article(
                "kb-integrations",
                "integrations",
                "Integrations",
                "Connect social media, email marketing tools, analytics and payment providers \
                 from the integrations page.",
            ),
            article(
                "kb-analytics",
                "analytics",
                "Analytics",
                "Track visitors, sales and SEO performance with built-in dashboards and \
                 exportable reports.",
            ),
        ])
    }
}

#[async_trait]
impl KnowledgeBase for StaticKnowledgeBase {
    async fn search(
        &self,
        category: &str,
        query: &str,
    ) -> Result<Vec<Article>, CollaboratorError> {
        let query = query.to_lowercase();
        let mut matches: Vec<Article> = self
            .articles
            .iter()
            .filter(|article| {
                article.category == category
                    || query.split_whitespace().any(|word| {
                        word.len() > 3 && article.title.to_lowercase().contains(word)
                    })
            })
            .cloned()
            .collect();
        matches.truncate(3);
        Ok(matches)
    }
}
