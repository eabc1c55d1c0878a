//! Rolling sentiment for a conversation.
//!
//! The trend is an exponentially weighted moving average over customer messages:
//! `trend' = alpha * score + (1 - alpha) * trend`. A single very negative message nudges
//! the trend; sustained negativity accumulates.

use serde::{Deserialize, Serialize};

use crate::domain::conversation::SentimentSnapshot;
use crate::domain::message::clamp_score;

pub const DEFAULT_ALPHA: f64 = 0.3;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SentimentPolicy {
    pub alpha: f64,
    /// Scores strictly below this count toward the negative streak.
    pub negative_score_floor: f64,
}

impl Default for SentimentPolicy {
    fn default() -> Self {
        Self { alpha: DEFAULT_ALPHA, negative_score_floor: 0.0 }
    }
}

impl SentimentPolicy {
    pub fn apply(&self, previous: SentimentSnapshot, score: f64) -> SentimentSnapshot {
        let score = clamp_score(score);
        let trend = ewma(previous.trend, score, self.alpha);
        let negative_streak = if score < self.negative_score_floor {
            previous.negative_streak.saturating_add(1)
        } else {
            0
        };
        SentimentSnapshot { trend, negative_streak }
    }
}

pub fn ewma(trend: f64, score: f64, alpha: f64) -> f64 {
    let alpha = alpha.clamp(0.0, 1.0);
    alpha * score + (1.0 - alpha) * trend
}
