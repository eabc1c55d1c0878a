use async_trait::async_trait;

use super::{Handler, HandlerAction, HandlerFailure, HandlerKind, HandlerRequest, HandlerResponse};

#[derive(Clone, Debug, Default)]
pub struct FeedbackHandler;

impl FeedbackHandler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Handler for FeedbackHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::FeedbackCollection
    }

    async fn respond(
        &self,
        request: HandlerRequest<'_>,
    ) -> Result<HandlerResponse, HandlerFailure> {
        let sentiment = request.classification.sentiment_score;
        let text = if sentiment > 0.2 {
            "Thank you for the kind words! I have shared your feedback with the team."
        } else if sentiment < -0.2 {
            "Thank you for telling us. I have passed this on to the team so we can improve."
        } else {
            "Thanks for the feedback. It has been recorded and the team reviews it every week."
        };
        Ok(HandlerResponse::text(text).with_action(HandlerAction::RecordFeedback { sentiment }))
    }
}
