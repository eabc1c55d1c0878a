use thiserror::Error;

use crate::flows::states::{ConversationEvent, ConversationState, FlowAction, TransitionOutcome};

/// The conversation lifecycle table. Pure: the router asks it whether a move is legal
/// before attempting the store compare-and-swap.
#[derive(Clone, Debug, Default)]
pub struct ConversationFlow;

impl ConversationFlow {
    pub fn new() -> Self {
        Self
    }

    pub fn initial_state(&self) -> ConversationState {
        ConversationState::New
    }

    pub fn apply(
        &self,
        current: &ConversationState,
        event: &ConversationEvent,
    ) -> Result<TransitionOutcome, FlowTransitionError> {
        transition(current, event)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FlowTransitionError {
    #[error("conversation is in terminal state {state:?}")]
    Terminal { state: ConversationState, event: ConversationEvent },
    #[error("invalid transition from {state:?} using event {event:?}")]
    InvalidTransition { state: ConversationState, event: ConversationEvent },
}

fn transition(
    current: &ConversationState,
    event: &ConversationEvent,
) -> Result<TransitionOutcome, FlowTransitionError> {
    use ConversationEvent::{
        CloseRequested, EscalationTriggered, FirstMessage, HandoffClaimed, HandoffFailed,
        InactivityTimeout, TurnCompleted,
    };
    use ConversationState::{Active, Closed, Escalating, HandedOff, New};
    use FlowAction::{
        ArchiveConversation, ClassifyMessage, DispatchHandler, EnqueueHandoff, NotifyOperator,
        SnapshotHistory,
    };

    if current.is_terminal() {
        return Err(FlowTransitionError::Terminal { state: *current, event: *event });
    }

    let (to, actions) = match (current, event) {
        (New, FirstMessage) => (Active, vec![ClassifyMessage, DispatchHandler]),
        (Active, TurnCompleted) => (Active, Vec::new()),
        (Active, EscalationTriggered) => (Escalating, vec![SnapshotHistory, EnqueueHandoff]),
        (Escalating, HandoffClaimed) => (HandedOff, vec![NotifyOperator]),
        (Escalating, HandoffFailed) => (Active, Vec::new()),
        (Active, InactivityTimeout)
        | (Active, CloseRequested)
        | (Escalating, InactivityTimeout)
        | (Escalating, CloseRequested) => (Closed, vec![ArchiveConversation]),
        // An opened conversation that never got its first message can still expire.
        (New, InactivityTimeout) | (New, CloseRequested) => (Closed, vec![ArchiveConversation]),
        _ => {
            return Err(FlowTransitionError::InvalidTransition { state: *current, event: *event });
        }
    };

    Ok(TransitionOutcome { from: *current, to, event: *event, actions })
}
