use concierge_core::audit::{AuditEvent, AuditOutcome};
use concierge_core::AuditSink;
use tracing::{info, warn};

/// Forwards audit events to the tracing subscriber. Rejections and failures log at `warn`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn emit(&self, event: AuditEvent) {
        let conversation_id =
            event.conversation_id.as_ref().map(ToString::to_string).unwrap_or_default();
        let caller_id = event.caller_id.as_deref().unwrap_or("unknown");
        let metadata = serde_json::to_string(&event.metadata).unwrap_or_default();

        match event.outcome {
            AuditOutcome::Success => info!(
                event_name = "audit.recorded",
                audit_event = %event.event_type,
                audit_id = %event.event_id,
                category = ?event.category,
                correlation_id = %event.correlation_id,
                conversation_id = %conversation_id,
                caller_id,
                actor = %event.actor,
                metadata = %metadata,
                "audit event"
            ),
            AuditOutcome::Rejected | AuditOutcome::Failed => warn!(
                event_name = "audit.recorded",
                audit_event = %event.event_type,
                audit_id = %event.event_id,
                category = ?event.category,
                outcome = ?event.outcome,
                correlation_id = %event.correlation_id,
                conversation_id = %conversation_id,
                caller_id,
                actor = %event.actor,
                metadata = %metadata,
                "audit event"
            ),
        }
    }
}
