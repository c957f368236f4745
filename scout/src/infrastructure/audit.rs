use tracing::{info, info_span};

/// Operator-visible events, logged on the dedicated `audit` target.
#[derive(Debug)]
pub enum AuditEvent {
    SystemStartup {
        component: String,
    },
    SystemShutdown {
        reason: String,
    },
    ConfigChanged {
        key: String,
        old_val: String,
        new_val: String,
    },
    ActiveEndpointChanged {
        previous: Option<String>,
        current: String,
    },
}

/// Logs an audit event. Subscribers can route `target: "audit"` to a
/// separate sink.
pub fn log_audit(event: AuditEvent) {
    let span = info_span!(target: "audit", "audit_event");
    let _enter = span.enter();

    info!(target: "audit", event = ?event, "Audit event");
}
