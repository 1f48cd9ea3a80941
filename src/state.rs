use chrono::{DateTime, Utc};
use std::sync::Arc;
use crate::audit::{AuditSink, NullAuditSink, TracingAuditSink};
use crate::clock::{Clock, SystemClock};
use crate::config::Settings;
use crate::gateway::Gateway;
use crate::mcp::McpHandler;

// app's shared state

pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub mcp: McpHandler,
    pub settings: Settings,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(settings: Settings, gateway: Arc<Gateway>) -> Self {
        Self {
            mcp: McpHandler::new(Arc::clone(&gateway)),
            gateway,
            settings,
            started_at: Utc::now(),
        }
    }

    // Wires the gateway against the real KoboldCpp client
    pub fn from_settings(settings: Settings) -> Self {
        let audit: Arc<dyn AuditSink> = if settings.logging.audit_log {
            Arc::new(TracingAuditSink)
        } else {
            Arc::new(NullAuditSink)
        };
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let gateway = Arc::new(Gateway::new(&settings, audit, clock));
        Self::new(settings, gateway)
    }
}
