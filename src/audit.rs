//! Audit trail of every admission and dispatch decision.
//!
//! Records are append-only. The gate writes one per admission attempt and the
//! dispatcher one per terminal outcome, so a request that reaches the backend
//! leaves exactly two records, admission first.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Mutex;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Admitted,
    Rejected,
    Cached,
    Followed,
    Executed,
    Cancelled,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Admitted => "admitted",
            Decision::Rejected => "rejected",
            Decision::Cached => "cached",
            Decision::Followed => "followed",
            Decision::Executed => "executed",
            Decision::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "error", rename_all = "snake_case")]
pub enum AuditOutcome {
    // admission records: nothing has run yet
    Pending,
    Success,
    Failure(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub request_id: String,
    pub session_id: String,
    pub tool: String,
    pub decision: Decision,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
    pub outcome: AuditOutcome,
}

impl AuditRecord {
    pub fn new(
        request_id: &str,
        session_id: &str,
        tool: &str,
        decision: Decision,
        reason: impl Into<String>,
        outcome: AuditOutcome,
    ) -> Self {
        Self {
            request_id: request_id.to_string(),
            session_id: session_id.to_string(),
            tool: tool.to_string(),
            decision,
            reason: reason.into(),
            timestamp: Utc::now(),
            outcome,
        }
    }
}

/// Destination for audit records. Persisting them is the sink's business.
pub trait AuditSink: Send + Sync {
    fn record(&self, record: AuditRecord);
}

// Writes records to the `audit` tracing target
#[derive(Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, record: AuditRecord) {
        let outcome = match &record.outcome {
            AuditOutcome::Pending => "pending",
            AuditOutcome::Success => "success",
            AuditOutcome::Failure(kind) => kind.as_str(),
        };
        info!(
            target: "audit",
            request_id = %record.request_id,
            session_id = %record.session_id,
            tool = %record.tool,
            decision = record.decision.as_str(),
            outcome,
            timestamp = %record.timestamp.to_rfc3339(),
            "{}",
            record.reason
        );
    }
}

// Used when audit logging is switched off
#[derive(Debug, Default)]
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn record(&self, _record: AuditRecord) {}
}

/// Keeps records in memory, in emission order.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn for_request(&self, request_id: &str) -> Vec<AuditRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.request_id == request_id)
            .collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, record: AuditRecord) {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_keeps_order_per_request() {
        let sink = MemoryAuditSink::new();
        sink.record(AuditRecord::new("1", "s", "generate_text", Decision::Admitted, "ok", AuditOutcome::Pending));
        sink.record(AuditRecord::new("2", "s", "generate_text", Decision::Rejected, "queue_full", AuditOutcome::Failure("queue_full".into())));
        sink.record(AuditRecord::new("1", "s", "generate_text", Decision::Executed, "backend call", AuditOutcome::Success));

        let decisions: Vec<Decision> = sink.for_request("1").iter().map(|r| r.decision).collect();
        assert_eq!(decisions, vec![Decision::Admitted, Decision::Executed]);
        assert_eq!(sink.records().len(), 3);
    }

    #[test]
    fn record_serializes_with_snake_case_decision() {
        let record = AuditRecord::new("7", "s", "chat_completion", Decision::Followed, "joined in-flight call", AuditOutcome::Success);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["decision"], "followed");
        assert_eq!(json["outcome"]["status"], "success");
    }
}
