//! Admission control for tool calls.
//!
//! The gate runs an ordered list of independent [`AdmissionCheck`]s over each
//! raw request. The first failing check rejects it. Either way exactly one
//! audit record is written. The default order is authenticate, origin policy,
//! decode, clamp response length, length limit, sanitize.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use crate::audit::{AuditOutcome, AuditRecord, AuditSink, Decision};
use crate::config::SecuritySettings;
use crate::error::GatewayError;
use crate::metrics::REJECTED_TOTAL;
use crate::tools::ToolCall;

// Special tokens that would let a prompt break out of the model's template
const DISALLOWED_MARKERS: [&str; 4] = ["</s>", "<|endoftext|>", "<|im_start|>", "<|im_end|>"];

/// A tool call as it arrives from a session, before any validation.
#[derive(Debug, Clone, Default)]
pub struct RawRequest {
    pub id: String,
    pub session_id: String,
    pub tool: String,
    pub arguments: Map<String, Value>,
    pub token: Option<String>,
    pub origin: Option<String>,
    // how long the call may wait for an execution slot
    pub deadline: Option<Duration>,
}

/// A call that passed every check. Its text fields are already sanitized.
#[derive(Debug, Clone)]
pub struct AdmittedCall {
    pub id: String,
    pub session_id: String,
    pub call: ToolCall,
    pub submitted_at: DateTime<Utc>,
    pub deadline: Option<Instant>,
}

/// State threaded through the checks.
pub struct Candidate<'a> {
    pub raw: &'a RawRequest,
    pub call: Option<ToolCall>,
    pub notes: Vec<String>,
}

impl Candidate<'_> {
    fn call_mut(&mut self) -> Result<&mut ToolCall, GatewayError> {
        self.call.as_mut().ok_or_else(|| GatewayError::InvalidRequest {
            details: "arguments were not decoded before this check".to_string(),
        })
    }
}

pub trait AdmissionCheck: Send + Sync {
    fn name(&self) -> &'static str;
    fn apply(&self, candidate: &mut Candidate<'_>) -> Result<(), GatewayError>;
}

// Caller must present the configured token
pub struct Authenticate {
    token: String,
}

impl AdmissionCheck for Authenticate {
    fn name(&self) -> &'static str {
        "authenticate"
    }

    fn apply(&self, candidate: &mut Candidate<'_>) -> Result<(), GatewayError> {
        match candidate.raw.token.as_deref() {
            None => Err(GatewayError::Unauthorized {
                reason: "missing token".to_string(),
            }),
            Some(token) if constant_time_eq(token.as_bytes(), self.token.as_bytes()) => Ok(()),
            Some(_) => Err(GatewayError::Unauthorized {
                reason: "invalid token".to_string(),
            }),
        }
    }
}

// Browser origins must be on the allow list, "*" allows all
pub struct OriginPolicy {
    allowed: Vec<String>,
}

impl AdmissionCheck for OriginPolicy {
    fn name(&self) -> &'static str {
        "origin"
    }

    fn apply(&self, candidate: &mut Candidate<'_>) -> Result<(), GatewayError> {
        let Some(origin) = candidate.raw.origin.as_deref() else {
            return Ok(());
        };
        if self.allowed.iter().any(|a| a == "*" || a == origin) {
            return Ok(());
        }
        Err(GatewayError::Unauthorized {
            reason: format!("origin {origin} is not allowed"),
        })
    }
}

pub struct Decode;

impl AdmissionCheck for Decode {
    fn name(&self) -> &'static str {
        "decode"
    }

    fn apply(&self, candidate: &mut Candidate<'_>) -> Result<(), GatewayError> {
        let call = ToolCall::decode(&candidate.raw.tool, &candidate.raw.arguments)?;
        candidate.call = Some(call);
        Ok(())
    }
}

// max_tokens may not exceed the response length ceiling
pub struct ClampResponse {
    ceiling: u32,
}

impl AdmissionCheck for ClampResponse {
    fn name(&self) -> &'static str {
        "response_ceiling"
    }

    fn apply(&self, candidate: &mut Candidate<'_>) -> Result<(), GatewayError> {
        let ceiling = self.ceiling;
        if candidate.call_mut()?.clamp_max_tokens(ceiling) {
            candidate.notes.push(format!("max_tokens clamped to {ceiling}"));
        }
        Ok(())
    }
}

pub struct LengthLimit {
    max_chars: usize,
}

impl AdmissionCheck for LengthLimit {
    fn name(&self) -> &'static str {
        "length"
    }

    fn apply(&self, candidate: &mut Candidate<'_>) -> Result<(), GatewayError> {
        let call = candidate.call_mut()?;
        for (field, text) in call.texts() {
            let length = text.chars().count();
            if length > self.max_chars {
                return Err(GatewayError::PayloadTooLarge {
                    field,
                    length,
                    limit: self.max_chars,
                });
            }
        }
        Ok(())
    }
}

pub struct Sanitize;

impl AdmissionCheck for Sanitize {
    fn name(&self) -> &'static str {
        "sanitize"
    }

    fn apply(&self, candidate: &mut Candidate<'_>) -> Result<(), GatewayError> {
        let mut stripped = 0;
        for (field, text) in candidate.call_mut()?.texts_mut() {
            stripped += sanitize_text(&field, text)?;
        }
        if stripped > 0 {
            candidate.notes.push(format!("stripped {stripped} control markers"));
        }
        Ok(())
    }
}

/// Remove disallowed markers in place. Returns how many were removed.
pub fn sanitize_text(field: &str, text: &mut String) -> Result<usize, GatewayError> {
    if let Some(c) = text
        .chars()
        .find(|c| c.is_control() && !matches!(c, '\n' | '\r' | '\t'))
    {
        return Err(GatewayError::SanitizationFailed {
            reason: format!("{field} contains control character U+{:04X}", c as u32),
        });
    }

    let mut stripped = 0;
    // repeat: removing one marker can splice together another
    while let Some(marker) = DISALLOWED_MARKERS.iter().find(|m| text.contains(**m)) {
        stripped += text.matches(marker).count();
        *text = text.replace(marker, "");
    }

    if stripped > 0 && text.trim().is_empty() {
        return Err(GatewayError::SanitizationFailed {
            reason: format!("{field} is empty after removing control markers"),
        });
    }
    Ok(stripped)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

pub struct SecurityGate {
    checks: Vec<Box<dyn AdmissionCheck>>,
    audit: Arc<dyn AuditSink>,
}

impl SecurityGate {
    pub fn new(settings: &SecuritySettings, audit: Arc<dyn AuditSink>) -> Self {
        let mut checks: Vec<Box<dyn AdmissionCheck>> = Vec::new();
        if settings.enable_auth {
            checks.push(Box::new(Authenticate {
                token: settings.auth_token.clone().unwrap_or_default(),
            }));
        }
        checks.push(Box::new(OriginPolicy {
            allowed: settings.allowed_origins.clone(),
        }));
        checks.push(Box::new(Decode));
        checks.push(Box::new(ClampResponse {
            ceiling: settings.max_response_length,
        }));
        checks.push(Box::new(LengthLimit {
            max_chars: settings.max_prompt_length,
        }));
        if settings.data_sanitization {
            checks.push(Box::new(Sanitize));
        }
        Self::with_checks(checks, audit)
    }

    pub fn with_checks(checks: Vec<Box<dyn AdmissionCheck>>, audit: Arc<dyn AuditSink>) -> Self {
        Self { checks, audit }
    }

    pub fn check_names(&self) -> Vec<&'static str> {
        self.checks.iter().map(|c| c.name()).collect()
    }

    pub fn admit(&self, raw: RawRequest) -> Result<AdmittedCall, GatewayError> {
        let mut candidate = Candidate {
            raw: &raw,
            call: None,
            notes: Vec::new(),
        };

        for check in &self.checks {
            if let Err(err) = check.apply(&mut candidate) {
                return Err(self.reject(&raw, check.name(), err));
            }
        }

        let notes = candidate.notes;
        let call = match candidate.call {
            Some(call) => call,
            None => match ToolCall::decode(&raw.tool, &raw.arguments) {
                Ok(call) => call,
                Err(err) => return Err(self.reject(&raw, "decode", err)),
            },
        };

        let reason = if notes.is_empty() {
            format!("passed {} checks", self.checks.len())
        } else {
            format!("passed {} checks; {}", self.checks.len(), notes.join("; "))
        };
        self.audit.record(AuditRecord::new(
            &raw.id,
            &raw.session_id,
            &raw.tool,
            Decision::Admitted,
            reason,
            AuditOutcome::Pending,
        ));

        Ok(AdmittedCall {
            deadline: raw.deadline.map(|d| Instant::now() + d),
            id: raw.id,
            session_id: raw.session_id,
            call,
            submitted_at: Utc::now(),
        })
    }

    fn reject(&self, raw: &RawRequest, stage: &str, err: GatewayError) -> GatewayError {
        debug!(request_id = %raw.id, stage, error = %err, "request rejected at admission");
        REJECTED_TOTAL.with_label_values(&[err.kind()]).inc();
        self.audit.record(AuditRecord::new(
            &raw.id,
            &raw.session_id,
            &raw.tool,
            Decision::Rejected,
            format!("{stage}: {err}"),
            AuditOutcome::Failure(err.kind().to_string()),
        ));
        err
    }
}
