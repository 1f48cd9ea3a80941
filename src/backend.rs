//! HTTP client for the KoboldCpp inference server.
//!
//! Every call is bounded by a per-attempt timeout and retried with a linear
//! backoff (`retry_delay * attempt`) while the failure looks transient:
//! connection errors, timeouts, 5xx and 429. Client errors and bodies we
//! cannot read are surfaced straight away.

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use crate::clock::Clock;
use crate::config::BackendSettings;
use crate::error::GatewayError;
use crate::metrics::BACKEND_RETRIES;
use crate::models::{BackendCall, BackendStatus, ChatParams, Endpoint, GenerateParams, Generation, ModelInfo};

// KoboldCpp default sampler order
const SAMPLER_ORDER: [u8; 7] = [6, 0, 1, 3, 4, 2, 5];
const MAX_ERROR_BODY: usize = 512;

/// A successful backend call plus how many retries it took.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub generation: Generation,
    pub retries: u32,
}

/// What the dispatcher needs from a backend.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn call(&self, call: &BackendCall, timeout: Duration) -> Result<Completion, GatewayError>;
}

enum AttemptError {
    Transient(String),
    Fatal(GatewayError),
}

pub struct BackendClient {
    http: reqwest::Client,
    settings: BackendSettings,
    clock: Arc<dyn Clock>,
}

impl BackendClient {
    pub fn new(settings: BackendSettings, clock: Arc<dyn Clock>) -> Self {
        Self::with_client(reqwest::Client::new(), settings, clock)
    }

    pub fn with_client(http: reqwest::Client, settings: BackendSettings, clock: Arc<dyn Clock>) -> Self {
        Self { http, settings, clock }
    }

    pub fn base_url(&self) -> &str {
        &self.settings.url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.settings.url.trim_end_matches('/'), path)
    }

    // single HTTP round trip, no retries
    async fn attempt(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        timeout: Duration,
    ) -> Result<Value, AttemptError> {
        let mut request = self.http.request(method, self.url(path));
        if let Some(body) = body {
            request = request.json(body);
        }

        let exchange = async {
            let response = request.send().await?;
            let status = response.status();
            let text = response.text().await?;
            Ok::<_, reqwest::Error>((status, text))
        };

        let (status, text) = match tokio::time::timeout(timeout, exchange).await {
            Err(_) => {
                return Err(AttemptError::Transient(format!("timed out after {timeout:?}")));
            }
            Ok(Err(e)) => return Err(AttemptError::Transient(e.to_string())),
            Ok(Ok(pair)) => pair,
        };

        if status.is_success() {
            return serde_json::from_str(&text).map_err(|e| {
                AttemptError::Fatal(GatewayError::MalformedBackendResponse {
                    details: format!("invalid JSON from {path}: {e}"),
                })
            });
        }
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(AttemptError::Transient(format!("HTTP {}", status.as_u16())));
        }
        Err(AttemptError::Fatal(GatewayError::BackendRejected {
            status: status.as_u16(),
            body: truncate(&text, MAX_ERROR_BODY),
        }))
    }

    // Returns the decoded body and the number of retries it took
    async fn request_json(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        timeout: Duration,
    ) -> Result<(Value, u32), GatewayError> {
        let attempts = self.settings.max_retries + 1;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.attempt(method.clone(), path, body, timeout).await {
                Ok(value) => return Ok((value, attempt - 1)),
                Err(AttemptError::Fatal(err)) => return Err(err),
                Err(AttemptError::Transient(reason)) => {
                    warn!(path, attempt, attempts, error = %reason, "backend attempt failed");
                    last_error = reason;
                    if attempt < attempts {
                        BACKEND_RETRIES.inc();
                        self.clock.sleep(self.settings.retry_delay() * attempt).await;
                    }
                }
            }
        }

        Err(GatewayError::BackendUnavailable { attempts, last_error })
    }

    pub async fn model_info(&self) -> Result<ModelInfo, GatewayError> {
        let (body, _) = self
            .request_json(Method::GET, &self.settings.model_endpoint, None, self.settings.timeout())
            .await?;
        parse_model_info(&body)
    }

    pub async fn status(&self) -> BackendStatus {
        let offline = BackendStatus {
            online: false,
            model_loaded: false,
            model_name: None,
            generation_active: false,
            server_url: self.settings.url.clone(),
        };

        let body = match self
            .request_json(Method::GET, &self.settings.status_endpoint, None, self.settings.timeout())
            .await
        {
            Ok((body, _)) => body,
            Err(e) => {
                debug!(error = %e, "status check failed");
                return offline;
            }
        };

        // model endpoint is optional on older builds
        let model = self.model_info().await.ok();
        let generation_active = body.get("generating").and_then(Value::as_bool).unwrap_or(false);
        let model_loaded = body
            .get("ready")
            .and_then(Value::as_bool)
            .unwrap_or_else(|| model.as_ref().is_some_and(|m| m.model_name != "inactive"));

        BackendStatus {
            online: true,
            model_loaded,
            model_name: model.map(|m| m.model_name),
            generation_active,
            ..offline
        }
    }

    // One attempt against the status endpoint, for the health checker
    pub async fn probe(&self, timeout: Duration) -> bool {
        self.attempt(Method::GET, &self.settings.status_endpoint, None, timeout)
            .await
            .is_ok()
    }
}

#[async_trait]
impl Backend for BackendClient {
    async fn call(&self, call: &BackendCall, timeout: Duration) -> Result<Completion, GatewayError> {
        let (path, body) = match call {
            BackendCall::Generate(params) => (&self.settings.generate_endpoint, native_body(params)),
            BackendCall::Chat(params) => (&self.settings.chat_endpoint, chat_body(params)),
        };
        let (response, retries) = self.request_json(Method::POST, path, Some(&body), timeout).await?;
        let generation = normalize(&response)?;
        Ok(Completion { generation, retries })
    }
}

fn native_body(params: &GenerateParams) -> Value {
    json!({
        "prompt": params.prompt,
        "max_length": params.max_tokens,
        "temperature": params.temperature,
        "top_p": params.top_p,
        "top_k": params.top_k,
        "typical": params.typical_p,
        "rep_pen": params.rep_pen,
        "rep_pen_range": params.rep_pen_range,
        "sampler_order": SAMPLER_ORDER,
        "stop_sequence": params.stop_sequence,
        "stream": false,
    })
}

fn chat_body(params: &ChatParams) -> Value {
    json!({
        "model": "koboldcpp",
        "messages": params.messages,
        "max_tokens": params.max_tokens,
        "temperature": params.temperature,
        "top_p": params.top_p,
        "stream": false,
    })
}

/// Map either response variant onto one `Generation`.
///
/// Native: `{"results": [{"text": ..., "finish_reason": ...}]}`.
/// OpenAI-compatible: `{"choices": [{"message": {"content": ...}}], "usage": {...}}`,
/// or `choices[0].text` for plain completions.
pub fn normalize(body: &Value) -> Result<Generation, GatewayError> {
    if let Some(first) = body.pointer("/results/0") {
        let text = first
            .get("text")
            .and_then(Value::as_str)
            .ok_or_else(|| malformed("results[0].text missing"))?;
        return Ok(Generation {
            text: text.to_string(),
            tokens_generated: estimate_tokens(text),
            finish_reason: finish_reason(first),
            endpoint: Endpoint::Native,
        });
    }

    if let Some(choice) = body.pointer("/choices/0") {
        let text = choice
            .pointer("/message/content")
            .or_else(|| choice.get("text"))
            .and_then(Value::as_str)
            .ok_or_else(|| malformed("choices[0] has neither message.content nor text"))?;
        let tokens = body
            .pointer("/usage/completion_tokens")
            .and_then(Value::as_u64)
            .map(|n| n as u32)
            .unwrap_or_else(|| estimate_tokens(text));
        return Ok(Generation {
            text: text.to_string(),
            tokens_generated: tokens,
            finish_reason: finish_reason(choice),
            endpoint: Endpoint::OpenAi,
        });
    }

    Err(malformed("expected `results` or `choices`"))
}

fn parse_model_info(body: &Value) -> Result<ModelInfo, GatewayError> {
    let model_name = body
        .get("result")
        .or_else(|| body.get("model_name"))
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("model endpoint returned no model name"))?;
    Ok(ModelInfo {
        model_name: model_name.to_string(),
        context_length: body
            .get("max_context_length")
            .and_then(Value::as_u64)
            .map(|n| n as u32),
    })
}

fn finish_reason(item: &Value) -> String {
    item.get("finish_reason")
        .and_then(Value::as_str)
        .unwrap_or("stop")
        .to_string()
}

// KoboldCpp native responses carry no token count
fn estimate_tokens(text: &str) -> u32 {
    text.split_whitespace().count() as u32
}

fn malformed(details: &str) -> GatewayError {
    GatewayError::MalformedBackendResponse {
        details: details.to_string(),
    }
}

fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
