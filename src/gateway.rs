//! Entry point for session handlers: admit a raw tool call, expand it into
//! backend requests, dispatch them and shape the answer.
//!
//! `generate_text` and `chat_completion` map to one dispatch each.
//! `test_prompt` dispatches one request per parameter combination and
//! `batch_generate` one per prompt with a bounded fan-out. Sub-requests carry
//! the parent id with an index suffix (`id/3`).

use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tracing::{error, info};
use crate::audit::AuditSink;
use crate::backend::{Backend, BackendClient};
use crate::cache::ResponseCache;
use crate::clock::Clock;
use crate::config::Settings;
use crate::dispatcher::{DispatchResult, Dispatcher, DispatcherConfig, Request};
use crate::error::GatewayError;
use crate::health::BackendHealth;
use crate::metrics::REQUEST_TOTAL;
use crate::models::{BackendCall, ChatParams, GenerateParams, Generation};
use crate::security::{AdmittedCall, RawRequest, SecurityGate};
use crate::tools::{BatchParams, TestPromptParams, ToolCall};

pub const MODEL_INFO_URI: &str = "koboldcpp://model/info";
pub const SERVER_STATUS_URI: &str = "koboldcpp://server/status";

/// Text answer of a tool call plus structured details.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolOutput {
    pub text: String,
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDefinition {
    pub uri: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub mime_type: &'static str,
}

pub fn resources() -> Vec<ResourceDefinition> {
    vec![
        ResourceDefinition {
            uri: MODEL_INFO_URI,
            name: "Model Information",
            description: "Current KoboldCpp model information and capabilities",
            mime_type: "application/json",
        },
        ResourceDefinition {
            uri: SERVER_STATUS_URI,
            name: "Server Status",
            description: "KoboldCpp server status and gateway health",
            mime_type: "application/json",
        },
    ]
}

/// A submitted tool call running in the background.
pub struct Pending {
    id: String,
    handle: JoinHandle<Result<ToolOutput, GatewayError>>,
}

impl Pending {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn cancel(&self) {
        self.handle.abort();
    }

    // lets another task cancel the call while this one waits on it
    pub fn abort_handle(&self) -> AbortHandle {
        self.handle.abort_handle()
    }

    pub async fn wait(self) -> Result<ToolOutput, GatewayError> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(GatewayError::Cancelled),
            Err(e) => {
                error!(request_id = %self.id, error = %e, "tool call task panicked");
                Err(GatewayError::Cancelled)
            }
        }
    }
}

pub struct Gateway {
    gate: SecurityGate,
    dispatcher: Arc<Dispatcher>,
    client: Arc<BackendClient>,
    health: Arc<BackendHealth>,
    batch_ceiling: usize,
    queue_deadline: Option<Duration>,
}

impl Gateway {
    pub fn new(settings: &Settings, audit: Arc<dyn AuditSink>, clock: Arc<dyn Clock>) -> Self {
        let client = Arc::new(BackendClient::new(settings.koboldcpp.clone(), Arc::clone(&clock)));
        Self::with_backend(settings, client.clone(), client, audit, clock)
    }

    /// Tool calls go to `backend`, resource reads and health probes to `client`.
    pub fn with_backend(
        settings: &Settings,
        backend: Arc<dyn Backend>,
        client: Arc<BackendClient>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let perf = &settings.performance;
        let cache = perf.enable_caching.then(|| {
            Arc::new(ResponseCache::new(perf.cache_ttl(), perf.memory_budget(), clock))
        });
        let dispatcher = Dispatcher::new(
            backend,
            cache,
            Arc::clone(&audit),
            DispatcherConfig {
                max_concurrent: perf.max_concurrent_requests,
                queue_capacity: perf.request_queue_size,
                timeout: settings.koboldcpp.timeout(),
            },
        );

        Self {
            gate: SecurityGate::new(&settings.security, audit),
            dispatcher: Arc::new(dispatcher),
            health: Arc::new(BackendHealth::new(client.base_url())),
            client,
            batch_ceiling: perf.max_concurrent_requests.max(1),
            queue_deadline: perf.queue_deadline(),
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn client(&self) -> &Arc<BackendClient> {
        &self.client
    }

    pub fn health(&self) -> &Arc<BackendHealth> {
        &self.health
    }

    pub fn cache(&self) -> Option<&Arc<ResponseCache>> {
        self.dispatcher.cache()
    }

    /// Admits and runs the call on its own task.
    pub fn submit(self: &Arc<Self>, mut raw: RawRequest) -> Pending {
        REQUEST_TOTAL.inc();
        if raw.deadline.is_none() {
            raw.deadline = self.queue_deadline;
        }

        let id = raw.id.clone();
        let gateway = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let admitted = gateway.gate.admit(raw)?;
            gateway.execute(admitted).await
        });
        Pending { id, handle }
    }

    async fn execute(&self, admitted: AdmittedCall) -> Result<ToolOutput, GatewayError> {
        let AdmittedCall { id, session_id, call, deadline, .. } = admitted;
        info!(request_id = %id, session_id = %session_id, tool = call.name(), "executing tool call");

        let ctx = CallContext {
            id: &id,
            session_id: &session_id,
            deadline,
        };
        match call {
            ToolCall::GenerateText(params) => self.generate_text(&ctx, params).await,
            ToolCall::ChatCompletion(params) => self.chat_completion(&ctx, params).await,
            ToolCall::TestPrompt(params) => self.test_prompt(&ctx, params).await,
            ToolCall::BatchGenerate(params) => self.batch_generate(&ctx, params).await,
        }
    }

    async fn dispatch(&self, ctx: &CallContext<'_>, id: String, tool: &str, call: BackendCall) -> DispatchResult {
        let request = Request::new(id, ctx.session_id, tool, call, ctx.deadline);
        self.dispatcher.dispatch(request).await
    }

    async fn generate_text(&self, ctx: &CallContext<'_>, params: GenerateParams) -> Result<ToolOutput, GatewayError> {
        let parameters = serde_json::to_value(&params).unwrap_or(Value::Null);
        let result = self
            .dispatch(ctx, ctx.id.to_string(), "generate_text", BackendCall::Generate(params))
            .await;
        let generation = result.outcome.clone()?;

        let mut metadata = generation_metadata(&result, &generation);
        metadata["parameters_used"] = parameters;
        Ok(ToolOutput {
            text: generation.text.clone(),
            metadata,
        })
    }

    async fn chat_completion(&self, ctx: &CallContext<'_>, params: ChatParams) -> Result<ToolOutput, GatewayError> {
        let conversation_length = params.messages.len();
        let result = self
            .dispatch(ctx, ctx.id.to_string(), "chat_completion", BackendCall::Chat(params))
            .await;
        let generation = result.outcome.clone()?;

        let mut metadata = generation_metadata(&result, &generation);
        metadata["conversation_length"] = json!(conversation_length);
        Ok(ToolOutput {
            text: generation.text.clone(),
            metadata,
        })
    }

    // One dispatch per (temperature, top_p) pair, run in order so timings compare
    async fn test_prompt(&self, ctx: &CallContext<'_>, params: TestPromptParams) -> Result<ToolOutput, GatewayError> {
        let mut variations = Vec::new();
        let mut best: Option<(f64, f64, f64)> = None;
        let mut first_error = None;

        for &temperature in &params.temperature_range {
            for &top_p in &params.top_p_range {
                let call = BackendCall::Generate(GenerateParams {
                    max_tokens: params.max_tokens,
                    temperature,
                    top_p,
                    ..GenerateParams::new(params.prompt.clone())
                });
                let id = format!("{}/{}", ctx.id, variations.len());
                let result = self.dispatch(ctx, id, "test_prompt", call).await;

                match &result.outcome {
                    Ok(generation) => {
                        let tps = tokens_per_second(generation, result.latency);
                        if best.is_none_or(|(_, _, fastest)| tps > fastest) {
                            best = Some((temperature, top_p, tps));
                        }
                        variations.push(json!({
                            "temperature": temperature,
                            "top_p": top_p,
                            "generated_text": generation.text,
                            "tokens_generated": generation.tokens_generated,
                            "generation_time": result.latency.as_secs_f64(),
                            "tokens_per_second": tps,
                            "served_by": result.served_by.as_str(),
                        }));
                    }
                    Err(err) => {
                        variations.push(json!({
                            "temperature": temperature,
                            "top_p": top_p,
                            "error": err.to_string(),
                        }));
                        first_error.get_or_insert_with(|| err.clone());
                    }
                }
            }
        }

        let Some((temperature, top_p, performance)) = best else {
            return Err(first_error.unwrap_or(GatewayError::InvalidRequest {
                details: "no prompt variations to test".to_string(),
            }));
        };

        Ok(ToolOutput {
            text: format!(
                "Prompt testing completed with {} variations; fastest was temperature={temperature}, top_p={top_p}",
                variations.len()
            ),
            metadata: json!({
                "total_tests": variations.len(),
                "test_results": variations,
                "best_configuration": {
                    "temperature": temperature,
                    "top_p": top_p,
                    "performance": performance,
                },
            }),
        })
    }

    async fn batch_generate(&self, ctx: &CallContext<'_>, params: BatchParams) -> Result<ToolOutput, GatewayError> {
        let started = Instant::now();
        let fan_out = params.max_concurrent.clamp(1, self.batch_ceiling);
        let BatchParams {
            prompts,
            max_tokens,
            temperature,
            ..
        } = params;
        let total = prompts.len();

        let results: Vec<DispatchResult> = stream::iter(prompts.into_iter().enumerate().map(|(i, prompt)| {
            let call = BackendCall::Generate(GenerateParams {
                max_tokens,
                temperature,
                ..GenerateParams::new(prompt)
            });
            self.dispatch(ctx, format!("{}/{i}", ctx.id), "batch_generate", call)
        }))
        .buffered(fan_out)
        .collect()
        .await;

        let mut lines = Vec::with_capacity(total);
        let mut entries = Vec::with_capacity(total);
        let mut successful = 0;
        for (i, result) in results.iter().enumerate() {
            match &result.outcome {
                Ok(generation) => {
                    successful += 1;
                    lines.push(format!("[{i}] {}", generation.text));
                    entries.push(json!({
                        "prompt_index": i,
                        "success": true,
                        "generated_text": generation.text,
                        "tokens_generated": generation.tokens_generated,
                        "generation_time": result.latency.as_secs_f64(),
                        "served_by": result.served_by.as_str(),
                    }));
                }
                Err(err) => {
                    lines.push(format!("[{i}] error: {err}"));
                    entries.push(json!({
                        "prompt_index": i,
                        "success": false,
                        "error": err.to_string(),
                        "error_kind": err.kind(),
                    }));
                }
            }
        }
        let failed = total - successful;

        Ok(ToolOutput {
            text: format!(
                "Batch generation completed: {successful} successful, {failed} failed\n{}",
                lines.join("\n")
            ),
            metadata: json!({
                "results": entries,
                "total_time": started.elapsed().as_secs_f64(),
                "successful": successful,
                "failed": failed,
                "total_prompts": total,
                "max_concurrent": fan_out,
            }),
        })
    }

    /// Reads a resource straight from the backend. Unknown URIs are `None`.
    pub async fn read_resource(&self, uri: &str) -> Option<Result<Value, GatewayError>> {
        match uri {
            MODEL_INFO_URI => Some(self.client.model_info().await.map(|info| json!(info))),
            SERVER_STATUS_URI => {
                let status = self.client.status().await;
                let mut body = json!(status);
                body["gateway"] = self.snapshot();
                Some(Ok(body))
            }
            _ => None,
        }
    }

    // Load and health figures for /health and the status resource
    pub fn snapshot(&self) -> Value {
        let (entries, bytes) = self
            .cache()
            .map(|c| (c.len(), c.bytes()))
            .unwrap_or((0, 0));
        json!({
            "backend_healthy": self.health.is_healthy(),
            "backend_last_checked": self.health.last_checked().map(|t| t.to_rfc3339()),
            "queued": self.dispatcher.queued(),
            "executing": self.dispatcher.executing(),
            "max_concurrent_requests": self.dispatcher.config().max_concurrent,
            "request_queue_size": self.dispatcher.config().queue_capacity,
            "cache_entries": entries,
            "cache_bytes": bytes,
        })
    }
}

struct CallContext<'a> {
    id: &'a str,
    session_id: &'a str,
    deadline: Option<Instant>,
}

fn tokens_per_second(generation: &Generation, latency: Duration) -> f64 {
    let secs = latency.as_secs_f64();
    if secs > 0.0 {
        generation.tokens_generated as f64 / secs
    } else {
        0.0
    }
}

fn generation_metadata(result: &DispatchResult, generation: &Generation) -> Value {
    json!({
        "tokens_generated": generation.tokens_generated,
        "finish_reason": generation.finish_reason,
        "endpoint": generation.endpoint,
        "generation_time": result.latency.as_secs_f64(),
        "tokens_per_second": tokens_per_second(generation, result.latency),
        "retries": result.retries,
        "served_by": result.served_by.as_str(),
        "cached": result.served_by == crate::dispatcher::ServedBy::Cache,
    })
}
