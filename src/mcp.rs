//! MCP session handling over JSON-RPC 2.0.
//!
//! `initialize` opens a session whose id travels in the `Mcp-Session-Id`
//! header. Everything except `initialize` and `ping` needs a live session.
//! `tools/call` goes through [`Gateway::submit`] and stays cancellable via
//! `notifications/cancelled` until it resolves.
//!
//! Gate and backpressure rejections come back as JSON-RPC errors. Backend
//! failures are tool results with `isError: true`.

use axum::http::{HeaderMap, header};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;
use crate::error::GatewayError;
use crate::gateway::{self, Gateway};
use crate::security::RawRequest;
use crate::tools;

pub const PROTOCOL_VERSION: &str = "2024-11-05";
pub const SESSION_HEADER: &str = "mcp-session-id";
pub const SERVER_NAME: &str = "kobold-gateway";

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;
pub const NOT_INITIALIZED: i32 = -32002;

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    // absent for notifications
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    fn with_data(mut self, data: Value) -> Self {
        if let Some(error) = self.error.as_mut() {
            error.data = Some(data);
        }
        self
    }
}

/// What the transport should send back.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Response {
        // set when the response opens a session
        session: Option<String>,
        body: JsonRpcResponse,
    },
    // notification: HTTP 202, no body
    Accepted,
}

impl Reply {
    fn body(body: JsonRpcResponse) -> Self {
        Reply::Response { session: None, body }
    }
}

/// Transport-level facts about the caller.
#[derive(Debug, Clone, Default)]
pub struct CallerContext {
    pub session_id: Option<String>,
    pub token: Option<String>,
    pub origin: Option<String>,
}

impl CallerContext {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let text = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim().to_string())
        };
        let token = text(header::AUTHORIZATION.as_str()).and_then(|v| {
            v.strip_prefix("Bearer ")
                .map(|t| t.trim().to_string())
        });
        Self {
            session_id: text(SESSION_HEADER),
            token,
            origin: text(header::ORIGIN.as_str()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub client_name: String,
    pub client_version: String,
    pub created_at: DateTime<Utc>,
}

pub struct McpHandler {
    gateway: Arc<Gateway>,
    sessions: DashMap<String, Session>,
    // cancellable tools/call tasks keyed by (session, request id)
    pending: DashMap<(String, String), AbortHandle>,
}

impl McpHandler {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self {
            gateway,
            sessions: DashMap::new(),
            pending: DashMap::new(),
        }
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Decodes one JSON-RPC message, or the error response for it.
    pub fn parse(body: &[u8]) -> Result<JsonRpcRequest, JsonRpcResponse> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| JsonRpcResponse::failure(Value::Null, PARSE_ERROR, format!("Parse error: {e}")))?;
        let id = value.get("id").cloned().unwrap_or(Value::Null);
        let request: JsonRpcRequest = serde_json::from_value(value)
            .map_err(|e| JsonRpcResponse::failure(id.clone(), INVALID_REQUEST, format!("Invalid request: {e}")))?;
        if request.jsonrpc != "2.0" {
            return Err(JsonRpcResponse::failure(id, INVALID_REQUEST, "Invalid request: jsonrpc must be \"2.0\""));
        }
        Ok(request)
    }

    pub async fn handle(&self, caller: CallerContext, request: JsonRpcRequest) -> Reply {
        let Some(id) = request.id.clone() else {
            self.notification(&caller, &request);
            return Reply::Accepted;
        };
        debug!(method = %request.method, id = %id, "mcp request");

        let params = request.params.unwrap_or(Value::Null);
        match request.method.as_str() {
            "initialize" => return self.initialize(id, &params),
            "ping" => return Reply::body(JsonRpcResponse::success(id, json!({}))),
            _ => {}
        }

        let Some(session_id) = caller.session_id.clone().filter(|s| self.sessions.contains_key(s)) else {
            return Reply::body(JsonRpcResponse::failure(id, NOT_INITIALIZED, "Server not initialized"));
        };

        let body = match request.method.as_str() {
            "tools/list" => JsonRpcResponse::success(id, json!({ "tools": tools::definitions() })),
            "tools/call" => self.call_tool(id, &session_id, &caller, &params).await,
            "resources/list" => JsonRpcResponse::success(id, json!({ "resources": gateway::resources() })),
            "resources/read" => self.read_resource(id, &params).await,
            other => JsonRpcResponse::failure(id, METHOD_NOT_FOUND, format!("Method not found: {other}")),
        };
        Reply::body(body)
    }

    fn initialize(&self, id: Value, params: &Value) -> Reply {
        let version = params.get("protocolVersion").and_then(Value::as_str);
        if version != Some(PROTOCOL_VERSION) {
            return Reply::body(JsonRpcResponse::failure(
                id,
                INVALID_PARAMS,
                format!("Unsupported protocol version: {}", version.unwrap_or("none")),
            ));
        }

        let client = params.get("clientInfo");
        let field = |name: &str| {
            client
                .and_then(|c| c.get(name))
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string()
        };
        let session = Session {
            id: Uuid::new_v4().to_string(),
            client_name: field("name"),
            client_version: field("version"),
            created_at: Utc::now(),
        };
        info!(session_id = %session.id, client = %session.client_name, version = %session.client_version, "session initialized");

        let session_id = session.id.clone();
        self.sessions.insert(session_id.clone(), session);

        Reply::Response {
            session: Some(session_id.clone()),
            body: JsonRpcResponse::success(
                id,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {
                        "tools": {"listChanged": true},
                        "resources": {"listChanged": true}
                    },
                    "serverInfo": {
                        "name": SERVER_NAME,
                        "version": env!("CARGO_PKG_VERSION")
                    },
                    "sessionId": session_id,
                }),
            ),
        }
    }

    fn notification(&self, caller: &CallerContext, request: &JsonRpcRequest) {
        match request.method.as_str() {
            "notifications/initialized" => {
                debug!(session_id = ?caller.session_id, "client finished initialization");
            }
            "notifications/cancelled" => {
                let (Some(session_id), Some(request_id)) = (
                    caller.session_id.as_ref(),
                    request.params.as_ref().and_then(|p| p.get("requestId")),
                ) else {
                    return;
                };
                let key = (session_id.clone(), id_key(request_id));
                if let Some((_, abort)) = self.pending.remove(&key) {
                    info!(session_id = %key.0, request_id = %key.1, "cancelling tool call");
                    abort.abort();
                }
            }
            other => debug!(method = other, "ignoring notification"),
        }
    }

    async fn call_tool(&self, id: Value, session_id: &str, caller: &CallerContext, params: &Value) -> JsonRpcResponse {
        let Some(name) = params.get("name").and_then(Value::as_str) else {
            return JsonRpcResponse::failure(id, INVALID_PARAMS, "Missing required parameter: name");
        };
        let arguments = match params.get("arguments") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(_) => return JsonRpcResponse::failure(id, INVALID_PARAMS, "arguments must be an object"),
        };
        let deadline = params
            .pointer("/_meta/deadlineMs")
            .and_then(Value::as_u64)
            .map(Duration::from_millis);

        let request_id = id_key(&id);
        let raw = RawRequest {
            id: request_id.clone(),
            session_id: session_id.to_string(),
            tool: name.to_string(),
            arguments,
            token: caller.token.clone(),
            origin: caller.origin.clone(),
            deadline,
        };

        let key = (session_id.to_string(), request_id);
        let (pending, _in_flight) = match self.pending.entry(key.clone()) {
            Entry::Occupied(_) => {
                warn!(session_id, request_id = %key.1, "request id reused while still in flight");
                return JsonRpcResponse::failure(id, INVALID_REQUEST, format!("Request id {} is already in flight", key.1));
            }
            Entry::Vacant(slot) => {
                let pending = self.gateway.submit(raw);
                let abort = pending.abort_handle();
                let task = abort.id();
                slot.insert(abort.clone());
                let guard = InFlight {
                    pending: &self.pending,
                    key,
                    task,
                    abort,
                };
                (pending, guard)
            }
        };
        let outcome = pending.wait().await;

        match outcome {
            Ok(output) => JsonRpcResponse::success(
                id,
                json!({
                    "content": [{
                        "type": "text",
                        "text": output.text,
                        "metadata": output.metadata,
                    }],
                    "isError": false,
                }),
            ),
            Err(err) => tool_error(id, name, err),
        }
    }

    async fn read_resource(&self, id: Value, params: &Value) -> JsonRpcResponse {
        let Some(uri) = params.get("uri").and_then(Value::as_str) else {
            return JsonRpcResponse::failure(id, INVALID_PARAMS, "Missing required parameter: uri");
        };
        match self.gateway.read_resource(uri).await {
            None => JsonRpcResponse::failure(id, METHOD_NOT_FOUND, format!("Resource not found: {uri}")),
            Some(Err(err)) => {
                warn!(uri, error = %err, "resource read failed");
                JsonRpcResponse::failure(id, INTERNAL_ERROR, format!("Resource read failed: {err}"))
            }
            Some(Ok(body)) => {
                let text = serde_json::to_string_pretty(&body).unwrap_or_else(|_| body.to_string());
                JsonRpcResponse::success(
                    id,
                    json!({
                        "contents": [{
                            "uri": uri,
                            "mimeType": "application/json",
                            "text": text,
                        }]
                    }),
                )
            }
        }
    }

    /// Ends a session and cancels its outstanding calls.
    pub fn close_session(&self, session_id: &str) -> bool {
        let removed = self.sessions.remove(session_id).is_some();
        self.pending.retain(|(session, _), abort| {
            if session == session_id {
                abort.abort();
                false
            } else {
                true
            }
        });
        if removed {
            info!(session_id, "session closed");
        }
        removed
    }
}

fn tool_error(id: Value, tool: &str, err: GatewayError) -> JsonRpcResponse {
    if err.is_rejection() || err == GatewayError::Cancelled {
        let known = tools::definitions().iter().any(|d| d.name == tool);
        let code = match &err {
            GatewayError::InvalidRequest { .. } if !known => METHOD_NOT_FOUND,
            _ => err.jsonrpc_code(),
        };
        return JsonRpcResponse::failure(id, code, err.to_string()).with_data(json!({ "kind": err.kind() }));
    }

    JsonRpcResponse::success(
        id,
        json!({
            "content": [{"type": "text", "text": format!("Tool execution failed: {err}")}],
            "isError": true,
            "metadata": {"kind": err.kind()},
        }),
    )
}

// Held while a tools/call waits. When the caller goes away mid-call the
// task is aborted, and either way its entry leaves the pending map
struct InFlight<'a> {
    pending: &'a DashMap<(String, String), AbortHandle>,
    key: (String, String),
    task: tokio::task::Id,
    abort: AbortHandle,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.abort.abort();
        self.pending.remove_if(&self.key, |_, abort| abort.id() == self.task);
    }
}

// JSON-RPC ids may be numbers or strings; both key the same way
fn id_key(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::backend::{Backend, BackendClient, Completion};
    use crate::clock::SystemClock;
    use crate::config::Settings;
    use crate::models::{BackendCall, Endpoint, Generation};
    use async_trait::async_trait;
    use axum::http::HeaderValue;

    struct SlowEcho;

    #[async_trait]
    impl Backend for SlowEcho {
        async fn call(&self, call: &BackendCall, _timeout: Duration) -> Result<Completion, GatewayError> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let text = match call {
                BackendCall::Generate(p) => p.prompt.clone(),
                BackendCall::Chat(p) => p.messages[0].content.clone(),
            };
            if text == "fail" {
                return Err(GatewayError::BackendUnavailable {
                    attempts: 4,
                    last_error: "HTTP 503".into(),
                });
            }
            Ok(Completion {
                generation: Generation {
                    text,
                    tokens_generated: 1,
                    finish_reason: "stop".into(),
                    endpoint: Endpoint::Native,
                },
                retries: 0,
            })
        }
    }

    fn handler(settings: Settings) -> Arc<McpHandler> {
        let client = Arc::new(BackendClient::new(settings.koboldcpp.clone(), Arc::new(SystemClock)));
        let gateway = Gateway::with_backend(
            &settings,
            Arc::new(SlowEcho),
            client,
            Arc::new(MemoryAuditSink::new()),
            Arc::new(SystemClock),
        );
        Arc::new(McpHandler::new(Arc::new(gateway)))
    }

    fn request(id: Option<Value>, method: &str, params: Value) -> JsonRpcRequest {
        JsonRpcRequest {
            jsonrpc: "2.0".into(),
            id,
            method: method.into(),
            params: Some(params),
        }
    }

    async fn open_session(mcp: &McpHandler) -> CallerContext {
        let reply = mcp
            .handle(
                CallerContext::default(),
                request(Some(json!(0)), "initialize", json!({"protocolVersion": PROTOCOL_VERSION, "clientInfo": {"name": "test", "version": "1"}})),
            )
            .await;
        match reply {
            Reply::Response { session: Some(session), body } => {
                assert_eq!(body.result.unwrap()["sessionId"], session.as_str());
                CallerContext {
                    session_id: Some(session),
                    ..CallerContext::default()
                }
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    fn body(reply: Reply) -> JsonRpcResponse {
        match reply {
            Reply::Response { body, .. } => body,
            Reply::Accepted => panic!("expected a response"),
        }
    }

    #[test]
    fn parse_distinguishes_garbage_from_bad_shape() {
        let err = McpHandler::parse(b"{not json").unwrap_err();
        assert_eq!(err.error.unwrap().code, PARSE_ERROR);

        let err = McpHandler::parse(br#"{"jsonrpc": "2.0", "id": 4}"#).unwrap_err();
        assert_eq!(err.id, json!(4));
        assert_eq!(err.error.unwrap().code, INVALID_REQUEST);

        let ok = McpHandler::parse(br#"{"jsonrpc": "2.0", "id": "a", "method": "ping"}"#).unwrap();
        assert_eq!(ok.method, "ping");
    }

    #[test]
    fn caller_context_reads_bearer_token_and_origin() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer s3cret"));
        headers.insert(header::ORIGIN, HeaderValue::from_static("http://localhost"));
        headers.insert(SESSION_HEADER, HeaderValue::from_static("abc"));

        let ctx = CallerContext::from_headers(&headers);
        assert_eq!(ctx.token.as_deref(), Some("s3cret"));
        assert_eq!(ctx.origin.as_deref(), Some("http://localhost"));
        assert_eq!(ctx.session_id.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn methods_need_a_session_except_ping() {
        let mcp = handler(Settings::default());

        let reply = body(mcp.handle(CallerContext::default(), request(Some(json!(1)), "tools/list", json!({}))).await);
        assert_eq!(reply.error.unwrap().code, NOT_INITIALIZED);

        let reply = body(mcp.handle(CallerContext::default(), request(Some(json!(2)), "ping", json!({}))).await);
        assert_eq!(reply.result, Some(json!({})));
    }

    #[tokio::test]
    async fn initialize_rejects_other_protocol_versions() {
        let mcp = handler(Settings::default());
        let reply = body(
            mcp.handle(CallerContext::default(), request(Some(json!(1)), "initialize", json!({"protocolVersion": "1999-01-01"})))
                .await,
        );
        assert_eq!(reply.error.unwrap().code, INVALID_PARAMS);
        assert_eq!(mcp.session_count(), 0);
    }

    #[tokio::test]
    async fn lists_tools_and_resources() {
        let mcp = handler(Settings::default());
        let caller = open_session(&mcp).await;

        let tools = body(mcp.handle(caller.clone(), request(Some(json!(1)), "tools/list", json!({}))).await);
        assert_eq!(tools.result.unwrap()["tools"].as_array().unwrap().len(), 4);

        let resources = body(mcp.handle(caller.clone(), request(Some(json!(2)), "resources/list", json!({}))).await);
        assert_eq!(resources.result.unwrap()["resources"][0]["uri"], gateway::MODEL_INFO_URI);

        let unknown = body(mcp.handle(caller, request(Some(json!(3)), "prompts/list", json!({}))).await);
        assert_eq!(unknown.error.unwrap().code, METHOD_NOT_FOUND);
    }

    #[tokio::test(start_paused = true)]
    async fn tool_call_maps_outcomes() {
        let mcp = handler(Settings::default());
        let caller = open_session(&mcp).await;

        let ok = body(
            mcp.handle(caller.clone(), request(Some(json!(1)), "tools/call", json!({"name": "generate_text", "arguments": {"prompt": "hi"}})))
                .await,
        );
        let result = ok.result.unwrap();
        assert_eq!(result["isError"], false);
        assert_eq!(result["content"][0]["text"], "hi");

        let failed = body(
            mcp.handle(caller.clone(), request(Some(json!(2)), "tools/call", json!({"name": "generate_text", "arguments": {"prompt": "fail"}})))
                .await,
        );
        assert_eq!(failed.result.unwrap()["isError"], true);

        let rejected = body(
            mcp.handle(caller.clone(), request(Some(json!(3)), "tools/call", json!({"name": "generate_text", "arguments": {"prompt": "a\u{0}b"}})))
                .await,
        );
        let error = rejected.error.unwrap();
        assert_eq!(error.code, -32004);
        assert_eq!(error.data, Some(json!({"kind": "sanitization_failed"})));

        let unknown = body(
            mcp.handle(caller, request(Some(json!(4)), "tools/call", json!({"name": "summon", "arguments": {}})))
                .await,
        );
        assert_eq!(unknown.error.unwrap().code, METHOD_NOT_FOUND);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_notification_aborts_pending_call() {
        let mcp = handler(Settings::default());
        let caller = open_session(&mcp).await;

        let task = {
            let mcp = mcp.clone();
            let caller = caller.clone();
            tokio::spawn(async move {
                mcp.handle(caller, request(Some(json!("call-1")), "tools/call", json!({"name": "generate_text", "arguments": {"prompt": "slow"}})))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(mcp.pending_count(), 1);

        let reply = mcp
            .handle(caller, request(None, "notifications/cancelled", json!({"requestId": "call-1"})))
            .await;
        assert_eq!(reply, Reply::Accepted);

        let error = body(task.await.unwrap()).error.unwrap();
        assert_eq!(error.code, GatewayError::Cancelled.jsonrpc_code());
        assert_eq!(mcp.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_call_leaves_nothing_pending() {
        let mcp = handler(Settings::default());
        let caller = open_session(&mcp).await;

        let call = mcp.handle(
            caller.clone(),
            request(Some(json!("gone")), "tools/call", json!({"name": "generate_text", "arguments": {"prompt": "slow"}})),
        );
        assert!(tokio::time::timeout(Duration::from_millis(10), call).await.is_err());
        assert_eq!(mcp.pending_count(), 0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(mcp.pending_count(), 0);

        // the id is free again once its caller has gone
        let reply = body(
            mcp.handle(caller, request(Some(json!("gone")), "tools/call", json!({"name": "generate_text", "arguments": {"prompt": "again"}})))
                .await,
        );
        assert_eq!(reply.result.unwrap()["content"][0]["text"], "again");
    }

    #[tokio::test(start_paused = true)]
    async fn reused_in_flight_id_is_rejected() {
        let mcp = handler(Settings::default());
        let caller = open_session(&mcp).await;

        let first = {
            let mcp = mcp.clone();
            let caller = caller.clone();
            tokio::spawn(async move {
                mcp.handle(caller, request(Some(json!(7)), "tools/call", json!({"name": "generate_text", "arguments": {"prompt": "slow"}})))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let second = body(
            mcp.handle(caller.clone(), request(Some(json!(7)), "tools/call", json!({"name": "generate_text", "arguments": {"prompt": "other"}})))
                .await,
        );
        assert_eq!(second.id, json!(7));
        assert_eq!(second.error.unwrap().code, INVALID_REQUEST);
        assert_eq!(mcp.pending_count(), 1);

        // the original call is untouched
        let first = body(first.await.unwrap());
        assert_eq!(first.result.unwrap()["content"][0]["text"], "slow");
        assert_eq!(mcp.pending_count(), 0);
    }

    #[tokio::test]
    async fn closing_a_session_forgets_it() {
        let mcp = handler(Settings::default());
        let caller = open_session(&mcp).await;
        let session = caller.session_id.clone().unwrap();

        assert!(mcp.close_session(&session));
        assert!(!mcp.close_session(&session));
        let reply = body(mcp.handle(caller, request(Some(json!(1)), "tools/list", json!({}))).await);
        assert_eq!(reply.error.unwrap().code, NOT_INITIALIZED);
    }
}
