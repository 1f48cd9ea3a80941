use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use crate::error::GatewayError;
use crate::models::{ChatParams, GenerateParams};

pub const MAX_BATCH_PROMPTS: usize = 50;
pub const MAX_PROMPT_VARIATIONS: usize = 25;

// test_prompt arguments
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TestPromptParams {
    pub prompt: String,
    #[serde(default = "default_temperature_range")]
    pub temperature_range: Vec<f64>,
    #[serde(default = "default_top_p_range")]
    pub top_p_range: Vec<f64>,
    #[serde(default = "default_test_max_tokens")]
    pub max_tokens: u32,
}

// batch_generate arguments
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BatchParams {
    pub prompts: Vec<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

/// A decoded `tools/call`.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolCall {
    GenerateText(GenerateParams),
    ChatCompletion(ChatParams),
    TestPrompt(TestPromptParams),
    BatchGenerate(BatchParams),
}

impl ToolCall {
    pub fn decode(name: &str, arguments: &Map<String, Value>) -> Result<Self, GatewayError> {
        let args = Value::Object(arguments.clone());
        let call = match name {
            "generate_text" => ToolCall::GenerateText(parse(name, args)?),
            "chat_completion" => ToolCall::ChatCompletion(parse(name, args)?),
            "test_prompt" => ToolCall::TestPrompt(parse(name, args)?),
            "batch_generate" => ToolCall::BatchGenerate(parse(name, args)?),
            other => {
                return Err(GatewayError::InvalidRequest {
                    details: format!("unknown tool: {other}"),
                });
            }
        };
        call.check_shape()?;
        Ok(call)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ToolCall::GenerateText(_) => "generate_text",
            ToolCall::ChatCompletion(_) => "chat_completion",
            ToolCall::TestPrompt(_) => "test_prompt",
            ToolCall::BatchGenerate(_) => "batch_generate",
        }
    }

    fn check_shape(&self) -> Result<(), GatewayError> {
        let invalid = |details: String| Err(GatewayError::InvalidRequest { details });
        match self {
            ToolCall::ChatCompletion(p) if p.messages.is_empty() => {
                invalid("messages must not be empty".into())
            }
            ToolCall::BatchGenerate(p) if p.prompts.is_empty() => {
                invalid("prompts must not be empty".into())
            }
            ToolCall::BatchGenerate(p) if p.prompts.len() > MAX_BATCH_PROMPTS => invalid(format!(
                "too many prompts in batch ({}, maximum {MAX_BATCH_PROMPTS})",
                p.prompts.len()
            )),
            ToolCall::TestPrompt(p) => {
                let variations = p.temperature_range.len() * p.top_p_range.len();
                if variations == 0 || variations > MAX_PROMPT_VARIATIONS {
                    invalid(format!(
                        "test_prompt needs between 1 and {MAX_PROMPT_VARIATIONS} variations, got {variations}"
                    ))
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        }
    }

    /// Every free-text field, labelled for error messages.
    pub fn texts(&self) -> Vec<(String, &str)> {
        match self {
            ToolCall::GenerateText(p) => vec![("prompt".to_string(), p.prompt.as_str())],
            ToolCall::TestPrompt(p) => vec![("prompt".to_string(), p.prompt.as_str())],
            ToolCall::ChatCompletion(p) => p
                .messages
                .iter()
                .enumerate()
                .map(|(i, m)| (format!("messages[{i}].content"), m.content.as_str()))
                .collect(),
            ToolCall::BatchGenerate(p) => p
                .prompts
                .iter()
                .enumerate()
                .map(|(i, prompt)| (format!("prompts[{i}]"), prompt.as_str()))
                .collect(),
        }
    }

    pub fn texts_mut(&mut self) -> Vec<(String, &mut String)> {
        match self {
            ToolCall::GenerateText(p) => vec![("prompt".to_string(), &mut p.prompt)],
            ToolCall::TestPrompt(p) => vec![("prompt".to_string(), &mut p.prompt)],
            ToolCall::ChatCompletion(p) => p
                .messages
                .iter_mut()
                .enumerate()
                .map(|(i, m)| (format!("messages[{i}].content"), &mut m.content))
                .collect(),
            ToolCall::BatchGenerate(p) => p
                .prompts
                .iter_mut()
                .enumerate()
                .map(|(i, prompt)| (format!("prompts[{i}]"), prompt))
                .collect(),
        }
    }

    // Returns true if max_tokens had to be lowered
    pub fn clamp_max_tokens(&mut self, ceiling: u32) -> bool {
        let max_tokens = match self {
            ToolCall::GenerateText(p) => &mut p.max_tokens,
            ToolCall::ChatCompletion(p) => &mut p.max_tokens,
            ToolCall::TestPrompt(p) => &mut p.max_tokens,
            ToolCall::BatchGenerate(p) => &mut p.max_tokens,
        };
        if *max_tokens > ceiling {
            *max_tokens = ceiling;
            true
        } else {
            false
        }
    }
}

fn parse<T: serde::de::DeserializeOwned>(tool: &str, args: Value) -> Result<T, GatewayError> {
    serde_json::from_value(args).map_err(|e| GatewayError::InvalidRequest {
        details: format!("invalid arguments for {tool}: {e}"),
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: Value,
}

pub fn definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "generate_text",
            description: "Generate text with the local KoboldCpp model using configurable sampling parameters and stop sequences.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "prompt": {"type": "string", "description": "The text prompt to generate from"},
                    "max_tokens": {"type": "integer", "default": 100, "minimum": 1, "maximum": 4096},
                    "temperature": {"type": "number", "default": 0.7, "minimum": 0.0, "maximum": 2.0},
                    "top_p": {"type": "number", "default": 0.9, "minimum": 0.0, "maximum": 1.0},
                    "top_k": {"type": "integer", "default": 40, "minimum": 1, "maximum": 100},
                    "typical_p": {"type": "number", "default": 1.0, "minimum": 0.0, "maximum": 1.0},
                    "rep_pen": {"type": "number", "default": 1.1, "minimum": 1.0, "maximum": 2.0},
                    "rep_pen_range": {"type": "integer", "default": 320, "minimum": 0, "maximum": 2048},
                    "stop_sequence": {"type": "array", "items": {"type": "string"}, "default": []}
                },
                "required": ["prompt"]
            }),
        },
        ToolDefinition {
            name: "chat_completion",
            description: "Generate a chat completion from a list of system, user and assistant messages.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "messages": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "role": {"type": "string", "enum": ["system", "user", "assistant"]},
                                "content": {"type": "string"}
                            },
                            "required": ["role", "content"]
                        }
                    },
                    "max_tokens": {"type": "integer", "default": 100, "minimum": 1, "maximum": 4096},
                    "temperature": {"type": "number", "default": 0.7, "minimum": 0.0, "maximum": 2.0},
                    "top_p": {"type": "number", "default": 0.9, "minimum": 0.0, "maximum": 1.0}
                },
                "required": ["messages"]
            }),
        },
        ToolDefinition {
            name: "test_prompt",
            description: "Run one prompt across a grid of temperature and top_p values and report the fastest configuration.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "prompt": {"type": "string"},
                    "temperature_range": {"type": "array", "items": {"type": "number"}, "default": [0.3, 0.7, 1.0]},
                    "top_p_range": {"type": "array", "items": {"type": "number"}, "default": [0.8, 0.9, 0.95]},
                    "max_tokens": {"type": "integer", "default": 50, "minimum": 1, "maximum": 1024}
                },
                "required": ["prompt"]
            }),
        },
        ToolDefinition {
            name: "batch_generate",
            description: "Generate text for several prompts with bounded concurrency. Failed prompts are reported in place.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "prompts": {"type": "array", "items": {"type": "string"}, "maxItems": MAX_BATCH_PROMPTS},
                    "max_tokens": {"type": "integer", "default": 100, "minimum": 1, "maximum": 2048},
                    "temperature": {"type": "number", "default": 0.7, "minimum": 0.0, "maximum": 2.0},
                    "max_concurrent": {"type": "integer", "default": 3, "minimum": 1, "maximum": 10}
                },
                "required": ["prompts"]
            }),
        },
    ]
}

fn default_temperature_range() -> Vec<f64> {
    vec![0.3, 0.7, 1.0]
}

fn default_top_p_range() -> Vec<f64> {
    vec![0.8, 0.9, 0.95]
}

fn default_test_max_tokens() -> u32 {
    50
}

fn default_max_tokens() -> u32 {
    100
}

fn default_temperature() -> f64 {
    0.7
}

fn default_max_concurrent() -> usize {
    3
}
