use serde::{Deserialize, Serialize};

// KoboldCpp native generation parameters (generate_text tool arguments)
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct GenerateParams {
    pub prompt: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
    #[serde(default = "default_top_k")]
    pub top_k: u32,
    #[serde(default = "default_typical_p")]
    pub typical_p: f64,
    #[serde(default = "default_rep_pen")]
    pub rep_pen: f64,
    #[serde(default = "default_rep_pen_range")]
    pub rep_pen_range: u32,
    #[serde(default)]
    pub stop_sequence: Vec<String>,
}

impl GenerateParams {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            top_k: default_top_k(),
            typical_p: default_typical_p(),
            rep_pen: default_rep_pen(),
            rep_pen_range: default_rep_pen_range(),
            stop_sequence: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

// OpenAI-compatible chat parameters (chat_completion tool arguments)
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ChatParams {
    pub messages: Vec<ChatMessage>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
}

/// One backend invocation. This, together with the tool name, is what gets
/// fingerprinted, so it only carries fields that change the generation.
#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(tag = "endpoint", rename_all = "snake_case")]
pub enum BackendCall {
    Generate(GenerateParams),
    Chat(ChatParams),
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
    Native,
    OpenAi,
}

// Normalized generation result, same shape for both endpoint variants
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Generation {
    pub text: String,
    pub tokens_generated: u32,
    pub finish_reason: String,
    pub endpoint: Endpoint,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ModelInfo {
    pub model_name: String,
    pub context_length: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct BackendStatus {
    pub online: bool,
    pub model_loaded: bool,
    pub model_name: Option<String>,
    pub generation_active: bool,
    pub server_url: String,
}

fn default_max_tokens() -> u32 {
    100
}

fn default_temperature() -> f64 {
    0.7
}

fn default_top_p() -> f64 {
    0.9
}

fn default_top_k() -> u32 {
    40
}

fn default_typical_p() -> f64 {
    1.0
}

fn default_rep_pen() -> f64 {
    1.1
}

fn default_rep_pen_range() -> u32 {
    320
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn generate_params_fill_defaults() {
        let params: GenerateParams = serde_json::from_value(json!({"prompt": "hi"})).unwrap();
        assert_eq!(params, GenerateParams::new("hi"));
        assert_eq!(params.rep_pen_range, 320);
    }

    #[test]
    fn chat_params_reject_unknown_roles() {
        let result: Result<ChatParams, _> = serde_json::from_value(json!({
            "messages": [{"role": "narrator", "content": "x"}]
        }));
        assert!(result.is_err());
    }
}
