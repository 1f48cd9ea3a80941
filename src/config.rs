use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "config/kobold_gateway.json";

// CLI argument structure
#[derive(Parser, Debug, Clone)]
#[command(name = "kobold-gateway")]
#[command(about = "Caching MCP gateway for a local KoboldCpp server")]
#[command(version)]
pub struct Args {
    // JSON config file, defaults to config/kobold_gateway.json when present
    #[arg(long, global = true, env = "MCP_CONFIG_FILE")]
    pub config: Option<PathBuf>,

    // Debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    // Errors only
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(flatten)]
    pub overrides: Overrides,

    #[command(subcommand)]
    pub command: Option<Command>,
}

// Settings that can be overridden from the command line or the environment
#[derive(clap::Args, Debug, Clone, Default)]
pub struct Overrides {
    // KoboldCpp server url
    #[arg(long, global = true, env = "KOBOLD_URL")]
    pub kobold_url: Option<String>,

    // Per-attempt backend timeout in seconds
    #[arg(long, global = true, env = "KOBOLD_TIMEOUT")]
    pub timeout: Option<u64>,

    #[arg(long, global = true, env = "KOBOLD_MAX_RETRIES")]
    pub max_retries: Option<u32>,

    #[arg(long, global = true, env = "MCP_HOST")]
    pub host: Option<String>,

    #[arg(short, long, global = true, env = "MCP_PORT")]
    pub port: Option<u16>,

    #[arg(long, global = true, env = "LOG_LEVEL")]
    pub log_level: Option<String>,

    #[arg(long, global = true, env = "AUDIT_LOG")]
    pub audit_log: Option<bool>,

    #[arg(long, global = true, env = "ENABLE_AUTH")]
    pub enable_auth: Option<bool>,

    #[arg(long, global = true, env = "AUTH_TOKEN", hide_env_values = true)]
    pub auth_token: Option<String>,

    #[arg(long, global = true, env = "MAX_PROMPT_LENGTH")]
    pub max_prompt_length: Option<usize>,

    #[arg(long, global = true, env = "MAX_CONCURRENT_REQUESTS")]
    pub max_concurrent_requests: Option<usize>,

    #[arg(long, global = true, env = "MEMORY_LIMIT_MB")]
    pub memory_limit_mb: Option<usize>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the gateway (default)
    Serve,
    /// Check that the KoboldCpp backend is reachable
    Check {
        #[arg(long)]
        url: Option<String>,
    },
    /// Inspect or create configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigAction {
    Show,
    Validate,
    /// Write the default configuration to a file
    Init {
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        path: PathBuf,
        #[arg(long)]
        overwrite: bool,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    pub url: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub generate_endpoint: String,
    pub chat_endpoint: String,
    pub model_endpoint: String,
    pub status_endpoint: String,
    pub health_interval_secs: u64,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            url: "http://localhost:5001".to_string(),
            timeout_secs: 30,
            max_retries: 3,
            retry_delay_ms: 1000,
            generate_endpoint: "/api/v1/generate".to_string(),
            chat_endpoint: "/v1/chat/completions".to_string(),
            model_endpoint: "/api/v1/model".to_string(),
            status_endpoint: "/api/extra/generate/check".to_string(),
            health_interval_secs: 30,
        }
    }
}

impl BackendSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8765,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub audit_log: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            audit_log: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecuritySettings {
    pub enable_auth: bool,
    pub auth_token: Option<String>,
    pub allowed_origins: Vec<String>,
    pub data_sanitization: bool,
    pub max_prompt_length: usize,
    pub max_response_length: u32,
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            enable_auth: false,
            auth_token: None,
            allowed_origins: vec!["*".to_string()],
            data_sanitization: true,
            max_prompt_length: 8192,
            max_response_length: 4096,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceSettings {
    pub max_concurrent_requests: usize,
    pub request_queue_size: usize,
    // default queue deadline when the caller does not send one
    pub queue_deadline_ms: Option<u64>,
    pub memory_limit_mb: usize,
    pub enable_caching: bool,
    pub cache_ttl_secs: u64,
}

impl Default for PerformanceSettings {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 5,
            request_queue_size: 100,
            queue_deadline_ms: None,
            memory_limit_mb: 500,
            enable_caching: true,
            cache_ttl_secs: 300,
        }
    }
}

impl PerformanceSettings {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn memory_budget(&self) -> usize {
        self.memory_limit_mb.saturating_mul(1024 * 1024)
    }

    pub fn queue_deadline(&self) -> Option<Duration> {
        self.queue_deadline_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub koboldcpp: BackendSettings,
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub security: SecuritySettings,
    pub performance: PerformanceSettings,
}

impl Settings {
    // defaults < config file < env / cli
    pub fn load(args: &Args) -> Result<Self, ConfigError> {
        let mut settings = match &args.config {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_PATH))?
            }
            None => Self::default(),
        };
        settings.apply(&args.overrides);
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn apply(&mut self, overrides: &Overrides) {
        if let Some(url) = &overrides.kobold_url {
            self.koboldcpp.url = url.clone();
        }
        if let Some(timeout) = overrides.timeout {
            self.koboldcpp.timeout_secs = timeout;
        }
        if let Some(retries) = overrides.max_retries {
            self.koboldcpp.max_retries = retries;
        }
        if let Some(host) = &overrides.host {
            self.server.host = host.clone();
        }
        if let Some(port) = overrides.port {
            self.server.port = port;
        }
        if let Some(level) = &overrides.log_level {
            self.logging.level = level.clone();
        }
        if let Some(audit) = overrides.audit_log {
            self.logging.audit_log = audit;
        }
        if let Some(enable) = overrides.enable_auth {
            self.security.enable_auth = enable;
        }
        if let Some(token) = &overrides.auth_token {
            self.security.auth_token = Some(token.clone());
        }
        if let Some(limit) = overrides.max_prompt_length {
            self.security.max_prompt_length = limit;
        }
        if let Some(limit) = overrides.max_concurrent_requests {
            self.performance.max_concurrent_requests = limit;
        }
        if let Some(limit) = overrides.memory_limit_mb {
            self.performance.memory_limit_mb = limit;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = &self.koboldcpp.url;
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::Invalid(format!(
                "koboldcpp.url must start with http:// or https://, got {url}"
            )));
        }
        if self.koboldcpp.timeout_secs == 0 {
            return Err(ConfigError::Invalid("koboldcpp.timeout_secs must be positive".into()));
        }
        if self.performance.max_concurrent_requests == 0 {
            return Err(ConfigError::Invalid(
                "performance.max_concurrent_requests must be at least 1".into(),
            ));
        }
        if self.security.max_prompt_length == 0 {
            return Err(ConfigError::Invalid("security.max_prompt_length must be positive".into()));
        }
        if self.security.enable_auth
            && self.security.auth_token.as_deref().is_none_or(str::is_empty)
        {
            return Err(ConfigError::Invalid(
                "security.enable_auth requires security.auth_token".into(),
            ));
        }
        Ok(())
    }
}
