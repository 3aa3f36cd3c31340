//! Environment-driven configuration for the AgentIM server and gateway client.
//!
//! Every tunable named in the specification's external-interfaces and
//! component sections is loaded here from an environment variable with a
//! documented default, following a 12-factor style rather than a config-file
//! discovery scheme: this is a server/gateway process pair meant to be
//! deployed under container orchestration, where env vars are the natural
//! fit.

use std::env;
use std::time::Duration;

use thiserror::Error;

agentim_common::impl_context!();

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Message(String),
    #[error("invalid value for {var}: {value:?}")]
    InvalidValue { var: &'static str, value: String },
}

impl agentim_common::FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message(message)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

fn env_parse<T: std::str::FromStr>(var: &'static str, default: T) -> Result<T> {
    match env::var(var) {
        Ok(val) => val.parse::<T>().map_err(|_| Error::InvalidValue { var, value: val }),
        Err(_) => Ok(default),
    }
}

fn env_string(var: &'static str, default: &str) -> String {
    env::var(var).unwrap_or_else(|_| default.to_string())
}

/// Loads `.env` if present, matching the dev-loop convention of picking up
/// local overrides without requiring them in the process environment.
pub fn load_dotenv() {
    let _ = dotenvy::dotenv();
}

/// Tunables shared by both endpoint classes (§4.1, §4.5, §4.6 of the spec).
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Window, in seconds, for the client-message rate limiter.
    pub client_message_window_secs: u64,
    /// Max client messages per window before `RATE_LIMITED`.
    pub client_message_max: u32,
    /// Window, in seconds, for the agent-message rate limiter (fail-open).
    pub agent_message_window_secs: u64,
    pub agent_message_max: u32,
    /// Typing-debounce window in seconds (fail-open, set-if-absent-with-TTL).
    pub typing_debounce_window_secs: u64,
    /// Upper bound on the in-memory fallback map's entry count.
    pub in_memory_max_entries: usize,
    /// Sweep interval for the in-memory fallback's background sweeper.
    pub sweep_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            client_message_window_secs: 60,
            client_message_max: 30,
            agent_message_window_secs: 60,
            agent_message_max: 120,
            typing_debounce_window_secs: 1,
            in_memory_max_entries: 10_000,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl RateLimitConfig {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.client_message_window_secs =
            env_parse("RATE_LIMIT_CLIENT_WINDOW_SECS", config.client_message_window_secs)?;
        config.client_message_max = env_parse("RATE_LIMIT_CLIENT_MAX", config.client_message_max)?;
        config.agent_message_window_secs =
            env_parse("RATE_LIMIT_AGENT_WINDOW_SECS", config.agent_message_window_secs)?;
        config.agent_message_max = env_parse("RATE_LIMIT_AGENT_MAX", config.agent_message_max)?;
        config.typing_debounce_window_secs =
            env_parse("RATE_LIMIT_TYPING_WINDOW_SECS", config.typing_debounce_window_secs)?;
        config.in_memory_max_entries =
            env_parse("RATE_LIMIT_MAX_ENTRIES", config.in_memory_max_entries)?;
        Ok(config)
    }
}

/// Server-side tunables (§4.3, §4.4, §4.6, §4.9, §5, §6).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub auth_timeout: Duration,
    pub max_message_size_bytes: usize,
    pub max_json_depth: usize,
    pub connection_limit_default: u32,
    pub max_attachments_per_message: usize,
    pub max_active_tasks: usize,
    /// Streaming byte cap applied to media downloaded off a resolved async
    /// task (`MaxServiceAgentFileSize`, spec §4.10).
    pub max_service_agent_file_size_bytes: u64,
    pub shutdown_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub pong_timeout: Duration,
    pub router_test_timeout: Duration,
    /// 32-byte AES-256-GCM key (base64 or hex) used to encrypt Router LLM
    /// API keys at rest. Must come from process configuration, never the DB.
    pub encryption_key: Option<String>,
    pub admin_username: Option<String>,
    pub admin_password: Option<String>,
    pub rate_limit: RateLimitConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            auth_timeout: Duration::from_millis(10_000),
            max_message_size_bytes: 65_536,
            max_json_depth: 10,
            connection_limit_default: 10,
            max_attachments_per_message: 20,
            max_active_tasks: 100,
            max_service_agent_file_size_bytes: 25 * 1024 * 1024,
            shutdown_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            router_test_timeout: Duration::from_secs(15),
            encryption_key: None,
            admin_username: None,
            admin_password: None,
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.bind_addr = env_string("AGENTIM_BIND_ADDR", &config.bind_addr);
        config.auth_timeout =
            Duration::from_millis(env_parse("WS_AUTH_TIMEOUT_MS", config.auth_timeout.as_millis() as u64)?);
        config.max_message_size_bytes =
            env_parse("AGENTIM_MAX_MESSAGE_SIZE", config.max_message_size_bytes)?;
        config.max_json_depth = env_parse("AGENTIM_MAX_JSON_DEPTH", config.max_json_depth)?;
        config.connection_limit_default =
            env_parse("AGENTIM_CONNECTION_LIMIT", config.connection_limit_default)?;
        config.max_attachments_per_message =
            env_parse("AGENTIM_MAX_ATTACHMENTS", config.max_attachments_per_message)?;
        config.max_active_tasks = env_parse("AGENTIM_MAX_ACTIVE_TASKS", config.max_active_tasks)?;
        config.max_service_agent_file_size_bytes = env_parse(
            "AGENTIM_MAX_SERVICE_AGENT_FILE_SIZE",
            config.max_service_agent_file_size_bytes,
        )?;
        config.shutdown_timeout = Duration::from_secs(env_parse(
            "AGENTIM_SHUTDOWN_TIMEOUT_SECS",
            config.shutdown_timeout.as_secs(),
        )?);
        config.router_test_timeout = Duration::from_secs(env_parse(
            "AGENTIM_ROUTER_TEST_TIMEOUT_SECS",
            config.router_test_timeout.as_secs(),
        )?);
        config.encryption_key = env::var("ENCRYPTION_KEY").ok();
        config.admin_username = env::var("ADMIN_USERNAME").ok();
        config.admin_password = env::var("ADMIN_PASSWORD").ok();
        config.rate_limit = RateLimitConfig::from_env()?;
        Ok(config)
    }
}

/// Gateway-client tunables (§4.1, §4.2 of the spec).
#[derive(Debug, Clone)]
pub struct GatewayClientConfig {
    pub server_url: String,
    pub max_queue_size: usize,
    pub max_reconnect_attempts: u32,
    pub probe_interval: Duration,
    pub normal_backoff_initial: Duration,
    pub normal_backoff_cap: Duration,
    pub fast_path_backoff_cap: Duration,
    pub heartbeat_interval: Duration,
    pub pong_timeout: Duration,
}

impl Default for GatewayClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8080/ws/gateway".to_string(),
            max_queue_size: 1000,
            max_reconnect_attempts: 50,
            probe_interval: Duration::from_millis(300_000),
            normal_backoff_initial: Duration::from_secs(3),
            normal_backoff_cap: Duration::from_secs(30),
            fast_path_backoff_cap: Duration::from_millis(1_500),
            heartbeat_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
        }
    }
}

impl GatewayClientConfig {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.server_url = env_string("AGENTIM_SERVER_URL", &config.server_url);
        config.max_queue_size = env_parse("AGENTIM_MAX_QUEUE_SIZE", config.max_queue_size)?;
        config.max_reconnect_attempts =
            env_parse("AGENTIM_MAX_RECONNECT", config.max_reconnect_attempts)?;
        config.probe_interval = Duration::from_millis(env_parse(
            "AGENTIM_PROBE_INTERVAL",
            config.probe_interval.as_millis() as u64,
        )?);
        Ok(config)
    }
}
