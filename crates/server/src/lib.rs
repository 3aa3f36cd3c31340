//! AgentIM server: connection tables, the auth and validation pipeline, the
//! mention/broadcast routing engine, and the async task poller, wired
//! together behind two WebSocket endpoints (`/ws/client`, `/ws/gateway`).

pub mod auth;
pub mod broadcast;
pub mod credentials;
pub mod error;
pub mod send;
pub mod state;
pub mod store;
pub mod tasks;
pub mod validator;
pub mod ws;

use std::sync::Arc;
use std::time::Duration;

use agentim_auth::crypto::EncryptionKey;
use agentim_auth::{RevocationStore, TokenStore};
use agentim_config::ServerConfig;
use agentim_ratelimit::{KvBackend, RateLimiter, Result as RateLimitResult};
use async_trait::async_trait;

use crate::credentials::InMemoryTokenStore;
use crate::state::ConnectionTables;
use crate::store::InMemoryStore;
use crate::tasks::TaskPoller;

/// Stand-in KV backend for when no external KV is configured: every call
/// fails, which routes the rate limiter straight to its in-memory fallback
/// under the configured [`agentim_ratelimit::FailurePolicy`].
pub(crate) struct NoKvConfigured;

#[async_trait]
impl KvBackend for NoKvConfigured {
    async fn incr_with_expire(&self, _key: &str, _window: Duration) -> RateLimitResult<u64> {
        Err(agentim_ratelimit::Error::KvUnavailable("no KV backend configured".into()))
    }

    async fn set_if_absent(&self, _key: &str, _ttl: Duration) -> RateLimitResult<bool> {
        Err(agentim_ratelimit::Error::KvUnavailable("no KV backend configured".into()))
    }
}

pub struct AppState {
    pub config: ServerConfig,
    pub(crate) tables: Arc<ConnectionTables>,
    pub(crate) store: InMemoryStore,
    pub(crate) tokens: Arc<dyn TokenStore>,
    pub(crate) revocations: Arc<dyn RevocationStore>,
    pub(crate) rate_limiter: RateLimiter<NoKvConfigured>,
    pub(crate) encryption_key: Option<EncryptionKey>,
    pub tasks: Arc<TaskPoller>,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let credentials = Arc::new(InMemoryTokenStore::new());
        let encryption_key = config
            .encryption_key
            .as_deref()
            .and_then(|raw| EncryptionKey::from_config_str(raw).ok());
        let rate_limiter = RateLimiter::new(None::<NoKvConfigured>, config.rate_limit.in_memory_max_entries);
        let (tasks, resolutions) =
            TaskPoller::new(config.max_active_tasks, config.max_service_agent_file_size_bytes);

        let state = Arc::new(Self {
            tables: ConnectionTables::new(),
            store: InMemoryStore::new(),
            tokens: credentials.clone(),
            revocations: credentials,
            rate_limiter,
            encryption_key,
            tasks,
            config,
        });
        tokio::spawn(tasks::drive_resolutions(state.tables.clone(), resolutions));
        state
    }

    /// Background sweep for the rate limiter's in-memory fallback map,
    /// expected to run on [`ServerConfig::rate_limit.sweep_interval`].
    pub fn sweep_rate_limits(&self) {
        self.rate_limiter.fallback().sweep(self.config.rate_limit.sweep_interval.saturating_mul(3));
    }

    /// Connected `/ws/client` socket count, for the health probe.
    pub fn client_count(&self) -> usize {
        self.tables.client_count()
    }
}
