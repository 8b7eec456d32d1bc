//! Configuration for parcelflow.
//!
//! Settings are loaded with priority: env var > default. `dotenvy` loads
//! `./.env` and `~/.parcelflow/.env` early in startup (see `bootstrap`), so
//! deployment values live on disk while the process only ever reads env vars.
//! All knobs use the `PARCELFLOW_` prefix.

pub(crate) mod helpers;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use helpers::{env_nonzero_u64, env_u32, env_u64, normalize_variant, optional_env};

/// Main configuration for the service.
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub channel: ChannelConfig,
    pub webhook: WebhookConfig,
    pub limits: LimitsConfig,
    pub flow: FlowConfig,
    pub providers: ProvidersConfig,
}

impl Config {
    /// Resolve the full configuration from the environment.
    pub fn resolve() -> Result<Self, ConfigError> {
        Ok(Self {
            database: DatabaseConfig::resolve()?,
            channel: ChannelConfig::resolve()?,
            webhook: WebhookConfig::resolve()?,
            limits: LimitsConfig::resolve()?,
            flow: FlowConfig::resolve()?,
            providers: ProvidersConfig::resolve()?,
        })
    }
}

/// Endpoints of the external collaborators (carrier rate shop, payment
/// gateway).
#[derive(Debug, Clone)]
pub struct ProvidersConfig {
    pub rates_url: String,
    pub gateway_url: String,
}

impl ProvidersConfig {
    fn resolve() -> Result<Self, ConfigError> {
        let rates_url = optional_env("PARCELFLOW_RATES_URL")
            .unwrap_or_else(|| "http://127.0.0.1:9100/rates".to_string());
        let gateway_url = optional_env("PARCELFLOW_GATEWAY_URL")
            .unwrap_or_else(|| "http://127.0.0.1:9200/invoices".to_string());
        for (key, value) in [
            ("PARCELFLOW_RATES_URL", &rates_url),
            ("PARCELFLOW_GATEWAY_URL", &gateway_url),
        ] {
            url::Url::parse(value).map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            })?;
        }
        Ok(Self {
            rates_url,
            gateway_url,
        })
    }
}

/// Which libSQL mode to open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseBackend {
    /// Local embedded file database.
    Local,
    /// Embedded replica synced to a remote libSQL server.
    RemoteReplica,
    /// In-memory, for tests.
    Memory,
}

impl DatabaseBackend {
    fn parse(value: &str, key: &str) -> Result<Self, ConfigError> {
        match normalize_variant(value).as_str() {
            "local" => Ok(Self::Local),
            "remote_replica" | "replica" => Ok(Self::RemoteReplica),
            "memory" => Ok(Self::Memory),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected 'local', 'remote_replica', or 'memory', got '{value}'"),
            }),
        }
    }
}

/// Database connection configuration.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub backend: DatabaseBackend,
    pub path: PathBuf,
    pub replica_url: Option<String>,
    pub replica_auth_token: Option<String>,
}

/// Default database path: `~/.parcelflow/parcelflow.db`.
pub fn default_db_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".parcelflow")
        .join("parcelflow.db")
}

impl DatabaseConfig {
    fn resolve() -> Result<Self, ConfigError> {
        let backend = match optional_env("PARCELFLOW_DB_BACKEND") {
            Some(raw) => DatabaseBackend::parse(&raw, "PARCELFLOW_DB_BACKEND")?,
            None => DatabaseBackend::Local,
        };

        let path = optional_env("PARCELFLOW_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(default_db_path);

        let replica_url = optional_env("PARCELFLOW_DB_REPLICA_URL");
        let replica_auth_token = optional_env("PARCELFLOW_DB_REPLICA_TOKEN");

        if backend == DatabaseBackend::RemoteReplica && replica_url.is_none() {
            return Err(ConfigError::MissingRequired {
                key: "PARCELFLOW_DB_REPLICA_URL".to_string(),
                hint: "required when PARCELFLOW_DB_BACKEND=remote_replica".to_string(),
            });
        }

        Ok(Self {
            backend,
            path,
            replica_url,
            replica_auth_token,
        })
    }
}

/// Chat-channel transport configuration.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Base URL of the channel's HTTP API.
    pub api_base_url: String,
    /// Channel credential. Not required for `doctor` or tests.
    pub bot_token: Option<SecretString>,
    /// Per-request send timeout.
    pub send_timeout: Duration,
}

impl ChannelConfig {
    fn resolve() -> Result<Self, ConfigError> {
        let api_base_url = optional_env("PARCELFLOW_CHANNEL_API_URL")
            .unwrap_or_else(|| "https://api.telegram.org".to_string());
        url::Url::parse(&api_base_url).map_err(|e| ConfigError::InvalidValue {
            key: "PARCELFLOW_CHANNEL_API_URL".to_string(),
            message: e.to_string(),
        })?;

        let bot_token = optional_env("PARCELFLOW_BOT_TOKEN").map(SecretString::from);
        let send_timeout =
            Duration::from_millis(env_nonzero_u64("PARCELFLOW_SEND_TIMEOUT_MS", 10_000)?);

        Ok(Self {
            api_base_url,
            bot_token,
            send_timeout,
        })
    }
}

/// Payment-webhook server configuration.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub bind_addr: SocketAddr,
    /// Shared secret for the `x-webhook-token` header. When unset, the
    /// token check is skipped (local development only).
    pub shared_secret: Option<SecretString>,
}

impl WebhookConfig {
    fn resolve() -> Result<Self, ConfigError> {
        let raw = optional_env("PARCELFLOW_WEBHOOK_BIND").unwrap_or_else(|| "127.0.0.1:8787".to_string());
        let bind_addr = raw.parse().map_err(|_| ConfigError::InvalidValue {
            key: "PARCELFLOW_WEBHOOK_BIND".to_string(),
            message: format!("expected host:port, got '{raw}'"),
        })?;

        let shared_secret = optional_env("PARCELFLOW_WEBHOOK_SECRET").map(SecretString::from);

        Ok(Self {
            bind_addr,
            shared_secret,
        })
    }
}

/// Outbound throughput ceilings and retry policy.
///
/// Defaults sit conservatively at or below the documented platform limits
/// (30 msg/sec global, roughly one message per second per chat), so the
/// service throttles itself before the platform does.
#[derive(Debug, Clone)]
pub struct LimitsConfig {
    /// Global ceiling per second.
    pub global_per_sec: u32,
    /// Global ceiling per 60-second window.
    pub global_per_min: u32,
    /// Per-conversation ceiling per 60-second window.
    pub per_chat_per_min: u32,
    /// Per-conversation in-flight send cap (fairness, not throughput).
    pub per_chat_concurrency: u32,
    /// Duplicate-suppression window.
    pub dedupe_window: Duration,
    /// Maximum delivery attempts before surfacing a hard failure.
    pub max_send_attempts: u32,
    /// First retry delay; doubles per attempt.
    pub backoff_base: Duration,
    /// Ceiling on a single retry delay.
    pub backoff_ceiling: Duration,
}

impl LimitsConfig {
    fn resolve() -> Result<Self, ConfigError> {
        Ok(Self {
            global_per_sec: env_u32("PARCELFLOW_GLOBAL_PER_SEC", 25)?,
            global_per_min: env_u32("PARCELFLOW_GLOBAL_PER_MIN", 1500)?,
            per_chat_per_min: env_u32("PARCELFLOW_PER_CHAT_PER_MIN", 60)?,
            per_chat_concurrency: env_u32("PARCELFLOW_PER_CHAT_CONCURRENCY", 2)?,
            dedupe_window: Duration::from_secs(env_nonzero_u64(
                "PARCELFLOW_DEDUPE_WINDOW_SECS",
                3,
            )?),
            max_send_attempts: env_u32("PARCELFLOW_MAX_SEND_ATTEMPTS", 5)?,
            backoff_base: Duration::from_millis(env_nonzero_u64(
                "PARCELFLOW_BACKOFF_BASE_MS",
                500,
            )?),
            backoff_ceiling: Duration::from_millis(env_nonzero_u64(
                "PARCELFLOW_BACKOFF_CEILING_MS",
                30_000,
            )?),
        })
    }
}

/// Conversation-flow configuration.
#[derive(Debug, Clone)]
pub struct FlowConfig {
    /// Idle window after which a session is expired.
    pub session_ttl: Duration,
    /// Interval between background expiry sweeps.
    pub sweep_interval: Duration,
    /// Worker-pool size for event dispatch.
    pub workers: usize,
}

impl FlowConfig {
    fn resolve() -> Result<Self, ConfigError> {
        let ttl_secs = env_nonzero_u64("PARCELFLOW_SESSION_TTL_SECS", 3600)?;
        // Sweep at TTL/8 so eviction lag stays well under the window itself,
        // floored at once a minute.
        let sweep_secs = env_nonzero_u64("PARCELFLOW_SWEEP_INTERVAL_SECS", (ttl_secs / 8).max(60))?;
        let workers = env_u64("PARCELFLOW_WORKERS", 8)?.clamp(1, 256) as usize;

        Ok(Self {
            session_ttl: Duration::from_secs(ttl_secs),
            sweep_interval: Duration::from_secs(sweep_secs),
            workers,
        })
    }
}
