//! Startup wiring for parcelflow.
//!
//! Env layering and the construction of the service graph. Everything that
//! used to be an ambient global in systems like this — the rate limiter, the
//! suppressor, the settings — is built exactly once here and handed out by
//! `Arc`, so ownership is explicit and tests can assemble the same graph
//! with doubles at the seams.

use std::path::PathBuf;
use std::sync::Arc;

use crate::channels::dedupe::DuplicateSuppressor;
use crate::channels::limits::RateGovernor;
use crate::channels::outbound::Outbound;
use crate::channels::ChannelSender;
use crate::config::{Config, DatabaseBackend, DatabaseConfig};
use crate::db::libsql::LibSqlBackend;
use crate::db::Database;
use crate::error::{DatabaseError, Result};
use crate::flow::FlowEngine;
use crate::payments::gateway::PaymentGateway;
use crate::payments::PaymentLedger;
use crate::rates::RateProvider;

/// Path to the deployment `.env`: `~/.parcelflow/.env`.
pub fn parcelflow_env_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".parcelflow")
        .join(".env")
}

/// Load env vars from `./.env` and `~/.parcelflow/.env`.
///
/// dotenvy never overwrites existing vars, so the effective priority is:
/// explicit env vars > `./.env` > `~/.parcelflow/.env`.
pub fn load_env() {
    let _ = dotenvy::dotenv();
    let path = parcelflow_env_path();
    if path.exists() {
        let _ = dotenvy::from_path(&path);
    }
}

/// Open the configured database backend and run migrations.
pub async fn open_database(config: &DatabaseConfig) -> Result<Arc<dyn Database>> {
    let backend = match config.backend {
        DatabaseBackend::Local => LibSqlBackend::new_local(&config.path).await?,
        DatabaseBackend::Memory => LibSqlBackend::new_memory().await?,
        DatabaseBackend::RemoteReplica => {
            let url = config
                .replica_url
                .as_deref()
                .ok_or_else(|| DatabaseError::Connection("replica URL missing".to_string()))?;
            LibSqlBackend::new_remote_replica(
                &config.path,
                url,
                config.replica_auth_token.as_deref().unwrap_or(""),
            )
            .await?
        }
    };
    backend.run_migrations().await?;
    Ok(Arc::new(backend))
}

/// The assembled service graph.
pub struct Services {
    pub store: Arc<dyn Database>,
    pub engine: Arc<FlowEngine>,
    pub outbound: Arc<Outbound>,
    pub ledger: Arc<PaymentLedger>,
}

/// Wire the service objects together. The transport, rate provider, and
/// payment gateway are injected so the binary and the tests build the same
/// graph with different edges.
pub fn build_services(
    config: &Config,
    store: Arc<dyn Database>,
    sender: Arc<dyn ChannelSender>,
    rates: Arc<dyn RateProvider>,
    gateway: Arc<dyn PaymentGateway>,
) -> Services {
    let outbound = Arc::new(Outbound::new(
        RateGovernor::new(&config.limits),
        DuplicateSuppressor::new(config.limits.dedupe_window),
        sender,
    ));
    let engine = Arc::new(FlowEngine::new(
        Arc::clone(&store),
        rates,
        gateway,
        config.flow.session_ttl,
    ));
    let ledger = Arc::new(PaymentLedger::new(
        Arc::clone(&store),
        Arc::clone(&outbound),
    ));

    Services {
        store,
        engine,
        outbound,
        ledger,
    }
}
