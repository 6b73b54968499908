//! Application state wiring the engine together.
//!
//! AppState pins the gateway's ports to the concrete infra implementations:
//! SQLite ledger, reqwest call transport, HTTP continuation broker and the
//! HMAC request verifier (when a signing key is configured).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use waystation_core::repository::ledger::BoxLedgerRepository;
use waystation_core::workflow::clock::{Clock, SystemClock};
use waystation_core::workflow::gateway::{
    ContinuationBroker, GatewayParts, InvocationGateway, RequestVerifier,
};
use waystation_core::workflow::registry::WorkflowRegistry;
use waystation_infra::config::{load_engine_config, resolve_database_url, signing_key};
use waystation_infra::sqlite::ledger::SqliteLedgerRepository;
use waystation_infra::sqlite::pool::DatabasePool;
use waystation_infra::workflow::continuation::HttpContinuationBroker;
use waystation_infra::workflow::http_transport::ReqwestCallTransport;
use waystation_infra::workflow::signature::HmacRequestVerifier;
use waystation_infra::workflow::sweeper::TimerSweeper;
use waystation_types::config::EngineConfig;

use crate::demo;

/// Shared application state. Used by both CLI commands and HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<InvocationGateway>,
    pub sweeper: Arc<TimerSweeper>,
    pub config: Arc<EngineConfig>,
    pub data_dir: PathBuf,
    pub db_pool: DatabasePool,
}

impl AppState {
    /// Create the data directory, load `waystation.toml` and wire the engine.
    pub async fn init(data_dir: PathBuf) -> anyhow::Result<Self> {
        let config = load_engine_config(&data_dir).await;
        Self::with_config(data_dir, config).await
    }

    pub async fn with_config(data_dir: PathBuf, config: EngineConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;
        let db_url = resolve_database_url(&config, &data_dir);
        let db_pool = DatabasePool::new(&db_url)
            .await
            .with_context(|| format!("failed to open ledger database at {db_url}"))?;

        let repo = Arc::new(BoxLedgerRepository::new(SqliteLedgerRepository::new(
            db_pool.clone(),
        )));
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let registry = Arc::new(WorkflowRegistry::new());
        demo::register_all(&registry, &config.base_url);

        let transport =
            Arc::new(ReqwestCallTransport::new().context("failed to build call transport")?);
        let broker_client = reqwest::Client::builder()
            .build()
            .context("failed to build continuation client")?;

        let key = signing_key(&config);
        if key.is_none() {
            tracing::warn!("no signing key configured, triggers are not authenticated");
        }
        let broker: Arc<dyn ContinuationBroker> = Arc::new(
            HttpContinuationBroker::new(
                broker_client,
                config.base_url.clone(),
                key.clone(),
                clock.clone(),
            )
            .with_horizon(Duration::from_secs(config.sweeper.horizon_secs)),
        );
        let verifier =
            key.map(|k| Arc::new(HmacRequestVerifier::new(k)) as Arc<dyn RequestVerifier>);

        let gateway = InvocationGateway::new(
            GatewayParts {
                repo: repo.clone(),
                registry,
                transport,
                broker: broker.clone(),
                clock: clock.clone(),
                verifier,
            },
            &config,
        );
        let sweeper = TimerSweeper::new(repo, broker, clock, &config.sweeper);

        tracing::debug!(
            data_dir = %data_dir.display(),
            base_url = %config.base_url,
            "application state ready"
        );

        Ok(Self {
            gateway: Arc::new(gateway),
            sweeper: Arc::new(sweeper),
            config: Arc::new(config),
            data_dir,
            db_pool,
        })
    }
}
