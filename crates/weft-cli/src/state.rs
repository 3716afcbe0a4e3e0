//! Application state wiring the engine to its adapters.
//!
//! The engine is generic over the invoker and checkpoint store; AppState pins
//! it to the SQLite store and a boxed invoker chosen at runtime.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use weft_core::agent::box_invoker::BoxAgentInvoker;
use weft_core::agent::cooldown::CooldownCache;
use weft_core::workflow::executor::WorkflowEngine;
use weft_infra::agent::echo::EchoAgentInvoker;
use weft_infra::agent::http::HttpAgentInvoker;
use weft_infra::config::{load_config, resolve_data_dir};
use weft_infra::sqlite::checkpoint::SqliteCheckpointStore;
use weft_infra::sqlite::pool::{DatabasePool, database_url};
use weft_types::config::WeftConfig;

use crate::cli::AgentTarget;

/// Engine pinned to the infra implementations.
pub type ConcreteEngine = WorkflowEngine<BoxAgentInvoker, SqliteCheckpointStore>;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub data_dir: PathBuf,
    pub config: WeftConfig,
    pub db_pool: DatabasePool,
}

impl AppState {
    /// Initialize the application state: load config, open the database.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

        let config = load_config(&data_dir).await;
        let db_pool = DatabasePool::new(&database_url(&data_dir))
            .await
            .context("Failed to open checkpoint database")?;

        tracing::debug!(data_dir = %data_dir.display(), "application state initialized");
        Ok(Self {
            data_dir,
            config,
            db_pool,
        })
    }

    /// Build an engine whose agent calls go to `target`.
    pub fn engine(&self, target: &AgentTarget) -> anyhow::Result<Arc<ConcreteEngine>> {
        let invoker = self.invoker(target)?;
        let store = SqliteCheckpointStore::new(self.db_pool.clone());
        let cooldowns = Arc::new(CooldownCache::from_table(&self.config.fallback));
        Ok(Arc::new(WorkflowEngine::new(
            Arc::new(invoker),
            store,
            &self.config,
            cooldowns,
        )))
    }

    fn invoker(&self, target: &AgentTarget) -> anyhow::Result<BoxAgentInvoker> {
        let endpoint = match target {
            AgentTarget::Echo => None,
            AgentTarget::Url(url) => {
                let mut endpoint = self.config.agent.clone();
                endpoint.url = Some(url.clone());
                Some(endpoint)
            }
            AgentTarget::Configured => self
                .config
                .agent
                .url
                .is_some()
                .then(|| self.config.agent.clone()),
        };

        match endpoint {
            Some(endpoint) => {
                let invoker = HttpAgentInvoker::from_config(&endpoint)
                    .context("Failed to configure agent endpoint")?;
                tracing::info!(url = invoker.url(), "agent calls go to http endpoint");
                Ok(BoxAgentInvoker::new(invoker))
            }
            None => {
                tracing::info!("no agent endpoint configured, echoing agent inputs");
                Ok(BoxAgentInvoker::new(EchoAgentInvoker))
            }
        }
    }
}
