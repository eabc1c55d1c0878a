use std::sync::Arc;

use concierge_agent::{
    build_client, prompts::PromptError, AgentPool, Classifier, EscalationPolicy,
    GenerationParams, KeywordClassifier, LlmClassifier, LlmClient, PoolDependencies,
    PromptLibrary, Router, RouterComponents, RouterSettings, StaticKnowledgeBase,
    StaticOrderBook,
};
use concierge_core::config::{AppConfig, ConfigError, LlmProvider, LoadOptions};
use concierge_core::{AuditSink, RateLimiter};
use concierge_db::{
    connect_with_settings, migrations, DbPool, SqlConversationStore, SqlHumanQueue,
};
use thiserror::Error;
use tracing::info;

use crate::audit::TracingAuditSink;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub router: Arc<Router>,
    pub llm_provider: &'static str,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("prompt templates failed to load: {0}")]
    Prompts(#[from] PromptError),
}

#[cfg(test)]
pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        llm_provider = ?config.llm.provider,
        "starting application bootstrap"
    );

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let llm = build_client(&config.llm);
    let llm_provider = llm.name();
    let router = assemble_router(&config, db_pool.clone(), llm)?;
    info!(
        event_name = "system.bootstrap.router_ready",
        correlation_id = "bootstrap",
        llm_provider,
        rate_limits_enabled = config.rate_limits.enabled,
        "conversation router assembled"
    );

    Ok(Application { config, db_pool, router: Arc::new(router), llm_provider })
}

fn assemble_router(
    config: &AppConfig,
    db_pool: DbPool,
    llm: Arc<dyn LlmClient>,
) -> Result<Router, BootstrapError> {
    let prompts = Arc::new(PromptLibrary::new(config.routing.company_name.as_str())?);
    let params = GenerationParams::from(&config.llm);

    let classifier: Arc<dyn Classifier> = match config.llm.provider {
        LlmProvider::Offline => Arc::new(KeywordClassifier::new()),
        LlmProvider::OpenAi | LlmProvider::Ollama => Arc::new(LlmClassifier::new(
            Arc::clone(&llm),
            Arc::clone(&prompts),
            params,
            config.routing.min_confidence,
        )),
    };

    let limiter = if config.rate_limits.enabled {
        RateLimiter::with_hourly(config.rate_limits.tiers, config.rate_limits.hourly)
    } else {
        RateLimiter::disabled()
    };

    let pool = AgentPool::standard(PoolDependencies {
        llm,
        prompts,
        params,
        orders: Arc::new(StaticOrderBook::sample()),
        knowledge: Arc::new(StaticKnowledgeBase::sample()),
    });

    let audit: Arc<dyn AuditSink> = Arc::new(TracingAuditSink);
    let components = RouterComponents {
        store: Arc::new(SqlConversationStore::new(db_pool.clone())),
        queue: Arc::new(SqlHumanQueue::new(db_pool)),
        limiter: Arc::new(limiter),
        classifier,
        pool: Arc::new(pool),
        audit,
    };

    Ok(Router::new(
        components,
        EscalationPolicy::from(&config.routing),
        RouterSettings::from(&config.routing),
    ))
}
