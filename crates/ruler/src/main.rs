use std::sync::Arc;
use tracing::info;

use rulefleet_ruler::{
    config::Config,
    eval::{Evaluator, HttpEvaluator, HttpPusher, SamplePusher},
    notifier::NotifierManager,
    orchestrator::Ruler,
    ring::Membership,
    server::Server,
    store::{InMemoryRuleStore, RuleStore},
    Error, Result,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // Load configuration
    let config = Config::load()?;
    info!(instance = %config.ring.instance_id, "loaded configuration");

    // Evaluation backends
    let query_url = config.evaluation.query_url.clone().ok_or_else(|| {
        Error::Config("EVALUATOR_URL must be set to the query backend base URL".to_string())
    })?;
    let push_url = config.evaluation.push_url.clone().ok_or_else(|| {
        Error::Config("PUSH_URL must be set to the sample push endpoint".to_string())
    })?;
    let evaluator: Arc<dyn Evaluator> = Arc::new(HttpEvaluator::new(&query_url)?);
    let pusher: Arc<dyn SamplePusher> = Arc::new(HttpPusher::new(&push_url)?);

    // Rule storage and ring membership
    let store: Arc<dyn RuleStore> = Arc::new(InMemoryRuleStore::new());
    let membership = Membership::new(config.ring.heartbeat_grace());

    // Notifier manager
    let notifiers = Arc::new(NotifierManager::new(config.notifier.clone())?);

    // Join the ring, load rules, and start the reconciliation loops
    let ruler = Ruler::new(
        config.clone(),
        membership,
        store,
        evaluator,
        pusher,
        notifiers,
    )
    .await?;
    ruler.spawn();

    // Start server
    let server = Server::new(ruler);
    info!("Starting server on {}", config.server.addr);
    server.start(&config.server.addr).await?;

    Ok(())
}
