use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use mailflow::config::RuntimeConfig;
use mailflow::delivery::{DeliveryAdapter, SmtpDelivery};
use mailflow::inbox::{BackoffPolicy, ImapSource, InboxWatcher};
use mailflow::orchestrator::Orchestrator;
use mailflow::router::rules::{RoutingConfig, RuleSet};
use mailflow::router::WorkflowRouter;
use mailflow::workflow::{AgentRegistry, WorkflowEngine};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mailflow=info")),
        )
        .init();

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        // Already installed by an embedding host; fine.
        info!("rustls crypto provider already installed");
    }

    let mode = std::env::args().nth(1).unwrap_or_else(|| "watch".into());
    let config = RuntimeConfig::from_env().context("loading configuration")?;

    let routing = RoutingConfig::from_file(&config.routing_config)
        .with_context(|| format!("loading routing rules from {}", config.routing_config.display()))?;
    let workflows_dir = routing.workflows_dir.clone();
    let router = WorkflowRouter::new(RuleSet::compile(routing));

    let watcher = InboxWatcher::new(
        Arc::new(ImapSource::new(config.inbox.clone())),
        BackoffPolicy::from(&config.retry),
        config.inbox.poll_interval,
    );
    let engine = WorkflowEngine::new(
        Arc::new(AgentRegistry::with_builtins()),
        config.engine.clone(),
    );
    let delivery = DeliveryAdapter::new(
        Arc::new(SmtpDelivery::new(config.smtp.clone())),
        &config.smtp.default_recipient,
    );

    let orchestrator = Orchestrator::new(
        watcher,
        router,
        engine,
        delivery,
        workflows_dir,
        config.checkpoint_path.clone(),
        config.max_concurrent_runs,
    );

    match mode.as_str() {
        "once" => {
            let stats = orchestrator.run_once().await?;
            info!(?stats, "One-shot run complete");
        }
        "watch" => {
            let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Shutdown signal received");
                    let _ = stop_tx.send(true);
                }
            });
            let stats = orchestrator.run_forever(stop_rx).await?;
            info!(?stats, "Watch loop stopped");
        }
        other => {
            error!(mode = other, "Unknown mode; expected 'once' or 'watch'");
            anyhow::bail!("unknown mode '{other}'");
        }
    }

    Ok(())
}
