//! ledger-syncd - runs ledger sync for the configured budget files

mod config;

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::{Args, Command};
use ledger_sync::{
    FileCursorStore, HttpConnector, LedgerSyncConfig, RunOutcome, SyncOrchestrator, SyncRun,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();
    init_tracing(&args);

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(2);
    }

    let mut file = LedgerSyncConfig::from_path(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    args.apply(&mut file.settings);
    let settings = file.settings.clone();

    let command = args.command();
    info!("======================================");
    info!("  ledger-syncd {}", env!("CARGO_PKG_VERSION"));
    info!("======================================");
    info!("Config: {}", args.config.display());
    info!("Instances: {}", file.instances.len());
    info!("Data dir: {}", args.data_dir.display());
    info!("Scan interval: {}s", settings.scan_interval_secs);
    info!("Max concurrent runs: {}", settings.max_concurrent_runs);
    info!("======================================");

    let cursors = FileCursorStore::open(args.cursor_path())
        .await
        .context("opening cursor store")?;
    let orchestrator = Arc::new(SyncOrchestrator::new(
        settings.clone(),
        Arc::new(cursors),
        Arc::new(HttpConnector::new(settings.session_timeout())),
    ));

    let mut setup_failures = 0usize;
    for instance in &file.instances {
        match orchestrator.add_instance(instance).await {
            Ok(id) => info!(instance_id = %id, "Instance ready"),
            Err(e) => {
                setup_failures += 1;
                error!(
                    file = %instance.file,
                    error_kind = %e.kind(),
                    error = %e,
                    "Instance setup failed"
                );
                if matches!(command, Command::Check) {
                    print_json(&serde_json::json!({
                        "file": instance.file,
                        "endpoint": instance.endpoint,
                        "result": e.kind().as_str(),
                    }))?;
                }
            }
        }
    }

    match &command {
        Command::Check => {
            for id in orchestrator.instance_ids() {
                let status = orchestrator.status(&id).await?;
                print_json(&serde_json::json!({
                    "instance_id": status.instance_id,
                    "title": status.title,
                    "tls": status.tls,
                    "akahu": status.akahu,
                    "result": "ok",
                }))?;
            }
            if setup_failures > 0 {
                std::process::exit(1);
            }
        }
        Command::Run => {
            if orchestrator.instance_ids().is_empty() {
                warn!("No instance is ready, nothing to schedule");
            }
            let scheduler = orchestrator.spawn_scheduler();
            info!("Scheduler running, press Ctrl+C to stop");
            tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
            info!("Shutting down");
            for id in orchestrator.instance_ids() {
                let _ = orchestrator.cancel(&id);
            }
            scheduler.abort();
        }
        Command::BankSync { .. } | Command::BudgetSync { .. } | Command::AkahuSync { .. } => {
            let Some(request) = command.sync_request() else {
                return Ok(());
            };

            let targets = select_instances(&orchestrator, command.instance_filter());
            if targets.is_empty() {
                anyhow::bail!("no ready instance matches the selection");
            }

            let mut failed = false;
            for id in targets {
                let run = orchestrator.run(&id, request).await?;
                failed |= !matches!(run.outcome, Some(RunOutcome::Succeeded));
                print_run(&run)?;
            }
            if failed || setup_failures > 0 {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

fn init_tracing(args: &Args) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
            "ledger_sync={level},ledger_syncd={level},info",
            level = args.log_level
        )
        .into()
    });

    let registry = tracing_subscriber::registry().with(filter);
    if args.log_json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Instances matching an id or file name; all when no filter is given.
fn select_instances(orchestrator: &SyncOrchestrator, filter: Option<&str>) -> Vec<String> {
    let ids = orchestrator.instance_ids();
    match filter {
        None => ids,
        Some(wanted) => {
            let wanted = wanted.to_lowercase();
            ids.into_iter()
                .filter(|id| *id == wanted || id.ends_with(&format!("_{}", wanted)))
                .collect()
        }
    }
}

fn print_run(run: &SyncRun) -> anyhow::Result<()> {
    print_json(&serde_json::to_value(run)?)
}

fn print_json(value: &serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
