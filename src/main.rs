use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use authguard::cli::Cli;
use authguard::config::GuardConfig;
use authguard::event::{unix_now, EventSource, JournalSource};
use authguard::firewall::{BlocklistController, IpsetController, NullController};
use authguard::parser::SshdParser;
use authguard::persistence::{PersistenceAdapter, SqliteAudit};
use authguard::sweeper::CleanupScheduler;
use authguard::tracker::AttemptTracker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = GuardConfig::load(cli.config.as_deref())?;
    cli.apply(&mut config);
    config.validate()?;
    info!(
        service = %config.service,
        max_attempts = config.max_attempts,
        window_secs = config.window_secs,
        block_secs = config.block_secs,
        "starting authguard"
    );

    let audit = Arc::new(
        SqliteAudit::connect(&config.db_path)
            .await
            .with_context(|| format!("opening audit store {}", config.db_path.display()))?,
    );

    let firewall: Arc<dyn BlocklistController> = if cli.no_firewall {
        warn!("firewall disabled, blocking decisions will only be logged");
        Arc::new(NullController)
    } else {
        let controller = IpsetController::new(&config.ipset_name, config.block_secs);
        controller.ensure_chain().await.context("preparing firewall chain")?;
        Arc::new(controller)
    };

    let tracker = Arc::new(AttemptTracker::new(
        &config,
        firewall,
        Arc::clone(&audit) as Arc<dyn PersistenceAdapter>,
    ));

    if !cli.no_rehydrate {
        match audit.load_all().await {
            Ok(rows) => {
                tracker.rehydrate(rows, unix_now()).await;
            }
            Err(e) => warn!(error = %e, "rehydration read failed, starting empty"),
        }
    }

    let (shutdown_tx, _) = broadcast::channel(1);
    let scheduler =
        CleanupScheduler::new(Arc::clone(&tracker), config.sweep_interval());
    let sweep_task = tokio::spawn(scheduler.run(shutdown_tx.subscribe()));

    let source = JournalSource::spawn(&config.service).context("starting journal tail")?;
    run_intake(source, &tracker, shutdown_tx.subscribe()).await;

    // Teardown: intake has stopped; stop the sweeper and let in-flight
    // external calls finish before the audit pool closes.
    let _ = shutdown_tx.send(());
    if let Err(e) = sweep_task.await {
        error!(error = %e, "cleanup scheduler task failed");
    }
    audit.close().await;
    info!("authguard stopped");
    Ok(())
}

/// Drain the event source into the tracker until shutdown or stream loss.
async fn run_intake(
    mut source: impl EventSource,
    tracker: &AttemptTracker,
    mut shutdown: broadcast::Receiver<()>,
) {
    let parser = SshdParser::new();
    loop {
        tokio::select! {
            _ = shutdown_signal(&mut shutdown) => {
                info!("shutdown signal received, stopping event intake");
                break;
            }
            batch = source.next_batch() => {
                let lines = match batch {
                    Ok(lines) => lines,
                    Err(e) => {
                        error!(error = %e, "event source failed, stopping");
                        break;
                    }
                };
                let now = unix_now();
                for line in lines {
                    if let Some(event) = parser.parse(&line, now) {
                        tracker.handle_event(&event).await;
                    }
                }
            }
        }
    }
}

/// Resolves on SIGINT, SIGTERM or an internal shutdown broadcast.
async fn shutdown_signal(internal: &mut broadcast::Receiver<()>) {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            error!(error = %e, "cannot install SIGTERM handler");
            // Fall back to Ctrl-C and the internal channel only.
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = internal.recv() => {}
            }
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
        _ = internal.recv() => {}
    }
}
