use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use rhythm_core::RhythmConfig;
use rhythm_dlq::DeadLetterQueue;
use rhythm_scheduler::{ReplayReport, RhythmOrchestrator};
use tokio::sync::watch;
use tracing::{info, warn};

mod cli;
mod http;

use cli::{Cli, Command, DlqCommand};

const DEFAULT_FILTER: &str = "rhythmd=info,rhythm_scheduler=info,rhythm_executor=info,\
rhythm_dlq=info,rhythm_health=info,rhythm_breaker=info,tower_http=info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    // explicit --config > RHYTHM_CONFIG env > ~/.rhythm/rhythm.toml
    let config = RhythmConfig::load(cli.config.as_deref()).context("invalid configuration")?;

    match cli.command {
        Command::Run => run(config).await,
        Command::Health { url } => health(&config, url).await,
        Command::Dlq(args) => match args.command {
            DlqCommand::List { status, limit } => dlq_list(&config, status, limit),
            DlqCommand::Replay {
                id,
                limit,
                include_abandoned,
            } => dlq_replay(&config, id, limit, include_abandoned).await,
        },
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_FILTER.into());
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(config: RhythmConfig) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.control.bind, config.control.port)
        .parse()
        .context("invalid control address")?;

    // Bind before anything is dispatched: a bind failure must not leave
    // jobs running without a drain.
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot bind control endpoint {addr}"))?;

    let orchestrator = Arc::new(RhythmOrchestrator::from_config(&config)?);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let engine = tokio::spawn(Arc::clone(&orchestrator).run(shutdown_rx));

    let state = Arc::new(http::AppState {
        orchestrator: Arc::clone(&orchestrator),
    });
    let router = http::build_router(state);
    info!(%addr, "rhythmd listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // drain: stop dispatching, cancel in-flight jobs, flush the DLQ
    let _ = shutdown_tx.send(true);
    if let Err(e) = engine.await {
        warn!(error = %e, "orchestrator task ended abnormally");
    }
    info!(lifecycle = %orchestrator.lifecycle(), "rhythmd stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, draining"),
        _ = terminate => info!("received SIGTERM, draining"),
    }
}

async fn health(config: &RhythmConfig, url: Option<String>) -> anyhow::Result<()> {
    let base = url.unwrap_or_else(|| {
        // a wildcard bind is reachable on loopback
        let host = match config.control.bind.as_str() {
            "0.0.0.0" | "::" => "127.0.0.1",
            other => other,
        };
        format!("http://{host}:{}", config.control.port)
    });
    let endpoint = format!("{}/health", base.trim_end_matches('/'));

    let resp = reqwest::Client::new()
        .get(&endpoint)
        .timeout(std::time::Duration::from_secs(10))
        .send()
        .await
        .with_context(|| format!("cannot reach {endpoint}"))?;
    let status = resp.status();
    let body: serde_json::Value = resp.json().await.context("malformed health response")?;
    println!("{}", serde_json::to_string_pretty(&body)?);

    if !status.is_success() {
        bail!("rhythmd is {}", body["status"].as_str().unwrap_or("unreachable"));
    }
    Ok(())
}

fn dlq_list(
    config: &RhythmConfig,
    status: Option<rhythm_dlq::DlqStatus>,
    limit: usize,
) -> anyhow::Result<()> {
    let dlq = DeadLetterQueue::open(&config.dlq)?;
    let entries = dlq.list(status, limit)?;
    if entries.is_empty() {
        println!("No dead letters.");
        return Ok(());
    }
    println!(
        "{:<36}  {:<12}  {:<9}  {:>7}  {:<19}  LAST FAILED",
        "ID", "CLASS", "STATUS", "RETRIES", "ERROR"
    );
    for e in &entries {
        println!(
            "{:<36}  {:<12}  {:<9}  {:>7}  {:<19}  {}",
            e.id,
            e.job_class.as_str(),
            e.status.as_str(),
            e.retry_count,
            e.error_kind.to_string(),
            e.last_failed_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    let stats = dlq.stats()?;
    println!(
        "\n{} pending, {} retrying, {} resolved, {} abandoned",
        stats.pending, stats.retrying, stats.resolved, stats.abandoned
    );
    Ok(())
}

/// Offline replay: builds the orchestrator without its tick loop, replays,
/// then drains so the store is flushed before exit.
async fn dlq_replay(
    config: &RhythmConfig,
    id: Option<String>,
    limit: usize,
    include_abandoned: bool,
) -> anyhow::Result<()> {
    let orchestrator = Arc::new(RhythmOrchestrator::from_config(config)?);
    let result = replay_offline(&orchestrator, id, limit, include_abandoned).await;
    orchestrator.drain().await;

    let report = result?;
    for (id, r) in &report.results {
        println!("{id}  {}", serde_json::to_string(r)?);
    }
    println!(
        "{} resolved, {} failed, {} skipped",
        report.resolved(),
        report.failed(),
        report.skipped()
    );
    Ok(())
}

/// Entries a crashed daemon left `Retrying` go back to `Pending` first so
/// this run can reach them.  Assumes no daemon is replaying concurrently.
async fn replay_offline(
    orchestrator: &Arc<RhythmOrchestrator>,
    id: Option<String>,
    limit: usize,
    include_abandoned: bool,
) -> anyhow::Result<ReplayReport> {
    orchestrator.dlq().reset_retrying()?;
    let report = match id {
        Some(id) => {
            let r = orchestrator.replay_entry(&id).await?;
            ReplayReport {
                results: vec![(id, r)],
            }
        }
        None => orchestrator.replay(limit, include_abandoned).await?,
    };
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rhythm_core::{ErrorKind, JobClass, JobSpec};
    use rhythm_dlq::{DeadLetterEntry, DlqStatus};
    use std::time::Duration;

    fn config(dir: &tempfile::TempDir) -> RhythmConfig {
        let mut cfg = RhythmConfig::default();
        cfg.dlq.path = dir.path().join("dlq.db").to_string_lossy().into_owned();
        cfg.datastore.path = dir.path().join("warehouse.db").to_string_lossy().into_owned();
        cfg.control.bind = "127.0.0.1".into();
        for class in JobClass::ALL {
            cfg.jobs.get_mut(class).command = Some(vec!["true".into()]);
        }
        cfg
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn offline_replay_recovers_interrupted_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir);
        let orchestrator = Arc::new(RhythmOrchestrator::from_config(&cfg).unwrap());
        let spec = JobSpec {
            class: JobClass::Rem,
            command: vec!["true".into()],
            timeout: Duration::from_secs(5),
            priority: 0,
        };
        let entry = DeadLetterEntry::new(&spec, ErrorKind::JobFailure, "", 0, chrono::Utc::now());
        orchestrator.dlq().enqueue(&entry).unwrap();
        // left behind by a daemon that died mid-replay
        orchestrator.dlq().mark_retrying(&entry.id).unwrap();

        let report = replay_offline(&orchestrator, None, 10, false).await.unwrap();
        orchestrator.drain().await;
        assert_eq!(report.resolved(), 1);
        assert_eq!(
            orchestrator.dlq().get(&entry.id).unwrap().status,
            DlqStatus::Resolved
        );
    }

    #[tokio::test]
    async fn bind_failure_starts_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut cfg = config(&dir);
        cfg.control.port = taken.local_addr().unwrap().port();

        let err = run(cfg).await.unwrap_err();
        assert!(err.to_string().contains("cannot bind control endpoint"));
        // the orchestrator (and with it the DLQ file) was never created
        assert!(!dir.path().join("dlq.db").exists());
    }
}
