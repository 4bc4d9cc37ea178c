use anyhow::{Context, Result};
use clap::Parser;
use mail_campaign::dispatch::{DispatchSettings, Dispatcher};
use mail_campaign::recorder::DeliveryRecorder;
use mail_campaign::report::Reporter;
use mail_campaign::{config, db, outbox, scheduler, transport};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))
        .with_context(|| format!("loading {}", args.config.display()))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let mailer = transport::from_config(&cfg.mail).context("building mail transport")?;
    let recorder = Arc::new(DeliveryRecorder::new(pool.clone()));
    let dispatcher = Arc::new(Dispatcher::new(
        pool.clone(),
        Arc::clone(&mailer),
        recorder,
        DispatchSettings::from_config(&cfg),
    ));
    let reporter = Reporter::new(
        pool.clone(),
        mailer,
        cfg.mail.from_address.clone(),
        cfg.mail.admin_address.clone(),
    )
    .with_send_timeout(cfg.send_timeout());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Outbox worker (single task) delivers campaign reports.
    let worker = tokio::spawn(outbox::run(
        pool.clone(),
        reporter,
        cfg.outbox_poll_interval(),
        cfg.app.max_backoff_seconds as i64,
        shutdown_rx.clone(),
    ));
    let ticker = tokio::spawn(scheduler::run(
        dispatcher,
        cfg.scheduler_interval(),
        shutdown_rx,
    ));

    info!("campaign service running");
    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);

    for (name, handle) in [("outbox worker", worker), ("scheduler", ticker)] {
        if let Err(err) = handle.await {
            error!(?err, task = name, "background task panicked");
        }
    }
    pool.close().await;
    Ok(())
}
