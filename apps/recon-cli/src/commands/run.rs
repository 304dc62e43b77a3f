use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use clap::Args;
use recon_core::OutcomeKind;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

/// Longer than the webhook request timeout so an in-flight POST can finish.
const NOTIFY_GRACE: Duration = Duration::from_secs(12);

#[derive(Args, Clone)]
pub struct RunArgs {
    /// Seconds between cycle batches
    #[arg(long, default_value_t = 300)]
    pub interval_secs: u64,
    /// Concurrent cycles per tick; defaults to `worker.max_parallel`
    #[arg(long)]
    pub parallel: Option<usize>,
}

#[derive(Args, Clone)]
pub struct OnceArgs {
    /// Pretty-print JSON
    #[arg(long)]
    pub pretty: bool,
}

pub async fn execute(config: Option<&Path>, args: &RunArgs) -> Result<()> {
    let cfg = super::load(config)?;
    let parallel = args.parallel.unwrap_or(cfg.worker.max_parallel).max(1);
    let (tx, rx) = watch::channel(false);
    let reconciler = super::reconciler(cfg)?.with_shutdown(rx.clone());
    let mut shutdown = rx;

    let released = reconciler.recover().await?;
    if released > 0 {
        tracing::warn!(
            target: "recon::cli",
            released,
            "released budget holds left by a previous run"
        );
    }

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!(target: "recon::cli", "shutdown signal received");
                let _ = tx.send(true);
            }
            Err(err) => {
                tracing::warn!(target: "recon::cli", error = %err, "cannot listen for ctrl-c");
                // hold the sender so the loop keeps running
                std::future::pending::<()>().await;
            }
        }
    });

    let mut ticker = interval(Duration::from_secs(args.interval_secs.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tracing::info!(
        target: "recon::cli",
        interval_secs = args.interval_secs,
        parallel,
        "reconciler loop started"
    );
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        let outcomes = reconciler.run_batch(Utc::now(), parallel).await;
        if outcomes
            .iter()
            .any(|o| o.outcome == OutcomeKind::Interrupted)
        {
            break;
        }
    }
    let abandoned = reconciler.drain_notifications(NOTIFY_GRACE).await;
    tracing::info!(target: "recon::cli", abandoned, "reconciler loop stopped");
    Ok(())
}

pub async fn execute_once(config: Option<&Path>, args: &OnceArgs) -> Result<()> {
    let cfg = super::load(config)?;
    let reconciler = super::reconciler(cfg)?;
    reconciler.recover().await?;
    let outcome = reconciler.run_cycle(Utc::now()).await;
    reconciler.drain_notifications(NOTIFY_GRACE).await;
    let rendered = if args.pretty {
        serde_json::to_string_pretty(&outcome)?
    } else {
        serde_json::to_string(&outcome)?
    };
    println!("{}", rendered);
    Ok(())
}
