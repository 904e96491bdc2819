use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::sync::Reconciler;

/// Watch channel flipped to `true` on ctrl-c.
pub fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown requested"),
            Err(err) => warn!(error = %err, "cannot listen for ctrl-c, shutting down"),
        }
        let _ = tx.send(true);
    });
    rx
}

/// Run discovery and posting cycles on their own cadences until shutdown.
///
/// A failed cycle is logged and the loop moves on to the next tick.
pub async fn run(reconciler: &Reconciler, config: &AppConfig, mut shutdown: watch::Receiver<bool>) {
    let mut discovery_tick =
        tokio::time::interval(Duration::from_secs(config.discovery.interval_minutes.max(1) * 60));
    let mut posting_tick =
        tokio::time::interval(Duration::from_secs(config.posting.interval_secs.max(1)));
    discovery_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    posting_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        discovery_minutes = config.discovery.interval_minutes,
        posting_secs = config.posting.interval_secs,
        "scheduler started"
    );
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = discovery_tick.tick() => discover(reconciler).await,
            _ = posting_tick.tick() => post(reconciler).await,
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    info!("scheduler stopped");
}

async fn discover(reconciler: &Reconciler) {
    match reconciler.run_discovery_cycle().await {
        Ok(summary) if summary.aborted => return,
        Ok(_) => {}
        Err(err) => {
            error!(
                error = %err,
                integrity = err.is_integrity_violation(),
                "discovery cycle failed"
            );
            return;
        }
    }
    match reconciler.run_tag_refresh().await {
        Ok(report) if report.refreshed + report.failed > 0 => info!(
            refreshed = report.refreshed,
            failed = report.failed,
            "tag refresh finished"
        ),
        Ok(_) => {}
        Err(err) => error!(
            error = %err,
            integrity = err.is_integrity_violation(),
            "tag refresh failed"
        ),
    }
}

async fn post(reconciler: &Reconciler) {
    if let Err(err) = reconciler.run_posting_cycle(None).await {
        error!(
            error = %err,
            integrity = err.is_integrity_violation(),
            "posting cycle failed"
        );
    }
}
