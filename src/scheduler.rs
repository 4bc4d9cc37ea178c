//! Scheduler Trigger: hands due campaigns to the dispatch engine.
//!
//! Stateless. Safe to run from several processes at once; the engine's
//! `scheduled -> in_progress` compare-and-set decides who actually runs.
use crate::db;
use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::error::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, instrument};

/// A dispatch started by one trigger pass.
pub struct DueDispatch {
    pub campaign_id: i64,
    pub handle: JoinHandle<Result<DispatchOutcome>>,
}

/// Spawn `execute` for every campaign due at `now` without waiting for them.
#[instrument(skip(dispatcher))]
pub async fn trigger_due(
    dispatcher: &Arc<Dispatcher>,
    now: DateTime<Utc>,
) -> Result<Vec<DueDispatch>> {
    let due = db::due_campaigns(dispatcher.pool(), now).await?;
    if !due.is_empty() {
        info!(campaigns = ?due, "dispatching due campaigns");
    }
    Ok(due
        .into_iter()
        .map(|campaign_id| {
            let dispatcher = Arc::clone(dispatcher);
            let handle = tokio::spawn(async move {
                let res = dispatcher.execute(campaign_id).await;
                if let Err(err) = &res {
                    error!(?err, campaign_id, "campaign dispatch failed");
                }
                res
            });
            DueDispatch {
                campaign_id,
                handle,
            }
        })
        .collect())
}

/// Run trigger passes every `interval` until `shutdown` flips to true.
pub async fn run(dispatcher: Arc<Dispatcher>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(interval_secs = interval.as_secs(), "scheduler started");
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = trigger_due(&dispatcher, Utc::now()).await {
                    error!(?err, "scheduler pass failed");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!("scheduler stopped");
}
