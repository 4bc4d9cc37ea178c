//! Deferred work queue. Currently carries the campaign completion event that
//! triggers report delivery.
use crate::db;
use crate::error::Result;
use crate::model::OutboxKind;
use crate::report::Reporter;
use chrono::Utc;
use sqlx::SqlitePool;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

/// Process at most one due task. Returns whether a task was found.
#[instrument(skip_all)]
pub async fn process_next_task(
    pool: &SqlitePool,
    reporter: &Reporter,
    max_backoff_secs: i64,
) -> Result<bool> {
    let Some(task) = db::next_due_outbox(pool, Utc::now()).await? else {
        return Ok(false);
    };
    let res = match task.kind {
        OutboxKind::CampaignReport => reporter.send_report(task.ref_id).await,
    };
    match res {
        Ok(()) => {
            db::delete_outbox(pool, task.id).await?;
            info!(id = task.id, kind = task.kind.as_str(), ref_id = task.ref_id, "outbox task succeeded");
        }
        Err(err) => {
            warn!(
                ?err,
                id = task.id,
                kind = task.kind.as_str(),
                ref_id = task.ref_id,
                attempt = task.attempt,
                "outbox task failed; backoff"
            );
            db::backoff_outbox_with_cap(pool, task.id, task.attempt, max_backoff_secs).await?;
        }
    }
    Ok(true)
}

/// Poll the outbox until `shutdown` flips to true.
pub async fn run(
    pool: SqlitePool,
    reporter: Reporter,
    poll_sleep: Duration,
    max_backoff_secs: i64,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        let pause = match process_next_task(&pool, &reporter, max_backoff_secs).await {
            Ok(true) => None,
            Ok(false) => Some(poll_sleep),
            Err(err) => {
                error!(?err, "outbox worker error");
                Some(Duration::from_secs(1))
            }
        };
        if let Some(pause) = pause {
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    }
    info!("outbox worker stopped");
}
