//! Delivery Recorder: sole writer of delivery log rows and campaign counters.
//!
//! Counters are always recomputed from the log and the recipient snapshot in
//! [`recompute_counters`]; nothing else in the crate writes them.
use crate::db::{self, Pool, Tx};
use crate::error::{Error, Result};
use crate::model::{
    CampaignCounters, CampaignStatus, DeliveryLog, DeliveryStatus, OutboxKind, Recipient,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sqlx::Row;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, instrument};

/// Terminal result of one send attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Sent { at: DateTime<Utc> },
    Failed { reason: String },
}

impl DeliveryOutcome {
    pub fn sent_now() -> Self {
        DeliveryOutcome::Sent { at: Utc::now() }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        DeliveryOutcome::Failed {
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecordedDelivery {
    pub log: DeliveryLog,
    pub counters: CampaignCounters,
}

/// Recompute and persist the three cached counters of a campaign.
///
/// Only the latest attempt per (campaign, recipient email) counts, so a resent
/// recipient is never counted twice. Total is the snapshot size.
pub async fn recompute_counters(tx: &mut Tx<'_>, campaign_id: i64) -> Result<CampaignCounters> {
    let row = sqlx::query(
        "WITH latest AS ( \
           SELECT d.status FROM delivery_logs d \
           WHERE d.campaign_id = ?1 AND d.attempt = ( \
             SELECT MAX(d2.attempt) FROM delivery_logs d2 \
             WHERE d2.campaign_id = d.campaign_id AND d2.recipient_email = d.recipient_email) \
         ) \
         UPDATE campaigns SET \
           sent_count = (SELECT COUNT(*) FROM latest WHERE status = 'sent'), \
           failed_count = (SELECT COUNT(*) FROM latest WHERE status = 'failed'), \
           total_recipients = (SELECT COUNT(*) FROM campaign_recipients WHERE campaign_id = ?1), \
           updated_at = ?2 \
         WHERE id = ?1 \
         RETURNING total_recipients, sent_count, failed_count",
    )
    .bind(campaign_id)
    .bind(Utc::now())
    .fetch_optional(&mut **tx)
    .await?;
    let Some(row) = row else {
        return Err(Error::campaign_not_found(campaign_id));
    };
    Ok(CampaignCounters {
        total_recipients: row.try_get("total_recipients")?,
        sent_count: row.try_get("sent_count")?,
        failed_count: row.try_get("failed_count")?,
    })
}

/// Serializes log appends and counter recomputation per campaign.
pub struct DeliveryRecorder {
    pool: Pool,
    locks: DashMap<i64, Arc<Mutex<()>>>,
}

impl DeliveryRecorder {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, campaign_id: i64) -> Arc<Mutex<()>> {
        self.locks
            .entry(campaign_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Append one attempt row and recompute the campaign counters, atomically.
    #[instrument(skip_all, fields(campaign_id = campaign_id, recipient = %recipient.email))]
    pub async fn record(
        &self,
        campaign_id: i64,
        recipient: &Recipient,
        outcome: &DeliveryOutcome,
    ) -> Result<RecordedDelivery> {
        let lock = self.lock_for(campaign_id);
        let _guard = lock.lock().await;

        let (status, reason, sent_at) = match outcome {
            DeliveryOutcome::Sent { at } => (DeliveryStatus::Sent, None, Some(*at)),
            DeliveryOutcome::Failed { reason } => {
                (DeliveryStatus::Failed, Some(reason.as_str()), None)
            }
        };

        let mut tx = self.pool.begin().await?;
        let log =
            db::insert_delivery_log_tx(&mut tx, campaign_id, recipient, status, reason, sent_at)
                .await?;
        let counters = recompute_counters(&mut tx, campaign_id).await?;
        tx.commit().await?;
        Ok(RecordedDelivery { log, counters })
    }

    /// Recompute counters on demand, under the same per-campaign lock.
    #[instrument(skip_all, fields(campaign_id = campaign_id))]
    pub async fn recompute(&self, campaign_id: i64) -> Result<CampaignCounters> {
        let lock = self.lock_for(campaign_id);
        let _guard = lock.lock().await;

        let mut tx = self.pool.begin().await?;
        let counters = recompute_counters(&mut tx, campaign_id).await?;
        tx.commit().await?;
        Ok(counters)
    }

    /// Mark an in_progress campaign completed with final counters and enqueue
    /// its report, in one transaction. Refuses while any snapshot recipient
    /// has no logged outcome.
    #[instrument(skip_all, fields(campaign_id = campaign_id))]
    pub async fn finish(&self, campaign_id: i64) -> Result<CampaignCounters> {
        let lock = self.lock_for(campaign_id);
        let guard = lock.lock().await;

        let mut tx = self.pool.begin().await?;
        let moved = db::set_campaign_status_if_tx(
            &mut tx,
            campaign_id,
            CampaignStatus::InProgress,
            CampaignStatus::Completed,
        )
        .await?;
        if !moved {
            return Err(Error::StateConflict(format!(
                "campaign {campaign_id} is not in_progress"
            )));
        }
        let counters = recompute_counters(&mut tx, campaign_id).await?;
        // Dropping `tx` here rolls the status change back.
        if counters.sent_count + counters.failed_count != counters.total_recipients {
            return Err(Error::StateConflict(format!(
                "campaign {campaign_id} has {} of {} outcomes recorded",
                counters.sent_count + counters.failed_count,
                counters.total_recipients
            )));
        }
        db::enqueue_outbox_tx(&mut tx, OutboxKind::CampaignReport, campaign_id, Utc::now())
            .await?;
        tx.commit().await?;
        drop(guard);

        // A campaign completes once; its lock is not needed any more.
        self.locks.remove(&campaign_id);
        info!(
            campaign_id,
            sent = counters.sent_count,
            failed = counters.failed_count,
            total = counters.total_recipients,
            "campaign completed"
        );
        Ok(counters)
    }
}
