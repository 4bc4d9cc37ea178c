//! Campaign Dispatch Engine.
//!
//! `execute` drives one campaign from `scheduled` through `in_progress` to
//! `completed`. The `scheduled -> in_progress` edge is a compare-and-set in
//! the database, which makes duplicate triggers (scheduler instances, manual
//! calls) no-ops instead of second runs.
use crate::config::Config;
use crate::db::{self, Pool};
use crate::error::{Error, Result};
use crate::model::{Campaign, CampaignCounters, CampaignStatus, Recipient};
use crate::recorder::{self, DeliveryOutcome, DeliveryRecorder};
use crate::template::{BodyTemplate, TemplateError};
use crate::transport::{MailTransport, OutgoingMail, TransportError};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

const RECORD_ATTEMPTS: u32 = 3;
const RECORD_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub from_address: String,
    pub fallback_name: String,
    pub send_timeout: Duration,
    /// Width of the per-campaign worker pool; 1 sends strictly in sequence.
    pub concurrency: usize,
}

impl DispatchSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            from_address: cfg.mail.from_address.clone(),
            fallback_name: cfg.dispatch.fallback_name.clone(),
            send_timeout: cfg.send_timeout(),
            concurrency: cfg.dispatch.concurrency,
        }
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            from_address: "no-reply@company.com".into(),
            fallback_name: "Subscriber".into(),
            send_timeout: Duration::from_secs(30),
            concurrency: 4,
        }
    }
}

/// One recipient that did not get the message, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendFailure {
    pub recipient_id: i64,
    pub email: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchSummary {
    pub campaign_id: i64,
    pub counters: CampaignCounters,
    pub failures: Vec<SendFailure>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// The campaign was not `scheduled` when the trigger arrived.
    Skipped { status: CampaignStatus },
    Completed(DispatchSummary),
}

/// Where one recipient ended up after a run.
enum Settled {
    Recorded(Option<SendFailure>),
    /// Sent or failed, but the outcome never reached the log.
    Unrecorded(String),
}

pub struct Dispatcher {
    pool: Pool,
    transport: Arc<dyn MailTransport>,
    recorder: Arc<DeliveryRecorder>,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(
        pool: Pool,
        transport: Arc<dyn MailTransport>,
        recorder: Arc<DeliveryRecorder>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            pool,
            transport,
            recorder,
            settings,
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn recorder(&self) -> &Arc<DeliveryRecorder> {
        &self.recorder
    }

    #[instrument(skip(self))]
    pub async fn execute(&self, campaign_id: i64) -> Result<DispatchOutcome> {
        let campaign = db::get_campaign(&self.pool, campaign_id)
            .await?
            .ok_or_else(|| Error::campaign_not_found(campaign_id))?;
        if campaign.status != CampaignStatus::Scheduled {
            info!(status = %campaign.status, "campaign not scheduled; trigger ignored");
            return Ok(DispatchOutcome::Skipped {
                status: campaign.status,
            });
        }

        let Some(recipients) = self.activate(campaign_id).await? else {
            let status = db::get_campaign(&self.pool, campaign_id)
                .await?
                .map(|c| c.status)
                .unwrap_or(campaign.status);
            info!(status = %status, "campaign claimed by another trigger");
            return Ok(DispatchOutcome::Skipped { status });
        };
        info!(recipients = recipients.len(), "campaign in progress");

        let template = BodyTemplate::compile(&campaign.body, &self.settings.fallback_name);
        if let Err(err) = &template {
            warn!(%err, "campaign body does not compile; every delivery will fail");
        }
        let template = template.as_ref();

        let settled: Vec<Settled> = stream::iter(recipients)
            .map(|recipient| {
                let campaign = &campaign;
                async move { self.deliver(campaign, template, &recipient).await }
            })
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;

        let mut failures = Vec::new();
        let mut unrecorded = Vec::new();
        for s in settled {
            match s {
                Settled::Recorded(None) => {}
                Settled::Recorded(Some(failure)) => failures.push(failure),
                Settled::Unrecorded(email) => unrecorded.push(email),
            }
        }
        if !unrecorded.is_empty() {
            error!(
                unrecorded = ?unrecorded,
                "delivery outcomes missing from the log; campaign left in_progress"
            );
            return Err(Error::Unrecorded {
                campaign_id,
                emails: unrecorded,
            });
        }

        let counters = self.recorder.finish(campaign_id).await?;
        Ok(DispatchOutcome::Completed(DispatchSummary {
            campaign_id,
            counters,
            failures,
        }))
    }

    /// Claim the campaign and freeze its recipient snapshot. Returns `None`
    /// if another trigger moved it out of `scheduled` first.
    async fn activate(&self, campaign_id: i64) -> Result<Option<Vec<Recipient>>> {
        let mut tx = self.pool.begin().await?;
        let claimed = db::set_campaign_status_if_tx(
            &mut tx,
            campaign_id,
            CampaignStatus::Scheduled,
            CampaignStatus::InProgress,
        )
        .await?;
        if !claimed {
            return Ok(None);
        }
        let pruned = db::prune_unsubscribed_tx(&mut tx, campaign_id).await?;
        if pruned > 0 {
            info!(pruned, "dropped recipients unsubscribed since creation");
        }
        recorder::recompute_counters(&mut tx, campaign_id).await?;
        let recipients = db::campaign_recipients_tx(&mut tx, campaign_id).await?;
        tx.commit().await?;
        Ok(Some(recipients))
    }

    /// Render, send and record for one recipient. A send failure is a value;
    /// only a log write that keeps failing surfaces as `Unrecorded`.
    async fn deliver(
        &self,
        campaign: &Campaign,
        template: std::result::Result<&BodyTemplate, &TemplateError>,
        recipient: &Recipient,
    ) -> Settled {
        let rendered = template
            .map_err(TemplateError::clone)
            .and_then(|t| t.render(recipient));
        let outcome = match rendered {
            Ok(body) => self.send(campaign, recipient, body).await,
            Err(err) => DeliveryOutcome::failed(err.to_string()),
        };

        if let DeliveryOutcome::Failed { reason } = &outcome {
            warn!(
                campaign_id = campaign.id,
                recipient = %recipient.email,
                %reason,
                "failed to send campaign email"
            );
        }

        if !self.record_with_retry(campaign.id, recipient, &outcome).await {
            return Settled::Unrecorded(recipient.email.clone());
        }

        Settled::Recorded(match outcome {
            DeliveryOutcome::Sent { .. } => None,
            DeliveryOutcome::Failed { reason } => Some(SendFailure {
                recipient_id: recipient.id,
                email: recipient.email.clone(),
                reason,
            }),
        })
    }

    /// Each attempt is one transaction, so retrying cannot duplicate a row.
    async fn record_with_retry(
        &self,
        campaign_id: i64,
        recipient: &Recipient,
        outcome: &DeliveryOutcome,
    ) -> bool {
        for attempt in 1..=RECORD_ATTEMPTS {
            match self.recorder.record(campaign_id, recipient, outcome).await {
                Ok(_) => return true,
                Err(err) => {
                    error!(
                        ?err,
                        campaign_id,
                        recipient = %recipient.email,
                        attempt,
                        "failed to record delivery outcome"
                    );
                    if attempt < RECORD_ATTEMPTS {
                        tokio::time::sleep(RECORD_RETRY_DELAY * attempt).await;
                    }
                }
            }
        }
        false
    }

    async fn send(&self, campaign: &Campaign, recipient: &Recipient, body: String) -> DeliveryOutcome {
        let mail = OutgoingMail::new(
            campaign.subject.clone(),
            body,
            self.settings.from_address.clone(),
            recipient.email.clone(),
        );
        match tokio::time::timeout(self.settings.send_timeout, self.transport.send(&mail)).await {
            Ok(Ok(())) => DeliveryOutcome::sent_now(),
            Ok(Err(err)) => DeliveryOutcome::failed(err.to_string()),
            Err(_) => {
                let timed_out = TransportError::TimedOut(self.settings.send_timeout);
                DeliveryOutcome::failed(timed_out.to_string())
            }
        }
    }
}
