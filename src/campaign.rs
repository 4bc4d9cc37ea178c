//! Campaign lifecycle outside of dispatch: create, edit, schedule, cancel.
//!
//! `in_progress` and `completed` are owned by [`crate::dispatch`]; nothing
//! here can move a campaign into or out of them.
use crate::db::{self, CampaignRow, NewCampaign, Pool};
use crate::error::{Error, Result};
use crate::model::{Campaign, CampaignStatus};
use crate::recorder;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{info, instrument};

const FIELDS_REQUIRED: &str = "All fields are required.";
const SCHEDULE_NEEDS_TIME: &str = "Scheduled campaigns must include a scheduled_time.";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateCampaign {
    pub name: String,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub scheduled_time: Option<DateTime<Utc>>,
    /// Defaults to draft.
    #[serde(default)]
    pub status: Option<CampaignStatus>,
}

/// Partial edit. `None` keeps the stored value; `scheduled_time` can only be
/// set, not cleared, since a scheduled campaign must keep one.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CampaignUpdate {
    pub name: Option<String>,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub status: Option<CampaignStatus>,
}

fn require_text(value: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(Error::Validation(FIELDS_REQUIRED.into()));
    }
    Ok(trimmed.to_string())
}

/// Create a draft or scheduled campaign and snapshot every subscribed
/// recipient into it.
#[instrument(skip_all, fields(name = %input.name))]
pub async fn create_campaign(pool: &Pool, input: CreateCampaign) -> Result<Campaign> {
    let name = require_text(&input.name)?;
    let subject = require_text(&input.subject)?;
    if input.body.trim().is_empty() {
        return Err(Error::Validation(FIELDS_REQUIRED.into()));
    }
    let status = input.status.unwrap_or(CampaignStatus::Draft);
    match status {
        CampaignStatus::Draft => {}
        CampaignStatus::Scheduled if input.scheduled_time.is_none() => {
            return Err(Error::StateConflict(SCHEDULE_NEEDS_TIME.into()));
        }
        CampaignStatus::Scheduled => {}
        other => {
            return Err(Error::StateConflict(format!(
                "campaigns cannot be created as {other}"
            )));
        }
    }

    let new = NewCampaign {
        name,
        subject,
        body: input.body,
        scheduled_time: input.scheduled_time,
        status,
    };
    let mut tx = pool.begin().await?;
    let id = db::insert_campaign_tx(&mut tx, &new).await?;
    db::attach_subscribed_recipients_tx(&mut tx, id).await?;
    let counters = recorder::recompute_counters(&mut tx, id).await?;
    let campaign = db::get_campaign_tx(&mut tx, id)
        .await?
        .ok_or_else(|| Error::campaign_not_found(id))?;
    tx.commit().await?;

    info!(
        campaign_id = id,
        status = %campaign.status,
        recipients = counters.total_recipients,
        "campaign created"
    );
    Ok(campaign)
}

#[instrument(skip_all, fields(campaign_id = id))]
pub async fn update_campaign(pool: &Pool, id: i64, update: CampaignUpdate) -> Result<Campaign> {
    let current = get_campaign(pool, id).await?;
    if !matches!(
        current.status,
        CampaignStatus::Draft | CampaignStatus::Scheduled
    ) {
        return Err(Error::StateConflict(format!(
            "campaign {id} is {} and can no longer be edited",
            current.status
        )));
    }

    let status = update.status.unwrap_or(current.status);
    if status != current.status && !current.status.user_can_transition_to(status) {
        return Err(Error::StateConflict(format!(
            "cannot move campaign {id} from {} to {status}",
            current.status
        )));
    }
    let scheduled_time = update.scheduled_time.or(current.scheduled_time);
    if status == CampaignStatus::Scheduled && scheduled_time.is_none() {
        return Err(Error::StateConflict(SCHEDULE_NEEDS_TIME.into()));
    }

    let body = match update.body {
        Some(body) if body.trim().is_empty() => {
            return Err(Error::Validation(FIELDS_REQUIRED.into()))
        }
        Some(body) => body,
        None => current.body,
    };
    let row = CampaignRow {
        name: update
            .name
            .as_deref()
            .map(require_text)
            .transpose()?
            .unwrap_or(current.name),
        subject: update
            .subject
            .as_deref()
            .map(require_text)
            .transpose()?
            .unwrap_or(current.subject),
        body,
        scheduled_time,
        status,
    };

    if !db::update_campaign_if_status(pool, id, current.status, &row).await? {
        return Err(Error::StateConflict(format!(
            "campaign {id} changed status while being edited"
        )));
    }
    if status != current.status {
        info!(from = %current.status, to = %status, "campaign status changed");
    }
    get_campaign(pool, id).await
}

/// Move a draft to scheduled, optionally setting the time in the same write.
pub async fn schedule_campaign(
    pool: &Pool,
    id: i64,
    at: Option<DateTime<Utc>>,
) -> Result<Campaign> {
    update_campaign(
        pool,
        id,
        CampaignUpdate {
            scheduled_time: at,
            status: Some(CampaignStatus::Scheduled),
            ..Default::default()
        },
    )
    .await
}

pub async fn cancel_campaign(pool: &Pool, id: i64) -> Result<Campaign> {
    update_campaign(
        pool,
        id,
        CampaignUpdate {
            status: Some(CampaignStatus::Cancelled),
            ..Default::default()
        },
    )
    .await
}

pub async fn get_campaign(pool: &Pool, id: i64) -> Result<Campaign> {
    db::get_campaign(pool, id)
        .await?
        .ok_or_else(|| Error::campaign_not_found(id))
}

pub async fn list_campaigns(pool: &Pool) -> Result<Vec<Campaign>> {
    db::list_campaigns(pool).await
}
