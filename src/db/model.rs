//! Inputs accepted by repositories.
//!
//! Keep these structs focused on what gets written. Validation lives in
//! higher layers.

use crate::model::CampaignStatus;
use chrono::{DateTime, Utc};

/// A campaign about to be inserted.
#[derive(Debug, Clone)]
pub struct NewCampaign {
    pub name: String,
    pub subject: String,
    pub body: String,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub status: CampaignStatus,
}

/// The user-editable columns of a campaign row, written back as a whole.
#[derive(Debug, Clone)]
pub struct CampaignRow {
    pub name: String,
    pub subject: String,
    pub body: String,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub status: CampaignStatus,
}
