//! Aggregate campaign statistics.
use crate::db::{self, Pool};
use crate::error::Result;
use serde::Serialize;
use tracing::instrument;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Totals {
    pub total_campaigns: i64,
    pub total_emails_sent: i64,
    pub total_failed: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CampaignStats {
    pub id: i64,
    pub name: String,
    pub sent_count: i64,
    pub failed_count: i64,
    pub success_rate: Option<f64>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Summary {
    pub summary: Totals,
    pub campaigns: Vec<CampaignStats>,
}

/// `(sent - failed) * 100 / sent`, kept for compatibility with existing
/// dashboards. `None` when nothing was sent.
pub fn success_rate(sent_count: i64, failed_count: i64) -> Option<f64> {
    if sent_count == 0 {
        return None;
    }
    Some((sent_count - failed_count) as f64 * 100.0 / sent_count as f64)
}

#[instrument(skip_all)]
pub async fn summary(pool: &Pool) -> Result<Summary> {
    let campaigns = db::list_campaigns(pool).await?;
    let totals = Totals {
        total_campaigns: campaigns.len() as i64,
        total_emails_sent: campaigns.iter().map(|c| c.sent_count).sum(),
        total_failed: campaigns.iter().map(|c| c.failed_count).sum(),
    };
    let campaigns = campaigns
        .into_iter()
        .map(|c| CampaignStats {
            success_rate: success_rate(c.sent_count, c.failed_count),
            id: c.id,
            name: c.name,
            sent_count: c.sent_count,
            failed_count: c.failed_count,
        })
        .collect();
    Ok(Summary {
        summary: totals,
        campaigns,
    })
}
