use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Subscribed,
    Unsubscribed,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Subscribed => "subscribed",
            SubscriptionStatus::Unsubscribed => "unsubscribed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "subscribed" => Some(SubscriptionStatus::Subscribed),
            "unsubscribed" => Some(SubscriptionStatus::Unsubscribed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    InProgress,
    Completed,
    Cancelled,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Scheduled => "scheduled",
            CampaignStatus::InProgress => "in_progress",
            CampaignStatus::Completed => "completed",
            CampaignStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(CampaignStatus::Draft),
            "scheduled" => Some(CampaignStatus::Scheduled),
            "in_progress" => Some(CampaignStatus::InProgress),
            "completed" => Some(CampaignStatus::Completed),
            "cancelled" => Some(CampaignStatus::Cancelled),
            _ => None,
        }
    }

    /// Every edge of the campaign state machine, including the ones only the
    /// dispatch engine may take (`scheduled -> in_progress -> completed`).
    pub fn can_transition_to(&self, next: CampaignStatus) -> bool {
        use CampaignStatus::*;
        matches!(
            (self, next),
            (Draft, Scheduled)
                | (Scheduled, Draft)
                | (Draft, Cancelled)
                | (Scheduled, Cancelled)
                | (Scheduled, InProgress)
                | (InProgress, Completed)
        )
    }

    /// Edges reachable from outside the dispatch engine.
    pub fn user_can_transition_to(&self, next: CampaignStatus) -> bool {
        !matches!(next, CampaignStatus::InProgress | CampaignStatus::Completed)
            && self.can_transition_to(next)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CampaignStatus::Completed | CampaignStatus::Cancelled)
    }
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sent,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sent" => Some(DeliveryStatus::Sent),
            "failed" => Some(DeliveryStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OutboxKind {
    CampaignReport,
}

impl OutboxKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxKind::CampaignReport => "campaign_report",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "campaign_report" => Some(OutboxKind::CampaignReport),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Recipient {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub subscription_status: SubscriptionStatus,
    pub created_at: DateTime<Utc>,
}

/// A recipient row staged for insertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRecipient {
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Campaign {
    pub id: i64,
    pub name: String,
    pub subject: String,
    pub body: String,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub status: CampaignStatus,
    pub total_recipients: i64,
    pub sent_count: i64,
    pub failed_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Campaign {
    pub fn counters(&self) -> CampaignCounters {
        CampaignCounters {
            total_recipients: self.total_recipients,
            sent_count: self.sent_count,
            failed_count: self.failed_count,
        }
    }
}

/// The three cached counters on a campaign row.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CampaignCounters {
    pub total_recipients: i64,
    pub sent_count: i64,
    pub failed_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveryLog {
    pub id: i64,
    pub campaign_id: i64,
    pub recipient_id: Option<i64>,
    pub recipient_email: String,
    pub status: DeliveryStatus,
    pub failure_reason: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub attempt: i64,
    pub created_at: DateTime<Utc>,
}

/// Delivery log enriched with the campaign and recipient names for listings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveryLogView {
    #[serde(flatten)]
    pub log: DeliveryLog,
    pub campaign_name: String,
    pub recipient_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxTask {
    pub id: i64,
    pub kind: OutboxKind,
    pub ref_id: i64,
    pub attempt: i32,
    pub due_at: DateTime<Utc>,
}
