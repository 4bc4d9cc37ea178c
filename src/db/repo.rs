use super::model::{CampaignRow, NewCampaign};
use crate::error::{Error, Result};
use crate::model::{
    Campaign, CampaignStatus, DeliveryLog, DeliveryLogView, DeliveryStatus, NewRecipient,
    OutboxKind, OutboxTask, Recipient, SubscriptionStatus,
};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;
use tracing::instrument;

pub type Pool = SqlitePool;
pub type Tx<'a> = Transaction<'a, Sqlite>;

const RECIPIENT_COLUMNS: &str = "id, name, email, subscription_status, created_at";
const CAMPAIGN_COLUMNS: &str = "id, name, subject, body, scheduled_time, status, total_recipients, \
     sent_count, failed_count, created_at, updated_at, started_at, completed_at";
const LOG_COLUMNS: &str = "d.id, d.campaign_id, d.recipient_id, d.recipient_email, d.status, \
     d.failure_reason, d.sent_at, d.attempt, d.created_at";

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    // WAL plus a busy timeout lets concurrent writers queue instead of failing.
    let options = SqliteConnectOptions::from_str(&normalized)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(10));
    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn recipient_from_row(row: &SqliteRow) -> Result<Recipient> {
    let status: String = row.try_get("subscription_status")?;
    Ok(Recipient {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        subscription_status: SubscriptionStatus::parse(&status)
            .ok_or_else(|| Error::Corrupt(format!("unknown subscription status {status}")))?,
        created_at: row.try_get("created_at")?,
    })
}

fn campaign_from_row(row: &SqliteRow) -> Result<Campaign> {
    let status: String = row.try_get("status")?;
    Ok(Campaign {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        subject: row.try_get("subject")?,
        body: row.try_get("body")?,
        scheduled_time: row.try_get("scheduled_time")?,
        status: CampaignStatus::parse(&status)
            .ok_or_else(|| Error::Corrupt(format!("unknown campaign status {status}")))?,
        total_recipients: row.try_get("total_recipients")?,
        sent_count: row.try_get("sent_count")?,
        failed_count: row.try_get("failed_count")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn delivery_log_from_row(row: &SqliteRow) -> Result<DeliveryLog> {
    let status: String = row.try_get("status")?;
    Ok(DeliveryLog {
        id: row.try_get("id")?,
        campaign_id: row.try_get("campaign_id")?,
        recipient_id: row.try_get("recipient_id")?,
        recipient_email: row.try_get("recipient_email")?,
        status: DeliveryStatus::parse(&status)
            .ok_or_else(|| Error::Corrupt(format!("unknown delivery status {status}")))?,
        failure_reason: row.try_get("failure_reason")?,
        sent_at: row.try_get("sent_at")?,
        attempt: row.try_get("attempt")?,
        created_at: row.try_get("created_at")?,
    })
}

// ---------------------------------------------------------------------------
// Recipients
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn insert_recipient(
    pool: &Pool,
    name: &str,
    email: &str,
    status: SubscriptionStatus,
) -> Result<Recipient> {
    let row = sqlx::query(&format!(
        "INSERT INTO recipients (name, email, subscription_status, created_at) \
         VALUES (?, ?, ?, ?) RETURNING {RECIPIENT_COLUMNS}"
    ))
    .bind(name)
    .bind(email)
    .bind(status.as_str())
    .bind(Utc::now())
    .fetch_one(pool)
    .await
    .map_err(|err| {
        if is_unique_violation(&err) {
            Error::Conflict(format!("recipient {email} already exists"))
        } else {
            Error::Database(err)
        }
    })?;
    recipient_from_row(&row)
}

#[instrument(skip_all)]
pub async fn get_recipient(pool: &Pool, id: i64) -> Result<Option<Recipient>> {
    let row = sqlx::query(&format!(
        "SELECT {RECIPIENT_COLUMNS} FROM recipients WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(recipient_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn find_recipient_by_email(pool: &Pool, email: &str) -> Result<Option<Recipient>> {
    let row = sqlx::query(&format!(
        "SELECT {RECIPIENT_COLUMNS} FROM recipients WHERE email = ?"
    ))
    .bind(email)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(recipient_from_row).transpose()
}

/// Newest first.
#[instrument(skip_all)]
pub async fn list_recipients(pool: &Pool) -> Result<Vec<Recipient>> {
    let rows = sqlx::query(&format!(
        "SELECT {RECIPIENT_COLUMNS} FROM recipients ORDER BY id DESC"
    ))
    .fetch_all(pool)
    .await?;
    rows.iter().map(recipient_from_row).collect()
}

#[instrument(skip_all)]
pub async fn set_subscription_status(
    pool: &Pool,
    email: &str,
    status: SubscriptionStatus,
) -> Result<Option<Recipient>> {
    let row = sqlx::query(&format!(
        "UPDATE recipients SET subscription_status = ? WHERE email = ? RETURNING {RECIPIENT_COLUMNS}"
    ))
    .bind(status.as_str())
    .bind(email)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(recipient_from_row).transpose()
}

/// Point-in-time snapshot of every stored email as a dedupe key.
#[instrument(skip_all)]
pub async fn existing_emails(pool: &Pool) -> Result<HashSet<String>> {
    let emails: Vec<String> = sqlx::query_scalar("SELECT email FROM recipients")
        .fetch_all(pool)
        .await?;
    Ok(emails.iter().map(|e| crate::email::dedupe_key(e)).collect())
}

/// Insert every staged recipient as subscribed in one transaction. Rows that
/// collide with the unique email constraint are dropped; returns the indices
/// (into `recipients`) of the dropped rows.
#[instrument(skip_all, fields(staged = recipients.len()))]
pub async fn bulk_insert_recipients(pool: &Pool, recipients: &[NewRecipient]) -> Result<Vec<usize>> {
    if recipients.is_empty() {
        return Ok(Vec::new());
    }
    let now = Utc::now();
    let mut tx = pool.begin().await?;
    let mut dropped = Vec::new();
    for (idx, r) in recipients.iter().enumerate() {
        let res = sqlx::query(
            "INSERT OR IGNORE INTO recipients (name, email, subscription_status, created_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(&r.name)
        .bind(&r.email)
        .bind(SubscriptionStatus::Subscribed.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await?;
        if res.rows_affected() == 0 {
            dropped.push(idx);
        }
    }
    tx.commit().await?;
    Ok(dropped)
}

// ---------------------------------------------------------------------------
// Campaigns
// ---------------------------------------------------------------------------

pub async fn insert_campaign_tx(tx: &mut Tx<'_>, new: &NewCampaign) -> Result<i64> {
    let now = Utc::now();
    let id: i64 = sqlx::query(
        "INSERT INTO campaigns (name, subject, body, scheduled_time, status, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(&new.name)
    .bind(&new.subject)
    .bind(&new.body)
    .bind(new.scheduled_time)
    .bind(new.status.as_str())
    .bind(now)
    .bind(now)
    .fetch_one(&mut **tx)
    .await?
    .get("id");
    Ok(id)
}

/// Link every currently subscribed recipient to the campaign.
pub async fn attach_subscribed_recipients_tx(tx: &mut Tx<'_>, campaign_id: i64) -> Result<u64> {
    let res = sqlx::query(
        "INSERT OR IGNORE INTO campaign_recipients (campaign_id, recipient_id) \
         SELECT ?, id FROM recipients WHERE subscription_status = 'subscribed'",
    )
    .bind(campaign_id)
    .execute(&mut **tx)
    .await?;
    Ok(res.rows_affected())
}

/// Drop snapshot links whose recipient is no longer subscribed.
pub async fn prune_unsubscribed_tx(tx: &mut Tx<'_>, campaign_id: i64) -> Result<u64> {
    let res = sqlx::query(
        "DELETE FROM campaign_recipients WHERE campaign_id = ? AND recipient_id IN \
         (SELECT id FROM recipients WHERE subscription_status <> 'subscribed')",
    )
    .bind(campaign_id)
    .execute(&mut **tx)
    .await?;
    Ok(res.rows_affected())
}

pub async fn campaign_recipients_tx(tx: &mut Tx<'_>, campaign_id: i64) -> Result<Vec<Recipient>> {
    let rows = sqlx::query(
        "SELECT r.id, r.name, r.email, r.subscription_status, r.created_at \
         FROM campaign_recipients cr JOIN recipients r ON r.id = cr.recipient_id \
         WHERE cr.campaign_id = ? ORDER BY r.id",
    )
    .bind(campaign_id)
    .fetch_all(&mut **tx)
    .await?;
    rows.iter().map(recipient_from_row).collect()
}

#[instrument(skip_all)]
pub async fn campaign_recipients(pool: &Pool, campaign_id: i64) -> Result<Vec<Recipient>> {
    let mut tx = pool.begin().await?;
    let recipients = campaign_recipients_tx(&mut tx, campaign_id).await?;
    tx.commit().await?;
    Ok(recipients)
}

pub async fn get_campaign_tx(tx: &mut Tx<'_>, id: i64) -> Result<Option<Campaign>> {
    let row = sqlx::query(&format!(
        "SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(&mut **tx)
    .await?;
    row.as_ref().map(campaign_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn get_campaign(pool: &Pool, id: i64) -> Result<Option<Campaign>> {
    let row = sqlx::query(&format!(
        "SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(campaign_from_row).transpose()
}

/// Newest first.
#[instrument(skip_all)]
pub async fn list_campaigns(pool: &Pool) -> Result<Vec<Campaign>> {
    let rows = sqlx::query(&format!(
        "SELECT {CAMPAIGN_COLUMNS} FROM campaigns ORDER BY id DESC"
    ))
    .fetch_all(pool)
    .await?;
    rows.iter().map(campaign_from_row).collect()
}

/// Overwrite the editable columns, but only while the row still has the
/// status the caller validated against. Returns false if it moved on.
#[instrument(skip_all)]
pub async fn update_campaign_if_status(
    pool: &Pool,
    id: i64,
    expected: CampaignStatus,
    row: &CampaignRow,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE campaigns SET name = ?, subject = ?, body = ?, scheduled_time = ?, status = ?, \
         updated_at = ? WHERE id = ? AND status = ?",
    )
    .bind(&row.name)
    .bind(&row.subject)
    .bind(&row.body)
    .bind(row.scheduled_time)
    .bind(row.status.as_str())
    .bind(Utc::now())
    .bind(id)
    .bind(expected.as_str())
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Compare-and-set on the status column. `started_at` / `completed_at` are
/// stamped when entering in_progress / completed.
pub async fn set_campaign_status_if_tx(
    tx: &mut Tx<'_>,
    id: i64,
    from: CampaignStatus,
    to: CampaignStatus,
) -> Result<bool> {
    let now = Utc::now();
    let res = sqlx::query(
        "UPDATE campaigns SET status = ?, updated_at = ?, \
         started_at = CASE WHEN ? = 'in_progress' THEN ? ELSE started_at END, \
         completed_at = CASE WHEN ? = 'completed' THEN ? ELSE completed_at END \
         WHERE id = ? AND status = ?",
    )
    .bind(to.as_str())
    .bind(now)
    .bind(to.as_str())
    .bind(now)
    .bind(to.as_str())
    .bind(now)
    .bind(id)
    .bind(from.as_str())
    .execute(&mut **tx)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Scheduled campaigns whose time has come, oldest schedule first.
#[instrument(skip_all)]
pub async fn due_campaigns(pool: &Pool, now: DateTime<Utc>) -> Result<Vec<i64>> {
    let ids = sqlx::query_scalar(
        "SELECT id FROM campaigns WHERE status = 'scheduled' AND scheduled_time IS NOT NULL \
         AND datetime(scheduled_time) <= datetime(?) ORDER BY datetime(scheduled_time), id",
    )
    .bind(now)
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

// ---------------------------------------------------------------------------
// Delivery logs
// ---------------------------------------------------------------------------

/// Append one attempt row. The attempt number is derived inside the same
/// statement so it stays monotonic per (campaign, recipient email).
pub async fn insert_delivery_log_tx(
    tx: &mut Tx<'_>,
    campaign_id: i64,
    recipient: &Recipient,
    status: DeliveryStatus,
    failure_reason: Option<&str>,
    sent_at: Option<DateTime<Utc>>,
) -> Result<DeliveryLog> {
    let row = sqlx::query(
        "INSERT INTO delivery_logs \
         (campaign_id, recipient_id, recipient_email, status, failure_reason, sent_at, attempt, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, \
           (SELECT COALESCE(MAX(attempt), 0) + 1 FROM delivery_logs WHERE campaign_id = ? AND recipient_email = ?), ?) \
         RETURNING id, campaign_id, recipient_id, recipient_email, status, failure_reason, sent_at, attempt, created_at",
    )
    .bind(campaign_id)
    .bind(recipient.id)
    .bind(&recipient.email)
    .bind(status.as_str())
    .bind(failure_reason)
    .bind(sent_at)
    .bind(campaign_id)
    .bind(&recipient.email)
    .bind(Utc::now())
    .fetch_one(&mut **tx)
    .await?;
    delivery_log_from_row(&row)
}

/// Every attempt row of a campaign in insertion order.
#[instrument(skip_all)]
pub async fn delivery_logs_for_campaign(pool: &Pool, campaign_id: i64) -> Result<Vec<DeliveryLog>> {
    let rows = sqlx::query(&format!(
        "SELECT {LOG_COLUMNS} FROM delivery_logs d WHERE d.campaign_id = ? ORDER BY d.id"
    ))
    .bind(campaign_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(delivery_log_from_row).collect()
}

/// Read-only listing with campaign and recipient names, optionally filtered.
#[instrument(skip_all)]
pub async fn list_delivery_logs(
    pool: &Pool,
    campaign_id: Option<i64>,
) -> Result<Vec<DeliveryLogView>> {
    let rows = sqlx::query(&format!(
        "SELECT {LOG_COLUMNS}, c.name AS campaign_name, r.name AS recipient_name \
         FROM delivery_logs d \
         JOIN campaigns c ON c.id = d.campaign_id \
         LEFT JOIN recipients r ON r.id = d.recipient_id \
         WHERE (? IS NULL OR d.campaign_id = ?) ORDER BY d.id"
    ))
    .bind(campaign_id)
    .bind(campaign_id)
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|row| {
            Ok(DeliveryLogView {
                log: delivery_log_from_row(row)?,
                campaign_name: row.try_get("campaign_name")?,
                recipient_name: row.try_get("recipient_name")?,
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Outbox
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn enqueue_outbox(
    pool: &Pool,
    kind: OutboxKind,
    ref_id: i64,
    due_at: DateTime<Utc>,
) -> Result<i64> {
    let mut tx = pool.begin().await?;
    let id = enqueue_outbox_tx(&mut tx, kind, ref_id, due_at).await?;
    tx.commit().await?;
    Ok(id)
}

pub async fn enqueue_outbox_tx(
    tx: &mut Tx<'_>,
    kind: OutboxKind,
    ref_id: i64,
    due_at: DateTime<Utc>,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO outbox (kind, ref_id, attempt, due_at) VALUES (?, ?, 0, ?) RETURNING id",
    )
    .bind(kind.as_str())
    .bind(ref_id)
    .bind(due_at)
    .fetch_one(&mut **tx)
    .await?;
    Ok(rec.get("id"))
}

#[instrument(skip_all)]
pub async fn next_due_outbox(pool: &Pool, now: DateTime<Utc>) -> Result<Option<OutboxTask>> {
    let row = sqlx::query(
        "SELECT id, kind, ref_id, attempt, due_at FROM outbox \
         WHERE datetime(due_at) <= datetime(?) ORDER BY datetime(due_at) ASC, id ASC LIMIT 1",
    )
    .bind(now)
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let kind: String = row.try_get("kind")?;
    Ok(Some(OutboxTask {
        id: row.try_get("id")?,
        kind: OutboxKind::parse(&kind)
            .ok_or_else(|| Error::Corrupt(format!("unknown outbox kind {kind}")))?,
        ref_id: row.try_get("ref_id")?,
        attempt: row.try_get("attempt")?,
        due_at: row.try_get("due_at")?,
    }))
}

#[instrument(skip_all)]
pub async fn delete_outbox(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM outbox WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Exponential backoff: 5s * 2^attempt, capped at `max_cap_secs` (no cap when <= 0).
pub fn backoff_secs(attempt: i32, max_cap_secs: i64) -> i64 {
    let secs = 5_i64 * (1_i64 << attempt.clamp(0, 10));
    if max_cap_secs <= 0 {
        secs
    } else {
        secs.min(max_cap_secs)
    }
}

#[instrument(skip_all)]
pub async fn backoff_outbox_with_cap(
    pool: &Pool,
    id: i64,
    attempt: i32,
    max_cap_secs: i64,
) -> Result<()> {
    let due_at = Utc::now() + chrono::Duration::seconds(backoff_secs(attempt, max_cap_secs));
    sqlx::query("UPDATE outbox SET attempt = ?, due_at = ? WHERE id = ?")
        .bind(attempt + 1)
        .bind(due_at)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn count_outbox(pool: &Pool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_urls_pass_through() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(
            prepare_sqlite_url("postgres://localhost/db"),
            "postgres://localhost/db"
        );
    }

    #[test]
    fn file_urls_are_normalized() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("nested").join("campaigns.db");
        let url = format!("sqlite:{}?mode=rwc", path.display());
        let out = prepare_sqlite_url(&url);
        assert_eq!(out, format!("sqlite://{}?mode=rwc", path.display()));
        assert!(td.path().join("nested").exists());
    }

    #[test]
    fn backoff_is_capped() {
        assert_eq!(backoff_secs(0, 600), 5);
        assert_eq!(backoff_secs(3, 600), 40);
        assert_eq!(backoff_secs(10, 600), 600);
        assert_eq!(backoff_secs(20, 0), 5 * 1024);
    }
}
