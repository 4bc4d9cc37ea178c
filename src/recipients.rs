//! Single-recipient management. Bulk loading lives in [`crate::ingest`].
use crate::db::{self, Pool};
use crate::email::is_valid_email;
use crate::error::{Error, Result};
use crate::model::{Recipient, SubscriptionStatus};
use tracing::{info, instrument};

/// Add one subscribed recipient. The name may be empty; the body template
/// falls back to the configured default for it.
#[instrument(skip_all)]
pub async fn add_recipient(pool: &Pool, name: &str, email: &str) -> Result<Recipient> {
    let email = email.trim();
    if email.is_empty() || !is_valid_email(email) {
        return Err(Error::Validation("Invalid email format".into()));
    }
    let recipient =
        db::insert_recipient(pool, name.trim(), email, SubscriptionStatus::Subscribed).await?;
    info!(recipient_id = recipient.id, "recipient added");
    Ok(recipient)
}

#[instrument(skip_all, fields(status = status.as_str()))]
pub async fn set_subscription(
    pool: &Pool,
    email: &str,
    status: SubscriptionStatus,
) -> Result<Recipient> {
    let email = email.trim();
    db::set_subscription_status(pool, email, status)
        .await?
        .ok_or_else(|| Error::recipient_not_found(email))
}

pub async fn get_recipient(pool: &Pool, id: i64) -> Result<Recipient> {
    db::get_recipient(pool, id)
        .await?
        .ok_or_else(|| Error::recipient_not_found(id))
}

pub async fn find_recipient(pool: &Pool, email: &str) -> Result<Recipient> {
    db::find_recipient_by_email(pool, email.trim())
        .await?
        .ok_or_else(|| Error::recipient_not_found(email))
}

pub async fn list_recipients(pool: &Pool) -> Result<Vec<Recipient>> {
    db::list_recipients(pool).await
}
