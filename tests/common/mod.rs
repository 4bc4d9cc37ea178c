#![allow(dead_code)]

use async_trait::async_trait;
use mail_campaign::campaign::{self, CreateCampaign};
use mail_campaign::db::{self, Pool};
use mail_campaign::dispatch::{DispatchSettings, Dispatcher};
use mail_campaign::model::{Campaign, CampaignStatus, Recipient};
use mail_campaign::recipients;
use mail_campaign::recorder::DeliveryRecorder;
use mail_campaign::transport::{MailTransport, OutgoingMail, TransportError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Mutex;

/// File-backed database so every pooled connection sees the same data.
pub async fn setup_pool() -> (TempDir, Pool) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}/test.db", dir.path().display());
    let pool = db::init_pool(&url).await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    (dir, pool)
}

#[derive(Clone, Default)]
pub struct RecordingTransport {
    sent: Arc<Mutex<Vec<OutgoingMail>>>,
    failures: Arc<Mutex<HashMap<String, String>>>,
    delay: Option<Duration>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    /// Every send to `to` fails with `reason`.
    pub async fn fail_for(&self, to: &str, reason: &str) {
        self.failures
            .lock()
            .await
            .insert(to.to_string(), reason.to_string());
    }

    pub async fn clear_failures(&self) {
        self.failures.lock().await.clear();
    }

    pub async fn sent(&self) -> Vec<OutgoingMail> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl MailTransport for RecordingTransport {
    async fn send(&self, mail: &OutgoingMail) -> Result<(), TransportError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(reason) = self.failures.lock().await.get(&mail.to) {
            return Err(TransportError::Rejected(reason.clone()));
        }
        self.sent.lock().await.push(mail.clone());
        Ok(())
    }
}

pub fn settings() -> DispatchSettings {
    DispatchSettings {
        from_address: "no-reply@company.com".into(),
        fallback_name: "Subscriber".into(),
        send_timeout: Duration::from_secs(5),
        concurrency: 4,
    }
}

pub fn dispatcher(pool: &Pool, transport: RecordingTransport, settings: DispatchSettings) -> Dispatcher {
    Dispatcher::new(
        pool.clone(),
        Arc::new(transport),
        Arc::new(DeliveryRecorder::new(pool.clone())),
        settings,
    )
}

pub async fn add(pool: &Pool, name: &str, email: &str) -> Recipient {
    recipients::add_recipient(pool, name, email).await.unwrap()
}

/// A campaign scheduled a minute in the past, so it is already due.
pub async fn due_campaign(pool: &Pool, name: &str, body: &str) -> Campaign {
    campaign::create_campaign(
        pool,
        CreateCampaign {
            name: name.into(),
            subject: format!("{name} subject"),
            body: body.into(),
            scheduled_time: Some(chrono::Utc::now() - chrono::Duration::minutes(1)),
            status: Some(CampaignStatus::Scheduled),
        },
    )
    .await
    .unwrap()
}
