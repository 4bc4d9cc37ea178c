//! Campaign delivery report: a CSV of every log row mailed to the admin.
use crate::db::{self, Pool};
use crate::error::{Error, Result};
use crate::model::DeliveryLog;
use crate::transport::{MailAttachment, MailTransport, OutgoingMail, TransportError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

pub const REPORT_HEADER: [&str; 3] = ["Recipient", "Status", "Failure Reason"];
const REPORT_BODY: &str = "Please find attached the campaign delivery report.";
const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Render logs as CSV, one row per attempt, empty reason when absent.
pub fn build_report_csv(logs: &[DeliveryLog]) -> Result<Vec<u8>> {
    let mut wtr = csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    wtr.write_record(REPORT_HEADER)?;
    for log in logs {
        wtr.write_record([
            log.recipient_email.as_str(),
            log.status.as_str(),
            log.failure_reason.as_deref().unwrap_or(""),
        ])?;
    }
    wtr.into_inner().map_err(|e| Error::Io(e.into_error()))
}

pub fn report_subject(campaign_name: &str) -> String {
    format!("Campaign Report: {campaign_name}")
}

pub fn report_filename(campaign_name: &str) -> String {
    format!("{campaign_name}_report.csv")
}

#[derive(Clone)]
pub struct Reporter {
    pool: Pool,
    transport: Arc<dyn MailTransport>,
    from_address: String,
    admin_address: String,
    send_timeout: Duration,
}

impl Reporter {
    pub fn new(
        pool: Pool,
        transport: Arc<dyn MailTransport>,
        from_address: impl Into<String>,
        admin_address: impl Into<String>,
    ) -> Self {
        Self {
            pool,
            transport,
            from_address: from_address.into(),
            admin_address: admin_address.into(),
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }

    /// Upper bound on one report send; past it the outbox task backs off.
    pub fn with_send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    #[instrument(skip(self))]
    pub async fn send_report(&self, campaign_id: i64) -> Result<()> {
        let campaign = db::get_campaign(&self.pool, campaign_id)
            .await?
            .ok_or_else(|| Error::campaign_not_found(campaign_id))?;
        let logs = db::delivery_logs_for_campaign(&self.pool, campaign_id).await?;
        let csv = build_report_csv(&logs)?;

        let mail = OutgoingMail::new(
            report_subject(&campaign.name),
            REPORT_BODY,
            self.from_address.clone(),
            self.admin_address.clone(),
        )
        .with_attachment(MailAttachment {
            filename: report_filename(&campaign.name),
            content_type: "text/csv".into(),
            content: csv,
        });
        tokio::time::timeout(self.send_timeout, self.transport.send(&mail))
            .await
            .map_err(|_| TransportError::TimedOut(self.send_timeout))??;
        info!(rows = logs.len(), to = %self.admin_address, "campaign report sent");
        Ok(())
    }
}
