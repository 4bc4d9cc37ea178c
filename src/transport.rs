//! Outgoing mail transports.
//!
//! The dispatch engine and the report worker only see [`MailTransport`];
//! production wires in [`SmtpTransport`], development and dry runs use
//! [`LogTransport`].
use crate::config::{Mail, Smtp, TlsMode, TransportKind};
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("invalid address {0}")]
    InvalidAddress(String),
    #[error("failed to build message: {0}")]
    Build(String),
    #[error("{0}")]
    Rejected(String),
    #[error("transport misconfigured: {0}")]
    Config(String),
    #[error("send timed out after {}s", .0.as_secs_f64())]
    TimedOut(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailAttachment {
    pub filename: String,
    pub content_type: String,
    pub content: Vec<u8>,
}

/// One message to one address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMail {
    pub subject: String,
    pub body: String,
    pub from: String,
    pub to: String,
    pub attachment: Option<MailAttachment>,
}

impl OutgoingMail {
    pub fn new(
        subject: impl Into<String>,
        body: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        Self {
            subject: subject.into(),
            body: body.into(),
            from: from.into(),
            to: to.into(),
            attachment: None,
        }
    }

    pub fn with_attachment(mut self, attachment: MailAttachment) -> Self {
        self.attachment = Some(attachment);
        self
    }
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, mail: &OutgoingMail) -> Result<(), TransportError>;
}

fn parse_mailbox(addr: &str) -> Result<Mailbox, TransportError> {
    addr.parse()
        .map_err(|_| TransportError::InvalidAddress(addr.to_string()))
}

/// Build the lettre message, plain text or multipart/mixed with attachment.
pub fn build_message(mail: &OutgoingMail) -> Result<Message, TransportError> {
    let builder = Message::builder()
        .from(parse_mailbox(&mail.from)?)
        .to(parse_mailbox(&mail.to)?)
        .subject(mail.subject.clone());

    let message = match &mail.attachment {
        None => builder
            .header(ContentType::TEXT_PLAIN)
            .body(mail.body.clone()),
        Some(att) => {
            let content_type = ContentType::parse(&att.content_type)
                .map_err(|e| TransportError::Build(e.to_string()))?;
            builder.multipart(
                MultiPart::mixed()
                    .singlepart(SinglePart::plain(mail.body.clone()))
                    .singlepart(
                        Attachment::new(att.filename.clone())
                            .body(att.content.clone(), content_type),
                    ),
            )
        }
    };
    message.map_err(|e| TransportError::Build(e.to_string()))
}

/// SMTP delivery through lettre's tokio transport.
pub struct SmtpTransport {
    inner: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpTransport {
    pub fn from_config(smtp: &Smtp, timeout: Duration) -> Result<Self, TransportError> {
        let mut builder = match smtp.tls {
            TlsMode::None => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&smtp.host),
            TlsMode::Starttls => {
                let params = TlsParameters::new(smtp.host.clone())
                    .map_err(|e| TransportError::Config(e.to_string()))?;
                AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&smtp.host)
                    .tls(Tls::Required(params))
            }
            TlsMode::Tls => {
                let params = TlsParameters::new(smtp.host.clone())
                    .map_err(|e| TransportError::Config(e.to_string()))?;
                AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&smtp.host)
                    .tls(Tls::Wrapper(params))
            }
        }
        .port(smtp.port)
        .timeout(Some(timeout));

        if let (Some(user), Some(pass)) = (&smtp.username, &smtp.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        Ok(Self {
            inner: builder.build(),
        })
    }
}

#[async_trait]
impl MailTransport for SmtpTransport {
    async fn send(&self, mail: &OutgoingMail) -> Result<(), TransportError> {
        let message = build_message(mail)?;
        self.inner
            .send(message)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Rejected(e.to_string()))
    }
}

/// Logs messages instead of sending them.
#[derive(Debug, Clone, Default)]
pub struct LogTransport;

#[async_trait]
impl MailTransport for LogTransport {
    async fn send(&self, mail: &OutgoingMail) -> Result<(), TransportError> {
        // Same validation path as SMTP so bad addresses still fail.
        build_message(mail)?;
        info!(
            from = %mail.from,
            to = %mail.to,
            subject = %mail.subject,
            attachment = mail.attachment.as_ref().map(|a| a.filename.as_str()),
            "mail logged (not sent)"
        );
        debug!(body = %mail.body, "mail body");
        Ok(())
    }
}

/// Build the transport selected by `mail.transport`.
pub fn from_config(mail: &Mail) -> Result<Arc<dyn MailTransport>, TransportError> {
    match mail.transport {
        TransportKind::Log => Ok(Arc::new(LogTransport)),
        TransportKind::Smtp => {
            let smtp = mail
                .smtp
                .as_ref()
                .ok_or_else(|| TransportError::Config("mail.smtp section missing".into()))?;
            let timeout = Duration::from_secs(mail.send_timeout_secs);
            Ok(Arc::new(SmtpTransport::from_config(smtp, timeout)?))
        }
    }
}
