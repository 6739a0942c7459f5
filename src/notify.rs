use crate::config::NotifyConfig;
use crate::error::NotifyError;
use futures::future::{self, BoxFuture, FutureExt};
use lettre::message::header::{ContentTransferEncoding, ContentType};
use lettre::message::Mailbox;
use lettre::transport::smtp::extension::ClientId;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

pub const STATUS_COMPLETED: &str = "COMPLETED";
pub const STATUS_FAILED: &str = "FAILED";

const SMTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub address: String,
    pub status: String,
    pub job_url: String,
    pub job_id: i64,
}

impl Notification {
    pub fn subject(&self) -> String {
        format!("[DENSSWeb] Job {} - {}", self.job_id, self.status)
    }

    pub fn body(&self) -> String {
        format!(
            "DENSSWeb Job {}\r\n\r\nStatus: {}\r\n\r\nTo view your job please visit the following URL:\r\n\r\n    {}\r\n\r\nCheers!\r\n",
            self.job_id, self.status, self.job_url
        )
    }
}

/// Tells a submitter their job finished. Callers only log failures.
pub trait Notifier: Send + Sync {
    fn notify<'a>(&'a self, notification: &'a Notification) -> BoxFuture<'a, Result<(), NotifyError>>;
}

/// Used when notifications are turned off: records the attempt and succeeds.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify<'a>(&'a self, notification: &'a Notification) -> BoxFuture<'a, Result<(), NotifyError>> {
        info!(
            job_id = notification.job_id,
            status = %notification.status,
            "Attempting to send email but notifications are turned off"
        );
        future::ready(Ok(())).boxed()
    }
}

/// Plain-text mail through the configured SMTP relay.
pub struct SmtpNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpNotifier {
    pub fn new(config: &NotifyConfig) -> Result<Self, NotifyError> {
        if config.email_from.trim().is_empty() {
            return Err(NotifyError::Config(
                "invalid from address, configure email_from before sending email".into(),
            ));
        }
        let from: Mailbox = config.email_from.parse()?;

        // Plain connection to a trusted local relay, no TLS.
        let transport = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(config.smtp_host.as_str())
            .port(config.smtp_port)
            .hello_name(ClientId::Domain("localhost".into()))
            .timeout(Some(SMTP_TIMEOUT))
            .build();

        Ok(SmtpNotifier { transport, from })
    }

    /// Builds the mail. The recipient must be a bare address, so anything
    /// carrying line breaks or extra header text is rejected here.
    pub fn message(&self, notification: &Notification) -> Result<Message, NotifyError> {
        let to = Mailbox::new(None, notification.address.parse::<Address>()?);

        let message = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(notification.subject())
            .date_now()
            .header(ContentType::TEXT_PLAIN)
            .header(ContentTransferEncoding::QuotedPrintable)
            .body(notification.body())?;
        Ok(message)
    }

    #[instrument(skip_all, fields(job_id = notification.job_id, email = %notification.address))]
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let message = self.message(notification)?;
        info!("Sending email");
        self.transport.send(message).await?;
        Ok(())
    }
}

impl Notifier for SmtpNotifier {
    fn notify<'a>(&'a self, notification: &'a Notification) -> BoxFuture<'a, Result<(), NotifyError>> {
        self.send(notification).boxed()
    }
}

/// Notifier matching the configuration: SMTP when enabled, log-only otherwise.
pub fn from_config(config: &NotifyConfig) -> Result<Arc<dyn Notifier>, NotifyError> {
    if config.enabled {
        Ok(Arc::new(SmtpNotifier::new(config)?))
    } else {
        Ok(Arc::new(LogNotifier))
    }
}
