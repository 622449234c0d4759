//! Outgoing mail: OTP codes, password reset tokens and order confirmations.

use std::sync::Mutex;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::info;

use crate::model::{Day, Order};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug)]
pub enum MailError {
    Address(String),
    Build(String),
    Transport(String),
}

impl std::fmt::Display for MailError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MailError::Address(e) => write!(f, "bad mail address: {e}"),
            MailError::Build(e) => write!(f, "cannot build message: {e}"),
            MailError::Transport(e) => write!(f, "SMTP error: {e}"),
        }
    }
}

impl std::error::Error for MailError {}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, mail: &Mail) -> Result<(), MailError>;
}

/// Delivers through an SMTP relay with STARTTLS/TLS.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn new(host: &str, user: &str, password: &str, from: &str) -> Result<Self, MailError> {
        let from: Mailbox = from.parse().map_err(|e| MailError::Address(format!("{e}")))?;
        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(host)
            .map_err(|e| MailError::Transport(e.to_string()))?
            .credentials(Credentials::new(user.to_string(), password.to_string()))
            .build();
        Ok(Self { transport, from })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, mail: &Mail) -> Result<(), MailError> {
        let to: Mailbox = mail.to.parse().map_err(|e| MailError::Address(format!("{e}")))?;
        let message = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(mail.subject.clone())
            .header(ContentType::TEXT_PLAIN)
            .body(mail.body.clone())
            .map_err(|e| MailError::Build(e.to_string()))?;
        self.transport
            .send(message)
            .await
            .map_err(|e| MailError::Transport(e.to_string()))?;
        Ok(())
    }
}

/// Writes mail to the log instead of sending it. Used when no SMTP host is configured.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, mail: &Mail) -> Result<(), MailError> {
        info!(to = %mail.to, subject = %mail.subject, "mail (not sent): {}", mail.body);
        Ok(())
    }
}

/// Keeps every mail in memory so callers can read back OTPs and tokens.
#[derive(Default)]
pub struct MemoryMailer {
    outbox: Mutex<Vec<Mail>>,
}

impl MemoryMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Mail> {
        self.outbox.lock().map(|o| o.clone()).unwrap_or_default()
    }

    /// The most recent mail to `to`, if any.
    pub fn last_to(&self, to: &str) -> Option<Mail> {
        self.sent().into_iter().rev().find(|m| m.to == to)
    }
}

#[async_trait]
impl Mailer for MemoryMailer {
    async fn send(&self, mail: &Mail) -> Result<(), MailError> {
        self.outbox
            .lock()
            .map_err(|e| MailError::Transport(e.to_string()))?
            .push(mail.clone());
        Ok(())
    }
}

// ── Messages ─────────────────────────────────────────────────────

pub fn otp_mail(to: &str, otp: &str) -> Mail {
    Mail {
        to: to.to_string(),
        subject: "Verify your account".into(),
        body: format!("To verify your account, enter this OTP code: {otp}. It is valid for 24 hours."),
    }
}

pub fn reset_mail(to: &str, token: &str) -> Mail {
    Mail {
        to: to.to_string(),
        subject: "Reset your password".into(),
        body: format!(
            "Use this token to choose a new password: {token}. It expires in one hour. \
             If you did not ask for a reset, ignore this message."
        ),
    }
}

pub struct CompletedStay<'a> {
    pub user_name: &'a str,
    pub property_name: &'a str,
    pub room_type: &'a str,
}

pub fn order_complete_mail(to: &str, order: &Order, stay: &CompletedStay<'_>) -> Mail {
    let last_night: Day = order.end_date.pred_opt().unwrap_or(order.end_date);
    Mail {
        to: to.to_string(),
        subject: format!("Booking {} confirmed", order.invoice_id),
        body: format!(
            "Hi {},\n\nYour payment has been accepted.\n\n\
             Invoice: {}\nProperty: {}\nRoom: {}\nCheck-in: {}\nLast night: {}\nCheck-out: {}\nTotal: {}\n",
            stay.user_name,
            order.invoice_id,
            stay.property_name,
            stay.room_type,
            order.start_date,
            last_night,
            order.end_date,
            order.total_price,
        ),
    }
}
