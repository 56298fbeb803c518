//! SMTP delivery for the notifier stage.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use thiserror::Error;
use tracing::debug;

use crate::models::failure::StageFailure;
use crate::stages::notifier::{Invitation, Mailer};

#[derive(Debug, Error)]
pub enum MailerError {
    #[error("invalid sender address {address}: {source}")]
    Sender {
        address: String,
        #[source]
        source: lettre::address::AddressError,
    },

    #[error("SMTP setup failed: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
}

#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub server: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub from: String,
    pub company: String,
}

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn new(settings: &SmtpSettings) -> Result<Self, MailerError> {
        let address: Address = settings
            .from
            .parse()
            .map_err(|source| MailerError::Sender {
                address: settings.from.clone(),
                source,
            })?;

        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.server)?
            .port(settings.port)
            .credentials(Credentials::new(
                settings.user.clone(),
                settings.password.clone(),
            ))
            .build();

        Ok(Self {
            transport,
            from: Mailbox::new(Some(settings.company.clone()), address),
        })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, invitation: &Invitation) -> Result<(), StageFailure> {
        let to: Address = invitation.to.parse().map_err(|e| {
            StageFailure::permanent(format!("invalid recipient {}: {e}", invitation.to))
        })?;

        let message = Message::builder()
            .from(self.from.clone())
            .to(Mailbox::new(Some(invitation.to_name.clone()), to))
            .subject(invitation.subject.clone())
            .header(ContentType::TEXT_PLAIN)
            .body(invitation.body.clone())
            .map_err(|e| StageFailure::permanent(format!("cannot build message: {e}")))?;

        let response = self.transport.send(message).await.map_err(|e| {
            let detail = format!("SMTP delivery to {} failed: {e}", invitation.to);
            if e.is_permanent() {
                StageFailure::permanent(detail)
            } else {
                StageFailure::transient(detail)
            }
        })?;
        debug!("SMTP accepted invitation for {}: {:?}", invitation.to, response.code());
        Ok(())
    }
}
