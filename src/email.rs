//! Outbound email over SMTP.

use async_trait::async_trait;
use lettre::message::Message;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{SmtpTransport, Transport};
use secrecy::ExposeSecret;

use crate::config::EmailConfig;
use crate::error::ActionError;

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), ActionError>;
}

/// SMTP relay sender. lettre's transport is blocking, so sends run on the
/// blocking pool.
#[derive(Clone)]
pub struct SmtpEmailSender {
    config: EmailConfig,
}

impl SmtpEmailSender {
    pub fn new(config: EmailConfig) -> Self {
        Self { config }
    }

    fn build_message(&self, to: &str, subject: &str, body: &str) -> Result<Message, ActionError> {
        Message::builder()
            .from(
                self.config
                    .from_address
                    .parse()
                    .map_err(|e| ActionError::Email(format!("Invalid from address: {e}")))?,
            )
            .to(to
                .parse()
                .map_err(|e| ActionError::Email(format!("Invalid to address: {e}")))?)
            .subject(subject)
            .body(body.to_string())
            .map_err(|e| ActionError::Email(format!("Failed to build email: {e}")))
    }

    fn send_blocking(config: &EmailConfig, email: &Message) -> Result<(), ActionError> {
        let creds = Credentials::new(
            config.username.clone(),
            config.password.expose_secret().to_string(),
        );

        let transport = SmtpTransport::relay(&config.smtp_host)
            .map_err(|e| ActionError::Email(format!("SMTP relay error: {e}")))?
            .port(config.smtp_port)
            .credentials(creds)
            .build();

        transport
            .send(email)
            .map_err(|e| ActionError::Email(format!("SMTP send failed: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl EmailSender for SmtpEmailSender {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), ActionError> {
        let email = self.build_message(to, subject, body)?;
        let config = self.config.clone();

        tokio::task::spawn_blocking(move || Self::send_blocking(&config, &email))
            .await
            .map_err(|e| ActionError::Email(format!("send task failed: {e}")))??;

        tracing::info!("Email sent to {to}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    fn sender() -> SmtpEmailSender {
        SmtpEmailSender::new(EmailConfig {
            smtp_host: "smtp.example.test".into(),
            smtp_port: 587,
            username: "bot".into(),
            password: SecretString::from("pw"),
            from_address: "bot@example.test".into(),
        })
    }

    #[test]
    fn builds_valid_message() {
        assert!(sender().build_message("ana@example.test", "Hola", "cuerpo").is_ok());
    }

    #[tokio::test]
    async fn invalid_recipient_is_rejected_before_sending() {
        let err = sender().send("not an address", "Hola", "cuerpo").await.unwrap_err();
        assert!(err.to_string().contains("Invalid to address"));
    }
}
