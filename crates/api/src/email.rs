//! Account emails: address verification and password reset

use std::sync::Arc;
use std::time::Duration;
use tutorly_shared::email::{render_email, send_with_timeout, Context};
use tutorly_shared::{EmailError, Mailer, OutboundEmail};

pub const VERIFY_SUBJECT: &str = "Verify Your Tutorly Email Address";
pub const RESET_SUBJECT: &str = "Reset Your Tutorly Password";

const SEND_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Clone)]
pub struct AccountEmailService {
    mailer: Arc<dyn Mailer>,
}

impl AccountEmailService {
    pub fn new(mailer: Arc<dyn Mailer>) -> Self {
        Self { mailer }
    }

    pub async fn send_verification(
        &self,
        to: &str,
        name: &str,
        verification_url: &str,
    ) -> Result<(), EmailError> {
        let mut context = Context::new();
        context.insert("name", name);
        context.insert("verification_url", verification_url);

        let html = render_email("emails/verify_email.html", &context)?;
        self.send(to, VERIFY_SUBJECT, html).await
    }

    pub async fn send_password_reset(
        &self,
        to: &str,
        name: &str,
        reset_url: &str,
    ) -> Result<(), EmailError> {
        let mut context = Context::new();
        context.insert("name", name);
        context.insert("reset_url", reset_url);

        let html = render_email("emails/reset_password.html", &context)?;
        self.send(to, RESET_SUBJECT, html).await
    }

    async fn send(&self, to: &str, subject: &str, html: String) -> Result<(), EmailError> {
        send_with_timeout(
            self.mailer.as_ref(),
            OutboundEmail {
                to: to.to_string(),
                subject: subject.to_string(),
                html,
            },
            SEND_TIMEOUT,
        )
        .await
    }
}
