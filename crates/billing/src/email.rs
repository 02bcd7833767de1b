//! Billing-triggered emails

use std::sync::Arc;
use std::time::Duration;
use tutorly_shared::email::{render_email, send_with_timeout, Context};
use tutorly_shared::{EmailError, Mailer, OutboundEmail};

pub const WELCOME_SUBJECT: &str = "Welcome to Tutorly - Set Up Your Account";

/// Bound on a single send, on top of the transport's own request timeout
const SEND_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Clone)]
pub struct BillingEmailService {
    mailer: Arc<dyn Mailer>,
}

impl BillingEmailService {
    pub fn new(mailer: Arc<dyn Mailer>) -> Self {
        Self { mailer }
    }

    /// Welcome email with the account setup link for a new payer
    pub async fn send_welcome(
        &self,
        to: &str,
        student_name: &str,
        setup_link: &str,
    ) -> Result<(), EmailError> {
        let mut context = Context::new();
        context.insert("student_name", student_name.trim());
        context.insert("setup_link", setup_link);

        send_with_timeout(
            self.mailer.as_ref(),
            OutboundEmail {
                to: to.to_string(),
                subject: WELCOME_SUBJECT.to_string(),
                html: render_email("emails/welcome.html", &context)?,
            },
            SEND_TIMEOUT,
        )
        .await
    }
}
