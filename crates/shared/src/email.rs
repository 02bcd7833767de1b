//! Outbound email transport
//!
//! Messages go out through the Resend HTTP API. Without an API key the
//! mailer logs the message and reports success, so local runs never fail on
//! email.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tera::Tera;

pub use tera::Context;

pub const DEFAULT_FROM: &str = "Tutorly <onboarding@resend.dev>";
pub const RESEND_API_BASE: &str = "https://api.resend.com";
pub const EMAIL_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundEmail {
    pub to: String,
    pub subject: String,
    pub html: String,
}

#[derive(Debug, thiserror::Error)]
pub enum EmailError {
    #[error("Email delivery failed: {0}")]
    Delivery(String),

    #[error("Email send timed out")]
    Timeout,

    #[error("Email template error: {0}")]
    Template(String),
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: OutboundEmail) -> Result<(), EmailError>;
}

/// Send with an upper bound on total latency
pub async fn send_with_timeout(
    mailer: &dyn Mailer,
    email: OutboundEmail,
    limit: Duration,
) -> Result<(), EmailError> {
    tokio::time::timeout(limit, mailer.send(email))
        .await
        .map_err(|_| EmailError::Timeout)?
}

lazy_static::lazy_static! {
    static ref TEMPLATES: Result<Tera, String> = {
        let mut tera = Tera::default();
        tera.add_raw_templates([
            ("emails/layout.html", include_str!("templates/emails/layout.html")),
            ("emails/welcome.html", include_str!("templates/emails/welcome.html")),
            ("emails/verify_email.html", include_str!("templates/emails/verify_email.html")),
            ("emails/reset_password.html", include_str!("templates/emails/reset_password.html")),
        ])
        .map(|()| tera)
        .map_err(|e| e.to_string())
    };
}

/// Render an email body from `templates/emails`
///
/// Templates end in `.html`, so tera escapes every interpolated value unless
/// the template marks it `safe`. Only server-built links are.
pub fn render_email(template: &str, context: &Context) -> Result<String, EmailError> {
    let tera = TEMPLATES
        .as_ref()
        .map_err(|e| EmailError::Template(e.clone()))?;

    let mut context = context.clone();
    context.insert("year", &time::OffsetDateTime::now_utc().year());

    tera.render(template, &context)
        .map_err(|e| EmailError::Template(e.to_string()))
}

#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub api_key: Option<String>,
    pub from: String,
    pub api_base: String,
}

impl EmailConfig {
    pub fn from_env() -> Self {
        Self {
            api_key: std::env::var("RESEND_API_KEY")
                .ok()
                .filter(|key| !key.trim().is_empty()),
            from: std::env::var("EMAIL_FROM").unwrap_or_else(|_| DEFAULT_FROM.to_string()),
            api_base: std::env::var("RESEND_API_BASE")
                .unwrap_or_else(|_| RESEND_API_BASE.to_string()),
        }
    }
}

#[derive(Serialize)]
struct ResendRequest<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    html: &'a str,
}

pub struct ResendMailer {
    config: EmailConfig,
    http: reqwest::Client,
}

impl ResendMailer {
    pub fn new(config: EmailConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(EMAIL_REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Failed to build email HTTP client, using defaults");
                reqwest::Client::new()
            });
        Self { config, http }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.api_key.is_some()
    }
}

#[async_trait]
impl Mailer for ResendMailer {
    async fn send(&self, email: OutboundEmail) -> Result<(), EmailError> {
        let Some(api_key) = self.config.api_key.as_deref() else {
            tracing::warn!(
                to = %email.to,
                subject = %email.subject,
                "RESEND_API_KEY not set, skipping email"
            );
            return Ok(());
        };

        let url = format!("{}/emails", self.config.api_base.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .bearer_auth(api_key)
            .json(&ResendRequest {
                from: &self.config.from,
                to: [&email.to],
                subject: &email.subject,
                html: &email.html,
            })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EmailError::Timeout
                } else {
                    EmailError::Delivery(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmailError::Delivery(format!("{status}: {body}")));
        }

        tracing::info!(to = %email.to, subject = %email.subject, "Email sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn message() -> OutboundEmail {
        OutboundEmail {
            to: "parent@example.com".to_string(),
            subject: "Hello".to_string(),
            html: "<p>Hi</p>".to_string(),
        }
    }

    fn config(api_base: String) -> EmailConfig {
        EmailConfig {
            api_key: Some("re_test".to_string()),
            from: DEFAULT_FROM.to_string(),
            api_base,
        }
    }

    fn welcome_context(student_name: &str) -> Context {
        let mut context = Context::new();
        context.insert("student_name", student_name);
        context.insert("setup_link", "https://t.test/auth/setup?token=abc123");
        context
    }

    #[test]
    fn test_render_escapes_names() {
        let html = render_email(
            "emails/welcome.html",
            &welcome_context(r#"<script>alert("x")</script> & co"#),
        )
        .unwrap();
        assert!(!html.contains("<script>"));
        assert!(html.contains("&lt;script&gt;"));
        assert!(html.contains("&amp; co"));
    }

    #[test]
    fn test_render_keeps_link_query_intact() {
        let html = render_email("emails/welcome.html", &welcome_context("Sam")).unwrap();
        assert!(html.contains(r#"href="https://t.test/auth/setup?token=abc123""#));
        assert!(html.contains("Hi Sam!"));
        assert!(html.contains("Tutorly. All rights reserved."));
    }

    #[test]
    fn test_render_greets_without_name() {
        let html = render_email("emails/welcome.html", &welcome_context("")).unwrap();
        assert!(html.contains("Hi there!"));
    }

    #[test]
    fn test_unknown_template_is_an_error() {
        let result = render_email("emails/missing.html", &Context::new());
        assert!(matches!(result, Err(EmailError::Template(_))));
    }

    #[tokio::test]
    async fn test_send_posts_to_resend() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/emails")
            .match_header("authorization", "Bearer re_test")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "to": ["parent@example.com"],
                "subject": "Hello",
                "from": DEFAULT_FROM,
            })))
            .with_status(200)
            .with_body(r#"{"id":"email_1"}"#)
            .create_async()
            .await;

        let mailer = ResendMailer::new(config(server.url()));
        mailer.send(message()).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_send_reports_provider_rejection() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/emails")
            .with_status(422)
            .with_body(r#"{"message":"invalid to"}"#)
            .create_async()
            .await;

        let mailer = ResendMailer::new(config(server.url()));
        let err = mailer.send(message()).await.unwrap_err();
        assert!(matches!(err, EmailError::Delivery(msg) if msg.contains("422")));
    }

    #[tokio::test]
    async fn test_disabled_mailer_skips() {
        let mailer = ResendMailer::new(EmailConfig {
            api_key: None,
            from: DEFAULT_FROM.to_string(),
            api_base: "http://127.0.0.1:1".to_string(),
        });
        assert!(!mailer.is_enabled());
        assert!(mailer.send(message()).await.is_ok());
    }

    #[test]
    #[serial]
    fn test_config_from_env_treats_blank_key_as_missing() {
        std::env::set_var("RESEND_API_KEY", "  ");
        std::env::remove_var("EMAIL_FROM");
        let config = EmailConfig::from_env();
        assert!(config.api_key.is_none());
        assert_eq!(config.from, DEFAULT_FROM);
        std::env::remove_var("RESEND_API_KEY");
    }
}
