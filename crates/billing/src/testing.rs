//! In-process fakes for the payment processor and mailer

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Mutex;
use tutorly_shared::{EmailError, Mailer, OutboundEmail};

use crate::client::{CheckoutSessionRequest, CreatedCheckoutSession, PaymentProcessor};
use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, Copy)]
enum ProcessorMode {
    Succeed,
    Fail,
    NoUrl,
}

/// Records every checkout request and answers with a canned session
pub struct FakeProcessor {
    mode: ProcessorMode,
    counter: AtomicUsize,
    requests: Mutex<Vec<CheckoutSessionRequest>>,
}

impl FakeProcessor {
    fn with_mode(mode: ProcessorMode) -> Self {
        Self {
            mode,
            counter: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn new() -> Self {
        Self::with_mode(ProcessorMode::Succeed)
    }

    pub fn failing() -> Self {
        Self::with_mode(ProcessorMode::Fail)
    }

    pub fn without_url() -> Self {
        Self::with_mode(ProcessorMode::NoUrl)
    }

    pub async fn requests(&self) -> Vec<CheckoutSessionRequest> {
        self.requests.lock().await.clone()
    }
}

impl Default for FakeProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PaymentProcessor for FakeProcessor {
    async fn create_checkout_session(
        &self,
        request: CheckoutSessionRequest,
    ) -> BillingResult<CreatedCheckoutSession> {
        self.requests.lock().await.push(request);
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("cs_test_{n}");

        match self.mode {
            ProcessorMode::Succeed => Ok(CreatedCheckoutSession {
                url: Some(format!("https://checkout.stripe.test/c/pay/{id}")),
                id,
            }),
            ProcessorMode::NoUrl => Ok(CreatedCheckoutSession { id, url: None }),
            ProcessorMode::Fail => Err(BillingError::StripeApi(
                "api_connection_error".to_string(),
            )),
        }
    }
}

/// Keeps sent emails in memory; can be switched to fail every send
#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<OutboundEmail>>,
    fail: AtomicBool,
}

impl RecordingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let mailer = Self::default();
        mailer.set_failing(true);
        mailer
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub async fn sent(&self) -> Vec<OutboundEmail> {
        self.sent.lock().await.clone()
    }

    pub async fn sent_to(&self, to: &str) -> Vec<OutboundEmail> {
        self.sent
            .lock()
            .await
            .iter()
            .filter(|e| e.to == to)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, email: OutboundEmail) -> Result<(), EmailError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(EmailError::Delivery("mailbox unavailable".to_string()));
        }
        self.sent.lock().await.push(email);
        Ok(())
    }
}

/// Pull the `token` query parameter out of a link in an email body
pub fn extract_token(html: &str) -> Option<String> {
    let start = html.find("token=")? + "token=".len();
    let token: String = html[start..]
        .chars()
        .take_while(|c| c.is_ascii_hexdigit())
        .collect();
    (!token.is_empty()).then_some(token)
}

/// Build a `Stripe-Signature` header value for `payload`
pub fn sign_payload(payload: &[u8], timestamp: i64, secret: &str) -> String {
    let mut mac = match Hmac::<Sha256>::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC accepts keys of any length"),
    };
    mac.update(format!("{timestamp}.").as_bytes());
    mac.update(payload);
    format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
}
