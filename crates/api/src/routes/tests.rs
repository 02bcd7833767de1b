//! Request-level tests for the HTTP surface, run against the in-memory store

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tower::ServiceExt;
use tutorly_billing::testing::{extract_token, sign_payload, FakeProcessor, RecordingMailer};
use tutorly_shared::{EnrollmentStore, MemoryStore, PendingAction, PendingActionKind, Plan};

use super::create_router;
use crate::config::Config;
use crate::state::AppState;

const WEBHOOK_SECRET: &str = "whsec_test";
const BASE_URL: &str = "https://tutorly.test";

struct TestApp {
    state: AppState,
    store: Arc<MemoryStore>,
    mailer: Arc<RecordingMailer>,
    processor: Arc<FakeProcessor>,
}

impl TestApp {
    fn new() -> Self {
        Self::with_processor(FakeProcessor::new())
    }

    fn with_processor(processor: FakeProcessor) -> Self {
        let store = Arc::new(MemoryStore::new());
        let mailer = Arc::new(RecordingMailer::new());
        let processor = Arc::new(processor);
        let state = AppState::new(
            Config::for_base_url(BASE_URL),
            store.clone(),
            processor.clone(),
            mailer.clone(),
            WEBHOOK_SECRET.to_string(),
        );
        Self {
            state,
            store,
            mailer,
            processor,
        }
    }

    fn router(&self) -> Router {
        create_router(self.state.clone())
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router().oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).expect("Response should be valid JSON")
        };
        (status, json)
    }

    async fn post_json(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.send(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
    }

    async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.send(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
    }

    async fn post_webhook(&self, payload: &str, signature: Option<String>) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/api/stripe/webhook")
            .header("content-type", "application/json");
        if let Some(signature) = signature {
            builder = builder.header("stripe-signature", signature);
        }
        self.send(builder.body(Body::from(payload.to_string())).unwrap())
            .await
    }

    async fn deliver(&self, payload: &str) -> (StatusCode, Value) {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let signature = sign_payload(payload.as_bytes(), now, WEBHOOK_SECRET);
        self.post_webhook(payload, Some(signature)).await
    }
}

fn enrollment() -> Value {
    json!({
        "plan": "steady",
        "courses": ["maths", "physics"],
        "sessionsPerWeek": 1,
        "studentInfo": {
            "name": "Sam Lee",
            "email": "parent@example.com",
            "year": "Year 10"
        }
    })
}

fn checkout_completed(event_id: &str, email: &str) -> String {
    json!({
        "id": event_id,
        "type": "checkout.session.completed",
        "created": 1_700_000_000,
        "data": {
            "object": {
                "id": "cs_test_1",
                "object": "checkout.session",
                "subscription": "sub_1",
                "customer": "cus_1",
                "customer_email": email,
                "amount_total": 2500,
                "metadata": {
                    "plan": "steady",
                    "studentName": "Sam Lee",
                    "studentEmail": email,
                    "studentYear": "Year 10",
                    "courses": "[\"maths\",\"physics\"]",
                    "sessionsPerWeek": "1"
                }
            }
        }
    })
    .to_string()
}

async fn setup_token_for(app: &TestApp, email: &str) -> String {
    let sent = app.mailer.sent_to(email).await;
    assert_eq!(sent.len(), 1, "expected exactly one welcome email");
    extract_token(&sent[0].html).unwrap()
}

// =============================================================================
// Health and fallback
// =============================================================================

#[tokio::test]
async fn test_health() {
    let app = TestApp::new();
    let (status, body) = app.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_unknown_route_is_json_404() {
    let app = TestApp::new();
    let (status, body) = app.get("/api/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "Not found");
}

// =============================================================================
// Checkout
// =============================================================================

#[tokio::test]
async fn test_create_checkout_returns_url() {
    let app = TestApp::new();
    let (status, body) = app
        .post_json("/api/stripe/create-checkout", enrollment())
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["url"], "https://checkout.stripe.test/c/pay/cs_test_1");

    let requests = app.processor.requests().await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].unit_amount, 2500);
    assert_eq!(requests[0].customer_email, "parent@example.com");
    assert_eq!(requests[0].cancel_url, "https://tutorly.test/enroll/cancel");
}

#[tokio::test]
async fn test_create_checkout_validation_messages() {
    let app = TestApp::new();

    let mut bad_plan = enrollment();
    bad_plan["plan"] = json!("platinum");
    let (status, body) = app.post_json("/api/stripe/create-checkout", bad_plan).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Invalid plan selected");

    let mut no_courses = enrollment();
    no_courses["courses"] = json!([]);
    let (status, body) = app
        .post_json("/api/stripe/create-checkout", no_courses)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Please select at least one course");

    let mut no_student = enrollment();
    no_student["studentInfo"]["email"] = json!("");
    let (status, body) = app
        .post_json("/api/stripe/create-checkout", no_student)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Student information is required");

    assert!(app.processor.requests().await.is_empty());
}

#[tokio::test]
async fn test_create_checkout_invalid_json() {
    let app = TestApp::new();
    let (status, body) = app
        .send(
            Request::builder()
                .method("POST")
                .uri("/api/stripe/create-checkout")
                .header("content-type", "application/json")
                .body(Body::from("{ invalid json }"))
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Invalid request body");
}

#[tokio::test]
async fn test_create_checkout_processor_failure_is_generic_500() {
    let app = TestApp::with_processor(FakeProcessor::failing());
    let (status, body) = app
        .post_json("/api/stripe/create-checkout", enrollment())
        .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "Failed to create checkout session");
}

// =============================================================================
// Webhook
// =============================================================================

#[tokio::test]
async fn test_webhook_requires_signature_header() {
    let app = TestApp::new();
    let (status, body) = app
        .post_webhook(&checkout_completed("evt_1", "parent@example.com"), None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Missing stripe-signature header");
    assert!(app.store.subscriptions().await.is_empty());
}

#[tokio::test]
async fn test_webhook_rejects_bad_signature() {
    let app = TestApp::new();
    let payload = checkout_completed("evt_1", "parent@example.com");
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let forged = sign_payload(payload.as_bytes(), now, "whsec_attacker");

    let (status, body) = app.post_webhook(&payload, Some(forged)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Webhook signature verification failed");
    assert!(app.store.subscriptions().await.is_empty());
    assert!(app.mailer.sent().await.is_empty());
    assert!(app
        .store
        .pending_actions_for("parent@example.com")
        .await
        .is_empty());
}

#[tokio::test]
async fn test_webhook_rejects_stale_timestamp() {
    let app = TestApp::new();
    let payload = checkout_completed("evt_1", "parent@example.com");
    let stale = OffsetDateTime::now_utc().unix_timestamp() - 600;
    let signature = sign_payload(payload.as_bytes(), stale, WEBHOOK_SECRET);

    let (status, _) = app.post_webhook(&payload, Some(signature)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_webhook_store_outage_is_500() {
    let app = TestApp::new();
    app.store.set_unavailable(true);

    let (status, body) = app
        .deliver(&checkout_completed("evt_1", "parent@example.com"))
        .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "Webhook handler failed");
}

#[tokio::test]
async fn test_webhook_in_flight_redelivery_is_conflict() {
    let app = TestApp::new();
    app.store
        .claim_webhook_event("evt_1", "checkout.session.completed")
        .await
        .unwrap();

    let (status, body) = app
        .deliver(&checkout_completed("evt_1", "parent@example.com"))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "Webhook event is being processed, retry later");
    assert!(body.get("received").is_none());
    assert!(app.store.subscriptions().await.is_empty());
    assert!(app.mailer.sent().await.is_empty());
}

// =============================================================================
// Enrollment to account, end to end
// =============================================================================

#[tokio::test]
async fn test_paid_enrollment_to_account_setup() {
    let app = TestApp::new();
    let email = "parent@example.com";

    let (status, body) = app.deliver(&checkout_completed("evt_1", email)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "received": true }));

    // Redelivery is acknowledged without a second welcome email
    let (status, _) = app.deliver(&checkout_completed("evt_1", email)).await;
    assert_eq!(status, StatusCode::OK);

    let subscriptions = app.store.subscriptions().await;
    assert_eq!(subscriptions.len(), 1);
    assert_eq!(subscriptions[0].status, "active");
    assert!(subscriptions[0].user_id.is_none());

    let token = setup_token_for(&app, email).await;

    let (status, body) = app
        .get(&format!("/api/auth/verify-token?token={token}"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({ "valid": true, "email": email, "name": "Sam Lee" })
    );

    let (status, body) = app
        .post_json(
            "/api/auth/setup-account",
            json!({ "token": token, "password": "password123" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Account created successfully");
    let user_id = body["userId"].as_str().unwrap().to_string();

    let subscriptions = app.store.subscriptions().await;
    assert_eq!(
        subscriptions[0].user_id.map(|id| id.to_string()),
        Some(user_id)
    );

    // The token is single use
    let (status, body) = app
        .post_json(
            "/api/auth/setup-account",
            json!({ "token": token, "password": "password123" }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Invalid or expired token");
}

#[tokio::test]
async fn test_verify_token_errors() {
    let app = TestApp::new();

    let (status, body) = app.get("/api/auth/verify-token").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({ "valid": false, "error": "Token is required" }));

    let (status, body) = app.get("/api/auth/verify-token?token=deadbeef").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Invalid token");

    let now = OffsetDateTime::now_utc();
    app.store
        .insert_pending_action(&PendingAction {
            token: "abc123".to_string(),
            identifier: "late@example.com".to_string(),
            kind: PendingActionKind::ProvisionAccount,
            expires_at: now - Duration::hours(1),
            created_at: now - Duration::days(8),
        })
        .await
        .unwrap();

    let (status, body) = app.get("/api/auth/verify-token?token=abc123").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Token has expired");
    assert!(app
        .store
        .pending_actions_for("late@example.com")
        .await
        .is_empty());
}

#[tokio::test]
async fn test_setup_account_validation() {
    let app = TestApp::new();
    app.deliver(&checkout_completed("evt_1", "parent@example.com"))
        .await;
    let token = setup_token_for(&app, "parent@example.com").await;

    let (status, body) = app
        .post_json("/api/auth/setup-account", json!({ "token": token }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Token and password are required");

    let (status, body) = app
        .post_json(
            "/api/auth/setup-account",
            json!({ "token": token, "password": "short" }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Password must be at least 8 characters");

    // A rejected attempt leaves the token usable
    let (status, _) = app
        .post_json(
            "/api/auth/setup-account",
            json!({ "token": token, "password": "long-enough" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
}

// =============================================================================
// Registration, verification and password reset
// =============================================================================

#[tokio::test]
async fn test_register_and_verify_email() {
    let app = TestApp::new();
    let registration = json!({
        "name": "Ada",
        "email": "ada@example.com",
        "password": "password123"
    });

    let (status, body) = app
        .post_json("/api/auth/register", registration.clone())
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["message"], "Account created successfully");
    assert_eq!(body["user"]["email"], "ada@example.com");
    assert_eq!(body["user"]["name"], "Ada");
    assert!(body["user"].get("password_hash").is_none());

    let (status, body) = app.post_json("/api/auth/register", registration).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Email already registered");

    let sent = app.mailer.sent_to("ada@example.com").await;
    let token = extract_token(&sent[0].html).unwrap();

    let uri = format!("/api/auth/verify-email?token={token}");
    let (status, body) = app
        .send(
            Request::builder()
                .method("POST")
                .uri(&uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({ "success": true, "message": "Email verified successfully" })
    );

    let (status, body) = app
        .send(
            Request::builder()
                .method("POST")
                .uri(&uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        body,
        json!({ "success": false, "error": "Invalid verification token" })
    );
}

#[tokio::test]
async fn test_register_validation() {
    let app = TestApp::new();

    let (status, body) = app
        .post_json("/api/auth/register", json!({ "email": "ada@example.com" }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Missing required fields");

    let (status, body) = app
        .post_json(
            "/api/auth/register",
            json!({ "name": "Ada", "email": "ada@example.com", "password": "short" }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Password must be at least 8 characters");
}

#[tokio::test]
async fn test_forgot_password_does_not_reveal_accounts() {
    let app = TestApp::new();
    app.post_json(
        "/api/auth/register",
        json!({ "name": "Ada", "email": "ada@example.com", "password": "password123" }),
    )
    .await;

    let (known_status, known) = app
        .post_json(
            "/api/auth/forgot-password",
            json!({ "email": "ada@example.com" }),
        )
        .await;
    let (unknown_status, unknown) = app
        .post_json(
            "/api/auth/forgot-password",
            json!({ "email": "ghost@example.com" }),
        )
        .await;

    assert_eq!(known_status, StatusCode::OK);
    assert_eq!(unknown_status, StatusCode::OK);
    assert_eq!(known, unknown);
    assert!(app.mailer.sent_to("ghost@example.com").await.is_empty());

    let (status, body) = app
        .post_json("/api/auth/forgot-password", json!({}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Email is required");
}

#[tokio::test]
async fn test_reset_password_flow() {
    let app = TestApp::new();
    app.post_json(
        "/api/auth/register",
        json!({ "name": "Ada", "email": "ada@example.com", "password": "password123" }),
    )
    .await;
    app.post_json(
        "/api/auth/forgot-password",
        json!({ "email": "ada@example.com" }),
    )
    .await;

    let reset = app
        .mailer
        .sent_to("ada@example.com")
        .await
        .into_iter()
        .find(|e| e.subject == "Reset Your Tutorly Password")
        .unwrap();
    let token = extract_token(&reset.html).unwrap();

    let (status, body) = app
        .post_json(
            "/api/auth/reset-password",
            json!({ "token": token, "password": "brand-new-pass" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Password reset successfully");

    let (status, body) = app
        .post_json(
            "/api/auth/reset-password",
            json!({ "token": token, "password": "brand-new-pass" }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Invalid or expired reset link");

    let (status, body) = app
        .post_json("/api/auth/reset-password", json!({ "password": "x" }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Token and password are required");
}

// =============================================================================
// Full enrollment: checkout, payment, account setup, status change, forgery
// =============================================================================

#[tokio::test]
async fn test_focus_enrollment_lifecycle() {
    let app = TestApp::new();
    let email = "ada@example.com";

    let (status, body) = app
        .post_json(
            "/api/stripe/create-checkout",
            json!({
                "plan": "focus",
                "courses": ["ks2"],
                "studentInfo": { "name": "Ada", "email": email, "year": "Year 5" }
            }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["url"].as_str().unwrap().starts_with("https://"));
    assert!(app.store.subscriptions().await.is_empty());

    let requests = app.processor.requests().await;
    let metadata = &requests[0].metadata;
    let completed = json!({
        "id": "evt_completed",
        "type": "checkout.session.completed",
        "created": 1_700_000_000,
        "data": {
            "object": {
                "id": "cs_test_1",
                "object": "checkout.session",
                "subscription": "sub_123",
                "customer": "cus_123",
                "customer_email": email,
                "amount_total": 4000,
                "metadata": metadata
            }
        }
    })
    .to_string();
    let (status, _) = app.deliver(&completed).await;
    assert_eq!(status, StatusCode::OK);

    let subscription = app.store.subscriptions().await.remove(0);
    assert_eq!(subscription.stripe_subscription_id, "sub_123");
    assert_eq!(subscription.status, "active");
    assert_eq!(subscription.plan, "focus");
    assert_eq!(subscription.monthly_amount, Plan::Focus.monthly_price());
    assert_eq!(subscription.courses, vec!["ks2".to_string()]);
    assert_eq!(app.store.pending_actions_for(email).await.len(), 1);

    // Account setup from the welcome email
    let token = setup_token_for(&app, email).await;
    let (status, _) = app
        .post_json(
            "/api/auth/setup-account",
            json!({ "token": token, "password": "longenough1" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let identities = app.store.identities().await;
    assert_eq!(identities.len(), 1);
    assert!(identities[0].is_verified());
    assert_eq!(identities[0].name, "Ada");
    assert!(app.store.pending_actions_for(email).await.is_empty());
    let linked = app.store.subscriptions().await.remove(0);
    assert_eq!(linked.user_id, Some(identities[0].id));

    // Status change leaves the snapshot alone
    let updated = json!({
        "id": "evt_updated",
        "type": "customer.subscription.updated",
        "created": 1_700_000_100,
        "data": { "object": { "id": "sub_123", "object": "subscription", "status": "past_due" } }
    })
    .to_string();
    let (status, _) = app.deliver(&updated).await;
    assert_eq!(status, StatusCode::OK);

    let after = app.store.subscriptions().await.remove(0);
    assert_eq!(after.status, "past_due");
    assert_eq!(after.user_id, linked.user_id);
    assert_eq!(after.student_name, linked.student_name);
    assert_eq!(after.monthly_amount, linked.monthly_amount);
    assert_eq!(after.courses, linked.courses);

    // A forged cancellation changes nothing and sends nothing
    let emails_before = app.mailer.sent().await.len();
    let forged = json!({
        "id": "evt_forged",
        "type": "customer.subscription.deleted",
        "created": 1_700_000_200,
        "data": { "object": { "id": "sub_123", "object": "subscription", "status": "canceled" } }
    })
    .to_string();
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let (status, _) = app
        .post_webhook(&forged, Some(sign_payload(forged.as_bytes(), now, "whsec_forger")))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(app.store.subscriptions().await[0].status, "past_due");
    assert_eq!(app.mailer.sent().await.len(), emails_before);
    assert!(app.store.webhook_event_result("evt_forged").await.is_none());
}
