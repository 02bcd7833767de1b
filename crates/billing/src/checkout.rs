//! Checkout Initiator
//!
//! Validates an enrollment request and opens a hosted subscription checkout.
//! The enrollment intent travels to the webhook as session metadata; nothing
//! is written locally here.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tutorly_shared::{Plan, PLAN_CURRENCY};

use crate::client::{CheckoutSessionRequest, PaymentProcessor};
use crate::error::{BillingError, BillingResult};

pub const META_PLAN: &str = "plan";
pub const META_STUDENT_NAME: &str = "studentName";
pub const META_STUDENT_EMAIL: &str = "studentEmail";
pub const META_STUDENT_YEAR: &str = "studentYear";
pub const META_COURSES: &str = "courses";
pub const META_SESSIONS_PER_WEEK: &str = "sessionsPerWeek";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StudentInfo {
    pub name: Option<String>,
    pub email: Option<String>,
    pub year: Option<String>,
}

/// Body of a checkout request as submitted by the enrollment form
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentRequest {
    pub plan: Option<String>,
    pub courses: Option<Vec<String>>,
    pub sessions_per_week: Option<i32>,
    pub student_info: Option<StudentInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutResponse {
    pub url: String,
}

/// What the family asked to enroll in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrollmentIntent {
    pub plan: Plan,
    pub courses: Vec<String>,
    pub sessions_per_week: Option<i32>,
    pub student_name: String,
    pub student_email: String,
    pub student_year: String,
}

fn non_blank(value: Option<&String>) -> Option<String> {
    value
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

impl EnrollmentIntent {
    /// Checks run in a fixed order so the first failing rule decides the message
    pub fn validate(request: &EnrollmentRequest) -> BillingResult<Self> {
        let plan = request
            .plan
            .as_deref()
            .and_then(|p| p.parse::<Plan>().ok())
            .ok_or_else(|| BillingError::InvalidInput("Invalid plan selected".to_string()))?;

        let courses = match &request.courses {
            Some(courses) if !courses.is_empty() => courses.clone(),
            _ => {
                return Err(BillingError::InvalidInput(
                    "Please select at least one course".to_string(),
                ))
            }
        };

        let info = request.student_info.clone().unwrap_or_default();
        let (Some(student_name), Some(student_email), Some(student_year)) = (
            non_blank(info.name.as_ref()),
            non_blank(info.email.as_ref()),
            non_blank(info.year.as_ref()),
        ) else {
            return Err(BillingError::InvalidInput(
                "Student information is required".to_string(),
            ));
        };

        Ok(Self {
            plan,
            courses,
            sessions_per_week: request.sessions_per_week,
            student_name,
            student_email,
            student_year,
        })
    }

    pub fn to_metadata(&self) -> BTreeMap<String, String> {
        let courses = serde_json::to_string(&self.courses).unwrap_or_else(|_| "[]".to_string());
        BTreeMap::from([
            (META_PLAN.to_string(), self.plan.as_str().to_string()),
            (META_STUDENT_NAME.to_string(), self.student_name.clone()),
            (META_STUDENT_EMAIL.to_string(), self.student_email.clone()),
            (META_STUDENT_YEAR.to_string(), self.student_year.clone()),
            (META_COURSES.to_string(), courses),
            (
                META_SESSIONS_PER_WEEK.to_string(),
                self.sessions_per_week.unwrap_or(1).to_string(),
            ),
        ])
    }

    /// Rebuild an intent from session metadata
    ///
    /// Lenient: a missing email falls back to the session's customer email,
    /// a missing or unknown plan to Steady, and a malformed course list to an
    /// empty one.
    pub fn from_metadata(metadata: &HashMap<String, String>, fallback_email: Option<&str>) -> Self {
        let get = |key: &str| metadata.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());

        let plan = match get(META_PLAN).map(str::parse::<Plan>) {
            Some(Ok(plan)) => plan,
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Unknown plan in checkout metadata, using steady");
                Plan::Steady
            }
            None => Plan::Steady,
        };

        let courses = get(META_COURSES)
            .and_then(|raw| serde_json::from_str::<Vec<String>>(raw).ok())
            .unwrap_or_default();

        let student_email = get(META_STUDENT_EMAIL)
            .or(fallback_email.map(str::trim).filter(|e| !e.is_empty()))
            .unwrap_or_default()
            .to_string();

        Self {
            plan,
            courses,
            sessions_per_week: get(META_SESSIONS_PER_WEEK).and_then(|v| v.parse().ok()),
            student_name: get(META_STUDENT_NAME).unwrap_or_default().to_string(),
            student_email,
            student_year: get(META_STUDENT_YEAR).unwrap_or_default().to_string(),
        }
    }

    pub fn product_name(&self) -> String {
        format!("{} Plan - Tutorly Subscription", self.plan.display_name())
    }

    pub fn product_description(&self) -> String {
        let count = self.courses.len();
        format!(
            "{} - {} course{}",
            self.plan.session_summary(),
            count,
            if count > 1 { "s" } else { "" }
        )
    }
}

/// Opens hosted checkout sessions for validated enrollments
#[derive(Clone)]
pub struct CheckoutService {
    processor: Arc<dyn PaymentProcessor>,
    base_url: String,
}

impl CheckoutService {
    pub fn new(processor: Arc<dyn PaymentProcessor>, base_url: impl Into<String>) -> Self {
        Self {
            processor,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub async fn create_checkout(&self, request: EnrollmentRequest) -> BillingResult<CheckoutResponse> {
        let intent = EnrollmentIntent::validate(&request)?;

        let session_request = CheckoutSessionRequest {
            customer_email: intent.student_email.clone(),
            success_url: format!(
                "{}/enroll/success?session_id={{CHECKOUT_SESSION_ID}}",
                self.base_url
            ),
            cancel_url: format!("{}/enroll/cancel", self.base_url),
            currency: PLAN_CURRENCY.to_string(),
            unit_amount: intent.plan.monthly_price_pence(),
            product_name: intent.product_name(),
            product_description: intent.product_description(),
            metadata: intent.to_metadata(),
        };

        let session = self
            .processor
            .create_checkout_session(session_request)
            .await
            .map_err(|e| {
                tracing::error!(
                    plan = %intent.plan,
                    error = %e,
                    "Failed to create checkout session"
                );
                e
            })?;

        let url = session.url.ok_or_else(|| {
            tracing::error!(session_id = %session.id, "Checkout session returned without a URL");
            BillingError::StripeApi("checkout session has no URL".to_string())
        })?;

        tracing::info!(
            session_id = %session.id,
            plan = %intent.plan,
            courses = intent.courses.len(),
            "Checkout session created"
        );

        Ok(CheckoutResponse { url })
    }
}
