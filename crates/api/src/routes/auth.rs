//! Account routes: setup from a provisioning link, registration, email
//! verification and password reset

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tutorly_shared::TokenError;
use uuid::Uuid;

use crate::accounts::AccountError;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

const FORGOT_PASSWORD_MESSAGE: &str =
    "If an account exists with that email, we sent a password reset link";

#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    pub token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct TokenPasswordRequest {
    pub token: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RegisterRequest {
    pub name: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ForgotPasswordRequest {
    pub email: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupAccountResponse {
    pub message: &'static str,
    pub user_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct RegisteredUser {
    pub id: Uuid,
    pub name: String,
    pub email: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub message: &'static str,
    pub user: RegisteredUser,
}

/// Treat an unreadable body like an empty one so the caller gets the
/// usual "required" message
fn body_or_default<T: Default>(body: Result<Json<T>, JsonRejection>) -> T {
    match body {
        Ok(Json(value)) => value,
        Err(e) => {
            tracing::debug!(error = %e, "Unreadable request body");
            T::default()
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn verify_token_failure(status: StatusCode, error: &str) -> Response {
    (status, Json(json!({ "valid": false, "error": error }))).into_response()
}

/// Check a provisioning link before showing the setup form
pub async fn verify_token(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
) -> Response {
    let Some(token) = non_empty(query.token) else {
        return verify_token_failure(StatusCode::BAD_REQUEST, "Token is required");
    };

    match state.billing.provisioner.verify_setup_token(&token).await {
        Ok(info) => Json(json!({
            "valid": true,
            "email": info.email,
            "name": info.name,
        }))
        .into_response(),
        Err(TokenError::Expired) => {
            verify_token_failure(StatusCode::BAD_REQUEST, "Token has expired")
        }
        Err(TokenError::Invalid) => verify_token_failure(StatusCode::BAD_REQUEST, "Invalid token"),
        Err(e) => {
            tracing::error!(error = %e, "Setup token verification failed");
            verify_token_failure(StatusCode::INTERNAL_SERVER_ERROR, "Failed to verify token")
        }
    }
}

/// Redeem a provisioning token and create the account
pub async fn setup_account(
    State(state): State<AppState>,
    body: Result<Json<TokenPasswordRequest>, JsonRejection>,
) -> ApiResult<Json<SetupAccountResponse>> {
    let request = body_or_default(body);
    let token = non_empty(request.token);
    let password = request.password.filter(|p| !p.is_empty());
    let (Some(token), Some(password)) = (token, password) else {
        return Err(ApiError::validation("Token and password are required"));
    };

    match state
        .billing
        .provisioner
        .complete_setup(&token, &password)
        .await
    {
        Ok(identity) => Ok(Json(SetupAccountResponse {
            message: "Account created successfully",
            user_id: identity.id,
        })),
        Err(TokenError::WeakPassword) => Err(ApiError::validation(
            TokenError::WeakPassword.to_string(),
        )),
        Err(TokenError::Invalid) => Err(ApiError::validation("Invalid or expired token")),
        Err(TokenError::Expired) => Err(ApiError::validation("Setup link has expired")),
        Err(TokenError::AccountExists) => Err(ApiError::validation(
            "Account already exists with this email",
        )),
        Err(e) => {
            tracing::error!(error = %e, "Account setup failed");
            Err(ApiError::internal("Failed to create account"))
        }
    }
}

pub async fn register(
    State(state): State<AppState>,
    body: Result<Json<RegisterRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<RegisterResponse>)> {
    let request = body_or_default(body);
    let name = request.name.unwrap_or_default();
    let email = request.email.unwrap_or_default();
    let password = request.password.unwrap_or_default();

    match state.accounts.register(&name, &email, &password).await {
        Ok(identity) => Ok((
            StatusCode::CREATED,
            Json(RegisterResponse {
                message: "Account created successfully",
                user: RegisteredUser {
                    id: identity.id,
                    name: identity.name,
                    email: identity.email,
                },
            }),
        )),
        Err(AccountError::MissingFields) => Err(ApiError::validation("Missing required fields")),
        Err(AccountError::EmailTaken) => Err(ApiError::validation("Email already registered")),
        Err(AccountError::Token(TokenError::WeakPassword)) => Err(ApiError::validation(
            TokenError::WeakPassword.to_string(),
        )),
        Err(e) => {
            tracing::error!(error = %e, "Registration failed");
            Err(ApiError::internal("Failed to create account"))
        }
    }
}

fn verify_email_failure(status: StatusCode, error: &str) -> Response {
    (status, Json(json!({ "success": false, "error": error }))).into_response()
}

pub async fn verify_email(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
) -> Response {
    let Some(token) = non_empty(query.token) else {
        return verify_email_failure(StatusCode::BAD_REQUEST, "Token is required");
    };

    match state.accounts.verify_email(&token).await {
        Ok(()) => Json(json!({
            "success": true,
            "message": "Email verified successfully",
        }))
        .into_response(),
        Err(TokenError::Invalid) => {
            verify_email_failure(StatusCode::BAD_REQUEST, "Invalid verification token")
        }
        Err(TokenError::Expired) => {
            verify_email_failure(StatusCode::BAD_REQUEST, "Verification link has expired")
        }
        Err(e) => {
            tracing::error!(error = %e, "Email verification failed");
            verify_email_failure(StatusCode::INTERNAL_SERVER_ERROR, "Failed to verify email")
        }
    }
}

/// Always answers with the same message whether or not the account exists
pub async fn forgot_password(
    State(state): State<AppState>,
    body: Result<Json<ForgotPasswordRequest>, JsonRejection>,
) -> ApiResult<Json<MessageResponse>> {
    let request = body_or_default(body);
    let Some(email) = non_empty(request.email) else {
        return Err(ApiError::validation("Email is required"));
    };

    state
        .accounts
        .request_password_reset(&email)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Password reset request failed");
            ApiError::internal("Failed to process request")
        })?;

    Ok(Json(MessageResponse {
        message: FORGOT_PASSWORD_MESSAGE,
    }))
}

pub async fn reset_password(
    State(state): State<AppState>,
    body: Result<Json<TokenPasswordRequest>, JsonRejection>,
) -> ApiResult<Json<MessageResponse>> {
    let request = body_or_default(body);
    let token = non_empty(request.token);
    let password = request.password.filter(|p| !p.is_empty());
    let (Some(token), Some(password)) = (token, password) else {
        return Err(ApiError::validation("Token and password are required"));
    };

    match state.accounts.reset_password(&token, &password).await {
        Ok(()) => Ok(Json(MessageResponse {
            message: "Password reset successfully",
        })),
        Err(TokenError::WeakPassword) => Err(ApiError::validation(
            TokenError::WeakPassword.to_string(),
        )),
        Err(TokenError::Invalid) => Err(ApiError::validation("Invalid or expired reset link")),
        Err(TokenError::Expired) => Err(ApiError::validation("Reset link has expired")),
        Err(e) => {
            tracing::error!(error = %e, "Password reset failed");
            Err(ApiError::internal("Failed to reset password"))
        }
    }
}
