use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use chrono::Utc;
use cm_core::model::{AccountStatus, Language, NewUser, ProfileUpdate, User, UserRole};
use cm_core::rate_limit::RateRule;
use cm_core::store::StoreError;
use cm_core::{auth, email, metrics};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use crate::{ApiError, ApiResult, AppState};

const AUTHENTICATE_BEARER_CHALLENGE: &str = r#"Bearer realm="cm-user-api""#;
const TRIAL_DAYS: i64 = 14;
const MAX_EMAIL_CHARS: usize = 320;
const MAX_PASSWORD_CHARS: usize = 128;
const MAX_NAME_CHARS: usize = 255;

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub name: Option<String>,
    pub language: Option<Language>,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_at: i64,
    pub user: User,
}

#[derive(Deserialize)]
pub struct ProfileRequest {
    pub name: Option<String>,
    pub email: Option<String>,
    pub language: Option<Language>,
}

#[derive(Clone, Copy)]
pub(crate) struct UserRateLimitConfig {
    pub enabled: bool,
    pub auth_per_minute: u64,
    pub upload_per_15min: u64,
    pub rum_per_15min: u64,
    pub webhook_per_15min: u64,
}

#[derive(Clone)]
pub(crate) struct AuthContext {
    pub user: User,
}

impl AuthContext {
    pub fn user_id(&self) -> i64 {
        self.user.id
    }

    pub fn is_admin(&self) -> bool {
        self.user.is_admin()
    }

    /// Owners and admins may read or remove a resource.
    #[allow(clippy::result_large_err)]
    pub fn ensure_can_access(&self, owner_id: i64) -> ApiResult<()> {
        if self.user.id == owner_id || self.is_admin() {
            Ok(())
        } else {
            Err(ApiError::forbidden("not the owner of this resource"))
        }
    }
}

pub async fn register(
    State(state): State<AppState>,
    headers: HeaderMap,
    connect: Option<ConnectInfo<SocketAddr>>,
    Json(payload): Json<RegisterRequest>,
) -> ApiResult<(StatusCode, Json<SessionResponse>)> {
    let rate = current_rate_limit(&state).await;
    if rate.enabled {
        let key = format!("auth:{}", client_ip(&headers, connect.as_ref()));
        enforce_rate_limit(&state, "auth", &key, RateRule::per_minute(rate.auth_per_minute)).await?;
    }

    let email = normalize_email(&payload.email)?;
    validate_password(&payload.password)?;
    let name = normalize_name(payload.name)?;

    let role = match &state.owner_email {
        Some(owner) if owner.eq_ignore_ascii_case(&email) => UserRole::Admin,
        _ => UserRole::User,
    };
    let password_hash = auth::hash_password(&payload.password).map_err(ApiError::internal)?;
    let user = state
        .store
        .create_user(NewUser {
            email,
            name,
            password_hash,
            role,
            language: payload.language.unwrap_or(Language::En),
            trial_ends_at: Utc::now() + chrono::Duration::days(TRIAL_DAYS),
        })
        .await
        .map_err(email_conflict)?;
    tracing::info!(user_id = user.id, role = %user.role, "user registered");

    state
        .email
        .send_in_background(email::welcome(&user.email, user.name.as_deref()));

    let session = issue_session(&state, user)?;
    Ok((StatusCode::CREATED, Json(session)))
}

pub async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
    connect: Option<ConnectInfo<SocketAddr>>,
    Json(payload): Json<LoginRequest>,
) -> ApiResult<Json<SessionResponse>> {
    let rate = current_rate_limit(&state).await;
    if rate.enabled {
        let key = format!("auth:{}", client_ip(&headers, connect.as_ref()));
        enforce_rate_limit(&state, "auth", &key, RateRule::per_minute(rate.auth_per_minute)).await?;
    }

    let email = payload.email.trim().to_lowercase();
    let user = state.store.find_user_by_email(&email).await?;
    let Some(user) = user.filter(|user| auth::verify_password(&payload.password, &user.password_hash))
    else {
        metrics::inc_auth_failure(crate::SERVICE_NAME);
        return Err(ApiError::new(
            StatusCode::UNAUTHORIZED,
            "AUTH_FAILED",
            "invalid email or password",
        ));
    };
    ensure_not_suspended(&user)?;

    state.store.record_sign_in(user.id).await?;
    Ok(Json(issue_session(&state, user)?))
}

pub async fn me(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Json<User>> {
    let auth = require_auth(&state, &headers).await?;
    Ok(Json(auth.user))
}

pub async fn update_profile(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<ProfileRequest>,
) -> ApiResult<Json<User>> {
    let auth = require_auth(&state, &headers).await?;
    let update = ProfileUpdate {
        name: normalize_name(payload.name)?,
        email: payload.email.as_deref().map(normalize_email).transpose()?,
        language: payload.language,
    };

    let user = state
        .store
        .update_profile(auth.user_id(), update)
        .await
        .map_err(email_conflict)?
        .ok_or_else(|| ApiError::not_found("user not found"))?;
    Ok(Json(user))
}

pub(crate) async fn require_auth(state: &AppState, headers: &HeaderMap) -> ApiResult<AuthContext> {
    let token = auth::bearer_token(headers).ok_or_else(|| auth_required_error("missing token"))?;
    let claims = auth::verify_token(token, &state.jwt_config)
        .map_err(|err| auth_required_error(err.to_string()))?;
    let user_id = claims
        .user_id()
        .map_err(|err| auth_required_error(err.to_string()))?;

    let user = state
        .store
        .find_user(user_id)
        .await?
        .ok_or_else(|| auth_required_error("unknown user"))?;
    ensure_not_suspended(&user)?;
    Ok(AuthContext { user })
}

fn auth_required_error(message: impl Into<String>) -> ApiError {
    ApiError::new(StatusCode::UNAUTHORIZED, "AUTH_REQUIRED", message).with_header(
        "www-authenticate",
        AUTHENTICATE_BEARER_CHALLENGE.to_string(),
    )
}

#[allow(clippy::result_large_err)]
fn ensure_not_suspended(user: &User) -> ApiResult<()> {
    if user.subscription_status == AccountStatus::Suspended {
        return Err(ApiError::new(
            StatusCode::FORBIDDEN,
            "ACCOUNT_SUSPENDED",
            "account suspended",
        ));
    }
    Ok(())
}

#[allow(clippy::result_large_err)]
fn issue_session(state: &AppState, user: User) -> ApiResult<SessionResponse> {
    let (token, claims) = auth::issue_token(user.id, &state.jwt_config).map_err(ApiError::internal)?;
    metrics::inc_auth_success(crate::SERVICE_NAME);
    Ok(SessionResponse {
        access_token: token,
        token_type: "Bearer",
        expires_at: claims.exp as i64,
        user,
    })
}

fn email_conflict(err: StoreError) -> ApiError {
    match err {
        StoreError::Conflict(message) => ApiError::new(StatusCode::CONFLICT, "EMAIL_TAKEN", message),
        other => other.into(),
    }
}

#[allow(clippy::result_large_err)]
fn normalize_email(raw: &str) -> ApiResult<String> {
    let email = raw.trim().to_lowercase();
    let valid = email.chars().count() <= MAX_EMAIL_CHARS
        && !email.chars().any(char::is_whitespace)
        && email
            .split_once('@')
            .map(|(local, domain)| {
                !local.is_empty()
                    && !domain.contains('@')
                    && domain.contains('.')
                    && !domain.starts_with('.')
                    && !domain.ends_with('.')
            })
            .unwrap_or(false);
    if !valid {
        return Err(ApiError::bad_request("INVALID_REQUEST", "invalid email address"));
    }
    Ok(email)
}

#[allow(clippy::result_large_err)]
fn validate_password(password: &str) -> ApiResult<()> {
    let length = password.chars().count();
    if length < auth::MIN_PASSWORD_CHARS || length > MAX_PASSWORD_CHARS {
        return Err(ApiError::bad_request(
            "INVALID_REQUEST",
            format!(
                "password must be between {} and {MAX_PASSWORD_CHARS} characters",
                auth::MIN_PASSWORD_CHARS
            ),
        ));
    }
    Ok(())
}

#[allow(clippy::result_large_err)]
fn normalize_name(name: Option<String>) -> ApiResult<Option<String>> {
    let Some(name) = name else {
        return Ok(None);
    };
    let name = name.trim().to_string();
    if name.chars().count() > MAX_NAME_CHARS {
        return Err(ApiError::bad_request("INVALID_REQUEST", "name is too long"));
    }
    Ok((!name.is_empty()).then_some(name))
}

/// First `x-forwarded-for` hop, then the peer address.
pub(crate) fn client_ip(headers: &HeaderMap, connect: Option<&ConnectInfo<SocketAddr>>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .or_else(|| connect.map(|ConnectInfo(addr)| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

pub(crate) async fn current_rate_limit(state: &AppState) -> UserRateLimitConfig {
    let snapshot = state.user_config.get().await;
    let rate = snapshot
        .config_json
        .get("rate_limit")
        .and_then(|value| value.as_object());
    let limit = |key: &str, default: u64| {
        rate.and_then(|value| value.get(key))
            .and_then(|value| value.as_u64())
            .unwrap_or(default)
    };
    UserRateLimitConfig {
        enabled: rate
            .and_then(|value| value.get("enabled"))
            .and_then(|value| value.as_bool())
            .unwrap_or(true),
        auth_per_minute: limit("auth_per_minute", 5),
        upload_per_15min: limit("upload_per_15min", 30),
        rum_per_15min: limit("rum_per_15min", 100),
        webhook_per_15min: limit("webhook_per_15min", 60),
    }
}

pub(crate) async fn enforce_rate_limit(
    state: &AppState,
    bucket: &'static str,
    key: &str,
    rule: RateRule,
) -> ApiResult<()> {
    let outcome = state.rate_limiter.check(key, rule).await;
    if !outcome.allowed {
        metrics::inc_rate_limited(crate::SERVICE_NAME, bucket);
        let retry_after = outcome
            .retry_after
            .map(|dur| dur.as_secs().max(1))
            .unwrap_or(rule.window.as_secs());
        return Err(ApiError::new(
            StatusCode::TOO_MANY_REQUESTS,
            "RATE_LIMITED",
            "too many requests, please try again later",
        )
        .with_header("retry-after", retry_after.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn emails_are_trimmed_and_lowercased() {
        assert_eq!(normalize_email("  Sara@Example.COM ").unwrap(), "sara@example.com");
        for bad in ["", "no-at-sign", "@example.com", "a@b", "a@@b.com", "a b@c.com", "a@.com"] {
            assert!(normalize_email(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn password_length_is_counted_in_characters() {
        assert!(validate_password("1234567").is_err());
        assert!(validate_password("12345678").is_ok());
        assert!(validate_password("كلمةسرية").is_ok());
        assert!(validate_password(&"x".repeat(129)).is_err());
    }

    #[test]
    fn blank_names_become_none() {
        assert_eq!(normalize_name(Some("  ".into())).unwrap(), None);
        assert_eq!(normalize_name(Some(" Omar ".into())).unwrap(), Some("Omar".into()));
        assert!(normalize_name(Some("n".repeat(256))).is_err());
    }

    #[test]
    fn client_ip_prefers_forwarded_header() {
        let peer = ConnectInfo("10.0.0.9:4000".parse::<SocketAddr>().unwrap());
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, Some(&peer)), "10.0.0.9");
        assert_eq!(client_ip(&headers, None), "unknown");

        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        assert_eq!(client_ip(&headers, Some(&peer)), "203.0.113.7");
    }
}
