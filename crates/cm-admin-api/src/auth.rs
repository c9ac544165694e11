use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use cm_core::auth;
use cm_core::model::{AccountStatus, NewAuditLog, User};
use cm_core::store::UserRepository;
use serde_json::Value;

use crate::{ApiError, ApiResult, AppState};

const AUTHENTICATE_BEARER_CHALLENGE: &str = "Bearer realm=\"cm-admin-api\"";

/// The signed-in administrator.
pub(crate) struct AdminContext {
    pub(crate) user: User,
}

impl AdminContext {
    pub(crate) fn user_id(&self) -> i64 {
        self.user.id
    }

    pub(crate) fn audit(
        &self,
        action: &str,
        resource_type: &str,
        resource_id: impl ToString,
        details: Option<Value>,
    ) -> NewAuditLog {
        NewAuditLog {
            admin_user_id: self.user.id,
            action: action.to_string(),
            resource_type: resource_type.to_string(),
            resource_id: Some(resource_id.to_string()),
            details,
        }
    }
}

pub async fn me(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Json<User>> {
    let admin = require_admin(&state, &headers).await?;
    Ok(Json(admin.user))
}

pub(crate) async fn require_admin(state: &AppState, headers: &HeaderMap) -> ApiResult<AdminContext> {
    let token = auth::bearer_token(headers).ok_or_else(|| auth_required("missing token"))?;
    let claims =
        auth::verify_token(token, &state.jwt_config).map_err(|err| auth_required(err.to_string()))?;
    let user_id = claims.user_id().map_err(|err| auth_required(err.to_string()))?;

    let user = state
        .store
        .find_user(user_id)
        .await?
        .ok_or_else(|| auth_required("unknown user"))?;
    if !user.is_admin() || user.subscription_status == AccountStatus::Suspended {
        tracing::warn!(user_id, "admin endpoint rejected non-admin user");
        return Err(ApiError::new(
            StatusCode::FORBIDDEN,
            "FORBIDDEN",
            "admin access required",
        ));
    }
    Ok(AdminContext { user })
}

fn auth_required(message: impl Into<String>) -> ApiError {
    ApiError::new(StatusCode::UNAUTHORIZED, "AUTH_REQUIRED", message)
        .with_header("www-authenticate", AUTHENTICATE_BEARER_CHALLENGE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use axum::routing::get;
    use axum::Router;
    use cm_core::auth::JwtConfig;
    use cm_core::store::MemoryStore;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        AppState {
            store: Arc::new(MemoryStore::new()),
            jwt_config: Arc::new(JwtConfig {
                issuer: "contramind-test".into(),
                audience: "contramind-api".into(),
                secret: "admin-secret".into(),
                ttl_seconds: 600,
            }),
        }
    }

    #[tokio::test]
    async fn me_requires_bearer_token() {
        let app = Router::new()
            .route("/v1/admin/me", get(me))
            .with_state(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/v1/admin/me")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key("www-authenticate"));
    }

    #[tokio::test]
    async fn token_for_unknown_user_is_rejected() {
        let state = test_state();
        let (token, _) = auth::issue_token(42, &state.jwt_config).expect("token");
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            format!("Bearer {token}").parse().expect("header"),
        );
        let err = require_admin(&state, &headers).await.err().expect("rejected");
        assert_eq!(err.code, "AUTH_REQUIRED");
    }
}
