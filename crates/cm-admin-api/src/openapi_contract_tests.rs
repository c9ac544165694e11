use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::routing::get;
use axum::Router;
use serde_json::Value;
use tower::ServiceExt;

#[tokio::test]
async fn openapi_contract_contains_admin_paths() {
    let app = Router::new().route("/v1/openapi.json", get(crate::openapi_json));
    let request = Request::builder()
        .method("GET")
        .uri("/v1/openapi.json")
        .header("host", "admin.localhost:8081")
        .header("x-forwarded-proto", "https")
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let payload: Value = serde_json::from_slice(&body).expect("json body");

    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload.get("openapi").and_then(Value::as_str), Some("3.0.3"));
    assert_eq!(
        payload.pointer("/servers/0/url").and_then(Value::as_str),
        Some("https://admin.localhost:8081")
    );
    assert!(payload.pointer("/paths/~1v1~1admin~1dashboard/get").is_some());
    assert!(payload
        .pointer("/paths/~1v1~1admin~1users~1{user_id}~1status/patch")
        .is_some());
    assert!(payload
        .pointer("/paths/~1v1~1admin~1services~1{service}~1config/put")
        .is_some());
    assert!(payload.pointer("/paths/~1v1~1admin~1audit-logs/get").is_some());
    assert!(payload.pointer("/components/securitySchemes/bearer").is_some());
}
