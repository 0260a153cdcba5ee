use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use registry_portal::{AppConfig, AppState, MockBackend, MockRepository, create_router};
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;

fn app() -> Router {
    let backend = Arc::new(MockBackend::new(Arc::new(MockRepository::new())));
    create_router(AppState::new(backend, AppConfig::default()))
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_every_response_carries_a_request_id() {
    let response = app()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let request_id = response
        .headers()
        .get("x-request-id")
        .expect("generated request id");
    assert!(uuid::Uuid::parse_str(request_id.to_str().unwrap()).is_ok());
}

#[tokio::test]
async fn test_incoming_request_id_is_echoed() {
    let response = app()
        .oneshot(
            Request::builder()
                .uri("/health")
                .header("x-request-id", "trace-me-42")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.headers()["x-request-id"], "trace-me-42");
}

#[tokio::test]
async fn test_role_gated_route_without_cookie_redirects_to_login() {
    let response = app()
        .oneshot(
            Request::builder()
                .uri("/staff/dashboard")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(response.headers()[header::LOCATION], "/login");
}

#[tokio::test]
async fn test_unauthorized_page_decodes_message() {
    let response = app()
        .oneshot(
            Request::builder()
                .uri("/unauthorized?message=Account+deactivated+%26+locked")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = body_json(response).await;
    assert_eq!(body["message"], "Account deactivated & locked");
}

#[tokio::test]
async fn test_openapi_document_lists_session_routes() {
    let response = app()
        .oneshot(
            Request::builder()
                .uri("/api-docs/openapi.json")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let doc = body_json(response).await;
    assert!(doc["paths"].get("/login").is_some());
    assert!(doc["paths"].get("/session/refresh").is_some());
    assert!(doc["components"]["schemas"].get("SessionState").is_some());
}
