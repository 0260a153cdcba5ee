use axum::{Router, extract::FromRef, http::HeaderName};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::{DefaultOnResponse, TraceLayer},
};
use tracing::{Level, Span};

// --- Module Structure ---

// Collaborators: hosted auth and the data layer.
pub mod auth;
pub mod repository;

// Session state and the access gate built on it.
pub mod gate;
pub mod session;
pub mod sessions;

pub mod config;
pub mod error;
pub mod handlers;
pub mod models;

// Route groups, one per access level.
pub mod routes;
use routes::{admin, authenticated, public, staff, student};

// --- Public Re-exports ---

pub use config::AppConfig;
pub use gate::{AccessGate, GateDecision, RoleSet};
pub use repository::{
    MockRepository, PostgresRepository, RepositoryState, RestRepository, UnconfiguredRepository,
};
pub use session::{SessionHandle, SessionStore};
pub use sessions::{BackendState, MockBackend, SessionRegistry, SupabaseBackend};

/// ApiDoc
///
/// OpenAPI document for the HTTP surface, served at `/api-docs/openapi.json`.
#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::login_page, handlers::sign_in, handlers::sign_up, handlers::sign_out,
        handlers::get_session, handlers::unauthorized, handlers::get_me,
        handlers::refresh_profile, handlers::admin_dashboard, handlers::staff_dashboard,
        handlers::student_dashboard
    ),
    components(
        schemas(
            models::Role, models::StudentStatus, models::Identity,
            models::AuthorizationProfile, models::SessionState, models::SignUpMetadata,
            models::SignInRequest, models::SignUpRequest, models::SignUpResponse,
            models::LoginResponse, models::LoginHint, models::UnauthorizedBody,
            gate::GatePlaceholder,
        )
    ),
    tags(
        (name = "registry-portal", description = "University Registry session and access API")
    )
)]
struct ApiDoc;

/// AppState
///
/// Shared by every request: the session registry and the loaded configuration.
#[derive(Clone)]
pub struct AppState {
    /// Per-browser session stores.
    pub sessions: SessionRegistry,
    pub config: AppConfig,
}

impl AppState {
    pub fn new(backend: BackendState, config: AppConfig) -> Self {
        Self {
            sessions: SessionRegistry::new(backend, &config),
            config,
        }
    }
}

// --- Axum FromRef Extractor Implementations ---

impl FromRef<AppState> for SessionRegistry {
    fn from_ref(app_state: &AppState) -> SessionRegistry {
        app_state.sessions.clone()
    }
}

impl FromRef<AppState> for AppConfig {
    fn from_ref(app_state: &AppState) -> AppConfig {
        app_state.config.clone()
    }
}

/// create_router
///
/// Assembles the route groups, each behind its own gate, and wraps them in the
/// request-id, tracing and CORS layers.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods(Any)
        .allow_origin(Any)
        .allow_headers(Any);

    let x_request_id = HeaderName::from_static("x-request-id");
    let sessions = state.sessions.clone();

    let base_router = Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(public::public_routes())
        .merge(authenticated::authenticated_routes(sessions.clone()))
        .nest("/admin", admin::admin_routes(sessions.clone()))
        .nest("/staff", staff::staff_routes(sessions.clone()))
        .nest("/student", student::student_routes(sessions))
        .with_state(state);

    base_router
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::new(x_request_id.clone(), MakeRequestUuid))
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(trace_span_logger)
                        .on_response(
                            DefaultOnResponse::new()
                                .level(Level::INFO)
                                .latency_unit(tower_http::LatencyUnit::Millis),
                        ),
                )
                .layer(PropagateRequestIdLayer::new(x_request_id)),
        )
        .layer(cors)
}

/// trace_span_logger
///
/// Span for one HTTP request, tagged with its `x-request-id` so session and gate
/// logs can be correlated per request.
fn trace_span_logger(request: &axum::http::Request<axum::body::Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("unknown");

    tracing::info_span!(
        "http_request",
        method = ?request.method(),
        uri = ?request.uri(),
        req_id = %request_id,
    )
}
