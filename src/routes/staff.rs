use crate::{
    AppState,
    gate::{self, Guard},
    handlers,
    models::Role,
    sessions::SessionRegistry,
};
use axum::{Router, middleware, routing::get};

/// Staff Router Module
///
/// Mounted under `/staff`. Admits `{admin, staff}`.
pub fn staff_routes(sessions: SessionRegistry) -> Router<AppState> {
    Router::new()
        // GET /staff/dashboard
        .route("/dashboard", get(handlers::staff_dashboard))
        .route_layer(middleware::from_fn_with_state(
            Guard::new(sessions, [Role::Admin, Role::Staff]),
            gate::require_access,
        ))
}
