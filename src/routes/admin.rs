use crate::{
    AppState,
    gate::{self, Guard},
    handlers,
    models::Role,
    sessions::SessionRegistry,
};
use axum::{Router, middleware, routing::get};

/// Admin Router Module
///
/// Mounted under `/admin`. Every route passes the gate with `{admin}`; other
/// roles are redirected to `/unauthorized` before the handler runs.
pub fn admin_routes(sessions: SessionRegistry) -> Router<AppState> {
    Router::new()
        // GET /admin/dashboard
        // Registry-wide counts (students, courses, enrollments, outstanding payments).
        .route("/dashboard", get(handlers::admin_dashboard))
        .route_layer(middleware::from_fn_with_state(
            Guard::new(sessions, [Role::Admin]),
            gate::require_access,
        ))
}
