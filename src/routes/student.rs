use crate::{
    AppState,
    gate::{self, Guard},
    handlers,
    models::Role,
    sessions::SessionRegistry,
};
use axum::{Router, middleware, routing::get};

/// Student Router Module
///
/// Mounted under `/student`. Admits `{student}`; deactivated or soft-deleted
/// students are redirected with the deactivation message.
pub fn student_routes(sessions: SessionRegistry) -> Router<AppState> {
    Router::new()
        // GET /student/dashboard
        .route("/dashboard", get(handlers::student_dashboard))
        .route_layer(middleware::from_fn_with_state(
            Guard::new(sessions, [Role::Student]),
            gate::require_access,
        ))
}
