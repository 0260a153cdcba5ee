use crate::{
    AppState,
    gate::{self, Guard, RoleSet},
    handlers,
    sessions::SessionRegistry,
};
use axum::{
    Router, middleware,
    routing::{get, post},
};

/// Authenticated Router Module
///
/// `/me` passes the full gate with an empty role set: any role, but the profile
/// must be resolved and a student must be active.
///
/// `/session/refresh` only needs an identity. It is how a client stuck in the
/// re-synchronizing state retries, so it cannot sit behind the profile checks.
pub fn authenticated_routes(sessions: SessionRegistry) -> Router<AppState> {
    let gated = Router::new()
        // GET /me
        .route("/me", get(handlers::get_me))
        .route_layer(middleware::from_fn_with_state(
            Guard::new(sessions.clone(), RoleSet::any()),
            gate::require_access,
        ));

    let signed_in = Router::new()
        // POST /session/refresh
        .route("/session/refresh", post(handlers::refresh_profile))
        .route_layer(middleware::from_fn_with_state(
            sessions,
            gate::require_identity,
        ));

    gated.merge(signed_in)
}
