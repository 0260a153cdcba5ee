use crate::{AppState, handlers};
use axum::{
    Router,
    routing::{get, post},
};

/// Public Router Module
///
/// Endpoints served without a session. `/login` and `/unauthorized` are also the
/// targets of the gate's redirects, so they must never be gated themselves.
pub fn public_routes() -> Router<AppState> {
    Router::new()
        // GET /health
        // Liveness probe for load balancers.
        .route("/health", get(|| async { "ok" }))
        // GET /login: where to go next. POST /login: password sign-in.
        .route("/login", get(handlers::login_page).post(handlers::sign_in))
        // POST /signup
        // Account creation; the role and full name are attached as metadata.
        .route("/signup", post(handlers::sign_up))
        // POST /logout
        .route("/logout", post(handlers::sign_out))
        // GET /session
        // Current snapshot for the cookie or bearer session. Never redirects.
        .route("/session", get(handlers::get_session))
        // GET /unauthorized?message=...
        .route("/unauthorized", get(handlers::unauthorized))
}
