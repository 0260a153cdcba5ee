use crate::{
    AppState,
    config::Env,
    error::AuthError,
    gate::{self, CurrentSession, LOGIN_PATH},
    models::{
        LoginHint, LoginResponse, SessionState, SignInRequest, SignUpMetadata, SignUpRequest,
        SignUpResponse, UnauthorizedBody,
    },
    session::SessionHandle,
    sessions::{self, SessionRegistry},
};
use axum::{
    Json,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Redirect, Response},
};
use axum_extra::extract::CookieJar;
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

/// UnauthorizedQuery
///
/// Query parameters of `GET /unauthorized`. The gate sets `message` for deactivated students.
#[derive(Deserialize, utoipa::IntoParams)]
pub struct UnauthorizedQuery {
    pub message: Option<String>,
}

const DEFAULT_UNAUTHORIZED_MESSAGE: &str = "You do not have permission to view this page.";

impl From<SessionState> for LoginResponse {
    fn from(session: SessionState) -> Self {
        Self {
            redirect_to: session.role().map(|role| gate::home_path(role).to_string()),
            session,
        }
    }
}

/// The caller's tracked cookie session, or a new untracked one. The flag is true
/// for a new store, which the caller registers only once it has signed in.
async fn attach_session(sessions: &SessionRegistry, jar: &CookieJar) -> (Uuid, SessionHandle, bool) {
    match sessions.by_cookie(jar).await {
        Some((id, store)) => (id, store, false),
        None => {
            let (id, store) = sessions.open().await;
            (id, store, true)
        }
    }
}

// --- Public Handlers ---

/// login_page
///
/// [Public Route] Entry point the gate redirects unauthenticated requests to.
#[utoipa::path(
    get,
    path = "/login",
    responses((status = 200, description = "Sign-in hint", body = LoginHint))
)]
pub async fn login_page(State(sessions): State<SessionRegistry>, jar: CookieJar) -> Json<LoginHint> {
    let state = match sessions.by_cookie(&jar).await {
        Some((_, store)) => store.snapshot(),
        None => SessionState::signed_out(),
    };
    Json(LoginHint {
        authenticated: state.identity.is_some(),
        redirect_to: state.role().map(|role| gate::home_path(role).to_string()),
    })
}

/// sign_in
///
/// [Public Route] Signs in with e-mail and password.
///
/// Waits until the session reflects the new identity with its profile resolved
/// (bounded by the settle timeout), then sets the session cookie.
#[utoipa::path(
    post,
    path = "/login",
    request_body = SignInRequest,
    responses(
        (status = 200, description = "Signed in", body = LoginResponse),
        (status = 401, description = "Invalid credentials"),
        (status = 503, description = "Auth not configured")
    )
)]
pub async fn sign_in(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(payload): Json<SignInRequest>,
) -> Result<(CookieJar, Json<LoginResponse>), AuthError> {
    let (id, store, opened) = attach_session(&state.sessions, &jar).await;

    let session = store.sign_in(&payload.email, &payload.password).await?;
    let snapshot = store
        .resolved_for(session.identity.id, state.sessions.settle_timeout())
        .await;
    if opened {
        state.sessions.register(id, store).await;
    }
    let jar = jar.add(sessions::session_cookie(id, state.config.env == Env::Production));
    Ok((jar, Json(LoginResponse::from(snapshot))))
}

/// sign_up
///
/// [Public Route] Creates an account. The chosen role and full name travel as
/// metadata so the backend can provision the profile rows.
#[utoipa::path(
    post,
    path = "/signup",
    request_body = SignUpRequest,
    responses(
        (status = 201, description = "Account created and signed in", body = SignUpResponse),
        (status = 202, description = "Account created, e-mail confirmation pending", body = SignUpResponse),
        (status = 400, description = "Rejected by the auth service")
    )
)]
pub async fn sign_up(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(payload): Json<SignUpRequest>,
) -> Result<(StatusCode, CookieJar, Json<SignUpResponse>), AuthError> {
    let (id, store, opened) = attach_session(&state.sessions, &jar).await;
    let metadata = SignUpMetadata {
        full_name: payload.full_name,
        role: payload.role,
    };

    match store.sign_up(&payload.email, &payload.password, &metadata).await? {
        Some(session) => {
            let snapshot = store
                .resolved_for(session.identity.id, state.sessions.settle_timeout())
                .await;
            if opened {
                state.sessions.register(id, store).await;
            }
            let jar = jar.add(sessions::session_cookie(id, state.config.env == Env::Production));
            let body = SignUpResponse {
                confirmation_required: false,
                session: Some(snapshot),
            };
            Ok((StatusCode::CREATED, jar, Json(body)))
        }
        None => {
            let body = SignUpResponse {
                confirmation_required: true,
                session: None,
            };
            Ok((StatusCode::ACCEPTED, jar, Json(body)))
        }
    }
}

/// sign_out
///
/// [Public Route] Ends the cookie session. Succeeds when there is none.
#[utoipa::path(
    post,
    path = "/logout",
    responses((status = 204, description = "Signed out"))
)]
pub async fn sign_out(
    State(sessions): State<SessionRegistry>,
    jar: CookieJar,
) -> Result<(StatusCode, CookieJar), AuthError> {
    if let Some((id, store)) = sessions.by_cookie(&jar).await {
        let result = store.sign_out().await;
        sessions.close(id).await;
        result?;
    }
    Ok((
        StatusCode::NO_CONTENT,
        jar.remove(sessions::expired_session_cookie()),
    ))
}

/// get_session
///
/// [Public Route] The caller's current session snapshot; signed out when there is none.
#[utoipa::path(
    get,
    path = "/session",
    responses(
        (status = 200, description = "Session snapshot", body = SessionState),
        (status = 401, description = "Bearer token rejected")
    )
)]
pub async fn get_session(
    State(sessions): State<SessionRegistry>,
    jar: CookieJar,
    headers: HeaderMap,
) -> Result<Json<SessionState>, AuthError> {
    let state = match sessions.resolve(&jar, &headers).await? {
        Some(store) => store.snapshot(),
        None => SessionState::signed_out(),
    };
    Ok(Json(state))
}

/// unauthorized
///
/// [Public Route] Target of the gate's unauthorized redirects.
#[utoipa::path(
    get,
    path = "/unauthorized",
    params(UnauthorizedQuery),
    responses((status = 403, description = "Access denied", body = UnauthorizedBody))
)]
pub async fn unauthorized(Query(query): Query<UnauthorizedQuery>) -> impl IntoResponse {
    let message = query
        .message
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_UNAUTHORIZED_MESSAGE.to_string());
    (StatusCode::FORBIDDEN, Json(UnauthorizedBody { message }))
}

// --- Authenticated Handlers ---

/// get_me
///
/// [Authenticated Route] The signed-in user's identity and authorization profile.
#[utoipa::path(
    get,
    path = "/me",
    responses((status = 200, description = "Session snapshot", body = SessionState))
)]
pub async fn get_me(CurrentSession(store): CurrentSession) -> Json<SessionState> {
    Json(store.snapshot())
}

/// refresh_profile
///
/// [Signed-in Route] Re-reads the authorization profile, e.g. after a role or
/// status change, or to retry a fetch that exhausted its attempts.
#[utoipa::path(
    post,
    path = "/session/refresh",
    responses((status = 200, description = "Session after the refresh", body = SessionState))
)]
pub async fn refresh_profile(
    CurrentSession(store): CurrentSession,
) -> Result<Json<SessionState>, StatusCode> {
    let user_id = store.snapshot().user_id().ok_or(StatusCode::UNAUTHORIZED)?;
    store.refresh_profile(user_id).await;
    Ok(Json(store.snapshot()))
}

// --- Dashboards ---

/// Calls a dashboard RPC with the session's own access token.
async fn dashboard(
    sessions: &SessionRegistry,
    store: &SessionHandle,
    function: &str,
    args: Value,
) -> Result<Json<Value>, Response> {
    let Some(token) = store.access_token().await else {
        return Err(Redirect::to(LOGIN_PATH).into_response());
    };
    let data = sessions
        .repository()
        .call_rpc(&token, function, args)
        .await
        .map_err(IntoResponse::into_response)?;
    Ok(Json(data))
}

/// admin_dashboard
///
/// [Admin Route] Registry-wide statistics.
#[utoipa::path(
    get,
    path = "/admin/dashboard",
    responses(
        (status = 200, description = "Result of get_admin_dashboard_stats"),
        (status = 303, description = "Redirect to /login or /unauthorized")
    )
)]
pub async fn admin_dashboard(
    State(sessions): State<SessionRegistry>,
    CurrentSession(store): CurrentSession,
) -> Result<Json<Value>, Response> {
    dashboard(&sessions, &store, "get_admin_dashboard_stats", json!({})).await
}

/// staff_dashboard
///
/// [Staff Route] Course and enrollment statistics. Admins may view it too.
#[utoipa::path(
    get,
    path = "/staff/dashboard",
    responses(
        (status = 200, description = "Result of get_staff_dashboard_stats"),
        (status = 303, description = "Redirect to /login or /unauthorized")
    )
)]
pub async fn staff_dashboard(
    State(sessions): State<SessionRegistry>,
    CurrentSession(store): CurrentSession,
) -> Result<Json<Value>, Response> {
    dashboard(&sessions, &store, "get_staff_dashboard_stats", json!({})).await
}

/// student_dashboard
///
/// [Student Route] The signed-in student's own enrollments, grades and balance.
#[utoipa::path(
    get,
    path = "/student/dashboard",
    responses(
        (status = 200, description = "Result of get_student_dashboard_data"),
        (status = 303, description = "Redirect to /login or /unauthorized")
    )
)]
pub async fn student_dashboard(
    State(sessions): State<SessionRegistry>,
    CurrentSession(store): CurrentSession,
) -> Result<Json<Value>, Response> {
    dashboard(&sessions, &store, "get_student_dashboard_data", json!({})).await
}
