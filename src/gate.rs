use axum::{
    Json,
    extract::{FromRequestParts, Request, State},
    http::{StatusCode, header, request::Parts},
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
};
use axum_extra::extract::CookieJar;
use serde::{Deserialize, Serialize};
use ts_rs::TS;
use utoipa::ToSchema;

use crate::{
    models::{Role, SessionState, StudentStatus},
    session::SessionHandle,
    sessions::SessionRegistry,
};

/// Sign-in entry point unauthenticated visitors are sent to.
pub const LOGIN_PATH: &str = "/login";
/// Destination for authenticated users who may not see the requested view.
pub const UNAUTHORIZED_PATH: &str = "/unauthorized";
/// Shown to students whose record is soft-deleted or inactive.
pub const DEACTIVATED_MESSAGE: &str =
    "Your student account has been deactivated. Please contact the registrar's office.";

/// Landing view for each role after sign-in.
pub fn home_path(role: Role) -> &'static str {
    match role {
        Role::Admin => "/admin/dashboard",
        Role::Staff => "/staff/dashboard",
        Role::Student => "/student/dashboard",
    }
}

/// RoleSet
///
/// The roles a gated view admits. The empty set admits any authenticated role.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleSet(Vec<Role>);

impl RoleSet {
    pub fn any() -> Self {
        Self(Vec::new())
    }

    pub fn of(roles: impl IntoIterator<Item = Role>) -> Self {
        let mut roles: Vec<Role> = roles.into_iter().collect();
        roles.dedup();
        Self(roles)
    }

    pub fn permits(&self, role: Role) -> bool {
        self.0.is_empty() || self.0.contains(&role)
    }
}

impl<const N: usize> From<[Role; N]> for RoleSet {
    fn from(roles: [Role; N]) -> Self {
        Self::of(roles)
    }
}

/// GateDecision
///
/// Exactly one outcome per evaluation of the gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// Initial session probe still pending.
    Loading,
    /// Signed in, but the authorization profile has not arrived.
    Resyncing { detail: Option<String> },
    RedirectToLogin,
    RedirectToUnauthorized { message: Option<String> },
    Render,
}

/// AccessGate
///
/// Decides, from a session snapshot alone, what a request for a protected view gets.
///
/// Order matters: a known role short-circuits the loading state (a background
/// re-sync never blanks a view the user could already see), and the student
/// status checks run only once the role itself is admitted.
#[derive(Debug, Clone, Default)]
pub struct AccessGate {
    permitted: RoleSet,
}

impl AccessGate {
    pub fn new(permitted: impl Into<RoleSet>) -> Self {
        Self {
            permitted: permitted.into(),
        }
    }

    pub fn evaluate(&self, state: &SessionState) -> GateDecision {
        // Only the initial probe is "unresolved": once an identity is known, a
        // missing profile is a re-sync even while its fetch is in flight.
        if state.loading && state.identity.is_none() && state.role().is_none() {
            return GateDecision::Loading;
        }

        if state.identity.is_none() {
            return GateDecision::RedirectToLogin;
        }

        let Some(profile) = &state.profile else {
            return GateDecision::Resyncing {
                detail: state.profile_error.clone(),
            };
        };

        if !self.permitted.permits(profile.role) {
            return GateDecision::RedirectToUnauthorized { message: None };
        }

        match profile.role {
            Role::Admin | Role::Staff => GateDecision::Render,
            Role::Student => match (profile.is_deleted, profile.student_status) {
                (Some(true), _) | (_, Some(StudentStatus::Inactive)) => {
                    GateDecision::RedirectToUnauthorized {
                        message: Some(DEACTIVATED_MESSAGE.to_string()),
                    }
                }
                (Some(false), Some(_)) => GateDecision::Render,
                // Student record not merged yet.
                _ => GateDecision::Resyncing { detail: None },
            },
        }
    }
}

// --- HTTP Rendering ---

/// GatePlaceholder
///
/// Body returned while the gate is waiting on the session. Clients poll after `Retry-After`.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct GatePlaceholder {
    /// `loading` or `resyncing`.
    pub state: String,
    pub detail: Option<String>,
}

fn placeholder(state: &str, retry_after: &'static str, detail: Option<String>) -> Response {
    (
        StatusCode::ACCEPTED,
        [(header::RETRY_AFTER, retry_after)],
        Json(GatePlaceholder {
            state: state.to_string(),
            detail,
        }),
    )
        .into_response()
}

/// `/unauthorized`, with the message as a query parameter when present.
pub fn unauthorized_location(message: Option<&str>) -> String {
    match message {
        Some(message) => {
            let query = url::form_urlencoded::Serializer::new(String::new())
                .append_pair("message", message)
                .finish();
            format!("{UNAUTHORIZED_PATH}?{query}")
        }
        None => UNAUTHORIZED_PATH.to_string(),
    }
}

impl GateDecision {
    /// The response replacing the view, or `None` when the view may render.
    pub fn into_denial(self) -> Option<Response> {
        match self {
            GateDecision::Render => None,
            GateDecision::Loading => Some(placeholder("loading", "1", None)),
            GateDecision::Resyncing { detail } => Some(placeholder("resyncing", "2", detail)),
            GateDecision::RedirectToLogin => Some(Redirect::to(LOGIN_PATH).into_response()),
            GateDecision::RedirectToUnauthorized { message } => Some(
                Redirect::to(&unauthorized_location(message.as_deref())).into_response(),
            ),
        }
    }
}

// --- Middleware ---

/// Guard
///
/// Middleware state for one gated route group: where sessions live and which roles pass.
#[derive(Clone)]
pub struct Guard {
    sessions: SessionRegistry,
    gate: AccessGate,
}

impl Guard {
    pub fn new(sessions: SessionRegistry, permitted: impl Into<RoleSet>) -> Self {
        Self {
            sessions,
            gate: AccessGate::new(permitted),
        }
    }
}

/// CurrentSession
///
/// The session a gated request was admitted under. Inserted by `require_access`;
/// extracting it outside a gated group is a 401.
#[derive(Clone)]
pub struct CurrentSession(pub SessionHandle);

impl<S: Send + Sync> FromRequestParts<S> for CurrentSession {
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<CurrentSession>()
            .cloned()
            .ok_or(StatusCode::UNAUTHORIZED)
    }
}

/// require_access
///
/// Applies the gate to every request of a route group. Only `Render` reaches the
/// handler; every other decision answers directly.
pub async fn require_access(
    State(guard): State<Guard>,
    jar: CookieJar,
    mut request: Request,
    next: Next,
) -> Response {
    let session = match guard.sessions.resolve(&jar, request.headers()).await {
        Ok(session) => session,
        Err(e) => return e.into_response(),
    };

    let state = session
        .as_ref()
        .map(|store| store.snapshot())
        .unwrap_or_else(SessionState::signed_out);
    let decision = guard.gate.evaluate(&state);
    tracing::debug!(?decision, path = %request.uri().path(), "access gate evaluated");

    match (decision.into_denial(), session) {
        (None, Some(store)) => {
            request.extensions_mut().insert(CurrentSession(store));
            next.run(request).await
        }
        (Some(denial), _) => denial,
        (None, None) => Redirect::to(LOGIN_PATH).into_response(),
    }
}

/// require_identity
///
/// Admits any signed-in session whether or not its profile has resolved. Used
/// for routes a re-synchronizing user must still reach.
pub async fn require_identity(
    State(sessions): State<SessionRegistry>,
    jar: CookieJar,
    mut request: Request,
    next: Next,
) -> Response {
    let session = match sessions.resolve(&jar, request.headers()).await {
        Ok(session) => session,
        Err(e) => return e.into_response(),
    };

    let Some(store) = session else {
        return Redirect::to(LOGIN_PATH).into_response();
    };
    let state = store.snapshot();
    if state.identity.is_none() {
        let decision = if state.loading {
            GateDecision::Loading
        } else {
            GateDecision::RedirectToLogin
        };
        if let Some(denial) = decision.into_denial() {
            return denial;
        }
    }

    request.extensions_mut().insert(CurrentSession(store));
    next.run(request).await
}
