use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use jsonwebtoken::{DecodingKey, Validation, decode, errors::ErrorKind};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tokio::sync::{RwLock, broadcast};
use uuid::Uuid;

use crate::{
    error::AuthError,
    models::{Identity, Session, SignUpMetadata},
};

/// Access tokens this close to expiry are refreshed before use.
const EXPIRY_MARGIN_SECS: i64 = 10;
/// Buffered auth events per subscriber before the oldest are dropped.
const EVENT_CAPACITY: usize = 16;
/// Audience Supabase stamps on user access tokens.
const SUPABASE_AUDIENCE: &str = "authenticated";

// --- Access Token Claims ---

/// Claims
///
/// The subset of a Supabase access token payload this service reads.
/// Tokens are HS256-signed with the project's JWT secret.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: the `auth.users.id` of the principal (also `profiles.id`).
    pub sub: Uuid,
    /// Expiration time (seconds since epoch). Always validated.
    pub exp: usize,
    /// Issued at.
    pub iat: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// session_from_access_token
///
/// Verifies a bearer access token (signature, expiry, audience) and wraps it as a
/// refresh-less `Session`. Used to adopt sessions presented by API clients that
/// authenticated against the hosted auth service directly.
pub fn session_from_access_token(token: &str, jwt_secret: &str) -> Result<Session, AuthError> {
    let decoding_key = DecodingKey::from_secret(jwt_secret.as_bytes());

    let mut validation = Validation::default();
    validation.validate_exp = true;
    validation.set_audience(&[SUPABASE_AUDIENCE]);

    let claims = decode::<Claims>(token, &decoding_key, &validation)?.claims;
    let expires_at = i64::try_from(claims.exp)
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .ok_or_else(|| AuthError::InvalidToken(ErrorKind::InvalidToken.into()))?;

    Ok(Session {
        identity: Identity {
            id: claims.sub,
            email: claims.email.unwrap_or_default(),
            last_sign_in_at: None,
        },
        access_token: token.to_string(),
        refresh_token: None,
        expires_at,
    })
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
}

// --- Session Change Notifications ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthChangeKind {
    SignedIn,
    SignedOut,
    TokenRefreshed,
}

/// AuthChange
///
/// One auth-state transition. `session` is the new session, `None` once signed out.
#[derive(Debug, Clone)]
pub struct AuthChange {
    pub kind: AuthChangeKind,
    pub session: Option<Session>,
}

impl AuthChange {
    pub fn signed_in(session: Session) -> Self {
        Self {
            kind: AuthChangeKind::SignedIn,
            session: Some(session),
        }
    }

    pub fn token_refreshed(session: Session) -> Self {
        Self {
            kind: AuthChangeKind::TokenRefreshed,
            session: Some(session),
        }
    }

    pub fn signed_out() -> Self {
        Self {
            kind: AuthChangeKind::SignedOut,
            session: None,
        }
    }
}

/// Fan-out of auth changes to every subscriber, in emission order.
struct SessionEvents {
    sender: broadcast::Sender<AuthChange>,
}

impl SessionEvents {
    fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    fn emit(&self, change: AuthChange) {
        tracing::debug!(kind = ?change.kind, "auth state changed");
        // No receivers just means nobody is listening yet.
        let _ = self.sender.send(change);
    }

    fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
        }
    }
}

/// Subscription
///
/// A persistent listener on an auth provider's change stream. Dropping it unsubscribes.
pub struct Subscription {
    receiver: broadcast::Receiver<AuthChange>,
}

impl Subscription {
    /// Next change in emission order; `None` once the provider is gone.
    /// A subscriber that fell behind skips the dropped events and continues
    /// with the oldest one still buffered.
    pub async fn next(&mut self) -> Option<AuthChange> {
        loop {
            match self.receiver.recv().await {
                Ok(change) => return Some(change),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "auth subscriber lagged; dropped events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

// --- Auth Collaborator Contract ---

/// AuthProvider
///
/// The hosted auth service as seen by one browser session. Implementations keep
/// the session's current credentials and announce every change on the
/// subscription stream; callers never mutate session state directly.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// The current session, refreshed first when its access token is about to expire.
    async fn get_current_session(&self) -> Option<Session>;

    fn on_session_change(&self) -> Subscription;

    async fn sign_in_with_password(&self, email: &str, password: &str)
    -> Result<Session, AuthError>;

    /// Returns `None` when the account was created but a session is withheld
    /// pending e-mail confirmation.
    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: &SignUpMetadata,
    ) -> Result<Option<Session>, AuthError>;

    async fn sign_out(&self) -> Result<(), AuthError>;
}

pub type AuthState = Arc<dyn AuthProvider>;

// --- Supabase (GoTrue) Implementation ---

#[derive(Deserialize)]
struct GoTrueUser {
    id: Uuid,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    last_sign_in_at: Option<DateTime<Utc>>,
}

impl From<GoTrueUser> for Identity {
    fn from(user: GoTrueUser) -> Self {
        Identity {
            id: user.id,
            email: user.email.unwrap_or_default(),
            last_sign_in_at: user.last_sign_in_at,
        }
    }
}

#[derive(Deserialize)]
struct GoTrueSession {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
    user: GoTrueUser,
}

impl GoTrueSession {
    fn into_session(self) -> Session {
        let expires_at = match (self.expires_at, self.expires_in) {
            (Some(at), _) => timestamp(at),
            (None, Some(secs)) => Utc::now() + ChronoDuration::seconds(secs),
            (None, None) => Utc::now() + ChronoDuration::hours(1),
        };
        Session {
            identity: self.user.into(),
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
        }
    }
}

/// Sign-up answers with a full session when auto-confirm is on, otherwise with the bare user.
#[derive(Deserialize)]
#[serde(untagged)]
enum SignUpBody {
    Session(GoTrueSession),
    User(GoTrueUser),
}

#[derive(Deserialize, Default)]
struct GoTrueErrorBody {
    error_description: Option<String>,
    msg: Option<String>,
    message: Option<String>,
    error: Option<String>,
}

impl GoTrueErrorBody {
    fn into_message(self, status: StatusCode) -> String {
        self.error_description
            .or(self.msg)
            .or(self.message)
            .or(self.error)
            .unwrap_or_else(|| status.to_string())
    }
}

async fn rejection(response: reqwest::Response, credentials: bool) -> AuthError {
    let status = response.status();
    let message = response
        .json::<GoTrueErrorBody>()
        .await
        .unwrap_or_default()
        .into_message(status);

    match status {
        StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED if credentials => {
            AuthError::InvalidCredentials(message)
        }
        _ => AuthError::Rejected {
            status: status.as_u16(),
            message,
        },
    }
}

/// SupabaseAuthClient
///
/// GoTrue client bound to a single browser session. Holds that session's tokens
/// in memory and refreshes them on demand.
pub struct SupabaseAuthClient {
    http: reqwest::Client,
    auth_url: String,
    anon_key: String,
    current: RwLock<Option<Session>>,
    events: SessionEvents,
}

impl SupabaseAuthClient {
    pub fn new(http: reqwest::Client, project_url: &str, anon_key: &str) -> Self {
        Self {
            http,
            auth_url: format!("{}/auth/v1", project_url.trim_end_matches('/')),
            anon_key: anon_key.to_string(),
            current: RwLock::new(None),
            events: SessionEvents::new(),
        }
    }

    /// Seeds the client with a session obtained elsewhere (a verified bearer token).
    pub fn with_session(self, session: Session) -> Self {
        Self {
            current: RwLock::new(Some(session)),
            ..self
        }
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Session, AuthError> {
        let response = self
            .http
            .post(format!("{}/token", self.auth_url))
            .query(&[("grant_type", "refresh_token")])
            .header("apikey", &self.anon_key)
            .json(&serde_json::json!({ "refresh_token": refresh_token }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(rejection(response, false).await);
        }
        Ok(response.json::<GoTrueSession>().await?.into_session())
    }
}

#[async_trait]
impl AuthProvider for SupabaseAuthClient {
    async fn get_current_session(&self) -> Option<Session> {
        {
            let current = self.current.read().await;
            match current.as_ref() {
                None => return None,
                Some(s) if !s.expires_within(ChronoDuration::seconds(EXPIRY_MARGIN_SECS)) => {
                    return Some(s.clone());
                }
                Some(_) => {}
            }
        }

        // Expiring: hold the write lock so concurrent readers share one refresh.
        let mut current = self.current.write().await;
        let session = current.clone()?;
        if !session.expires_within(ChronoDuration::seconds(EXPIRY_MARGIN_SECS)) {
            return Some(session);
        }

        let refreshed = match session.refresh_token.as_deref() {
            Some(token) => self.refresh(token).await,
            None => Err(AuthError::Rejected {
                status: StatusCode::UNAUTHORIZED.as_u16(),
                message: "session expired and carries no refresh token".into(),
            }),
        };

        match refreshed {
            Ok(fresh) => {
                *current = Some(fresh.clone());
                self.events.emit(AuthChange::token_refreshed(fresh.clone()));
                Some(fresh)
            }
            Err(e) => {
                tracing::warn!(user_id = %session.identity.id, error = %e, "session refresh failed; signing out locally");
                *current = None;
                self.events.emit(AuthChange::signed_out());
                None
            }
        }
    }

    fn on_session_change(&self) -> Subscription {
        self.events.subscribe()
    }

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Session, AuthError> {
        let response = self
            .http
            .post(format!("{}/token", self.auth_url))
            .query(&[("grant_type", "password")])
            .header("apikey", &self.anon_key)
            .json(&serde_json::json!({ "email": email, "password": password }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(rejection(response, true).await);
        }

        let session = response.json::<GoTrueSession>().await?.into_session();
        *self.current.write().await = Some(session.clone());
        self.events.emit(AuthChange::signed_in(session.clone()));
        Ok(session)
    }

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: &SignUpMetadata,
    ) -> Result<Option<Session>, AuthError> {
        let response = self
            .http
            .post(format!("{}/signup", self.auth_url))
            .header("apikey", &self.anon_key)
            .json(&serde_json::json!({
                "email": email,
                "password": password,
                "data": metadata,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(rejection(response, false).await);
        }

        match response.json::<SignUpBody>().await? {
            SignUpBody::Session(body) => {
                let session = body.into_session();
                *self.current.write().await = Some(session.clone());
                self.events.emit(AuthChange::signed_in(session.clone()));
                Ok(Some(session))
            }
            SignUpBody::User(user) => {
                tracing::info!(user_id = %user.id, "account created; awaiting e-mail confirmation");
                Ok(None)
            }
        }
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        let Some(session) = self.current.write().await.take() else {
            return Ok(());
        };

        let result = self
            .http
            .post(format!("{}/logout", self.auth_url))
            .header("apikey", &self.anon_key)
            .bearer_auth(&session.access_token)
            .send()
            .await;

        // Local credentials are gone either way; listeners learn of it now.
        self.events.emit(AuthChange::signed_out());

        let response = result?;
        match response.status() {
            s if s.is_success() => Ok(()),
            // Token already revoked or expired server-side.
            StatusCode::UNAUTHORIZED | StatusCode::NOT_FOUND => Ok(()),
            _ => Err(rejection(response, false).await),
        }
    }
}

// --- Mock Implementation (For Tests) ---

struct MockAccount {
    password: String,
    identity: Identity,
}

/// MockAuthProvider
///
/// In-memory auth collaborator for tests. Accounts are registered up front;
/// `emit` injects changes the hosted service would push (refreshes, remote sign-outs).
pub struct MockAuthProvider {
    current: RwLock<Option<Session>>,
    accounts: Mutex<HashMap<String, MockAccount>>,
    events: SessionEvents,
    /// When false, sign-up creates the account but withholds the session.
    pub auto_confirm: bool,
    /// Metadata received by `sign_up`, in call order.
    pub sign_ups: Mutex<Vec<(String, SignUpMetadata)>>,
}

impl MockAuthProvider {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(None),
            accounts: Mutex::new(HashMap::new()),
            events: SessionEvents::new(),
            auto_confirm: true,
            sign_ups: Mutex::new(Vec::new()),
        }
    }

    /// A provider that already holds `session`, as after a page reload.
    pub fn with_session(session: Session) -> Self {
        Self {
            current: RwLock::new(Some(session)),
            ..Self::new()
        }
    }

    pub fn add_account(&self, email: &str, password: &str, id: Uuid) -> Identity {
        let identity = Identity {
            id,
            email: email.to_string(),
            last_sign_in_at: None,
        };
        self.accounts
            .lock()
            .expect("mock account lock poisoned")
            .insert(
                email.to_string(),
                MockAccount {
                    password: password.to_string(),
                    identity: identity.clone(),
                },
            );
        identity
    }

    /// Replaces the held session as the hosted service would and announces it.
    pub async fn emit(&self, change: AuthChange) {
        *self.current.write().await = change.session.clone();
        self.events.emit(change);
    }
}

impl Default for MockAuthProvider {
    fn default() -> Self {
        Self::new()
    }
}

/// A session for `identity` with a placeholder token valid for an hour.
pub fn mock_session(identity: Identity) -> Session {
    Session {
        access_token: format!("mock-access-{}", identity.id),
        refresh_token: Some(format!("mock-refresh-{}", identity.id)),
        expires_at: Utc::now() + ChronoDuration::hours(1),
        identity,
    }
}

#[async_trait]
impl AuthProvider for MockAuthProvider {
    async fn get_current_session(&self) -> Option<Session> {
        self.current.read().await.clone()
    }

    fn on_session_change(&self) -> Subscription {
        self.events.subscribe()
    }

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Session, AuthError> {
        let identity = {
            let accounts = self.accounts.lock().expect("mock account lock poisoned");
            match accounts.get(email) {
                Some(account) if account.password == password => account.identity.clone(),
                _ => {
                    return Err(AuthError::InvalidCredentials(
                        "Invalid login credentials".into(),
                    ));
                }
            }
        };

        let session = mock_session(Identity {
            last_sign_in_at: Some(Utc::now()),
            ..identity
        });
        self.emit(AuthChange::signed_in(session.clone())).await;
        Ok(session)
    }

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: &SignUpMetadata,
    ) -> Result<Option<Session>, AuthError> {
        if self
            .accounts
            .lock()
            .expect("mock account lock poisoned")
            .contains_key(email)
        {
            return Err(AuthError::Rejected {
                status: 422,
                message: "User already registered".into(),
            });
        }

        self.sign_ups
            .lock()
            .expect("mock sign-up lock poisoned")
            .push((email.to_string(), metadata.clone()));
        let identity = self.add_account(email, password, Uuid::new_v4());

        if !self.auto_confirm {
            return Ok(None);
        }
        let session = mock_session(identity);
        self.emit(AuthChange::signed_in(session.clone())).await;
        Ok(Some(session))
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        if self.current.read().await.is_none() {
            return Ok(());
        }
        self.emit(AuthChange::signed_out()).await;
        Ok(())
    }
}
