use axum::http::{HeaderMap, header};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::{DateTime, Utc};
use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicI64, Ordering},
    },
    time::Duration,
};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    auth::{AuthState, MockAuthProvider, SupabaseAuthClient, session_from_access_token},
    config::{AppConfig, RetryPolicy},
    error::AuthError,
    models::Session,
    repository::{MockRepository, RepositoryState},
    session::{SessionHandle, SessionStore},
};

/// Cookie carrying the opaque id of a browser's session store.
pub const SESSION_COOKIE: &str = "registry_session";

// Namespace for store ids derived from bearer tokens, so repeat requests with the
// same token land on the same store.
const BEARER_NAMESPACE: Uuid = Uuid::from_u128(0x6c1e_52a4_8f0b_4d7e_9a3c_2b5e_71d0_c8f4);

/// SessionBackend Trait
///
/// Supplies the collaborators each new session store is built from. The auth
/// collaborator is per session (it holds that session's tokens); the data layer
/// is shared.
pub trait SessionBackend: Send + Sync {
    /// A fresh auth collaborator, seeded with `restored` when the session is being
    /// restored from a bearer token. `None` when auth is not configured.
    fn auth_provider(&self, restored: Option<Session>) -> Option<AuthState>;
    fn repository(&self) -> RepositoryState;
}

pub type BackendState = Arc<dyn SessionBackend>;

// --- Supabase ---

/// SupabaseBackend
///
/// Production backend: one GoTrue client per session over a shared HTTP pool.
pub struct SupabaseBackend {
    http: reqwest::Client,
    project: Option<(String, String)>,
    repo: RepositoryState,
}

impl SupabaseBackend {
    pub fn new(http: reqwest::Client, config: &AppConfig, repo: RepositoryState) -> Self {
        Self {
            http,
            project: config
                .supabase()
                .map(|(url, key)| (url.to_string(), key.to_string())),
            repo,
        }
    }
}

impl SessionBackend for SupabaseBackend {
    fn auth_provider(&self, restored: Option<Session>) -> Option<AuthState> {
        let (url, key) = self.project.as_ref()?;
        let client = SupabaseAuthClient::new(self.http.clone(), url, key);
        let client = match restored {
            Some(session) => client.with_session(session),
            None => client,
        };
        Some(Arc::new(client))
    }

    fn repository(&self) -> RepositoryState {
        self.repo.clone()
    }
}

// --- Mock Implementation (For Tests) ---

/// MockBackend
///
/// Hands every new session a `MockAuthProvider` preloaded with the registered
/// accounts, over one shared `MockRepository`. Providers are kept so tests can
/// push auth changes into a live session.
pub struct MockBackend {
    pub repo: Arc<MockRepository>,
    accounts: Mutex<Vec<(String, String, Uuid)>>,
    providers: Mutex<Vec<Arc<MockAuthProvider>>>,
    configured: bool,
}

impl MockBackend {
    pub fn new(repo: Arc<MockRepository>) -> Self {
        Self {
            repo,
            accounts: Mutex::new(Vec::new()),
            providers: Mutex::new(Vec::new()),
            configured: true,
        }
    }

    /// A backend whose sessions have no auth collaborator at all.
    pub fn unconfigured(repo: Arc<MockRepository>) -> Self {
        Self {
            configured: false,
            ..Self::new(repo)
        }
    }

    pub fn add_account(&self, email: &str, password: &str, id: Uuid) {
        self.accounts
            .lock()
            .expect("mock backend lock poisoned")
            .push((email.to_string(), password.to_string(), id));
    }

    /// The provider handed to the most recently created session.
    pub fn last_provider(&self) -> Option<Arc<MockAuthProvider>> {
        self.providers
            .lock()
            .expect("mock backend lock poisoned")
            .last()
            .cloned()
    }
}

impl SessionBackend for MockBackend {
    fn auth_provider(&self, restored: Option<Session>) -> Option<AuthState> {
        if !self.configured {
            return None;
        }
        let provider = match restored {
            Some(session) => MockAuthProvider::with_session(session),
            None => MockAuthProvider::new(),
        };
        for (email, password, id) in self
            .accounts
            .lock()
            .expect("mock backend lock poisoned")
            .iter()
        {
            provider.add_account(email, password, *id);
        }

        let provider = Arc::new(provider);
        self.providers
            .lock()
            .expect("mock backend lock poisoned")
            .push(provider.clone());
        Some(provider)
    }

    fn repository(&self) -> RepositoryState {
        self.repo.clone()
    }
}

// --- Registry ---

/// One tracked store. Bearer stores also carry their token's expiry.
struct Entry {
    store: SessionHandle,
    expires_at: Option<DateTime<Utc>>,
    last_seen_ms: AtomicI64,
}

impl Entry {
    fn new(store: SessionHandle, expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Self {
        Self {
            store,
            expires_at,
            last_seen_ms: AtomicI64::new(now.timestamp_millis()),
        }
    }

    fn touch(&self, now: DateTime<Utc>) {
        self.last_seen_ms
            .store(now.timestamp_millis(), Ordering::Relaxed);
    }

    /// Settled signed out, past its token's expiry, or idle too long.
    fn is_stale(&self, now: DateTime<Utc>, idle_timeout: Duration) -> bool {
        let state = self.store.snapshot();
        if state.identity.is_none() && !state.loading {
            return true;
        }
        if self.expires_at.is_some_and(|at| at <= now) {
            return true;
        }
        let idle_ms = now.timestamp_millis() - self.last_seen_ms.load(Ordering::Relaxed);
        idle_ms > i64::try_from(idle_timeout.as_millis()).unwrap_or(i64::MAX)
    }
}

struct RegistryInner {
    backend: BackendState,
    stores: RwLock<HashMap<Uuid, Entry>>,
    jwt_secret: String,
    retry: RetryPolicy,
    settle_timeout: Duration,
    idle_timeout: Duration,
}

/// SessionRegistry
///
/// Tracks one `SessionStore` per signed-in browser session, keyed by the id in
/// the session cookie. Requests carrying `Authorization: Bearer` instead get a
/// store restored from the verified token.
///
/// Only signed-in stores are tracked. A store leaves the registry on logout, once
/// it settles signed out (remote revocation, failed refresh), when its bearer
/// token expires, or after sitting idle for the configured timeout. Stale entries
/// are dropped when looked up and swept on every insertion.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(backend: BackendState, config: &AppConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                backend,
                stores: RwLock::new(HashMap::new()),
                jwt_secret: config.jwt_secret.clone(),
                retry: config.profile_retry,
                settle_timeout: config.settle_timeout,
                idle_timeout: config.session_idle_timeout,
            }),
        }
    }

    pub fn settle_timeout(&self) -> Duration {
        self.inner.settle_timeout
    }

    /// The shared data layer, for calls made with a session's access token.
    pub fn repository(&self) -> RepositoryState {
        self.inner.backend.repository()
    }

    /// open
    ///
    /// Builds a new, signed-out session store and picks its id. The store is not
    /// tracked until `register` is called with it.
    pub async fn open(&self) -> (Uuid, SessionHandle) {
        (Uuid::new_v4(), self.build(None).await)
    }

    /// Starts tracking a signed-in store under `id`, the value of its cookie.
    pub async fn register(&self, id: Uuid, store: SessionHandle) -> SessionHandle {
        let store = self.insert(id, store, None).await;
        tracing::debug!(session_id = %id, "session registered");
        store
    }

    /// The live store for `id`. A stale entry is dropped instead of returned.
    pub async fn get(&self, id: Uuid) -> Option<SessionHandle> {
        let now = Utc::now();
        {
            let stores = self.inner.stores.read().await;
            let entry = stores.get(&id)?;
            if !entry.is_stale(now, self.inner.idle_timeout) {
                entry.touch(now);
                return Some(entry.store.clone());
            }
        }

        let mut stores = self.inner.stores.write().await;
        if stores
            .get(&id)
            .is_some_and(|entry| entry.is_stale(now, self.inner.idle_timeout))
        {
            stores.remove(&id);
            tracing::debug!(session_id = %id, "stale session evicted");
        }
        None
    }

    /// The cookie's session, when it names a live store.
    pub async fn by_cookie(&self, jar: &CookieJar) -> Option<(Uuid, SessionHandle)> {
        let id = session_id(jar)?;
        self.get(id).await.map(|store| (id, store))
    }

    /// resolve
    ///
    /// Finds the session a request belongs to: the cookie's store first, then a
    /// store restored from a bearer token. A restored store is returned once its
    /// first profile fetch settles (bounded by the settle timeout).
    ///
    /// A token accepted within the verification leeway but already past its expiry
    /// gets a one-off store that is never tracked.
    ///
    /// # Errors
    /// `AuthError::InvalidToken` when a bearer token fails verification.
    pub async fn resolve(
        &self,
        jar: &CookieJar,
        headers: &HeaderMap,
    ) -> Result<Option<SessionHandle>, AuthError> {
        if let Some((_, store)) = self.by_cookie(jar).await {
            return Ok(Some(store));
        }

        let Some(token) = bearer_token(headers) else {
            return Ok(None);
        };
        // Verified on every request so an expired token never reuses its store.
        let session = session_from_access_token(token, &self.inner.jwt_secret)?;
        let id = Uuid::new_v5(&BEARER_NAMESPACE, token.as_bytes());
        if let Some(store) = self.get(id).await {
            return Ok(Some(store));
        }

        let user_id = session.identity.id;
        let expires_at = session.expires_at;
        let store = self.build(Some(session)).await;
        let store = if expires_at > Utc::now() {
            // Concurrent first requests with the same token share whichever store landed first.
            self.insert(id, store, Some(expires_at)).await
        } else {
            store
        };
        tracing::debug!(%user_id, %expires_at, "session restored from bearer token");

        store.resolved_for(user_id, self.inner.settle_timeout).await;
        Ok(Some(store))
    }

    /// Drops the store for `id`. Its listener stops with the last handle.
    pub async fn close(&self, id: Uuid) -> Option<SessionHandle> {
        let removed = self.inner.stores.write().await.remove(&id);
        if removed.is_some() {
            tracing::debug!(session_id = %id, "session closed");
        }
        removed.map(|entry| entry.store)
    }

    /// Number of tracked stores, stale ones not yet swept included.
    pub async fn active_count(&self) -> usize {
        self.inner.stores.read().await.len()
    }

    async fn insert(
        &self,
        id: Uuid,
        store: SessionHandle,
        expires_at: Option<DateTime<Utc>>,
    ) -> SessionHandle {
        let now = Utc::now();
        let idle_timeout = self.inner.idle_timeout;
        let mut stores = self.inner.stores.write().await;

        let before = stores.len();
        stores.retain(|_, entry| !entry.is_stale(now, idle_timeout));
        let swept = before - stores.len();
        if swept > 0 {
            tracing::debug!(swept, "stale sessions swept");
        }

        stores
            .entry(id)
            .or_insert_with(|| Entry::new(store, expires_at, now))
            .store
            .clone()
    }

    async fn build(&self, restored: Option<Session>) -> SessionHandle {
        let backend = &self.inner.backend;
        SessionStore::initialize(
            backend.auth_provider(restored),
            backend.repository(),
            self.inner.retry,
        )
        .await
    }
}

/// The session id carried by `jar`, if well-formed.
pub fn session_id(jar: &CookieJar) -> Option<Uuid> {
    jar.get(SESSION_COOKIE)
        .and_then(|cookie| Uuid::parse_str(cookie.value()).ok())
}

/// The session cookie for store `id`. `secure` restricts it to HTTPS.
pub fn session_cookie(id: Uuid, secure: bool) -> Cookie<'static> {
    Cookie::build((SESSION_COOKIE, id.to_string()))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(secure)
        .build()
}

/// Removal cookie matching `session_cookie`'s path.
pub fn expired_session_cookie() -> Cookie<'static> {
    Cookie::build(SESSION_COOKIE).path("/").build()
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}
