use std::{
    sync::{
        Arc, OnceLock, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{sync::watch, task::JoinHandle};
use uuid::Uuid;

use crate::{
    auth::{AuthChange, AuthState, Subscription},
    config::RetryPolicy,
    error::{AuthError, ProfileFetchError},
    models::{AuthorizationProfile, Identity, Role, Session, SessionState, SignUpMetadata},
    repository::RepositoryState,
};

/// SessionHandle
///
/// Shared handle to one browser session's store. Cloned into request extensions
/// and background tasks; the store lives as long as any handle does.
pub type SessionHandle = Arc<SessionStore>;

/// SessionStore
///
/// Single source of truth for who is signed in on one session and what they may do.
///
/// State is published through a `watch` channel: every transition replaces the
/// whole `SessionState`, so readers never see a half-applied update. Auth changes
/// arrive on the provider's subscription and are applied in emission order by one
/// listener task. Profile fetches are tagged with an epoch; a fetch whose epoch has
/// been superseded (by a newer fetch or a sign-out) writes nothing.
pub struct SessionStore {
    auth: Option<AuthState>,
    repo: RepositoryState,
    retry: RetryPolicy,
    state: watch::Sender<SessionState>,
    epoch: AtomicU64,
    listener: OnceLock<JoinHandle<()>>,
}

impl SessionStore {
    /// initialize
    ///
    /// Builds the store, subscribes to auth changes for its whole lifetime and
    /// probes for an existing session. With no auth collaborator the store
    /// settles immediately as signed out.
    pub async fn initialize(
        auth: Option<AuthState>,
        repo: RepositoryState,
        retry: RetryPolicy,
    ) -> SessionHandle {
        let (state, _) = watch::channel(SessionState::initial());
        let store = Arc::new(Self {
            auth,
            repo,
            retry,
            state,
            epoch: AtomicU64::new(0),
            listener: OnceLock::new(),
        });

        let Some(auth) = store.auth.clone() else {
            tracing::warn!("auth client not configured; session stays signed out");
            store.state.send_modify(|s| s.loading = false);
            return store;
        };

        // Subscribe before probing so a change emitted by the probe itself is not missed.
        let listener = tokio::spawn(listen(Arc::downgrade(&store), auth.on_session_change()));
        let _ = store.listener.set(listener);

        match auth.get_current_session().await {
            Some(session) => {
                tracing::debug!(user_id = %session.identity.id, "restored existing session");
                store.adopt(session.identity);
            }
            None => {
                // A change that raced the probe may already have set an identity.
                store.state.send_if_modified(|s| {
                    if s.identity.is_some() {
                        return false;
                    }
                    s.loading = false;
                    true
                });
            }
        }

        store
    }

    /// Current state snapshot.
    pub fn snapshot(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Receiver notified on every state replacement.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn is_configured(&self) -> bool {
        self.auth.is_some()
    }

    /// The active session's access token, for data calls made on the user's behalf.
    pub async fn access_token(&self) -> Option<String> {
        let auth = self.auth.as_ref()?;
        auth.get_current_session().await.map(|s| s.access_token)
    }

    // --- Session Lifecycle ---

    /// sign_in
    ///
    /// Delegates to the auth collaborator. State changes only when the resulting
    /// auth event is applied.
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Session, AuthError> {
        let auth = self.auth.as_ref().ok_or(AuthError::NotInitialized)?;
        match auth.sign_in_with_password(email, password).await {
            Ok(session) => {
                tracing::info!(user_id = %session.identity.id, "sign-in accepted");
                Ok(session)
            }
            Err(e) => {
                tracing::warn!(error = %e, "sign-in rejected");
                Err(e)
            }
        }
    }

    /// sign_up
    ///
    /// Creates the account with `metadata` attached for profile provisioning.
    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: &SignUpMetadata,
    ) -> Result<Option<Session>, AuthError> {
        let auth = self.auth.as_ref().ok_or(AuthError::NotInitialized)?;
        let session = auth.sign_up(email, password, metadata).await?;
        tracing::info!(role = %metadata.role, session_started = session.is_some(), "sign-up accepted");
        Ok(session)
    }

    /// sign_out
    ///
    /// Resolves when the collaborator call returns; clearing the state follows
    /// from the signed-out event. A no-op without an auth collaborator.
    pub async fn sign_out(&self) -> Result<(), AuthError> {
        match &self.auth {
            Some(auth) => auth.sign_out().await,
            None => Ok(()),
        }
    }

    // --- Profile Resolution ---

    /// refresh_profile
    ///
    /// Re-reads the authorization profile, e.g. after a mutation elsewhere changed
    /// the user's role or status.
    pub async fn refresh_profile(&self, user_id: Uuid) {
        self.fetch_profile(user_id).await;
    }

    /// fetch_profile
    ///
    /// Resolves the profile for `user_id` and publishes it if this fetch is still
    /// the latest one. Failures are logged and recorded in `profile_error`; the
    /// previous profile is kept. `loading` is cleared on every exit path.
    pub async fn fetch_profile(&self, user_id: Uuid) {
        let epoch = self.begin_fetch();
        self.run_fetch(user_id, epoch).await;
    }

    /// Waits until the state reflects `user_id` with no fetch pending, or `timeout` passes.
    pub async fn resolved_for(&self, user_id: Uuid, timeout: Duration) -> SessionState {
        self.wait_for(timeout, |s| s.user_id() == Some(user_id) && !s.loading)
            .await
    }

    /// Waits until no fetch is pending, or `timeout` passes.
    pub async fn settled(&self, timeout: Duration) -> SessionState {
        self.wait_for(timeout, |s| !s.loading).await
    }

    async fn wait_for(
        &self,
        timeout: Duration,
        predicate: impl FnMut(&SessionState) -> bool,
    ) -> SessionState {
        let mut receiver = self.state.subscribe();
        match tokio::time::timeout(timeout, receiver.wait_for(predicate)).await {
            Ok(Ok(state)) => SessionState::clone(&state),
            _ => self.snapshot(),
        }
    }

    fn apply_change(self: &Arc<Self>, change: AuthChange) {
        tracing::debug!(kind = ?change.kind, "applying auth change");
        match change.session {
            Some(session) => self.adopt(session.identity),
            None => self.clear(),
        }
    }

    /// Installs `identity` and starts a profile fetch for it. A profile belonging to
    /// a different user is dropped; the same user's profile is kept while the new
    /// fetch runs. Identity and `loading` change in one transition, so no reader
    /// sees the new identity marked as settled.
    fn adopt(self: &Arc<Self>, identity: Identity) {
        let user_id = identity.id;
        let mut epoch = 0;
        self.state.send_modify(|s| {
            if s.user_id() != Some(user_id) {
                s.profile = None;
                s.profile_error = None;
            }
            s.identity = Some(identity);
            epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
            s.loading = true;
        });

        let store = Arc::clone(self);
        tokio::spawn(async move { store.run_fetch(user_id, epoch).await });
    }

    fn clear(&self) {
        self.state.send_modify(|s| {
            // Supersede in-flight fetches so they cannot repopulate the profile.
            self.epoch.fetch_add(1, Ordering::SeqCst);
            *s = SessionState::signed_out();
        });
    }

    fn begin_fetch(&self) -> u64 {
        let mut epoch = 0;
        self.state.send_modify(|s| {
            epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
            s.loading = true;
        });
        epoch
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    async fn run_fetch(&self, user_id: Uuid, epoch: u64) {
        let _loading = LoadingGuard { store: self, epoch };
        let mut attempt = 1;

        loop {
            match self.load_profile(user_id).await {
                Ok(profile) => {
                    let role = profile.role;
                    let applied = self.state.send_if_modified(|s| {
                        if !self.is_current(epoch) || s.user_id() != Some(user_id) {
                            return false;
                        }
                        s.profile = Some(profile);
                        s.profile_error = None;
                        true
                    });
                    if applied {
                        tracing::info!(%user_id, %role, "authorization profile resolved");
                    } else {
                        tracing::debug!(%user_id, epoch, "discarding superseded profile result");
                    }
                    return;
                }
                Err(e)
                    if e.is_transient()
                        && attempt < self.retry.max_attempts
                        && self.is_current(epoch) =>
                {
                    let delay = self.retry.backoff(attempt);
                    tracing::warn!(%user_id, attempt, error = %e, ?delay, "profile fetch failed; retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(%user_id, attempt, error = %e, "profile fetch failed");
                    self.state.send_if_modified(|s| {
                        if !self.is_current(epoch) {
                            return false;
                        }
                        s.profile_error = Some(e.to_string());
                        true
                    });
                    return;
                }
            }
        }
    }

    async fn load_profile(&self, user_id: Uuid) -> Result<AuthorizationProfile, ProfileFetchError> {
        let auth = self.auth.as_ref().ok_or(ProfileFetchError::NoSession)?;
        let session = auth
            .get_current_session()
            .await
            .ok_or(ProfileFetchError::NoSession)?;
        let token = session.access_token.as_str();

        let record = self.repo.get_profile(token, user_id).await?;
        let student = match record.role.parse::<Role>()? {
            Role::Student => Some(self.repo.get_student(token, user_id).await?),
            Role::Admin | Role::Staff => None,
        };

        Ok(AuthorizationProfile::from_records(record, student)?)
    }
}

impl Drop for SessionStore {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.get() {
            listener.abort();
        }
    }
}

/// Clears `loading` when a fetch ends, however it ends, unless a newer fetch owns it.
struct LoadingGuard<'a> {
    store: &'a SessionStore,
    epoch: u64,
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        let store = self.store;
        let epoch = self.epoch;
        store.state.send_if_modified(|s| {
            if !store.is_current(epoch) || !s.loading {
                return false;
            }
            s.loading = false;
            true
        });
    }
}

async fn listen(store: Weak<SessionStore>, mut subscription: Subscription) {
    while let Some(change) = subscription.next().await {
        let Some(store) = store.upgrade() else {
            break;
        };
        store.apply_change(change);
    }
    tracing::debug!("auth subscription closed");
}
