use registry_portal::{
    SessionHandle, SessionStore,
    auth::{AuthChange, AuthState, MockAuthProvider, mock_session},
    config::RetryPolicy,
    error::{AuthError, QueryError},
    models::{
        Identity, ProfileRecord, Role, SessionState, SignUpMetadata, StudentRecord, StudentStatus,
    },
    repository::{MockRepository, RepositoryState},
};
use chrono::Utc;
use std::{sync::Arc, time::Duration};
use uuid::Uuid;

// --- Fixtures ---

const WAIT: Duration = Duration::from_secs(2);

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
    }
}

fn identity(id: Uuid) -> Identity {
    Identity {
        id,
        email: format!("{id}@registry.test"),
        last_sign_in_at: None,
    }
}

fn profile_record(id: Uuid, role: &str) -> ProfileRecord {
    ProfileRecord {
        id,
        full_name: Some("Grace Registrar".to_string()),
        role: role.to_string(),
        email: None,
    }
}

fn student_record(user_id: Uuid, status: &str, deleted: bool) -> StudentRecord {
    StudentRecord {
        user_id,
        status: status.to_string(),
        deleted_at: deleted.then(Utc::now),
    }
}

struct Harness {
    store: SessionHandle,
    auth: Arc<MockAuthProvider>,
    repo: Arc<MockRepository>,
}

async fn start(auth: MockAuthProvider, repo: MockRepository, retry: RetryPolicy) -> Harness {
    let auth = Arc::new(auth);
    let repo = Arc::new(repo);
    let store = SessionStore::initialize(
        Some(auth.clone() as AuthState),
        repo.clone() as RepositoryState,
        retry,
    )
    .await;
    Harness { store, auth, repo }
}

/// Starts a store already signed in as `id`, with its profile resolved.
async fn signed_in(id: Uuid, role: &str) -> Harness {
    let repo = MockRepository::new();
    repo.put_profile(profile_record(id, role));
    if role == "student" {
        repo.put_student(student_record(id, "active", false));
    }
    let harness = start(
        MockAuthProvider::with_session(mock_session(identity(id))),
        repo,
        fast_retry(3),
    )
    .await;
    let state = harness.store.settled(WAIT).await;
    assert!(state.profile.is_some(), "fixture profile should resolve");
    harness
}

async fn wait_until(
    store: &SessionHandle,
    predicate: impl FnMut(&SessionState) -> bool,
) -> SessionState {
    let mut receiver = store.subscribe();
    let state = tokio::time::timeout(WAIT, receiver.wait_for(predicate))
        .await
        .expect("timed out waiting for session state")
        .expect("session store dropped");
    SessionState::clone(&state)
}

// --- Initialization ---

#[tokio::test]
async fn test_initialize_without_auth_settles_signed_out() {
    let store = SessionStore::initialize(
        None,
        Arc::new(MockRepository::new()) as RepositoryState,
        RetryPolicy::none(),
    )
    .await;

    assert!(!store.is_configured());
    assert_eq!(store.snapshot(), SessionState::signed_out());

    let err = store.sign_in("a@b.c", "pw").await.unwrap_err();
    assert!(matches!(err, AuthError::NotInitialized));
    let metadata = SignUpMetadata {
        full_name: "A".to_string(),
        role: Role::Student,
    };
    assert!(matches!(
        store.sign_up("a@b.c", "pw", &metadata).await,
        Err(AuthError::NotInitialized)
    ));
    assert!(store.sign_out().await.is_ok());
}

#[tokio::test]
async fn test_initialize_without_session_is_signed_out() {
    let h = start(MockAuthProvider::new(), MockRepository::new(), fast_retry(1)).await;

    let state = h.store.settled(WAIT).await;
    assert_eq!(state, SessionState::signed_out());
    assert_eq!(h.repo.profile_calls(), 0);
}

#[tokio::test]
async fn test_initialize_restores_existing_session() {
    let id = Uuid::new_v4();
    let h = signed_in(id, "admin").await;

    let state = h.store.snapshot();
    assert_eq!(state.user_id(), Some(id));
    assert_eq!(state.role(), Some(Role::Admin));
    assert!(!state.loading);
    assert_eq!(state.profile_error, None);
}

// --- Sign-in / Sign-out ---

#[tokio::test]
async fn test_sign_in_round_trip_populates_role() {
    let auth = MockAuthProvider::new();
    let id = Uuid::new_v4();
    auth.add_account("staff@registry.test", "correct horse", id);
    let repo = MockRepository::new();
    repo.put_profile(profile_record(id, "staff"));
    let h = start(auth, repo, fast_retry(1)).await;

    let session = h
        .store
        .sign_in("staff@registry.test", "correct horse")
        .await
        .expect("sign-in should succeed");
    let state = h.store.resolved_for(session.identity.id, WAIT).await;

    assert_eq!(state.role(), Some(Role::Staff));
    assert!(!state.loading);
}

#[tokio::test]
async fn test_sign_in_rejection_leaves_state_untouched() {
    let auth = MockAuthProvider::new();
    auth.add_account("staff@registry.test", "correct horse", Uuid::new_v4());
    let h = start(auth, MockRepository::new(), fast_retry(1)).await;

    let err = h
        .store
        .sign_in("staff@registry.test", "wrong")
        .await
        .unwrap_err();

    assert!(matches!(err, AuthError::InvalidCredentials(_)));
    assert_eq!(h.store.snapshot(), SessionState::signed_out());
}

#[tokio::test]
async fn test_sign_up_attaches_metadata() {
    let h = start(MockAuthProvider::new(), MockRepository::new(), fast_retry(1)).await;
    let metadata = SignUpMetadata {
        full_name: "New Student".to_string(),
        role: Role::Student,
    };

    let session = h
        .store
        .sign_up("new@registry.test", "pw", &metadata)
        .await
        .expect("sign-up should succeed");

    assert!(session.is_some());
    let recorded = h.auth.sign_ups.lock().unwrap().clone();
    assert_eq!(recorded, vec![("new@registry.test".to_string(), metadata)]);
}

#[tokio::test]
async fn test_sign_out_clears_identity_and_profile() {
    let h = signed_in(Uuid::new_v4(), "admin").await;

    h.store.sign_out().await.expect("sign-out should succeed");
    let state = wait_until(&h.store, |s| s.identity.is_none()).await;

    assert_eq!(state, SessionState::signed_out());
}

#[tokio::test]
async fn test_remote_sign_out_event_clears_state() {
    let h = signed_in(Uuid::new_v4(), "staff").await;

    h.auth.emit(AuthChange::signed_out()).await;
    let state = wait_until(&h.store, |s| s.identity.is_none()).await;

    assert_eq!(state.profile, None);
    assert!(!state.loading);
}

// --- Profile Resolution ---

#[tokio::test]
async fn test_student_profile_merges_student_record() {
    let id = Uuid::new_v4();
    let h = signed_in(id, "student").await;

    let profile = h.store.snapshot().profile.expect("profile");
    assert_eq!(profile.role, Role::Student);
    assert_eq!(profile.student_status, Some(StudentStatus::Active));
    assert_eq!(profile.is_deleted, Some(false));

    h.repo.put_student(student_record(id, "inactive", true));
    h.store.refresh_profile(id).await;

    let profile = h.store.snapshot().profile.expect("profile");
    assert_eq!(profile.student_status, Some(StudentStatus::Inactive));
    assert_eq!(profile.is_deleted, Some(true));
}

#[tokio::test]
async fn test_failed_refresh_keeps_previous_profile() {
    let id = Uuid::new_v4();
    let h = signed_in(id, "admin").await;

    h.repo.fail_next(QueryError::NotFound {
        table: "profiles",
        id,
    });
    h.store.refresh_profile(id).await;

    let state = h.store.snapshot();
    assert_eq!(state.role(), Some(Role::Admin));
    assert!(!state.loading);
    assert!(state.profile_error.is_some());
}

#[tokio::test]
async fn test_unknown_role_is_a_fetch_failure() {
    let id = Uuid::new_v4();
    let repo = MockRepository::new();
    repo.put_profile(profile_record(id, "registrar"));
    let h = start(
        MockAuthProvider::with_session(mock_session(identity(id))),
        repo,
        fast_retry(3),
    )
    .await;

    let state = h.store.settled(WAIT).await;
    assert_eq!(state.profile, None);
    assert!(state.profile_error.unwrap().contains("registrar"));
    // Malformed records are not retried.
    assert_eq!(h.repo.profile_calls(), 1);
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let id = Uuid::new_v4();
    let repo = MockRepository::new();
    repo.put_profile(profile_record(id, "staff"));
    for _ in 0..2 {
        repo.fail_next(QueryError::Status {
            status: 503,
            message: "unavailable".to_string(),
        });
    }
    let h = start(
        MockAuthProvider::with_session(mock_session(identity(id))),
        repo,
        fast_retry(3),
    )
    .await;

    let state = h.store.settled(WAIT).await;
    assert_eq!(state.role(), Some(Role::Staff));
    assert_eq!(state.profile_error, None);
    assert_eq!(h.repo.profile_calls(), 3);
}

#[tokio::test]
async fn test_retries_are_bounded() {
    let id = Uuid::new_v4();
    let repo = MockRepository::new();
    repo.put_profile(profile_record(id, "staff"));
    for _ in 0..5 {
        repo.fail_next(QueryError::Status {
            status: 502,
            message: "bad gateway".to_string(),
        });
    }
    let h = start(
        MockAuthProvider::with_session(mock_session(identity(id))),
        repo,
        fast_retry(2),
    )
    .await;

    let state = h.store.settled(WAIT).await;
    assert_eq!(state.profile, None);
    assert!(state.profile_error.is_some());
    assert_eq!(h.repo.profile_calls(), 2);

    // A manual refresh is bounded the same way; the backend is still down.
    h.store.refresh_profile(id).await;
    assert_eq!(h.repo.profile_calls(), 4);
    assert_eq!(h.store.snapshot().profile, None);

    // Once it recovers, the next refresh resolves.
    h.store.refresh_profile(id).await;
    assert_eq!(h.store.snapshot().role(), Some(Role::Staff));
}

#[tokio::test]
async fn test_superseded_fetch_result_is_discarded() {
    let id = Uuid::new_v4();
    let h = signed_in(id, "staff").await;

    // The slow fetch reads the old role, then answers late.
    h.repo.delay_next(Duration::from_millis(200));
    let slow = {
        let store = h.store.clone();
        tokio::spawn(async move { store.refresh_profile(id).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    h.repo.put_profile(profile_record(id, "admin"));
    h.store.refresh_profile(id).await;
    assert_eq!(h.store.snapshot().role(), Some(Role::Admin));

    slow.await.expect("slow fetch task");
    let state = h.store.snapshot();
    assert_eq!(state.role(), Some(Role::Admin));
    assert!(!state.loading);
}

#[tokio::test]
async fn test_sign_out_during_fetch_is_not_repopulated() {
    let id = Uuid::new_v4();
    let h = signed_in(id, "admin").await;

    h.repo.delay_next(Duration::from_millis(150));
    let slow = {
        let store = h.store.clone();
        tokio::spawn(async move { store.refresh_profile(id).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    h.store.sign_out().await.expect("sign-out");
    slow.await.expect("slow fetch task");

    assert_eq!(h.store.snapshot(), SessionState::signed_out());
}

#[tokio::test]
async fn test_token_refresh_keeps_cached_profile_while_refetching() {
    let id = Uuid::new_v4();
    let h = signed_in(id, "admin").await;

    h.repo.delay_next(Duration::from_millis(150));
    h.auth
        .emit(AuthChange::token_refreshed(mock_session(identity(id))))
        .await;

    let during = wait_until(&h.store, |s| s.loading).await;
    assert_eq!(during.role(), Some(Role::Admin));

    let after = h.store.settled(WAIT).await;
    assert_eq!(after.role(), Some(Role::Admin));
}

#[tokio::test]
async fn test_identity_change_drops_other_users_profile() {
    let first = Uuid::new_v4();
    let second = Uuid::new_v4();
    let h = signed_in(first, "admin").await;
    h.repo.put_profile(profile_record(second, "student"));
    h.repo.put_student(student_record(second, "active", false));
    h.repo.delay_next(Duration::from_millis(100));

    h.auth
        .emit(AuthChange::signed_in(mock_session(identity(second))))
        .await;

    let during = wait_until(&h.store, |s| s.user_id() == Some(second)).await;
    assert_eq!(during.profile, None);

    let after = h.store.resolved_for(second, WAIT).await;
    assert_eq!(after.role(), Some(Role::Student));
}
