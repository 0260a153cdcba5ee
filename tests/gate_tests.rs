use axum::http::{StatusCode, header};
use registry_portal::{
    AccessGate, GateDecision, RoleSet,
    gate::{DEACTIVATED_MESSAGE, LOGIN_PATH, unauthorized_location},
    models::{AuthorizationProfile, Identity, Role, SessionState, StudentStatus},
};
use uuid::Uuid;

// --- Fixtures ---

fn identity() -> Identity {
    Identity {
        id: Uuid::new_v4(),
        email: "u1@registry.test".to_string(),
        last_sign_in_at: None,
    }
}

fn profile(id: Uuid, role: Role) -> AuthorizationProfile {
    let (student_status, is_deleted) = match role {
        Role::Student => (Some(StudentStatus::Active), Some(false)),
        Role::Admin | Role::Staff => (None, None),
    };
    AuthorizationProfile {
        id,
        full_name: "Test User".to_string(),
        role,
        student_status,
        is_deleted,
    }
}

fn signed_in_as(role: Role) -> SessionState {
    let identity = identity();
    SessionState {
        profile: Some(profile(identity.id, role)),
        identity: Some(identity),
        loading: false,
        profile_error: None,
    }
}

fn role_sets() -> Vec<RoleSet> {
    vec![
        RoleSet::any(),
        RoleSet::of([Role::Admin]),
        RoleSet::of([Role::Admin, Role::Staff]),
        RoleSet::of([Role::Student]),
        RoleSet::of(Role::ALL),
    ]
}

// --- Scenarios ---

#[test]
fn scenario_a_no_identity_redirects_to_login() {
    let decision = AccessGate::new(RoleSet::any()).evaluate(&SessionState::signed_out());
    assert_eq!(decision, GateDecision::RedirectToLogin);
}

#[test]
fn scenario_b_identity_without_profile_is_resyncing() {
    let state = SessionState {
        identity: Some(identity()),
        profile: None,
        loading: true,
        profile_error: None,
    };
    let decision = AccessGate::new(RoleSet::any()).evaluate(&state);
    assert_eq!(decision, GateDecision::Resyncing { detail: None });
}

#[test]
fn scenario_c_deleted_student_redirected_with_message() {
    let mut state = signed_in_as(Role::Student);
    if let Some(p) = state.profile.as_mut() {
        p.is_deleted = Some(true);
    }

    let decision = AccessGate::new([Role::Student]).evaluate(&state);
    assert_eq!(
        decision,
        GateDecision::RedirectToUnauthorized {
            message: Some(DEACTIVATED_MESSAGE.to_string())
        }
    );
}

#[test]
fn scenario_d_staff_admitted_by_admin_staff_set() {
    let decision =
        AccessGate::new([Role::Admin, Role::Staff]).evaluate(&signed_in_as(Role::Staff));
    assert_eq!(decision, GateDecision::Render);
}

#[test]
fn scenario_e_student_on_admin_view_redirected_without_message() {
    let decision = AccessGate::new([Role::Admin]).evaluate(&signed_in_as(Role::Student));
    assert_eq!(decision, GateDecision::RedirectToUnauthorized { message: None });
}

// --- Properties ---

#[test]
fn no_identity_always_redirects_to_login_once_settled() {
    let states = [
        SessionState::signed_out(),
        SessionState {
            profile_error: Some("boom".to_string()),
            ..SessionState::signed_out()
        },
    ];
    for permitted in role_sets() {
        let gate = AccessGate::new(permitted.clone());
        for state in &states {
            assert_eq!(
                gate.evaluate(state),
                GateDecision::RedirectToLogin,
                "{permitted:?}"
            );
        }
    }
}

#[test]
fn initial_probe_shows_loading() {
    let decision = AccessGate::new(RoleSet::any()).evaluate(&SessionState::initial());
    assert_eq!(decision, GateDecision::Loading);
}

#[test]
fn missing_profile_never_renders() {
    for permitted in role_sets() {
        let gate = AccessGate::new(permitted);
        for loading in [true, false] {
            let state = SessionState {
                identity: Some(identity()),
                profile: None,
                loading,
                profile_error: Some("data api returned 503: unavailable".to_string()),
            };
            assert_eq!(
                gate.evaluate(&state),
                GateDecision::Resyncing {
                    detail: Some("data api returned 503: unavailable".to_string())
                }
            );
        }
    }
}

#[test]
fn inactive_student_denied_even_when_student_permitted() {
    for permitted in [RoleSet::any(), RoleSet::of([Role::Student])] {
        let mut state = signed_in_as(Role::Student);
        if let Some(p) = state.profile.as_mut() {
            p.student_status = Some(StudentStatus::Inactive);
        }
        assert!(matches!(
            AccessGate::new(permitted).evaluate(&state),
            GateDecision::RedirectToUnauthorized { message: Some(_) }
        ));
    }
}

#[test]
fn graduated_student_still_renders() {
    let mut state = signed_in_as(Role::Student);
    if let Some(p) = state.profile.as_mut() {
        p.student_status = Some(StudentStatus::Graduated);
    }
    assert_eq!(
        AccessGate::new([Role::Student]).evaluate(&state),
        GateDecision::Render
    );
}

#[test]
fn student_without_merged_record_is_resyncing() {
    let mut state = signed_in_as(Role::Student);
    if let Some(p) = state.profile.as_mut() {
        p.student_status = None;
        p.is_deleted = None;
    }
    assert_eq!(
        AccessGate::new(RoleSet::any()).evaluate(&state),
        GateDecision::Resyncing { detail: None }
    );
}

#[test]
fn permitted_role_renders_idempotently() {
    for role in Role::ALL {
        let gate = AccessGate::new([role]);
        let state = signed_in_as(role);
        let first = gate.evaluate(&state);
        assert_eq!(first, GateDecision::Render);
        assert_eq!(gate.evaluate(&state), first);
        assert_eq!(gate.evaluate(&state.clone()), first);
    }
}

#[test]
fn cached_role_keeps_rendering_during_refetch() {
    let mut state = signed_in_as(Role::Admin);
    state.loading = true;
    assert_eq!(
        AccessGate::new([Role::Admin]).evaluate(&state),
        GateDecision::Render
    );
}

#[test]
fn cached_role_still_denied_during_refetch() {
    let mut state = signed_in_as(Role::Staff);
    state.loading = true;
    assert_eq!(
        AccessGate::new([Role::Admin]).evaluate(&state),
        GateDecision::RedirectToUnauthorized { message: None }
    );
}

// --- HTTP Rendering ---

#[test]
fn empty_role_set_admits_every_role() {
    let any = RoleSet::any();
    assert!(Role::ALL.iter().all(|r| any.permits(*r)));
    assert!(!RoleSet::from([Role::Admin]).permits(Role::Staff));
}

#[test]
fn unauthorized_location_encodes_message() {
    let location = unauthorized_location(Some("Account deactivated & locked"));
    assert_eq!(location, "/unauthorized?message=Account+deactivated+%26+locked");
    assert_eq!(unauthorized_location(None), "/unauthorized");
}

#[test]
fn redirects_use_see_other() {
    let response = GateDecision::RedirectToLogin.into_denial().unwrap();
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(response.headers()[header::LOCATION], LOGIN_PATH);
}

#[test]
fn placeholders_are_accepted_with_retry_after() {
    let response = GateDecision::Loading.into_denial().unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(response.headers()[header::RETRY_AFTER], "1");

    let response = GateDecision::Resyncing { detail: None }.into_denial().unwrap();
    assert_eq!(response.headers()[header::RETRY_AFTER], "2");
    assert!(GateDecision::Render.into_denial().is_none());
}
