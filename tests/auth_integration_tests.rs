use jsonwebtoken::{EncodingKey, Header, encode};
use registry_portal::{
    auth::{Claims, session_from_access_token},
    error::AuthError,
};
use std::time::SystemTime;
use uuid::Uuid;

const SECRET: &str = "super-secure-test-secret-value-local";

fn now() -> usize {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap()
        .as_secs() as usize
}

fn mint(sub: Uuid, exp: usize, aud: Option<&str>, secret: &str) -> String {
    let claims = Claims {
        sub,
        exp,
        iat: now(),
        aud: aud.map(str::to_string),
        email: Some("registrar@university.edu".to_string()),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}

#[test]
fn test_valid_token_becomes_session() {
    let user_id = Uuid::new_v4();
    let token = mint(user_id, now() + 3600, Some("authenticated"), SECRET);

    let session = session_from_access_token(&token, SECRET).expect("token should verify");

    assert_eq!(session.identity.id, user_id);
    assert_eq!(session.identity.email, "registrar@university.edu");
    assert_eq!(session.access_token, token);
    assert_eq!(session.refresh_token, None);
    assert!(!session.expires_within(chrono::Duration::minutes(30)));
}

#[test]
fn test_expired_token_rejected() {
    let token = mint(Uuid::new_v4(), now() - 3600, Some("authenticated"), SECRET);

    let err = session_from_access_token(&token, SECRET).unwrap_err();
    assert!(matches!(err, AuthError::InvalidToken(_)));
    assert_eq!(err.error_code(), "invalid_token");
}

#[test]
fn test_token_with_wrong_audience_rejected() {
    let token = mint(Uuid::new_v4(), now() + 3600, Some("anon"), SECRET);
    assert!(matches!(
        session_from_access_token(&token, SECRET),
        Err(AuthError::InvalidToken(_))
    ));
}

#[test]
fn test_token_signed_with_other_secret_rejected() {
    let token = mint(Uuid::new_v4(), now() + 3600, Some("authenticated"), "another-secret");
    assert!(matches!(
        session_from_access_token(&token, SECRET),
        Err(AuthError::InvalidToken(_))
    ));
}

#[test]
fn test_garbage_token_rejected() {
    assert!(session_from_access_token("not.a.jwt", SECRET).is_err());
}

#[test]
fn test_token_with_unrepresentable_expiry_rejected() {
    for exp in [usize::MAX, i64::MAX as usize] {
        let token = mint(Uuid::new_v4(), exp, Some("authenticated"), SECRET);
        let err = session_from_access_token(&token, SECRET).unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken(_)), "exp {exp}: {err:?}");
    }
}
