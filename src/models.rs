use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::{fmt, str::FromStr};
use thiserror::Error;
use ts_rs::TS;
use utoipa::ToSchema;
use uuid::Uuid;

// --- Authorization Vocabulary ---

/// Role
///
/// The closed set of registry roles stored in `public.profiles.role`.
/// Every access decision matches on this enum; raw role strings never leave the
/// record-decoding boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS, ToSchema)]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum Role {
    Admin,
    Staff,
    Student,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Admin, Role::Staff, Role::Student];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Staff => "staff",
            Role::Student => "student",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "staff" => Ok(Role::Staff),
            "student" => Ok(Role::Student),
            _ => Err(UnknownVariant::new("role", s)),
        }
    }
}

/// StudentStatus
///
/// Enrollment status from `public.students.status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS, ToSchema)]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum StudentStatus {
    Active,
    Inactive,
    Graduated,
    Withdrawn,
}

impl FromStr for StudentStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(StudentStatus::Active),
            "inactive" => Ok(StudentStatus::Inactive),
            "graduated" => Ok(StudentStatus::Graduated),
            "withdrawn" => Ok(StudentStatus::Withdrawn),
            _ => Err(UnknownVariant::new("student status", s)),
        }
    }
}

/// A stored enum column held a value outside the known vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl UnknownVariant {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

// --- Identity & Session (Auth Collaborator) ---

/// Identity
///
/// The authenticated principal as reported by the hosted auth service (`auth.users`).
/// Only the SessionStore replaces it; everything else reads snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS, ToSchema)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct Identity {
    pub id: Uuid,
    #[serde(default)]
    pub email: String,
    #[ts(type = "string | null")]
    pub last_sign_in_at: Option<DateTime<Utc>>,
}

/// Session
///
/// An active auth session: the identity plus the credentials used to call the
/// data API on the user's behalf (row-level security keys off the access token).
/// Never serialized into state snapshots.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    pub identity: Identity,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    /// True when the access token expires within `leeway` from now.
    pub fn expires_within(&self, leeway: chrono::Duration) -> bool {
        self.expires_at <= Utc::now() + leeway
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("identity", &self.identity)
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

// --- Authorization Profile ---

/// AuthorizationProfile
///
/// The role/status projection used for every gate decision. Built from the
/// `profiles` row and, for students, the matching `students` row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS, ToSchema)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct AuthorizationProfile {
    pub id: Uuid,
    pub full_name: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub student_status: Option<StudentStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_deleted: Option<bool>,
}

impl AuthorizationProfile {
    /// Merges the raw records into a profile. The student record is ignored for
    /// non-student roles.
    pub fn from_records(
        profile: ProfileRecord,
        student: Option<StudentRecord>,
    ) -> Result<Self, UnknownVariant> {
        let role: Role = profile.role.parse()?;

        let (student_status, is_deleted) = match (role, student) {
            (Role::Student, Some(record)) => (
                Some(record.status.parse::<StudentStatus>()?),
                Some(record.deleted_at.is_some()),
            ),
            _ => (None, None),
        };

        Ok(Self {
            id: profile.id,
            full_name: profile.full_name.unwrap_or_default(),
            role,
            student_status,
            is_deleted,
        })
    }
}

/// SessionState
///
/// The snapshot published by a SessionStore. Readers always receive a whole
/// value; partial updates are never visible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS, ToSchema)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct SessionState {
    pub identity: Option<Identity>,
    pub profile: Option<AuthorizationProfile>,
    pub loading: bool,
    /// Last profile fetch failure, cleared by the next successful fetch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_error: Option<String>,
}

impl SessionState {
    /// State of a freshly created store, before the initial session probe returns.
    pub fn initial() -> Self {
        Self {
            identity: None,
            profile: None,
            loading: true,
            profile_error: None,
        }
    }

    /// State with no identity and nothing pending.
    pub fn signed_out() -> Self {
        Self {
            loading: false,
            ..Self::initial()
        }
    }

    pub fn role(&self) -> Option<Role> {
        self.profile.as_ref().map(|p| p.role)
    }

    pub fn user_id(&self) -> Option<Uuid> {
        self.identity.as_ref().map(|i| i.id)
    }
}

// --- Data Collaborator Records ---

/// ProfileRecord
///
/// Raw row of `public.profiles`. `role` stays textual here so an unexpected
/// value surfaces as a decode error instead of a query error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow, Default)]
pub struct ProfileRecord {
    pub id: Uuid,
    pub full_name: Option<String>,
    pub role: String,
    pub email: Option<String>,
}

/// StudentRecord
///
/// Raw row of `public.students`, narrowed to the columns the gate needs.
/// `deleted_at` is the soft-delete marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct StudentRecord {
    pub user_id: Uuid,
    pub status: String,
    pub deleted_at: Option<DateTime<Utc>>,
}

// --- Request Payloads ---

/// SignUpMetadata
///
/// Attached to the auth sign-up call as user metadata. A backend trigger reads it
/// to provision the `profiles` (and `students`) rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct SignUpMetadata {
    pub full_name: String,
    pub role: Role,
}

/// SignInRequest
///
/// Body of `POST /login`. The password is forwarded to the auth service and never logged.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct SignInRequest {
    #[schema(example = "registrar@university.edu")]
    pub email: String,
    pub password: String,
}

/// SignUpRequest
///
/// Body of `POST /signup`.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct SignUpRequest {
    pub email: String,
    pub password: String,
    pub full_name: String,
    pub role: Role,
}

// --- Response Schemas ---

/// SignUpResponse
///
/// `confirmationRequired` is true when the auth service created the account
/// but withheld a session pending e-mail confirmation.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct SignUpResponse {
    pub confirmation_required: bool,
    pub session: Option<SessionState>,
}

/// LoginResponse
///
/// Result of `POST /login`: the resolved session and the role's landing view.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct LoginResponse {
    pub session: SessionState,
    pub redirect_to: Option<String>,
}

/// LoginHint
///
/// Body of `GET /login`. A caller that is already signed in is pointed at its landing view.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct LoginHint {
    pub authenticated: bool,
    pub redirect_to: Option<String>,
}

/// UnauthorizedBody
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct UnauthorizedBody {
    pub message: String,
}
