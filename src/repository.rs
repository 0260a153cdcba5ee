use crate::{
    error::QueryError,
    models::{ProfileRecord, StudentRecord},
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sqlx::PgPool;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use uuid::Uuid;

/// Repository Trait
///
/// The data collaborator contract: single-record lookups for the authorization
/// profile plus the named RPC functions behind the registry dashboards.
///
/// Every call carries the caller's access token. The hosted implementation
/// forwards it so row-level security scopes the query to that user; nothing
/// here re-checks those policies.
#[async_trait]
pub trait Repository: Send + Sync {
    // `profiles` row by primary key.
    async fn get_profile(&self, access_token: &str, id: Uuid) -> Result<ProfileRecord, QueryError>;
    // `students` row by owning auth user.
    async fn get_student(
        &self,
        access_token: &str,
        user_id: Uuid,
    ) -> Result<StudentRecord, QueryError>;
    // Backend-hosted function invoked by name with JSON arguments.
    async fn call_rpc(
        &self,
        access_token: &str,
        function: &str,
        args: Value,
    ) -> Result<Value, QueryError>;
}

/// RepositoryState
///
/// The concrete type used to share the data layer across sessions.
pub type RepositoryState = Arc<dyn Repository>;

// --- Hosted Data API (PostgREST) ---

/// RestRepository
///
/// Reads through the Supabase REST gateway (`/rest/v1`). The production path:
/// requests run as the signed-in user, so RLS applies.
#[derive(Clone)]
pub struct RestRepository {
    http: reqwest::Client,
    rest_url: String,
    anon_key: String,
}

impl RestRepository {
    pub fn new(http: reqwest::Client, project_url: &str, anon_key: &str) -> Self {
        Self {
            http,
            rest_url: format!("{}/rest/v1", project_url.trim_end_matches('/')),
            anon_key: anon_key.to_string(),
        }
    }

    /// Fetches the rows of `table` where `column = value`, returning the first one.
    async fn get_by_id<T: DeserializeOwned>(
        &self,
        access_token: &str,
        table: &'static str,
        column: &str,
        id: Uuid,
        columns: &str,
    ) -> Result<T, QueryError> {
        let response = self
            .http
            .get(format!("{}/{}", self.rest_url, table))
            .query(&[
                (column, format!("eq.{id}")),
                ("select", columns.to_string()),
                ("limit", "1".to_string()),
            ])
            .header("apikey", &self.anon_key)
            .bearer_auth(access_token)
            .send()
            .await?;

        let response = check_status(response).await?;
        let mut rows: Vec<T> = response.json().await?;
        if rows.is_empty() {
            return Err(QueryError::NotFound { table, id });
        }
        Ok(rows.swap_remove(0))
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, QueryError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(QueryError::Status {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl Repository for RestRepository {
    async fn get_profile(&self, access_token: &str, id: Uuid) -> Result<ProfileRecord, QueryError> {
        self.get_by_id(access_token, "profiles", "id", id, "id,full_name,role,email")
            .await
    }

    async fn get_student(
        &self,
        access_token: &str,
        user_id: Uuid,
    ) -> Result<StudentRecord, QueryError> {
        self.get_by_id(
            access_token,
            "students",
            "user_id",
            user_id,
            "user_id,status,deleted_at",
        )
        .await
    }

    async fn call_rpc(
        &self,
        access_token: &str,
        function: &str,
        args: Value,
    ) -> Result<Value, QueryError> {
        let response = self
            .http
            .post(format!("{}/rpc/{}", self.rest_url, function))
            .header("apikey", &self.anon_key)
            .bearer_auth(access_token)
            .json(&args)
            .send()
            .await?;

        let response = check_status(response).await?;
        Ok(response.json().await?)
    }
}

// --- Direct Postgres (Local Development) ---

/// PostgresRepository
///
/// Reads the same tables over a direct connection. Used only in `Env::Local`
/// against the dockerized database; the access token is not consulted, so RLS
/// does not apply.
pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Repository for PostgresRepository {
    async fn get_profile(&self, _access_token: &str, id: Uuid) -> Result<ProfileRecord, QueryError> {
        sqlx::query_as::<_, ProfileRecord>(
            "SELECT id, full_name, role::text AS role, email FROM profiles WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(QueryError::NotFound {
            table: "profiles",
            id,
        })
    }

    async fn get_student(
        &self,
        _access_token: &str,
        user_id: Uuid,
    ) -> Result<StudentRecord, QueryError> {
        sqlx::query_as::<_, StudentRecord>(
            "SELECT user_id, status::text AS status, deleted_at FROM students WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(QueryError::NotFound {
            table: "students",
            id: user_id,
        })
    }

    /// Calls an argument-less function and returns its result as JSON.
    /// The local dashboard functions take no arguments, so `args` is ignored.
    async fn call_rpc(
        &self,
        _access_token: &str,
        function: &str,
        _args: Value,
    ) -> Result<Value, QueryError> {
        if !function.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(QueryError::Status {
                status: 400,
                message: format!("invalid function name '{function}'"),
            });
        }
        let sql = format!("SELECT to_jsonb({function}())");
        let value: Value = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(value)
    }
}

// --- No Data Source ---

/// UnconfiguredRepository
///
/// Stands in when neither Supabase nor a database is configured. Every call
/// answers 503, which the session store treats as transient.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredRepository;

impl UnconfiguredRepository {
    fn unavailable() -> QueryError {
        QueryError::Status {
            status: 503,
            message: "no data source configured (set SUPABASE_URL or DATABASE_URL)".to_string(),
        }
    }
}

#[async_trait]
impl Repository for UnconfiguredRepository {
    async fn get_profile(&self, _access_token: &str, _id: Uuid) -> Result<ProfileRecord, QueryError> {
        Err(Self::unavailable())
    }

    async fn get_student(
        &self,
        _access_token: &str,
        _user_id: Uuid,
    ) -> Result<StudentRecord, QueryError> {
        Err(Self::unavailable())
    }

    async fn call_rpc(
        &self,
        _access_token: &str,
        _function: &str,
        _args: Value,
    ) -> Result<Value, QueryError> {
        Err(Self::unavailable())
    }
}

// --- Mock Implementation (For Tests) ---

/// MockRepository
///
/// In-memory data collaborator. Records can be replaced between calls to model
/// backend changes; `fail_next` and `delay_next` script failures and latency.
#[derive(Default)]
pub struct MockRepository {
    profiles: Mutex<HashMap<Uuid, ProfileRecord>>,
    students: Mutex<HashMap<Uuid, StudentRecord>>,
    failures: Mutex<VecDeque<QueryError>>,
    delays: Mutex<VecDeque<Duration>>,
    profile_calls: AtomicUsize,
}

impl MockRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_profile(&self, record: ProfileRecord) {
        self.profiles
            .lock()
            .expect("mock lock poisoned")
            .insert(record.id, record);
    }

    pub fn put_student(&self, record: StudentRecord) {
        self.students
            .lock()
            .expect("mock lock poisoned")
            .insert(record.user_id, record);
    }

    /// The next `get_profile` call fails with `error` instead of reading.
    pub fn fail_next(&self, error: QueryError) {
        self.failures
            .lock()
            .expect("mock lock poisoned")
            .push_back(error);
    }

    /// The next `get_profile` call reads immediately but answers after `delay`.
    pub fn delay_next(&self, delay: Duration) {
        self.delays
            .lock()
            .expect("mock lock poisoned")
            .push_back(delay);
    }

    pub fn profile_calls(&self) -> usize {
        self.profile_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Repository for MockRepository {
    async fn get_profile(&self, _access_token: &str, id: Uuid) -> Result<ProfileRecord, QueryError> {
        self.profile_calls.fetch_add(1, Ordering::SeqCst);

        let scripted = self.failures.lock().expect("mock lock poisoned").pop_front();
        let delay = self.delays.lock().expect("mock lock poisoned").pop_front();
        let result = match scripted {
            Some(error) => Err(error),
            None => self
                .profiles
                .lock()
                .expect("mock lock poisoned")
                .get(&id)
                .cloned()
                .ok_or(QueryError::NotFound {
                    table: "profiles",
                    id,
                }),
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        result
    }

    async fn get_student(
        &self,
        _access_token: &str,
        user_id: Uuid,
    ) -> Result<StudentRecord, QueryError> {
        self.students
            .lock()
            .expect("mock lock poisoned")
            .get(&user_id)
            .cloned()
            .ok_or(QueryError::NotFound {
                table: "students",
                id: user_id,
            })
    }

    async fn call_rpc(
        &self,
        _access_token: &str,
        function: &str,
        args: Value,
    ) -> Result<Value, QueryError> {
        Ok(serde_json::json!({ "function": function, "args": args }))
    }
}
