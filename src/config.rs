use std::{env, time::Duration};

/// AppConfig
///
/// Holds the service's entire configuration. Loaded once at startup and shared
/// immutably through `AppState` (pulled out by handlers via `FromRef`).
#[derive(Clone, Debug)]
pub struct AppConfig {
    // Runtime environment marker. Selects log format, cookie security and data backend.
    pub env: Env,
    // Socket address the HTTP server binds to.
    pub bind_addr: String,
    // Supabase project URL. `None` leaves the auth collaborator unconfigured.
    pub supabase_url: Option<String>,
    // Public (anon) API key sent as `apikey` on every Supabase call.
    pub supabase_anon_key: Option<String>,
    // Secret used to verify bearer access tokens (Supabase-managed HS256 secret).
    pub jwt_secret: String,
    // Local only: direct Postgres connection used for profile reads instead of PostgREST.
    pub db_url: Option<String>,
    // Retry bound for transient profile fetch failures.
    pub profile_retry: RetryPolicy,
    // How long `POST /login` and bearer restores wait for a session to resolve.
    pub settle_timeout: Duration,
    // Signed-in sessions untouched for this long are dropped from the registry.
    pub session_idle_timeout: Duration,
}

/// Env
///
/// Defines the runtime context.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Env {
    Local,
    Production,
}

/// RetryPolicy
///
/// Bounded exponential backoff for profile fetches: attempt `n` (1-based) waits
/// `base_delay * 2^(n-1)`, capped at `max_delay`, before running again.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// A single attempt, no waiting.
    pub const fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before the attempt that follows `attempt` failed attempts.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl Default for AppConfig {
    /// Safe, non-panicking configuration for tests: no Supabase project, local env.
    fn default() -> Self {
        Self {
            env: Env::Local,
            bind_addr: "127.0.0.1:3000".to_string(),
            supabase_url: None,
            supabase_anon_key: None,
            jwt_secret: "super-secure-test-secret-value-local".to_string(),
            db_url: None,
            profile_retry: RetryPolicy::default(),
            settle_timeout: Duration::from_secs(5),
            session_idle_timeout: Duration::from_secs(12 * 60 * 60),
        }
    }
}

impl AppConfig {
    /// load
    ///
    /// Reads the configuration from environment variables (call `dotenv` first).
    ///
    /// # Panics
    /// Panics in `Env::Production` when `SUPABASE_URL`, `SUPABASE_ANON_KEY` or
    /// `SUPABASE_JWT_SECRET` is missing, so the service never starts half-configured.
    pub fn load() -> Self {
        let env = match env::var("APP_ENV").as_deref() {
            Ok("production") => Env::Production,
            _ => Env::Local,
        };

        let profile_retry = RetryPolicy {
            max_attempts: parse_var("PROFILE_RETRY_ATTEMPTS").unwrap_or(3).max(1),
            base_delay: Duration::from_millis(parse_var("PROFILE_RETRY_BASE_MS").unwrap_or(200)),
            ..RetryPolicy::default()
        };
        let settle_timeout =
            Duration::from_millis(parse_var("SESSION_SETTLE_TIMEOUT_MS").unwrap_or(5_000));
        let session_idle_timeout =
            Duration::from_secs(parse_var("SESSION_IDLE_TIMEOUT_SECS").unwrap_or(12 * 60 * 60));
        let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());

        match env {
            Env::Local => Self {
                env,
                bind_addr,
                // A local run without a Supabase project still boots; sign-in then fails fast.
                supabase_url: non_empty_var("SUPABASE_URL"),
                supabase_anon_key: non_empty_var("SUPABASE_ANON_KEY"),
                jwt_secret: env::var("SUPABASE_JWT_SECRET")
                    .unwrap_or_else(|_| "super-secure-test-secret-value-local".to_string()),
                db_url: non_empty_var("DATABASE_URL"),
                profile_retry,
                settle_timeout,
                session_idle_timeout,
            },
            Env::Production => Self {
                env,
                bind_addr,
                supabase_url: Some(
                    env::var("SUPABASE_URL").expect("FATAL: SUPABASE_URL required in prod"),
                ),
                supabase_anon_key: Some(
                    env::var("SUPABASE_ANON_KEY")
                        .expect("FATAL: SUPABASE_ANON_KEY required in prod"),
                ),
                jwt_secret: env::var("SUPABASE_JWT_SECRET")
                    .expect("FATAL: SUPABASE_JWT_SECRET must be set in production."),
                // Production reads go through PostgREST so row-level security applies.
                db_url: None,
                profile_retry,
                settle_timeout,
                session_idle_timeout,
            },
        }
    }

    /// The Supabase project endpoint and key, when both are configured.
    pub fn supabase(&self) -> Option<(&str, &str)> {
        match (&self.supabase_url, &self.supabase_anon_key) {
            (Some(url), Some(key)) => Some((url.trim_end_matches('/'), key.as_str())),
            _ => None,
        }
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}
