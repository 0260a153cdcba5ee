use registry_portal::{
    AppState, PostgresRepository, RepositoryState, RestRepository, SupabaseBackend,
    UnconfiguredRepository,
    config::{AppConfig, Env},
    create_router,
};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// main
///
/// Loads configuration, sets up logging, builds the data and auth collaborators
/// and serves the HTTP API.
#[tokio::main]
async fn main() {
    // 1. Configuration (fail-fast on missing production secrets)
    dotenv::dotenv().ok();
    let config = AppConfig::load();

    // 2. Logging: RUST_LOG wins, otherwise verbose defaults for this crate.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "registry_portal=debug,tower_http=info,axum=trace".into());

    match config.env {
        Env::Local => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
        Env::Production => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
    }

    tracing::info!("Application starting in {:?} mode", config.env);

    // 3. Data collaborator
    // Local runs may read straight from the dockerized Postgres; otherwise reads
    // go through the hosted REST gateway so row-level security applies.
    let http = reqwest::Client::new();
    let repo: RepositoryState = match (&config.db_url, config.supabase()) {
        (Some(db_url), _) => {
            let pool = PgPoolOptions::new()
                .max_connections(5)
                .connect(db_url)
                .await
                .expect("FATAL: Failed to connect to Postgres. Check DATABASE_URL.");
            tracing::info!("Profile reads use the direct Postgres connection.");
            Arc::new(PostgresRepository::new(pool))
        }
        (None, Some((url, anon_key))) => Arc::new(RestRepository::new(http.clone(), url, anon_key)),
        (None, None) => {
            tracing::warn!("No SUPABASE_URL or DATABASE_URL; data calls answer 503.");
            Arc::new(UnconfiguredRepository)
        }
    };

    // 4. Auth collaborator, one client per session over a shared HTTP pool.
    if config.supabase().is_none() {
        tracing::warn!("Supabase auth is not configured; every session stays signed out.");
    }
    let backend = Arc::new(SupabaseBackend::new(http, &config, repo));

    // 5. Router and server
    let bind_addr = config.bind_addr.clone();
    let app = create_router(AppState::new(backend, config));

    let listener = TcpListener::bind(&bind_addr)
        .await
        .expect("FATAL: Failed to bind the HTTP listener. Check BIND_ADDR.");

    tracing::info!("Listening on {}", bind_addr);
    tracing::info!("API Documentation (Swagger UI) available at: http://{}/swagger-ui", bind_addr);

    axum::serve(listener, app)
        .await
        .expect("FATAL: HTTP server terminated unexpectedly.");
}
