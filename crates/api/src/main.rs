// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

use anyhow::Context;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use swapdeck_api::{routes::create_router, AppState, Config};
use swapdeck_shared::db::{create_migration_pool, create_pool, run_migrations};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,swapdeck_api=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;

    // Migrations run on a dedicated single-connection pool against the
    // direct (non-pooled) database URL when one is configured
    let migration_url = config
        .database_direct_url
        .as_deref()
        .unwrap_or(&config.database_url);
    let migration_pool = create_migration_pool(migration_url)
        .await
        .context("Failed to create migration pool")?;
    run_migrations(&migration_pool)
        .await
        .context("Failed to run migrations")?;
    migration_pool.close().await;

    let pool = create_pool(&config.database_url)
        .await
        .context("Failed to create database pool")?;

    let bind_address = config.bind_address.clone();
    let state = AppState::new(pool, config).context("Failed to build application state")?;

    let cors = match std::env::var("ALLOWED_ORIGINS") {
        Ok(origins) => {
            let origins = origins
                .split(',')
                .filter_map(|origin| origin.trim().parse().ok())
                .collect::<Vec<_>>();
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(origins))
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any)
        }
        Err(_) => CorsLayer::permissive(),
    };

    let app = create_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("Failed to bind {bind_address}"))?;
    tracing::info!(address = %bind_address, "swapdeck-api listening");

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}
