//! Lagen API server entry point

use tracing_subscriber::EnvFilter;

use lagen_api::{routes, AppState, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;

    let pool =
        lagen_shared::db::create_pool(&config.database_url, config.database_max_connections)
            .await?;
    lagen_shared::db::run_migrations(&pool).await?;
    tracing::info!("Database migrations applied");

    let bind_address = config.bind_address.clone();
    let state = AppState::new(pool, config);
    let app = routes::create_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    tracing::info!(address = %bind_address, "Lagen API listening");
    axum::serve(listener, app).await?;

    Ok(())
}
