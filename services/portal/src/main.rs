use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use village_health_common::RedisService;
use village_health_database::{create_pool, run_migrations, AdminSeed, MigrationRunner};
use village_health_portal::{build_app, config::AppConfig, services::AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "village_health_portal=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = AppConfig::from_env()?;

    let db_pool = create_pool(&config.database).await?;
    run_migrations(&db_pool).await?;
    MigrationRunner::new(db_pool.clone())
        .seed_initial_data(&AdminSeed::from_env())
        .await?;

    let redis_service = RedisService::new(&config.redis).await?;

    tokio::fs::create_dir_all(&config.storage.uploads_dir).await?;
    tokio::fs::create_dir_all(&config.storage.backups_dir).await?;

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let app = build_app(AppState::new(db_pool, redis_service, config));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Village Health Connect portal listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
