//! Applies the embedded schema migrations.
//!
//! Run with: cargo run --bin tillbook-migrate

use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    info!("Starting database migration");

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "sqlite://tillbook.db?mode=rwc".to_string());

    info!("Connecting to database: {}", database_url);
    let db = tillbook::db::establish_connection(&database_url).await?;

    tillbook::db::run_migrations(&db).await?;

    info!("Migration completed successfully");
    Ok(())
}
