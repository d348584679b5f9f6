use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Schema migrations, embedded at compile time from `common/migrations`.
pub static MIGRATIONS: sqlx::migrate::Migrator = sqlx::migrate!();

pub async fn connect(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .min_connections(2)
        .max_connections(16)
        .acquire_timeout(Duration::from_secs(30))
        .connect(database_url)
        .await
}

/// Connect and bring the schema up to date. Used by every binary on boot so
/// that a fresh database works without a separate migration step.
pub async fn connect_and_migrate(database_url: &str) -> Result<PgPool, sqlx::Error> {
    let pool = connect(database_url).await?;
    MIGRATIONS.run(&pool).await?;
    Ok(pool)
}
