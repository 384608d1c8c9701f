use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::errors::AppError;

pub async fn init_db() -> Result<PgPool, AppError> {
    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| AppError::Configuration("DATABASE_URL is not set".to_string()))?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    tracing::info!("Database pool initialized");

    Ok(pool)
}
