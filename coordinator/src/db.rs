use crate::errors::{Error, Result};
use crate::model::Device;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;

pub async fn make_pool(database_url: &str) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
    info!("Migrations completed");

    Ok(pool)
}

/// Looks up a device in the registry projection. The registry itself is
/// maintained by the upstream provisioning service.
pub async fn get_device(pool: &PgPool, device_id: &str) -> Result<Device> {
    sqlx::query_as::<_, Device>(
        "SELECT device_id, name, channel_count FROM devices WHERE device_id = $1",
    )
    .bind(device_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| Error::DeviceNotFound(device_id.to_string()))
}
