use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("You have already voted for this reset")]
    AlreadyVoted,

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Firmware artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
