use thiserror::Error;

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("ESI returned {status} for {path}")]
    EsiStatus {
        status: reqwest::StatusCode,
        path: String,
    },

    #[error("Malformed ESI payload: {0}")]
    Payload(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MirrorError>;
