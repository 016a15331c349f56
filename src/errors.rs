use std::io;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("{0}")]
    Config(String),
    #[error("{provider} returned an unusable response: {message}")]
    Provider {
        provider: &'static str,
        message: String,
    },
    #[error("{provider} rate limited the request")]
    RateLimited { provider: &'static str },
    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),
}
