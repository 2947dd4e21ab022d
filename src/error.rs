//! Error types for PlayerLink Core

use thiserror::Error;

/// All variants carry clonable data so a failed future shared between
/// several cache waiters can hand each of them the same error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Network error: {0}")]
    Network(String),

    #[error("API error {http_code}: {message}")]
    Api { http_code: u16, message: String },

    #[error("Malformed response: {0}")]
    Decode(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Authentication expired")]
    AuthExpired,

    #[error("Authentication denied")]
    AuthDenied,

    #[error("Not logged in")]
    NotLoggedIn,

    #[error("A game session is active, account switching is not allowed")]
    SessionActive,

    #[error("Invalid uuid: {0}")]
    InvalidUuid(String),

    #[error("Invalid persistence bounds")]
    InvalidPersistence,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("JSON error: {0}")]
    Json(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Network(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json(e.to_string())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Storage(e.to_string())
    }
}
