use std::fmt;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::crm::CrmError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("CRM error: {0}")]
    Crm(#[from] CrmError),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Watermark for {job} is already at {stored}, refusing to move it to {proposed}")]
    WatermarkConflict {
        job: String,
        stored: DateTime<Utc>,
        proposed: DateTime<Utc>,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Database(e.to_string())
    }
}

impl From<rusqlite_migration::Error> for Error {
    fn from(e: rusqlite_migration::Error) -> Self {
        Error::Migration(e.to_string())
    }
}

impl<E: fmt::Display> From<tokio_rusqlite::Error<E>> for Error {
    fn from(e: tokio_rusqlite::Error<E>) -> Self {
        Error::Database(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Other(format!("JSON error: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
