use std::path::PathBuf;

use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlx: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{table} row {id} not found")]
    NotFound { table: &'static str, id: Uuid },

    #[error("store lock poisoned")]
    Poisoned,
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("object {bucket}/{path} not found")]
    NotFound { bucket: String, path: String },

    #[error("storage returned {status}: {body}")]
    Http { status: u16, body: String },

    #[error("invalid storage url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("storage request: {0}")]
    Request(#[from] reqwest::Error),

    #[error("scratch file: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("unsupported extension: {extension:?}")]
    Unsupported { extension: String },

    #[error("no shapes imported from {}", path.display())]
    NoShapes { path: PathBuf },

    #[error("toolkit exited with code {code}: {stderr}")]
    ToolkitFailed { code: i32, stderr: String },

    #[error("toolkit launch: {0}")]
    ToolkitLaunch(std::io::Error),

    #[error("output not created: {}", path.display())]
    OutputMissing { path: PathBuf },

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a claimed job could not be completed.
#[derive(Debug, thiserror::Error)]
pub enum Failure {
    #[error("invalid input path: {0}")]
    InvalidInput(String),

    #[error("transfer failed: {0}")]
    Transfer(#[from] TransferError),

    #[error("conversion failed: {0}")]
    Conversion(#[from] ConversionError),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
