use thiserror::Error;

/// Errors produced while preparing or running a delivery.
///
/// `Input`, `Api`, `StorageConfig` and `Staging` abort the whole session
/// before any worker touches a file. `Io`, `Upload` and `Download` are
/// file-scoped: the orchestrator records them in the status table and
/// keeps the remaining files moving.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Input(String),

    #[error("metadata service error: {0}")]
    Api(String),

    #[error("storage configuration error: {0}")]
    StorageConfig(String),

    #[error("upload failed: {0}")]
    Upload(String),

    #[error("download failed: {0}")]
    Download(String),

    #[error("staging directory error: {0}")]
    Staging(String),
}

pub type Result<T> = std::result::Result<T, DeliveryError>;
