use thiserror::Error;

#[derive(Error, Debug)]
pub enum UplinkError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid collection path: {0}")]
    InvalidPath(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("File system error: {0}")]
    FileSystem(String),

    #[error("Watcher error: {0}")]
    Watcher(#[from] notify::Error),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl From<std::io::Error> for UplinkError {
    fn from(err: std::io::Error) -> Self {
        UplinkError::FileSystem(err.to_string())
    }
}

impl From<anyhow::Error> for UplinkError {
    fn from(err: anyhow::Error) -> Self {
        UplinkError::Unknown(err.to_string())
    }
}
