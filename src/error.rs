use std::path::PathBuf;
use thiserror::Error;

use crate::catalog::CatalogError;
use crate::config::ConfigError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Catalog not found at {0}")]
    CatalogNotFound(PathBuf),

    #[error("Project '{0}' not found")]
    ProjectNotFound(String),

    #[error("Project error: {0}")]
    Project(String),

    #[error("Series selection error: {0}")]
    Selection(String),

    /// Invalid combination or value of user-supplied options
    #[error("{0}")]
    Usage(String),

    #[error("Cannot negotiate a presentation context: {0}")]
    NoPresentationContext(String),

    #[error("DIMSE error: {0}")]
    Dimse(#[from] dimse::DimseError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    pub fn usage(msg: impl Into<String>) -> Self {
        Self::Usage(msg.into())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(err: toml::ser::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Io(std::io::Error::other(err.to_string()))
    }
}
