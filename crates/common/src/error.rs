//! Gateway-wide error type

use thiserror::Error;

/// Errors raised while loading and validating gateway configuration.
///
/// Key material problems get their own variant so startup logs
/// distinguish a bad key source from a bad config file.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("api key source error: {0}")]
    Keys(String),

    #[error("config file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config file parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Result alias using the gateway Error
pub type Result<T> = std::result::Result<T, Error>;
