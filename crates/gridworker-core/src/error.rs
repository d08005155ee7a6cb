//! Errors raised before any database connection is attempted.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("config file is missing required key `{0}`")]
    MissingKey(&'static str),
    #[error("config key `port` is not a valid port number: {0}")]
    InvalidPort(String),
}
