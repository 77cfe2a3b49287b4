use thiserror::Error;

/// Failure of a single fetch. Scoped to one pipeline and delivered to the
/// consumer that asked for the item; never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("HTTP {status}: {url}")]
    Status { status: u16, url: String },

    #[error("Empty response body: {url}")]
    EmptyBody { url: String },
}

impl FetchError {
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Setup failures: building the worker pool, the HTTP client, or loading
/// configuration.
#[derive(Error, Debug)]
pub enum AstroError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, AstroError>;
