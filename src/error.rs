//! Error type shared by every policy component.
//!
//! Nothing in this crate is allowed to take the host process down: callers
//! turn these errors into a notification plus a no-op.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid JSON in {name}: {source}")]
    Json {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(#[from] toml::de::Error),

    #[error("network error fetching {url}: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("request to {url} failed with status {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("storage name {0:?} escapes the data directory")]
    InvalidName(String),

    #[error("unknown session {0:?}")]
    UnknownSession(String),

    #[error("unknown download {0}")]
    UnknownDownload(String),

    #[error("{0}")]
    Rejected(String),
}

pub type Result<T> = std::result::Result<T, PolicyError>;

impl PolicyError {
    pub(crate) fn io(path: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn json(name: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Json {
            name: name.into(),
            source,
        }
    }

    pub(crate) fn http(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Http {
            url: url.into(),
            source,
        }
    }
}
