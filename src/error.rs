//! Crate-wide error type for operations with a caller-visible failure mode.
//!
//! Most of the proxy core swallows failures at task boundaries (see
//! spec §7) — this type exists only for the handful of operations the
//! contract says must surface a `Result`: config file I/O/parsing and
//! descriptor validation.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read config file {path}: {source}")]
    ConfigRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write config file {path}: {source}")]
    ConfigWrite {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config at {path}: {source}")]
    ConfigParse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to serialize config: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    #[error("invalid server descriptor '{name}': {reason}")]
    InvalidDescriptor { name: String, reason: String },
}

pub type Result<T> = std::result::Result<T, Error>;
