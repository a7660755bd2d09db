// src/errors.rs

//! Crate-wide error aliases and helpers.

use std::fmt::Display;

use thiserror::Error;

use crate::region::Region;

#[derive(Error, Debug)]
pub enum TaskweaveError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Malformed message: {0}")]
    Codec(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Unknown task: {0}")]
    UnknownTask(String),

    #[error("Region {0} is not mapped on this node")]
    UnmappedRegion(Region),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, TaskweaveError>;

/// Terminate the distributed job on an unrecoverable condition.
///
/// Transport failures have no retry path: the protocol layer assumes that a
/// sent message is eventually delivered or the whole job goes down.
#[track_caller]
pub fn fatal(context: &str, err: impl Display) -> ! {
    tracing::error!(%context, error = %err, "fatal runtime error");
    panic!("{context}: {err}");
}
