use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Setup and I/O errors raised by the hypervisor's components.
#[derive(Debug, Error)]
pub enum HvError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("System call failed: {0}")]
    Sys(#[from] nix::errno::Errno),

    #[error("Failed to bind {path}: {source}")]
    Bind { path: PathBuf, source: io::Error },

    #[error("Failed to set permissions on {path}: {source}")]
    Permissions { path: PathBuf, source: io::Error },

    #[error("Socket path too long: {0}")]
    PathTooLong(PathBuf),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, HvError>;
