use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, FuseError>;

#[derive(Error, Debug)]
pub enum FuseError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Mount error: {0}")]
    Mount(String),

    #[error("Mount point busy: {0}")]
    Busy(PathBuf),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
}

impl From<nix::Error> for FuseError {
    fn from(err: nix::Error) -> Self {
        FuseError::Io(std::io::Error::from_raw_os_error(err as i32))
    }
}

impl From<toml::de::Error> for FuseError {
    fn from(err: toml::de::Error) -> Self {
        FuseError::Config(err.to_string())
    }
}
