//! Crate-level error type aggregating the per-module failures.
//!
//! The taxonomy: malformed frames and protocol violations are fatal to the
//! offending session only; client misuse is reported synchronously with the
//! library state unchanged; transport closure ends blocking calls. No
//! server-wide failure class exists.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Frame(#[from] crate::frame::FrameError),
    #[error(transparent)]
    Session(#[from] crate::server::SessionError),
    #[error(transparent)]
    Client(#[from] crate::client::ClientError),
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
