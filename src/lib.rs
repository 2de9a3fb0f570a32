#![forbid(unsafe_code)]

//! Deterministic publish/subscribe fabric for multi-process simulations.
//!
//! A central sequencer interleaves every client operation onto a single total
//! order parameterized by a monotone sequence number, and releases each client
//! only once what it observes is causally complete with respect to that
//! order. Given the same client programs, the fabric produces the same
//! observable message trace regardless of real-time scheduling jitter.
//!
//! The crate is cooperative and thread-free at its core: the sequencer and
//! the client each expose a work function that callers drive on whatever
//! thread they like (one thread per endpoint is the canonical pattern).

pub mod client;
pub mod config;
pub mod core;
pub mod critic;
pub mod error;
pub mod frame;
pub mod proto;
pub mod server;
pub mod transport;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the types most callers touch at the crate root.
pub use crate::client::{Client, ClientError};
pub use crate::config::{Config, Limits};
pub use crate::core::{ClientId, Message, Selector, SeqNum};
pub use crate::critic::{TraceEvent, critique};
pub use crate::server::Sequencer;
pub use crate::transport::{Channel, LoopbackChannel, TcpChannel, TcpChannelListener};
