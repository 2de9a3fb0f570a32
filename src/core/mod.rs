//! Core fabric types: sequence numbers, client identity, messages.

mod message;
mod seq;

pub use message::{Message, Selector};
pub use seq::{ClientId, SeqNum};
