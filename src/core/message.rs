//! Published messages and channel selectors.

use bytes::Bytes;

use super::seq::{ClientId, SeqNum};

/// Which publications a subscription matches.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Selector {
    /// Every channel. Costs the whole fabric more sequencing work than a
    /// channel-specific subscription.
    All,
    Channel(String),
}

impl Selector {
    pub fn matches(&self, channel: &str) -> bool {
        match self {
            Selector::All => true,
            Selector::Channel(name) => name == channel,
        }
    }
}

/// An immutable published message.
///
/// `receive_seq > publish_seq` always holds for a message admitted by the
/// sequencer; the payload is a cheap-clone handle so one publication can fan
/// out to many recipients without copying.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub publisher: ClientId,
    pub publish_seq: SeqNum,
    pub receive_seq: SeqNum,
    pub channel: String,
    pub payload: Bytes,
}

impl Message {
    pub fn causally_valid(&self) -> bool {
        self.receive_seq > self.publish_seq
    }
}
