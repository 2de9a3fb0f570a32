//! Sequence numbers and client identity.

use std::cmp::Ordering;
use std::fmt;

/// Totally ordered logical clock value stamping every fabric operation.
///
/// Travels on the wire as a big-endian IEEE-754 double. NaN never reaches
/// this type (the codec rejects it), so `total_cmp` ordering coincides with
/// numeric ordering for every admitted value.
#[derive(Clone, Copy, Debug, Default)]
pub struct SeqNum(f64);

impl SeqNum {
    /// The starting frontier of every client and session.
    pub const FIRST: SeqNum = SeqNum(0.0);

    /// Wrap a raw value; `None` for NaN.
    pub fn new(value: f64) -> Option<SeqNum> {
        if value.is_nan() {
            return None;
        }
        // Collapse -0.0 so the total order agrees with `==` on zero.
        Some(SeqNum(if value == 0.0 { 0.0 } else { value }))
    }

    pub fn get(self) -> f64 {
        self.0
    }
}

impl PartialEq for SeqNum {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SeqNum {}

impl PartialOrd for SeqNum {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SeqNum {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl fmt::Display for SeqNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server-assigned client identity, unique for the fabric's lifetime.
///
/// Ids start at 1; 0 never names a client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(u32);

impl ClientId {
    pub fn new(raw: u32) -> ClientId {
        ClientId(raw)
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
