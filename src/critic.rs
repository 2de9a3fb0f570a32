//! Causal-order critic: a pure oracle over recorded event traces.
//!
//! Feed it the interleaved publish/receive/sequence events one endpoint
//! observed and it returns human-readable diagnostics for every causal
//! violation: a message arriving no later than it was sent, or any event at
//! or behind the running sequence cursor. It never mutates fabric state;
//! tests use it to check the fabric's own output against the rules the
//! fabric claims to enforce.

use crate::core::{ClientId, SeqNum};

#[derive(Clone, Debug, PartialEq)]
pub enum TraceEvent {
    Publish {
        publisher: ClientId,
        publish_seq: SeqNum,
        receive_seq: SeqNum,
        /// Recipients resolved at publish time, with their receive points.
        recipients: Vec<(ClientId, SeqNum)>,
    },
    Receive {
        receiver: ClientId,
        receive_seq: SeqNum,
    },
    Sequence {
        seq_num: SeqNum,
    },
}

impl TraceEvent {
    fn seq(&self) -> SeqNum {
        match self {
            TraceEvent::Publish { publish_seq, .. } => *publish_seq,
            TraceEvent::Receive { receive_seq, .. } => *receive_seq,
            TraceEvent::Sequence { seq_num } => *seq_num,
        }
    }
}

/// Validate a trace; an empty return means no violation was found.
pub fn critique(events: &[TraceEvent]) -> Vec<String> {
    let mut diagnostics = Vec::new();
    let mut cursor: Option<SeqNum> = None;

    for (index, event) in events.iter().enumerate() {
        match event {
            TraceEvent::Publish {
                publisher,
                publish_seq,
                receive_seq,
                recipients,
            } => {
                if *receive_seq <= *publish_seq {
                    diagnostics.push(format!(
                        "event {index}: client {publisher} publication received at \
                         {receive_seq}, no later than its publish point {publish_seq}"
                    ));
                }
                for (recipient, recv_seq) in recipients {
                    if behind(cursor, *recv_seq) {
                        diagnostics.push(format!(
                            "event {index}: delivery to client {recipient} at {recv_seq} \
                             is behind the sequence cursor"
                        ));
                    }
                }
                if behind(cursor, *publish_seq) {
                    diagnostics.push(format!(
                        "event {index}: client {publisher} published at {publish_seq}, \
                         behind the sequence cursor"
                    ));
                }
            }
            TraceEvent::Receive {
                receiver,
                receive_seq,
            } => {
                if behind(cursor, *receive_seq) {
                    diagnostics.push(format!(
                        "event {index}: client {receiver} received at {receive_seq}, \
                         behind the sequence cursor"
                    ));
                }
            }
            TraceEvent::Sequence { seq_num } => {
                if behind(cursor, *seq_num) {
                    diagnostics.push(format!(
                        "event {index}: sequence point {seq_num} is behind the cursor"
                    ));
                }
            }
        }
        cursor = Some(event.seq());
    }

    diagnostics
}

fn behind(cursor: Option<SeqNum>, seq: SeqNum) -> bool {
    match cursor {
        Some(cursor) => seq <= cursor,
        None => false,
    }
}
