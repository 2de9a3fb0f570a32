//! Per-client server session state machine.
//!
//! A session owns one byte channel and the client's frontier bookkeeping:
//! `min_send_seq` (the client's promise never to mention a lower sequence
//! number again) and `min_recv_seq` (the server's promise that no future
//! delivery will carry a lower receive sequence). Both are monotone; any
//! regression a client requests is a fatal protocol violation.
//!
//! Lifecycle: `Handshaking -> Active -> Closing -> Dead`. A fatal error
//! moves the session to `Closing`, where it emits nothing further and drops
//! inbound; the sequencer reaps it and recomputes the global frontier.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::core::{ClientId, Message, SeqNum};
use crate::proto::{self, DecodeError, WireMessage};
use crate::transport::Channel;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionPhase {
    Handshaking,
    Active,
    Closing,
    Dead,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] DecodeError),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
}

fn violation(reason: String) -> SessionError {
    SessionError::ProtocolViolation(reason)
}

/// Sort key of the pending-delivery queue: receive order, ties broken by
/// publisher then publish sequence, with the admission index as the final
/// disambiguator for byte-identical republications.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct DeliveryKey {
    pub receive_seq: SeqNum,
    pub publisher: ClientId,
    pub publish_seq: SeqNum,
    pub index: u64,
}

#[derive(Debug)]
pub struct Session<C: Channel> {
    channel: C,
    phase: SessionPhase,
    id: Option<ClientId>,
    min_send_seq: SeqNum,
    min_recv_seq: SeqNum,
    pending_grant: Option<SeqNum>,
    pending_delivery: BTreeMap<DeliveryKey, Message>,
}

impl<C: Channel> Session<C> {
    pub fn new(channel: C) -> Session<C> {
        Session {
            channel,
            phase: SessionPhase::Handshaking,
            id: None,
            min_send_seq: SeqNum::FIRST,
            min_recv_seq: SeqNum::FIRST,
            pending_grant: None,
            pending_delivery: BTreeMap::new(),
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn id(&self) -> Option<ClientId> {
        self.id
    }

    pub fn min_send_seq(&self) -> SeqNum {
        self.min_send_seq
    }

    pub fn min_recv_seq(&self) -> SeqNum {
        self.min_recv_seq
    }

    pub fn pending_grant(&self) -> Option<SeqNum> {
        self.pending_grant
    }

    pub fn is_live(&self) -> bool {
        self.phase == SessionPhase::Active
    }

    /// Pump the underlying channel. Transport EOF moves the session to
    /// `Closing`.
    pub fn process_io(&mut self) {
        if matches!(self.phase, SessionPhase::Closing | SessionPhase::Dead) {
            return;
        }
        if !self.channel.process_io() {
            self.phase = SessionPhase::Closing;
        }
    }

    /// Drain and decode every inbound frame. A malformed frame is fatal.
    pub fn poll_inbound(&mut self) -> Result<Vec<WireMessage>, SessionError> {
        if matches!(self.phase, SessionPhase::Closing | SessionPhase::Dead) {
            return Ok(Vec::new());
        }
        let mut messages = Vec::new();
        for raw in self.channel.drain_frames() {
            messages.push(proto::decode(&raw)?);
        }
        Ok(messages)
    }

    /// Queue one frame for the client. Silently dropped once closing.
    pub fn send(&mut self, msg: &WireMessage) {
        if matches!(self.phase, SessionPhase::Closing | SessionPhase::Dead) {
            return;
        }
        match proto::encode(msg) {
            Ok(payload) => self.channel.queue_frame(payload),
            Err(err) => {
                // Outbound frames are server-built; an unencodable one means
                // the session state is unusable.
                tracing::warn!(error = %err, "failed to encode outbound frame");
                self.fail();
            }
        }
    }

    /// Complete the handshake: the session now has an identity and accepts
    /// the full operation set.
    pub fn activate(&mut self, id: ClientId) {
        self.id = Some(id);
        self.phase = SessionPhase::Active;
    }

    /// Fatal error: emit nothing further, drop inbound, await reaping.
    pub fn fail(&mut self) {
        if self.phase != SessionPhase::Dead {
            self.phase = SessionPhase::Closing;
        }
    }

    /// Release the byte channel.
    pub fn shutdown(&mut self) {
        self.channel.close();
        self.phase = SessionPhase::Dead;
    }

    // Frontier transitions. Each checks its precondition and returns a
    // protocol violation on regression.

    pub fn record_publish(
        &mut self,
        publish_seq: SeqNum,
        receive_seq: SeqNum,
    ) -> Result<(), SessionError> {
        if publish_seq < self.min_send_seq {
            return Err(violation(format!(
                "publish_seq {publish_seq} regresses send frontier {}",
                self.min_send_seq
            )));
        }
        if receive_seq <= publish_seq {
            return Err(violation(format!(
                "receive_seq {receive_seq} not after publish_seq {publish_seq}"
            )));
        }
        self.min_send_seq = publish_seq;
        Ok(())
    }

    pub fn clear_to(&mut self, seq: SeqNum) -> Result<(), SessionError> {
        if seq < self.min_send_seq {
            return Err(violation(format!(
                "clear-to-advance {seq} regresses send frontier {}",
                self.min_send_seq
            )));
        }
        self.min_send_seq = seq;
        Ok(())
    }

    /// Request a grant up to `seq`. Asking to receive through `seq` commits
    /// the client to not publishing below it, so the send frontier rises
    /// with the request.
    pub fn request_grant(&mut self, seq: SeqNum) -> Result<(), SessionError> {
        if seq < self.min_recv_seq {
            return Err(violation(format!(
                "advance request {seq} regresses receive frontier {}",
                self.min_recv_seq
            )));
        }
        self.pending_grant = Some(seq);
        self.min_send_seq = self.min_send_seq.max(seq);
        Ok(())
    }

    pub fn ack_delivery(&mut self, seq: SeqNum) {
        self.min_recv_seq = self.min_recv_seq.max(seq);
    }

    pub fn check_subscription_eff(&self, req_eff: SeqNum) -> Result<(), SessionError> {
        if req_eff < self.min_send_seq {
            return Err(violation(format!(
                "subscription change at {req_eff} regresses send frontier {}",
                self.min_send_seq
            )));
        }
        Ok(())
    }

    pub(crate) fn push_delivery(&mut self, key: DeliveryKey, message: Message) {
        self.pending_delivery.insert(key, message);
    }

    /// Emit every queued delivery with `receive_seq <= released`, in
    /// delivery order. Returns the number dispatched.
    pub fn dispatch_ready(&mut self, released: SeqNum) -> usize {
        let mut dispatched = 0;
        loop {
            let key = match self.pending_delivery.keys().next() {
                Some(key) if key.receive_seq <= released => *key,
                _ => break,
            };
            if let Some(message) = self.pending_delivery.remove(&key) {
                self.send(&WireMessage::Deliver(message));
                dispatched += 1;
            }
        }
        dispatched
    }

    /// Grant rule of the sequencer, evaluated after `dispatch_ready`: issue
    /// `min(T, released)`. A full grant clears the request; a partial grant
    /// is issued only when it advances the receive frontier, and leaves the
    /// request pending for when the global frontier rises further.
    pub fn try_grant(&mut self, released: SeqNum) -> Option<SeqNum> {
        let requested = self.pending_grant?;
        let grant = requested.min(released);
        if grant == requested {
            self.send(&WireMessage::AdvanceGrant { seq: grant });
            self.min_recv_seq = self.min_recv_seq.max(grant);
            self.pending_grant = None;
            Some(grant)
        } else if grant > self.min_recv_seq {
            self.send(&WireMessage::AdvanceGrant { seq: grant });
            self.min_recv_seq = grant;
            Some(grant)
        } else {
            None
        }
    }
}
