//! Client library: the protocol mirror of the sequencer.
//!
//! Every interaction with the fabric carries a sequence number, and within
//! one client the union of all sequence numbers it mentions (publish points,
//! clear points, subscription effective points) must be nondecreasing in
//! call order. The library enforces that locally and rejects violations as
//! `Misuse` before anything reaches the wire.
//!
//! Blocking calls (`start`, `subscribe`, `unsubscribe`, `await_advance`,
//! `receive_until`) drive the channel's work function in a poll loop; the
//! rest never suspend. There are no internal timers: a blocking call is
//! cancelled by closing the transport, which surfaces as `Closed`.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

use crate::config::Limits;
use crate::core::{ClientId, Message, Selector, SeqNum};
use crate::proto::{self, DecodeError, PublishBody, SubscriptionChange, WireMessage};
use crate::transport::Channel;

#[derive(Debug, Error)]
pub enum ClientError {
    /// A call violated the client-local contract; the library state is
    /// unchanged.
    #[error("client misuse: {0}")]
    Misuse(String),
    /// Transport EOF or failure.
    #[error("transport closed")]
    Closed,
    #[error("malformed server frame: {0}")]
    Malformed(#[from] DecodeError),
    #[error("unexpected server frame {0}")]
    UnexpectedFrame(&'static str),
}

fn misuse(reason: String) -> ClientError {
    ClientError::Misuse(reason)
}

pub struct Client<C: Channel> {
    channel: C,
    limits: Limits,
    poll_interval: Duration,
    id: Option<ClientId>,
    /// Last sequence number this client mentioned in any call; the running
    /// lower bound of the local monotonicity contract.
    cursor: SeqNum,
    min_send_seq: SeqNum,
    min_recv_seq: SeqNum,
    last_grant: Option<SeqNum>,
    inbox: Vec<Message>,
    grants: VecDeque<SeqNum>,
    subscribe_acks: VecDeque<SeqNum>,
    unsubscribe_acks: VecDeque<SeqNum>,
    closed: bool,
}

impl<C: Channel> Client<C> {
    pub fn new(channel: C) -> Client<C> {
        Client::with_limits(channel, Limits::default())
    }

    pub fn with_limits(channel: C, limits: Limits) -> Client<C> {
        Client {
            channel,
            limits,
            poll_interval: Duration::from_millis(1),
            id: None,
            cursor: SeqNum::FIRST,
            min_send_seq: SeqNum::FIRST,
            min_recv_seq: SeqNum::FIRST,
            last_grant: None,
            inbox: Vec::new(),
            grants: VecDeque::new(),
            subscribe_acks: VecDeque::new(),
            unsubscribe_acks: VecDeque::new(),
            closed: false,
        }
    }

    pub fn id(&self) -> Option<ClientId> {
        self.id
    }

    /// The client's promise to the server: no future publish, clear, or
    /// subscription change below this.
    pub fn min_send_seq(&self) -> SeqNum {
        self.min_send_seq
    }

    /// The server's promise to the client: no future delivery below this.
    pub fn min_recv_seq(&self) -> SeqNum {
        self.min_recv_seq
    }

    /// The value last returned by `await_advance`.
    pub fn last_grant(&self) -> Option<SeqNum> {
        self.last_grant
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// (BLOCKING) Handshake with the server and return the assigned id.
    pub fn start(&mut self) -> Result<ClientId, ClientError> {
        if self.id.is_some() {
            return Err(misuse("client already started".to_string()));
        }
        self.send(&WireMessage::Hello);
        loop {
            if let Some(id) = self.id {
                return Ok(id);
            }
            self.block_on_io()?;
        }
    }

    /// (BLOCKING) Subscribe from `req_eff`; returns the server's effective
    /// point, which may be later than requested.
    pub fn subscribe(&mut self, selector: Selector, req_eff: SeqNum) -> Result<SeqNum, ClientError> {
        self.subscription_change(selector, req_eff, false)
    }

    /// (BLOCKING) Exact opposite of `subscribe`, same sequence semantics.
    pub fn unsubscribe(
        &mut self,
        selector: Selector,
        req_eff: SeqNum,
    ) -> Result<SeqNum, ClientError> {
        self.subscription_change(selector, req_eff, true)
    }

    fn subscription_change(
        &mut self,
        selector: Selector,
        req_eff: SeqNum,
        removal: bool,
    ) -> Result<SeqNum, ClientError> {
        self.ensure_started()?;
        self.check_monotone("subscription effective point", req_eff)?;
        if let Selector::Channel(name) = &selector {
            self.check_channel_name(name)?;
        }
        let change = SubscriptionChange { req_eff, selector };
        let msg = if removal {
            WireMessage::Unsubscribe(change)
        } else {
            WireMessage::Subscribe(change)
        };
        self.cursor = req_eff;
        self.send(&msg);
        loop {
            let ack = if removal {
                self.unsubscribe_acks.pop_front()
            } else {
                self.subscribe_acks.pop_front()
            };
            if let Some(eff) = ack {
                return Ok(eff);
            }
            self.block_on_io()?;
        }
    }

    /// Publish a message. Never blocks; the frame is queued and flushed
    /// opportunistically. Publishing at `publish_seq` promises never to
    /// mention a lower sequence number again.
    pub fn publish(
        &mut self,
        channel: &str,
        publish_seq: SeqNum,
        receive_seq: SeqNum,
        payload: Bytes,
    ) -> Result<(), ClientError> {
        self.ensure_started()?;
        self.check_monotone("publish_seq", publish_seq)?;
        if receive_seq <= publish_seq {
            return Err(misuse(format!(
                "receive_seq {receive_seq} not after publish_seq {publish_seq}"
            )));
        }
        self.check_channel_name(channel)?;
        if payload.len() > self.limits.max_payload_bytes {
            return Err(misuse(format!(
                "payload of {} bytes exceeds limit {}",
                payload.len(),
                self.limits.max_payload_bytes
            )));
        }
        self.cursor = publish_seq;
        self.min_send_seq = publish_seq;
        self.send(&WireMessage::Publish(PublishBody {
            publish_seq,
            receive_seq,
            channel: channel.to_string(),
            payload,
        }));
        Ok(())
    }

    /// Promise never to publish below `clear_until`. Never blocks.
    pub fn clear_to_advance(&mut self, clear_until: SeqNum) -> Result<(), ClientError> {
        self.ensure_started()?;
        self.check_monotone("clear_until", clear_until)?;
        self.cursor = clear_until;
        self.min_send_seq = clear_until;
        self.send(&WireMessage::ClearToAdvance { seq: clear_until });
        Ok(())
    }

    /// Ask the server for a grant up to `seq`. Never blocks. Requesting a
    /// view through `seq` commits this client to not publishing below it.
    pub fn request_advance(&mut self, seq: SeqNum) -> Result<(), ClientError> {
        self.ensure_started()?;
        if seq < self.min_recv_seq {
            return Err(misuse(format!(
                "advance request {seq} regresses receive frontier {}",
                self.min_recv_seq
            )));
        }
        self.min_send_seq = self.min_send_seq.max(seq);
        self.cursor = self.cursor.max(seq);
        self.send(&WireMessage::RequestAdvance { seq });
        Ok(())
    }

    /// (BLOCKING) Wait for the next grant exceeding the last returned one.
    pub fn await_advance(&mut self) -> Result<SeqNum, ClientError> {
        self.ensure_started()?;
        loop {
            while let Some(granted) = self.grants.pop_front() {
                if self.last_grant.is_none_or(|last| granted > last) {
                    self.last_grant = Some(granted);
                    return Ok(granted);
                }
            }
            self.block_on_io()?;
        }
    }

    /// Drain every delivery buffered locally, in delivery order, together
    /// with the receive frontier. Never blocks.
    pub fn receive_messages(&mut self) -> Result<(Vec<Message>, SeqNum), ClientError> {
        self.ensure_started()?;
        if !self.closed {
            self.pump()?;
        }
        let messages = std::mem::take(&mut self.inbox);
        if !messages.is_empty() {
            self.send(&WireMessage::DeliveryAck {
                seq: self.min_recv_seq,
            });
        }
        Ok((messages, self.min_recv_seq))
    }

    /// (BLOCKING) Advance the receive frontier to at least `clear_until`,
    /// returning everything delivered on the way.
    pub fn receive_until(
        &mut self,
        clear_until: SeqNum,
    ) -> Result<(Vec<Message>, SeqNum), ClientError> {
        self.clear_to_advance(clear_until)?;
        if self.min_recv_seq < clear_until {
            self.request_advance(clear_until)?;
        }
        let mut received = Vec::new();
        loop {
            let (mut batch, frontier) = self.receive_messages()?;
            received.append(&mut batch);
            if frontier >= clear_until {
                return Ok((received, frontier));
            }
            self.await_advance()?;
        }
    }

    fn ensure_started(&self) -> Result<ClientId, ClientError> {
        self.id
            .ok_or_else(|| misuse("client not started".to_string()))
    }

    fn check_monotone(&self, what: &str, seq: SeqNum) -> Result<(), ClientError> {
        if seq < self.cursor {
            return Err(misuse(format!(
                "{what} {seq} regresses the last mentioned sequence number {}",
                self.cursor
            )));
        }
        Ok(())
    }

    fn check_channel_name(&self, name: &str) -> Result<(), ClientError> {
        if name.len() > self.limits.max_channel_name_len {
            return Err(misuse(format!(
                "channel name of {} bytes exceeds limit {}",
                name.len(),
                self.limits.max_channel_name_len
            )));
        }
        Ok(())
    }

    /// Queue a frame and flush opportunistically. On a closed transport
    /// nonblocking sends are dropped; blocking callers notice via `pump`.
    fn send(&mut self, msg: &WireMessage) {
        if self.closed {
            return;
        }
        match proto::encode(msg) {
            Ok(payload) => {
                self.channel.queue_frame(payload);
                if !self.channel.process_io() {
                    self.closed = true;
                }
            }
            Err(err) => {
                // Size limits are checked before encoding; reaching here is
                // a bug in those checks, not in the caller.
                tracing::warn!(error = %err, "dropping unencodable frame");
            }
        }
    }

    /// One round of the work function: move bytes, absorb inbound frames.
    fn pump(&mut self) -> Result<bool, ClientError> {
        let open = self.channel.process_io();
        let frames = self.channel.drain_frames();
        let progress = !frames.is_empty();
        for raw in frames {
            let msg = proto::decode(&raw).inspect_err(|_| {
                self.channel.close();
                self.closed = true;
            })?;
            self.absorb(msg)?;
        }
        if !open {
            self.closed = true;
        }
        Ok(progress)
    }

    /// Pump once for a blocking loop: fail once the transport is gone,
    /// sleep briefly when idle.
    fn block_on_io(&mut self) -> Result<(), ClientError> {
        if self.closed {
            return Err(ClientError::Closed);
        }
        if !self.pump()? {
            std::thread::sleep(self.poll_interval);
        }
        Ok(())
    }

    fn absorb(&mut self, msg: WireMessage) -> Result<(), ClientError> {
        match msg {
            WireMessage::HelloAck(ack) => {
                if self.id.is_some() {
                    return Err(ClientError::UnexpectedFrame("HELLO_ACK"));
                }
                self.id = Some(ack.client_id);
                self.cursor = ack.initial_seq;
                self.min_send_seq = ack.initial_seq;
                self.min_recv_seq = ack.initial_seq;
                Ok(())
            }
            WireMessage::SubscribeAck { eff } => {
                self.subscribe_acks.push_back(eff);
                Ok(())
            }
            WireMessage::UnsubscribeAck { eff } => {
                self.unsubscribe_acks.push_back(eff);
                Ok(())
            }
            WireMessage::AdvanceGrant { seq } => {
                self.min_recv_seq = self.min_recv_seq.max(seq);
                self.grants.push_back(seq);
                Ok(())
            }
            WireMessage::Deliver(message) => {
                self.inbox.push(message);
                Ok(())
            }
            other => Err(ClientError::UnexpectedFrame(other.kind())),
        }
    }
}
