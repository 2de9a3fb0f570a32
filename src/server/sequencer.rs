//! The sequencer: single authority for the fabric's total order.
//!
//! Owns every session. `handle_io` is the work function a host loop drives:
//! it drains inbound frames on every session, applies each operation's state
//! transition, reaps dead sessions, re-evaluates advance grants against the
//! global send frontier, and flushes outbound deliveries and grants.
//!
//! Grant rule: let `G` be the minimum `min_send_seq` across live sessions.
//! Deliveries with `receive_seq <= G` are safe to release because every
//! future publication carries `publish_seq >= G` and a strictly greater
//! `receive_seq`. Once a session's queue holds nothing at or below `G`, it
//! may be granted `min(requested, G)`. Sessions are examined in ascending
//! client id order so the observable trace does not depend on the real-time
//! order in which their frames arrived.

use std::collections::BTreeMap;

use crate::core::{ClientId, Message, SeqNum};
use crate::proto::{HelloAck, WireMessage};
use crate::server::session::{DeliveryKey, Session, SessionError, SessionPhase};
use crate::server::subscription::SubscriptionTable;
use crate::transport::Channel;

pub struct Sequencer<C: Channel> {
    handshaking: Vec<Session<C>>,
    sessions: BTreeMap<ClientId, Session<C>>,
    subscriptions: SubscriptionTable,
    next_client_id: u32,
    /// Largest sequence number the server has resolved a publication at or
    /// issued a grant for; subscription effective points are clamped to it.
    release_frontier: SeqNum,
    next_publish_index: u64,
}

impl<C: Channel> Sequencer<C> {
    pub fn new() -> Sequencer<C> {
        Sequencer {
            handshaking: Vec::new(),
            sessions: BTreeMap::new(),
            subscriptions: SubscriptionTable::new(),
            next_client_id: 1,
            release_frontier: SeqNum::FIRST,
            next_publish_index: 0,
        }
    }

    /// Adopt a freshly accepted byte channel. The session stays anonymous
    /// until its `Hello` arrives.
    pub fn attach(&mut self, channel: C) {
        self.handshaking.push(Session::new(channel));
    }

    pub fn session_count(&self) -> usize {
        self.handshaking.len() + self.sessions.len()
    }

    /// Minimum send frontier across live sessions; the release bound for
    /// deliveries and grants. `None` with no live sessions.
    pub fn global_frontier(&self) -> Option<SeqNum> {
        self.sessions
            .values()
            .filter(|s| s.is_live())
            .map(|s| s.min_send_seq())
            .min()
    }

    /// The work function. Returns true if any forward progress was made, so
    /// hosts can back off polling when the fabric is idle.
    pub fn handle_io(&mut self) -> bool {
        let mut progress = self.poll_handshaking();
        progress |= self.poll_sessions();
        self.sweep();
        progress |= self.evaluate_grants();
        self.flush();
        progress
    }

    fn allocate_client_id(&mut self) -> ClientId {
        let id = ClientId::new(self.next_client_id);
        self.next_client_id += 1;
        id
    }

    fn poll_handshaking(&mut self) -> bool {
        let mut progress = false;
        let pending = std::mem::take(&mut self.handshaking);
        for mut session in pending {
            session.process_io();
            let messages = match session.poll_inbound() {
                Ok(messages) => messages,
                Err(err) => {
                    tracing::warn!(error = %err, "dropping connection before handshake");
                    session.shutdown();
                    continue;
                }
            };
            if messages.is_empty() {
                if session.phase() == SessionPhase::Closing {
                    session.shutdown();
                } else {
                    self.handshaking.push(session);
                }
                continue;
            }
            progress = true;
            let mut rest = messages.into_iter();
            match rest.next() {
                Some(WireMessage::Hello) => {
                    let id = self.allocate_client_id();
                    session.activate(id);
                    session.send(&WireMessage::HelloAck(HelloAck {
                        client_id: id,
                        initial_seq: SeqNum::FIRST,
                    }));
                    tracing::info!(client = %id, "client joined");
                    self.sessions.insert(id, session);
                    // A client may legally pipeline operations behind its
                    // Hello; apply whatever arrived in the same batch.
                    for msg in rest {
                        if let Err(err) = self.apply(id, msg) {
                            self.fail_session(id, &err);
                            break;
                        }
                    }
                }
                Some(other) => {
                    tracing::warn!(kind = other.kind(), "frame before HELLO");
                    session.shutdown();
                }
                None => unreachable!("non-empty message batch"),
            }
        }
        progress
    }

    fn poll_sessions(&mut self) -> bool {
        let mut progress = false;
        let ids: Vec<ClientId> = self.sessions.keys().copied().collect();
        for id in ids {
            let messages = {
                let Some(session) = self.sessions.get_mut(&id) else {
                    continue;
                };
                session.process_io();
                match session.poll_inbound() {
                    Ok(messages) => messages,
                    Err(err) => {
                        self.fail_session(id, &err);
                        continue;
                    }
                }
            };
            for msg in messages {
                progress = true;
                if let Err(err) = self.apply(id, msg) {
                    self.fail_session(id, &err);
                    break;
                }
            }
        }
        progress
    }

    /// Apply one client operation's state transition.
    fn apply(&mut self, id: ClientId, msg: WireMessage) -> Result<(), SessionError> {
        match msg {
            WireMessage::Hello => Err(SessionError::ProtocolViolation(
                "duplicate HELLO".to_string(),
            )),
            WireMessage::Subscribe(change) => {
                let eff = {
                    let session = self.session_mut(&id)?;
                    session.check_subscription_eff(change.req_eff)?;
                    change.req_eff.max(self.release_frontier)
                };
                self.subscriptions.subscribe(id, change.selector, eff);
                self.session_mut(&id)?
                    .send(&WireMessage::SubscribeAck { eff });
                Ok(())
            }
            WireMessage::Unsubscribe(change) => {
                let eff = {
                    let session = self.session_mut(&id)?;
                    session.check_subscription_eff(change.req_eff)?;
                    change.req_eff.max(self.release_frontier)
                };
                self.subscriptions.unsubscribe(id, &change.selector, eff);
                self.session_mut(&id)?
                    .send(&WireMessage::UnsubscribeAck { eff });
                Ok(())
            }
            WireMessage::Publish(body) => {
                self.session_mut(&id)?
                    .record_publish(body.publish_seq, body.receive_seq)?;
                self.resolve_publication(id, body);
                Ok(())
            }
            WireMessage::ClearToAdvance { seq } => self.session_mut(&id)?.clear_to(seq),
            WireMessage::RequestAdvance { seq } => self.session_mut(&id)?.request_grant(seq),
            WireMessage::DeliveryAck { seq } => {
                self.session_mut(&id)?.ack_delivery(seq);
                Ok(())
            }
            other => Err(SessionError::ProtocolViolation(format!(
                "client sent server frame {}",
                other.kind()
            ))),
        }
    }

    /// Resolve a publication's recipients from the subscriptions active at
    /// its publish point and queue it for delivery.
    fn resolve_publication(&mut self, publisher: ClientId, body: crate::proto::PublishBody) {
        self.release_frontier = self.release_frontier.max(body.publish_seq);
        let recipients = self.subscriptions.matches(&body.channel, body.publish_seq);
        let index = self.next_publish_index;
        self.next_publish_index += 1;
        let message = Message {
            publisher,
            publish_seq: body.publish_seq,
            receive_seq: body.receive_seq,
            channel: body.channel,
            payload: body.payload,
        };
        tracing::debug!(
            publisher = %publisher,
            channel = %message.channel,
            publish_seq = %message.publish_seq,
            recipients = recipients.len(),
            "publication resolved"
        );
        let key = DeliveryKey {
            receive_seq: message.receive_seq,
            publisher,
            publish_seq: message.publish_seq,
            index,
        };
        for recipient in recipients {
            if let Some(session) = self.sessions.get_mut(&recipient) {
                if session.is_live() {
                    session.push_delivery(key, message.clone());
                }
            }
        }
    }

    fn session_mut(&mut self, id: &ClientId) -> Result<&mut Session<C>, SessionError> {
        self.sessions.get_mut(id).ok_or_else(|| {
            SessionError::ProtocolViolation("operation on reaped session".to_string())
        })
    }

    fn fail_session(&mut self, id: ClientId, err: &SessionError) {
        tracing::warn!(client = %id, error = %err, "session failed");
        if let Some(session) = self.sessions.get_mut(&id) {
            session.fail();
        }
    }

    /// Remove dead and closing sessions. Their departure raises the global
    /// frontier, so pending grants are re-evaluated right after.
    fn sweep(&mut self) {
        let reaped: Vec<ClientId> = self
            .sessions
            .iter()
            .filter(|(_, s)| matches!(s.phase(), SessionPhase::Closing | SessionPhase::Dead))
            .map(|(id, _)| *id)
            .collect();
        for id in reaped {
            if let Some(mut session) = self.sessions.remove(&id) {
                session.shutdown();
            }
            self.subscriptions.remove_client(id);
            tracing::info!(client = %id, "client departed");
        }
    }

    /// Release deliveries and grants against the current global frontier,
    /// in ascending client id order.
    fn evaluate_grants(&mut self) -> bool {
        let Some(released) = self.global_frontier() else {
            return false;
        };
        let mut progress = false;
        let mut granted_high = None;
        for session in self.sessions.values_mut() {
            if !session.is_live() || session.pending_grant().is_none() {
                continue;
            }
            if session.dispatch_ready(released) > 0 {
                progress = true;
            }
            if let Some(granted) = session.try_grant(released) {
                progress = true;
                granted_high = granted_high.max(Some(granted));
                tracing::trace!(
                    client = %session.id().map(|id| id.get()).unwrap_or(0),
                    granted = %granted,
                    "advance granted"
                );
            }
        }
        if let Some(high) = granted_high {
            self.release_frontier = self.release_frontier.max(high);
        }
        progress
    }

    fn flush(&mut self) {
        for session in self.handshaking.iter_mut() {
            session.process_io();
        }
        for session in self.sessions.values_mut() {
            session.process_io();
        }
    }
}

impl<C: Channel> Default for Sequencer<C> {
    fn default() -> Self {
        Sequencer::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Selector;
    use crate::proto::{self, PublishBody, SubscriptionChange};
    use crate::transport::{Channel, LoopbackChannel};
    use bytes::Bytes;

    fn seq(v: f64) -> SeqNum {
        SeqNum::new(v).unwrap()
    }

    /// Raw protocol endpoint speaking frames straight onto a loopback
    /// channel, bypassing the client library.
    struct RawClient {
        channel: LoopbackChannel,
    }

    impl RawClient {
        fn join(sequencer: &mut Sequencer<LoopbackChannel>) -> RawClient {
            let (ours, theirs) = LoopbackChannel::pair();
            sequencer.attach(theirs);
            RawClient { channel: ours }
        }

        fn send(&mut self, msg: &WireMessage) {
            self.channel.queue_frame(proto::encode(msg).unwrap());
            self.channel.process_io();
        }

        fn recv(&mut self) -> Vec<WireMessage> {
            self.channel.process_io();
            self.channel
                .drain_frames()
                .iter()
                .map(|raw| proto::decode(raw).unwrap())
                .collect()
        }

        fn closed(&mut self) -> bool {
            !self.channel.process_io()
        }
    }

    fn settle(sequencer: &mut Sequencer<LoopbackChannel>) {
        for _ in 0..8 {
            sequencer.handle_io();
        }
    }

    fn handshake(sequencer: &mut Sequencer<LoopbackChannel>) -> RawClient {
        let mut client = RawClient::join(sequencer);
        client.send(&WireMessage::Hello);
        settle(sequencer);
        let acks = client.recv();
        assert!(matches!(acks[0], WireMessage::HelloAck(_)));
        client
    }

    #[test]
    fn handshake_assigns_sequential_ids() {
        let mut sequencer = Sequencer::new();
        let mut first = RawClient::join(&mut sequencer);
        first.send(&WireMessage::Hello);
        settle(&mut sequencer);
        let mut second = RawClient::join(&mut sequencer);
        second.send(&WireMessage::Hello);
        settle(&mut sequencer);

        let ack = &first.recv()[0];
        assert_eq!(
            *ack,
            WireMessage::HelloAck(HelloAck {
                client_id: ClientId::new(1),
                initial_seq: SeqNum::FIRST,
            })
        );
        let ack = &second.recv()[0];
        assert_eq!(
            *ack,
            WireMessage::HelloAck(HelloAck {
                client_id: ClientId::new(2),
                initial_seq: SeqNum::FIRST,
            })
        );
    }

    #[test]
    fn frame_before_hello_drops_connection() {
        let mut sequencer = Sequencer::new();
        let mut client = RawClient::join(&mut sequencer);
        client.send(&WireMessage::ClearToAdvance { seq: seq(1.0) });
        settle(&mut sequencer);
        assert!(client.closed());
        assert_eq!(sequencer.session_count(), 0);
    }

    #[test]
    fn publish_delivers_then_grants() {
        let mut sequencer = Sequencer::new();
        let mut alice = handshake(&mut sequencer);
        let mut bob = handshake(&mut sequencer);

        bob.send(&WireMessage::Subscribe(SubscriptionChange {
            req_eff: SeqNum::FIRST,
            selector: Selector::Channel("x".to_string()),
        }));
        settle(&mut sequencer);
        assert_eq!(bob.recv(), vec![WireMessage::SubscribeAck { eff: SeqNum::FIRST }]);

        alice.send(&WireMessage::Publish(PublishBody {
            publish_seq: seq(1.0),
            receive_seq: seq(2.0),
            channel: "x".to_string(),
            payload: Bytes::from_static(&[0xDE, 0xAD]),
        }));
        alice.send(&WireMessage::ClearToAdvance { seq: seq(3.0) });
        bob.send(&WireMessage::RequestAdvance { seq: seq(3.0) });
        settle(&mut sequencer);

        let frames = bob.recv();
        assert_eq!(frames.len(), 2);
        match &frames[0] {
            WireMessage::Deliver(msg) => {
                assert_eq!(msg.publisher, ClientId::new(1));
                assert_eq!(msg.publish_seq, seq(1.0));
                assert_eq!(msg.receive_seq, seq(2.0));
                assert_eq!(&msg.payload[..], &[0xDE, 0xAD]);
            }
            other => panic!("expected delivery, got {}", other.kind()),
        }
        assert_eq!(frames[1], WireMessage::AdvanceGrant { seq: seq(3.0) });
    }

    #[test]
    fn grant_waits_for_every_frontier() {
        let mut sequencer = Sequencer::new();
        let mut alice = handshake(&mut sequencer);
        let mut bob = handshake(&mut sequencer);

        alice.send(&WireMessage::RequestAdvance { seq: seq(5.0) });
        settle(&mut sequencer);
        assert!(alice.recv().is_empty(), "grant must wait for bob");

        bob.send(&WireMessage::ClearToAdvance { seq: seq(2.0) });
        settle(&mut sequencer);
        // Partial release up to bob's frontier.
        assert_eq!(alice.recv(), vec![WireMessage::AdvanceGrant { seq: seq(2.0) }]);

        bob.send(&WireMessage::ClearToAdvance { seq: seq(9.0) });
        settle(&mut sequencer);
        assert_eq!(alice.recv(), vec![WireMessage::AdvanceGrant { seq: seq(5.0) }]);
    }

    #[test]
    fn causality_violation_closes_session() {
        let mut sequencer = Sequencer::new();
        let mut alice = handshake(&mut sequencer);
        alice.send(&WireMessage::Publish(PublishBody {
            publish_seq: seq(2.0),
            receive_seq: seq(2.0),
            channel: "x".to_string(),
            payload: Bytes::new(),
        }));
        settle(&mut sequencer);
        assert!(alice.closed());
        assert_eq!(sequencer.session_count(), 0);
    }

    #[test]
    fn departed_session_releases_pending_grants() {
        let mut sequencer = Sequencer::new();
        let mut alice = handshake(&mut sequencer);
        let mut bob = handshake(&mut sequencer);
        let mut carol = handshake(&mut sequencer);

        alice.send(&WireMessage::RequestAdvance { seq: seq(5.0) });
        bob.send(&WireMessage::ClearToAdvance { seq: seq(9.0) });
        settle(&mut sequencer);
        assert!(alice.recv().is_empty(), "carol still pins the frontier");

        // Carol violates the protocol and is torn down; the frontier rises
        // and alice's request becomes grantable.
        carol.send(&WireMessage::ClearToAdvance { seq: seq(-1.0) });
        settle(&mut sequencer);
        assert!(carol.closed());
        assert_eq!(alice.recv(), vec![WireMessage::AdvanceGrant { seq: seq(5.0) }]);
    }

    #[test]
    fn unsubscribe_applies_from_its_effective_point() {
        let mut sequencer = Sequencer::new();
        let mut alice = handshake(&mut sequencer);
        let mut bob = handshake(&mut sequencer);

        bob.send(&WireMessage::Subscribe(SubscriptionChange {
            req_eff: SeqNum::FIRST,
            selector: Selector::Channel("x".to_string()),
        }));
        bob.send(&WireMessage::Unsubscribe(SubscriptionChange {
            req_eff: seq(3.0),
            selector: Selector::Channel("x".to_string()),
        }));
        settle(&mut sequencer);
        assert_eq!(
            bob.recv(),
            vec![
                WireMessage::SubscribeAck { eff: SeqNum::FIRST },
                WireMessage::UnsubscribeAck { eff: seq(3.0) },
            ]
        );

        // Inside the active range: still delivered. At the close point: not.
        alice.send(&WireMessage::Publish(PublishBody {
            publish_seq: seq(1.0),
            receive_seq: seq(2.0),
            channel: "x".to_string(),
            payload: Bytes::from_static(b"in range"),
        }));
        alice.send(&WireMessage::Publish(PublishBody {
            publish_seq: seq(3.0),
            receive_seq: seq(4.0),
            channel: "x".to_string(),
            payload: Bytes::from_static(b"past close"),
        }));
        alice.send(&WireMessage::ClearToAdvance { seq: seq(5.0) });
        bob.send(&WireMessage::RequestAdvance { seq: seq(5.0) });
        settle(&mut sequencer);

        let frames = bob.recv();
        assert_eq!(frames.len(), 2);
        match &frames[0] {
            WireMessage::Deliver(msg) => assert_eq!(&msg.payload[..], b"in range"),
            other => panic!("expected delivery, got {}", other.kind()),
        }
        assert_eq!(frames[1], WireMessage::AdvanceGrant { seq: seq(5.0) });
    }

    #[test]
    fn subscription_eff_clamped_to_release_frontier() {
        let mut sequencer = Sequencer::new();
        let mut alice = handshake(&mut sequencer);
        let mut bob = handshake(&mut sequencer);

        alice.send(&WireMessage::Publish(PublishBody {
            publish_seq: seq(4.0),
            receive_seq: seq(5.0),
            channel: "x".to_string(),
            payload: Bytes::new(),
        }));
        settle(&mut sequencer);

        // Bob's requested effective point predates the already-resolved
        // publication; the ack reports the clamped point.
        bob.send(&WireMessage::Subscribe(SubscriptionChange {
            req_eff: seq(1.0),
            selector: Selector::Channel("x".to_string()),
        }));
        settle(&mut sequencer);
        assert_eq!(bob.recv(), vec![WireMessage::SubscribeAck { eff: seq(4.0) }]);
    }
}
