//! Wire message schemas and codec.
//!
//! Frames are length-prefixed by the transport; this module encodes and
//! decodes the frame payload: a one-byte tag followed by a tag-specific
//! big-endian body. Sequence numbers travel as IEEE-754 big-endian doubles;
//! NaN is rejected on decode so sequence ordering stays numeric everywhere
//! past this boundary.

use bytes::Bytes;
use thiserror::Error;

use crate::core::{ClientId, Message, Selector, SeqNum};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("empty frame")]
    Empty,
    #[error("unknown message tag {0}")]
    UnknownTag(u8),
    #[error("truncated {0} body")]
    Truncated(&'static str),
    #[error("{0} bytes trailing after {1} body")]
    Trailing(usize, &'static str),
    #[error("channel name is not valid utf-8")]
    InvalidUtf8,
    #[error("{0} is NaN")]
    NanSeq(&'static str),
    #[error("unknown selector kind {0}")]
    BadSelectorKind(u8),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodeError {
    #[error("channel name of {0} bytes exceeds the u16 wire field")]
    ChannelTooLong(usize),
    #[error("payload of {0} bytes exceeds the u32 wire field")]
    PayloadTooLarge(usize),
}

/// Server reply completing the handshake.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HelloAck {
    pub client_id: ClientId,
    pub initial_seq: SeqNum,
}

/// Body shared by `Subscribe` and `Unsubscribe`.
#[derive(Clone, Debug, PartialEq)]
pub struct SubscriptionChange {
    pub req_eff: SeqNum,
    pub selector: Selector,
}

/// A client-side publication before the server stamps the publisher id.
#[derive(Clone, Debug, PartialEq)]
pub struct PublishBody {
    pub publish_seq: SeqNum,
    pub receive_seq: SeqNum,
    pub channel: String,
    pub payload: Bytes,
}

/// The full wire message set.
#[derive(Clone, Debug, PartialEq)]
pub enum WireMessage {
    Hello,
    HelloAck(HelloAck),
    Subscribe(SubscriptionChange),
    SubscribeAck { eff: SeqNum },
    Unsubscribe(SubscriptionChange),
    UnsubscribeAck { eff: SeqNum },
    Publish(PublishBody),
    ClearToAdvance { seq: SeqNum },
    RequestAdvance { seq: SeqNum },
    AdvanceGrant { seq: SeqNum },
    Deliver(Message),
    DeliveryAck { seq: SeqNum },
}

impl WireMessage {
    pub fn kind(&self) -> &'static str {
        self.tag().as_str()
    }

    fn tag(&self) -> MessageTag {
        match self {
            WireMessage::Hello => MessageTag::Hello,
            WireMessage::HelloAck(_) => MessageTag::HelloAck,
            WireMessage::Subscribe(_) => MessageTag::Subscribe,
            WireMessage::SubscribeAck { .. } => MessageTag::SubscribeAck,
            WireMessage::Unsubscribe(_) => MessageTag::Unsubscribe,
            WireMessage::UnsubscribeAck { .. } => MessageTag::UnsubscribeAck,
            WireMessage::Publish(_) => MessageTag::Publish,
            WireMessage::ClearToAdvance { .. } => MessageTag::ClearToAdvance,
            WireMessage::RequestAdvance { .. } => MessageTag::RequestAdvance,
            WireMessage::AdvanceGrant { .. } => MessageTag::AdvanceGrant,
            WireMessage::Deliver(_) => MessageTag::Deliver,
            WireMessage::DeliveryAck { .. } => MessageTag::DeliveryAck,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MessageTag {
    Hello = 1,
    HelloAck = 2,
    Subscribe = 3,
    SubscribeAck = 4,
    Unsubscribe = 5,
    UnsubscribeAck = 6,
    Publish = 7,
    ClearToAdvance = 8,
    RequestAdvance = 9,
    AdvanceGrant = 10,
    Deliver = 11,
    DeliveryAck = 12,
}

impl MessageTag {
    fn from_u8(raw: u8) -> Option<MessageTag> {
        match raw {
            1 => Some(MessageTag::Hello),
            2 => Some(MessageTag::HelloAck),
            3 => Some(MessageTag::Subscribe),
            4 => Some(MessageTag::SubscribeAck),
            5 => Some(MessageTag::Unsubscribe),
            6 => Some(MessageTag::UnsubscribeAck),
            7 => Some(MessageTag::Publish),
            8 => Some(MessageTag::ClearToAdvance),
            9 => Some(MessageTag::RequestAdvance),
            10 => Some(MessageTag::AdvanceGrant),
            11 => Some(MessageTag::Deliver),
            12 => Some(MessageTag::DeliveryAck),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            MessageTag::Hello => "HELLO",
            MessageTag::HelloAck => "HELLO_ACK",
            MessageTag::Subscribe => "SUBSCRIBE",
            MessageTag::SubscribeAck => "SUBSCRIBE_ACK",
            MessageTag::Unsubscribe => "UNSUBSCRIBE",
            MessageTag::UnsubscribeAck => "UNSUBSCRIBE_ACK",
            MessageTag::Publish => "PUBLISH",
            MessageTag::ClearToAdvance => "CLEAR_TO_ADVANCE",
            MessageTag::RequestAdvance => "REQUEST_ADVANCE",
            MessageTag::AdvanceGrant => "ADVANCE_GRANT",
            MessageTag::Deliver => "DELIVER",
            MessageTag::DeliveryAck => "DELIVERY_ACK",
        }
    }
}

pub fn encode(msg: &WireMessage) -> Result<Vec<u8>, EncodeError> {
    let mut buf = Vec::with_capacity(16);
    buf.push(msg.tag() as u8);
    match msg {
        WireMessage::Hello => {}
        WireMessage::HelloAck(ack) => {
            put_u32(&mut buf, ack.client_id.get());
            put_seq(&mut buf, ack.initial_seq);
        }
        WireMessage::Subscribe(change) | WireMessage::Unsubscribe(change) => {
            put_seq(&mut buf, change.req_eff);
            match &change.selector {
                Selector::All => buf.push(0),
                Selector::Channel(name) => {
                    buf.push(1);
                    put_channel(&mut buf, name)?;
                }
            }
        }
        WireMessage::SubscribeAck { eff } | WireMessage::UnsubscribeAck { eff } => {
            put_seq(&mut buf, *eff);
        }
        WireMessage::Publish(body) => {
            put_seq(&mut buf, body.publish_seq);
            put_seq(&mut buf, body.receive_seq);
            put_channel(&mut buf, &body.channel)?;
            put_payload(&mut buf, &body.payload)?;
        }
        WireMessage::ClearToAdvance { seq }
        | WireMessage::RequestAdvance { seq }
        | WireMessage::AdvanceGrant { seq }
        | WireMessage::DeliveryAck { seq } => {
            put_seq(&mut buf, *seq);
        }
        WireMessage::Deliver(msg) => {
            put_u32(&mut buf, msg.publisher.get());
            put_seq(&mut buf, msg.publish_seq);
            put_seq(&mut buf, msg.receive_seq);
            put_channel(&mut buf, &msg.channel)?;
            put_payload(&mut buf, &msg.payload)?;
        }
    }
    Ok(buf)
}

pub fn decode(payload: &[u8]) -> Result<WireMessage, DecodeError> {
    let (&raw_tag, body) = payload.split_first().ok_or(DecodeError::Empty)?;
    let tag = MessageTag::from_u8(raw_tag).ok_or(DecodeError::UnknownTag(raw_tag))?;
    let what = tag.as_str();
    let mut r = Reader::new(body, what);

    let msg = match tag {
        MessageTag::Hello => WireMessage::Hello,
        MessageTag::HelloAck => WireMessage::HelloAck(HelloAck {
            client_id: ClientId::new(r.take_u32()?),
            initial_seq: r.take_seq("initial_seq")?,
        }),
        MessageTag::Subscribe => WireMessage::Subscribe(r.take_subscription_change()?),
        MessageTag::SubscribeAck => WireMessage::SubscribeAck {
            eff: r.take_seq("eff")?,
        },
        MessageTag::Unsubscribe => WireMessage::Unsubscribe(r.take_subscription_change()?),
        MessageTag::UnsubscribeAck => WireMessage::UnsubscribeAck {
            eff: r.take_seq("eff")?,
        },
        MessageTag::Publish => {
            let publish_seq = r.take_seq("publish_seq")?;
            let receive_seq = r.take_seq("receive_seq")?;
            let channel = r.take_channel()?;
            let payload = r.take_payload()?;
            WireMessage::Publish(PublishBody {
                publish_seq,
                receive_seq,
                channel,
                payload,
            })
        }
        MessageTag::ClearToAdvance => WireMessage::ClearToAdvance {
            seq: r.take_seq("seq")?,
        },
        MessageTag::RequestAdvance => WireMessage::RequestAdvance {
            seq: r.take_seq("seq")?,
        },
        MessageTag::AdvanceGrant => WireMessage::AdvanceGrant {
            seq: r.take_seq("seq")?,
        },
        MessageTag::Deliver => {
            let publisher = ClientId::new(r.take_u32()?);
            let publish_seq = r.take_seq("publish_seq")?;
            let receive_seq = r.take_seq("receive_seq")?;
            let channel = r.take_channel()?;
            let payload = r.take_payload()?;
            WireMessage::Deliver(Message {
                publisher,
                publish_seq,
                receive_seq,
                channel,
                payload,
            })
        }
        MessageTag::DeliveryAck => WireMessage::DeliveryAck {
            seq: r.take_seq("seq")?,
        },
    };
    r.finish()?;
    Ok(msg)
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_be_bytes());
}

fn put_seq(buf: &mut Vec<u8>, seq: SeqNum) {
    buf.extend_from_slice(&seq.get().to_be_bytes());
}

fn put_channel(buf: &mut Vec<u8>, name: &str) -> Result<(), EncodeError> {
    let len = u16::try_from(name.len()).map_err(|_| EncodeError::ChannelTooLong(name.len()))?;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(name.as_bytes());
    Ok(())
}

fn put_payload(buf: &mut Vec<u8>, payload: &[u8]) -> Result<(), EncodeError> {
    let len =
        u32::try_from(payload.len()).map_err(|_| EncodeError::PayloadTooLarge(payload.len()))?;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(())
}

struct Reader<'a> {
    body: &'a [u8],
    what: &'static str,
}

impl<'a> Reader<'a> {
    fn new(body: &'a [u8], what: &'static str) -> Reader<'a> {
        Reader { body, what }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.body.len() < len {
            return Err(DecodeError::Truncated(self.what));
        }
        let (head, rest) = self.body.split_at(len);
        self.body = rest;
        Ok(head)
    }

    fn take_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn take_u16(&mut self) -> Result<u16, DecodeError> {
        let raw = self.take(2)?;
        Ok(u16::from_be_bytes([raw[0], raw[1]]))
    }

    fn take_u32(&mut self) -> Result<u32, DecodeError> {
        let raw = self.take(4)?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn take_seq(&mut self, field: &'static str) -> Result<SeqNum, DecodeError> {
        let raw = self.take(8)?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(raw);
        SeqNum::new(f64::from_be_bytes(bytes)).ok_or(DecodeError::NanSeq(field))
    }

    fn take_channel(&mut self) -> Result<String, DecodeError> {
        let len = self.take_u16()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::InvalidUtf8)
    }

    fn take_payload(&mut self) -> Result<Bytes, DecodeError> {
        let len = self.take_u32()? as usize;
        Ok(Bytes::copy_from_slice(self.take(len)?))
    }

    fn take_subscription_change(&mut self) -> Result<SubscriptionChange, DecodeError> {
        let req_eff = self.take_seq("eff")?;
        let selector = match self.take_u8()? {
            0 => Selector::All,
            1 => Selector::Channel(self.take_channel()?),
            kind => return Err(DecodeError::BadSelectorKind(kind)),
        };
        Ok(SubscriptionChange { req_eff, selector })
    }

    fn finish(self) -> Result<(), DecodeError> {
        if self.body.is_empty() {
            Ok(())
        } else {
            Err(DecodeError::Trailing(self.body.len(), self.what))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq(v: f64) -> SeqNum {
        SeqNum::new(v).unwrap()
    }

    #[test]
    fn round_trips_the_message_set() {
        let messages = vec![
            WireMessage::Hello,
            WireMessage::HelloAck(HelloAck {
                client_id: ClientId::new(7),
                initial_seq: SeqNum::FIRST,
            }),
            WireMessage::Subscribe(SubscriptionChange {
                req_eff: seq(1.5),
                selector: Selector::All,
            }),
            WireMessage::Subscribe(SubscriptionChange {
                req_eff: seq(2.0),
                selector: Selector::Channel("lidar/points".to_string()),
            }),
            WireMessage::SubscribeAck { eff: seq(2.0) },
            WireMessage::Unsubscribe(SubscriptionChange {
                req_eff: seq(3.0),
                selector: Selector::Channel("x".to_string()),
            }),
            WireMessage::UnsubscribeAck { eff: seq(3.0) },
            WireMessage::Publish(PublishBody {
                publish_seq: seq(1.0),
                receive_seq: seq(2.0),
                channel: "x".to_string(),
                payload: Bytes::from_static(&[0xDE, 0xAD]),
            }),
            WireMessage::ClearToAdvance { seq: seq(4.0) },
            WireMessage::RequestAdvance { seq: seq(5.0) },
            WireMessage::AdvanceGrant { seq: seq(5.0) },
            WireMessage::Deliver(Message {
                publisher: ClientId::new(3),
                publish_seq: seq(1.0),
                receive_seq: seq(2.0),
                channel: "x".to_string(),
                payload: Bytes::from_static(b"payload"),
            }),
            WireMessage::DeliveryAck { seq: seq(5.0) },
        ];
        for msg in messages {
            let bytes = encode(&msg).unwrap();
            assert_eq!(decode(&bytes).unwrap(), msg, "mismatch for {}", msg.kind());
        }
    }

    #[test]
    fn wire_layout_is_fixed() {
        // HelloAck{id=1, initial_seq=0.0}: tag 2, u32 id, f64 seq.
        let bytes = encode(&WireMessage::HelloAck(HelloAck {
            client_id: ClientId::new(1),
            initial_seq: SeqNum::FIRST,
        }))
        .unwrap();
        assert_eq!(bytes[0], 2);
        assert_eq!(&bytes[1..5], &[0, 0, 0, 1]);
        assert_eq!(&bytes[5..13], &0.0f64.to_be_bytes());
        assert_eq!(bytes.len(), 13);
    }

    #[test]
    fn rejects_unknown_tag() {
        assert_eq!(decode(&[200]), Err(DecodeError::UnknownTag(200)));
    }

    #[test]
    fn rejects_empty_frame() {
        assert_eq!(decode(&[]), Err(DecodeError::Empty));
    }

    #[test]
    fn rejects_truncated_body() {
        let mut bytes = encode(&WireMessage::ClearToAdvance { seq: seq(4.0) }).unwrap();
        bytes.truncate(5);
        assert!(matches!(decode(&bytes), Err(DecodeError::Truncated(_))));
    }

    #[test]
    fn rejects_trailing_bytes() {
        let mut bytes = encode(&WireMessage::Hello).unwrap();
        bytes.push(0);
        assert!(matches!(decode(&bytes), Err(DecodeError::Trailing(1, _))));
    }

    #[test]
    fn rejects_nan_sequence() {
        let mut bytes = vec![8u8];
        bytes.extend_from_slice(&f64::NAN.to_be_bytes());
        assert_eq!(decode(&bytes), Err(DecodeError::NanSeq("seq")));
    }

    #[test]
    fn rejects_bad_selector_kind() {
        let mut bytes = vec![3u8];
        bytes.extend_from_slice(&0.0f64.to_be_bytes());
        bytes.push(9);
        assert_eq!(decode(&bytes), Err(DecodeError::BadSelectorKind(9)));
    }

    #[test]
    fn rejects_oversized_channel_on_encode() {
        let name = "c".repeat(usize::from(u16::MAX) + 1);
        let err = encode(&WireMessage::Subscribe(SubscriptionChange {
            req_eff: SeqNum::FIRST,
            selector: Selector::Channel(name),
        }))
        .unwrap_err();
        assert!(matches!(err, EncodeError::ChannelTooLong(_)));
    }
}
