//! Message bodies, delivery references and wire shapes
//!
//! A published message exists in one of two forms while queued. An in-RAM
//! message keeps its full body in the process that accepted it; a
//! guaranteed-delivery message lives in durable storage and is represented in
//! delivery queues by a lightweight reference carrying only the ordering
//! fields. [`MessageRef`] is the tagged union over the two, resolved to a
//! full body on the delivery path.

use std::cmp::Ordering as CmpOrdering;
use std::sync::Arc;

use bytes::Bytes;
use bytestring::ByteString;
use serde::{Deserialize, Serialize};

use rbus_utils::{format_timestamp_millis_iso, timestamp_millis};

use crate::types::{EndpointId, MsgId, NodeName, SubKey, TimestampMillis, TopicId, TopicName};

pub const MSG_ID_PREFIX: &str = "psm";
pub const SUB_KEY_PREFIX: &str = "psk";

pub const PRIORITY_MAX: u8 = 9;

/// Generate a new message id. Ids embed the millisecond publish timestamp so
/// they sort in publication order within a process.
#[inline]
pub fn new_msg_id() -> MsgId {
    ByteString::from(format!("{}{:014}{:08x}", MSG_ID_PREFIX, timestamp_millis(), rand::random::<u32>()))
}

/// Generate a new subscription key for an endpoint kind, e.g.
/// `psk.rest.7f9a...`.
#[inline]
pub fn new_sub_key(kind: &str) -> SubKey {
    ByteString::from(format!("{}.{}.{}", SUB_KEY_PREFIX, kind, uuid::Uuid::new_v4().simple()))
}

/// A full message body as accepted from a publisher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub msg_id: MsgId,
    pub topic_id: TopicId,
    pub topic_name: TopicName,
    pub data: Bytes,
    pub size: usize,
    pub priority: u8,
    /// Publication time as stamped by the original, external publisher when
    /// one is given, otherwise equal to `recv_time`.
    pub pub_time: TimestampMillis,
    /// Time this process accepted the message.
    pub recv_time: TimestampMillis,
    /// Lifetime in milliseconds.
    pub expiration: TimestampMillis,
    /// Absolute expiry instant, `recv_time + expiration`.
    pub expiration_time: TimestampMillis,
    pub correl_id: Option<ByteString>,
    pub in_reply_to: Option<ByteString>,
    pub ext_client_id: Option<ByteString>,
    /// When non-empty, only these subscription keys receive the message.
    pub deliver_to_sk: Vec<SubKey>,
    pub published_by: EndpointId,
    pub has_gd: bool,
    pub server_name: NodeName,
    pub server_pid: u32,
}

impl Message {
    #[inline]
    pub fn is_expired(&self, now: TimestampMillis) -> bool {
        self.expiration_time <= now
    }

    /// Whether this message may go to the given subscriber queue. An empty
    /// `deliver_to_sk` list means every matching subscriber receives it.
    #[inline]
    pub fn may_deliver_to(&self, sub_key: &SubKey) -> bool {
        self.deliver_to_sk.is_empty() || self.deliver_to_sk.contains(sub_key)
    }

    #[inline]
    pub fn order_key(&self) -> OrderKey {
        OrderKey { priority: self.priority, pub_time: self.pub_time, msg_id: self.msg_id.clone() }
    }
}

/// Delivery ordering key: higher priority first, then older publication
/// time, then message id as the final tie-break.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderKey {
    pub priority: u8,
    pub pub_time: TimestampMillis,
    pub msg_id: MsgId,
}

impl Ord for OrderKey {
    #[inline]
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| self.pub_time.cmp(&other.pub_time))
            .then_with(|| self.msg_id.cmp(&other.msg_id))
    }
}

impl PartialOrd for OrderKey {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// Reference to a guaranteed-delivery row in durable storage. Carries only
/// what delivery ordering needs; the body is fetched in a batch when the
/// message is actually handed to a transport.
#[derive(Debug, Clone)]
pub struct GdRef {
    pub sub_key: SubKey,
    pub msg_id: MsgId,
    pub priority: u8,
    pub pub_time: TimestampMillis,
    pub expiration_time: TimestampMillis,
}

impl GdRef {
    #[inline]
    pub fn order_key(&self) -> OrderKey {
        OrderKey { priority: self.priority, pub_time: self.pub_time, msg_id: self.msg_id.clone() }
    }
}

/// A message as seen by a subscriber queue.
#[derive(Debug, Clone)]
pub enum MessageRef {
    Gd(GdRef),
    NonGd(Arc<Message>),
}

impl MessageRef {
    #[inline]
    pub fn msg_id(&self) -> &MsgId {
        match self {
            MessageRef::Gd(r) => &r.msg_id,
            MessageRef::NonGd(m) => &m.msg_id,
        }
    }

    #[inline]
    pub fn is_gd(&self) -> bool {
        matches!(self, MessageRef::Gd(_))
    }

    #[inline]
    pub fn order_key(&self) -> OrderKey {
        match self {
            MessageRef::Gd(r) => r.order_key(),
            MessageRef::NonGd(m) => m.order_key(),
        }
    }

    #[inline]
    pub fn is_expired(&self, now: TimestampMillis) -> bool {
        match self {
            MessageRef::Gd(r) => r.expiration_time <= now,
            MessageRef::NonGd(m) => m.is_expired(now),
        }
    }
}

/// One guaranteed-delivery queue row, `(sub_key, message)` plus delivery
/// bookkeeping flags maintained by the storage backend.
#[derive(Debug, Clone)]
pub struct GdRow {
    pub sub_key: SubKey,
    pub msg: Message,
    pub is_delivered: bool,
    pub is_to_delete: bool,
    pub delivery_count: usize,
}

impl GdRow {
    #[inline]
    pub fn new(sub_key: SubKey, msg: Message) -> Self {
        Self { sub_key, msg, is_delivered: false, is_to_delete: false, delivery_count: 0 }
    }

    #[inline]
    pub fn gd_ref(&self) -> GdRef {
        GdRef {
            sub_key: self.sub_key.clone(),
            msg_id: self.msg.msg_id.clone(),
            priority: self.msg.priority,
            pub_time: self.msg.pub_time,
            expiration_time: self.msg.expiration_time,
        }
    }
}

/// Outward message shape handed to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub msg_id: MsgId,
    pub data: Bytes,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correl_id: Option<ByteString>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<ByteString>,
    pub meta: WireMeta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMeta {
    pub topic_name: TopicName,
    pub size: usize,
    pub priority: u8,
    /// Remaining lifetime granted at publication, in seconds.
    pub expiration: i64,
    pub pub_time_iso: String,
    pub recv_time_iso: String,
    pub expiration_time_iso: String,
}

impl From<&Message> for WireMessage {
    fn from(m: &Message) -> Self {
        WireMessage {
            msg_id: m.msg_id.clone(),
            data: m.data.clone(),
            correl_id: m.correl_id.clone(),
            in_reply_to: m.in_reply_to.clone(),
            meta: WireMeta {
                topic_name: m.topic_name.clone(),
                size: m.size,
                priority: m.priority,
                expiration: m.expiration / 1000,
                pub_time_iso: format_timestamp_millis_iso(m.pub_time),
                recv_time_iso: format_timestamp_millis_iso(m.recv_time),
                expiration_time_iso: format_timestamp_millis_iso(m.expiration_time),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(msg_id: &str, priority: u8, pub_time: TimestampMillis) -> Message {
        Message {
            msg_id: ByteString::from(msg_id.to_owned()),
            topic_id: 1,
            topic_name: "orders.processed".into(),
            data: Bytes::from_static(b"x"),
            size: 1,
            priority,
            pub_time,
            recv_time: pub_time,
            expiration: 60_000,
            expiration_time: pub_time + 60_000,
            correl_id: None,
            in_reply_to: None,
            ext_client_id: None,
            deliver_to_sk: Vec::new(),
            published_by: 1,
            has_gd: false,
            server_name: "node-1".into(),
            server_pid: 1,
        }
    }

    #[test]
    fn order_key_priority_desc_then_time_asc() {
        let mut keys =
            vec![msg("a", 3, 300).order_key(), msg("b", 9, 200).order_key(), msg("c", 7, 100).order_key()];
        keys.sort();
        let ids = keys.iter().map(|k| &*k.msg_id).collect::<Vec<_>>();
        assert_eq!(ids, vec!["b", "c", "a"]);
    }

    #[test]
    fn order_key_tie_break_by_pub_time() {
        let mut keys = vec![msg("later", 5, 200).order_key(), msg("earlier", 5, 100).order_key()];
        keys.sort();
        assert_eq!(&*keys[0].msg_id, "earlier");
    }

    #[test]
    fn msg_id_is_time_sortable() {
        let a = new_msg_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = new_msg_id();
        assert!(a < b);
        assert!(a.starts_with(MSG_ID_PREFIX));
    }

    #[test]
    fn deliver_to_sk_filter() {
        let mut m = msg("a", 5, 1);
        let sk1 = SubKey::from("psk.rest.1");
        let sk2 = SubKey::from("psk.rest.2");
        assert!(m.may_deliver_to(&sk1));
        m.deliver_to_sk = vec![sk1.clone()];
        assert!(m.may_deliver_to(&sk1));
        assert!(!m.may_deliver_to(&sk2));
    }

    #[test]
    fn expiry() {
        let m = msg("a", 5, 1000);
        assert!(!m.is_expired(1000));
        assert!(m.is_expired(61_000));
    }
}
