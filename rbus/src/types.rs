//! Common data types shared across the broker

use serde::{Deserialize, Serialize};

pub use rbus_utils::TimestampMillis;

/// Numeric topic identifier
pub type TopicId = u64;

/// Numeric endpoint identifier
pub type EndpointId = u64;

/// Numeric subscription identifier
pub type SubscriptionId = u64;

/// Security definition identifier, assigned by the embedding application
pub type SecurityId = u64;

/// Persistent-connection channel identifier
pub type ChannelId = u64;

/// Topic name, e.g. `orders.processed`
pub type TopicName = bytestring::ByteString;

/// Subscription key, the externally visible handle to one subscriber queue
pub type SubKey = bytestring::ByteString;

/// Message identifier, time-sortable
pub type MsgId = bytestring::ByteString;

pub type NodeName = bytestring::ByteString;

pub type HashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;
pub type HashSet<V> = std::collections::HashSet<V, ahash::RandomState>;
pub type DashMap<K, V> = dashmap::DashMap<K, V, ahash::RandomState>;
pub type DashSet<V> = dashmap::DashSet<V, ahash::RandomState>;

/// What kind of party an endpoint represents. Channel endpoints hold a
/// persistent connection and may carry many subscriptions; the others are
/// limited to one subscription per topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointType {
    Rest,
    Service,
    Channel,
    Internal,
}

impl EndpointType {
    #[inline]
    pub fn is_channel(&self) -> bool {
        matches!(self, EndpointType::Channel)
    }

    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointType::Rest => "rest",
            EndpointType::Service => "service",
            EndpointType::Channel => "channel",
            EndpointType::Internal => "internal",
        }
    }
}

/// Operation checked against an endpoint's permission patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Publish,
    Subscribe,
}
