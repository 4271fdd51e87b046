//! Topic, endpoint and subscription catalog
//!
//! The registry is the single authority on what exists: topics, the
//! endpoints allowed to touch them, and the subscriptions binding the two.
//! All of it sits behind one coarse lock; the registry is an admin-path
//! structure, message flow only reads from it.
//!
//! The permission [`PatternMatcher`] is owned here so an endpoint's
//! patterns are registered, replaced and removed in step with its catalog
//! entry.

use std::sync::atomic::{AtomicU64, Ordering};

use bytestring::ByteString;
use parking_lot::Mutex;

use crate::error::{BrokerError, Result};
use crate::matcher::{Evaluation, PatternMatcher};
use crate::types::{
    ChannelId, EndpointId, EndpointType, HashMap, NodeName, Operation, SecurityId, SubKey, SubscriptionId,
    TimestampMillis, TopicId, TopicName,
};

#[derive(Debug, Clone)]
pub struct Topic {
    pub id: TopicId,
    pub name: TopicName,
    pub is_active: bool,
    pub is_internal: bool,
    pub has_gd: bool,
    pub max_depth_gd: usize,
    pub max_depth_non_gd: usize,
}

/// Topic parameters as given at creation or edit time.
#[derive(Debug, Clone)]
pub struct TopicConfig {
    pub is_active: bool,
    pub is_internal: bool,
    pub has_gd: bool,
    pub max_depth_gd: usize,
    pub max_depth_non_gd: usize,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self { is_active: true, is_internal: false, has_gd: true, max_depth_gd: 10000, max_depth_non_gd: 1000 }
    }
}

#[derive(Debug, Clone)]
pub struct Endpoint {
    pub id: EndpointId,
    pub name: ByteString,
    pub endpoint_type: EndpointType,
    pub is_active: bool,
    pub is_internal: bool,
    /// Permission lines, `pub=GLOB` / `sub=GLOB`, one per line.
    pub topic_patterns: String,
    pub sec_id: Option<SecurityId>,
    pub channel_id: Option<ChannelId>,
}

#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub name: ByteString,
    pub endpoint_type: EndpointType,
    pub is_active: bool,
    pub is_internal: bool,
    pub topic_patterns: String,
    pub sec_id: Option<SecurityId>,
    pub channel_id: Option<ChannelId>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            name: "".into(),
            endpoint_type: EndpointType::Rest,
            is_active: true,
            is_internal: false,
            topic_patterns: String::new(),
            sec_id: None,
            channel_id: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub sub_key: SubKey,
    pub topic_id: TopicId,
    pub topic_name: TopicName,
    pub endpoint_id: EndpointId,
    pub creation_time: TimestampMillis,
    /// The permission pattern that granted the subscription.
    pub sub_pattern_matched: ByteString,
    pub has_gd: bool,
    pub is_active: bool,
    /// Which server process holds this subscriber's in-RAM state.
    pub server_name: NodeName,
    pub server_pid: u32,
}

#[derive(Default)]
struct RegistryInner {
    topics: HashMap<TopicId, Topic>,
    topic_name_to_id: HashMap<TopicName, TopicId>,
    endpoints: HashMap<EndpointId, Endpoint>,
    sec_id_to_endpoint_id: HashMap<SecurityId, EndpointId>,
    channel_id_to_endpoint_id: HashMap<ChannelId, EndpointId>,
    subs_by_topic: HashMap<TopicName, Vec<Subscription>>,
    subs_by_sub_key: HashMap<SubKey, Subscription>,
}

pub struct Registry {
    matcher: PatternMatcher,
    topic_id_seq: AtomicU64,
    endpoint_id_seq: AtomicU64,
    sub_id_seq: AtomicU64,
    inner: Mutex<RegistryInner>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            matcher: PatternMatcher::new(),
            topic_id_seq: AtomicU64::new(1),
            endpoint_id_seq: AtomicU64::new(1),
            sub_id_seq: AtomicU64::new(1),
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    #[inline]
    pub fn next_sub_id(&self) -> SubscriptionId {
        self.sub_id_seq.fetch_add(1, Ordering::SeqCst)
    }

    pub fn create_topic(&self, name: TopicName, cfg: TopicConfig) -> Result<Topic> {
        let mut inner = self.inner.lock();
        if inner.topic_name_to_id.contains_key(&name) {
            return Err(BrokerError::bad_request(format!("topic `{}` already exists", name)));
        }
        let topic = Topic {
            id: self.topic_id_seq.fetch_add(1, Ordering::SeqCst),
            name: name.clone(),
            is_active: cfg.is_active,
            is_internal: cfg.is_internal,
            has_gd: cfg.has_gd,
            max_depth_gd: cfg.max_depth_gd,
            max_depth_non_gd: cfg.max_depth_non_gd,
        };
        inner.topic_name_to_id.insert(name, topic.id);
        inner.topics.insert(topic.id, topic.clone());
        log::debug!("created topic `{}` ({})", topic.name, topic.id);
        Ok(topic)
    }

    /// Change a topic's parameters, optionally renaming it. A rename keeps
    /// every existing subscription attached under the new name.
    pub fn edit_topic(&self, id: TopicId, new_name: Option<TopicName>, cfg: TopicConfig) -> Result<Topic> {
        let mut inner = self.inner.lock();
        let old_name = match inner.topics.get(&id) {
            Some(t) => t.name.clone(),
            None => return Err(BrokerError::not_found(format!("topic id `{}`", id))),
        };
        let name = new_name.unwrap_or_else(|| old_name.clone());
        if name != old_name {
            if inner.topic_name_to_id.contains_key(&name) {
                return Err(BrokerError::bad_request(format!("topic `{}` already exists", name)));
            }
            inner.topic_name_to_id.remove(&old_name);
            inner.topic_name_to_id.insert(name.clone(), id);
            if let Some(mut subs) = inner.subs_by_topic.remove(&old_name) {
                for sub in subs.iter_mut() {
                    sub.topic_name = name.clone();
                }
                for sub in subs.iter() {
                    if let Some(s) = inner.subs_by_sub_key.get_mut(&sub.sub_key) {
                        s.topic_name = name.clone();
                    }
                }
                inner.subs_by_topic.insert(name.clone(), subs);
            }
            log::info!("renamed topic `{}` to `{}`", old_name, name);
        }
        let topic = Topic {
            id,
            name,
            is_active: cfg.is_active,
            is_internal: cfg.is_internal,
            has_gd: cfg.has_gd,
            max_depth_gd: cfg.max_depth_gd,
            max_depth_non_gd: cfg.max_depth_non_gd,
        };
        inner.topics.insert(id, topic.clone());
        Ok(topic)
    }

    /// Remove a topic and all its subscriptions. The removed subscriptions
    /// are returned so the caller can stop their delivery tasks and purge
    /// backlog references.
    pub fn delete_topic(&self, id: TopicId) -> Result<(Topic, Vec<Subscription>)> {
        let mut inner = self.inner.lock();
        let topic = match inner.topics.remove(&id) {
            Some(t) => t,
            None => return Err(BrokerError::not_found(format!("topic id `{}`", id))),
        };
        inner.topic_name_to_id.remove(&topic.name);
        let subs = inner.subs_by_topic.remove(&topic.name).unwrap_or_default();
        for sub in &subs {
            inner.subs_by_sub_key.remove(&sub.sub_key);
        }
        log::info!("deleted topic `{}` with {} subscription(s)", topic.name, subs.len());
        Ok((topic, subs))
    }

    #[inline]
    pub fn get_topic_by_id(&self, id: TopicId) -> Option<Topic> {
        self.inner.lock().topics.get(&id).cloned()
    }

    #[inline]
    pub fn get_topic_by_name(&self, name: &str) -> Option<Topic> {
        let inner = self.inner.lock();
        inner.topic_name_to_id.get(name).and_then(|id| inner.topics.get(id)).cloned()
    }

    pub fn create_endpoint(&self, cfg: EndpointConfig) -> Result<Endpoint> {
        let mut inner = self.inner.lock();
        if let Some(sec_id) = cfg.sec_id {
            if inner.sec_id_to_endpoint_id.contains_key(&sec_id) {
                return Err(BrokerError::bad_request(format!("sec_id `{}` already mapped", sec_id)));
            }
        }
        if let Some(channel_id) = cfg.channel_id {
            if inner.channel_id_to_endpoint_id.contains_key(&channel_id) {
                return Err(BrokerError::bad_request(format!("channel_id `{}` already mapped", channel_id)));
            }
        }
        let endpoint = Endpoint {
            id: self.endpoint_id_seq.fetch_add(1, Ordering::SeqCst),
            name: cfg.name,
            endpoint_type: cfg.endpoint_type,
            is_active: cfg.is_active,
            is_internal: cfg.is_internal,
            topic_patterns: cfg.topic_patterns,
            sec_id: cfg.sec_id,
            channel_id: cfg.channel_id,
        };
        if let Some(sec_id) = endpoint.sec_id {
            inner.sec_id_to_endpoint_id.insert(sec_id, endpoint.id);
        }
        if let Some(channel_id) = endpoint.channel_id {
            inner.channel_id_to_endpoint_id.insert(channel_id, endpoint.id);
        }
        self.matcher.add(endpoint.id, &endpoint.topic_patterns);
        inner.endpoints.insert(endpoint.id, endpoint.clone());
        log::debug!("created endpoint `{}` ({}, {})", endpoint.name, endpoint.id, endpoint.endpoint_type.as_str());
        Ok(endpoint)
    }

    /// Replace an endpoint's permission lines; future checks use the new
    /// patterns, existing subscriptions stay as they are.
    pub fn edit_endpoint_patterns(&self, id: EndpointId, topic_patterns: String) -> Result<Endpoint> {
        let mut inner = self.inner.lock();
        let endpoint = match inner.endpoints.get_mut(&id) {
            Some(e) => {
                e.topic_patterns = topic_patterns;
                e.clone()
            }
            None => return Err(BrokerError::not_found(format!("endpoint id `{}`", id))),
        };
        self.matcher.add(id, &endpoint.topic_patterns);
        Ok(endpoint)
    }

    /// Remove an endpoint, its identity mappings, its permission patterns
    /// and all its subscriptions; the latter are returned for teardown.
    pub fn delete_endpoint(&self, id: EndpointId) -> Result<(Endpoint, Vec<Subscription>)> {
        let mut inner = self.inner.lock();
        let endpoint = match inner.endpoints.remove(&id) {
            Some(e) => e,
            None => return Err(BrokerError::not_found(format!("endpoint id `{}`", id))),
        };
        if let Some(sec_id) = endpoint.sec_id {
            inner.sec_id_to_endpoint_id.remove(&sec_id);
        }
        if let Some(channel_id) = endpoint.channel_id {
            inner.channel_id_to_endpoint_id.remove(&channel_id);
        }
        self.matcher.remove(id);
        let mut removed = Vec::new();
        for subs in inner.subs_by_topic.values_mut() {
            subs.retain(|s| {
                if s.endpoint_id == id {
                    removed.push(s.clone());
                    false
                } else {
                    true
                }
            });
        }
        inner.subs_by_topic.retain(|_, subs| !subs.is_empty());
        for sub in &removed {
            inner.subs_by_sub_key.remove(&sub.sub_key);
        }
        log::info!("deleted endpoint `{}` with {} subscription(s)", endpoint.name, removed.len());
        Ok((endpoint, removed))
    }

    #[inline]
    pub fn get_endpoint_by_id(&self, id: EndpointId) -> Option<Endpoint> {
        self.inner.lock().endpoints.get(&id).cloned()
    }

    #[inline]
    pub fn get_endpoint_id_by_sec_id(&self, sec_id: SecurityId) -> Option<EndpointId> {
        self.inner.lock().sec_id_to_endpoint_id.get(&sec_id).copied()
    }

    #[inline]
    pub fn get_endpoint_id_by_channel_id(&self, channel_id: ChannelId) -> Option<EndpointId> {
        self.inner.lock().channel_id_to_endpoint_id.get(&channel_id).copied()
    }

    #[inline]
    pub fn is_allowed_pub_topic(&self, endpoint_id: EndpointId, topic: &str) -> Evaluation {
        self.matcher.evaluate(endpoint_id, topic, Operation::Publish)
    }

    #[inline]
    pub fn is_allowed_sub_topic(&self, endpoint_id: EndpointId, topic: &str) -> Evaluation {
        self.matcher.evaluate(endpoint_id, topic, Operation::Subscribe)
    }

    /// Register a subscription. Non-channel endpoints may hold at most one
    /// active subscription per topic; channel endpoints may hold many, one
    /// per connection.
    pub fn add_subscription(&self, sub: Subscription) -> Result<()> {
        let mut inner = self.inner.lock();
        let is_channel = inner
            .endpoints
            .get(&sub.endpoint_id)
            .map(|e| e.endpoint_type.is_channel())
            .unwrap_or(false);
        if !is_channel {
            let exists = inner
                .subs_by_topic
                .get(&sub.topic_name)
                .map(|subs| subs.iter().any(|s| s.endpoint_id == sub.endpoint_id))
                .unwrap_or(false);
            if exists {
                return Err(BrokerError::bad_request(format!(
                    "endpoint `{}` already subscribed to topic `{}`",
                    sub.endpoint_id, sub.topic_name
                )));
            }
        }
        inner.subs_by_topic.entry(sub.topic_name.clone()).or_default().push(sub.clone());
        inner.subs_by_sub_key.insert(sub.sub_key.clone(), sub);
        Ok(())
    }

    pub fn delete_subscription(&self, sub_key: &SubKey) -> Option<Subscription> {
        let mut inner = self.inner.lock();
        let sub = inner.subs_by_sub_key.remove(sub_key)?;
        let emptied = if let Some(subs) = inner.subs_by_topic.get_mut(&sub.topic_name) {
            subs.retain(|s| &s.sub_key != sub_key);
            subs.is_empty()
        } else {
            false
        };
        if emptied {
            inner.subs_by_topic.remove(&sub.topic_name);
        }
        Some(sub)
    }

    #[inline]
    pub fn get_subscription_by_sub_key(&self, sub_key: &SubKey) -> Option<Subscription> {
        self.inner.lock().subs_by_sub_key.get(sub_key).cloned()
    }

    #[inline]
    pub fn get_subscriptions_by_topic(&self, topic_name: &str) -> Vec<Subscription> {
        self.inner.lock().subs_by_topic.get(topic_name).cloned().unwrap_or_default()
    }

    #[inline]
    pub fn get_subscriptions_by_endpoint(&self, endpoint_id: EndpointId) -> Vec<Subscription> {
        self.inner
            .lock()
            .subs_by_sub_key
            .values()
            .filter(|s| s.endpoint_id == endpoint_id)
            .cloned()
            .collect()
    }

    #[inline]
    pub fn is_subscribed_to(&self, endpoint_id: EndpointId, topic_name: &str) -> bool {
        self.inner
            .lock()
            .subs_by_topic
            .get(topic_name)
            .map(|subs| subs.iter().any(|s| s.endpoint_id == endpoint_id))
            .unwrap_or(false)
    }

    #[inline]
    pub fn topic_name_by_sub_key(&self, sub_key: &SubKey) -> Option<TopicName> {
        self.inner.lock().subs_by_sub_key.get(sub_key).map(|s| s.topic_name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rbus_utils::timestamp_millis;

    fn sub(sub_key: &str, topic: &Topic, endpoint_id: EndpointId) -> Subscription {
        Subscription {
            id: 0,
            sub_key: SubKey::from(sub_key.to_owned()),
            topic_id: topic.id,
            topic_name: topic.name.clone(),
            endpoint_id,
            creation_time: timestamp_millis(),
            sub_pattern_matched: "orders.**".into(),
            has_gd: true,
            is_active: true,
            server_name: "node-1".into(),
            server_pid: 1,
        }
    }

    fn endpoint(r: &Registry, patterns: &str) -> Endpoint {
        r.create_endpoint(EndpointConfig {
            name: "ep".into(),
            topic_patterns: patterns.to_owned(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn topic_lifecycle() {
        let r = Registry::new();
        let t = r.create_topic("orders.processed".into(), TopicConfig::default()).unwrap();
        assert!(r.create_topic("orders.processed".into(), TopicConfig::default()).is_err());
        assert_eq!(r.get_topic_by_name("orders.processed").unwrap().id, t.id);
        assert!(r.get_topic_by_id(t.id).is_some());
        r.delete_topic(t.id).unwrap();
        assert!(r.get_topic_by_name("orders.processed").is_none());
        assert!(r.delete_topic(t.id).is_err());
    }

    #[test]
    fn rename_preserves_subscriptions() {
        let r = Registry::new();
        let t = r.create_topic("orders.old".into(), TopicConfig::default()).unwrap();
        let ep = endpoint(&r, "sub=orders.**");
        r.add_subscription(sub("psk.rest.1", &t, ep.id)).unwrap();

        r.edit_topic(t.id, Some("orders.new".into()), TopicConfig::default()).unwrap();
        assert!(r.get_topic_by_name("orders.old").is_none());
        let subs = r.get_subscriptions_by_topic("orders.new");
        assert_eq!(subs.len(), 1);
        assert_eq!(
            &*r.get_subscription_by_sub_key(&SubKey::from("psk.rest.1")).unwrap().topic_name,
            "orders.new"
        );
    }

    #[test]
    fn one_subscription_per_topic_for_non_channel_endpoints() {
        let r = Registry::new();
        let t = r.create_topic("orders.processed".into(), TopicConfig::default()).unwrap();
        let ep = endpoint(&r, "sub=orders.**");
        r.add_subscription(sub("psk.rest.1", &t, ep.id)).unwrap();
        assert!(r.add_subscription(sub("psk.rest.2", &t, ep.id)).is_err());

        let ch = r
            .create_endpoint(EndpointConfig {
                name: "ws".into(),
                endpoint_type: EndpointType::Channel,
                topic_patterns: "sub=orders.**".into(),
                channel_id: Some(7),
                ..Default::default()
            })
            .unwrap();
        r.add_subscription(sub("psk.channel.1", &t, ch.id)).unwrap();
        r.add_subscription(sub("psk.channel.2", &t, ch.id)).unwrap();
        assert_eq!(r.get_subscriptions_by_topic("orders.processed").len(), 3);
    }

    #[test]
    fn endpoint_delete_cascades() {
        let r = Registry::new();
        let t = r.create_topic("orders.processed".into(), TopicConfig::default()).unwrap();
        let ep = r
            .create_endpoint(EndpointConfig {
                name: "ep".into(),
                topic_patterns: "sub=orders.**".into(),
                sec_id: Some(11),
                ..Default::default()
            })
            .unwrap();
        r.add_subscription(sub("psk.rest.1", &t, ep.id)).unwrap();
        assert_eq!(r.get_endpoint_id_by_sec_id(11), Some(ep.id));

        let (_, removed) = r.delete_endpoint(ep.id).unwrap();
        assert_eq!(removed.len(), 1);
        assert!(r.get_endpoint_id_by_sec_id(11).is_none());
        assert!(r.get_subscription_by_sub_key(&SubKey::from("psk.rest.1")).is_none());
        assert!(r.get_subscriptions_by_topic("orders.processed").is_empty());
        assert!(!r.is_allowed_sub_topic(ep.id, "orders.processed").is_allowed());
    }

    #[test]
    fn permission_checks_go_through_the_matcher() {
        let r = Registry::new();
        let ep = endpoint(&r, "pub=orders.**\nsub=invoices.*");
        assert!(r.is_allowed_pub_topic(ep.id, "orders.new").is_allowed());
        assert!(!r.is_allowed_sub_topic(ep.id, "orders.new").is_allowed());
        assert!(r.is_allowed_sub_topic(ep.id, "invoices.new").is_allowed());
    }

    #[test]
    fn duplicate_identity_mappings_rejected() {
        let r = Registry::new();
        r.create_endpoint(EndpointConfig { sec_id: Some(1), ..Default::default() }).unwrap();
        assert!(r.create_endpoint(EndpointConfig { sec_id: Some(1), ..Default::default() }).is_err());
    }
}
