//! Publisher/subscriber facing operations
//!
//! Everything an embedding application calls to move messages lives here:
//! publishing to topics or services, creating and removing subscriptions,
//! and the pull-mode message surface (get, read, delete, update). The
//! push-mode path runs inside the delivery tasks; these operations only
//! feed it.

use std::sync::Arc;

use bytes::Bytes;
use bytestring::ByteString;
use serde::{Deserialize, Serialize};

use rbus_utils::timestamp_millis;

use crate::backlog::{MessageUpdate, OVERFLOW_LOG_TARGET};
use crate::broker::{service_topic_name, PubSub};
use crate::error::{BrokerError, Result};
use crate::message::{new_msg_id, new_sub_key, GdRow, Message, WireMessage, PRIORITY_MAX};
use crate::registry::{Endpoint, Subscription, Topic, TopicConfig};
use crate::tool::NewMessagesCtx;
use crate::types::{ChannelId, EndpointId, MsgId, SecurityId, SubKey, TopicName};

/// Pull-mode batch limits applied when the caller gives none.
pub const DEFAULT_PULL_MAX_MESSAGES: usize = 50;
pub const DEFAULT_PULL_MAX_LEN: usize = 256_000;

/// One publication request. Exactly one of `topic` and `service` must be
/// given, and at least one of `data` and `data_list`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PublishParams {
    pub topic: Option<TopicName>,
    pub service: Option<ByteString>,
    pub data: Option<Bytes>,
    pub data_list: Option<Vec<Bytes>>,
    pub priority: Option<u8>,
    /// Lifetime in seconds.
    pub expiration: Option<i64>,
    pub correl_id: Option<ByteString>,
    pub in_reply_to: Option<ByteString>,
    pub ext_client_id: Option<ByteString>,
    /// RFC 3339 publication time as stamped by an external system.
    pub ext_pub_time: Option<String>,
    pub has_gd: Option<bool>,
    /// When non-empty, only these subscription keys receive the message.
    #[serde(default)]
    pub deliver_to_sk: Vec<SubKey>,
    pub endpoint_id: Option<EndpointId>,
    pub sec_id: Option<SecurityId>,
    pub channel_id: Option<ChannelId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishReceipt {
    pub msg_ids: Vec<MsgId>,
    pub topic_name: TopicName,
    pub has_gd: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscribeParams {
    pub topic: TopicName,
    pub has_gd: Option<bool>,
    pub endpoint_id: Option<EndpointId>,
    pub sec_id: Option<SecurityId>,
    pub channel_id: Option<ChannelId>,
}

/// Addresses one message in one subscriber queue. Non-GD messages exist
/// only on the server that accepted them, so those forms must carry the
/// holding server's identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageParams {
    pub sub_key: SubKey,
    pub msg_id: MsgId,
    pub has_gd: bool,
    pub server_name: Option<ByteString>,
    pub server_pid: Option<u32>,
}

impl PubSub {
    /// Publish one or more messages to a topic, or to a service through its
    /// service topic. Returns the assigned message ids in input order.
    pub async fn publish(&self, params: PublishParams) -> Result<PublishReceipt> {
        let endpoint = self.resolve_endpoint(params.endpoint_id, params.sec_id, params.channel_id)?;

        let (topic, is_service) = match (&params.topic, &params.service) {
            (Some(_), Some(_)) => {
                return Err(BrokerError::bad_request("topic and service are mutually exclusive"))
            }
            (None, None) => return Err(BrokerError::bad_request("either topic or service is required")),
            (Some(name), None) => {
                let topic = self
                    .registry
                    .get_topic_by_name(name)
                    .ok_or_else(|| BrokerError::not_found(format!("topic `{}`", name)))?;
                (topic, false)
            }
            (None, Some(service)) => (self.ensure_service_topic(service).await?, true),
        };
        if !topic.is_active {
            return Err(BrokerError::bad_request(format!("topic `{}` is inactive", topic.name)));
        }
        if !endpoint.is_internal {
            let eval = self.registry.is_allowed_pub_topic(endpoint.id, &topic.name);
            if !eval.is_allowed() {
                return Err(BrokerError::forbidden(format!(
                    "endpoint `{}` may not publish to `{}`",
                    endpoint.name, topic.name
                )));
            }
        }

        let priority = params.priority.unwrap_or(self.cfg.pubsub.default_priority);
        if priority > PRIORITY_MAX {
            return Err(BrokerError::bad_request(format!("priority `{}` out of range", priority)));
        }
        let expiration_secs = params.expiration.unwrap_or(self.cfg.pubsub.default_expiration_secs);
        if expiration_secs < 0 {
            return Err(BrokerError::bad_request(format!(
                "expiration `{}` must not be negative",
                expiration_secs
            )));
        }

        let has_gd = if is_service {
            // Service invocations survive restarts of the node that will
            // run them.
            true
        } else {
            match params.has_gd {
                Some(true) if !topic.has_gd => {
                    return Err(BrokerError::bad_request(format!(
                        "topic `{}` does not support guaranteed delivery",
                        topic.name
                    )))
                }
                Some(v) => v,
                None => topic.has_gd,
            }
        };

        let bodies = match (params.data, params.data_list) {
            (_, Some(list)) if !list.is_empty() => list,
            (Some(data), _) => vec![data],
            _ => return Err(BrokerError::bad_request("data is missing")),
        };
        let max_msg_size = self.cfg.pubsub.max_msg_size.as_usize();
        if let Some(data) = bodies.iter().find(|data| data.len() > max_msg_size) {
            return Err(BrokerError::bad_request(format!(
                "message of {} byte(s) exceeds the {} limit",
                data.len(),
                self.cfg.pubsub.max_msg_size.string()
            )));
        }

        let recv_time = timestamp_millis();
        let pub_time = match &params.ext_pub_time {
            Some(s) => chrono::DateTime::parse_from_rfc3339(s)
                .map_err(|e| BrokerError::bad_request(format!("invalid ext_pub_time `{}`: {}", s, e)))?
                .timestamp_millis(),
            None => recv_time,
        };
        let expiration = expiration_secs.saturating_mul(1000);

        let msgs = bodies
            .into_iter()
            .map(|data| Message {
                msg_id: new_msg_id(),
                topic_id: topic.id,
                topic_name: topic.name.clone(),
                size: data.len(),
                data,
                priority,
                pub_time,
                recv_time,
                expiration,
                expiration_time: recv_time + expiration,
                correl_id: params.correl_id.clone(),
                in_reply_to: params.in_reply_to.clone(),
                ext_client_id: params.ext_client_id.clone(),
                deliver_to_sk: params.deliver_to_sk.clone(),
                published_by: endpoint.id,
                has_gd,
                server_name: self.server_name.clone(),
                server_pid: self.server_pid,
            })
            .collect::<Vec<_>>();
        let msg_ids = msgs.iter().map(|m| m.msg_id.clone()).collect::<Vec<_>>();

        let subs = self
            .registry
            .get_subscriptions_by_topic(&topic.name)
            .into_iter()
            .filter(|s| s.is_active)
            .filter(|s| params.deliver_to_sk.is_empty() || params.deliver_to_sk.contains(&s.sub_key))
            .collect::<Vec<_>>();

        let (ctx_sub_keys, non_gd_msgs) = if has_gd {
            let sub_keys = self.save_gd(&topic, &subs, &msgs).await?;
            (sub_keys, Vec::new())
        } else {
            let arcs = msgs.into_iter().map(Arc::new).collect::<Vec<_>>();
            let sub_keys = subs.iter().map(|s| s.sub_key.clone()).collect::<Vec<_>>();
            let outcome =
                self.backlog.add_messages(topic.id, topic.max_depth_non_gd, &sub_keys, &arcs);
            (outcome.admitted, arcs)
        };

        self.stats.publisheds.incs(msg_ids.len() as isize);
        if !ctx_sub_keys.is_empty() {
            self.tool.handle_new_messages(NewMessagesCtx {
                topic_id: topic.id,
                topic_name: topic.name.clone(),
                has_gd,
                sub_keys: ctx_sub_keys,
                non_gd_msgs,
                pub_time_max: pub_time,
            });
        }

        log::debug!(
            "published {} message(s) to `{}` by endpoint {} (gd: {})",
            msg_ids.len(),
            topic.name,
            endpoint.id,
            has_gd
        );
        Ok(PublishReceipt { msg_ids, topic_name: topic.name, has_gd })
    }

    /// Subscribe an endpoint to a topic, returning the new subscription. Its
    /// delivery task starts immediately on this server.
    pub async fn subscribe(&self, params: SubscribeParams) -> Result<Subscription> {
        let endpoint = self.resolve_endpoint(params.endpoint_id, params.sec_id, params.channel_id)?;
        let topic = self
            .registry
            .get_topic_by_name(&params.topic)
            .ok_or_else(|| BrokerError::not_found(format!("topic `{}`", params.topic)))?;

        let eval = self.registry.is_allowed_sub_topic(endpoint.id, &topic.name);
        let pattern = match eval.pattern() {
            Some(p) => p.clone(),
            None if endpoint.is_internal => ByteString::new(),
            None => {
                return Err(BrokerError::forbidden(format!(
                    "endpoint `{}` may not subscribe to `{}`",
                    endpoint.name, topic.name
                )))
            }
        };

        let has_gd = params.has_gd.unwrap_or(topic.has_gd) && topic.has_gd;
        let sub = Subscription {
            id: self.registry.next_sub_id(),
            sub_key: new_sub_key(endpoint.endpoint_type.as_str()),
            topic_id: topic.id,
            topic_name: topic.name.clone(),
            endpoint_id: endpoint.id,
            creation_time: timestamp_millis(),
            sub_pattern_matched: pattern,
            has_gd,
            is_active: true,
            server_name: self.server_name.clone(),
            server_pid: self.server_pid,
        };
        self.registry.add_subscription(sub.clone())?;

        if has_gd {
            let moved =
                self.storage.move_to_sub_queue(topic.id, &sub.sub_key, timestamp_millis()).await?;
            if moved > 0 {
                log::debug!("seeded `{}` with {} staged message(s)", sub.sub_key, moved);
            }
        }
        if let Err(e) = self.tool.add_sub_key(&sub).await {
            self.registry.delete_subscription(&sub.sub_key);
            return Err(e);
        }
        log::info!("endpoint {} subscribed to `{}` as `{}`", endpoint.id, topic.name, sub.sub_key);
        Ok(sub)
    }

    /// Remove subscriptions from a topic: catalog entries, delivery tasks,
    /// durable queues and in-RAM references, in that order. Unknown sub_keys
    /// are skipped. Returns how many subscriptions were removed.
    pub async fn unsubscribe(&self, topic_name: &str, sub_keys: &[SubKey]) -> Result<usize> {
        let topic = self
            .registry
            .get_topic_by_name(topic_name)
            .ok_or_else(|| BrokerError::not_found(format!("topic `{}`", topic_name)))?;
        let mut removed = 0;
        for sub_key in sub_keys {
            match self.registry.delete_subscription(sub_key) {
                Some(_) => {
                    self.tool.remove_sub_key(sub_key).await;
                    self.storage.delete_sub_queue(sub_key).await?;
                    removed += 1;
                }
                None => log::warn!("unsubscribe: unknown sub_key `{}`", sub_key),
            }
        }
        self.backlog.unsubscribe(topic.id, sub_keys);
        Ok(removed)
    }

    /// Get-and-delete the next batch for a pull-mode subscriber, highest
    /// priority first.
    pub async fn get_messages(
        &self,
        sub_key: &SubKey,
        max_messages: Option<usize>,
        max_len: Option<usize>,
    ) -> Result<Vec<WireMessage>> {
        self.subscription(sub_key)?;
        let msgs = self
            .tool
            .pull_messages(
                sub_key,
                max_messages.unwrap_or(DEFAULT_PULL_MAX_MESSAGES),
                max_len.unwrap_or(DEFAULT_PULL_MAX_LEN),
            )
            .await?;
        Ok(msgs.iter().map(WireMessage::from).collect())
    }

    /// Look at queued messages without consuming them.
    pub async fn read_messages(
        &self,
        sub_key: &SubKey,
        max_messages: Option<usize>,
    ) -> Result<Vec<WireMessage>> {
        self.subscription(sub_key)?;
        let msgs =
            self.tool.read_messages(sub_key, max_messages.unwrap_or(DEFAULT_PULL_MAX_MESSAGES)).await?;
        Ok(msgs.iter().map(WireMessage::from).collect())
    }

    /// Read one message by id without consuming it.
    pub async fn read_message(&self, params: MessageParams) -> Result<WireMessage> {
        self.subscription(&params.sub_key)?;
        if params.has_gd {
            let rows = self.storage.fetch_by_msg_ids(&params.sub_key, &[params.msg_id.clone()]).await?;
            rows.first()
                .map(|row| WireMessage::from(&row.msg))
                .ok_or_else(|| BrokerError::not_found(format!("message `{}`", params.msg_id)))
        } else {
            self.check_holding_server(&params)?;
            self.backlog
                .get_msg(&params.msg_id)
                .map(|m| WireMessage::from(m.as_ref()))
                .ok_or_else(|| BrokerError::not_found(format!("message `{}`", params.msg_id)))
        }
    }

    /// Delete one message from one subscriber queue.
    pub async fn delete_message(&self, params: MessageParams) -> Result<()> {
        self.subscription(&params.sub_key)?;
        if params.has_gd {
            // Mark the row first so the message is gone even when it has not
            // reached this server's delivery list yet.
            self.storage
                .set_to_delete(&params.sub_key, &[params.msg_id.clone()], timestamp_millis())
                .await?;
            if self.tool.handles_sub_key(&params.sub_key) {
                self.tool.delete_messages(&params.sub_key, &[params.msg_id]).await?;
            }
            Ok(())
        } else {
            self.check_holding_server(&params)?;
            self.tool.delete_messages(&params.sub_key, &[params.msg_id]).await
        }
    }

    /// Update a queued non-GD message in place. Deliveries that already
    /// picked the message up keep the previous body.
    pub fn update_message(&self, msg_id: &MsgId, update: MessageUpdate) -> Result<()> {
        if let Some(priority) = update.priority {
            if priority > PRIORITY_MAX {
                return Err(BrokerError::bad_request(format!("priority `{}` out of range", priority)));
            }
        }
        if self.backlog.update_msg(msg_id, update) {
            Ok(())
        } else {
            Err(BrokerError::not_found(format!("message `{}`", msg_id)))
        }
    }

    /// `(gd, non_gd)` queue depth for one subscriber.
    pub fn get_queue_depth(&self, sub_key: &SubKey) -> Result<(usize, usize)> {
        self.subscription(sub_key)?;
        self.tool.get_queue_depth(sub_key)
    }

    pub fn pause_sub_key(&self, sub_key: &SubKey) -> Result<()> {
        self.subscription(sub_key)?;
        self.tool.pause_sub_key(sub_key)
    }

    pub fn resume_sub_key(&self, sub_key: &SubKey) -> Result<()> {
        self.subscription(sub_key)?;
        self.tool.resume_sub_key(sub_key)
    }

    /// Delete a topic and tear down everything that hangs off it.
    pub async fn delete_topic(&self, topic_name: &str) -> Result<Topic> {
        let topic = self
            .registry
            .get_topic_by_name(topic_name)
            .ok_or_else(|| BrokerError::not_found(format!("topic `{}`", topic_name)))?;
        let (topic, subs) = self.registry.delete_topic(topic.id)?;
        for sub in &subs {
            self.tool.remove_sub_key(&sub.sub_key).await;
            self.storage.delete_sub_queue(&sub.sub_key).await?;
        }
        let cleared = self.backlog.clear_topic(topic.id);
        log::info!(
            "deleted topic `{}`: {} subscription(s), {} in-RAM message(s)",
            topic.name,
            subs.len(),
            cleared
        );
        Ok(topic)
    }

    /// Delete an endpoint, cascading into its subscriptions.
    pub async fn delete_endpoint(&self, endpoint_id: EndpointId) -> Result<Endpoint> {
        let (endpoint, subs) = self.registry.delete_endpoint(endpoint_id)?;
        for sub in &subs {
            self.tool.remove_sub_key(&sub.sub_key).await;
            self.storage.delete_sub_queue(&sub.sub_key).await?;
            self.backlog.unsubscribe(sub.topic_id, std::slice::from_ref(&sub.sub_key));
        }
        log::info!("deleted endpoint `{}` with {} subscription(s)", endpoint.name, subs.len());
        Ok(endpoint)
    }

    /// Drop every in-RAM message of a topic, returning how many bodies went
    /// away. Durable rows are not touched.
    pub fn clear_topic(&self, topic_name: &str) -> Result<usize> {
        let topic = self
            .registry
            .get_topic_by_name(topic_name)
            .ok_or_else(|| BrokerError::not_found(format!("topic `{}`", topic_name)))?;
        Ok(self.backlog.clear_topic(topic.id))
    }

    /// In-RAM message count of one topic.
    pub fn topic_depth(&self, topic_name: &str) -> Result<usize> {
        let topic = self
            .registry
            .get_topic_by_name(topic_name)
            .ok_or_else(|| BrokerError::not_found(format!("topic `{}`", topic_name)))?;
        Ok(self.backlog.topic_depth(topic.id))
    }

    fn subscription(&self, sub_key: &SubKey) -> Result<Subscription> {
        self.registry
            .get_subscription_by_sub_key(sub_key)
            .ok_or_else(|| BrokerError::not_found(format!("sub_key `{}`", sub_key)))
    }

    fn resolve_endpoint(
        &self,
        endpoint_id: Option<EndpointId>,
        sec_id: Option<SecurityId>,
        channel_id: Option<ChannelId>,
    ) -> Result<Endpoint> {
        let id = if let Some(id) = endpoint_id {
            id
        } else if let Some(sec_id) = sec_id {
            self.registry
                .get_endpoint_id_by_sec_id(sec_id)
                .ok_or_else(|| BrokerError::not_found(format!("sec_id `{}`", sec_id)))?
        } else if let Some(channel_id) = channel_id {
            self.registry
                .get_endpoint_id_by_channel_id(channel_id)
                .ok_or_else(|| BrokerError::not_found(format!("channel_id `{}`", channel_id)))?
        } else {
            return Err(BrokerError::bad_request("an endpoint_id, sec_id or channel_id is required"));
        };
        let endpoint = self
            .registry
            .get_endpoint_by_id(id)
            .ok_or_else(|| BrokerError::not_found(format!("endpoint `{}`", id)))?;
        if !endpoint.is_active {
            return Err(BrokerError::forbidden(format!("endpoint `{}` is inactive", endpoint.name)));
        }
        Ok(endpoint)
    }

    /// Non-GD messages live in the memory of exactly one process; reject
    /// per-message operations not addressed to this one.
    fn check_holding_server(&self, params: &MessageParams) -> Result<()> {
        match (&params.server_name, params.server_pid) {
            (Some(name), Some(pid)) if *name == self.server_name && pid == self.server_pid => Ok(()),
            (Some(_), Some(_)) => Err(BrokerError::bad_request(format!(
                "message `{}` is not held by this server",
                params.msg_id
            ))),
            _ => Err(BrokerError::bad_request(
                "server_name and server_pid are required for non-GD messages",
            )),
        }
    }

    /// The topic a service receives messages on, created on first use with
    /// the delivery endpoint already subscribed.
    async fn ensure_service_topic(&self, service: &str) -> Result<Topic> {
        let name = TopicName::from(service_topic_name(service));
        if let Some(topic) = self.registry.get_topic_by_name(&name) {
            return Ok(topic);
        }
        let topic = self.registry.create_topic(
            name,
            TopicConfig {
                is_internal: true,
                has_gd: true,
                max_depth_gd: self.cfg.pubsub.max_depth_gd,
                max_depth_non_gd: self.cfg.pubsub.max_depth_non_gd,
                ..Default::default()
            },
        )?;
        let sub = Subscription {
            id: self.registry.next_sub_id(),
            sub_key: new_sub_key("service"),
            topic_id: topic.id,
            topic_name: topic.name.clone(),
            endpoint_id: self.service_endpoint_id,
            creation_time: timestamp_millis(),
            sub_pattern_matched: ByteString::from_static("sub=services.**"),
            has_gd: true,
            is_active: true,
            server_name: self.server_name.clone(),
            server_pid: self.server_pid,
        };
        self.registry.add_subscription(sub.clone())?;
        self.tool.add_sub_key(&sub).await?;
        Ok(topic)
    }

    /// Append GD rows for every subscriber whose durable queue can take the
    /// batch, and stage the bodies on the topic for subscribers yet to come.
    async fn save_gd(
        &self,
        topic: &Topic,
        subs: &[Subscription],
        msgs: &[Message],
    ) -> Result<Vec<SubKey>> {
        let mut rows = Vec::with_capacity(subs.len() * msgs.len());
        let mut saved = Vec::with_capacity(subs.len());
        for sub in subs {
            let depth = self.storage.queue_depth(&sub.sub_key).await?;
            if depth + msgs.len() > topic.max_depth_gd {
                log::warn!(
                    target: OVERFLOW_LOG_TARGET,
                    "sub_key `{}` at GD depth {}/{}, rejecting {} message(s): {}",
                    sub.sub_key,
                    depth,
                    topic.max_depth_gd,
                    msgs.len(),
                    msgs.iter().map(|m| &*m.msg_id).collect::<Vec<_>>().join(", ")
                );
                self.stats.overfloweds.incs(msgs.len() as isize);
                continue;
            }
            rows.extend(msgs.iter().map(|m| GdRow::new(sub.sub_key.clone(), m.clone())));
            saved.push(sub.sub_key.clone());
        }
        if !rows.is_empty() {
            self.storage.save(rows).await?;
        }
        self.storage.stage_on_topic(topic.id, msgs.to_vec()).await?;
        Ok(saved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::EndpointConfig;
    use crate::storage::MemGdStorage;
    use crate::task::TaskState;
    use crate::types::EndpointType;
    use std::time::Duration;

    async fn ctx() -> PubSub {
        PubSub::builder().storage(MemGdStorage::new()).build().await.unwrap()
    }

    fn rest_endpoint(ps: &PubSub, name: &str, patterns: &str) -> Endpoint {
        ps.registry
            .create_endpoint(EndpointConfig {
                name: name.into(),
                endpoint_type: EndpointType::Rest,
                topic_patterns: patterns.to_string(),
                ..Default::default()
            })
            .unwrap()
    }

    fn publish_params(topic: &str, endpoint_id: EndpointId, data: &str) -> PublishParams {
        PublishParams {
            topic: Some(topic.into()),
            data: Some(Bytes::copy_from_slice(data.as_bytes())),
            endpoint_id: Some(endpoint_id),
            ..Default::default()
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn pull_returns_priority_order() {
        let ps = ctx().await;
        ps.registry
            .create_topic("orders.new".into(), TopicConfig { has_gd: false, ..Default::default() })
            .unwrap();
        let ep = rest_endpoint(&ps, "shop", "pub=orders.**\nsub=orders.**");
        let sub = ps
            .subscribe(SubscribeParams {
                topic: "orders.new".into(),
                endpoint_id: Some(ep.id),
                ..Default::default()
            })
            .await
            .unwrap();

        for priority in [3u8, 9, 7] {
            let mut params = publish_params("orders.new", ep.id, "x");
            params.priority = Some(priority);
            ps.publish(params).await.unwrap();
        }
        settle().await;

        let msgs = ps.get_messages(&sub.sub_key, None, None).await.unwrap();
        let priorities = msgs.iter().map(|m| m.meta.priority).collect::<Vec<_>>();
        assert_eq!(priorities, vec![9, 7, 3]);
        assert!(ps.get_messages(&sub.sub_key, None, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn overflowing_queue_rejects_whole_batches() {
        let ps = ctx().await;
        ps.registry
            .create_topic(
                "orders.new".into(),
                TopicConfig { has_gd: false, max_depth_non_gd: 3, ..Default::default() },
            )
            .unwrap();
        let ep = rest_endpoint(&ps, "shop", "pub=orders.**\nsub=orders.**");
        let sub = ps
            .subscribe(SubscribeParams {
                topic: "orders.new".into(),
                endpoint_id: Some(ep.id),
                ..Default::default()
            })
            .await
            .unwrap();

        for i in 0..5 {
            ps.publish(publish_params("orders.new", ep.id, &format!("m{}", i))).await.unwrap();
        }
        settle().await;

        let msgs = ps.get_messages(&sub.sub_key, Some(10), None).await.unwrap();
        assert_eq!(msgs.len(), 3);
        assert_eq!(ps.stats.overfloweds.count(), 2);
    }

    #[tokio::test]
    async fn unsubscribe_leaves_other_subscribers_alone() {
        let ps = ctx().await;
        ps.registry
            .create_topic("orders.new".into(), TopicConfig { has_gd: false, ..Default::default() })
            .unwrap();
        let ep1 = rest_endpoint(&ps, "shop", "pub=orders.**\nsub=orders.**");
        let ep2 = rest_endpoint(&ps, "audit", "sub=orders.**");
        let sub1 = ps
            .subscribe(SubscribeParams {
                topic: "orders.new".into(),
                endpoint_id: Some(ep1.id),
                ..Default::default()
            })
            .await
            .unwrap();
        let sub2 = ps
            .subscribe(SubscribeParams {
                topic: "orders.new".into(),
                endpoint_id: Some(ep2.id),
                ..Default::default()
            })
            .await
            .unwrap();

        ps.publish(publish_params("orders.new", ep1.id, "one")).await.unwrap();
        settle().await;
        assert_eq!(ps.unsubscribe("orders.new", &[sub1.sub_key.clone()]).await.unwrap(), 1);
        ps.publish(publish_params("orders.new", ep1.id, "two")).await.unwrap();
        settle().await;

        assert!(ps.get_messages(&sub1.sub_key, None, None).await.is_err());
        let msgs = ps.get_messages(&sub2.sub_key, None, None).await.unwrap();
        assert_eq!(msgs.len(), 2);
    }

    #[tokio::test]
    async fn publish_validation() {
        let ps = ctx().await;
        ps.registry.create_topic("orders.new".into(), TopicConfig::default()).unwrap();
        let ep = rest_endpoint(&ps, "shop", "pub=orders.**");

        let mut params = publish_params("orders.new", ep.id, "x");
        params.priority = Some(12);
        assert!(matches!(ps.publish(params).await, Err(BrokerError::BadRequest(_))));

        let mut params = publish_params("orders.new", ep.id, "x");
        params.expiration = Some(-5);
        assert!(matches!(ps.publish(params).await, Err(BrokerError::BadRequest(_))));

        let mut params = publish_params("orders.new", ep.id, "x");
        params.service = Some("billing".into());
        assert!(matches!(ps.publish(params).await, Err(BrokerError::BadRequest(_))));

        let mut params = publish_params("orders.new", ep.id, "x");
        params.data = None;
        assert!(matches!(ps.publish(params).await, Err(BrokerError::BadRequest(_))));

        let mut params = publish_params("orders.new", ep.id, "x");
        params.data = Some(Bytes::from(vec![0u8; 2 * 1024 * 1024]));
        assert!(matches!(ps.publish(params).await, Err(BrokerError::BadRequest(_))));

        let params = publish_params("orders.missing", ep.id, "x");
        assert!(matches!(ps.publish(params).await, Err(BrokerError::NotFound(_))));
    }

    #[tokio::test]
    async fn permissions_are_enforced() {
        let ps = ctx().await;
        ps.registry.create_topic("invoices.out".into(), TopicConfig::default()).unwrap();
        let ep = rest_endpoint(&ps, "shop", "pub=orders.**\nsub=orders.**");

        let params = publish_params("invoices.out", ep.id, "x");
        assert!(matches!(ps.publish(params).await, Err(BrokerError::Forbidden(_))));
        let res = ps
            .subscribe(SubscribeParams {
                topic: "invoices.out".into(),
                endpoint_id: Some(ep.id),
                ..Default::default()
            })
            .await;
        assert!(matches!(res, Err(BrokerError::Forbidden(_))));
    }

    #[tokio::test]
    async fn service_publish_creates_topic_and_queues_gd() {
        let ps = ctx().await;
        let ep = rest_endpoint(&ps, "shop", "pub=orders.**");

        // Service topics still go through the publisher's own patterns for
        // non-internal endpoints; grant access first.
        ps.registry
            .edit_endpoint_patterns(ep.id, "pub=orders.**\npub=services.**".into())
            .unwrap();
        let params = PublishParams {
            service: Some("billing".into()),
            data: Some(Bytes::from_static(b"invoice")),
            endpoint_id: Some(ep.id),
            ..Default::default()
        };
        let receipt = ps.publish(params).await.unwrap();
        assert!(receipt.has_gd);
        assert_eq!(receipt.topic_name, "services.billing");

        let topic = ps.registry.get_topic_by_name("services.billing").unwrap();
        assert!(topic.has_gd && topic.is_internal);
        let subs = ps.registry.get_subscriptions_by_topic("services.billing");
        assert_eq!(subs.len(), 1);
        settle().await;
        let msgs = ps.get_messages(&subs[0].sub_key, None, None).await.unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].data, Bytes::from_static(b"invoice"));
    }

    #[tokio::test]
    async fn gd_messages_published_before_subscribing_are_seeded() {
        let ps = ctx().await;
        ps.registry.create_topic("orders.new".into(), TopicConfig::default()).unwrap();
        let ep = rest_endpoint(&ps, "shop", "pub=orders.**\nsub=orders.**");

        ps.publish(publish_params("orders.new", ep.id, "early")).await.unwrap();
        let sub = ps
            .subscribe(SubscribeParams {
                topic: "orders.new".into(),
                endpoint_id: Some(ep.id),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(sub.has_gd);

        let msgs = ps.get_messages(&sub.sub_key, None, None).await.unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].data, Bytes::from_static(b"early"));
    }

    #[tokio::test]
    async fn deliver_to_sk_narrows_recipients() {
        let ps = ctx().await;
        ps.registry
            .create_topic("orders.new".into(), TopicConfig { has_gd: false, ..Default::default() })
            .unwrap();
        let ep = rest_endpoint(&ps, "shop", "pub=orders.**\nsub=orders.**");
        let ch = ps
            .registry
            .create_endpoint(EndpointConfig {
                name: "ws".into(),
                endpoint_type: EndpointType::Channel,
                topic_patterns: "sub=orders.**".into(),
                channel_id: Some(7),
                ..Default::default()
            })
            .unwrap();
        let sub1 = ps
            .subscribe(SubscribeParams {
                topic: "orders.new".into(),
                endpoint_id: Some(ep.id),
                ..Default::default()
            })
            .await
            .unwrap();
        let sub2 = ps
            .subscribe(SubscribeParams {
                topic: "orders.new".into(),
                channel_id: Some(7),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(sub2.endpoint_id, ch.id);

        let mut params = publish_params("orders.new", ep.id, "only-sub2");
        params.deliver_to_sk = vec![sub2.sub_key.clone()];
        ps.publish(params).await.unwrap();
        settle().await;

        assert!(ps.get_messages(&sub1.sub_key, None, None).await.unwrap().is_empty());
        assert_eq!(ps.get_messages(&sub2.sub_key, None, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn read_then_delete_single_message() {
        let ps = ctx().await;
        ps.registry
            .create_topic("orders.new".into(), TopicConfig { has_gd: false, ..Default::default() })
            .unwrap();
        let ep = rest_endpoint(&ps, "shop", "pub=orders.**\nsub=orders.**");
        let sub = ps
            .subscribe(SubscribeParams {
                topic: "orders.new".into(),
                endpoint_id: Some(ep.id),
                ..Default::default()
            })
            .await
            .unwrap();
        let receipt = ps.publish(publish_params("orders.new", ep.id, "x")).await.unwrap();
        settle().await;
        let msg_id = receipt.msg_ids[0].clone();

        let params = MessageParams {
            sub_key: sub.sub_key.clone(),
            msg_id: msg_id.clone(),
            has_gd: false,
            server_name: Some(ps.server_name.clone()),
            server_pid: Some(ps.server_pid),
        };
        assert_eq!(ps.read_message(params.clone()).await.unwrap().msg_id, msg_id);

        let mut wrong = params.clone();
        wrong.server_pid = Some(ps.server_pid + 1);
        assert!(matches!(ps.read_message(wrong).await, Err(BrokerError::BadRequest(_))));

        ps.delete_message(params.clone()).await.unwrap();
        assert!(matches!(ps.read_message(params).await, Err(BrokerError::NotFound(_))));
    }

    #[tokio::test]
    async fn update_message_in_place() {
        let ps = ctx().await;
        ps.registry
            .create_topic("orders.new".into(), TopicConfig { has_gd: false, ..Default::default() })
            .unwrap();
        let ep = rest_endpoint(&ps, "shop", "pub=orders.**\nsub=orders.**");
        let sub = ps
            .subscribe(SubscribeParams {
                topic: "orders.new".into(),
                endpoint_id: Some(ep.id),
                ..Default::default()
            })
            .await
            .unwrap();
        let receipt = ps.publish(publish_params("orders.new", ep.id, "before")).await.unwrap();
        settle().await;

        ps.update_message(
            &receipt.msg_ids[0],
            MessageUpdate { data: Some(Bytes::from_static(b"after")), ..Default::default() },
        )
        .unwrap();
        let params = MessageParams {
            sub_key: sub.sub_key.clone(),
            msg_id: receipt.msg_ids[0].clone(),
            has_gd: false,
            server_name: Some(ps.server_name.clone()),
            server_pid: Some(ps.server_pid),
        };
        assert_eq!(ps.read_message(params).await.unwrap().data, Bytes::from_static(b"after"));
    }

    #[tokio::test]
    async fn pause_and_resume_through_the_facade() {
        let ps = ctx().await;
        ps.registry.create_topic("orders.new".into(), TopicConfig::default()).unwrap();
        let ep = rest_endpoint(&ps, "shop", "sub=orders.**");
        let sub = ps
            .subscribe(SubscribeParams {
                topic: "orders.new".into(),
                endpoint_id: Some(ep.id),
                ..Default::default()
            })
            .await
            .unwrap();

        ps.pause_sub_key(&sub.sub_key).unwrap();
        assert_eq!(ps.tool.task_state(&sub.sub_key).unwrap(), TaskState::Paused);
        ps.resume_sub_key(&sub.sub_key).unwrap();
        assert_eq!(ps.tool.task_state(&sub.sub_key).unwrap(), TaskState::Running);
    }

    #[tokio::test]
    async fn delete_topic_cascades() {
        let ps = ctx().await;
        ps.registry
            .create_topic("orders.new".into(), TopicConfig { has_gd: false, ..Default::default() })
            .unwrap();
        let ep = rest_endpoint(&ps, "shop", "pub=orders.**\nsub=orders.**");
        let sub = ps
            .subscribe(SubscribeParams {
                topic: "orders.new".into(),
                endpoint_id: Some(ep.id),
                ..Default::default()
            })
            .await
            .unwrap();
        ps.publish(publish_params("orders.new", ep.id, "x")).await.unwrap();
        settle().await;

        ps.delete_topic("orders.new").await.unwrap();
        assert!(ps.registry.get_topic_by_name("orders.new").is_none());
        assert!(ps.registry.get_subscription_by_sub_key(&sub.sub_key).is_none());
        assert!(!ps.tool.handles_sub_key(&sub.sub_key));
    }
}
