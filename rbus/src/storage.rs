//! Durable storage contract for guaranteed-delivery messages
//!
//! The broker core never talks SQL itself. Everything the guaranteed
//! delivery path needs from a database is behind [`GdStorage`]; the backend
//! guarantees that a saved row survives process restart and that delivery
//! confirmations are recorded durably. [`NullGdStorage`] is the no-op
//! default, [`MemGdStorage`] keeps rows in process memory and backs the
//! tests.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::Result;
use crate::message::{GdRow, Message};
use crate::types::{HashMap, MsgId, SubKey, TimestampMillis, TopicId};

#[async_trait]
pub trait GdStorage: Sync + Send {
    /// Persist new subscriber-queue rows.
    async fn save(&self, rows: Vec<GdRow>) -> Result<()> {
        let _ = rows;
        Ok(())
    }

    /// Stage a message on a topic, to be handed to subscribers that arrive
    /// later (see [`move_to_sub_queue`](Self::move_to_sub_queue)).
    async fn stage_on_topic(&self, topic_id: TopicId, msgs: Vec<Message>) -> Result<()> {
        let _ = (topic_id, msgs);
        Ok(())
    }

    /// Create subscriber-queue rows for every unexpired message currently
    /// staged on the topic. Returns how many rows were created. Called at
    /// subscription time.
    async fn move_to_sub_queue(
        &self,
        topic_id: TopicId,
        sub_key: &SubKey,
        now: TimestampMillis,
    ) -> Result<usize> {
        let _ = (topic_id, sub_key, now);
        Ok(0)
    }

    /// Fetch undelivered rows for a set of subscriber queues in one query.
    /// Only rows published after `min_pub_time` and no later than
    /// `pub_time_max` are returned; `ignore` lists message ids already held
    /// in delivery lists.
    async fn fetch_by_sub_keys(
        &self,
        sub_keys: &[SubKey],
        min_pub_time: TimestampMillis,
        pub_time_max: TimestampMillis,
        ignore: &[MsgId],
    ) -> Result<Vec<GdRow>> {
        let _ = (sub_keys, min_pub_time, pub_time_max, ignore);
        Ok(Vec::new())
    }

    /// Fetch every undelivered row for one subscriber queue, up to
    /// `pub_time_max`. Called once when a delivery task starts.
    async fn fetch_initial(&self, sub_key: &SubKey, pub_time_max: TimestampMillis) -> Result<Vec<GdRow>> {
        let _ = (sub_key, pub_time_max);
        Ok(Vec::new())
    }

    /// Fetch specific rows of one subscriber queue by message id.
    async fn fetch_by_msg_ids(&self, sub_key: &SubKey, msg_ids: &[MsgId]) -> Result<Vec<GdRow>> {
        let _ = (sub_key, msg_ids);
        Ok(Vec::new())
    }

    /// Record that the given messages reached the subscriber.
    async fn confirm_delivered(
        &self,
        sub_key: &SubKey,
        msg_ids: &[MsgId],
        now: TimestampMillis,
    ) -> Result<()> {
        let _ = (sub_key, msg_ids, now);
        Ok(())
    }

    /// Mark rows for deletion without waiting for delivery.
    async fn set_to_delete(&self, sub_key: &SubKey, msg_ids: &[MsgId], now: TimestampMillis) -> Result<()> {
        let _ = (sub_key, msg_ids, now);
        Ok(())
    }

    /// Drop every row belonging to one subscriber queue.
    async fn delete_sub_queue(&self, sub_key: &SubKey) -> Result<()> {
        let _ = sub_key;
        Ok(())
    }

    /// Pending (saved, neither delivered nor marked for deletion) row count
    /// for one subscriber queue.
    async fn queue_depth(&self, sub_key: &SubKey) -> Result<usize> {
        let _ = sub_key;
        Ok(0)
    }
}

/// No-op storage for deployments that run without guaranteed delivery.
pub struct NullGdStorage {}

impl NullGdStorage {
    #[inline]
    pub fn instance() -> NullGdStorage {
        NullGdStorage {}
    }
}

#[async_trait]
impl GdStorage for NullGdStorage {}

#[derive(Default)]
struct MemGdStorageInner {
    staged: HashMap<TopicId, Vec<Message>>,
    queues: HashMap<SubKey, Vec<GdRow>>,
}

/// Process-memory storage backend. Rows do not survive restart; useful for
/// embedding without a database and as the test double.
#[derive(Default)]
pub struct MemGdStorage {
    inner: Mutex<MemGdStorageInner>,
}

impl MemGdStorage {
    #[inline]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl GdStorage for MemGdStorage {
    async fn save(&self, rows: Vec<GdRow>) -> Result<()> {
        let mut inner = self.inner.lock();
        for row in rows {
            inner.queues.entry(row.sub_key.clone()).or_default().push(row);
        }
        Ok(())
    }

    async fn stage_on_topic(&self, topic_id: TopicId, msgs: Vec<Message>) -> Result<()> {
        self.inner.lock().staged.entry(topic_id).or_default().extend(msgs);
        Ok(())
    }

    async fn move_to_sub_queue(
        &self,
        topic_id: TopicId,
        sub_key: &SubKey,
        now: TimestampMillis,
    ) -> Result<usize> {
        let mut inner = self.inner.lock();
        let staged = inner
            .staged
            .get(&topic_id)
            .map(|msgs| msgs.iter().filter(|m| !m.is_expired(now)).cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        let moved = staged.len();
        if moved > 0 {
            let rows = staged.into_iter().map(|m| GdRow::new(sub_key.clone(), m)).collect::<Vec<_>>();
            inner.queues.entry(sub_key.clone()).or_default().extend(rows);
        }
        Ok(moved)
    }

    async fn fetch_by_sub_keys(
        &self,
        sub_keys: &[SubKey],
        min_pub_time: TimestampMillis,
        pub_time_max: TimestampMillis,
        ignore: &[MsgId],
    ) -> Result<Vec<GdRow>> {
        let inner = self.inner.lock();
        let mut found = Vec::new();
        for sub_key in sub_keys {
            if let Some(rows) = inner.queues.get(sub_key) {
                found.extend(
                    rows.iter()
                        .filter(|r| {
                            !r.is_delivered
                                && !r.is_to_delete
                                && r.msg.pub_time > min_pub_time
                                && r.msg.pub_time <= pub_time_max
                                && !ignore.contains(&r.msg.msg_id)
                        })
                        .cloned(),
                );
            }
        }
        Ok(found)
    }

    async fn fetch_initial(&self, sub_key: &SubKey, pub_time_max: TimestampMillis) -> Result<Vec<GdRow>> {
        self.fetch_by_sub_keys(std::slice::from_ref(sub_key), 0, pub_time_max, &[]).await
    }

    async fn fetch_by_msg_ids(&self, sub_key: &SubKey, msg_ids: &[MsgId]) -> Result<Vec<GdRow>> {
        let inner = self.inner.lock();
        Ok(inner
            .queues
            .get(sub_key)
            .map(|rows| rows.iter().filter(|r| msg_ids.contains(&r.msg.msg_id)).cloned().collect())
            .unwrap_or_default())
    }

    async fn confirm_delivered(
        &self,
        sub_key: &SubKey,
        msg_ids: &[MsgId],
        _now: TimestampMillis,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(rows) = inner.queues.get_mut(sub_key) {
            for row in rows.iter_mut().filter(|r| msg_ids.contains(&r.msg.msg_id)) {
                row.is_delivered = true;
            }
        }
        Ok(())
    }

    async fn set_to_delete(&self, sub_key: &SubKey, msg_ids: &[MsgId], _now: TimestampMillis) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(rows) = inner.queues.get_mut(sub_key) {
            for row in rows.iter_mut().filter(|r| msg_ids.contains(&r.msg.msg_id)) {
                row.is_to_delete = true;
            }
        }
        Ok(())
    }

    async fn delete_sub_queue(&self, sub_key: &SubKey) -> Result<()> {
        self.inner.lock().queues.remove(sub_key);
        Ok(())
    }

    async fn queue_depth(&self, sub_key: &SubKey) -> Result<usize> {
        Ok(self
            .inner
            .lock()
            .queues
            .get(sub_key)
            .map(|rows| rows.iter().filter(|r| !r.is_delivered && !r.is_to_delete).count())
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use bytestring::ByteString;

    fn msg(msg_id: &str, pub_time: TimestampMillis) -> Message {
        Message {
            msg_id: ByteString::from(msg_id.to_owned()),
            topic_id: 1,
            topic_name: "orders.processed".into(),
            data: Bytes::from_static(b"x"),
            size: 1,
            priority: 5,
            pub_time,
            recv_time: pub_time,
            expiration: 60_000,
            expiration_time: pub_time + 60_000,
            correl_id: None,
            in_reply_to: None,
            ext_client_id: None,
            deliver_to_sk: Vec::new(),
            published_by: 1,
            has_gd: true,
            server_name: "node-1".into(),
            server_pid: 1,
        }
    }

    #[tokio::test]
    async fn save_fetch_confirm() {
        let s = MemGdStorage::new();
        let sk = SubKey::from("psk.rest.1");
        s.save(vec![GdRow::new(sk.clone(), msg("m1", 100)), GdRow::new(sk.clone(), msg("m2", 200))])
            .await
            .unwrap();
        assert_eq!(s.queue_depth(&sk).await.unwrap(), 2);

        let rows = s.fetch_by_sub_keys(&[sk.clone()], 0, 1000, &[]).await.unwrap();
        assert_eq!(rows.len(), 2);

        s.confirm_delivered(&sk, &[MsgId::from("m1")], 300).await.unwrap();
        assert_eq!(s.queue_depth(&sk).await.unwrap(), 1);
        let rows = s.fetch_by_sub_keys(&[sk.clone()], 0, 1000, &[]).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(&*rows[0].msg.msg_id, "m2");
    }

    #[tokio::test]
    async fn fetch_window_and_ignore_list() {
        let s = MemGdStorage::new();
        let sk = SubKey::from("psk.rest.1");
        s.save(vec![
            GdRow::new(sk.clone(), msg("old", 50)),
            GdRow::new(sk.clone(), msg("in", 150)),
            GdRow::new(sk.clone(), msg("ignored", 160)),
            GdRow::new(sk.clone(), msg("future", 900)),
        ])
        .await
        .unwrap();
        let rows =
            s.fetch_by_sub_keys(&[sk.clone()], 100, 500, &[MsgId::from("ignored")]).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(&*rows[0].msg.msg_id, "in");
    }

    #[tokio::test]
    async fn staged_messages_seed_new_subscribers() {
        let s = MemGdStorage::new();
        let sk = SubKey::from("psk.rest.1");
        s.stage_on_topic(1, vec![msg("m1", 100), msg("m2", 200)]).await.unwrap();
        assert_eq!(s.move_to_sub_queue(1, &sk, 300).await.unwrap(), 2);
        assert_eq!(s.queue_depth(&sk).await.unwrap(), 2);
        // expired staged messages are not moved
        let sk2 = SubKey::from("psk.rest.2");
        assert_eq!(s.move_to_sub_queue(1, &sk2, 100 + 120_000).await.unwrap(), 0);
    }
}
