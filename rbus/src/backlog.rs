//! In-RAM message backlog
//!
//! Bodies of messages published without guaranteed delivery live here, in
//! the process that accepted them. Four indices are kept mutually consistent
//! under a single short-lived lock:
//!
//! - `sub_key_to_msg_id` - which messages each subscriber queue still holds
//! - `msg_id_to_sub_key` - the reverse index, also the reference count
//! - `msg_id_to_msg` - message bodies
//! - `topic_msg_id` - which messages belong to each topic
//!
//! A message body is dropped the moment its last subscriber reference goes,
//! whether through delivery, explicit deletion, unsubscription or expiry.
//! Admission is checked per subscriber queue before insertion: a batch that
//! would push one queue past its depth limit is diverted to the overflow log
//! for that queue only, other queues proceed.
//!
//! Lookups that find the indices out of step with each other are logged as
//! warnings and treated as absence. The backlog serves live traffic, a
//! missing index entry is not worth a crash.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use bytestring::ByteString;
use itertools::Itertools;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use rbus_utils::timestamp_millis;

use crate::message::Message;
use crate::stats::Stats;
use crate::types::{HashMap, HashSet, MsgId, SubKey, TimestampMillis, TopicId};

/// Log target for messages rejected by depth admission, kept separate so
/// operators can route it to its own appender.
pub const OVERFLOW_LOG_TARGET: &str = "overflow";

/// Result of one admission round.
#[derive(Debug, Clone, Default)]
pub struct AddOutcome {
    pub admitted: Vec<SubKey>,
    pub overflowed: Vec<SubKey>,
}

/// Fields of a queued message that may be updated in place.
#[derive(Debug, Clone, Default)]
pub struct MessageUpdate {
    pub data: Option<Bytes>,
    pub priority: Option<u8>,
    /// New lifetime in milliseconds, measured from the original receive
    /// time.
    pub expiration: Option<TimestampMillis>,
    pub correl_id: Option<ByteString>,
}

#[derive(Default)]
struct Indexes {
    sub_key_to_msg_id: HashMap<SubKey, HashSet<MsgId>>,
    msg_id_to_sub_key: HashMap<MsgId, HashSet<SubKey>>,
    msg_id_to_msg: HashMap<MsgId, Arc<Message>>,
    topic_msg_id: HashMap<TopicId, HashSet<MsgId>>,
}

/// Remove `msg_id` from the set under `key`, dropping the entry when the
/// set empties.
fn remove_ref<K>(map: &mut HashMap<K, HashSet<MsgId>>, key: &K, msg_id: &MsgId)
where
    K: std::hash::Hash + Eq,
{
    let emptied = if let Some(ids) = map.get_mut(key) {
        ids.remove(msg_id);
        ids.is_empty()
    } else {
        false
    };
    if emptied {
        map.remove(key);
    }
}

impl Indexes {
    /// Remove the `sub_key` reference from `msg_id`, dropping the body and
    /// topic entry when it was the last one. Returns true when the body
    /// went away.
    fn unlink(&mut self, sub_key: &SubKey, msg_id: &MsgId) -> bool {
        remove_ref(&mut self.sub_key_to_msg_id, sub_key, msg_id);
        let last = match self.msg_id_to_sub_key.get_mut(msg_id) {
            Some(sks) => {
                sks.remove(sub_key);
                sks.is_empty()
            }
            None => {
                log::warn!("no sub_key index for msg `{}`, treating as deleted", msg_id);
                true
            }
        };
        if last {
            self.msg_id_to_sub_key.remove(msg_id);
            match self.msg_id_to_msg.remove(msg_id) {
                Some(msg) => {
                    remove_ref(&mut self.topic_msg_id, &msg.topic_id, msg_id);
                }
                None => {
                    log::warn!("msg `{}` had no body on final unlink", msg_id);
                    return false;
                }
            }
        }
        last
    }
}

pub struct InRamBacklog {
    inner: Mutex<Indexes>,
    stats: Arc<Stats>,
}

impl InRamBacklog {
    #[inline]
    pub fn new(stats: Arc<Stats>) -> Self {
        Self { inner: Mutex::new(Indexes::default()), stats }
    }

    /// Admit a batch of messages for a set of subscriber queues. Each queue
    /// is checked against `max_depth` before anything is inserted for it;
    /// a queue that cannot take the whole batch receives none of it and the
    /// batch is written to the overflow log instead.
    pub fn add_messages(
        &self,
        topic_id: TopicId,
        max_depth: usize,
        sub_keys: &[SubKey],
        msgs: &[Arc<Message>],
    ) -> AddOutcome {
        let mut out = AddOutcome::default();
        if msgs.is_empty() || sub_keys.is_empty() {
            return out;
        }
        let mut inner = self.inner.lock();
        for sub_key in sub_keys {
            let depth = inner.sub_key_to_msg_id.get(sub_key).map(|ids| ids.len()).unwrap_or(0);
            if depth + msgs.len() > max_depth {
                log::warn!(
                    target: OVERFLOW_LOG_TARGET,
                    "sub_key `{}` at depth {}/{}, rejecting {} message(s): {}",
                    sub_key,
                    depth,
                    max_depth,
                    msgs.len(),
                    msgs.iter().map(|m| &*m.msg_id).join(", ")
                );
                self.stats.overfloweds.incs(msgs.len() as isize);
                out.overflowed.push(sub_key.clone());
                continue;
            }
            for msg in msgs {
                inner.sub_key_to_msg_id.entry(sub_key.clone()).or_default().insert(msg.msg_id.clone());
                inner.msg_id_to_sub_key.entry(msg.msg_id.clone()).or_default().insert(sub_key.clone());
            }
            out.admitted.push(sub_key.clone());
        }
        // Bodies are stored once, only for messages at least one queue took.
        for msg in msgs {
            if inner.msg_id_to_sub_key.contains_key(&msg.msg_id)
                && inner.msg_id_to_msg.insert(msg.msg_id.clone(), msg.clone()).is_none()
            {
                inner.topic_msg_id.entry(topic_id).or_default().insert(msg.msg_id.clone());
                self.stats.in_ram_messages.inc();
            }
        }
        out
    }

    /// All unexpired messages queued for the given subscriber queues,
    /// deduplicated, leaving the queues untouched.
    pub fn peek_by_sub_keys(&self, sub_keys: &[SubKey], now: TimestampMillis) -> Vec<Arc<Message>> {
        let inner = self.inner.lock();
        let mut found: Vec<Arc<Message>> = Vec::new();
        for sub_key in sub_keys {
            if let Some(msg_ids) = inner.sub_key_to_msg_id.get(sub_key) {
                for msg_id in msg_ids {
                    if let Some(msg) = inner.msg_id_to_msg.get(msg_id) {
                        if !msg.is_expired(now) && !found.iter().any(|m| m.msg_id == msg.msg_id) {
                            found.push(msg.clone());
                        }
                    }
                }
            }
        }
        found
    }

    #[inline]
    pub fn get_msg(&self, msg_id: &MsgId) -> Option<Arc<Message>> {
        self.inner.lock().msg_id_to_msg.get(msg_id).cloned()
    }

    /// Drop the given messages from one subscriber queue.
    pub fn delete_by_sub_key(&self, sub_key: &SubKey, msg_ids: &[MsgId]) {
        let mut inner = self.inner.lock();
        let mut purged = 0isize;
        for msg_id in msg_ids {
            if inner.unlink(sub_key, msg_id) {
                purged += 1;
            }
        }
        self.stats.in_ram_messages.decs(purged);
    }

    /// Update a queued message in place. Returns false when the message is
    /// no longer here.
    pub fn update_msg(&self, msg_id: &MsgId, update: MessageUpdate) -> bool {
        let mut inner = self.inner.lock();
        let msg = match inner.msg_id_to_msg.get(msg_id) {
            Some(msg) => msg,
            None => return false,
        };
        let mut msg = Message::clone(msg);
        if let Some(data) = update.data {
            msg.size = data.len();
            msg.data = data;
        }
        if let Some(priority) = update.priority {
            msg.priority = priority;
        }
        if let Some(expiration) = update.expiration {
            msg.expiration = expiration;
            msg.expiration_time = msg.recv_time + expiration;
        }
        if let Some(correl_id) = update.correl_id {
            msg.correl_id = Some(correl_id);
        }
        inner.msg_id_to_msg.insert(msg_id.clone(), Arc::new(msg));
        true
    }

    /// Drop every reference the given subscriber queues hold against the
    /// topic, purging bodies that lose their last reference. Other queues
    /// keep their view of the same messages.
    pub fn unsubscribe(&self, topic_id: TopicId, sub_keys: &[SubKey]) {
        let mut inner = self.inner.lock();
        let mut purged = 0isize;
        for sub_key in sub_keys {
            let msg_ids = match inner.sub_key_to_msg_id.get(sub_key) {
                Some(ids) => ids.iter().cloned().collect::<Vec<_>>(),
                None => continue,
            };
            for msg_id in msg_ids {
                let in_topic =
                    inner.topic_msg_id.get(&topic_id).map(|ids| ids.contains(&msg_id)).unwrap_or(false);
                if in_topic && inner.unlink(sub_key, &msg_id) {
                    purged += 1;
                }
            }
        }
        self.stats.in_ram_messages.decs(purged);
    }

    /// Drop every queued message belonging to a topic, for all subscribers.
    pub fn clear_topic(&self, topic_id: TopicId) -> usize {
        let mut inner = self.inner.lock();
        let msg_ids = match inner.topic_msg_id.remove(&topic_id) {
            Some(ids) => ids,
            None => return 0,
        };
        let removed = msg_ids.len();
        for msg_id in &msg_ids {
            if let Some(sub_keys) = inner.msg_id_to_sub_key.remove(msg_id) {
                for sub_key in sub_keys {
                    remove_ref(&mut inner.sub_key_to_msg_id, &sub_key, msg_id);
                }
            }
            inner.msg_id_to_msg.remove(msg_id);
        }
        self.stats.in_ram_messages.decs(removed as isize);
        removed
    }

    #[inline]
    pub fn topic_depth(&self, topic_id: TopicId) -> usize {
        self.inner.lock().topic_msg_id.get(&topic_id).map(|ids| ids.len()).unwrap_or(0)
    }

    #[inline]
    pub fn sub_key_depth(&self, sub_key: &SubKey) -> usize {
        self.inner.lock().sub_key_to_msg_id.get(sub_key).map(|ids| ids.len()).unwrap_or(0)
    }

    /// One expiry sweep. Removes every message whose expiry instant has
    /// passed, along with all its queue references. Returns how many bodies
    /// went away.
    pub fn sweep_expired_once(&self, now: TimestampMillis) -> usize {
        let mut inner = self.inner.lock();
        let expired = inner
            .msg_id_to_msg
            .values()
            .filter(|m| m.is_expired(now))
            .map(|m| (m.msg_id.clone(), m.topic_name.clone(), m.published_by))
            .collect::<Vec<_>>();
        for (msg_id, topic_name, published_by) in &expired {
            log::debug!(
                "expiring msg `{}`, topic `{}`, published by endpoint `{}`",
                msg_id,
                topic_name,
                published_by
            );
            if let Some(sub_keys) = inner.msg_id_to_sub_key.remove(msg_id) {
                for sub_key in sub_keys {
                    remove_ref(&mut inner.sub_key_to_msg_id, &sub_key, msg_id);
                }
            }
            if let Some(msg) = inner.msg_id_to_msg.remove(msg_id) {
                remove_ref(&mut inner.topic_msg_id, &msg.topic_id, msg_id);
            }
        }
        let removed = expired.len();
        if removed > 0 {
            self.stats.in_ram_messages.decs(removed as isize);
            self.stats.expireds.incs(removed as isize);
            log::info!("expired {} in-RAM message(s)", removed);
        }
        removed
    }

    /// Spawn the periodic expiry sweep. The loop runs until the backlog is
    /// dropped elsewhere and the handle aborted; a sweep itself cannot fail.
    pub fn run_cleanup(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let backlog = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                backlog.sweep_expired_once(timestamp_millis());
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytestring::ByteString;

    fn mk(msg_id: &str, topic_id: TopicId, now: TimestampMillis, expiration: TimestampMillis) -> Arc<Message> {
        Arc::new(Message {
            msg_id: ByteString::from(msg_id.to_owned()),
            topic_id,
            topic_name: "orders.processed".into(),
            data: bytes::Bytes::from_static(b"x"),
            size: 1,
            priority: 5,
            pub_time: now,
            recv_time: now,
            expiration,
            expiration_time: now + expiration,
            correl_id: None,
            in_reply_to: None,
            ext_client_id: None,
            deliver_to_sk: Vec::new(),
            published_by: 1,
            has_gd: false,
            server_name: "node-1".into(),
            server_pid: 1,
        })
    }

    fn backlog() -> InRamBacklog {
        InRamBacklog::new(Arc::new(Stats::new()))
    }

    #[test]
    fn depth_admission_is_per_sub_key() {
        let b = backlog();
        let sk1 = SubKey::from("psk.rest.1");
        let sk2 = SubKey::from("psk.rest.2");
        // sk1 already holds two messages, sk2 none
        b.add_messages(1, 3, &[sk1.clone()], &[mk("m1", 1, 100, 60_000), mk("m2", 1, 100, 60_000)]);

        let batch = vec![mk("m3", 1, 101, 60_000), mk("m4", 1, 101, 60_000)];
        let out = b.add_messages(1, 3, &[sk1.clone(), sk2.clone()], &batch);
        assert_eq!(out.overflowed, vec![sk1.clone()]);
        assert_eq!(out.admitted, vec![sk2.clone()]);
        assert_eq!(b.sub_key_depth(&sk1), 2);
        assert_eq!(b.sub_key_depth(&sk2), 2);
    }

    #[test]
    fn overflow_rejects_whole_batch() {
        let b = backlog();
        let sk = SubKey::from("psk.rest.1");
        let msgs: Vec<_> = (0..5).map(|i| mk(&format!("m{}", i), 1, 100 + i, 60_000)).collect();
        // max_depth 3, batches of one: exactly three get in
        let mut overflowed = 0;
        for m in &msgs {
            let out = b.add_messages(1, 3, &[sk.clone()], std::slice::from_ref(m));
            overflowed += out.overflowed.len();
        }
        assert_eq!(b.sub_key_depth(&sk), 3);
        assert_eq!(overflowed, 2);
        assert_eq!(b.topic_depth(1), 3);
    }

    #[test]
    fn body_dropped_with_last_reference() {
        let b = backlog();
        let sk1 = SubKey::from("psk.rest.1");
        let sk2 = SubKey::from("psk.rest.2");
        let m = mk("m1", 1, 100, 60_000);
        b.add_messages(1, 100, &[sk1.clone(), sk2.clone()], &[m.clone()]);
        assert!(b.get_msg(&m.msg_id).is_some());

        b.delete_by_sub_key(&sk1, &[m.msg_id.clone()]);
        assert!(b.get_msg(&m.msg_id).is_some(), "sk2 still references the body");

        b.delete_by_sub_key(&sk2, &[m.msg_id.clone()]);
        assert!(b.get_msg(&m.msg_id).is_none());
        assert_eq!(b.topic_depth(1), 0);
    }

    #[test]
    fn peek_skips_expired_and_leaves_queues_alone() {
        let b = backlog();
        let sk = SubKey::from("psk.rest.1");
        b.add_messages(1, 100, &[sk.clone()], &[mk("live", 1, 100, 60_000), mk("dead", 1, 100, 10)]);
        let got = b.peek_by_sub_keys(&[sk.clone()], 500);
        assert_eq!(got.len(), 1);
        assert_eq!(&*got[0].msg_id, "live");
        assert_eq!(b.sub_key_depth(&sk), 2);
    }

    #[test]
    fn expiry_sweep_is_idempotent() {
        let b = backlog();
        let sk = SubKey::from("psk.rest.1");
        b.add_messages(1, 100, &[sk.clone()], &[mk("m1", 1, 100, 10), mk("m2", 1, 100, 60_000)]);
        assert_eq!(b.sweep_expired_once(500), 1);
        assert_eq!(b.sweep_expired_once(500), 0);
        assert_eq!(b.sub_key_depth(&sk), 1);
    }

    #[test]
    fn unsubscribe_leaves_other_sub_keys_untouched() {
        let b = backlog();
        let sk_a = SubKey::from("psk.rest.a");
        let sk_b = SubKey::from("psk.rest.b");
        b.add_messages(1, 100, &[sk_a.clone(), sk_b.clone()], &[mk("m1", 1, 100, 60_000)]);

        b.unsubscribe(1, &[sk_a.clone()]);
        assert_eq!(b.sub_key_depth(&sk_a), 0);
        assert_eq!(b.sub_key_depth(&sk_b), 1);
        let got = b.peek_by_sub_keys(&[sk_b], 200);
        assert_eq!(got.len(), 1);
    }

    #[test]
    fn unsubscribe_only_touches_the_given_topic() {
        let b = backlog();
        let sk = SubKey::from("psk.rest.1");
        b.add_messages(1, 100, &[sk.clone()], &[mk("t1", 1, 100, 60_000)]);
        b.add_messages(2, 100, &[sk.clone()], &[mk("t2", 2, 100, 60_000)]);
        b.unsubscribe(1, &[sk.clone()]);
        assert_eq!(b.sub_key_depth(&sk), 1);
        assert_eq!(b.topic_depth(2), 1);
    }

    #[test]
    fn update_in_place() {
        let b = backlog();
        let sk = SubKey::from("psk.rest.1");
        b.add_messages(1, 100, &[sk.clone()], &[mk("m1", 1, 100, 60_000)]);
        let ok = b.update_msg(
            &MsgId::from("m1"),
            MessageUpdate {
                data: Some(bytes::Bytes::from_static(b"larger payload")),
                priority: Some(9),
                expiration: Some(120_000),
                ..Default::default()
            },
        );
        assert!(ok);
        let m = b.get_msg(&MsgId::from("m1")).unwrap();
        assert_eq!(m.priority, 9);
        assert_eq!(m.size, 14);
        assert_eq!(m.expiration_time, 100 + 120_000);
        assert!(!b.update_msg(&MsgId::from("nope"), MessageUpdate::default()));
    }

    #[test]
    fn clear_topic_drops_everything() {
        let b = backlog();
        let sk = SubKey::from("psk.rest.1");
        b.add_messages(1, 100, &[sk.clone()], &[mk("m1", 1, 100, 60_000), mk("m2", 1, 100, 60_000)]);
        assert_eq!(b.clear_topic(1), 2);
        assert_eq!(b.topic_depth(1), 0);
        assert_eq!(b.sub_key_depth(&sk), 0);
        assert_eq!(b.clear_topic(1), 0);
    }
}
