//! Per-process delivery coordinator
//!
//! A [`PubSubTool`] owns every delivery task running in this process and
//! routes new-message notifications to them. Two levels of locking apply:
//!
//! - the tool-wide lock serializes the shared guaranteed-delivery fetch, so
//!   a burst of publications turns into one storage query instead of one
//!   per subscriber;
//! - one lock per sub_key serializes mutation of that subscriber's delivery
//!   list against the task delivering from it.
//!
//! The two levels never nest: the tool-wide lock is released before any
//! per-sub_key lock is taken, and never taken while one is held.
//!
//! The shared fetch uses a watermark per sub_key (`last_gd_run`): the query
//! window starts at the smallest watermark of the notified sub_keys, pushed
//! back by a safety delta to absorb storage commit reordering, and ends at
//! the notification's `pub_time_max`. Message ids already present in
//! delivery lists are passed as an ignore list, which makes the overlap
//! harmless. Watermarks only advance for sub_keys that actually received
//! rows.

use std::sync::Arc;

use futures::future::join_all;
use tokio::task::JoinHandle;

use rbus_utils::timestamp_millis;

use crate::backlog::InRamBacklog;
use crate::error::{BrokerError, Result};
use crate::message::{Message, MessageRef};
use crate::registry::Subscription;
use crate::stats::Stats;
use crate::storage::GdStorage;
use crate::task::{DeliveryList, DeliveryOpts, DeliveryTask, DeliveryTransport, TaskState};
use crate::types::{DashMap, DashSet, MsgId, NodeName, SubKey, TimestampMillis, TopicId, TopicName};

/// How far behind the smallest watermark the shared fetch window starts.
const GD_FETCH_SAFETY_DELTA: TimestampMillis = 60_000;

/// Notification that a publication added messages for a set of sub_keys.
#[derive(Debug, Clone)]
pub struct NewMessagesCtx {
    pub topic_id: TopicId,
    pub topic_name: TopicName,
    pub has_gd: bool,
    pub sub_keys: Vec<SubKey>,
    /// Bodies already admitted to the in-RAM backlog.
    pub non_gd_msgs: Vec<Arc<Message>>,
    /// Upper bound on the publication time of everything this notification
    /// covers.
    pub pub_time_max: TimestampMillis,
}

struct SubEntry {
    lock: Arc<tokio::sync::Mutex<()>>,
    list: Arc<DeliveryList>,
    task: Arc<DeliveryTask>,
    handle: JoinHandle<()>,
}

pub struct PubSubTool {
    pub server_name: NodeName,
    pub server_pid: u32,
    main_lock: tokio::sync::Mutex<()>,
    sub_keys: DashSet<SubKey>,
    entries: DashMap<SubKey, Arc<SubEntry>>,
    last_gd_run: DashMap<SubKey, TimestampMillis>,
    storage: Arc<dyn GdStorage>,
    backlog: Arc<InRamBacklog>,
    transport: Option<Arc<dyn DeliveryTransport>>,
    opts: DeliveryOpts,
    stats: Arc<Stats>,
}

impl PubSubTool {
    pub fn new(
        server_name: NodeName,
        server_pid: u32,
        storage: Arc<dyn GdStorage>,
        backlog: Arc<InRamBacklog>,
        transport: Option<Arc<dyn DeliveryTransport>>,
        opts: DeliveryOpts,
        stats: Arc<Stats>,
    ) -> Arc<Self> {
        Arc::new(Self {
            server_name,
            server_pid,
            main_lock: tokio::sync::Mutex::new(()),
            sub_keys: DashSet::default(),
            entries: DashMap::default(),
            last_gd_run: DashMap::default(),
            storage,
            backlog,
            transport,
            opts,
            stats,
        })
    }

    #[inline]
    pub fn handles_sub_key(&self, sub_key: &SubKey) -> bool {
        self.sub_keys.contains(sub_key)
    }

    #[inline]
    pub fn sub_key_count(&self) -> usize {
        self.sub_keys.len()
    }

    /// Register a subscription with this process: create its delivery list
    /// and task, start the task, and seed the list with whatever already
    /// waits for the sub_key, durable rows and in-RAM bodies alike.
    pub async fn add_sub_key(&self, sub: &Subscription) -> Result<()> {
        let _guard = self.main_lock.lock().await;
        if self.sub_keys.contains(&sub.sub_key) {
            return Err(BrokerError::bad_request(format!("sub_key `{}` already registered", sub.sub_key)));
        }
        let sk_lock = Arc::new(tokio::sync::Mutex::new(()));
        let list = Arc::new(DeliveryList::new());

        // Seed before the task starts; nothing else can see this list yet.
        let now = timestamp_millis();
        if sub.has_gd {
            let rows = self.storage.fetch_initial(&sub.sub_key, now).await?;
            if !rows.is_empty() {
                let n = list.extend(rows.iter().map(|r| MessageRef::Gd(r.gd_ref())));
                log::info!("sub_key `{}`, enqueued {} initial message(s)", sub.sub_key, n);
            }
        }
        // Bodies admitted to the backlog before this registration, e.g. by a
        // publication racing the subscription, would otherwise sit unseen
        // until they expire.
        let queued = self.backlog.peek_by_sub_keys(std::slice::from_ref(&sub.sub_key), now);
        if !queued.is_empty() {
            let n = list.extend(queued.into_iter().map(MessageRef::NonGd));
            log::info!("sub_key `{}`, enqueued {} backlog message(s)", sub.sub_key, n);
        }

        let task = Arc::new(DeliveryTask::new(
            sub.sub_key.clone(),
            sub.topic_name.clone(),
            list.clone(),
            sk_lock.clone(),
            self.transport.clone(),
            self.storage.clone(),
            self.backlog.clone(),
            self.opts.clone(),
            self.stats.clone(),
        ));
        let handle = task.spawn();
        task.start();
        self.last_gd_run.insert(sub.sub_key.clone(), now);
        self.entries.insert(sub.sub_key.clone(), Arc::new(SubEntry { lock: sk_lock, list, task, handle }));
        self.sub_keys.insert(sub.sub_key.clone());
        log::debug!("sub_key `{}` registered, topic `{}`", sub.sub_key, sub.topic_name);
        Ok(())
    }

    /// Tear down one subscriber: stop its task and drop all of its state in
    /// one critical section. The in-RAM backlog references are purged by
    /// the caller as part of the unsubscription.
    pub async fn remove_sub_key(&self, sub_key: &SubKey) {
        let _guard = self.main_lock.lock().await;
        self.sub_keys.remove(sub_key);
        self.last_gd_run.remove(sub_key);
        if let Some((_, entry)) = self.entries.remove(sub_key) {
            entry.task.stop();
            entry.handle.abort();
            entry.list.clear();
            log::debug!("sub_key `{}` removed", sub_key);
        }
    }

    /// Route a publication notification. Returns immediately; the work runs
    /// on a spawned task so publishers never wait for delivery bookkeeping.
    pub fn handle_new_messages(self: &Arc<Self>, ctx: NewMessagesCtx) {
        let tool = self.clone();
        tokio::spawn(async move {
            tool.process_new_messages(ctx).await;
        });
    }

    async fn process_new_messages(&self, ctx: NewMessagesCtx) {
        let sub_keys =
            ctx.sub_keys.iter().filter(|sk| self.handles_sub_key(sk)).cloned().collect::<Vec<_>>();
        if sub_keys.is_empty() {
            return;
        }
        if ctx.has_gd {
            if let Err(e) = self.fetch_gd_messages(&sub_keys, ctx.pub_time_max).await {
                log::warn!("topic `{}`, shared delivery fetch failed, {:?}", ctx.topic_name, e);
            }
        }
        if !ctx.non_gd_msgs.is_empty() {
            join_all(sub_keys.iter().map(|sk| self.enqueue_non_gd(sk, &ctx.non_gd_msgs))).await;
        }
        for sub_key in &sub_keys {
            if let Some(entry) = self.entries.get(sub_key) {
                entry.task.wakeup();
            }
        }
    }

    /// One storage query on behalf of every notified sub_key. The tool-wide
    /// lock covers the query only and is released before any per-sub_key
    /// lock is taken, so a stalled subscriber cannot hold up the rest of
    /// the process.
    async fn fetch_gd_messages(&self, sub_keys: &[SubKey], pub_time_max: TimestampMillis) -> Result<()> {
        let rows = {
            let _guard = self.main_lock.lock().await;

            let min_last_run = sub_keys
                .iter()
                .map(|sk| self.last_gd_run.get(sk).map(|t| *t).unwrap_or(0))
                .min()
                .unwrap_or(0);
            let min_pub_time = (min_last_run - GD_FETCH_SAFETY_DELTA).max(0);

            let mut ignore: Vec<MsgId> = Vec::new();
            for sub_key in sub_keys {
                if let Some(entry) = self.entries.get(sub_key) {
                    ignore.extend(entry.list.msg_ids());
                }
            }

            self.storage.fetch_by_sub_keys(sub_keys, min_pub_time, pub_time_max, &ignore).await?
        };
        if rows.is_empty() {
            return Ok(());
        }
        log::debug!("fetched {} delivery row(s) for {} sub_key(s)", rows.len(), sub_keys.len());

        for sub_key in sub_keys {
            let refs = rows
                .iter()
                .filter(|r| &r.sub_key == sub_key)
                .map(|r| MessageRef::Gd(r.gd_ref()))
                .collect::<Vec<_>>();
            if refs.is_empty() {
                continue;
            }
            if let Some(entry) = self.entries.get(sub_key).map(|e| e.clone()) {
                let _sk = entry.lock.lock().await;
                entry.list.extend(refs);
                self.last_gd_run.insert(sub_key.clone(), pub_time_max);
            }
        }
        Ok(())
    }

    async fn enqueue_non_gd(&self, sub_key: &SubKey, msgs: &[Arc<Message>]) {
        let entry = match self.entries.get(sub_key).map(|e| e.clone()) {
            Some(e) => e,
            None => return,
        };
        let _sk = entry.lock.lock().await;
        entry.list.extend(
            msgs.iter().filter(|m| m.may_deliver_to(sub_key)).map(|m| MessageRef::NonGd((*m).clone())),
        );
    }

    fn entry(&self, sub_key: &SubKey) -> Result<Arc<SubEntry>> {
        self.entries
            .get(sub_key)
            .map(|e| e.clone())
            .ok_or_else(|| BrokerError::not_found(format!("sub_key `{}`", sub_key)))
    }

    /// Get-and-delete up to `max_messages` / `max_len` bytes for one
    /// subscriber, in delivery order.
    pub async fn pull_messages(
        &self,
        sub_key: &SubKey,
        max_messages: usize,
        max_len: usize,
    ) -> Result<Vec<Message>> {
        self.entry(sub_key)?.task.pull_messages(max_messages, max_len).await
    }

    /// Resolve queued messages without consuming them.
    pub async fn read_messages(&self, sub_key: &SubKey, max_messages: usize) -> Result<Vec<Message>> {
        self.entry(sub_key)?.task.read_messages(max_messages).await
    }

    pub async fn delete_messages(&self, sub_key: &SubKey, msg_ids: &[MsgId]) -> Result<()> {
        self.entry(sub_key)?.task.delete_messages(msg_ids).await
    }

    /// `(gd, non_gd)` delivery-list depth.
    pub fn get_queue_depth(&self, sub_key: &SubKey) -> Result<(usize, usize)> {
        Ok(self.entry(sub_key)?.task.queue_depth())
    }

    pub fn task_state(&self, sub_key: &SubKey) -> Result<TaskState> {
        Ok(self.entry(sub_key)?.task.state())
    }

    pub fn pause_sub_key(&self, sub_key: &SubKey) -> Result<()> {
        self.entry(sub_key)?.task.pause();
        Ok(())
    }

    pub fn resume_sub_key(&self, sub_key: &SubKey) -> Result<()> {
        self.entry(sub_key)?.task.resume();
        Ok(())
    }
}
