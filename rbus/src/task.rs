//! Per-subscriber delivery
//!
//! Each subscription key gets one [`DeliveryTask`] owning one
//! [`DeliveryList`], an ordered view over everything queued for that
//! subscriber. The list holds [`MessageRef`]s, not bodies: in-RAM messages
//! carry their body along, guaranteed-delivery entries are resolved against
//! storage in a batch right before they are handed to the transport.
//!
//! A task moves through `Created -> Running <-> Paused -> Stopped`;
//! `Stopped` is terminal and `stop` is idempotent. The run loop observes a
//! requested stop at the batch boundary, so stopping never deadlocks with a
//! delivery in flight. Retry backoffs happen between batches with the
//! subscriber lock released.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use rbus_utils::timestamp_millis;

use crate::backlog::InRamBacklog;
use crate::error::Result;
use crate::message::{Message, MessageRef, OrderKey, WireMessage};
use crate::stats::Stats;
use crate::storage::GdStorage;
use crate::types::{HashSet, MsgId, SubKey, TimestampMillis, TopicName};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Running,
    Paused,
    Stopped,
}

#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("connection error, {0}")]
    Connection(String),
    #[error("{0}")]
    Other(String),
}

impl DeliveryError {
    #[inline]
    pub fn is_connection(&self) -> bool {
        matches!(self, DeliveryError::Connection(_))
    }
}

/// How resolved message batches leave the broker. Implemented by the
/// embedding application per endpoint kind; pull-only subscribers have no
/// transport at all.
#[async_trait]
pub trait DeliveryTransport: Sync + Send {
    async fn deliver(
        &self,
        sub_key: &SubKey,
        topic_name: &TopicName,
        batch: Vec<WireMessage>,
    ) -> std::result::Result<(), DeliveryError>;
}

/// Delivery tuning, taken from topic and broker configuration when the
/// task is created.
#[derive(Debug, Clone)]
pub struct DeliveryOpts {
    pub batch_size: usize,
    pub delivery_interval: Duration,
    pub wait_sock_err: Duration,
    pub wait_non_sock_err: Duration,
    /// 0 means unlimited attempts.
    pub max_retry: usize,
    /// Whether a failed batch stays queued for retry (true) or is dropped
    /// (false).
    pub err_should_block: bool,
}

impl Default for DeliveryOpts {
    fn default() -> Self {
        Self {
            batch_size: 500,
            delivery_interval: Duration::from_secs(2),
            wait_sock_err: Duration::from_secs(10),
            wait_non_sock_err: Duration::from_secs(30),
            max_retry: 0,
            err_should_block: true,
        }
    }
}

struct Entry {
    mref: MessageRef,
    delivery_count: usize,
}

#[derive(Default)]
struct ListInner {
    by_order: BTreeMap<OrderKey, Entry>,
    ids: HashSet<MsgId>,
    gd: usize,
    non_gd: usize,
}

/// Ordered set of message references queued for one subscriber: highest
/// priority first, then oldest publication time. Duplicate message ids are
/// rejected so a re-fetch can never double-queue a message.
#[derive(Default)]
pub struct DeliveryList {
    inner: Mutex<ListInner>,
}

impl DeliveryList {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert one reference; false when the message id is already queued.
    pub fn push(&self, mref: MessageRef) -> bool {
        let mut inner = self.inner.lock();
        if !inner.ids.insert(mref.msg_id().clone()) {
            return false;
        }
        if mref.is_gd() {
            inner.gd += 1;
        } else {
            inner.non_gd += 1;
        }
        inner.by_order.insert(mref.order_key(), Entry { mref, delivery_count: 0 });
        true
    }

    /// Insert many references, returning how many were new.
    pub fn extend<I: IntoIterator<Item = MessageRef>>(&self, mrefs: I) -> usize {
        mrefs.into_iter().filter(|m| self.push(m.clone())).count()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.lock().by_order.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().by_order.is_empty()
    }

    /// `(gd, non_gd)` entry counts.
    #[inline]
    pub fn counts(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        (inner.gd, inner.non_gd)
    }

    /// Ids of every queued message, used as the ignore list for shared
    /// storage fetches.
    #[inline]
    pub fn msg_ids(&self) -> Vec<MsgId> {
        self.inner.lock().ids.iter().cloned().collect()
    }

    #[inline]
    pub fn contains(&self, msg_id: &MsgId) -> bool {
        self.inner.lock().ids.contains(msg_id)
    }

    /// Clone out the first `max` references in delivery order, leaving the
    /// list untouched.
    pub fn peek(&self, max: usize) -> Vec<(MessageRef, usize)> {
        let inner = self.inner.lock();
        inner.by_order.values().take(max).map(|e| (e.mref.clone(), e.delivery_count)).collect()
    }

    /// Remove the given messages; returns how many were present.
    pub fn remove(&self, msg_ids: &[MsgId]) -> usize {
        let mut inner = self.inner.lock();
        let mut removed = 0;
        for msg_id in msg_ids {
            if !inner.ids.remove(msg_id) {
                continue;
            }
            let key = inner.by_order.iter().find(|(_, e)| e.mref.msg_id() == msg_id).map(|(k, _)| k.clone());
            if let Some(key) = key {
                if let Some(e) = inner.by_order.remove(&key) {
                    if e.mref.is_gd() {
                        inner.gd -= 1;
                    } else {
                        inner.non_gd -= 1;
                    }
                    removed += 1;
                }
            }
        }
        removed
    }

    /// Record a failed attempt against the given messages. With a non-zero
    /// `max_retry`, returns the ids that have now exhausted their attempts.
    pub fn note_attempt(&self, msg_ids: &[MsgId], max_retry: usize) -> Vec<MsgId> {
        let mut inner = self.inner.lock();
        let mut exhausted = Vec::new();
        for e in inner.by_order.values_mut() {
            if msg_ids.contains(e.mref.msg_id()) {
                e.delivery_count += 1;
                if max_retry > 0 && e.delivery_count >= max_retry {
                    exhausted.push(e.mref.msg_id().clone());
                }
            }
        }
        exhausted
    }

    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let n = inner.by_order.len();
        inner.by_order.clear();
        inner.ids.clear();
        inner.gd = 0;
        inner.non_gd = 0;
        n
    }
}

pub struct DeliveryTask {
    pub sub_key: SubKey,
    pub topic_name: TopicName,
    list: Arc<DeliveryList>,
    state: RwLock<TaskState>,
    notify: Notify,
    /// Shared with the owning tool; serializes list mutation against
    /// concurrent storage enqueues for the same sub_key.
    sk_lock: Arc<tokio::sync::Mutex<()>>,
    transport: Option<Arc<dyn DeliveryTransport>>,
    storage: Arc<dyn GdStorage>,
    backlog: Arc<InRamBacklog>,
    opts: DeliveryOpts,
    stats: Arc<Stats>,
}

impl DeliveryTask {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sub_key: SubKey,
        topic_name: TopicName,
        list: Arc<DeliveryList>,
        sk_lock: Arc<tokio::sync::Mutex<()>>,
        transport: Option<Arc<dyn DeliveryTransport>>,
        storage: Arc<dyn GdStorage>,
        backlog: Arc<InRamBacklog>,
        opts: DeliveryOpts,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            sub_key,
            topic_name,
            list,
            state: RwLock::new(TaskState::Created),
            notify: Notify::new(),
            sk_lock,
            transport,
            storage,
            backlog,
            opts,
            stats,
        }
    }

    #[inline]
    pub fn state(&self) -> TaskState {
        *self.state.read()
    }

    #[inline]
    pub fn list(&self) -> &Arc<DeliveryList> {
        &self.list
    }

    /// Wake the run loop, e.g. after new messages were queued.
    #[inline]
    pub fn wakeup(&self) {
        self.notify.notify_one();
    }

    pub fn start(&self) {
        let mut state = self.state.write();
        if *state == TaskState::Created {
            *state = TaskState::Running;
        }
        drop(state);
        self.notify.notify_one();
    }

    pub fn pause(&self) {
        let mut state = self.state.write();
        if *state == TaskState::Running {
            *state = TaskState::Paused;
        }
    }

    pub fn resume(&self) {
        let mut state = self.state.write();
        if *state == TaskState::Paused {
            *state = TaskState::Running;
        }
        drop(state);
        self.notify.notify_one();
    }

    /// Request a stop. Idempotent; the run loop exits at the next batch
    /// boundary.
    pub fn stop(&self) {
        let mut state = self.state.write();
        if *state != TaskState::Stopped {
            *state = TaskState::Stopped;
            log::debug!("sub_key `{}`, delivery task stopping", self.sub_key);
        }
        drop(state);
        self.notify.notify_one();
    }

    /// Run the push-delivery loop until stopped. Tasks for pull-only
    /// subscribers (no transport) idle here, waiting for a stop.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let task = self.clone();
        tokio::spawn(async move {
            log::debug!("sub_key `{}`, delivery task started", task.sub_key);
            loop {
                match task.state() {
                    TaskState::Stopped => break,
                    TaskState::Created | TaskState::Paused => {
                        task.notify.notified().await;
                        continue;
                    }
                    TaskState::Running => {}
                }
                if task.transport.is_none() || task.list.is_empty() {
                    tokio::select! {
                        _ = task.notify.notified() => {},
                        _ = tokio::time::sleep(task.opts.delivery_interval) => {},
                    }
                    continue;
                }
                // Back off with the subscriber lock released, so pull and
                // read keep working while a push delivery retries.
                if let Some(wait) = task.run_delivery_once().await {
                    tokio::select! {
                        _ = task.notify.notified() => {},
                        _ = tokio::time::sleep(wait) => {},
                    }
                }
            }
            log::debug!("sub_key `{}`, delivery task stopped", task.sub_key);
        })
    }

    /// Deliver one batch, applying the retry policy on failure. Returns how
    /// long the run loop should back off before the next attempt; the
    /// subscriber lock is released by then.
    async fn run_delivery_once(&self) -> Option<Duration> {
        let transport = match self.transport.as_ref() {
            Some(t) => t.clone(),
            None => return None,
        };
        let _guard = self.sk_lock.lock().await;
        let now = timestamp_millis();
        let batch = self.list.peek(self.opts.batch_size);
        if batch.is_empty() {
            return None;
        }

        let (expired, live): (Vec<_>, Vec<_>) = batch.into_iter().partition(|(m, _)| m.is_expired(now));
        self.discard(&expired.iter().map(|(m, _)| m.clone()).collect::<Vec<_>>(), now, "expired").await;
        if live.is_empty() {
            return None;
        }

        let refs = live.iter().map(|(m, _)| m.clone()).collect::<Vec<_>>();
        let msgs = match self.resolve(&refs).await {
            Ok(msgs) => msgs,
            Err(e) => {
                log::warn!("sub_key `{}`, resolving batch failed, {:?}", self.sub_key, e);
                return Some(self.opts.wait_non_sock_err);
            }
        };
        if msgs.is_empty() {
            return None;
        }
        let wire = msgs.iter().map(WireMessage::from).collect::<Vec<_>>();
        let msg_ids = msgs.iter().map(|m| m.msg_id.clone()).collect::<Vec<_>>();

        match transport.deliver(&self.sub_key, &self.topic_name, wire).await {
            Ok(()) => {
                if let Err(e) = self.acknowledge(&refs, now).await {
                    log::warn!("sub_key `{}`, confirming delivery failed, {:?}", self.sub_key, e);
                }
                self.list.remove(&msg_ids);
                self.stats.delivereds.incs(msg_ids.len() as isize);
                None
            }
            Err(e) => self.on_delivery_error(&refs, &msg_ids, e, now).await,
        }
    }

    /// Apply the retry policy to a failed batch. Returns the backoff the
    /// run loop should observe, if any.
    async fn on_delivery_error(
        &self,
        refs: &[MessageRef],
        msg_ids: &[MsgId],
        e: DeliveryError,
        now: TimestampMillis,
    ) -> Option<Duration> {
        let exhausted = self.list.note_attempt(msg_ids, self.opts.max_retry);
        if !exhausted.is_empty() {
            log::warn!(
                "sub_key `{}`, dropping {} message(s) after {} failed attempt(s)",
                self.sub_key,
                exhausted.len(),
                self.opts.max_retry
            );
            let drop_refs =
                refs.iter().filter(|r| exhausted.contains(r.msg_id())).cloned().collect::<Vec<_>>();
            self.discard(&drop_refs, now, "retries exhausted").await;
        }
        if self.opts.err_should_block {
            let wait = if e.is_connection() { self.opts.wait_sock_err } else { self.opts.wait_non_sock_err };
            log::warn!(
                "sub_key `{}`, delivery failed ({}), retrying in {:?}",
                self.sub_key,
                e,
                wait
            );
            Some(wait)
        } else {
            log::warn!("sub_key `{}`, delivery failed ({}), dropping batch", self.sub_key, e);
            self.discard(refs, now, "delivery error").await;
            None
        }
    }

    /// Remove references from the list and their backing state.
    async fn discard(&self, refs: &[MessageRef], now: TimestampMillis, why: &str) {
        if refs.is_empty() {
            return;
        }
        let msg_ids = refs.iter().map(|r| r.msg_id().clone()).collect::<Vec<_>>();
        log::debug!("sub_key `{}`, discarding {} message(s), {}", self.sub_key, msg_ids.len(), why);
        self.list.remove(&msg_ids);
        let gd_ids = refs.iter().filter(|r| r.is_gd()).map(|r| r.msg_id().clone()).collect::<Vec<_>>();
        if !gd_ids.is_empty() {
            if let Err(e) = self.storage.set_to_delete(&self.sub_key, &gd_ids, now).await {
                log::warn!("sub_key `{}`, set_to_delete failed, {:?}", self.sub_key, e);
            }
        }
        let non_gd_ids =
            refs.iter().filter(|r| !r.is_gd()).map(|r| r.msg_id().clone()).collect::<Vec<_>>();
        if !non_gd_ids.is_empty() {
            self.backlog.delete_by_sub_key(&self.sub_key, &non_gd_ids);
        }
    }

    /// Resolve references to full bodies, fetching guaranteed-delivery rows
    /// in one storage round trip. References storage no longer knows are
    /// dropped from the list with a warning.
    async fn resolve(&self, refs: &[MessageRef]) -> Result<Vec<Message>> {
        let gd_ids =
            refs.iter().filter(|r| r.is_gd()).map(|r| r.msg_id().clone()).collect::<Vec<_>>();
        let mut gd_rows = if gd_ids.is_empty() {
            Vec::new()
        } else {
            self.storage.fetch_by_msg_ids(&self.sub_key, &gd_ids).await?
        };

        let mut out = Vec::with_capacity(refs.len());
        let mut missing = Vec::new();
        for r in refs {
            match r {
                MessageRef::NonGd(m) => out.push(Message::clone(m)),
                MessageRef::Gd(gd) => {
                    match gd_rows.iter().position(|row| row.msg.msg_id == gd.msg_id) {
                        Some(i) => out.push(gd_rows.swap_remove(i).msg),
                        None => {
                            log::warn!(
                                "sub_key `{}`, msg `{}` not in storage, dropping from delivery list",
                                self.sub_key,
                                gd.msg_id
                            );
                            missing.push(gd.msg_id.clone());
                        }
                    }
                }
            }
        }
        if !missing.is_empty() {
            self.list.remove(&missing);
        }
        Ok(out)
    }

    /// Confirm a delivered batch: flag guaranteed-delivery rows in storage,
    /// drop in-RAM references from the backlog.
    async fn acknowledge(&self, refs: &[MessageRef], now: TimestampMillis) -> Result<()> {
        let gd_ids =
            refs.iter().filter(|r| r.is_gd()).map(|r| r.msg_id().clone()).collect::<Vec<_>>();
        if !gd_ids.is_empty() {
            self.storage.confirm_delivered(&self.sub_key, &gd_ids, now).await?;
        }
        let non_gd_ids =
            refs.iter().filter(|r| !r.is_gd()).map(|r| r.msg_id().clone()).collect::<Vec<_>>();
        if !non_gd_ids.is_empty() {
            self.backlog.delete_by_sub_key(&self.sub_key, &non_gd_ids);
        }
        Ok(())
    }

    /// Get-and-delete up to `max_messages` resolved messages in delivery
    /// order, stopping early once `max_len` payload bytes are exceeded (at
    /// least one message is always returned when any is queued).
    pub async fn pull_messages(&self, max_messages: usize, max_len: usize) -> Result<Vec<Message>> {
        let _guard = self.sk_lock.lock().await;
        let now = timestamp_millis();
        let batch = self.list.peek(max_messages);
        let (expired, live): (Vec<_>, Vec<_>) = batch.into_iter().partition(|(m, _)| m.is_expired(now));
        self.discard(&expired.iter().map(|(m, _)| m.clone()).collect::<Vec<_>>(), now, "expired").await;

        let refs = live.iter().map(|(m, _)| m.clone()).collect::<Vec<_>>();
        let resolved = self.resolve(&refs).await?;

        let mut out = Vec::new();
        let mut total = 0usize;
        for msg in resolved {
            if !out.is_empty() && max_len > 0 && total + msg.size > max_len {
                break;
            }
            total += msg.size;
            out.push(msg);
        }
        let taken_ids = out.iter().map(|m| m.msg_id.clone()).collect::<Vec<_>>();
        let taken_refs =
            refs.iter().filter(|r| taken_ids.contains(r.msg_id())).cloned().collect::<Vec<_>>();
        self.acknowledge(&taken_refs, now).await?;
        self.list.remove(&taken_ids);
        self.stats.delivereds.incs(taken_ids.len() as isize);
        Ok(out)
    }

    /// Resolve up to `max_messages` without consuming them.
    pub async fn read_messages(&self, max_messages: usize) -> Result<Vec<Message>> {
        let _guard = self.sk_lock.lock().await;
        let now = timestamp_millis();
        let refs = self
            .list
            .peek(max_messages)
            .into_iter()
            .map(|(m, _)| m)
            .filter(|m| !m.is_expired(now))
            .collect::<Vec<_>>();
        self.resolve(&refs).await
    }

    /// Explicitly delete messages from this subscriber's queue.
    pub async fn delete_messages(&self, msg_ids: &[MsgId]) -> Result<()> {
        let _guard = self.sk_lock.lock().await;
        let now = timestamp_millis();
        let refs = self
            .list
            .peek(usize::MAX)
            .into_iter()
            .map(|(m, _)| m)
            .filter(|m| msg_ids.contains(m.msg_id()))
            .collect::<Vec<_>>();
        self.discard(&refs, now, "deleted by request").await;
        Ok(())
    }

    /// `(gd, non_gd)` queue depth.
    #[inline]
    pub fn queue_depth(&self) -> (usize, usize) {
        self.list.counts()
    }
}
