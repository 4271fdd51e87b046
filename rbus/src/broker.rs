//! Shared broker context
//!
//! [`PubSub`] bundles everything one broker process owns: configuration,
//! the catalog, the in-RAM backlog with its expiry sweep, the durable
//! storage handle and the delivery coordinator. It is a cheaply cloneable
//! handle, an `Arc` around the real state, handed to every part of the
//! embedding application.

use std::ops::Deref;
use std::sync::Arc;

use tokio::task::JoinHandle;

use rbus_conf::{Options, Settings};

use crate::backlog::InRamBacklog;
use crate::error::Result;
use crate::registry::{EndpointConfig, Registry};
use crate::stats::Stats;
use crate::storage::{GdStorage, NullGdStorage};
use crate::task::{DeliveryOpts, DeliveryTransport};
use crate::tool::PubSubTool;
use crate::types::{EndpointId, EndpointType, NodeName};

/// Topics carrying service invocations live under this prefix; see
/// [`service_topic_name`].
pub const SERVICE_TOPIC_PREFIX: &str = "services.";

/// The topic a named service receives its messages on.
#[inline]
pub fn service_topic_name(service: &str) -> String {
    format!("{}{}", SERVICE_TOPIC_PREFIX, service)
}

pub struct PubSubBuilder {
    settings: Option<Settings>,
    storage: Arc<dyn GdStorage>,
    transport: Option<Arc<dyn DeliveryTransport>>,
}

impl Default for PubSubBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PubSubBuilder {
    pub fn new() -> Self {
        Self { settings: None, storage: Arc::new(NullGdStorage::instance()), transport: None }
    }

    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn storage(mut self, storage: Arc<dyn GdStorage>) -> Self {
        self.storage = storage;
        self
    }

    pub fn transport(mut self, transport: Arc<dyn DeliveryTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub async fn build(self) -> Result<PubSub> {
        let cfg = match self.settings {
            Some(s) => s,
            None => Settings::new(Options::default())?,
        };
        let server_name = NodeName::from(cfg.node.name.clone());
        let server_pid = cfg.node.pid;

        let stats = Arc::new(Stats::new());
        let backlog = Arc::new(InRamBacklog::new(stats.clone()));
        let cleanup = backlog.run_cleanup(cfg.pubsub.cleanup_interval);

        let opts = DeliveryOpts {
            batch_size: cfg.pubsub.delivery_batch_size,
            delivery_interval: cfg.pubsub.task_delivery_interval,
            wait_sock_err: cfg.pubsub.wait_sock_err,
            wait_non_sock_err: cfg.pubsub.wait_non_sock_err,
            max_retry: cfg.pubsub.delivery_max_retry,
            err_should_block: cfg.pubsub.delivery_err_should_block,
        };
        let tool = PubSubTool::new(
            server_name.clone(),
            server_pid,
            self.storage.clone(),
            backlog.clone(),
            self.transport,
            opts,
            stats.clone(),
        );

        let registry = Registry::new();
        // The endpoint service deliveries run under; it may touch any
        // service topic and nothing else.
        let service_endpoint = registry.create_endpoint(EndpointConfig {
            name: "internal.service".into(),
            endpoint_type: EndpointType::Internal,
            is_internal: true,
            topic_patterns: format!("pub={0}**\nsub={0}**", SERVICE_TOPIC_PREFIX),
            ..Default::default()
        })?;

        log::info!("pubsub context ready, node {}:{}", server_name, server_pid);
        Ok(PubSub {
            inner: Arc::new(PubSubInner {
                cfg,
                registry,
                backlog,
                storage: self.storage,
                tool,
                stats,
                server_name,
                server_pid,
                service_endpoint_id: service_endpoint.id,
                cleanup,
            }),
        })
    }
}

#[derive(Clone)]
pub struct PubSub {
    inner: Arc<PubSubInner>,
}

pub struct PubSubInner {
    pub cfg: Settings,
    pub registry: Registry,
    pub backlog: Arc<InRamBacklog>,
    pub storage: Arc<dyn GdStorage>,
    pub tool: Arc<PubSubTool>,
    pub stats: Arc<Stats>,
    pub server_name: NodeName,
    pub server_pid: u32,
    pub service_endpoint_id: EndpointId,
    cleanup: JoinHandle<()>,
}

impl Deref for PubSub {
    type Target = PubSubInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl PubSub {
    #[inline]
    pub fn builder() -> PubSubBuilder {
        PubSubBuilder::new()
    }

    /// Stop background work. Delivery tasks are stopped through their own
    /// teardown paths; this only ends the expiry sweep.
    pub fn shutdown(&self) {
        self.inner.cleanup.abort();
    }

    #[inline]
    pub fn stats_json(&self) -> serde_json::Value {
        self.stats.to_json()
    }
}
