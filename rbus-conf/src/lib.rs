#![deny(unsafe_code)]

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use config::{Config, File};
use once_cell::sync::OnceCell;
use serde::Deserialize;

use rbus_utils::{deserialize_duration, Bytesize};

pub use self::options::Options;

pub mod options;

type Result<T> = anyhow::Result<T>;

static SETTINGS: OnceCell<Settings> = OnceCell::new();

#[derive(Clone)]
pub struct Settings(Arc<Inner>);

#[derive(Debug, Clone, Deserialize)]
pub struct Inner {
    #[serde(default)]
    pub node: Node,
    #[serde(default)]
    pub pubsub: PubSub,
    #[serde(default, skip)]
    pub opts: Options,
}

impl Deref for Settings {
    type Target = Inner;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Settings {
    pub fn new(opts: Options) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::with_name("/etc/rbus/rbus").required(false))
            .add_source(File::with_name("/etc/rbus").required(false))
            .add_source(File::with_name("rbus").required(false))
            .add_source(config::Environment::with_prefix("rbus").try_parsing(true));

        if let Some(cfg) = opts.cfg_name.as_ref() {
            builder = builder.add_source(File::with_name(cfg).required(false));
        }

        let mut inner: Inner = builder.build()?.try_deserialize()?;

        //Command line configuration overriding file configuration
        if let Some(name) = opts.server_name.as_ref() {
            inner.node.name.clone_from(name);
        }
        if let Some(pid) = opts.server_pid {
            inner.node.pid = pid;
        }

        inner.opts = opts;
        Ok(Self(Arc::new(inner)))
    }

    #[inline]
    pub fn instance() -> &'static Self {
        match SETTINGS.get() {
            Some(c) => c,
            None => {
                unreachable!("Settings not initialized");
            }
        }
    }

    #[inline]
    pub fn init(opts: Options) -> Result<&'static Self> {
        SETTINGS.set(Settings::new(opts)?).map_err(|_| anyhow!("Settings init failed"))?;
        SETTINGS.get().ok_or_else(|| anyhow!("Settings init failed"))
    }

    #[inline]
    pub fn logs(&self) {
        log::debug!("Config info is {:?}", self.0);
        log::info!("node is {}:{}", self.node.name, self.node.pid);
        log::info!("pubsub.max_depth_gd is {}", self.pubsub.max_depth_gd);
        log::info!("pubsub.max_depth_non_gd is {}", self.pubsub.max_depth_non_gd);
        log::info!("pubsub.task_delivery_interval is {:?}", self.pubsub.task_delivery_interval);
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Settings ...")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Node {
    //Server name reported in message metadata and used to address
    //process-local in-RAM state.
    #[serde(default = "Node::name_default")]
    pub name: String,
    #[serde(default = "Node::pid_default")]
    pub pid: u32,
}

impl Default for Node {
    #[inline]
    fn default() -> Self {
        Self { name: Self::name_default(), pid: Self::pid_default() }
    }
}

impl Node {
    fn name_default() -> String {
        "rbus-1".into()
    }
    fn pid_default() -> u32 {
        std::process::id()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PubSub {
    //Default message priority, in the 0..=9 range.
    #[serde(default = "PubSub::default_priority_default")]
    pub default_priority: u8,

    //Default message expiration, in seconds.
    #[serde(default = "PubSub::default_expiration_secs_default")]
    pub default_expiration_secs: i64,

    //Largest accepted message payload.
    #[serde(default = "PubSub::max_msg_size_default")]
    pub max_msg_size: Bytesize,

    //Per-subscriber queue depth limit for guaranteed-delivery messages.
    #[serde(default = "PubSub::max_depth_gd_default")]
    pub max_depth_gd: usize,

    //Per-subscriber queue depth limit for in-RAM messages.
    #[serde(default = "PubSub::max_depth_non_gd_default")]
    pub max_depth_non_gd: usize,

    //Upper bound on messages handed to a transport in one delivery iteration.
    #[serde(default = "PubSub::delivery_batch_size_default")]
    pub delivery_batch_size: usize,

    //How often a delivery task wakes up when no notification arrives.
    #[serde(
        default = "PubSub::task_delivery_interval_default",
        deserialize_with = "deserialize_duration"
    )]
    pub task_delivery_interval: Duration,

    //Expired-message sweep cadence.
    #[serde(default = "PubSub::cleanup_interval_default", deserialize_with = "deserialize_duration")]
    pub cleanup_interval: Duration,

    //Sleep after a connection-level delivery error before retrying.
    #[serde(default = "PubSub::wait_sock_err_default", deserialize_with = "deserialize_duration")]
    pub wait_sock_err: Duration,

    //Sleep after any other delivery error before retrying.
    #[serde(default = "PubSub::wait_non_sock_err_default", deserialize_with = "deserialize_duration")]
    pub wait_non_sock_err: Duration,

    //How many delivery attempts a message gets before it is dropped.
    #[serde(default = "PubSub::delivery_max_retry_default")]
    pub delivery_max_retry: usize,

    //Whether delivery errors leave messages queued for retry (true) or
    //discard them (false).
    #[serde(default = "PubSub::delivery_err_should_block_default")]
    pub delivery_err_should_block: bool,
}

impl Default for PubSub {
    #[inline]
    fn default() -> Self {
        Self {
            default_priority: Self::default_priority_default(),
            default_expiration_secs: Self::default_expiration_secs_default(),
            max_msg_size: Self::max_msg_size_default(),
            max_depth_gd: Self::max_depth_gd_default(),
            max_depth_non_gd: Self::max_depth_non_gd_default(),
            delivery_batch_size: Self::delivery_batch_size_default(),
            task_delivery_interval: Self::task_delivery_interval_default(),
            cleanup_interval: Self::cleanup_interval_default(),
            wait_sock_err: Self::wait_sock_err_default(),
            wait_non_sock_err: Self::wait_non_sock_err_default(),
            delivery_max_retry: Self::delivery_max_retry_default(),
            delivery_err_should_block: Self::delivery_err_should_block_default(),
        }
    }
}

impl PubSub {
    fn default_priority_default() -> u8 {
        5
    }
    fn default_expiration_secs_default() -> i64 {
        2147483647
    }
    fn max_msg_size_default() -> Bytesize {
        Bytesize::from("1M")
    }
    fn max_depth_gd_default() -> usize {
        10000
    }
    fn max_depth_non_gd_default() -> usize {
        1000
    }
    fn delivery_batch_size_default() -> usize {
        500
    }
    fn task_delivery_interval_default() -> Duration {
        Duration::from_secs(2)
    }
    fn cleanup_interval_default() -> Duration {
        Duration::from_secs(2)
    }
    fn wait_sock_err_default() -> Duration {
        Duration::from_secs(10)
    }
    fn wait_non_sock_err_default() -> Duration {
        Duration::from_secs(30)
    }
    fn delivery_max_retry_default() -> usize {
        0 // 0 = unlimited
    }
    fn delivery_err_should_block_default() -> bool {
        true
    }
}
