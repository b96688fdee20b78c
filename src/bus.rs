//! Process-wide topic registry used as the sole integration point between
//! components.
//!
//! Channels are created lazily on first access. Delivery is synchronous:
//! `publish` runs every active subscriber, in subscription order, on the
//! calling thread, and returns the first subscriber error to the publisher.
//! There is no buffering and no backpressure.
//!
//! | Topic | Payload |
//! |---|---|
//! | [`RAW_TC`] | bytes received from operators |
//! | [`TC`] | parsed [`ServiceRequest`]s |
//! | [`IO_SERVICE_REQUEST`] | re-addressed requests for instrument engines |
//! | [`IO_RESULT`] | instrument [`ServiceResponse`]s |
//! | [`TM`] | responses bound for operators |
//! | [`RAW_TM`] | formatted reply lines |
//! | [`IO_SERVICE_SIGNATURE`] | catalog slices from instrument engines |
//! | [`QUIT`] | process shutdown |

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::error::Result;
use crate::protocol::{ParameterInfo, ServiceRequest, ServiceResponse};

pub const TC: &str = "tc";
pub const TM: &str = "tm";
pub const RAW_TC: &str = "raw_tc";
pub const RAW_TM: &str = "raw_tm";
pub const IO_SERVICE_REQUEST: &str = "io_service_request";
pub const IO_RESULT: &str = "io_result";
pub const IO_SERVICE_SIGNATURE: &str = "io_service_signature";
pub const QUIT: &str = "quit";

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(ServiceRequest),
    Response(ServiceResponse),
    Signatures(Vec<ParameterInfo>),
    Raw(Vec<u8>),
    Line(String),
    Quit,
}

type Callback = Arc<dyn Fn(&Message) -> Result<()> + Send + Sync>;

struct Subscriber {
    id: u64,
    active: Arc<AtomicBool>,
    callback: Callback,
}

struct ChannelInner {
    name: String,
    next_id: AtomicU64,
    subscribers: Mutex<Vec<Subscriber>>,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fan-out channel for one topic. Clones share the same subscriber set.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    fn new(name: &str) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                name: name.to_string(),
                next_id: AtomicU64::new(1),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Delivers `message` to every active subscriber and returns how many
    /// were called. A subscriber cancelled by an earlier callback of the same
    /// publish is skipped.
    pub fn publish(&self, message: Message) -> Result<usize> {
        let snapshot: Vec<(Arc<AtomicBool>, Callback)> = lock(&self.inner.subscribers)
            .iter()
            .map(|s| (Arc::clone(&s.active), Arc::clone(&s.callback)))
            .collect();

        let mut delivered = 0;
        for (active, callback) in snapshot {
            if !active.load(Ordering::Acquire) {
                continue;
            }
            callback(&message)?;
            delivered += 1;
        }
        Ok(delivered)
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Message) -> Result<()> + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(true));
        lock(&self.inner.subscribers).push(Subscriber {
            id,
            active: Arc::clone(&active),
            callback: Arc::new(callback),
        });
        Subscription {
            channel: Arc::downgrade(&self.inner),
            id,
            active,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner.subscribers).len()
    }
}

/// Handle returned by [`Channel::subscribe`]. Dropping it does not cancel
/// the subscription; call [`Subscription::cancel`].
pub struct Subscription {
    channel: Weak<ChannelInner>,
    id: u64,
    active: Arc<AtomicBool>,
}

impl Subscription {
    /// Idempotent.
    pub fn cancel(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(channel) = self.channel.upgrade() {
            lock(&channel.subscribers).retain(|s| s.id != self.id);
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl core::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Registry of named channels. Cheap to clone; clones share all channels.
#[derive(Clone, Default)]
pub struct MessageBus {
    channels: Arc<Mutex<HashMap<String, Channel>>>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the channel for `name`, creating it on first use.
    pub fn topic(&self, name: &str) -> Channel {
        lock(&self.channels)
            .entry(name.to_string())
            .or_insert_with(|| Channel::new(name))
            .clone()
    }

    pub fn publish(&self, topic: &str, message: Message) -> Result<usize> {
        self.topic(topic).publish(message)
    }

    pub fn subscribe<F>(&self, topic: &str, callback: F) -> Subscription
    where
        F: Fn(&Message) -> Result<()> + Send + Sync + 'static,
    {
        self.topic(topic).subscribe(callback)
    }
}
