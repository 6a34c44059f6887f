// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Message Bus
//!
//! Topic-based publish/subscribe with wildcard subscriptions and a
//! request/response pattern built on correlation ids and short-lived reply topics.
//!
//! ## Delivery model
//!
//! Every subscription owns an unbounded queue drained by its own worker task.
//! Publishing only enqueues, so a slow or failing handler never blocks the
//! publisher or other subscribers, and each subscription sees messages in the
//! order they were published. Fan-out across subscriptions is concurrent.
//!
//! | Message | Delivered to |
//! |---------|--------------|
//! | `event`/`request`/`response`/`command` on topic `T` | subscriptions whose pattern equals `T` or glob-matches `T` |
//! | `broadcast` | every active subscription, once |
//!
//! A handler returning `Ok(Some(value))` for a message that carries `reply_to`
//! is answered automatically; handler errors and panics are logged and isolated.
//!
//! The bus must be used from within a Tokio runtime: subscribing spawns the
//! subscription worker.
//!
//! ## Bridging
//!
//! [`MessageBus::attach_bridge`] hands out a stream of every message published
//! in this process, tagged with the bus instance id, for a transport to carry
//! to other processes. Messages coming back in go through
//! [`MessageBus::deliver_remote`], which delivers them to local subscribers
//! only and drops the ones this bus sent itself.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::domain::message::{
    Message, MessageId, MessagePriority, MessageType, SubscriptionId, SubscriptionInfo,
    TopicPattern, BROADCAST_TOPIC, REPLY_TOPIC_PREFIX,
};
use crate::domain::prefixed_id;

pub type HandlerResult = anyhow::Result<Option<serde_json::Value>>;

/// Type-erased subscription handler.
pub type MessageHandler = Arc<dyn Fn(Message) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Predicate evaluated before a message is queued for a subscription.
pub type MessageFilter = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Number of published messages retained for inspection.
    #[serde(default = "default_history_size")]
    pub history_size: usize,

    /// Timeout used by callers that do not pass their own.
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub default_request_timeout: Duration,

    /// Cross-process transport. Local only when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge: Option<BridgeConfig>,
}

/// Redis pub/sub settings for carrying messages between processes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_bridge_url")]
    pub url: String,

    /// Pub/sub channel shared by every bridged bus.
    #[serde(default = "default_bridge_channel")]
    pub channel: String,
}

fn default_bridge_url() -> String {
    "redis://127.0.0.1:6379/2".to_string()
}

fn default_bridge_channel() -> String {
    "convoy.bus".to_string()
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            url: default_bridge_url(),
            channel: default_bridge_channel(),
        }
    }
}

fn default_history_size() -> usize {
    1000
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            history_size: default_history_size(),
            default_request_timeout: default_request_timeout(),
            bridge: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("No response on '{topic}' within {timeout:?}")]
    Timeout { topic: String, timeout: Duration },

    #[error("Reply channel for '{topic}' closed before a response arrived")]
    NoResponse { topic: String },
}

/// Optional subscription settings.
#[derive(Clone, Default)]
pub struct SubscribeOptions {
    pub subscriber: Option<String>,
    pub filter: Option<MessageFilter>,
}

impl SubscribeOptions {
    pub fn subscriber(mut self, subscriber: impl Into<String>) -> Self {
        self.subscriber = Some(subscriber.into());
        self
    }

    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Message) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusStats {
    pub subscriptions: usize,
    pub patterns: usize,
    pub wildcard_subscriptions: usize,
    pub history_size: usize,
    pub pending_requests: usize,
    pub published_total: u64,
}

struct Subscription {
    id: SubscriptionId,
    pattern: TopicPattern,
    subscriber: Option<String>,
    filter: Option<MessageFilter>,
    created_at: DateTime<Utc>,
    queue: mpsc::UnboundedSender<Message>,
}

impl Subscription {
    fn accepts(&self, message: &Message) -> bool {
        self.filter.as_ref().is_none_or(|filter| filter(message))
    }

    fn info(&self) -> SubscriptionInfo {
        SubscriptionInfo {
            id: self.id.clone(),
            pattern: self.pattern.as_str().to_string(),
            subscriber: self.subscriber.clone(),
            has_filter: self.filter.is_some(),
            created_at: self.created_at,
        }
    }
}

#[derive(Default)]
struct SubscriptionIndex {
    by_id: HashMap<SubscriptionId, Subscription>,
    exact: HashMap<String, Vec<SubscriptionId>>,
    wildcard: Vec<SubscriptionId>,
}

impl SubscriptionIndex {
    fn insert(&mut self, sub: Subscription) {
        match &sub.pattern {
            TopicPattern::Exact(topic) => self
                .exact
                .entry(topic.clone())
                .or_default()
                .push(sub.id.clone()),
            TopicPattern::Wildcard { .. } => self.wildcard.push(sub.id.clone()),
        }
        self.by_id.insert(sub.id.clone(), sub);
    }

    fn remove(&mut self, id: &SubscriptionId) -> Option<Subscription> {
        let sub = self.by_id.remove(id)?;
        match &sub.pattern {
            TopicPattern::Exact(topic) => {
                if let Some(ids) = self.exact.get_mut(topic) {
                    ids.retain(|s| s != id);
                    if ids.is_empty() {
                        self.exact.remove(topic);
                    }
                }
            }
            TopicPattern::Wildcard { .. } => self.wildcard.retain(|s| s != id),
        }
        Some(sub)
    }

    /// Subscriptions a message should be queued on, deduplicated.
    fn targets(&self, message: &Message) -> Vec<&Subscription> {
        if message.is_broadcast() {
            return self.by_id.values().filter(|s| s.accepts(message)).collect();
        }

        let mut seen = HashSet::new();
        let exact = self.exact.get(&message.topic).into_iter().flatten();
        let wildcard = self.wildcard.iter().filter(|id| {
            self.by_id
                .get(*id)
                .is_some_and(|s| s.pattern.matches(&message.topic))
        });

        exact
            .chain(wildcard)
            .filter(|id| seen.insert((*id).clone()))
            .filter_map(|id| self.by_id.get(id))
            .filter(|s| s.accepts(message))
            .collect()
    }
}

/// Metadata key naming the bus instance a bridged message came from.
pub const ORIGIN_METADATA_KEY: &str = "bus_origin";

struct BusInner {
    config: BusConfig,
    instance_id: String,
    outbound: RwLock<Option<mpsc::UnboundedSender<Message>>>,
    index: RwLock<SubscriptionIndex>,
    history: Mutex<VecDeque<Message>>,
    pending_requests: AtomicUsize,
    published_total: AtomicU64,
}

/// Cloneable handle to a shared message bus.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl MessageBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                history: Mutex::new(VecDeque::with_capacity(config.history_size.min(1024))),
                config,
                instance_id: prefixed_id("bus-", 12),
                outbound: RwLock::new(None),
                index: RwLock::new(SubscriptionIndex::default()),
                pending_requests: AtomicUsize::new(0),
                published_total: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    /// Start copying every locally published message to the returned
    /// receiver. Replaces any previous bridge.
    pub fn attach_bridge(&self) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.inner.outbound.write().replace(tx).is_some() {
            warn!("Replacing existing bus bridge");
        }
        rx
    }

    pub fn detach_bridge(&self) {
        self.inner.outbound.write().take();
    }

    /// Deliver a message received from another process to local subscribers.
    /// It is recorded in history but not forwarded again. Returns how many
    /// subscriptions it was queued on, or `None` when it originated here.
    pub fn deliver_remote(&self, message: Message) -> Option<usize> {
        if message.metadata.get(ORIGIN_METADATA_KEY) == Some(&self.inner.instance_id) {
            return None;
        }
        metrics::counter!("convoy_bus_remote_messages_total").increment(1);
        let delivered = self.deliver_local(&message);
        debug!(
            message_id = %message.id,
            topic = %message.topic,
            origin = ?message.metadata.get(ORIGIN_METADATA_KEY),
            delivered,
            "Remote message delivered"
        );
        Some(delivered)
    }

    /// Subscribe `handler` to an exact topic or a `*` pattern.
    pub fn subscribe<F, Fut>(&self, pattern: &str, handler: F) -> SubscriptionId
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.subscribe_with(pattern, SubscribeOptions::default(), handler)
    }

    pub fn subscribe_with<F, Fut>(
        &self,
        pattern: &str,
        options: SubscribeOptions,
        handler: F,
    ) -> SubscriptionId
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: MessageHandler = Arc::new(move |msg| handler(msg).boxed());
        self.subscribe_handler(pattern, options, handler)
    }

    pub fn subscribe_handler(
        &self,
        pattern: &str,
        options: SubscribeOptions,
        handler: MessageHandler,
    ) -> SubscriptionId {
        let id = SubscriptionId::new();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(run_subscription(
            Arc::downgrade(&self.inner),
            id.clone(),
            rx,
            handler,
        ));

        let subscription = Subscription {
            id: id.clone(),
            pattern: TopicPattern::parse(pattern),
            subscriber: options.subscriber,
            filter: options.filter,
            created_at: Utc::now(),
            queue: tx,
        };

        debug!(subscription_id = %id, pattern, "Subscription added");
        self.inner.index.write().insert(subscription);
        metrics::gauge!("convoy_bus_subscriptions").increment(1.0);
        id
    }

    /// Remove a subscription. Messages already queued for it are still handled.
    pub fn unsubscribe(&self, id: &SubscriptionId) -> bool {
        let removed = self.inner.index.write().remove(id).is_some();
        if removed {
            debug!(subscription_id = %id, "Subscription removed");
            metrics::gauge!("convoy_bus_subscriptions").decrement(1.0);
        }
        removed
    }

    /// Remove every subscription owned by `subscriber`. Returns how many were removed.
    pub fn unsubscribe_all(&self, subscriber: &str) -> usize {
        let mut index = self.inner.index.write();
        let ids: Vec<SubscriptionId> = index
            .by_id
            .values()
            .filter(|s| s.subscriber.as_deref() == Some(subscriber))
            .map(|s| s.id.clone())
            .collect();
        for id in &ids {
            index.remove(id);
        }
        drop(index);

        if !ids.is_empty() {
            debug!(subscriber, count = ids.len(), "Subscriber detached");
            metrics::gauge!("convoy_bus_subscriptions").decrement(ids.len() as f64);
        }
        ids.len()
    }

    /// Publish an event on `topic` with normal priority.
    pub fn publish(
        &self,
        topic: &str,
        payload: serde_json::Value,
        sender: Option<&str>,
    ) -> MessageId {
        let mut message = Message::new(topic, payload);
        message.sender = sender.map(str::to_string);
        self.publish_message(message)
    }

    /// Publish a fully-specified message.
    pub fn publish_message(&self, message: Message) -> MessageId {
        let id = message.id.clone();
        let delivered = self.deliver_local(&message);

        if let Some(outbound) = self.inner.outbound.read().as_ref() {
            let mut bridged = message.clone();
            bridged
                .metadata
                .insert(ORIGIN_METADATA_KEY.to_string(), self.inner.instance_id.clone());
            if outbound.send(bridged).is_err() {
                debug!(message_id = %id, "Bus bridge gone, message stays local");
            }
        }

        self.inner.published_total.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("convoy_bus_messages_published_total").increment(1);
        debug!(
            message_id = %id,
            topic = %message.topic,
            message_type = ?message.message_type,
            delivered,
            "Message published"
        );
        id
    }

    /// Record `message` in history and queue it on every matching subscription.
    fn deliver_local(&self, message: &Message) -> usize {
        {
            let mut history = self.inner.history.lock();
            history.push_back(message.clone());
            while history.len() > self.inner.config.history_size {
                history.pop_front();
            }
        }

        let index = self.inner.index.read();
        let targets = index.targets(message);
        for sub in &targets {
            if sub.queue.send(message.clone()).is_err() {
                debug!(subscription_id = %sub.id, "Subscription worker gone, dropping message");
            }
        }
        targets.len()
    }

    /// Deliver `payload` to every active subscription.
    pub fn broadcast(&self, payload: serde_json::Value, sender: Option<&str>) -> MessageId {
        let mut message = Message::new(BROADCAST_TOPIC, payload)
            .with_type(MessageType::Broadcast)
            .with_priority(MessagePriority::High);
        message.sender = sender.map(str::to_string);
        self.publish_message(message)
    }

    /// Publish a request on `topic` and wait up to `timeout` for the first reply.
    pub async fn request(
        &self,
        topic: &str,
        payload: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, BusError> {
        let correlation_id = prefixed_id("req-", 12);
        let reply_topic = format!("{REPLY_TOPIC_PREFIX}{correlation_id}");

        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(Mutex::new(Some(tx)));
        let expected = correlation_id.clone();
        let reply_sub = self.subscribe_with(
            &reply_topic,
            SubscribeOptions::default()
                .filter(move |m| m.correlation_id.as_deref() == Some(expected.as_str())),
            move |msg: Message| {
                if let Some(tx) = slot.lock().take() {
                    let _ = tx.send(msg.payload);
                }
                async { Ok(None) }
            },
        );
        let _pending = PendingRequest::new(self, reply_sub);

        self.publish_message(
            Message::new(topic, payload)
                .with_type(MessageType::Request)
                .with_correlation_id(correlation_id)
                .with_reply_to(reply_topic),
        );

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(BusError::NoResponse {
                topic: topic.to_string(),
            }),
            Err(_) => {
                metrics::counter!("convoy_bus_request_timeouts_total").increment(1);
                warn!(topic, ?timeout, "Request timed out");
                Err(BusError::Timeout {
                    topic: topic.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Answer `original` on its reply topic. Returns `None` when it expects no reply.
    pub fn respond(&self, original: &Message, payload: serde_json::Value) -> Option<MessageId> {
        let reply_to = original.reply_to.as_ref()?;
        let correlation_id = original
            .correlation_id
            .clone()
            .unwrap_or_else(|| original.id.0.clone());

        Some(
            self.publish_message(
                Message::new(reply_to.clone(), payload)
                    .with_type(MessageType::Response)
                    .with_correlation_id(correlation_id)
                    .with_priority(original.priority),
            ),
        )
    }

    /// Recent messages, oldest first, optionally filtered by topic pattern and age.
    pub fn history(
        &self,
        topic: Option<&str>,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Vec<Message> {
        let pattern = topic.map(TopicPattern::parse);
        let history = self.inner.history.lock();
        let matching: Vec<&Message> = history
            .iter()
            .filter(|m| pattern.as_ref().is_none_or(|p| p.matches(&m.topic)))
            .filter(|m| since.is_none_or(|t| m.timestamp >= t))
            .collect();

        let skip = matching.len().saturating_sub(limit);
        matching.into_iter().skip(skip).cloned().collect()
    }

    pub fn subscriptions(&self, subscriber: Option<&str>) -> Vec<SubscriptionInfo> {
        let index = self.inner.index.read();
        let mut infos: Vec<SubscriptionInfo> = index
            .by_id
            .values()
            .filter(|s| subscriber.is_none_or(|name| s.subscriber.as_deref() == Some(name)))
            .map(Subscription::info)
            .collect();
        infos.sort_by_key(|i| i.created_at);
        infos
    }

    pub fn stats(&self) -> BusStats {
        let index = self.inner.index.read();
        let patterns: HashSet<&str> = index.by_id.values().map(|s| s.pattern.as_str()).collect();
        BusStats {
            subscriptions: index.by_id.len(),
            patterns: patterns.len(),
            wildcard_subscriptions: index.wildcard.len(),
            history_size: self.inner.history.lock().len(),
            pending_requests: self.inner.pending_requests.load(Ordering::Relaxed),
            published_total: self.inner.published_total.load(Ordering::Relaxed),
        }
    }
}

/// Tracks an in-flight request; detaches the reply subscription when dropped,
/// including when the caller abandons the request future.
struct PendingRequest<'a> {
    bus: &'a MessageBus,
    reply_sub: SubscriptionId,
}

impl<'a> PendingRequest<'a> {
    fn new(bus: &'a MessageBus, reply_sub: SubscriptionId) -> Self {
        bus.inner.pending_requests.fetch_add(1, Ordering::Relaxed);
        Self { bus, reply_sub }
    }
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        self.bus.unsubscribe(&self.reply_sub);
        self.bus.inner.pending_requests.fetch_sub(1, Ordering::Relaxed);
    }
}

async fn run_subscription(
    bus: Weak<BusInner>,
    id: SubscriptionId,
    mut queue: mpsc::UnboundedReceiver<Message>,
    handler: MessageHandler,
) {
    while let Some(message) = queue.recv().await {
        let outcome = AssertUnwindSafe(handler(message.clone()))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(Some(reply))) => {
                if message.reply_to.is_some() {
                    match bus.upgrade() {
                        Some(inner) => {
                            MessageBus { inner }.respond(&message, reply);
                        }
                        None => break,
                    }
                }
            }
            Ok(Ok(None)) => {}
            Ok(Err(e)) => {
                metrics::counter!("convoy_bus_handler_failures_total").increment(1);
                error!(
                    subscription_id = %id,
                    topic = %message.topic,
                    message_id = %message.id,
                    error = %e,
                    "Message handler failed"
                );
            }
            Err(_) => {
                metrics::counter!("convoy_bus_handler_failures_total").increment(1);
                error!(
                    subscription_id = %id,
                    topic = %message.topic,
                    message_id = %message.id,
                    "Message handler panicked"
                );
            }
        }
    }
    debug!(subscription_id = %id, "Subscription worker stopped");
}
