// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Message and topic types carried by the [`MessageBus`](crate::application::message_bus::MessageBus).
//!
//! Topics are dot-separated strings (`orchestrator.agent_started`). A subscription
//! pattern is either an exact topic or a glob containing `*` (`session.*`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use super::prefixed_id;

/// Topic every broadcast message is published on.
pub const BROADCAST_TOPIC: &str = "__broadcast__";

/// Prefix of the short-lived topics used for request/response replies.
pub const REPLY_TOPIC_PREFIX: &str = "__reply__.";

pub const DEFAULT_MESSAGE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new() -> Self {
        Self(prefixed_id("msg-", 12))
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(pub String);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(prefixed_id("sub-", 8))
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    Event,
    Request,
    Response,
    Broadcast,
    Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Immutable envelope routed by the bus. The payload is opaque to the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub topic: String,
    pub payload: serde_json::Value,
    pub sender: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub priority: MessagePriority,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: MessageId::new(),
            message_type: MessageType::Event,
            topic: topic.into(),
            payload,
            sender: None,
            timestamp: Utc::now(),
            priority: MessagePriority::Normal,
            correlation_id: None,
            reply_to: None,
            ttl: DEFAULT_MESSAGE_TTL,
            metadata: HashMap::new(),
        }
    }

    pub fn with_type(mut self, message_type: MessageType) -> Self {
        self.message_type = message_type;
        self
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.message_type == MessageType::Broadcast
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(self.ttl) {
            Ok(ttl) => now - self.timestamp > ttl,
            Err(_) => false,
        }
    }
}

/// A compiled subscription pattern.
#[derive(Debug, Clone)]
pub enum TopicPattern {
    Exact(String),
    Wildcard { raw: String, glob: glob::Pattern },
}

impl TopicPattern {
    /// Compile `pattern`. Patterns without `*` match their topic literally; an
    /// unparsable glob also degrades to a literal match.
    pub fn parse(pattern: &str) -> Self {
        if pattern.contains('*') {
            match glob::Pattern::new(pattern) {
                Ok(glob) => {
                    return TopicPattern::Wildcard {
                        raw: pattern.to_string(),
                        glob,
                    }
                }
                Err(e) => {
                    tracing::warn!(pattern, error = %e, "Invalid topic pattern, matching literally");
                }
            }
        }
        TopicPattern::Exact(pattern.to_string())
    }

    pub fn as_str(&self) -> &str {
        match self {
            TopicPattern::Exact(raw) => raw,
            TopicPattern::Wildcard { raw, .. } => raw,
        }
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, TopicPattern::Wildcard { .. })
    }

    pub fn matches(&self, topic: &str) -> bool {
        match self {
            TopicPattern::Exact(raw) => raw == topic,
            TopicPattern::Wildcard { glob, .. } => glob.matches(topic),
        }
    }
}

/// Public view of a subscription held by the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    pub id: SubscriptionId,
    pub pattern: String,
    pub subscriber: Option<String>,
    pub has_filter: bool,
    pub created_at: DateTime<Utc>,
}
