// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
// Redis transport for the message bus
//
// Every message published in this process is written as JSON to one shared
// pub/sub channel, and every message read from that channel is handed to
// `MessageBus::deliver_remote`. Buses in other processes subscribed to the
// same channel therefore see each other's topics, including heartbeats and
// request/response traffic.

use futures::StreamExt;
use redis::AsyncCommands;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::application::message_bus::{BridgeConfig, MessageBus};
use crate::domain::message::Message;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Timed out connecting to Redis")]
    Timeout,
}

/// Running bridge between a local bus and a Redis channel.
pub struct RedisBusBridge {
    bus: MessageBus,
    channel: String,
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl RedisBusBridge {
    pub async fn connect(bus: &MessageBus, config: &BridgeConfig) -> Result<Self, BridgeError> {
        let client = redis::Client::open(config.url.as_str())?;
        let (publisher, mut pubsub) = tokio::time::timeout(CONNECT_TIMEOUT, async {
            let publisher = client.get_multiplexed_async_connection().await?;
            let pubsub = client.get_async_pubsub().await?;
            Ok::<_, redis::RedisError>((publisher, pubsub))
        })
        .await
        .map_err(|_| BridgeError::Timeout)??;
        pubsub.subscribe(config.channel.as_str()).await?;

        let token = CancellationToken::new();
        let outbound = bus.attach_bridge();
        let handles = vec![
            tokio::spawn(forward(
                outbound,
                publisher,
                config.channel.clone(),
                token.clone(),
            )),
            tokio::spawn(listen(pubsub, bus.clone(), token.clone())),
        ];

        info!(channel = %config.channel, instance_id = %bus.instance_id(), "Message bus bridged over Redis");
        Ok(Self {
            bus: bus.clone(),
            channel: config.channel.clone(),
            token,
            handles,
        })
    }

    /// Connect, or keep the bus local with a warning when Redis is unreachable.
    pub async fn connect_or_local(bus: &MessageBus, config: &BridgeConfig) -> Option<Self> {
        match Self::connect(bus, config).await {
            Ok(bridge) => Some(bridge),
            Err(e) => {
                warn!(channel = %config.channel, error = %e, "Redis unavailable, using local bus only");
                None
            }
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn shutdown(&self) {
        self.token.cancel();
        self.bus.detach_bridge();
        self.handles.iter().for_each(JoinHandle::abort);
        debug!(channel = %self.channel, "Message bus bridge stopped");
    }
}

async fn forward(
    mut outbound: tokio::sync::mpsc::UnboundedReceiver<Message>,
    mut publisher: redis::aio::MultiplexedConnection,
    channel: String,
    token: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = token.cancelled() => break,
            message = outbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        let body = match serde_json::to_string(&message) {
            Ok(body) => body,
            Err(e) => {
                error!(message_id = %message.id, error = %e, "Failed to encode message for Redis");
                continue;
            }
        };
        if let Err(e) = publisher
            .publish::<_, _, ()>(channel.as_str(), body)
            .await
        {
            error!(message_id = %message.id, topic = %message.topic, error = %e, "Redis publish failed");
        }
    }
}

async fn listen(pubsub: redis::aio::PubSub, bus: MessageBus, token: CancellationToken) {
    let mut messages = pubsub.into_on_message();
    loop {
        let msg = tokio::select! {
            _ = token.cancelled() => break,
            msg = messages.next() => match msg {
                Some(msg) => msg,
                None => {
                    warn!("Redis subscription closed, bus is local only");
                    break;
                }
            },
        };
        let body: String = match msg.get_payload() {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "Unreadable Redis payload");
                continue;
            }
        };
        match serde_json::from_str::<Message>(&body) {
            Ok(message) => {
                bus.deliver_remote(message);
            }
            Err(e) => warn!(error = %e, "Dropping undecodable bridged message"),
        }
    }
}
