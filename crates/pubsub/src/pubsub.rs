//! Redis Pub/Sub room broadcast.

#![allow(missing_docs)]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use fred::clients::{Client, SubscriberClient};
use fred::error::Error as RedisError;
use fred::interfaces::{ClientLike, EventInterface, PubsubInterface};
use fred::types::config::Config as RedisConfig;
use tally_common::{AppError, AppResult, RoomId};
use tally_core::services::{BroadcastMessage, Broadcaster};
use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const ROOM_CHANNEL_CAPACITY: usize = 64;

/// Redis channel carrying one room's broadcasts.
#[must_use]
pub fn room_channel(prefix: &str, room: &RoomId) -> String {
    format!("{prefix}:room:{room}")
}

type RoomSenders = Arc<RwLock<HashMap<String, broadcast::Sender<BroadcastMessage>>>>;

/// Room broadcast over Redis Pub/Sub.
///
/// One subscriber connection serves every room of the process; messages are
/// fanned out locally by channel name.
pub struct RedisPubSub {
    publisher: Client,
    subscriber: SubscriberClient,
    prefix: String,
    rooms: RoomSenders,
    tasks: Vec<JoinHandle<()>>,
}

impl RedisPubSub {
    /// Connect and start the message loop.
    pub async fn new(redis_url: &str, prefix: impl Into<String>) -> Result<Self, RedisError> {
        let config = RedisConfig::from_url(redis_url)?;

        let publisher = Client::new(config.clone(), None, None, None);
        publisher.init().await?;

        let subscriber = SubscriberClient::new(config, None, None, None);
        subscriber.init().await?;
        // Re-subscribe to every room channel after a reconnect.
        let resubscribe = subscriber.manage_subscriptions();

        let rooms: RoomSenders = Arc::new(RwLock::new(HashMap::new()));
        let dispatch_rooms = rooms.clone();
        let mut message_stream = subscriber.message_rx();

        let message_loop = tokio::spawn(async move {
            loop {
                match message_stream.recv().await {
                    Ok(message) => {
                        let Some(payload) = message.value.as_string() else {
                            continue;
                        };
                        dispatch(&dispatch_rooms, &message.channel, &payload).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Pub/Sub message stream lagged by {} messages", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            info!("Pub/Sub message stream ended");
        });

        info!("Redis Pub/Sub initialized");

        Ok(Self {
            publisher,
            subscriber,
            prefix: prefix.into(),
            rooms,
            tasks: vec![resubscribe, message_loop],
        })
    }

    /// Channel name for a room under this instance's prefix.
    #[must_use]
    pub fn channel_for(&self, room: &RoomId) -> String {
        room_channel(&self.prefix, room)
    }

    /// Number of rooms with a live Redis subscription.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Shutdown the Pub/Sub manager.
    pub async fn shutdown(&self) -> Result<(), RedisError> {
        for task in &self.tasks {
            task.abort();
        }
        self.rooms.write().await.clear();
        self.subscriber.quit().await?;
        self.publisher.quit().await?;
        info!("Redis Pub/Sub shutdown");
        Ok(())
    }
}

impl Drop for RedisPubSub {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[async_trait]
impl Broadcaster for RedisPubSub {
    async fn publish(&self, room: &RoomId, message: &BroadcastMessage) -> AppResult<()> {
        let channel = self.channel_for(room);
        let payload = serde_json::to_string(message)?;
        let _: () = self
            .publisher
            .publish(channel.as_str(), payload)
            .await
            .map_err(|e| AppError::Redis(e.to_string()))?;
        debug!(channel, event = ?message.event, "Published room broadcast");
        Ok(())
    }

    async fn subscribe(&self, room: &RoomId) -> AppResult<broadcast::Receiver<BroadcastMessage>> {
        let channel = self.channel_for(room);
        let mut rooms = self.rooms.write().await;
        if let Some(sender) = rooms.get(&channel) {
            return Ok(sender.subscribe());
        }

        self.subscriber
            .subscribe(channel.as_str())
            .await
            .map_err(|e| AppError::Redis(e.to_string()))?;
        debug!(channel, "Subscribed to room channel");

        let (sender, receiver) = broadcast::channel(ROOM_CHANNEL_CAPACITY);
        rooms.insert(channel, sender);
        Ok(receiver)
    }

    async fn unsubscribe(&self, room: &RoomId) -> AppResult<()> {
        let channel = self.channel_for(room);
        let mut rooms = self.rooms.write().await;
        let idle = rooms
            .get(&channel)
            .is_some_and(|sender| sender.receiver_count() == 0);
        if !idle {
            return Ok(());
        }

        rooms.remove(&channel);
        self.subscriber
            .unsubscribe(channel.as_str())
            .await
            .map_err(|e| AppError::Redis(e.to_string()))?;
        debug!(channel, "Unsubscribed from room channel");
        Ok(())
    }
}

async fn dispatch(rooms: &RoomSenders, channel: &str, payload: &str) {
    let message = match serde_json::from_str::<BroadcastMessage>(payload) {
        Ok(message) => message,
        Err(e) => {
            warn!(channel, "Failed to parse room broadcast: {}", e);
            return;
        }
    };

    let rooms = rooms.read().await;
    let Some(sender) = rooms.get(channel) else {
        return;
    };
    debug!(channel, event = ?message.event, origin = %message.origin, "Received room broadcast");
    if sender.send(message).is_err() {
        debug!(channel, "No local subscribers for room broadcast");
    }
}
