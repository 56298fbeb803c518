//! Durable, topic-addressed transport between the orchestrator and stages.
//!
//! Delivery is at-least-once. A consumer acks only after its effects are durable; anything
//! left unacked becomes visible again after the visibility timeout with a higher attempt count.
//! Ordering is best-effort within a topic and never relied on.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

pub mod memory;
pub mod message;
pub mod redis;
pub mod topic;

pub use message::{Payload, StageResult, Subject, WorkItem};
pub use topic::{Stage, Topic};

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("Message serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A received, not yet acknowledged message.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: Topic,
    /// Provider handle used to ack or release this delivery.
    pub receipt: String,
    pub item: WorkItem,
}

impl Delivery {
    pub fn attempt(&self) -> u32 {
        self.item.attempt
    }
}

/// Consumer name for one receiving loop. Unique per call: container processes often share
/// a pid, and two receivers under one name would steal each other's pending entries.
pub fn consumer_name(role: impl fmt::Display) -> String {
    let instance = Uuid::new_v4().simple().to_string();
    let instance = &instance[..12];
    match std::env::var("HOSTNAME") {
        Ok(host) if !host.trim().is_empty() => format!("{role}-{}-{instance}", host.trim()),
        _ => format!("{role}-{instance}"),
    }
}

#[async_trait]
pub trait MessageChannel: Send + Sync + 'static {
    /// Creates topics and consumer groups. Safe to call from every process on startup.
    async fn ensure_topics(&self, topics: &[Topic]) -> Result<(), ChannelError>;

    async fn publish(&self, item: &WorkItem) -> Result<(), ChannelError>;

    /// Waits at most `wait` for the next visible message on `topic`.
    /// Returns `Ok(None)` on timeout so the caller can yield.
    async fn receive(
        &self,
        topic: Topic,
        consumer: &str,
        wait: Duration,
    ) -> Result<Option<Delivery>, ChannelError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), ChannelError>;

    /// Gives a delivery back without acking it. Providers without an explicit nack
    /// leave it to the visibility timeout.
    async fn release(&self, delivery: &Delivery) -> Result<(), ChannelError>;

    fn provider_name(&self) -> &'static str;
}
