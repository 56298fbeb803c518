//! Redis Streams channel. One stream per topic, one consumer group shared by every process.
//!
//! A delivery is a stream entry read through the group; it stays in the group's pending list
//! until acked. Entries pending longer than the visibility timeout are claimed by the next
//! receiver, which is how a crashed consumer's work comes back. A release backdates the
//! entry so that happens right away.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{
    StreamClaimOptions, StreamClaimReply, StreamId, StreamMaxlen, StreamPendingCountReply,
    StreamReadOptions, StreamReadReply,
};
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::channel::{ChannelError, Delivery, MessageChannel, Topic, WorkItem};

const GROUP: &str = "screener";
const ITEM_FIELD: &str = "item";
/// Owner of released entries until a receiver reclaims them.
const RELEASED_CONSUMER: &str = "released";
/// Approximate cap per stream; acked history beyond this is trimmed.
const STREAM_MAXLEN: usize = 100_000;

pub struct RedisChannel {
    client: redis::Client,
    manager: ConnectionManager,
    /// XREADGROUP BLOCK stalls the whole connection, so blocking reads get their own per topic.
    blocking: Mutex<HashMap<Topic, MultiplexedConnection>>,
    visibility_timeout: Duration,
}

impl std::fmt::Debug for RedisChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisChannel")
            .field("visibility_timeout", &self.visibility_timeout)
            .finish()
    }
}

impl RedisChannel {
    pub async fn connect(url: &str, visibility_timeout: Duration) -> Result<Self, ChannelError> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client.clone()).await?;
        info!("Redis channel connected");
        Ok(Self {
            client,
            manager,
            blocking: Mutex::new(HashMap::new()),
            visibility_timeout,
        })
    }

    async fn blocking_connection(&self, topic: Topic) -> Result<MultiplexedConnection, ChannelError> {
        let mut conns = self.blocking.lock().await;
        if let Some(conn) = conns.get(&topic) {
            return Ok(conn.clone());
        }
        let conn = self.client.get_multiplexed_tokio_connection().await?;
        conns.insert(topic, conn.clone());
        Ok(conn)
    }

    async fn forget_blocking_connection(&self, topic: Topic) {
        self.blocking.lock().await.remove(&topic);
    }

    /// Claims one entry another consumer left pending past the visibility timeout.
    async fn claim_stale(
        &self,
        topic: Topic,
        consumer: &str,
    ) -> Result<Option<Delivery>, ChannelError> {
        let mut conn = self.manager.clone();
        let pending: StreamPendingCountReply = conn
            .xpending_count(topic.name(), GROUP, "-", "+", 10)
            .await?;

        let min_idle = self.visibility_timeout.as_millis() as usize;
        for entry in pending
            .ids
            .iter()
            .filter(|p| p.last_delivered_ms >= min_idle)
        {
            let claimed: StreamClaimReply = conn
                .xclaim(topic.name(), GROUP, consumer, min_idle, &[&entry.id])
                .await?;
            // Someone else may have claimed it between XPENDING and XCLAIM.
            let Some(stream_id) = claimed.ids.into_iter().next() else {
                continue;
            };
            // XCLAIM has already bumped the delivery counter.
            let attempt = entry.times_delivered as u32 + 1;
            info!(
                "Reclaimed {} on {} after {}ms idle (attempt {attempt})",
                entry.id, topic, entry.last_delivered_ms
            );
            if let Some(delivery) = self.decode(topic, stream_id, attempt).await? {
                return Ok(Some(delivery));
            }
        }
        Ok(None)
    }

    /// Turns a stream entry into a delivery. Entries that cannot be decoded are acked and
    /// dropped, since redelivering them would never succeed.
    async fn decode(
        &self,
        topic: Topic,
        entry: StreamId,
        attempt: u32,
    ) -> Result<Option<Delivery>, ChannelError> {
        let raw: Option<String> = entry.get(ITEM_FIELD);
        let parsed = raw
            .as_deref()
            .map(serde_json::from_str::<WorkItem>)
            .transpose();
        match parsed {
            Ok(Some(mut item)) => {
                item.attempt = attempt;
                Ok(Some(Delivery {
                    topic,
                    receipt: entry.id,
                    item,
                }))
            }
            Ok(None) | Err(_) => {
                warn!("Dropping malformed entry {} on {}", entry.id, topic);
                let mut conn = self.manager.clone();
                let _: i64 = conn.xack(topic.name(), GROUP, &[&entry.id]).await?;
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl MessageChannel for RedisChannel {
    async fn ensure_topics(&self, topics: &[Topic]) -> Result<(), ChannelError> {
        let mut conn = self.manager.clone();
        for topic in topics {
            let created: redis::RedisResult<()> =
                conn.xgroup_create_mkstream(topic.name(), GROUP, "0").await;
            match created {
                Ok(()) => info!("Created consumer group '{GROUP}' on {topic}"),
                Err(e) if e.code() == Some("BUSYGROUP") => {
                    debug!("Consumer group '{GROUP}' already exists on {topic}")
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn publish(&self, item: &WorkItem) -> Result<(), ChannelError> {
        let body = serde_json::to_string(item)?;
        let mut conn = self.manager.clone();
        let entry_id: String = conn
            .xadd_maxlen(
                item.topic.name(),
                StreamMaxlen::Approx(STREAM_MAXLEN),
                "*",
                &[(ITEM_FIELD, body)],
            )
            .await?;
        debug!("Published {} to {} as {entry_id}", item.id, item.topic);
        Ok(())
    }

    async fn receive(
        &self,
        topic: Topic,
        consumer: &str,
        wait: Duration,
    ) -> Result<Option<Delivery>, ChannelError> {
        if let Some(delivery) = self.claim_stale(topic, consumer).await? {
            return Ok(Some(delivery));
        }

        let opts = StreamReadOptions::default()
            .group(GROUP, consumer)
            .count(1)
            .block(wait.as_millis().max(1) as usize);
        let mut conn = self.blocking_connection(topic).await?;
        let reply: Option<StreamReadReply> =
            match conn.xread_options(&[topic.name()], &[">"], &opts).await {
                Ok(reply) => reply,
                Err(e) => {
                    self.forget_blocking_connection(topic).await;
                    return Err(e.into());
                }
            };

        let entry = reply
            .and_then(|r| r.keys.into_iter().next())
            .and_then(|k| k.ids.into_iter().next());
        match entry {
            Some(entry) => self.decode(topic, entry, 1).await,
            None => Ok(None),
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), ChannelError> {
        let mut conn = self.manager.clone();
        let acked: i64 = conn
            .xack(delivery.topic.name(), GROUP, &[&delivery.receipt])
            .await?;
        if acked == 0 {
            debug!(
                "Entry {} on {} was already acked or reclaimed",
                delivery.receipt, delivery.topic
            );
        }
        Ok(())
    }

    async fn release(&self, delivery: &Delivery) -> Result<(), ChannelError> {
        // Streams have no nack. Backdating the entry's idle time makes the next receiver
        // reclaim it; JUSTID leaves the delivery counter alone.
        let mut conn = self.manager.clone();
        let opts = StreamClaimOptions::default()
            .idle(self.visibility_timeout.as_millis() as usize)
            .with_justid();
        let claimed: Vec<String> = conn
            .xclaim_options(
                delivery.topic.name(),
                GROUP,
                RELEASED_CONSUMER,
                0,
                &[&delivery.receipt],
                opts,
            )
            .await?;
        if claimed.is_empty() {
            debug!(
                "Entry {} on {} was acked before it could be released",
                delivery.receipt, delivery.topic
            );
        } else {
            debug!("Released {} on {}", delivery.receipt, delivery.topic);
        }
        Ok(())
    }

    fn provider_name(&self) -> &'static str {
        "redis-streams"
    }
}
