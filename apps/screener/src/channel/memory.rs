//! In-process channel with visibility-timeout redelivery.
//!
//! Used by tests and by `--mode all` when no Redis is configured. Shares nothing across
//! processes, so it can never back a split deployment.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::channel::{ChannelError, Delivery, MessageChannel, Topic, WorkItem};

/// Nothing in-process consumes `pipeline.failures`; beyond this many the oldest are dropped.
const FAILURE_BACKLOG: usize = 1024;

#[derive(Debug, Clone)]
struct Stored {
    item: WorkItem,
    deliveries: u32,
}

#[derive(Debug)]
struct InFlight {
    stored: Stored,
    visible_at: Instant,
}

#[derive(Debug, Default)]
struct TopicQueue {
    ready: VecDeque<Stored>,
    in_flight: HashMap<String, InFlight>,
}

impl TopicQueue {
    /// Moves every in-flight message whose visibility timeout has passed back to the front.
    fn expire(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.visible_at <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();
        for receipt in expired {
            if let Some(flight) = self.in_flight.remove(&receipt) {
                self.ready.push_front(flight.stored);
            }
        }
    }
}

pub struct MemoryChannel {
    topics: Mutex<HashMap<Topic, TopicQueue>>,
    arrivals: Notify,
    visibility_timeout: Duration,
    next_receipt: AtomicU64,
    failure_backlog: usize,
}

impl MemoryChannel {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            arrivals: Notify::new(),
            visibility_timeout,
            next_receipt: AtomicU64::new(1),
            failure_backlog: FAILURE_BACKLOG,
        }
    }

    #[cfg(test)]
    pub fn with_failure_backlog(mut self, cap: usize) -> Self {
        self.failure_backlog = cap;
        self
    }

    async fn try_take(&self, topic: Topic) -> (Option<Delivery>, Option<Instant>) {
        let mut topics = self.topics.lock().await;
        let queue = topics.entry(topic).or_default();
        let now = Instant::now();
        queue.expire(now);

        if let Some(mut stored) = queue.ready.pop_front() {
            stored.deliveries += 1;
            let receipt = format!(
                "{}-{}",
                topic.name(),
                self.next_receipt.fetch_add(1, Ordering::Relaxed)
            );
            let mut item = stored.item.clone();
            item.attempt = stored.deliveries;
            queue.in_flight.insert(
                receipt.clone(),
                InFlight {
                    stored,
                    visible_at: now + self.visibility_timeout,
                },
            );
            return (
                Some(Delivery {
                    topic,
                    receipt,
                    item,
                }),
                None,
            );
        }

        let next_visible = queue.in_flight.values().map(|f| f.visible_at).min();
        (None, next_visible)
    }

    /// Every message on `topic` that has not been acked, in-flight ones included.
    #[cfg(test)]
    pub async fn unacked(&self, topic: Topic) -> Vec<WorkItem> {
        let topics = self.topics.lock().await;
        topics
            .get(&topic)
            .map(|q| {
                q.ready
                    .iter()
                    .map(|s| s.item.clone())
                    .chain(q.in_flight.values().map(|f| f.stored.item.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Removes and returns every ready message on `topic`.
    #[cfg(test)]
    pub async fn drain(&self, topic: Topic) -> Vec<WorkItem> {
        let mut topics = self.topics.lock().await;
        topics
            .get_mut(&topic)
            .map(|q| q.ready.drain(..).map(|s| s.item).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl MessageChannel for MemoryChannel {
    async fn ensure_topics(&self, topics: &[Topic]) -> Result<(), ChannelError> {
        let mut queues = self.topics.lock().await;
        for topic in topics {
            queues.entry(*topic).or_default();
        }
        Ok(())
    }

    async fn publish(&self, item: &WorkItem) -> Result<(), ChannelError> {
        {
            let mut topics = self.topics.lock().await;
            let queue = topics.entry(item.topic).or_default();
            queue.ready.push_back(Stored {
                item: item.clone(),
                deliveries: 0,
            });
            if item.topic == Topic::Failures && queue.ready.len() > self.failure_backlog {
                if let Some(dropped) = queue.ready.pop_front() {
                    warn!(
                        "Failure backlog full; dropped {} ({})",
                        dropped.item.id,
                        dropped.item.payload.subject()
                    );
                }
            }
        }
        debug!("Published {} to {}", item.id, item.topic);
        self.arrivals.notify_waiters();
        Ok(())
    }

    async fn receive(
        &self,
        topic: Topic,
        _consumer: &str,
        wait: Duration,
    ) -> Result<Option<Delivery>, ChannelError> {
        let deadline = Instant::now() + wait;
        loop {
            // Register interest before looking so a publish in between is not missed.
            let notified = self.arrivals.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (delivery, next_visible) = self.try_take(topic).await;
            if delivery.is_some() {
                return Ok(delivery);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wake = next_visible.map_or(deadline, |v| v.min(deadline));
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), ChannelError> {
        let mut topics = self.topics.lock().await;
        let removed = topics
            .get_mut(&delivery.topic)
            .and_then(|q| q.in_flight.remove(&delivery.receipt));
        if removed.is_none() {
            // Visibility expired and the message went back to the queue; it will be seen again.
            debug!(
                "Ack for {} on {} arrived after its visibility timeout",
                delivery.receipt, delivery.topic
            );
        }
        Ok(())
    }

    async fn release(&self, delivery: &Delivery) -> Result<(), ChannelError> {
        {
            let mut topics = self.topics.lock().await;
            if let Some(queue) = topics.get_mut(&delivery.topic) {
                if let Some(flight) = queue.in_flight.remove(&delivery.receipt) {
                    queue.ready.push_front(flight.stored);
                }
            }
        }
        self.arrivals.notify_waiters();
        Ok(())
    }

    fn provider_name(&self) -> &'static str {
        "memory"
    }
}
