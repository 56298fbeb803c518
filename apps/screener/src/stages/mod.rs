//! Stage handlers and the worker loop that drives them.
//!
//! A handler turns one work item into a [`StageResult`] or a classified [`StageFailure`].
//! It may be invoked any number of times for the same item and never writes status; the
//! worker publishes what it reports and acks only after that publish succeeded.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channel::{
    consumer_name, ChannelError, Delivery, MessageChannel, Payload, Stage, StageResult, WorkItem,
};
use crate::models::failure::StageFailure;

pub mod matcher;
pub mod notifier;
pub mod prompts;
pub mod resume_parser;
pub mod summarizer;

const RECEIVE_BACKOFF: Duration = Duration::from_secs(1);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

#[async_trait]
pub trait StageHandler: Send + Sync + 'static {
    fn stage(&self) -> Stage;

    async fn handle(&self, item: &WorkItem) -> Result<StageResult, StageFailure>;
}

/// The payload a handler was not built for. Redelivery cannot fix it.
pub(crate) fn wrong_payload(stage: Stage, item: &WorkItem) -> StageFailure {
    StageFailure::permanent(format!(
        "{stage} cannot handle a {} payload",
        item.payload.kind()
    ))
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// In-process retries of a transient failure before the delivery is released.
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Deliveries after which the item is reported as a permanent failure.
    pub max_deliveries: u32,
}

impl RetryPolicy {
    /// Backoff before retry `n` (1-based): base, 2×base, 4×base, … capped.
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 1u32 << retry.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor).min(MAX_RETRY_DELAY)
    }

    /// Backoff before retry `n`, stretched to the collaborator's `retry_after` when it asked
    /// for longer. Still capped.
    pub fn delay_after(&self, retry: u32, failure: &StageFailure) -> Duration {
        let backoff = self.delay(retry);
        failure
            .retry_after
            .map_or(backoff, |hint| hint.max(backoff))
            .min(MAX_RETRY_DELAY)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_deliveries: 5,
        }
    }
}

pub struct StageWorker {
    handler: Arc<dyn StageHandler>,
    channel: Arc<dyn MessageChannel>,
    policy: RetryPolicy,
    wait: Duration,
    consumer: String,
}

impl StageWorker {
    pub fn new(
        handler: Arc<dyn StageHandler>,
        channel: Arc<dyn MessageChannel>,
        policy: RetryPolicy,
        wait: Duration,
    ) -> Self {
        let consumer = consumer_name(handler.stage());
        Self {
            handler,
            channel,
            policy,
            wait,
            consumer,
        }
    }

    pub fn stage(&self) -> Stage {
        self.handler.stage()
    }

    /// Runs the handler, retrying transient failures with backoff.
    async fn attempt(&self, item: &WorkItem) -> Result<StageResult, StageFailure> {
        let mut retry = 0;
        loop {
            match self.handler.handle(item).await {
                Err(failure) if failure.is_transient() && retry < self.policy.max_retries => {
                    retry += 1;
                    let delay = self.policy.delay_after(retry, &failure);
                    warn!(
                        "{} on {} failed transiently ({}); retry {retry}/{} in {}ms",
                        self.stage(),
                        item.payload.subject(),
                        failure.detail,
                        self.policy.max_retries,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
                outcome => return outcome,
            }
        }
    }

    /// Handles one delivery: report, then ack. A transient failure that outlived its retries
    /// is released, not reported.
    pub async fn process(&self, delivery: &Delivery) -> Result<(), ChannelError> {
        let stage = self.stage();
        let subject = delivery.item.payload.subject();

        let outcome = if delivery.attempt() > self.policy.max_deliveries {
            Err(StageFailure::permanent(format!(
                "gave up after {} deliveries",
                self.policy.max_deliveries
            )))
        } else {
            self.attempt(&delivery.item).await
        };

        let report = match outcome {
            Ok(result) => {
                info!("{stage} completed for {subject}");
                Payload::StageCompleted {
                    stage,
                    subject,
                    result,
                }
            }
            Err(failure) if failure.is_transient() => {
                warn!(
                    "{stage} for {subject} still failing after {} retries; releasing delivery {}",
                    self.policy.max_retries,
                    delivery.attempt()
                );
                return self.channel.release(delivery).await;
            }
            Err(failure) => {
                error!("{stage} failed permanently for {subject}: {}", failure.detail);
                Payload::StageFailed {
                    stage,
                    subject,
                    failure,
                }
            }
        };

        self.channel.publish(&WorkItem::new(report)).await?;
        self.channel.ack(delivery).await
    }

    /// Consumes the stage's input topic until `cancel` fires. Stops only between deliveries.
    pub async fn run(self, cancel: CancellationToken) {
        let stage = self.stage();
        let topic = stage.input_topic();
        info!(
            "{stage} worker {} consuming {topic} via {}",
            self.consumer,
            self.channel.provider_name()
        );

        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                r = self.channel.receive(topic, &self.consumer, self.wait) => r,
            };
            match received {
                Ok(Some(delivery)) => {
                    if let Err(e) = self.process(&delivery).await {
                        // Unacked; the channel will redeliver it.
                        warn!("{stage} could not settle {}: {e}", delivery.item.id);
                    }
                }
                Ok(None) => debug!("{stage} idle on {topic}"),
                Err(e) => {
                    warn!("{stage} receive on {topic} failed: {e}");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(RECEIVE_BACKOFF) => {}
                    }
                }
            }
        }
        info!("{stage} worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::channel::memory::MemoryChannel;
    use crate::channel::{Subject, Topic};
    use crate::models::failure::FailureKind;
    use crate::models::job::JobSummary;

    /// Replays a fixed sequence of outcomes, then keeps returning the last one.
    struct Scripted {
        outcomes: Mutex<Vec<Result<StageResult, StageFailure>>>,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(outcomes: Vec<Result<StageResult, StageFailure>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes),
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl StageHandler for Scripted {
        fn stage(&self) -> Stage {
            Stage::Summarize
        }

        async fn handle(&self, _item: &WorkItem) -> Result<StageResult, StageFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut outcomes = self.outcomes.lock().unwrap();
            if outcomes.len() > 1 {
                outcomes.remove(0)
            } else {
                outcomes[0].clone()
            }
        }
    }

    fn summary() -> StageResult {
        StageResult::JobSummary(JobSummary {
            summary: "Backend role".to_string(),
            ..JobSummary::default()
        })
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(100),
            max_deliveries: 3,
        }
    }

    async fn deliver(channel: &MemoryChannel) -> Delivery {
        channel
            .receive(Topic::SummarizeRequested, "test", Duration::from_millis(10))
            .await
            .unwrap()
            .expect("a delivery")
    }

    async fn setup(
        handler: Arc<Scripted>,
    ) -> (Arc<MemoryChannel>, StageWorker) {
        let channel = Arc::new(MemoryChannel::new(Duration::from_secs(60)));
        channel
            .publish(&WorkItem::new(Payload::SummarizeJob {
                job_id: "job123".to_string(),
                title: "Software Engineer".to_string(),
                raw_text: "Python, SQL".to_string(),
            }))
            .await
            .unwrap();
        let worker = StageWorker::new(handler, channel.clone(), policy(), Duration::from_millis(10));
        (channel, worker)
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = policy();
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
        assert_eq!(policy.delay(40), MAX_RETRY_DELAY);
    }

    #[test]
    fn test_retry_after_stretches_backoff() {
        let policy = policy();
        let limited = StageFailure::transient("rate limited")
            .with_retry_after(Some(Duration::from_secs(5)));
        assert_eq!(policy.delay_after(1, &limited), Duration::from_secs(5));

        let short = StageFailure::transient("rate limited")
            .with_retry_after(Some(Duration::from_millis(10)));
        assert_eq!(policy.delay_after(2, &short), Duration::from_millis(200));

        let huge = StageFailure::transient("rate limited")
            .with_retry_after(Some(Duration::from_secs(3600)));
        assert_eq!(policy.delay_after(1, &huge), MAX_RETRY_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_waits_out_rate_limit() {
        let handler = Scripted::new(vec![
            Err(StageFailure::transient("rate limited")
                .with_retry_after(Some(Duration::from_secs(7)))),
            Ok(summary()),
        ]);
        let (channel, worker) = setup(handler.clone()).await;

        let delivery = deliver(&channel).await;
        let started = tokio::time::Instant::now();
        worker.process(&delivery).await.unwrap();

        assert!(started.elapsed() >= Duration::from_secs(7));
        assert_eq!(handler.calls(), 2);
        assert_eq!(channel.drain(Topic::JobSummarized).await.len(), 1);
    }

    #[test]
    fn test_workers_get_distinct_consumer_names() {
        let channel = Arc::new(MemoryChannel::new(Duration::from_secs(60)));
        let handler = Scripted::new(vec![Ok(summary())]);
        let first = StageWorker::new(handler.clone(), channel.clone(), policy(), Duration::ZERO);
        let second = StageWorker::new(handler, channel, policy(), Duration::ZERO);
        assert_ne!(first.consumer, second.consumer);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_is_published_then_acked() {
        let handler = Scripted::new(vec![Ok(summary())]);
        let (channel, worker) = setup(handler.clone()).await;

        let delivery = deliver(&channel).await;
        worker.process(&delivery).await.unwrap();

        assert!(channel.unacked(Topic::SummarizeRequested).await.is_empty());
        let reports = channel.drain(Topic::JobSummarized).await;
        assert_eq!(reports.len(), 1);
        assert_eq!(
            reports[0].payload,
            Payload::StageCompleted {
                stage: Stage::Summarize,
                subject: Subject::job("job123"),
                result: summary(),
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried_in_process() {
        let handler = Scripted::new(vec![
            Err(StageFailure::transient("connection refused")),
            Ok(summary()),
        ]);
        let (channel, worker) = setup(handler.clone()).await;

        let delivery = deliver(&channel).await;
        worker.process(&delivery).await.unwrap();

        assert_eq!(handler.calls(), 2);
        assert_eq!(channel.drain(Topic::JobSummarized).await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_transient_failure_is_released_unreported() {
        let handler = Scripted::new(vec![Err(StageFailure::transient("timeout"))]);
        let (channel, worker) = setup(handler.clone()).await;

        let delivery = deliver(&channel).await;
        worker.process(&delivery).await.unwrap();

        assert_eq!(handler.calls(), 3);
        assert!(channel.drain(Topic::JobSummarized).await.is_empty());
        // Released for redelivery, with a higher attempt count.
        let again = deliver(&channel).await;
        assert_eq!(again.attempt(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_is_reported_without_retry() {
        let handler = Scripted::new(vec![Err(StageFailure::permanent("empty description"))]);
        let (channel, worker) = setup(handler.clone()).await;

        let delivery = deliver(&channel).await;
        worker.process(&delivery).await.unwrap();

        assert_eq!(handler.calls(), 1);
        assert!(channel.unacked(Topic::SummarizeRequested).await.is_empty());
        let reports = channel.drain(Topic::JobSummarized).await;
        match &reports[0].payload {
            Payload::StageFailed { failure, .. } => {
                assert_eq!(failure.kind, FailureKind::Permanent);
                assert_eq!(failure.detail, "empty description");
            }
            other => panic!("expected a failure report, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_too_many_deliveries_become_permanent() {
        let handler = Scripted::new(vec![Err(StageFailure::transient("timeout"))]);
        let (channel, worker) = setup(handler.clone()).await;

        for _ in 0..3 {
            let delivery = deliver(&channel).await;
            worker.process(&delivery).await.unwrap();
        }
        let calls_before = handler.calls();

        let fourth = deliver(&channel).await;
        assert_eq!(fourth.attempt(), 4);
        worker.process(&fourth).await.unwrap();

        assert_eq!(handler.calls(), calls_before);
        let reports = channel.drain(Topic::JobSummarized).await;
        assert_eq!(reports.len(), 1);
        assert!(matches!(
            &reports[0].payload,
            Payload::StageFailed { failure, .. } if failure.kind == FailureKind::Permanent
        ));
        assert!(channel.unacked(Topic::SummarizeRequested).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_cancel() {
        let handler = Scripted::new(vec![Ok(summary())]);
        let (channel, worker) = setup(handler.clone()).await;
        let cancel = CancellationToken::new();
        let running = tokio::spawn(worker.run(cancel.clone()));

        for _ in 0..50 {
            if !channel.drain(Topic::JobSummarized).await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(handler.calls(), 1);

        cancel.cancel();
        running.await.unwrap();
    }
}
