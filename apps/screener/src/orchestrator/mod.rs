//! The orchestrator owns every status transition.
//!
//! It admits new jobs and resumes, consumes stage completions, pairs ready entities, applies
//! the threshold policy, and relays the outbox onto the channel. Stage handlers never change
//! status; they only report.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channel::{
    consumer_name, Delivery, MessageChannel, Payload, Stage, StageResult, Subject, Topic,
    WorkItem,
};
use crate::errors::PipelineError;
use crate::models::candidate::{CandidateStatus, NewCandidate};
use crate::models::failure::{FailureNote, StageFailure};
use crate::models::job::{JobStatus, NewJob};
use crate::models::matching::{Decision, InviteContext, MatchScore, PairKey};
use crate::store::{Admission, Advance, InviteOutcome, MatchWrite, Origin, StateStore};

pub mod intake;
pub mod policy;
pub mod watcher;


use intake::InputFile;
use watcher::InputWatcher;

const OUTBOX_BATCH: usize = 100;
const RECEIVE_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct InputDirs {
    pub jd_dir: PathBuf,
    pub resume_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Minimum score that earns an invite. Fixed for the life of the process.
    pub threshold: f64,
    pub channel_wait: Duration,
    pub outbox_interval: Duration,
}

/// What happened to a submission that was not rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Accepted,
    Reopened,
    /// Identical content already recorded; nothing emitted.
    Duplicate,
}

fn pair_of(job_id: &str, candidate_id: &str) -> PairKey {
    PairKey::new(job_id, candidate_id)
}

pub struct Orchestrator {
    store: Arc<dyn StateStore>,
    channel: Arc<dyn MessageChannel>,
    settings: OrchestratorSettings,
    /// Serializes relay passes so entries go out in sequence order.
    relay: Mutex<()>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn StateStore>,
        channel: Arc<dyn MessageChannel>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            store,
            channel,
            settings,
            relay: Mutex::new(()),
        }
    }

    pub fn threshold(&self) -> f64 {
        self.settings.threshold
    }

    pub fn channel_provider(&self) -> &'static str {
        self.channel.provider_name()
    }

    /// Records a job. `origin` decides whether an identical `failed` record is retried.
    pub async fn submit_job(
        &self,
        job: NewJob,
        origin: Origin,
    ) -> Result<Submission, PipelineError> {
        let submission = match self.store.admit_job(&job, origin).await? {
            Admission::Created => {
                info!("Job {} ingested ({})", job.job_id, job.title);
                Submission::Accepted
            }
            Admission::Reopened => {
                info!("Job {} reopened after failure", job.job_id);
                Submission::Reopened
            }
            Admission::Unchanged(JobStatus::Failed) => {
                info!(
                    "Job {} failed earlier with this content; resubmit it through the API to retry",
                    job.job_id
                );
                return Ok(Submission::Duplicate);
            }
            Admission::Unchanged(status) => {
                debug!("Job {} already {status}; duplicate submission ignored", job.job_id);
                return Ok(Submission::Duplicate);
            }
            Admission::Conflict(status) => {
                return Err(PipelineError::DuplicateEntity {
                    entity: "job",
                    id: job.job_id,
                    status: status.to_string(),
                })
            }
        };
        self.relay_now().await;
        Ok(submission)
    }

    pub async fn submit_candidate(
        &self,
        candidate: NewCandidate,
        origin: Origin,
    ) -> Result<Submission, PipelineError> {
        let submission = match self.store.admit_candidate(&candidate, origin).await? {
            Admission::Created => {
                info!(
                    "Candidate {} ingested from {}",
                    candidate.candidate_id, candidate.source_ref
                );
                Submission::Accepted
            }
            Admission::Reopened => {
                info!("Candidate {} reopened after failure", candidate.candidate_id);
                Submission::Reopened
            }
            Admission::Unchanged(CandidateStatus::Failed) => {
                info!(
                    "Candidate {} failed earlier from {}; resubmit it through the API to retry",
                    candidate.candidate_id, candidate.source_ref
                );
                return Ok(Submission::Duplicate);
            }
            Admission::Unchanged(status) => {
                debug!(
                    "Candidate {} already {status}; duplicate submission ignored",
                    candidate.candidate_id
                );
                return Ok(Submission::Duplicate);
            }
            Admission::Conflict(status) => {
                return Err(PipelineError::DuplicateEntity {
                    entity: "candidate",
                    id: candidate.candidate_id,
                    status: status.to_string(),
                })
            }
        };
        self.relay_now().await;
        Ok(submission)
    }

    /// Applies one message from a completion topic.
    pub async fn handle(&self, item: &WorkItem) -> Result<(), PipelineError> {
        match &item.payload {
            Payload::StageCompleted {
                stage,
                subject,
                result,
            } if item.topic == stage.output_topic() => {
                self.on_stage_complete(*stage, subject, result).await?
            }
            Payload::StageFailed {
                stage,
                subject,
                failure,
            } if item.topic == stage.output_topic() => {
                self.on_stage_failed(*stage, subject, failure).await?
            }
            other => {
                return Err(PipelineError::UnexpectedPayload(format!(
                    "{} carried a {} payload for {}",
                    item.topic,
                    other.kind(),
                    other.subject()
                )))
            }
        }
        self.relay_now().await;
        Ok(())
    }

    pub async fn on_stage_complete(
        &self,
        stage: Stage,
        subject: &Subject,
        result: &StageResult,
    ) -> Result<(), PipelineError> {
        match (stage, subject, result) {
            (Stage::Summarize, Subject::Job { job_id }, StageResult::JobSummary(summary)) => {
                match self.store.complete_job(job_id, summary).await? {
                    Advance::Advanced { new_pairs } => info!(
                        "Job {job_id} summarized; {} pair(s) ready for matching",
                        new_pairs.len()
                    ),
                    Advance::Unchanged(status) => {
                        debug!("Job {job_id} already {status}; summary ignored")
                    }
                    Advance::Missing => {
                        return Err(PipelineError::InvariantViolation(format!(
                            "summary reported for unknown job {job_id}"
                        )))
                    }
                }
            }
            (
                Stage::ParseResume,
                Subject::Candidate { candidate_id },
                StageResult::CandidateProfile(fields),
            ) => match self.store.complete_candidate(candidate_id, fields).await? {
                Advance::Advanced { new_pairs } => info!(
                    "Candidate {candidate_id} parsed; {} pair(s) ready for matching",
                    new_pairs.len()
                ),
                Advance::Unchanged(status) => {
                    debug!("Candidate {candidate_id} already {status}; profile ignored")
                }
                Advance::Missing => {
                    return Err(PipelineError::InvariantViolation(format!(
                        "profile reported for unknown candidate {candidate_id}"
                    )))
                }
            },
            (
                Stage::Score,
                Subject::Pair {
                    job_id,
                    candidate_id,
                },
                StageResult::MatchScore(score),
            ) => {
                self.on_match_computed(&pair_of(job_id, candidate_id), score)
                    .await?
            }
            (
                Stage::Notify,
                Subject::Pair {
                    job_id,
                    candidate_id,
                },
                StageResult::InviteDelivered {
                    delivered_at,
                    already_sent,
                },
            ) => {
                if *already_sent {
                    debug!("Invite for {job_id}/{candidate_id} had already been sent");
                }
                self.on_invite_reported(
                    &pair_of(job_id, candidate_id),
                    InviteOutcome::Delivered { at: *delivered_at },
                    None,
                )
                .await?
            }
            (stage, subject, _) => {
                return Err(PipelineError::UnexpectedPayload(format!(
                    "{stage} completion for {subject} carries a mismatched result"
                )))
            }
        }
        Ok(())
    }

    /// Marks the entity `failed` (from `ingested` only) and reports it. Never retries.
    pub async fn on_stage_failed(
        &self,
        stage: Stage,
        subject: &Subject,
        failure: &StageFailure,
    ) -> Result<(), PipelineError> {
        let event = WorkItem::new(Payload::PipelineFailure {
            stage,
            subject: subject.clone(),
            failure: failure.clone(),
        });
        let note = FailureNote::new(stage, failure);

        match (stage, subject) {
            (Stage::Summarize, Subject::Job { job_id }) => {
                match self.store.fail_job(job_id, &note, &event).await? {
                    Advance::Advanced { .. } => error!("Job {job_id} failed at {stage}: {failure}"),
                    Advance::Unchanged(status) => {
                        debug!("Job {job_id} already {status}; failure report ignored")
                    }
                    Advance::Missing => {
                        return Err(PipelineError::InvariantViolation(format!(
                            "failure reported for unknown job {job_id}"
                        )))
                    }
                }
            }
            (Stage::ParseResume, Subject::Candidate { candidate_id }) => {
                match self.store.fail_candidate(candidate_id, &note, &event).await? {
                    Advance::Advanced { .. } => {
                        error!("Candidate {candidate_id} failed at {stage}: {failure}")
                    }
                    Advance::Unchanged(status) => {
                        debug!("Candidate {candidate_id} already {status}; failure report ignored")
                    }
                    Advance::Missing => {
                        return Err(PipelineError::InvariantViolation(format!(
                            "failure reported for unknown candidate {candidate_id}"
                        )))
                    }
                }
            }
            (
                Stage::Score,
                Subject::Pair {
                    job_id,
                    candidate_id,
                },
            ) => {
                self.on_match_failed(&pair_of(job_id, candidate_id), failure, &event)
                    .await?
            }
            (
                Stage::Notify,
                Subject::Pair {
                    job_id,
                    candidate_id,
                },
            ) => {
                self.on_invite_reported(
                    &pair_of(job_id, candidate_id),
                    InviteOutcome::Failed {
                        detail: failure.to_string(),
                    },
                    Some(&event),
                )
                .await?
            }
            (stage, subject) => {
                return Err(PipelineError::UnexpectedPayload(format!(
                    "{stage} failure reported for {subject}"
                )))
            }
        }
        Ok(())
    }

    /// Writes the score once and applies the threshold policy. A redelivered score for a
    /// decided pair changes nothing and emits nothing.
    pub async fn on_match_computed(
        &self,
        key: &PairKey,
        score: &MatchScore,
    ) -> Result<(), PipelineError> {
        let decision = policy::decide(score.score, self.settings.threshold);
        let invite = match decision {
            Decision::Invited => Some(WorkItem::new(Payload::SendInvite {
                job_id: key.job_id.clone(),
                candidate_id: key.candidate_id.clone(),
                context: self.invite_context(key, score).await?,
            })),
            _ => None,
        };

        match self
            .store
            .decide_match(key, score, decision, invite.as_ref())
            .await?
        {
            MatchWrite::Applied => info!(
                "Match {key} scored {:.4} against threshold {:.2}: {decision}",
                score.score, self.settings.threshold
            ),
            MatchWrite::AlreadyDecided(existing) => {
                debug!("Match {key} already {existing}; redelivered score ignored")
            }
            MatchWrite::Missing => {
                return Err(PipelineError::InvariantViolation(format!(
                    "score reported for {key} but no match record exists"
                )))
            }
        }
        Ok(())
    }

    /// Records a scoring failure. The decision stays `pending` for manual review.
    pub async fn on_match_failed(
        &self,
        key: &PairKey,
        failure: &StageFailure,
        event: &WorkItem,
    ) -> Result<(), PipelineError> {
        match self
            .store
            .record_match_failure(key, &failure.to_string(), event)
            .await?
        {
            MatchWrite::Applied => error!("Scoring failed for {key}: {failure}"),
            MatchWrite::AlreadyDecided(existing) => {
                debug!("Match {key} already {existing}; scoring failure ignored")
            }
            MatchWrite::Missing => {
                return Err(PipelineError::InvariantViolation(format!(
                    "scoring failure reported for {key} but no match record exists"
                )))
            }
        }
        Ok(())
    }

    pub async fn on_invite_reported(
        &self,
        key: &PairKey,
        outcome: InviteOutcome,
        event: Option<&WorkItem>,
    ) -> Result<(), PipelineError> {
        match self.store.record_invite_outcome(key, &outcome, event).await? {
            MatchWrite::Missing => Err(PipelineError::InvariantViolation(format!(
                "invite outcome reported for {key} but no match record exists"
            ))),
            _ => {
                match outcome {
                    InviteOutcome::Delivered { at } => info!("Invite for {key} delivered at {at}"),
                    InviteOutcome::Failed { detail } => {
                        error!("Invite for {key} could not be delivered: {detail}")
                    }
                }
                Ok(())
            }
        }
    }

    async fn invite_context(
        &self,
        key: &PairKey,
        score: &MatchScore,
    ) -> Result<InviteContext, PipelineError> {
        let job = self.store.job(&key.job_id).await?.ok_or_else(|| {
            PipelineError::InvariantViolation(format!("match {key} refers to unknown job"))
        })?;
        let candidate = self
            .store
            .candidate(&key.candidate_id)
            .await?
            .ok_or_else(|| {
                PipelineError::InvariantViolation(format!("match {key} refers to unknown candidate"))
            })?;
        let fields = candidate.fields.unwrap_or_default();

        Ok(InviteContext {
            candidate_name: fields.display_name().to_string(),
            candidate_email: fields.email.clone(),
            job_title: job.title,
            score: score.score,
            matching_skills: score.details.matching_skills.clone(),
        })
    }

    /// Publishes undispatched outbox entries in sequence order. Stops at the first publish
    /// failure so nothing is published out of order; the rest goes out on the next pass.
    pub async fn flush_outbox(&self) -> Result<usize, PipelineError> {
        let _guard = self.relay.lock().await;
        let mut published = 0;
        loop {
            let batch = self.store.pending_outbox(OUTBOX_BATCH).await?;
            for entry in &batch {
                self.channel.publish(&entry.item).await?;
                self.store.mark_dispatched(entry.seq).await?;
                published += 1;
            }
            if batch.len() < OUTBOX_BATCH {
                break;
            }
        }
        if published > 0 {
            debug!("Relayed {published} outbox entries");
        }
        Ok(published)
    }

    /// The state change is already committed; a failed relay is picked up by the next tick.
    async fn relay_now(&self) {
        if let Err(e) = self.flush_outbox().await {
            warn!("Outbox relay deferred: {e}");
        }
    }

    /// Submits every job row of a CSV file or a single resume.
    pub async fn ingest(&self, input: InputFile) {
        match input {
            InputFile::JobCsv(path) => {
                info!("Processing job description file {}", path.display());
                let jobs = match intake::read_job_file(&path) {
                    Ok(jobs) => jobs,
                    Err(e) => {
                        error!("{e}");
                        return;
                    }
                };
                let mut all_recorded = true;
                for job in jobs {
                    match self.submit_job(job, Origin::Intake).await {
                        Ok(_) => {}
                        Err(e @ PipelineError::DuplicateEntity { .. }) => warn!("{e}"),
                        Err(e) => {
                            error!("Could not submit job from {}: {e}", path.display());
                            all_recorded = false;
                        }
                    }
                }
                // Left in place when anything failed so the next scan retries it.
                if all_recorded {
                    if let Err(e) = intake::move_to_processed(&path) {
                        error!("{e}");
                    }
                }
            }
            InputFile::Resume(path) => {
                let Some(candidate) = intake::candidate_from_path(&path) else {
                    warn!("Cannot derive a candidate id from {}", path.display());
                    return;
                };
                match self.submit_candidate(candidate, Origin::Intake).await {
                    Ok(_) => {}
                    Err(e @ PipelineError::DuplicateEntity { .. }) => warn!("{e}"),
                    Err(e) => error!("Could not submit resume {}: {e}", path.display()),
                }
            }
        }
    }

    async fn process(&self, delivery: &Delivery) {
        match self.handle(&delivery.item).await {
            Ok(()) => {
                if let Err(e) = self.channel.ack(delivery).await {
                    warn!("Ack of {} on {} failed: {e}", delivery.receipt, delivery.topic);
                }
            }
            Err(e) if e.is_retryable() => {
                warn!(
                    "Leaving {} on {} for redelivery (attempt {}): {e}",
                    delivery.item.id,
                    delivery.topic,
                    delivery.attempt()
                );
                if let Err(e) = self.channel.release(delivery).await {
                    warn!("Release of {} failed: {e}", delivery.receipt);
                }
            }
            Err(e) => {
                error!(
                    "Discarding {} on {}: {e}",
                    delivery.item.id, delivery.topic
                );
                self.report_poison(delivery, &e).await;
                if let Err(e) = self.channel.ack(delivery).await {
                    warn!("Ack of {} on {} failed: {e}", delivery.receipt, delivery.topic);
                }
            }
        }
    }

    async fn report_poison(&self, delivery: &Delivery, error: &PipelineError) {
        let stage = match &delivery.item.payload {
            Payload::StageCompleted { stage, .. } | Payload::StageFailed { stage, .. } => {
                Some(*stage)
            }
            _ => Stage::producing(delivery.topic),
        };
        let Some(stage) = stage else {
            return;
        };
        let event = WorkItem::new(Payload::PipelineFailure {
            stage,
            subject: delivery.item.payload.subject(),
            failure: StageFailure::permanent(error.to_string()),
        });
        if let Err(e) = self.channel.publish(&event).await {
            warn!("Could not report discarded message {}: {e}", delivery.item.id);
        }
    }

    async fn consume(self: Arc<Self>, topic: Topic, cancel: CancellationToken) {
        let consumer = consumer_name(format!("orchestrator-{topic}"));
        info!("Orchestrator consuming {topic}");
        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                r = self.channel.receive(topic, &consumer, self.settings.channel_wait) => r,
            };
            match received {
                Ok(Some(delivery)) => self.process(&delivery).await,
                Ok(None) => {}
                Err(e) => {
                    warn!("Receive on {topic} failed: {e}");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(RECEIVE_BACKOFF) => {}
                    }
                }
            }
        }
        debug!("Orchestrator consumer for {topic} stopped");
    }

    async fn relay_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(self.settings.outbox_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    if let Err(e) = self.flush_outbox().await {
                        warn!("Outbox relay failed: {e}");
                    }
                }
            }
        }
    }

    async fn intake_loop(self: Arc<Self>, dirs: InputDirs, cancel: CancellationToken) {
        // Watch before scanning; a file landing mid-scan is then seen at least once, and a
        // file seen twice is an unchanged admission.
        let watcher = InputWatcher::start(&dirs.jd_dir, &dirs.resume_dir);
        if let Err(e) = &watcher {
            error!("Could not watch input directories: {e}");
        }

        match intake::scan(&dirs.jd_dir, &dirs.resume_dir) {
            Ok(existing) => {
                info!("Found {} existing input file(s)", existing.len());
                for input in existing {
                    if cancel.is_cancelled() {
                        return;
                    }
                    self.ingest(input).await;
                }
            }
            Err(e) => error!("Startup scan failed: {e}"),
        }

        let Ok(watcher) = watcher else {
            return;
        };
        let (tx, mut rx) = mpsc::channel(64);
        let ingest = async {
            while let Some(input) = rx.recv().await {
                self.ingest(input).await;
            }
        };
        tokio::join!(watcher.run(tx, cancel.clone()), ingest);
    }

    /// Runs consumers for every completion topic, the outbox relay, and (when given) the
    /// input directory intake until `cancel` fires.
    pub async fn run(
        self: Arc<Self>,
        inputs: Option<InputDirs>,
        cancel: CancellationToken,
    ) -> Result<(), PipelineError> {
        self.channel.ensure_topics(&Topic::ALL).await?;
        // Anything committed before a crash goes out first.
        match self.flush_outbox().await {
            Ok(0) => {}
            Ok(replayed) => info!("Replayed {replayed} outbox entries left from a previous run"),
            Err(e) => warn!("Outbox replay deferred to the relay: {e}"),
        }

        let mut tasks = JoinSet::new();
        for topic in Topic::COMPLETIONS {
            tasks.spawn(self.clone().consume(topic, cancel.clone()));
        }
        tasks.spawn(self.clone().relay_loop(cancel.clone()));
        if let Some(dirs) = inputs {
            tasks.spawn(self.clone().intake_loop(dirs, cancel.clone()));
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Orchestrator task panicked: {e}");
            }
        }
        info!("Orchestrator stopped");
        Ok(())
    }
}
