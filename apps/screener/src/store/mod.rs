//! Durable record of jobs, candidates, matches, and the orchestrator's outbox.
//!
//! Every write that requires a message also writes that message to the outbox in the same
//! transaction. Nothing here publishes; the outbox relay does.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::channel::{Payload, WorkItem};
use crate::models::candidate::{CandidateFields, CandidateProfile, CandidateStatus, NewCandidate};
use crate::models::failure::FailureNote;
use crate::models::job::{JobDescription, JobStatus, JobSummary, NewJob};
use crate::models::matching::{Decision, MatchRecord, MatchScore, PairKey};
use crate::models::StatusParseError;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("Stored row is corrupt: {0}")]
    Corrupt(#[from] StatusParseError),

    #[error("Outbox payload error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Where an admission came from. A `failed` record with unchanged content is only reopened
/// on explicit resubmission; seeing the same file again is not a retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Input directory scan or watcher.
    Intake,
    /// Status API resubmission.
    Resubmit,
}

impl Origin {
    /// Whether a `failed` record should be reset, given whether its content matches.
    pub fn reopens(self, same_content: bool) -> bool {
        self == Origin::Resubmit || !same_content
    }
}

/// Result of offering a newly detected entity to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission<S> {
    /// New identifier; record created in `ingested`, work item queued.
    Created,
    /// Identifier was `failed` and either the content changed or the caller resubmitted it;
    /// record reset to `ingested` with the new content, work item queued.
    Reopened,
    /// Same content already recorded, including a `failed` record seen again by intake.
    /// Nothing written.
    Unchanged(S),
    /// Different content under an identifier that is not `failed`. Nothing written.
    Conflict(S),
}

/// Result of a status transition out of `ingested`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance<S> {
    /// Transition applied. Lists the pairs that became ready and got a `match.requested` item.
    Advanced { new_pairs: Vec<PairKey> },
    /// The entity was not `ingested`; nothing written.
    Unchanged(S),
    Missing,
}

/// Result of a write guarded by a match still being `pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchWrite {
    Applied,
    AlreadyDecided(Decision),
    Missing,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InviteOutcome {
    Delivered { at: DateTime<Utc> },
    Failed { detail: String },
}

#[derive(Debug, Clone, Default)]
pub struct MatchFilter {
    pub min_score: Option<f64>,
    pub decision: Option<Decision>,
}

impl MatchFilter {
    pub fn admits(&self, record: &MatchRecord) -> bool {
        let score_ok = match self.min_score {
            Some(min) => record.score.is_some_and(|s| s >= min),
            None => true,
        };
        let decision_ok = self.decision.map_or(true, |d| d == record.decision);
        score_ok && decision_ok
    }
}

/// A queued message awaiting publication, in sequence order.
#[derive(Debug, Clone, Serialize)]
pub struct OutboxEntry {
    pub seq: i64,
    pub item: WorkItem,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedEntities {
    pub jobs: Vec<JobDescription>,
    pub candidates: Vec<CandidateProfile>,
}

pub(crate) fn score_request(key: &PairKey) -> WorkItem {
    WorkItem::new(Payload::ScoreMatch {
        job_id: key.job_id.clone(),
        candidate_id: key.candidate_id.clone(),
    })
}

pub(crate) fn summarize_request(job: &NewJob) -> WorkItem {
    WorkItem::new(Payload::SummarizeJob {
        job_id: job.job_id.clone(),
        title: job.title.clone(),
        raw_text: job.raw_text.clone(),
    })
}

pub(crate) fn parse_request(candidate: &NewCandidate) -> WorkItem {
    WorkItem::new(Payload::ParseResume {
        candidate_id: candidate.candidate_id.clone(),
        source_ref: candidate.source_ref.clone(),
    })
}

#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    /// Records a job, queueing `jd.summarize` when the record is created or reopened.
    async fn admit_job(
        &self,
        job: &NewJob,
        origin: Origin,
    ) -> Result<Admission<JobStatus>, StoreError>;

    /// Records a candidate, queueing `resume.parse` when the record is created or reopened.
    async fn admit_candidate(
        &self,
        candidate: &NewCandidate,
        origin: Origin,
    ) -> Result<Admission<CandidateStatus>, StoreError>;

    /// `ingested → summarized`, storing the summary and creating a pending match (plus a
    /// `match.requested` item) against every `parsed` candidate that has none yet.
    async fn complete_job(
        &self,
        job_id: &str,
        summary: &JobSummary,
    ) -> Result<Advance<JobStatus>, StoreError>;

    /// `ingested → parsed`, symmetric to [`StateStore::complete_job`].
    async fn complete_candidate(
        &self,
        candidate_id: &str,
        fields: &CandidateFields,
    ) -> Result<Advance<CandidateStatus>, StoreError>;

    /// `ingested → failed`, queueing `event` for monitoring.
    async fn fail_job(
        &self,
        job_id: &str,
        note: &FailureNote,
        event: &WorkItem,
    ) -> Result<Advance<JobStatus>, StoreError>;

    async fn fail_candidate(
        &self,
        candidate_id: &str,
        note: &FailureNote,
        event: &WorkItem,
    ) -> Result<Advance<CandidateStatus>, StoreError>;

    /// Writes the score and moves the decision off `pending`, queueing `invite` if given.
    /// Only the first call for a pair has any effect.
    async fn decide_match(
        &self,
        key: &PairKey,
        score: &MatchScore,
        decision: Decision,
        invite: Option<&WorkItem>,
    ) -> Result<MatchWrite, StoreError>;

    /// Notes a scoring failure on a still-pending match and queues `event`.
    async fn record_match_failure(
        &self,
        key: &PairKey,
        detail: &str,
        event: &WorkItem,
    ) -> Result<MatchWrite, StoreError>;

    /// Records what the notifier reported. The first successful delivery time sticks.
    async fn record_invite_outcome(
        &self,
        key: &PairKey,
        outcome: &InviteOutcome,
        event: Option<&WorkItem>,
    ) -> Result<MatchWrite, StoreError>;

    async fn job(&self, job_id: &str) -> Result<Option<JobDescription>, StoreError>;

    async fn candidate(&self, candidate_id: &str) -> Result<Option<CandidateProfile>, StoreError>;

    async fn match_record(&self, key: &PairKey) -> Result<Option<MatchRecord>, StoreError>;

    /// Matches for a job, best score first.
    async fn matches_for_job(
        &self,
        job_id: &str,
        filter: &MatchFilter,
    ) -> Result<Vec<MatchRecord>, StoreError>;

    async fn failed_entities(&self) -> Result<FailedEntities, StoreError>;

    /// Undispatched outbox entries, oldest first.
    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxEntry>, StoreError>;

    /// Removes a published entry from the outbox.
    async fn mark_dispatched(&self, seq: i64) -> Result<(), StoreError>;

    fn provider_name(&self) -> &'static str;
}
