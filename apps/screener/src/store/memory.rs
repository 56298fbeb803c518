//! In-process store. One lock guards everything, so every operation is a transaction and
//! pairing is trivially serialized.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::channel::WorkItem;
use crate::models::candidate::{CandidateFields, CandidateProfile, CandidateStatus, NewCandidate};
use crate::models::failure::FailureNote;
use crate::models::job::{JobDescription, JobStatus, JobSummary, NewJob};
use crate::models::matching::{Decision, MatchRecord, MatchScore, PairKey};
use crate::store::{
    parse_request, score_request, summarize_request, Admission, Advance, FailedEntities,
    InviteOutcome, MatchFilter, MatchWrite, Origin, OutboxEntry, StateStore, StoreError,
};

#[derive(Debug, Default)]
struct Inner {
    jobs: BTreeMap<String, JobDescription>,
    candidates: BTreeMap<String, CandidateProfile>,
    matches: BTreeMap<PairKey, MatchRecord>,
    /// Undispatched entries only, keyed by sequence number.
    outbox: BTreeMap<i64, OutboxEntry>,
    next_seq: i64,
}

impl Inner {
    fn enqueue(&mut self, item: &WorkItem) {
        self.next_seq += 1;
        self.outbox.insert(
            self.next_seq,
            OutboxEntry {
                seq: self.next_seq,
                item: item.clone(),
                created_at: Utc::now(),
            },
        );
    }

    /// First writer wins; returns the keys that were actually created.
    fn pair(&mut self, keys: Vec<PairKey>, now: DateTime<Utc>) -> Vec<PairKey> {
        let mut created = Vec::new();
        for key in keys {
            if self.matches.contains_key(&key) {
                continue;
            }
            self.matches
                .insert(key.clone(), MatchRecord::pending(&key, now));
            let item = score_request(&key);
            self.enqueue(&item);
            created.push(key);
        }
        created
    }

    fn guarded_match(&mut self, key: &PairKey) -> Result<&mut MatchRecord, MatchWrite> {
        match self.matches.get_mut(key) {
            None => Err(MatchWrite::Missing),
            Some(m) if m.decision.is_terminal() => Err(MatchWrite::AlreadyDecided(m.decision)),
            Some(m) => Ok(m),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence numbers handed out so far, dispatched or not.
    #[cfg(test)]
    pub async fn outbox_written(&self) -> i64 {
        self.inner.lock().await.next_seq
    }

    #[cfg(test)]
    pub async fn match_count(&self) -> usize {
        self.inner.lock().await.matches.len()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn admit_job(
        &self,
        job: &NewJob,
        origin: Origin,
    ) -> Result<Admission<JobStatus>, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let admission = match inner.jobs.get_mut(&job.job_id) {
            None => {
                inner
                    .jobs
                    .insert(job.job_id.clone(), JobDescription::ingested(job, now));
                Admission::Created
            }
            Some(existing)
                if existing.status == JobStatus::Failed
                    && origin.reopens(existing.same_content(job)) =>
            {
                let created_at = existing.created_at;
                *existing = JobDescription {
                    created_at,
                    ..JobDescription::ingested(job, now)
                };
                Admission::Reopened
            }
            Some(existing) if existing.same_content(job) => Admission::Unchanged(existing.status),
            Some(existing) => return Ok(Admission::Conflict(existing.status)),
        };
        if matches!(admission, Admission::Created | Admission::Reopened) {
            inner.enqueue(&summarize_request(job));
        }
        Ok(admission)
    }

    async fn admit_candidate(
        &self,
        candidate: &NewCandidate,
        origin: Origin,
    ) -> Result<Admission<CandidateStatus>, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let admission = match inner.candidates.get_mut(&candidate.candidate_id) {
            None => {
                inner.candidates.insert(
                    candidate.candidate_id.clone(),
                    CandidateProfile::ingested(candidate, now),
                );
                Admission::Created
            }
            Some(existing)
                if existing.status == CandidateStatus::Failed
                    && origin.reopens(existing.same_content(candidate)) =>
            {
                let created_at = existing.created_at;
                *existing = CandidateProfile {
                    created_at,
                    ..CandidateProfile::ingested(candidate, now)
                };
                Admission::Reopened
            }
            Some(existing) if existing.same_content(candidate) => {
                Admission::Unchanged(existing.status)
            }
            Some(existing) => return Ok(Admission::Conflict(existing.status)),
        };
        if matches!(admission, Admission::Created | Admission::Reopened) {
            inner.enqueue(&parse_request(candidate));
        }
        Ok(admission)
    }

    async fn complete_job(
        &self,
        job_id: &str,
        summary: &JobSummary,
    ) -> Result<Advance<JobStatus>, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let Some(job) = inner.jobs.get_mut(job_id) else {
            return Ok(Advance::Missing);
        };
        if job.status != JobStatus::Ingested {
            return Ok(Advance::Unchanged(job.status));
        }
        job.summary = Some(summary.clone());
        job.status = JobStatus::Summarized;
        job.updated_at = now;

        let keys = inner
            .candidates
            .values()
            .filter(|c| c.status == CandidateStatus::Parsed)
            .map(|c| PairKey::new(job_id, &c.candidate_id))
            .collect();
        let new_pairs = inner.pair(keys, now);
        Ok(Advance::Advanced { new_pairs })
    }

    async fn complete_candidate(
        &self,
        candidate_id: &str,
        fields: &CandidateFields,
    ) -> Result<Advance<CandidateStatus>, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let Some(candidate) = inner.candidates.get_mut(candidate_id) else {
            return Ok(Advance::Missing);
        };
        if candidate.status != CandidateStatus::Ingested {
            return Ok(Advance::Unchanged(candidate.status));
        }
        candidate.fields = Some(fields.clone());
        candidate.status = CandidateStatus::Parsed;
        candidate.updated_at = now;

        let keys = inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Summarized)
            .map(|j| PairKey::new(&j.job_id, candidate_id))
            .collect();
        let new_pairs = inner.pair(keys, now);
        Ok(Advance::Advanced { new_pairs })
    }

    async fn fail_job(
        &self,
        job_id: &str,
        note: &FailureNote,
        event: &WorkItem,
    ) -> Result<Advance<JobStatus>, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(job) = inner.jobs.get_mut(job_id) else {
            return Ok(Advance::Missing);
        };
        if job.status != JobStatus::Ingested {
            return Ok(Advance::Unchanged(job.status));
        }
        job.status = JobStatus::Failed;
        job.failure = Some(note.clone());
        job.updated_at = Utc::now();
        inner.enqueue(event);
        Ok(Advance::Advanced {
            new_pairs: Vec::new(),
        })
    }

    async fn fail_candidate(
        &self,
        candidate_id: &str,
        note: &FailureNote,
        event: &WorkItem,
    ) -> Result<Advance<CandidateStatus>, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(candidate) = inner.candidates.get_mut(candidate_id) else {
            return Ok(Advance::Missing);
        };
        if candidate.status != CandidateStatus::Ingested {
            return Ok(Advance::Unchanged(candidate.status));
        }
        candidate.status = CandidateStatus::Failed;
        candidate.failure = Some(note.clone());
        candidate.updated_at = Utc::now();
        inner.enqueue(event);
        Ok(Advance::Advanced {
            new_pairs: Vec::new(),
        })
    }

    async fn decide_match(
        &self,
        key: &PairKey,
        score: &MatchScore,
        decision: Decision,
        invite: Option<&WorkItem>,
    ) -> Result<MatchWrite, StoreError> {
        let mut inner = self.inner.lock().await;
        let record = match inner.guarded_match(key) {
            Ok(record) => record,
            Err(write) => return Ok(write),
        };
        record.score = Some(score.score);
        record.details = Some(score.details.clone());
        record.decision = decision;
        record.failure = None;
        record.decided_at = Some(Utc::now());
        if let Some(invite) = invite {
            inner.enqueue(invite);
        }
        Ok(MatchWrite::Applied)
    }

    async fn record_match_failure(
        &self,
        key: &PairKey,
        detail: &str,
        event: &WorkItem,
    ) -> Result<MatchWrite, StoreError> {
        let mut inner = self.inner.lock().await;
        let record = match inner.guarded_match(key) {
            Ok(record) => record,
            Err(write) => return Ok(write),
        };
        record.failure = Some(detail.to_string());
        inner.enqueue(event);
        Ok(MatchWrite::Applied)
    }

    async fn record_invite_outcome(
        &self,
        key: &PairKey,
        outcome: &InviteOutcome,
        event: Option<&WorkItem>,
    ) -> Result<MatchWrite, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(record) = inner.matches.get_mut(key) else {
            return Ok(MatchWrite::Missing);
        };
        match outcome {
            InviteOutcome::Delivered { at } => {
                record.invite_sent_at.get_or_insert(*at);
                record.invite_error = None;
            }
            InviteOutcome::Failed { detail } => {
                if record.invite_sent_at.is_some() {
                    return Ok(MatchWrite::Applied);
                }
                record.invite_error = Some(detail.clone());
            }
        }
        if let Some(event) = event {
            inner.enqueue(event);
        }
        Ok(MatchWrite::Applied)
    }

    async fn job(&self, job_id: &str) -> Result<Option<JobDescription>, StoreError> {
        Ok(self.inner.lock().await.jobs.get(job_id).cloned())
    }

    async fn candidate(&self, candidate_id: &str) -> Result<Option<CandidateProfile>, StoreError> {
        Ok(self.inner.lock().await.candidates.get(candidate_id).cloned())
    }

    async fn match_record(&self, key: &PairKey) -> Result<Option<MatchRecord>, StoreError> {
        Ok(self.inner.lock().await.matches.get(key).cloned())
    }

    async fn matches_for_job(
        &self,
        job_id: &str,
        filter: &MatchFilter,
    ) -> Result<Vec<MatchRecord>, StoreError> {
        let inner = self.inner.lock().await;
        let mut records: Vec<MatchRecord> = inner
            .matches
            .values()
            .filter(|m| m.job_id == job_id && filter.admits(m))
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            b.score
                .unwrap_or(f64::NEG_INFINITY)
                .total_cmp(&a.score.unwrap_or(f64::NEG_INFINITY))
                .then_with(|| a.candidate_id.cmp(&b.candidate_id))
        });
        Ok(records)
    }

    async fn failed_entities(&self) -> Result<FailedEntities, StoreError> {
        let inner = self.inner.lock().await;
        Ok(FailedEntities {
            jobs: inner
                .jobs
                .values()
                .filter(|j| j.status == JobStatus::Failed)
                .cloned()
                .collect(),
            candidates: inner
                .candidates
                .values()
                .filter(|c| c.status == CandidateStatus::Failed)
                .cloned()
                .collect(),
        })
    }

    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxEntry>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.outbox.values().take(limit).cloned().collect())
    }

    async fn mark_dispatched(&self, seq: i64) -> Result<(), StoreError> {
        self.inner.lock().await.outbox.remove(&seq);
        Ok(())
    }

    fn provider_name(&self) -> &'static str {
        "memory"
    }
}
