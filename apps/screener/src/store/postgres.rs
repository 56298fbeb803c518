//! PostgreSQL store. Each operation runs in one transaction; pairing transitions take a
//! transaction-scoped advisory lock so a job and a candidate completing at the same moment
//! cannot both miss each other.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::types::Json;
use sqlx::{FromRow, Postgres, Transaction};
use tracing::debug;

use crate::channel::WorkItem;
use crate::models::candidate::{
    CandidateFields, CandidateProfile, CandidateRow, CandidateStatus, NewCandidate,
};
use crate::models::failure::FailureNote;
use crate::models::job::{JobDescription, JobRow, JobStatus, JobSummary, NewJob};
use crate::models::matching::{Decision, MatchRecord, MatchRow, MatchScore, PairKey};
use crate::store::{
    parse_request, score_request, summarize_request, Admission, Advance, FailedEntities,
    InviteOutcome, MatchFilter, MatchWrite, Origin, OutboxEntry, StateStore, StoreError,
};

/// Key for `pg_advisory_xact_lock`, shared by both pairing transitions.
const PAIRING_LOCK: i64 = 0x5C4E_E4E4;

#[derive(Debug, FromRow)]
struct OutboxRow {
    seq: i64,
    item: Json<WorkItem>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Applies pending schema migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!().run(&self.pool).await?;
        Ok(())
    }
}

async fn enqueue(tx: &mut Transaction<'_, Postgres>, item: &WorkItem) -> Result<(), StoreError> {
    sqlx::query("INSERT INTO outbox (topic, item) VALUES ($1, $2)")
        .bind(item.topic.name())
        .bind(Json(item))
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn lock_pairing(tx: &mut Transaction<'_, Postgres>) -> Result<(), StoreError> {
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(PAIRING_LOCK)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn enqueue_pairs(
    tx: &mut Transaction<'_, Postgres>,
    pairs: &[PairKey],
) -> Result<(), StoreError> {
    for key in pairs {
        enqueue(tx, &score_request(key)).await?;
    }
    Ok(())
}

/// Reads the decision of a match whose guarded update touched nothing.
async fn unapplied(
    tx: &mut Transaction<'_, Postgres>,
    key: &PairKey,
) -> Result<MatchWrite, StoreError> {
    let decision: Option<String> = sqlx::query_scalar(
        "SELECT decision FROM matches WHERE job_id = $1 AND candidate_id = $2",
    )
    .bind(&key.job_id)
    .bind(&key.candidate_id)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(match decision {
        Some(d) => MatchWrite::AlreadyDecided(d.parse()?),
        None => MatchWrite::Missing,
    })
}

#[async_trait]
impl StateStore for PgStore {
    async fn admit_job(
        &self,
        job: &NewJob,
        origin: Origin,
    ) -> Result<Admission<JobStatus>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO job_descriptions (job_id, title, raw_text)
            VALUES ($1, $2, $3)
            ON CONFLICT (job_id) DO NOTHING
            "#,
        )
        .bind(&job.job_id)
        .bind(&job.title)
        .bind(&job.raw_text)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 1 {
            enqueue(&mut tx, &summarize_request(job)).await?;
            tx.commit().await?;
            return Ok(Admission::Created);
        }

        let row: JobRow =
            sqlx::query_as("SELECT * FROM job_descriptions WHERE job_id = $1 FOR UPDATE")
                .bind(&job.job_id)
                .fetch_one(&mut *tx)
                .await?;
        let existing = JobDescription::try_from(row)?;

        let same_content = existing.same_content(job);
        if existing.status == JobStatus::Failed && origin.reopens(same_content) {
            sqlx::query(
                r#"
                UPDATE job_descriptions
                SET title = $2, raw_text = $3, summary = NULL, status = 'ingested',
                    failure_stage = NULL, failure_kind = NULL, failure_detail = NULL,
                    updated_at = NOW()
                WHERE job_id = $1
                "#,
            )
            .bind(&job.job_id)
            .bind(&job.title)
            .bind(&job.raw_text)
            .execute(&mut *tx)
            .await?;
            enqueue(&mut tx, &summarize_request(job)).await?;
            tx.commit().await?;
            return Ok(Admission::Reopened);
        }

        tx.rollback().await?;
        if same_content {
            Ok(Admission::Unchanged(existing.status))
        } else {
            Ok(Admission::Conflict(existing.status))
        }
    }

    async fn admit_candidate(
        &self,
        candidate: &NewCandidate,
        origin: Origin,
    ) -> Result<Admission<CandidateStatus>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO candidates (candidate_id, source_ref)
            VALUES ($1, $2)
            ON CONFLICT (candidate_id) DO NOTHING
            "#,
        )
        .bind(&candidate.candidate_id)
        .bind(&candidate.source_ref)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 1 {
            enqueue(&mut tx, &parse_request(candidate)).await?;
            tx.commit().await?;
            return Ok(Admission::Created);
        }

        let row: CandidateRow =
            sqlx::query_as("SELECT * FROM candidates WHERE candidate_id = $1 FOR UPDATE")
                .bind(&candidate.candidate_id)
                .fetch_one(&mut *tx)
                .await?;
        let existing = CandidateProfile::try_from(row)?;

        let same_content = existing.same_content(candidate);
        if existing.status == CandidateStatus::Failed && origin.reopens(same_content) {
            sqlx::query(
                r#"
                UPDATE candidates
                SET source_ref = $2, fields = NULL, status = 'ingested',
                    failure_stage = NULL, failure_kind = NULL, failure_detail = NULL,
                    updated_at = NOW()
                WHERE candidate_id = $1
                "#,
            )
            .bind(&candidate.candidate_id)
            .bind(&candidate.source_ref)
            .execute(&mut *tx)
            .await?;
            enqueue(&mut tx, &parse_request(candidate)).await?;
            tx.commit().await?;
            return Ok(Admission::Reopened);
        }

        tx.rollback().await?;
        if same_content {
            Ok(Admission::Unchanged(existing.status))
        } else {
            Ok(Admission::Conflict(existing.status))
        }
    }

    async fn complete_job(
        &self,
        job_id: &str,
        summary: &JobSummary,
    ) -> Result<Advance<JobStatus>, StoreError> {
        let mut tx = self.pool.begin().await?;
        lock_pairing(&mut tx).await?;

        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM job_descriptions WHERE job_id = $1 FOR UPDATE")
                .bind(job_id)
                .fetch_optional(&mut *tx)
                .await?;
        let status: JobStatus = match status {
            None => return Ok(Advance::Missing),
            Some(s) => s.parse()?,
        };
        if status != JobStatus::Ingested {
            return Ok(Advance::Unchanged(status));
        }

        sqlx::query(
            r#"
            UPDATE job_descriptions
            SET summary = $2, status = 'summarized', updated_at = NOW()
            WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .bind(Json(summary))
        .execute(&mut *tx)
        .await?;

        let paired: Vec<String> = sqlx::query_scalar(
            r#"
            INSERT INTO matches (job_id, candidate_id)
            SELECT $1, candidate_id FROM candidates WHERE status = 'parsed'
            ON CONFLICT (job_id, candidate_id) DO NOTHING
            RETURNING candidate_id
            "#,
        )
        .bind(job_id)
        .fetch_all(&mut *tx)
        .await?;
        let new_pairs: Vec<PairKey> = paired
            .into_iter()
            .map(|candidate_id| PairKey::new(job_id, candidate_id))
            .collect();
        enqueue_pairs(&mut tx, &new_pairs).await?;

        tx.commit().await?;
        debug!("Job {job_id} summarized with {} new pairs", new_pairs.len());
        Ok(Advance::Advanced { new_pairs })
    }

    async fn complete_candidate(
        &self,
        candidate_id: &str,
        fields: &CandidateFields,
    ) -> Result<Advance<CandidateStatus>, StoreError> {
        let mut tx = self.pool.begin().await?;
        lock_pairing(&mut tx).await?;

        let status: Option<String> = sqlx::query_scalar(
            "SELECT status FROM candidates WHERE candidate_id = $1 FOR UPDATE",
        )
        .bind(candidate_id)
        .fetch_optional(&mut *tx)
        .await?;
        let status: CandidateStatus = match status {
            None => return Ok(Advance::Missing),
            Some(s) => s.parse()?,
        };
        if status != CandidateStatus::Ingested {
            return Ok(Advance::Unchanged(status));
        }

        sqlx::query(
            r#"
            UPDATE candidates
            SET fields = $2, status = 'parsed', updated_at = NOW()
            WHERE candidate_id = $1
            "#,
        )
        .bind(candidate_id)
        .bind(Json(fields))
        .execute(&mut *tx)
        .await?;

        let paired: Vec<String> = sqlx::query_scalar(
            r#"
            INSERT INTO matches (job_id, candidate_id)
            SELECT job_id, $1 FROM job_descriptions WHERE status = 'summarized'
            ON CONFLICT (job_id, candidate_id) DO NOTHING
            RETURNING job_id
            "#,
        )
        .bind(candidate_id)
        .fetch_all(&mut *tx)
        .await?;
        let new_pairs: Vec<PairKey> = paired
            .into_iter()
            .map(|job_id| PairKey::new(job_id, candidate_id))
            .collect();
        enqueue_pairs(&mut tx, &new_pairs).await?;

        tx.commit().await?;
        debug!(
            "Candidate {candidate_id} parsed with {} new pairs",
            new_pairs.len()
        );
        Ok(Advance::Advanced { new_pairs })
    }

    async fn fail_job(
        &self,
        job_id: &str,
        note: &FailureNote,
        event: &WorkItem,
    ) -> Result<Advance<JobStatus>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            r#"
            UPDATE job_descriptions
            SET status = 'failed', failure_stage = $2, failure_kind = $3, failure_detail = $4,
                updated_at = NOW()
            WHERE job_id = $1 AND status = 'ingested'
            "#,
        )
        .bind(job_id)
        .bind(note.stage.as_str())
        .bind(note.kind.as_str())
        .bind(&note.detail)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            let status: Option<String> =
                sqlx::query_scalar("SELECT status FROM job_descriptions WHERE job_id = $1")
                    .bind(job_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            return Ok(match status {
                Some(s) => Advance::Unchanged(s.parse()?),
                None => Advance::Missing,
            });
        }

        enqueue(&mut tx, event).await?;
        tx.commit().await?;
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
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            r#"
            UPDATE candidates
            SET status = 'failed', failure_stage = $2, failure_kind = $3, failure_detail = $4,
                updated_at = NOW()
            WHERE candidate_id = $1 AND status = 'ingested'
            "#,
        )
        .bind(candidate_id)
        .bind(note.stage.as_str())
        .bind(note.kind.as_str())
        .bind(&note.detail)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            let status: Option<String> =
                sqlx::query_scalar("SELECT status FROM candidates WHERE candidate_id = $1")
                    .bind(candidate_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            return Ok(match status {
                Some(s) => Advance::Unchanged(s.parse()?),
                None => Advance::Missing,
            });
        }

        enqueue(&mut tx, event).await?;
        tx.commit().await?;
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
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            r#"
            UPDATE matches
            SET score = $3, details = $4, decision = $5, failure = NULL, decided_at = NOW()
            WHERE job_id = $1 AND candidate_id = $2 AND decision = 'pending'
            "#,
        )
        .bind(&key.job_id)
        .bind(&key.candidate_id)
        .bind(score.score)
        .bind(Json(&score.details))
        .bind(decision.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            return unapplied(&mut tx, key).await;
        }
        if let Some(invite) = invite {
            enqueue(&mut tx, invite).await?;
        }
        tx.commit().await?;
        Ok(MatchWrite::Applied)
    }

    async fn record_match_failure(
        &self,
        key: &PairKey,
        detail: &str,
        event: &WorkItem,
    ) -> Result<MatchWrite, StoreError> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            r#"
            UPDATE matches SET failure = $3
            WHERE job_id = $1 AND candidate_id = $2 AND decision = 'pending'
            "#,
        )
        .bind(&key.job_id)
        .bind(&key.candidate_id)
        .bind(detail)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            return unapplied(&mut tx, key).await;
        }
        enqueue(&mut tx, event).await?;
        tx.commit().await?;
        Ok(MatchWrite::Applied)
    }

    async fn record_invite_outcome(
        &self,
        key: &PairKey,
        outcome: &InviteOutcome,
        event: Option<&WorkItem>,
    ) -> Result<MatchWrite, StoreError> {
        let mut tx = self.pool.begin().await?;
        let updated = match outcome {
            InviteOutcome::Delivered { at } => sqlx::query(
                r#"
                UPDATE matches
                SET invite_sent_at = COALESCE(invite_sent_at, $3), invite_error = NULL
                WHERE job_id = $1 AND candidate_id = $2
                "#,
            )
            .bind(&key.job_id)
            .bind(&key.candidate_id)
            .bind(at)
            .execute(&mut *tx)
            .await?
            .rows_affected(),
            InviteOutcome::Failed { detail } => sqlx::query(
                r#"
                UPDATE matches SET invite_error = $3
                WHERE job_id = $1 AND candidate_id = $2 AND invite_sent_at IS NULL
                "#,
            )
            .bind(&key.job_id)
            .bind(&key.candidate_id)
            .bind(detail)
            .execute(&mut *tx)
            .await?
            .rows_affected(),
        };

        if updated == 0 {
            // Either the pair is unknown or an earlier delivery already succeeded.
            return Ok(match unapplied(&mut tx, key).await? {
                MatchWrite::Missing => MatchWrite::Missing,
                _ => MatchWrite::Applied,
            });
        }
        if let Some(event) = event {
            enqueue(&mut tx, event).await?;
        }
        tx.commit().await?;
        Ok(MatchWrite::Applied)
    }

    async fn job(&self, job_id: &str) -> Result<Option<JobDescription>, StoreError> {
        let row: Option<JobRow> =
            sqlx::query_as("SELECT * FROM job_descriptions WHERE job_id = $1")
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(JobDescription::try_from).transpose()?)
    }

    async fn candidate(&self, candidate_id: &str) -> Result<Option<CandidateProfile>, StoreError> {
        let row: Option<CandidateRow> =
            sqlx::query_as("SELECT * FROM candidates WHERE candidate_id = $1")
                .bind(candidate_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(CandidateProfile::try_from).transpose()?)
    }

    async fn match_record(&self, key: &PairKey) -> Result<Option<MatchRecord>, StoreError> {
        let row: Option<MatchRow> =
            sqlx::query_as("SELECT * FROM matches WHERE job_id = $1 AND candidate_id = $2")
                .bind(&key.job_id)
                .bind(&key.candidate_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(MatchRecord::try_from).transpose()?)
    }

    async fn matches_for_job(
        &self,
        job_id: &str,
        filter: &MatchFilter,
    ) -> Result<Vec<MatchRecord>, StoreError> {
        let rows: Vec<MatchRow> = sqlx::query_as(
            r#"
            SELECT * FROM matches
            WHERE job_id = $1
              AND ($2::DOUBLE PRECISION IS NULL OR score >= $2)
              AND ($3::TEXT IS NULL OR decision = $3)
            ORDER BY score DESC NULLS LAST, candidate_id
            "#,
        )
        .bind(job_id)
        .bind(filter.min_score)
        .bind(filter.decision.map(|d| d.as_str()))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(MatchRecord::try_from)
            .collect::<Result<_, _>>()?)
    }

    async fn failed_entities(&self) -> Result<FailedEntities, StoreError> {
        let jobs: Vec<JobRow> = sqlx::query_as(
            "SELECT * FROM job_descriptions WHERE status = 'failed' ORDER BY updated_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        let candidates: Vec<CandidateRow> = sqlx::query_as(
            "SELECT * FROM candidates WHERE status = 'failed' ORDER BY updated_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(FailedEntities {
            jobs: jobs
                .into_iter()
                .map(JobDescription::try_from)
                .collect::<Result<_, _>>()?,
            candidates: candidates
                .into_iter()
                .map(CandidateProfile::try_from)
                .collect::<Result<_, _>>()?,
        })
    }

    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxEntry>, StoreError> {
        let rows: Vec<OutboxRow> = sqlx::query_as(
            r#"
            SELECT seq, item, created_at FROM outbox
            ORDER BY seq
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| OutboxEntry {
                seq: row.seq,
                item: row.item.0,
                created_at: row.created_at,
            })
            .collect())
    }

    async fn mark_dispatched(&self, seq: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM outbox WHERE seq = $1")
            .bind(seq)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn provider_name(&self) -> &'static str {
        "postgres"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Payload, Stage, Subject, Topic};
    use crate::models::failure::StageFailure;
    use crate::models::matching::MatchDetails;

    fn job(id: &str) -> NewJob {
        NewJob {
            job_id: id.to_string(),
            title: "Software Engineer".to_string(),
            raw_text: "3+ years Python".to_string(),
        }
    }

    fn candidate(id: &str) -> NewCandidate {
        NewCandidate {
            candidate_id: id.to_string(),
            source_ref: format!("/data/resumes/{id}.pdf"),
        }
    }

    fn parse_failure(candidate_id: &str) -> (FailureNote, WorkItem) {
        let failure = StageFailure::permanent("unreadable pdf");
        let note = FailureNote::new(Stage::ParseResume, &failure);
        let event = WorkItem::new(Payload::PipelineFailure {
            stage: Stage::ParseResume,
            subject: Subject::candidate(candidate_id),
            failure,
        });
        (note, event)
    }

    async fn outbox_topics(store: &PgStore) -> Result<Vec<Topic>, StoreError> {
        Ok(store
            .pending_outbox(100)
            .await?
            .into_iter()
            .map(|e| e.item.topic)
            .collect())
    }

    /// One job and one candidate, both through their first stage and paired.
    async fn paired(store: &PgStore) -> Result<PairKey, StoreError> {
        store.admit_job(&job("job123"), Origin::Intake).await?;
        store
            .admit_candidate(&candidate("resumeA"), Origin::Intake)
            .await?;
        store.complete_job("job123", &JobSummary::default()).await?;
        store
            .complete_candidate("resumeA", &CandidateFields::default())
            .await?;
        Ok(PairKey::new("job123", "resumeA"))
    }

    #[sqlx::test]
    async fn test_admission_outcomes(pool: PgPool) -> Result<(), StoreError> {
        let store = PgStore::new(pool);

        assert_eq!(
            store.admit_job(&job("job123"), Origin::Intake).await?,
            Admission::Created
        );
        assert_eq!(
            store.admit_job(&job("job123"), Origin::Intake).await?,
            Admission::Unchanged(JobStatus::Ingested)
        );
        let edited = NewJob {
            raw_text: "10 years COBOL".to_string(),
            ..job("job123")
        };
        assert_eq!(
            store.admit_job(&edited, Origin::Resubmit).await?,
            Admission::Conflict(JobStatus::Ingested)
        );

        let stored = store.job("job123").await?.expect("job row");
        assert_eq!(stored.raw_text, "3+ years Python");
        assert_eq!(outbox_topics(&store).await?, vec![Topic::SummarizeRequested]);
        Ok(())
    }

    #[sqlx::test]
    async fn test_failed_candidate_reopens_on_resubmit(
        pool: PgPool,
    ) -> Result<(), StoreError> {
        let store = PgStore::new(pool);
        store
            .admit_candidate(&candidate("resumeA"), Origin::Intake)
            .await?;
        let (note, event) = parse_failure("resumeA");
        store.fail_candidate("resumeA", &note, &event).await?;

        assert_eq!(
            store
                .admit_candidate(&candidate("resumeA"), Origin::Intake)
                .await?,
            Admission::Unchanged(CandidateStatus::Failed)
        );
        assert_eq!(
            outbox_topics(&store).await?,
            vec![Topic::ParseRequested, Topic::Failures]
        );

        assert_eq!(
            store
                .admit_candidate(&candidate("resumeA"), Origin::Resubmit)
                .await?,
            Admission::Reopened
        );
        let profile = store.candidate("resumeA").await?.expect("candidate row");
        assert_eq!(profile.status, CandidateStatus::Ingested);
        assert!(profile.failure.is_none());
        assert_eq!(
            outbox_topics(&store).await?,
            vec![Topic::ParseRequested, Topic::Failures, Topic::ParseRequested]
        );
        Ok(())
    }

    #[sqlx::test]
    async fn test_failure_is_recorded_once(pool: PgPool) -> Result<(), StoreError> {
        let store = PgStore::new(pool);
        store.admit_job(&job("job123"), Origin::Intake).await?;
        let failure = StageFailure::permanent("model refused");
        let note = FailureNote::new(Stage::Summarize, &failure);
        let event = WorkItem::new(Payload::PipelineFailure {
            stage: Stage::Summarize,
            subject: Subject::job("job123"),
            failure,
        });

        assert_eq!(
            store.fail_job("job123", &note, &event).await?,
            Advance::Advanced { new_pairs: vec![] }
        );
        assert_eq!(
            store.fail_job("job123", &note, &event).await?,
            Advance::Unchanged(JobStatus::Failed)
        );
        assert_eq!(store.fail_job("job404", &note, &event).await?, Advance::Missing);

        let failed = store.failed_entities().await?;
        assert_eq!(failed.jobs.len(), 1);
        assert_eq!(failed.jobs[0].failure.as_ref().map(|f| f.stage), Some(Stage::Summarize));
        assert!(failed.candidates.is_empty());
        Ok(())
    }

    #[sqlx::test]
    async fn test_pairs_created_only_when_both_sides_ready(pool: PgPool) -> Result<(), StoreError> {
        let store = PgStore::new(pool);
        store.admit_job(&job("job123"), Origin::Intake).await?;
        store
            .admit_candidate(&candidate("resumeA"), Origin::Intake)
            .await?;

        assert_eq!(
            store.complete_job("job123", &JobSummary::default()).await?,
            Advance::Advanced { new_pairs: vec![] }
        );
        assert_eq!(
            store
                .complete_candidate("resumeA", &CandidateFields::default())
                .await?,
            Advance::Advanced {
                new_pairs: vec![PairKey::new("job123", "resumeA")]
            }
        );
        assert_eq!(
            store
                .complete_candidate("resumeA", &CandidateFields::default())
                .await?,
            Advance::Unchanged(CandidateStatus::Parsed)
        );

        let record = store
            .match_record(&PairKey::new("job123", "resumeA"))
            .await?
            .expect("match row");
        assert_eq!(record.decision, Decision::Pending);
        let topics = outbox_topics(&store).await?;
        assert_eq!(
            topics.iter().filter(|t| **t == Topic::MatchRequested).count(),
            1
        );
        Ok(())
    }

    #[sqlx::test]
    async fn test_concurrent_completions_pair_once(pool: PgPool) -> Result<(), StoreError> {
        let store = PgStore::new(pool);
        store.admit_job(&job("job123"), Origin::Intake).await?;
        store
            .admit_candidate(&candidate("resumeA"), Origin::Intake)
            .await?;

        let job_side = {
            let store = store.clone();
            tokio::spawn(async move { store.complete_job("job123", &JobSummary::default()).await })
        };
        let candidate_side = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .complete_candidate("resumeA", &CandidateFields::default())
                    .await
            })
        };
        let job_advance = job_side.await.expect("job side panicked")?;
        let candidate_advance = candidate_side.await.expect("candidate side panicked")?;

        fn pairs_created<S>(a: &Advance<S>) -> usize {
            match a {
                Advance::Advanced { new_pairs } => new_pairs.len(),
                _ => 0,
            }
        }
        let created: usize = pairs_created(&job_advance) + pairs_created(&candidate_advance);
        assert_eq!(created, 1);

        let matches = store
            .matches_for_job("job123", &MatchFilter::default())
            .await?;
        assert_eq!(matches.len(), 1);
        let topics = outbox_topics(&store).await?;
        assert_eq!(
            topics.iter().filter(|t| **t == Topic::MatchRequested).count(),
            1
        );
        Ok(())
    }

    #[sqlx::test]
    async fn test_decide_match_applies_once(pool: PgPool) -> Result<(), StoreError> {
        let store = PgStore::new(pool);
        let key = paired(&store).await?;
        let score = MatchScore {
            score: 0.85,
            details: MatchDetails::default(),
        };
        assert_eq!(
            store
                .decide_match(&key, &score, Decision::Invited, None)
                .await?,
            MatchWrite::Applied
        );
        let lower = MatchScore {
            score: 0.1,
            ..score.clone()
        };
        assert_eq!(
            store
                .decide_match(&key, &lower, Decision::Rejected, None)
                .await?,
            MatchWrite::AlreadyDecided(Decision::Invited)
        );
        assert_eq!(
            store
                .decide_match(&PairKey::new("job123", "resumeZ"), &score, Decision::Invited, None)
                .await?,
            MatchWrite::Missing
        );

        let record = store.match_record(&key).await?.expect("match row");
        assert_eq!(record.score, Some(0.85));
        assert_eq!(record.decision, Decision::Invited);
        assert!(record.decided_at.is_some());

        let invited = store
            .matches_for_job(
                "job123",
                &MatchFilter {
                    min_score: Some(0.5),
                    decision: Some(Decision::Invited),
                },
            )
            .await?;
        assert_eq!(invited.len(), 1);
        Ok(())
    }

    #[sqlx::test]
    async fn test_first_delivery_time_sticks(pool: PgPool) -> Result<(), StoreError> {
        let store = PgStore::new(pool);
        let key = paired(&store).await?;

        let first = store
            .match_record(&key)
            .await?
            .expect("match row")
            .created_at;
        let later = first + chrono::Duration::minutes(5);
        store
            .record_invite_outcome(&key, &InviteOutcome::Delivered { at: first }, None)
            .await?;
        store
            .record_invite_outcome(&key, &InviteOutcome::Delivered { at: later }, None)
            .await?;
        assert_eq!(
            store
                .record_invite_outcome(
                    &key,
                    &InviteOutcome::Failed {
                        detail: "smtp down".to_string(),
                    },
                    None,
                )
                .await?,
            MatchWrite::Applied
        );

        let record = store.match_record(&key).await?.expect("match row");
        assert_eq!(record.invite_sent_at, Some(first));
        assert!(record.invite_error.is_none());

        let unknown = PairKey::new("job404", "resumeZ");
        assert_eq!(
            store
                .record_invite_outcome(&unknown, &InviteOutcome::Delivered { at: first }, None)
                .await?,
            MatchWrite::Missing
        );
        Ok(())
    }

    #[sqlx::test]
    async fn test_outbox_drains_in_order_and_deletes(pool: PgPool) -> Result<(), StoreError> {
        let store = PgStore::new(pool.clone());
        store.admit_job(&job("job1"), Origin::Intake).await?;
        store.admit_job(&job("job2"), Origin::Intake).await?;
        store
            .admit_candidate(&candidate("resumeA"), Origin::Intake)
            .await?;

        let pending = store.pending_outbox(10).await?;
        let subjects: Vec<Subject> = pending.iter().map(|e| e.item.payload.subject()).collect();
        assert_eq!(
            subjects,
            vec![
                Subject::job("job1"),
                Subject::job("job2"),
                Subject::candidate("resumeA")
            ]
        );
        assert_eq!(store.pending_outbox(1).await?.len(), 1);

        store.mark_dispatched(pending[0].seq).await?;
        store.mark_dispatched(pending[0].seq).await?;
        let rest = store.pending_outbox(10).await?;
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0].seq, pending[1].seq);

        for entry in &rest {
            store.mark_dispatched(entry.seq).await?;
        }
        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox")
            .fetch_one(&pool)
            .await?;
        assert_eq!(rows, 0);
        Ok(())
    }
}
