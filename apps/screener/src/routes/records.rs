use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;

use crate::errors::AppError;
use crate::models::candidate::{CandidateProfile, NewCandidate};
use crate::models::matching::{MatchRecord, PairKey};
use crate::orchestrator::Submission;
use crate::state::AppState;
use crate::store::{FailedEntities, Origin};

#[derive(Serialize)]
pub struct RetryCandidateResponse {
    pub candidate_id: String,
    pub outcome: &'static str,
}

/// GET /api/v1/candidates/:candidate_id
pub async fn handle_get_candidate(
    State(state): State<AppState>,
    Path(candidate_id): Path<String>,
) -> Result<Json<CandidateProfile>, AppError> {
    let candidate = state
        .store
        .candidate(&candidate_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Candidate {candidate_id} not found")))?;
    Ok(Json(candidate))
}

/// POST /api/v1/candidates/:candidate_id/retry
/// Sends a `failed` candidate back through parsing from its recorded resume. A candidate in
/// any other state is left alone.
pub async fn handle_retry_candidate(
    State(state): State<AppState>,
    Path(candidate_id): Path<String>,
) -> Result<(StatusCode, Json<RetryCandidateResponse>), AppError> {
    let existing = state
        .store
        .candidate(&candidate_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Candidate {candidate_id} not found")))?;

    let submission = state
        .orchestrator
        .submit_candidate(
            NewCandidate {
                candidate_id: existing.candidate_id,
                source_ref: existing.source_ref,
            },
            Origin::Resubmit,
        )
        .await?;

    let (status, outcome) = match submission {
        Submission::Reopened => (StatusCode::ACCEPTED, "reopened"),
        Submission::Accepted => (StatusCode::ACCEPTED, "accepted"),
        Submission::Duplicate => (StatusCode::OK, "unchanged"),
    };
    Ok((
        status,
        Json(RetryCandidateResponse {
            candidate_id,
            outcome,
        }),
    ))
}

/// GET /api/v1/matches/:job_id/:candidate_id
pub async fn handle_get_match(
    State(state): State<AppState>,
    Path((job_id, candidate_id)): Path<(String, String)>,
) -> Result<Json<MatchRecord>, AppError> {
    let key = PairKey::new(job_id, candidate_id);
    let record = state
        .store
        .match_record(&key)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("No match recorded for {key}")))?;
    Ok(Json(record))
}

/// GET /api/v1/failures
/// Jobs and candidates parked in `failed`, waiting for a manual resubmission.
pub async fn handle_failures(
    State(state): State<AppState>,
) -> Result<Json<FailedEntities>, AppError> {
    Ok(Json(state.store.failed_entities().await?))
}
