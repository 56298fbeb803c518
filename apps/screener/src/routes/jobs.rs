use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::job::{JobDescription, NewJob};
use crate::models::matching::{Decision, MatchRecord};
use crate::orchestrator::Submission;
use crate::state::AppState;
use crate::store::{MatchFilter, Origin};

#[derive(Deserialize)]
pub struct SubmitJobRequest {
    /// Derived when absent.
    pub job_id: Option<String>,
    pub title: String,
    pub description: String,
}

#[derive(Serialize)]
pub struct SubmitJobResponse {
    pub job_id: String,
    pub outcome: &'static str,
}

#[derive(Deserialize)]
pub struct MatchQuery {
    pub min_score: Option<f64>,
    pub decision: Option<Decision>,
}

#[derive(Serialize)]
pub struct MatchListResponse {
    pub job_id: String,
    pub matches: Vec<MatchRecord>,
}

#[derive(Serialize)]
pub struct ShortlistEntry {
    pub candidate_id: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub score: Option<f64>,
    pub matching_skills: Vec<String>,
    pub invite_sent_at: Option<DateTime<Utc>>,
    pub invite_error: Option<String>,
}

#[derive(Serialize)]
pub struct ShortlistResponse {
    pub job_id: String,
    pub threshold: f64,
    pub candidates: Vec<ShortlistEntry>,
}

async fn existing_job(state: &AppState, job_id: &str) -> Result<JobDescription, AppError> {
    state
        .store
        .job(job_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Job {job_id} not found")))
}

/// POST /api/v1/jobs
pub async fn handle_submit_job(
    State(state): State<AppState>,
    Json(req): Json<SubmitJobRequest>,
) -> Result<(StatusCode, Json<SubmitJobResponse>), AppError> {
    let title = req.title.trim();
    if title.is_empty() {
        return Err(AppError::Validation("title must not be empty".to_string()));
    }
    if req.description.trim().is_empty() {
        return Err(AppError::Validation(
            "description must not be empty".to_string(),
        ));
    }
    let job_id = match req.job_id.as_deref().map(str::trim) {
        Some("") => return Err(AppError::Validation("job_id must not be blank".to_string())),
        Some(id) => id.to_string(),
        None => format!("job-{}", Uuid::new_v4().simple()),
    };

    let submission = state
        .orchestrator
        .submit_job(
            NewJob {
                job_id: job_id.clone(),
                title: title.to_string(),
                raw_text: req.description,
            },
            Origin::Resubmit,
        )
        .await?;

    let (status, outcome) = match submission {
        Submission::Accepted => (StatusCode::ACCEPTED, "accepted"),
        Submission::Reopened => (StatusCode::ACCEPTED, "reopened"),
        Submission::Duplicate => (StatusCode::OK, "duplicate"),
    };
    Ok((status, Json(SubmitJobResponse { job_id, outcome })))
}

/// GET /api/v1/jobs/:job_id
pub async fn handle_get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobDescription>, AppError> {
    Ok(Json(existing_job(&state, &job_id).await?))
}

/// GET /api/v1/jobs/:job_id/matches?min_score=&decision=
pub async fn handle_job_matches(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Query(query): Query<MatchQuery>,
) -> Result<Json<MatchListResponse>, AppError> {
    if query.min_score.is_some_and(|s| !s.is_finite()) {
        return Err(AppError::Validation("min_score must be a finite number".to_string()));
    }
    existing_job(&state, &job_id).await?;

    let filter = MatchFilter {
        min_score: query.min_score,
        decision: query.decision,
    };
    let matches = state.store.matches_for_job(&job_id, &filter).await?;
    Ok(Json(MatchListResponse { job_id, matches }))
}

/// GET /api/v1/jobs/:job_id/shortlist
/// Invited candidates, best score first.
pub async fn handle_shortlist(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<ShortlistResponse>, AppError> {
    existing_job(&state, &job_id).await?;

    let filter = MatchFilter {
        min_score: None,
        decision: Some(Decision::Invited),
    };
    let mut candidates = Vec::new();
    for record in state.store.matches_for_job(&job_id, &filter).await? {
        let fields = state
            .store
            .candidate(&record.candidate_id)
            .await?
            .and_then(|c| c.fields)
            .unwrap_or_default();
        candidates.push(ShortlistEntry {
            candidate_id: record.candidate_id,
            name: fields.name,
            email: fields.email,
            score: record.score,
            matching_skills: record
                .details
                .map(|d| d.matching_skills)
                .unwrap_or_default(),
            invite_sent_at: record.invite_sent_at,
            invite_error: record.invite_error,
        });
    }

    Ok(Json(ShortlistResponse {
        job_id,
        threshold: state.orchestrator.threshold(),
        candidates,
    }))
}
