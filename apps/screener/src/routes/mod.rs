pub mod health;
pub mod jobs;
pub mod records;

use axum::{
    routing::{get, post},
    Router,
};

use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        .route("/api/v1/jobs", post(jobs::handle_submit_job))
        .route("/api/v1/jobs/:job_id", get(jobs::handle_get_job))
        .route("/api/v1/jobs/:job_id/matches", get(jobs::handle_job_matches))
        .route("/api/v1/jobs/:job_id/shortlist", get(jobs::handle_shortlist))
        .route(
            "/api/v1/candidates/:candidate_id",
            get(records::handle_get_candidate),
        )
        .route(
            "/api/v1/candidates/:candidate_id/retry",
            post(records::handle_retry_candidate),
        )
        .route(
            "/api/v1/matches/:job_id/:candidate_id",
            get(records::handle_get_match),
        )
        .route("/api/v1/failures", get(records::handle_failures))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::channel::memory::MemoryChannel;
    use crate::channel::{Payload, Stage, Subject, WorkItem};
    use crate::models::candidate::{CandidateFields, CandidateStatus, NewCandidate};
    use crate::models::failure::{FailureNote, StageFailure};
    use crate::models::job::{JobSummary, NewJob};
    use crate::models::matching::{Decision, MatchDetails, MatchScore, PairKey};
    use crate::orchestrator::{Orchestrator, OrchestratorSettings};
    use crate::store::{MemoryStore, Origin, StateStore};

    fn app() -> (Arc<MemoryStore>, Router) {
        let store = Arc::new(MemoryStore::new());
        let channel = Arc::new(MemoryChannel::new(Duration::from_secs(30)));
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            channel,
            OrchestratorSettings {
                threshold: 0.80,
                channel_wait: Duration::from_millis(20),
                outbox_interval: Duration::from_millis(50),
            },
        ));
        let router = build_router(AppState {
            store: store.clone(),
            orchestrator,
        });
        (store, router)
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    /// job123 with resumeA invited at 0.85 and resumeB rejected at 0.42.
    async fn seed(store: &MemoryStore) {
        store
            .admit_job(
                &NewJob {
                    job_id: "job123".to_string(),
                    title: "Software Engineer".to_string(),
                    raw_text: "Python and SQL".to_string(),
                },
                Origin::Intake,
            )
            .await
            .unwrap();
        store
            .complete_job("job123", &JobSummary::default())
            .await
            .unwrap();
        for (candidate_id, score, decision) in [
            ("resumeA", 0.85, Decision::Invited),
            ("resumeB", 0.42, Decision::Rejected),
        ] {
            store
                .admit_candidate(
                    &NewCandidate {
                        candidate_id: candidate_id.to_string(),
                        source_ref: format!("{candidate_id}.pdf"),
                    },
                    Origin::Intake,
                )
                .await
                .unwrap();
            store
                .complete_candidate(
                    candidate_id,
                    &CandidateFields {
                        name: Some(format!("{candidate_id} Doe")),
                        ..CandidateFields::default()
                    },
                )
                .await
                .unwrap();
            store
                .decide_match(
                    &PairKey::new("job123", candidate_id),
                    &MatchScore {
                        score,
                        details: MatchDetails::default(),
                    },
                    decision,
                    None,
                )
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_health_reports_providers() {
        let (_, router) = app();
        let (status, body) = send(&router, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["channel"], "memory");
    }

    #[tokio::test]
    async fn test_submit_job_then_resubmit() {
        let (store, router) = app();
        let job = json!({"job_id": "job123", "title": "Software Engineer", "description": "Python"});

        let (status, body) = send(&router, post_json("/api/v1/jobs", job.clone())).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["outcome"], "accepted");
        assert!(store.job("job123").await.unwrap().is_some());

        let (status, body) = send(&router, post_json("/api/v1/jobs", job)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "duplicate");

        let edited = json!({"job_id": "job123", "title": "Software Engineer", "description": "Go"});
        let (status, body) = send(&router, post_json("/api/v1/jobs", edited)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "CONFLICT");
    }

    #[tokio::test]
    async fn test_submit_job_derives_missing_id_and_validates() {
        let (_, router) = app();
        let (status, body) = send(
            &router,
            post_json("/api/v1/jobs", json!({"title": "Data Analyst", "description": "SQL"})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(body["job_id"].as_str().unwrap().starts_with("job-"));

        let (status, body) = send(
            &router,
            post_json("/api/v1/jobs", json!({"title": "Data Analyst", "description": "  "})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let (_, router) = app();
        let (status, body) = send(&router, get("/api/v1/jobs/nope")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "NOT_FOUND");

        let (status, _) = send(&router, get("/api/v1/jobs/nope/matches")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_matches_filter_by_min_score() {
        let (store, router) = app();
        seed(&store).await;

        let (status, body) = send(&router, get("/api/v1/jobs/job123/matches")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["matches"].as_array().unwrap().len(), 2);
        assert_eq!(body["matches"][0]["candidate_id"], "resumeA");

        let (_, body) = send(&router, get("/api/v1/jobs/job123/matches?min_score=0.5")).await;
        let matches = body["matches"].as_array().unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0]["decision"], "invited");

        let (_, body) = send(&router, get("/api/v1/jobs/job123/matches?decision=rejected")).await;
        assert_eq!(body["matches"][0]["candidate_id"], "resumeB");
    }

    #[tokio::test]
    async fn test_shortlist_lists_invited_only() {
        let (store, router) = app();
        seed(&store).await;

        let (status, body) = send(&router, get("/api/v1/jobs/job123/shortlist")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["threshold"], 0.80);
        let candidates = body["candidates"].as_array().unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0]["candidate_id"], "resumeA");
        assert_eq!(candidates[0]["name"], "resumeA Doe");
    }

    #[tokio::test]
    async fn test_match_and_candidate_lookup() {
        let (store, router) = app();
        seed(&store).await;

        let (status, body) = send(&router, get("/api/v1/matches/job123/resumeB")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["decision"], "rejected");

        let (status, body) = send(&router, get("/api/v1/candidates/resumeA")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "parsed");

        let (status, _) = send(&router, get("/api/v1/matches/job123/resumeZ")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    async fn failed_candidate(store: &MemoryStore, candidate_id: &str) {
        store
            .admit_candidate(
                &NewCandidate {
                    candidate_id: candidate_id.to_string(),
                    source_ref: format!("{candidate_id}.pdf"),
                },
                Origin::Intake,
            )
            .await
            .unwrap();
        let failure = StageFailure::permanent("no extractable text");
        store
            .fail_candidate(
                candidate_id,
                &FailureNote::new(Stage::ParseResume, &failure),
                &WorkItem::new(Payload::PipelineFailure {
                    stage: Stage::ParseResume,
                    subject: Subject::candidate(candidate_id),
                    failure: failure.clone(),
                }),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_failures_lists_failed_entities() {
        let (store, router) = app();
        failed_candidate(&store, "resumeC").await;

        let (status, body) = send(&router, get("/api/v1/failures")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["jobs"].as_array().unwrap().is_empty());
        assert_eq!(body["candidates"][0]["candidate_id"], "resumeC");
        assert_eq!(body["candidates"][0]["failure"]["kind"], "permanent");
    }

    #[tokio::test]
    async fn test_retry_reopens_failed_candidate_only() {
        let (store, router) = app();
        failed_candidate(&store, "resumeC").await;
        let retry = |id: &str| {
            Request::post(format!("/api/v1/candidates/{id}/retry"))
                .body(Body::empty())
                .unwrap()
        };

        let (status, body) = send(&router, retry("resumeC")).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["outcome"], "reopened");
        let candidate = store.candidate("resumeC").await.unwrap().unwrap();
        assert_eq!(candidate.status, CandidateStatus::Ingested);
        assert_eq!(candidate.source_ref, "resumeC.pdf");

        // Already back in the pipeline; a second retry changes nothing.
        let (status, body) = send(&router, retry("resumeC")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "unchanged");

        let (status, _) = send(&router, retry("resumeZ")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
