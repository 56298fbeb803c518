//! Matcher stage: scores one job/candidate pair by embedding similarity.
//!
//! The score is the cosine similarity of the two embeddings and nothing else. Skill overlap
//! is computed alongside for the record and the invitation, but never feeds the score.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::channel::{Payload, Stage, StageResult, WorkItem};
use crate::llm_client::embeddings::EmbeddingClient;
use crate::models::candidate::{CandidateFields, CandidateStatus};
use crate::models::failure::StageFailure;
use crate::models::job::{JobDescription, JobStatus};
use crate::models::matching::{MatchDetails, MatchScore};
use crate::stages::{wrong_payload, StageHandler};
use crate::store::{StateStore, StoreError};

#[async_trait]
pub trait Embedder: Send + Sync + 'static {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, StageFailure>;
}

#[async_trait]
impl Embedder for EmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, StageFailure> {
        Ok(EmbeddingClient::embed(self, text).await?)
    }
}

/// Cosine similarity of two embeddings. Empty, zero-norm or mismatched vectors have none.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f64, String> {
    if a.is_empty() || b.is_empty() {
        return Err("empty embedding".to_string());
    }
    if a.len() != b.len() {
        return Err(format!(
            "embedding dimensions differ ({} vs {})",
            a.len(),
            b.len()
        ));
    }

    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return Err("zero-norm embedding".to_string());
    }

    let similarity = dot / (norm_a.sqrt() * norm_b.sqrt());
    if !similarity.is_finite() {
        return Err("embedding similarity is not finite".to_string());
    }
    Ok(similarity.clamp(-1.0, 1.0))
}

/// Job skills also listed by the candidate, compared case-insensitively.
pub fn skill_overlap(job_skills: &[String], candidate_skills: &[String]) -> MatchDetails {
    let candidate: HashSet<String> = candidate_skills
        .iter()
        .map(|s| s.trim().to_lowercase())
        .collect();

    let mut seen = HashSet::new();
    let mut matching_skills = Vec::new();
    for skill in job_skills {
        let key = skill.trim().to_lowercase();
        if key.is_empty() || !seen.insert(key.clone()) {
            continue;
        }
        if candidate.contains(&key) {
            matching_skills.push(skill.trim().to_string());
        }
    }

    let skill_coverage = if seen.is_empty() {
        0.0
    } else {
        matching_skills.len() as f64 / seen.len() as f64
    };
    MatchDetails {
        matching_skills,
        skill_coverage,
    }
}

/// Text embedded for the job side: title, qualifications, skills, responsibilities.
pub fn job_text(job: &JobDescription) -> String {
    let mut text = format!("Job Title: {}\n", job.title);
    if let Some(summary) = &job.summary {
        text.push_str(&format!(
            "Requirements: {}\nSkills Required: {}\nResponsibilities: {}\n",
            summary.qualifications.join(" "),
            summary.skills.join(" "),
            summary.responsibilities.join(" ")
        ));
    }
    text
}

/// Text embedded for the candidate side: skills, experience, education.
pub fn candidate_text(fields: &CandidateFields) -> String {
    let experience: Vec<String> = fields
        .experience
        .iter()
        .map(|e| format!("{} at {}: {}", e.role, e.company, e.description))
        .collect();
    let education: Vec<String> = fields
        .education
        .iter()
        .map(|e| format!("{} from {}", e.degree, e.institution))
        .collect();
    format!(
        "Skills: {}\nExperience: {}\nEducation: {}\n",
        fields.skills.join(" "),
        experience.join(" "),
        education.join(" ")
    )
}

pub struct MatcherStage {
    store: Arc<dyn StateStore>,
    embedder: Arc<dyn Embedder>,
}

impl MatcherStage {
    pub fn new(store: Arc<dyn StateStore>, embedder: Arc<dyn Embedder>) -> Self {
        Self { store, embedder }
    }

    async fn load(
        &self,
        job_id: &str,
        candidate_id: &str,
    ) -> Result<(JobDescription, CandidateFields), StageFailure> {
        let transient = |e: StoreError| StageFailure::transient(format!("store unavailable: {e}"));

        let job = self
            .store
            .job(job_id)
            .await
            .map_err(transient)?
            .filter(|j| j.status == JobStatus::Summarized)
            .ok_or_else(|| StageFailure::permanent(format!("job {job_id} is not summarized")))?;

        let fields = self
            .store
            .candidate(candidate_id)
            .await
            .map_err(transient)?
            .filter(|c| c.status == CandidateStatus::Parsed)
            .and_then(|c| c.fields)
            .ok_or_else(|| {
                StageFailure::permanent(format!("candidate {candidate_id} is not parsed"))
            })?;

        Ok((job, fields))
    }
}

#[async_trait]
impl StageHandler for MatcherStage {
    fn stage(&self) -> Stage {
        Stage::Score
    }

    async fn handle(&self, item: &WorkItem) -> Result<StageResult, StageFailure> {
        let Payload::ScoreMatch {
            job_id,
            candidate_id,
        } = &item.payload
        else {
            return Err(wrong_payload(self.stage(), item));
        };

        let (job, fields) = self.load(job_id, candidate_id).await?;

        let job_embedding = self.embedder.embed(&job_text(&job)).await?;
        let candidate_embedding = self.embedder.embed(&candidate_text(&fields)).await?;
        let score = cosine_similarity(&job_embedding, &candidate_embedding).map_err(|detail| {
            StageFailure::permanent(format!("{job_id}/{candidate_id}: {detail}"))
        })?;

        let job_skills = job.summary.as_ref().map(|s| s.skills.as_slice()).unwrap_or(&[]);
        let details = skill_overlap(job_skills, &fields.skills);
        debug!(
            "Scored {job_id}/{candidate_id}: {score:.4} ({} matching skills)",
            details.matching_skills.len()
        );

        Ok(StageResult::MatchScore(MatchScore { score, details }))
    }
}
