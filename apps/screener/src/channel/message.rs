use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::channel::{Stage, Topic};
use crate::models::candidate::CandidateFields;
use crate::models::failure::StageFailure;
use crate::models::job::JobSummary;
use crate::models::matching::{InviteContext, MatchScore};

/// What a message is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Subject {
    Job { job_id: String },
    Candidate { candidate_id: String },
    Pair { job_id: String, candidate_id: String },
}

impl Subject {
    pub fn job(job_id: impl Into<String>) -> Self {
        Subject::Job {
            job_id: job_id.into(),
        }
    }

    pub fn candidate(candidate_id: impl Into<String>) -> Self {
        Subject::Candidate {
            candidate_id: candidate_id.into(),
        }
    }
}

impl std::fmt::Display for Subject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Subject::Job { job_id } => write!(f, "job {job_id}"),
            Subject::Candidate { candidate_id } => write!(f, "candidate {candidate_id}"),
            Subject::Pair {
                job_id,
                candidate_id,
            } => write!(f, "pair {job_id}/{candidate_id}"),
        }
    }
}

/// Structured result a stage reports on success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StageResult {
    JobSummary(JobSummary),
    CandidateProfile(CandidateFields),
    MatchScore(MatchScore),
    InviteDelivered {
        delivered_at: DateTime<Utc>,
        /// The invite had already gone out; nothing was sent this time.
        already_sent: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    SummarizeJob {
        job_id: String,
        title: String,
        raw_text: String,
    },
    ParseResume {
        candidate_id: String,
        source_ref: String,
    },
    ScoreMatch {
        job_id: String,
        candidate_id: String,
    },
    SendInvite {
        job_id: String,
        candidate_id: String,
        context: InviteContext,
    },
    StageCompleted {
        stage: Stage,
        subject: Subject,
        result: StageResult,
    },
    StageFailed {
        stage: Stage,
        subject: Subject,
        failure: StageFailure,
    },
    /// Published for external monitoring whenever something ends in failure.
    PipelineFailure {
        stage: Stage,
        subject: Subject,
        failure: StageFailure,
    },
}

impl Payload {
    /// The `type` tag this payload carries on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::SummarizeJob { .. } => "summarize_job",
            Payload::ParseResume { .. } => "parse_resume",
            Payload::ScoreMatch { .. } => "score_match",
            Payload::SendInvite { .. } => "send_invite",
            Payload::StageCompleted { .. } => "stage_completed",
            Payload::StageFailed { .. } => "stage_failed",
            Payload::PipelineFailure { .. } => "pipeline_failure",
        }
    }

    pub fn topic(&self) -> Topic {
        match self {
            Payload::SummarizeJob { .. } => Topic::SummarizeRequested,
            Payload::ParseResume { .. } => Topic::ParseRequested,
            Payload::ScoreMatch { .. } => Topic::MatchRequested,
            Payload::SendInvite { .. } => Topic::InviteRequested,
            Payload::StageCompleted { stage, .. } | Payload::StageFailed { stage, .. } => {
                stage.output_topic()
            }
            Payload::PipelineFailure { .. } => Topic::Failures,
        }
    }

    /// The subject of a stage input. Completion and monitoring payloads carry their own.
    pub fn subject(&self) -> Subject {
        match self {
            Payload::SummarizeJob { job_id, .. } => Subject::job(job_id.as_str()),
            Payload::ParseResume { candidate_id, .. } => Subject::candidate(candidate_id.as_str()),
            Payload::ScoreMatch {
                job_id,
                candidate_id,
            }
            | Payload::SendInvite {
                job_id,
                candidate_id,
                ..
            } => Subject::Pair {
                job_id: job_id.clone(),
                candidate_id: candidate_id.clone(),
            },
            Payload::StageCompleted { subject, .. }
            | Payload::StageFailed { subject, .. }
            | Payload::PipelineFailure { subject, .. } => subject.clone(),
        }
    }
}

/// A unit of work on the channel. `attempt` is stamped by the channel on delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: Uuid,
    pub topic: Topic,
    pub payload: Payload,
    #[serde(default)]
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn new(payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: payload.topic(),
            payload,
            attempt: 0,
            created_at: Utc::now(),
        }
    }
}
