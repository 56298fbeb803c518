use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;

use crate::models::failure::FailureNote;
use crate::models::StatusParseError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Ingested,
    Summarized,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Ingested => "ingested",
            JobStatus::Summarized => "summarized",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ingested" => Ok(JobStatus::Ingested),
            "summarized" => Ok(JobStatus::Summarized),
            "failed" => Ok(JobStatus::Failed),
            other => Err(StatusParseError::new("job status", other)),
        }
    }
}

/// Structured output of the summarizer stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub summary: String,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub responsibilities: Vec<String>,
    #[serde(default)]
    pub qualifications: Vec<String>,
}

/// A job description as detected on disk or posted to the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewJob {
    pub job_id: String,
    pub title: String,
    pub raw_text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDescription {
    pub job_id: String,
    pub title: String,
    pub raw_text: String,
    pub summary: Option<JobSummary>,
    pub status: JobStatus,
    pub failure: Option<FailureNote>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobDescription {
    pub fn ingested(job: &NewJob, now: DateTime<Utc>) -> Self {
        Self {
            job_id: job.job_id.clone(),
            title: job.title.clone(),
            raw_text: job.raw_text.clone(),
            summary: None,
            status: JobStatus::Ingested,
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// True when a re-submission carries exactly what is already recorded.
    pub fn same_content(&self, job: &NewJob) -> bool {
        self.title == job.title && self.raw_text == job.raw_text
    }
}

/// Row shape of `job_descriptions`.
#[derive(Debug, FromRow)]
pub struct JobRow {
    pub job_id: String,
    pub title: String,
    pub raw_text: String,
    pub summary: Option<Json<JobSummary>>,
    pub status: String,
    pub failure_stage: Option<String>,
    pub failure_kind: Option<String>,
    pub failure_detail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for JobDescription {
    type Error = StatusParseError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Self {
            job_id: row.job_id,
            title: row.title,
            raw_text: row.raw_text,
            summary: row.summary.map(|Json(s)| s),
            status: row.status.parse()?,
            failure: FailureNote::from_columns(
                row.failure_stage,
                row.failure_kind,
                row.failure_detail,
            )?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_round_trips_through_text() {
        for status in [JobStatus::Ingested, JobStatus::Summarized, JobStatus::Failed] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("parsed".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_summary_lists_default_when_missing() {
        let summary: JobSummary = serde_json::from_str(r#"{"summary": "Backend role"}"#).unwrap();
        assert_eq!(summary.summary, "Backend role");
        assert!(summary.skills.is_empty());
        assert!(summary.qualifications.is_empty());
    }

    #[test]
    fn test_same_content_compares_title_and_text() {
        let job = NewJob {
            job_id: "job123".to_string(),
            title: "Software Engineer".to_string(),
            raw_text: "3+ years Python".to_string(),
        };
        let record = JobDescription::ingested(&job, Utc::now());
        assert!(record.same_content(&job));

        let edited = NewJob {
            raw_text: "5+ years Go".to_string(),
            ..job
        };
        assert!(!record.same_content(&edited));
    }
}
