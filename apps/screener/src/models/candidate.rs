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
pub enum CandidateStatus {
    Ingested,
    Parsed,
    Failed,
}

impl CandidateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CandidateStatus::Ingested => "ingested",
            CandidateStatus::Parsed => "parsed",
            CandidateStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for CandidateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CandidateStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ingested" => Ok(CandidateStatus::Ingested),
            "parsed" => Ok(CandidateStatus::Parsed),
            "failed" => Ok(CandidateStatus::Failed),
            other => Err(StatusParseError::new("candidate status", other)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Experience {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub company: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Education {
    #[serde(default)]
    pub degree: String,
    #[serde(default)]
    pub institution: String,
}

/// Structured resume fields produced by the resume parser stage.
/// The orchestrator never looks inside; only the matcher and notifier do.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateFields {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub experience: Vec<Experience>,
    #[serde(default)]
    pub education: Vec<Education>,
}

impl CandidateFields {
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or("Candidate")
    }
}

/// A resume document as detected on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewCandidate {
    pub candidate_id: String,
    pub source_ref: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateProfile {
    pub candidate_id: String,
    pub source_ref: String,
    pub fields: Option<CandidateFields>,
    pub status: CandidateStatus,
    pub failure: Option<FailureNote>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CandidateProfile {
    pub fn ingested(candidate: &NewCandidate, now: DateTime<Utc>) -> Self {
        Self {
            candidate_id: candidate.candidate_id.clone(),
            source_ref: candidate.source_ref.clone(),
            fields: None,
            status: CandidateStatus::Ingested,
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn same_content(&self, candidate: &NewCandidate) -> bool {
        self.source_ref == candidate.source_ref
    }
}

/// Row shape of `candidates`.
#[derive(Debug, FromRow)]
pub struct CandidateRow {
    pub candidate_id: String,
    pub source_ref: String,
    pub fields: Option<Json<CandidateFields>>,
    pub status: String,
    pub failure_stage: Option<String>,
    pub failure_kind: Option<String>,
    pub failure_detail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<CandidateRow> for CandidateProfile {
    type Error = StatusParseError;

    fn try_from(row: CandidateRow) -> Result<Self, Self::Error> {
        Ok(Self {
            candidate_id: row.candidate_id,
            source_ref: row.source_ref,
            fields: row.fields.map(|Json(f)| f),
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
    fn test_fields_deserialize_from_sparse_llm_output() {
        let json = r#"{
            "name": "Jane Doe",
            "skills": ["Python", "SQL"],
            "experience": [{"role": "Engineer", "company": "Acme"}]
        }"#;
        let fields: CandidateFields = serde_json::from_str(json).unwrap();
        assert_eq!(fields.name.as_deref(), Some("Jane Doe"));
        assert_eq!(fields.skills.len(), 2);
        assert_eq!(fields.experience[0].description, "");
        assert!(fields.email.is_none());
        assert!(fields.education.is_empty());
    }

    #[test]
    fn test_display_name_falls_back_for_blank_names() {
        let mut fields = CandidateFields::default();
        assert_eq!(fields.display_name(), "Candidate");
        fields.name = Some("   ".to_string());
        assert_eq!(fields.display_name(), "Candidate");
        fields.name = Some("Jane Doe".to_string());
        assert_eq!(fields.display_name(), "Jane Doe");
    }

    #[test]
    fn test_candidate_status_rejects_job_statuses() {
        assert_eq!(
            "parsed".parse::<CandidateStatus>().unwrap(),
            CandidateStatus::Parsed
        );
        assert!("summarized".parse::<CandidateStatus>().is_err());
    }
}
