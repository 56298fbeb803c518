use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;

use crate::models::StatusParseError;

/// Outcome of the threshold policy for one pair. Leaves `Pending` exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Pending,
    Invited,
    Rejected,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Pending => "pending",
            Decision::Invited => "invited",
            Decision::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Decision::Pending)
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Decision {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Decision::Pending),
            "invited" => Ok(Decision::Invited),
            "rejected" => Ok(Decision::Rejected),
            other => Err(StatusParseError::new("decision", other)),
        }
    }
}

/// Composite key of a match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PairKey {
    pub job_id: String,
    pub candidate_id: String,
}

impl PairKey {
    pub fn new(job_id: impl Into<String>, candidate_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            candidate_id: candidate_id.into(),
        }
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.job_id, self.candidate_id)
    }
}

/// Informational overlap between the job's and the candidate's skill lists.
/// Does not feed the score.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchDetails {
    pub matching_skills: Vec<String>,
    /// Share of the job's skills found on the candidate, 0.0 – 1.0.
    pub skill_coverage: f64,
}

/// What the matcher stage reports for one pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchScore {
    pub score: f64,
    pub details: MatchDetails,
}

/// Everything the notifier needs to write an invitation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InviteContext {
    pub candidate_name: String,
    pub candidate_email: Option<String>,
    pub job_title: String,
    pub score: f64,
    pub matching_skills: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchRecord {
    pub job_id: String,
    pub candidate_id: String,
    pub score: Option<f64>,
    pub details: Option<MatchDetails>,
    pub decision: Decision,
    pub failure: Option<String>,
    pub invite_sent_at: Option<DateTime<Utc>>,
    pub invite_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

impl MatchRecord {
    pub fn pending(key: &PairKey, now: DateTime<Utc>) -> Self {
        Self {
            job_id: key.job_id.clone(),
            candidate_id: key.candidate_id.clone(),
            score: None,
            details: None,
            decision: Decision::Pending,
            failure: None,
            invite_sent_at: None,
            invite_error: None,
            created_at: now,
            decided_at: None,
        }
    }
}

/// Row shape of `matches`.
#[derive(Debug, FromRow)]
pub struct MatchRow {
    pub job_id: String,
    pub candidate_id: String,
    pub score: Option<f64>,
    pub details: Option<Json<MatchDetails>>,
    pub decision: String,
    pub failure: Option<String>,
    pub invite_sent_at: Option<DateTime<Utc>>,
    pub invite_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

impl TryFrom<MatchRow> for MatchRecord {
    type Error = StatusParseError;

    fn try_from(row: MatchRow) -> Result<Self, Self::Error> {
        Ok(Self {
            job_id: row.job_id,
            candidate_id: row.candidate_id,
            score: row.score,
            details: row.details.map(|Json(d)| d),
            decision: row.decision.parse()?,
            failure: row.failure,
            invite_sent_at: row.invite_sent_at,
            invite_error: row.invite_error,
            created_at: row.created_at,
            decided_at: row.decided_at,
        })
    }
}
