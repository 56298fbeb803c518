use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::channel::Stage;
use crate::models::StatusParseError;

/// How a stage classified its own failure. The orchestrator never looks past this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Collaborator temporarily unreachable. Retried by the handler, never by the orchestrator.
    Transient,
    /// Input can never be processed (unparsable resume, missing record).
    Permanent,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::Permanent => "permanent",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureKind {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transient" => Ok(FailureKind::Transient),
            "permanent" => Ok(FailureKind::Permanent),
            other => Err(StatusParseError::new("failure_kind", other)),
        }
    }
}

/// The only error a stage handler reports back onto the channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind} stage failure: {detail}")]
pub struct StageFailure {
    pub kind: FailureKind,
    pub detail: String,
    /// Wait the collaborator asked for before trying again. Local to the worker; never sent.
    #[serde(skip)]
    pub retry_after: Option<Duration>,
}

impl StageFailure {
    pub fn transient(detail: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            detail: detail.into(),
            retry_after: None,
        }
    }

    pub fn permanent(detail: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Permanent,
            detail: detail.into(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    pub fn is_transient(&self) -> bool {
        self.kind == FailureKind::Transient
    }
}

/// Why an entity ended up `failed`. Kept on the record for manual review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureNote {
    pub stage: Stage,
    pub kind: FailureKind,
    pub detail: String,
}

impl FailureNote {
    pub fn new(stage: Stage, failure: &StageFailure) -> Self {
        Self {
            stage,
            kind: failure.kind,
            detail: failure.detail.clone(),
        }
    }

    /// Rebuilds a note from its three nullable columns. All three are written together.
    pub fn from_columns(
        stage: Option<String>,
        kind: Option<String>,
        detail: Option<String>,
    ) -> Result<Option<Self>, StatusParseError> {
        match (stage, kind) {
            (Some(stage), Some(kind)) => Ok(Some(Self {
                stage: stage.parse()?,
                kind: kind.parse()?,
                detail: detail.unwrap_or_default(),
            })),
            _ => Ok(None),
        }
    }
}
