use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::models::StatusParseError;

/// Fixed topics, one per stage input and output, plus the monitoring feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    #[serde(rename = "jd.summarize")]
    SummarizeRequested,
    #[serde(rename = "jd.summarized")]
    JobSummarized,
    #[serde(rename = "resume.parse")]
    ParseRequested,
    #[serde(rename = "resume.parsed")]
    ResumeParsed,
    #[serde(rename = "match.requested")]
    MatchRequested,
    #[serde(rename = "match.scored")]
    MatchScored,
    #[serde(rename = "invite.requested")]
    InviteRequested,
    #[serde(rename = "invite.completed")]
    InviteCompleted,
    #[serde(rename = "pipeline.failures")]
    Failures,
}

impl Topic {
    pub const ALL: [Topic; 9] = [
        Topic::SummarizeRequested,
        Topic::JobSummarized,
        Topic::ParseRequested,
        Topic::ResumeParsed,
        Topic::MatchRequested,
        Topic::MatchScored,
        Topic::InviteRequested,
        Topic::InviteCompleted,
        Topic::Failures,
    ];

    /// Topics the orchestrator consumes: every stage's output.
    pub const COMPLETIONS: [Topic; 4] = [
        Topic::JobSummarized,
        Topic::ResumeParsed,
        Topic::MatchScored,
        Topic::InviteCompleted,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Topic::SummarizeRequested => "jd.summarize",
            Topic::JobSummarized => "jd.summarized",
            Topic::ParseRequested => "resume.parse",
            Topic::ResumeParsed => "resume.parsed",
            Topic::MatchRequested => "match.requested",
            Topic::MatchScored => "match.scored",
            Topic::InviteRequested => "invite.requested",
            Topic::InviteCompleted => "invite.completed",
            Topic::Failures => "pipeline.failures",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The four processing stages. Each reads one topic and writes one topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Summarize,
    ParseResume,
    Score,
    Notify,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Summarize, Stage::ParseResume, Stage::Score, Stage::Notify];

    /// The stage whose output lands on `topic`, if any.
    pub fn producing(topic: Topic) -> Option<Stage> {
        Stage::ALL.into_iter().find(|s| s.output_topic() == topic)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Summarize => "summarize",
            Stage::ParseResume => "parse_resume",
            Stage::Score => "score",
            Stage::Notify => "notify",
        }
    }

    pub fn input_topic(&self) -> Topic {
        match self {
            Stage::Summarize => Topic::SummarizeRequested,
            Stage::ParseResume => Topic::ParseRequested,
            Stage::Score => Topic::MatchRequested,
            Stage::Notify => Topic::InviteRequested,
        }
    }

    pub fn output_topic(&self) -> Topic {
        match self {
            Stage::Summarize => Topic::JobSummarized,
            Stage::ParseResume => Topic::ResumeParsed,
            Stage::Score => Topic::MatchScored,
            Stage::Notify => Topic::InviteCompleted,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "summarize" => Ok(Stage::Summarize),
            "parse_resume" => Ok(Stage::ParseResume),
            "score" => Ok(Stage::Score),
            "notify" => Ok(Stage::Notify),
            other => Err(StatusParseError::new("stage", other)),
        }
    }
}
