//! Summarizer stage: turns a raw job description into a [`JobSummary`].

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::channel::{Payload, Stage, StageResult, WorkItem};
use crate::llm_client::prompts::NO_INVENTION_INSTRUCTION;
use crate::llm_client::LlmClient;
use crate::models::failure::StageFailure;
use crate::models::job::JobSummary;
use crate::stages::prompts::{SUMMARIZE_PROMPT_TEMPLATE, SUMMARIZE_SYSTEM};
use crate::stages::{wrong_payload, StageHandler};

#[async_trait]
pub trait JobSummarizer: Send + Sync + 'static {
    async fn summarize(&self, title: &str, text: &str) -> Result<JobSummary, StageFailure>;
}

pub struct LlmSummarizer {
    llm: LlmClient,
}

impl LlmSummarizer {
    pub fn new(llm: LlmClient) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl JobSummarizer for LlmSummarizer {
    async fn summarize(&self, title: &str, text: &str) -> Result<JobSummary, StageFailure> {
        let prompt = SUMMARIZE_PROMPT_TEMPLATE
            .replace("{no_invention}", NO_INVENTION_INSTRUCTION)
            .replace("{title}", title)
            .replace("{jd_text}", text);
        let summary = self
            .llm
            .complete_json::<JobSummary>(SUMMARIZE_SYSTEM, &prompt)
            .await?;
        debug!(
            "{} summarized {} chars into {} skills",
            self.llm.model(),
            text.len(),
            summary.skills.len()
        );
        Ok(summary)
    }
}

pub struct SummarizerStage {
    summarizer: Arc<dyn JobSummarizer>,
}

impl SummarizerStage {
    pub fn new(summarizer: Arc<dyn JobSummarizer>) -> Self {
        Self { summarizer }
    }
}

/// Drops blank entries and surrounding whitespace the model sometimes leaves behind.
fn tidy(items: Vec<String>) -> Vec<String> {
    items
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[async_trait]
impl StageHandler for SummarizerStage {
    fn stage(&self) -> Stage {
        Stage::Summarize
    }

    async fn handle(&self, item: &WorkItem) -> Result<StageResult, StageFailure> {
        let Payload::SummarizeJob {
            job_id,
            title,
            raw_text,
        } = &item.payload
        else {
            return Err(wrong_payload(self.stage(), item));
        };

        if raw_text.trim().is_empty() {
            return Err(StageFailure::permanent(format!(
                "job {job_id} has an empty description"
            )));
        }

        let summary = self.summarizer.summarize(title, raw_text).await?;
        let summary = JobSummary {
            summary: summary.summary.trim().to_string(),
            skills: tidy(summary.skills),
            responsibilities: tidy(summary.responsibilities),
            qualifications: tidy(summary.qualifications),
        };
        if summary.summary.is_empty() && summary.skills.is_empty() {
            return Err(StageFailure::permanent(format!(
                "summary for job {job_id} came back empty"
            )));
        }
        Ok(StageResult::JobSummary(summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::failure::FailureKind;

    struct Canned(Result<JobSummary, StageFailure>);

    #[async_trait]
    impl JobSummarizer for Canned {
        async fn summarize(&self, _title: &str, _text: &str) -> Result<JobSummary, StageFailure> {
            self.0.clone()
        }
    }

    fn stage(outcome: Result<JobSummary, StageFailure>) -> SummarizerStage {
        SummarizerStage::new(Arc::new(Canned(outcome)))
    }

    fn request(raw_text: &str) -> WorkItem {
        WorkItem::new(Payload::SummarizeJob {
            job_id: "job123".to_string(),
            title: "Software Engineer".to_string(),
            raw_text: raw_text.to_string(),
        })
    }

    #[tokio::test]
    async fn test_summary_is_tidied() {
        let stage = stage(Ok(JobSummary {
            summary: "  Backend role.  ".to_string(),
            skills: vec![" Python ".to_string(), "".to_string(), "SQL".to_string()],
            ..JobSummary::default()
        }));

        let result = stage.handle(&request("3+ years Python and SQL")).await.unwrap();
        let StageResult::JobSummary(summary) = result else {
            panic!("expected a job summary");
        };
        assert_eq!(summary.summary, "Backend role.");
        assert_eq!(summary.skills, vec!["Python", "SQL"]);
    }

    #[tokio::test]
    async fn test_blank_description_is_permanent() {
        let stage = stage(Ok(JobSummary::default()));
        let failure = stage.handle(&request("   \n")).await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::Permanent);
    }

    #[tokio::test]
    async fn test_empty_model_output_is_permanent() {
        let stage = stage(Ok(JobSummary::default()));
        let failure = stage.handle(&request("Python")).await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::Permanent);
    }

    #[tokio::test]
    async fn test_capability_failure_keeps_its_kind() {
        let stage = stage(Err(StageFailure::transient("HTTP error: connection reset")));
        let failure = stage.handle(&request("Python")).await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::Transient);
    }

    #[tokio::test]
    async fn test_other_payloads_are_rejected() {
        let stage = stage(Ok(JobSummary::default()));
        let item = WorkItem::new(Payload::ScoreMatch {
            job_id: "job123".to_string(),
            candidate_id: "resumeA".to_string(),
        });
        let failure = stage.handle(&item).await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::Permanent);
        assert!(failure.detail.contains("score_match"));
    }
}
