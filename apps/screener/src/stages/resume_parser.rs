//! Resume parser stage: reads a resume document and extracts [`CandidateFields`].
//!
//! Text extraction happens here; field extraction is delegated to a [`ProfileExtractor`].
//! Name, email and phone are backfilled from the raw text when the extractor leaves
//! them out.

use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use crate::channel::{Payload, Stage, StageResult, WorkItem};
use crate::llm_client::prompts::NO_INVENTION_INSTRUCTION;
use crate::llm_client::LlmClient;
use crate::models::candidate::CandidateFields;
use crate::models::failure::StageFailure;
use crate::stages::prompts::{RESUME_PROMPT_TEMPLATE, RESUME_SYSTEM};
use crate::stages::{wrong_payload, StageHandler};

/// How many leading lines may hold the candidate's name.
const NAME_SCAN_LINES: usize = 5;
const NAME_MAX_WORDS: usize = 4;

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").expect("valid email regex")
});

static PHONE_RES: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"\+\d{1,2}[-.\s]?\d{3}[-.\s]?\d{3}[-.\s]?\d{4}",
        r"\(\d{3}\)[-.\s]?\d{3}[-.\s]?\d{4}",
        r"\b\d{3}[-.\s]?\d{3}[-.\s]?\d{4}\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid phone regex"))
    .collect()
});

#[async_trait]
pub trait ProfileExtractor: Send + Sync + 'static {
    async fn extract(&self, text: &str) -> Result<CandidateFields, StageFailure>;
}

pub struct LlmProfileExtractor {
    llm: LlmClient,
}

impl LlmProfileExtractor {
    pub fn new(llm: LlmClient) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl ProfileExtractor for LlmProfileExtractor {
    async fn extract(&self, text: &str) -> Result<CandidateFields, StageFailure> {
        let prompt = RESUME_PROMPT_TEMPLATE
            .replace("{no_invention}", NO_INVENTION_INSTRUCTION)
            .replace("{resume_text}", text);
        Ok(self
            .llm
            .complete_json::<CandidateFields>(RESUME_SYSTEM, &prompt)
            .await?)
    }
}

/// Reads the text of a resume document. PDFs go through `pdf-extract` on the blocking pool.
pub async fn read_document(path: &Path) -> Result<String, StageFailure> {
    let is_pdf = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("pdf"));

    let text = if is_pdf {
        let bytes = tokio::fs::read(path).await.map_err(|e| io_failure(path, e))?;
        tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&bytes))
            .await
            .map_err(|e| {
                // pdf-extract panics on some malformed documents.
                let detail = format!("pdf extraction of {} failed: {e}", path.display());
                if e.is_panic() {
                    StageFailure::permanent(detail)
                } else {
                    StageFailure::transient(detail)
                }
            })?
            .map_err(|e| {
                StageFailure::permanent(format!("cannot extract text from {}: {e}", path.display()))
            })?
    } else {
        tokio::fs::read_to_string(path)
            .await
            .map_err(|e| io_failure(path, e))?
    };

    if text.trim().is_empty() {
        return Err(StageFailure::permanent(format!(
            "{} contains no extractable text",
            path.display()
        )));
    }
    Ok(text)
}

fn io_failure(path: &Path, e: std::io::Error) -> StageFailure {
    let detail = format!("cannot read {}: {e}", path.display());
    match e.kind() {
        ErrorKind::NotFound | ErrorKind::InvalidData | ErrorKind::PermissionDenied => {
            StageFailure::permanent(detail)
        }
        _ => StageFailure::transient(detail),
    }
}

pub fn find_email(text: &str) -> Option<String> {
    EMAIL_RE.find(text).map(|m| m.as_str().to_string())
}

pub fn find_phone(text: &str) -> Option<String> {
    PHONE_RES
        .iter()
        .find_map(|re| re.find(text))
        .map(|m| m.as_str().trim().to_string())
}

/// First short line near the top that is neither an email nor a phone number.
pub fn guess_name(text: &str) -> Option<String> {
    text.lines()
        .take(NAME_SCAN_LINES)
        .map(str::trim)
        .find(|line| {
            !line.is_empty()
                && !line.contains('@')
                && !PHONE_RES.iter().any(|re| re.is_match(line))
                && line.split_whitespace().count() <= NAME_MAX_WORDS
        })
        .map(str::to_string)
}

fn blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}

/// Fills in name, email and phone from the raw text where the extractor left them empty.
pub fn backfill(mut fields: CandidateFields, text: &str) -> CandidateFields {
    if blank(&fields.email) {
        fields.email = find_email(text);
    }
    if blank(&fields.phone) {
        fields.phone = find_phone(text);
    }
    if blank(&fields.name) {
        fields.name = guess_name(text);
    }
    fields
}

pub struct ResumeParserStage {
    extractor: Arc<dyn ProfileExtractor>,
}

impl ResumeParserStage {
    pub fn new(extractor: Arc<dyn ProfileExtractor>) -> Self {
        Self { extractor }
    }
}

#[async_trait]
impl StageHandler for ResumeParserStage {
    fn stage(&self) -> Stage {
        Stage::ParseResume
    }

    async fn handle(&self, item: &WorkItem) -> Result<StageResult, StageFailure> {
        let Payload::ParseResume {
            candidate_id,
            source_ref,
        } = &item.payload
        else {
            return Err(wrong_payload(self.stage(), item));
        };

        let text = read_document(Path::new(source_ref)).await?;
        debug!("Read {} chars from {source_ref}", text.len());

        let fields = backfill(self.extractor.extract(&text).await?, &text);
        if fields.email.is_none() {
            warn!("No email found for candidate {candidate_id}");
        }
        Ok(StageResult::CandidateProfile(fields))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::models::failure::FailureKind;

    const RESUME: &str = "Jane Doe\n\
        jane.doe@example.com | (555) 123-4567\n\
        Backend engineer with 6 years of Python and SQL.\n\
        \n\
        Experience\n\
        Acme Corp, Senior Engineer\n";

    struct Canned(CandidateFields);

    #[async_trait]
    impl ProfileExtractor for Canned {
        async fn extract(&self, _text: &str) -> Result<CandidateFields, StageFailure> {
            Ok(self.0.clone())
        }
    }

    fn parse_request(path: &Path) -> WorkItem {
        WorkItem::new(Payload::ParseResume {
            candidate_id: "resumeA".to_string(),
            source_ref: path.to_string_lossy().into_owned(),
        })
    }

    #[test]
    fn test_contact_heuristics() {
        assert_eq!(find_email(RESUME).as_deref(), Some("jane.doe@example.com"));
        assert_eq!(find_phone(RESUME).as_deref(), Some("(555) 123-4567"));
        assert_eq!(find_phone("call +1 555-123-4567").as_deref(), Some("+1 555-123-4567"));
        assert_eq!(find_phone("call 555.123.4567 today").as_deref(), Some("555.123.4567"));
        assert_eq!(guess_name(RESUME).as_deref(), Some("Jane Doe"));
    }

    #[test]
    fn test_name_skips_contact_and_long_lines() {
        let text = "\n555-123-4567\nreach me at jane@example.com\nSenior Backend Engineer And Team Lead\nJane Doe";
        assert_eq!(guess_name(text).as_deref(), Some("Jane Doe"));
        assert_eq!(guess_name("a very long opening line of prose here"), None);
    }

    #[test]
    fn test_backfill_keeps_extracted_values() {
        let fields = CandidateFields {
            name: Some("J. Doe".to_string()),
            email: Some("  ".to_string()),
            ..CandidateFields::default()
        };
        let fields = backfill(fields, RESUME);
        assert_eq!(fields.name.as_deref(), Some("J. Doe"));
        assert_eq!(fields.email.as_deref(), Some("jane.doe@example.com"));
        assert_eq!(fields.phone.as_deref(), Some("(555) 123-4567"));
    }

    #[tokio::test]
    async fn test_text_resume_is_parsed_and_backfilled() {
        let mut file = tempfile::Builder::new().suffix(".txt").tempfile().unwrap();
        file.write_all(RESUME.as_bytes()).unwrap();
        let stage = ResumeParserStage::new(Arc::new(Canned(CandidateFields {
            skills: vec!["Python".to_string(), "SQL".to_string()],
            ..CandidateFields::default()
        })));

        let result = stage.handle(&parse_request(file.path())).await.unwrap();
        let StageResult::CandidateProfile(fields) = result else {
            panic!("expected a candidate profile");
        };
        assert_eq!(fields.name.as_deref(), Some("Jane Doe"));
        assert_eq!(fields.email.as_deref(), Some("jane.doe@example.com"));
        assert_eq!(fields.skills, vec!["Python", "SQL"]);
    }

    #[tokio::test]
    async fn test_missing_document_is_permanent() {
        let dir = tempfile::tempdir().unwrap();
        let stage = ResumeParserStage::new(Arc::new(Canned(CandidateFields::default())));

        let failure = stage
            .handle(&parse_request(&dir.path().join("gone.txt")))
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::Permanent);
    }

    #[tokio::test]
    async fn test_empty_document_is_permanent() {
        let file = tempfile::Builder::new().suffix(".md").tempfile().unwrap();
        let stage = ResumeParserStage::new(Arc::new(Canned(CandidateFields::default())));

        let failure = stage.handle(&parse_request(file.path())).await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::Permanent);
        assert!(failure.detail.contains("no extractable text"));
    }

    #[tokio::test]
    async fn test_unreadable_pdf_is_permanent() {
        let mut file = tempfile::Builder::new().suffix(".pdf").tempfile().unwrap();
        file.write_all(b"not really a pdf").unwrap();
        let stage = ResumeParserStage::new(Arc::new(Canned(CandidateFields::default())));

        let failure = stage.handle(&parse_request(file.path())).await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::Permanent);
    }
}
