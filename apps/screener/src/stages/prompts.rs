// Prompt constants for the LLM-backed stages.
// Cross-cutting fragments live in llm_client::prompts.

/// System prompt for job description summarization.
pub const SUMMARIZE_SYSTEM: &str = "You are a hiring specialist who summarizes job descriptions \
    for a candidate screening team.";

/// Summarization prompt. Replace `{title}`, `{jd_text}` and `{no_invention}` before sending.
pub const SUMMARIZE_PROMPT_TEMPLATE: &str = r#"Summarize the following job description.

Return a JSON object with this EXACT schema (no extra fields):
{
  "summary": "Two or three sentences describing the role.",
  "responsibilities": ["Design backend services"],
  "skills": ["Python", "SQL"],
  "qualifications": ["BSc in Computer Science", "3+ years experience"]
}

Rules:
- "skills" lists technical skills, tools and languages, one per entry, without qualifiers.
- "responsibilities" lists the main tasks and duties.
- "qualifications" lists education, certifications and experience level.
{no_invention}

JOB TITLE: {title}

JOB DESCRIPTION:
{jd_text}"#;

/// System prompt for resume field extraction.
pub const RESUME_SYSTEM: &str = "You are a resume parser. You extract contact details, skills, \
    experience and education exactly as written.";

/// Resume extraction prompt. Replace `{resume_text}` and `{no_invention}` before sending.
pub const RESUME_PROMPT_TEMPLATE: &str = r#"Extract the candidate's details from the resume below.

Return a JSON object with this EXACT schema (no extra fields):
{
  "name": "Jane Doe",
  "email": "jane@example.com",
  "phone": "555-123-4567",
  "skills": ["Python", "PostgreSQL"],
  "experience": [
    {"role": "Backend Engineer", "company": "Acme", "description": "Built billing APIs"}
  ],
  "education": [
    {"degree": "BSc Computer Science", "institution": "State University"}
  ]
}

{no_invention}

RESUME:
{resume_text}"#;
