// Cross-cutting prompt fragments. Stage-specific prompts live in stages/prompts.rs.

/// System prompt fragment that enforces JSON-only output.
pub const JSON_ONLY_SYSTEM: &str = "You are a precise, structured assistant. \
    You MUST respond with valid JSON only. \
    Do NOT include any text outside the JSON object. \
    Do NOT use markdown code fences. \
    Do NOT include explanations or apologies.";

/// Appended to every extraction prompt so the model does not pad sparse input.
pub const NO_INVENTION_INSTRUCTION: &str = "\
    Only report what the text states. If a field is not present, use null for scalars \
    and an empty array for lists. Never guess names, emails, or phone numbers.";
