// Prompt fragments shared by every step that generates text.
// Step-specific prompts live in steps/prompts.rs.

/// System prompt fragment that enforces JSON-only output.
pub const JSON_ONLY_SYSTEM: &str = "You are a precise, structured assistant. \
    You MUST respond with valid JSON only. \
    Do NOT include any text outside the JSON object. \
    Do NOT use markdown code fences. \
    Do NOT include explanations or apologies.";

/// Appended to every rewriting prompt.
pub const GROUNDING_INSTRUCTION: &str = "\
    CRITICAL: Every claim you generate must be traceable to a specific source entry ID \
    provided in the context. Do NOT infer, interpolate, or invent details. \
    If the context does not support a claim, omit it entirely. \
    Tag every output bullet with its source `entry_id`.";

/// Keeps rewritten bullets from inflating the candidate's role.
pub const SCOPE_INSTRUCTION: &str = "\
    CRITICAL: Map contribution_type to language precisely: \
    - sole_author / primary_contributor: may use 'Architected', 'Designed', 'Built', 'Led' \
    - team_member: must use 'Contributed to', 'Collaborated on', 'Implemented (as part of team)' \
    - reviewer: must use 'Reviewed', 'Evaluated', 'Assessed' \
    NEVER upgrade a team_member to solo language.";

/// Joins a step's system prompt with the JSON-only fragment.
pub fn json_system(role: &str) -> String {
    format!("{role} {JSON_ONLY_SYSTEM}")
}
