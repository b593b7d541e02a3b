// Prompt constants for the step executors that call the text generator.
// Templates use `{placeholder}` markers replaced with `str::replace`.

/// Role line for job parsing.
pub const PARSE_JOB_ROLE: &str =
    "You are an expert job description analyst and resume strategist. \
    Parse a job description and extract structured information.";

/// Replace `{job_text}` before sending.
pub const PARSE_JOB_PROMPT_TEMPLATE: &str = r#"Parse the following job posting and extract structured information.

Return a JSON object with this EXACT schema (no extra fields):
{
  "company_name": "Acme Corp",
  "role_title": "Senior Rust Engineer",
  "hard_requirements": [
    {"text": "5+ years Rust programming", "is_required": true}
  ],
  "soft_signals": [
    "Kubernetes experience a plus"
  ],
  "role_signals": {
    "is_startup": false,
    "is_ic_focused": true,
    "is_research": false,
    "seniority": "senior"
  },
  "keyword_inventory": [
    {
      "keyword": "Rust",
      "frequency": 5,
      "position_weight": 0.8,
      "weighted_score": 4.0
    }
  ],
  "detected_tone": "CollaborativeEnterprise"
}

Rules for parsing:

COMPANY / ROLE: use null when the posting does not name them.

POSITION WEIGHTS for keyword scoring:
- Title / header: 1.0
- Requirements section: 0.8
- Responsibilities section: 0.6
- About Us / company section: 0.3
weighted_score = frequency * position_weight

TONE OPTIONS (pick exactly one):
- "AggressiveStartup": "own", "drive", "move fast", "spearhead", "disrupt"
- "CollaborativeEnterprise": "partner", "collaborate", "contribute", "support teams"
- "ResearchOriented": "investigate", "publish", "evaluate", "propose"
- "ProductOriented": "ship", "launch", "deliver", "improve user experience"

SENIORITY: "junior", "mid", "senior", "staff", "principal", "director", or "unknown".

Extract ALL meaningful technical keywords (languages, frameworks, tools, concepts) and score them.

JOB POSTING:
{job_text}"#;

pub const RESEARCH_ROLE: &str =
    "You are a company research analyst preparing a candidate for a tailored application.";

/// Replace `{company_name}`, `{role_title}`, `{requirements}`.
pub const RESEARCH_PROMPT_TEMPLATE: &str = r#"Summarise what a candidate should know about this organisation before applying.

Company: {company_name}
Role: {role_title}
Key requirements from the posting:
{requirements}

Return a JSON object:
{
  "company_name": "Acme Corp",
  "summary": "Two or three sentences on what the company does and where it is heading",
  "products": ["Main product or service"],
  "culture_signals": ["Short phrase describing how the team works"],
  "talking_points": ["Angle the resume summary could connect to"]
}

Only state facts you are confident about. Use empty arrays rather than guessing."#;

pub const SUMMARY_ROLE: &str = "You are an expert resume writer producing a factual, \
    grounded professional summary from verified experience entries.";

/// Replace `{grounding_instruction}`, `{role_title}`, `{company_name}`,
/// `{tone}`, `{research}`, `{entries_json}`, `{keywords_json}`.
pub const SUMMARY_PROMPT_TEMPLATE: &str = r#"{grounding_instruction}

Write a resume summary for the role "{role_title}" at {company_name}.
Detected posting tone: {tone}

COMPANY CONTEXT (may be empty):
{research}

SELECTED EXPERIENCE ENTRIES (source of truth, ONLY use facts from these):
{entries_json}

KEYWORDS to incorporate naturally:
{keywords_json}

Return a JSON object:
{
  "summary": "Two to three sentence summary",
  "source_entry_ids": ["entry_id values the summary draws on"]
}"#;

pub const BULLETS_ROLE: &str = "You are an expert resume writer generating factual, \
    grounded resume bullets from verified professional context.";

/// Replace `{grounding_instruction}`, `{scope_instruction}`, `{tone}`,
/// `{research}`, `{entries_json}`, `{keywords_json}`.
pub const BULLETS_PROMPT_TEMPLATE: &str = r#"{grounding_instruction}

{scope_instruction}

Detected posting tone: {tone}

COMPANY CONTEXT (may be empty):
{research}

SELECTED EXPERIENCE ENTRIES (source of truth, ONLY use facts from these):
{entries_json}

KEYWORDS to incorporate naturally (do NOT keyword-stuff):
{keywords_json}

Return a JSON object:
{
  "bullets": [
    {
      "text": "Architected distributed caching layer reducing p99 latency by 40% across 3 services",
      "source_entry_id": "the-exact-entry_id-uuid-from-context",
      "jd_keywords_used": ["distributed", "latency", "caching"]
    }
  ]
}

HARD RULES:
1. EVERY bullet MUST have `source_entry_id` matching one of the entry_id values above
2. Use ONLY facts from the entries
3. One strong bullet per entry, two if the entry is rich enough
4. Skip entries with no relevant content for this role"#;
