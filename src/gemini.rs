//! Actionable-item extraction via the Gemini generateContent API.
//!
//! The extractor never fails: any transport, API, or parse problem is logged
//! and yields an empty item list, so one uncooperative message cannot stall
//! the run.

use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com";
const GEMINI_MODEL: &str = "gemini-1.5-flash";
const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

const EXTRACTION_INSTRUCTIONS: &str = "You are an assistant that extracts actionable to-do items from an email.\n\
Return ONLY a JSON array, with no surrounding text. Each element must be an object with\n\
a \"description\" field (short imperative sentence) and an optional \"priority\" field\n\
whose value is \"high\", \"medium\" or \"low\". Return [] if the email contains no\n\
actionable items. Do not wrap the answer in Markdown.";

static CODE_FENCE_RE: OnceLock<Regex> = OnceLock::new();

fn code_fence_re() -> &'static Regex {
    CODE_FENCE_RE
        .get_or_init(|| Regex::new(r"(?s)^```[a-zA-Z]*\s*\n?(.*?)\n?```$").unwrap())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "high" => Some(Priority::High),
            "medium" => Some(Priority::Medium),
            "low" => Some(Priority::Low),
            _ => None,
        }
    }
}

/// One actionable item derived from a message. Never constructed with an
/// empty description.
#[derive(Debug, Clone)]
pub struct ExtractedItem {
    pub description: String,
    pub priority: Option<Priority>,
    pub source_message_id: String,
    pub source_sender: String,
    pub source_subject: String,
    pub extracted_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
enum ExtractError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("gemini api returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("malformed model output: {0}")]
    Malformed(String),
}

/// Gemini-backed extractor.
#[derive(Debug, Clone)]
pub struct GeminiExtractor {
    api_key: String,
    api_base: String,
    model: String,
    client: reqwest::blocking::Client,
}

impl GeminiExtractor {
    pub fn new(api_key: String) -> Self {
        Self::with_api_base(api_key, GEMINI_API_BASE.to_string())
    }

    pub fn with_api_base(api_key: String, api_base: String) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::blocking::Client::new());
        Self {
            api_key,
            api_base,
            model: GEMINI_MODEL.to_string(),
            client,
        }
    }

    /// Extract actionable items from a message body. On any upstream failure
    /// this logs and returns an empty list; the caller cannot distinguish
    /// "no todos" from "extraction failed", by contract.
    pub fn extract(
        &self,
        body: &str,
        message_id: &str,
        sender: &str,
        subject: &str,
    ) -> Vec<ExtractedItem> {
        let raw_items = match self.request_items(body) {
            Ok(items) => items,
            Err(err) => {
                warn!("extraction failed for message {}: {}", message_id, err);
                return Vec::new();
            }
        };

        let extracted_at = Utc::now();
        let items: Vec<ExtractedItem> = raw_items
            .into_iter()
            .filter_map(|raw| {
                let description = raw.description.trim().to_string();
                if description.is_empty() {
                    warn!(
                        "dropping extracted item without description (message {})",
                        message_id
                    );
                    return None;
                }
                Some(ExtractedItem {
                    description,
                    priority: raw.priority.as_deref().and_then(Priority::parse),
                    source_message_id: message_id.to_string(),
                    source_sender: sender.to_string(),
                    source_subject: subject.to_string(),
                    extracted_at,
                })
            })
            .collect();
        debug!("extracted {} item(s) from message {}", items.len(), message_id);
        items
    }

    fn request_items(&self, body: &str) -> Result<Vec<RawItem>, ExtractError> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.api_base, self.model
        );
        let prompt = format!("{}\n\nEmail body:\n{}", EXTRACTION_INSTRUCTIONS, body);
        let request = GenerateContentRequest {
            contents: vec![Content {
                parts: vec![Part { text: prompt }],
            }],
            generation_config: GenerationConfig {
                temperature: 0.2,
                max_output_tokens: 1024,
            },
        };

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&request)
            .send()?;

        let status = response.status();
        let body = response.text()?;
        if !status.is_success() {
            return Err(ExtractError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let payload: GenerateContentResponse = serde_json::from_str(&body)
            .map_err(|err| ExtractError::Malformed(format!("unexpected response shape: {}", err)))?;
        let text = payload
            .candidates
            .and_then(|candidates| candidates.into_iter().next())
            .and_then(|candidate| candidate.content)
            .and_then(|content| content.parts)
            .and_then(|parts| parts.into_iter().next())
            .and_then(|part| part.text)
            .ok_or_else(|| ExtractError::Malformed("no candidate text".to_string()))?;

        parse_items(&text)
    }
}

/// Parse the model's answer into raw items, validating the shape explicitly.
/// Anything that is not a JSON array is malformed.
fn parse_items(text: &str) -> Result<Vec<RawItem>, ExtractError> {
    let cleaned = strip_code_fence(text);
    if cleaned.is_empty() {
        return Err(ExtractError::Malformed("empty response text".to_string()));
    }
    let value: serde_json::Value = serde_json::from_str(cleaned)
        .map_err(|err| ExtractError::Malformed(format!("not valid JSON: {}", err)))?;
    if !value.is_array() {
        return Err(ExtractError::Malformed(format!(
            "expected a JSON array, got {}",
            json_type_name(&value)
        )));
    }
    serde_json::from_value(value)
        .map_err(|err| ExtractError::Malformed(format!("unexpected array element: {}", err)))
}

/// Strip a Markdown code fence wrapper (```json ... ```), if present.
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    match code_fence_re().captures(trimmed) {
        Some(captures) => captures.get(1).map(|m| m.as_str().trim()).unwrap_or(""),
        None => trimmed,
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

// ============================================================================
// Gemini wire types
// ============================================================================

#[derive(Debug, Clone, Serialize)]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Debug, Clone, Serialize)]
struct GenerationConfig {
    temperature: f32,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
}

#[derive(Debug, Clone, Serialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Debug, Clone, Serialize)]
struct Part {
    text: String,
}

#[derive(Debug, Clone, Deserialize)]
struct GenerateContentResponse {
    candidates: Option<Vec<ResponseCandidate>>,
}

#[derive(Debug, Clone, Deserialize)]
struct ResponseCandidate {
    content: Option<ResponseContent>,
}

#[derive(Debug, Clone, Deserialize)]
struct ResponseContent {
    parts: Option<Vec<ResponsePart>>,
}

#[derive(Debug, Clone, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawItem {
    #[serde(default)]
    description: String,
    #[serde(default)]
    priority: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_code_fence_unwraps_json_fence() {
        let fenced = "```json\n[{\"description\": \"a\"}]\n```";
        assert_eq!(strip_code_fence(fenced), "[{\"description\": \"a\"}]");
    }

    #[test]
    fn strip_code_fence_unwraps_bare_fence() {
        let fenced = "```\n[]\n```";
        assert_eq!(strip_code_fence(fenced), "[]");
    }

    #[test]
    fn strip_code_fence_leaves_plain_text_alone() {
        assert_eq!(strip_code_fence("  [1, 2]  "), "[1, 2]");
    }

    #[test]
    fn parse_items_accepts_valid_array() {
        let items = parse_items(
            r#"[{"description": "Send the report", "priority": "HIGH"},
                {"description": "Book a room"}]"#,
        )
        .unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].description, "Send the report");
        assert_eq!(items[0].priority.as_deref(), Some("HIGH"));
        assert_eq!(items[1].priority, None);
    }

    #[test]
    fn parse_items_rejects_object_payload() {
        let err = parse_items(r#"{"description": "not a list"}"#).unwrap_err();
        assert!(matches!(err, ExtractError::Malformed(_)));
    }

    #[test]
    fn parse_items_rejects_non_json() {
        assert!(parse_items("Sure! Here are your todos:").is_err());
        assert!(parse_items("").is_err());
    }

    #[test]
    fn priority_parse_is_case_insensitive_and_strict() {
        assert_eq!(Priority::parse("High"), Some(Priority::High));
        assert_eq!(Priority::parse(" medium "), Some(Priority::Medium));
        assert_eq!(Priority::parse("LOW"), Some(Priority::Low));
        assert_eq!(Priority::parse("urgent"), None);
        assert_eq!(Priority::parse(""), None);
    }
}
