//! LINE Messaging API push client with bounded retry.
//!
//! Every failure class is retried on the same exponential backoff schedule,
//! including auth failures. Retrying a bad credential cannot succeed and only
//! burns the backoff window, but the uniform policy is kept for compatibility
//! with the behavior operators already rely on; the classification still
//! names the real cause in the outcome.

use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

const LINE_API_BASE: &str = "https://api.line.me";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Retries after the first attempt, so up to 4 tries total.
pub const MAX_RETRIES: u32 = 3;
const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryErrorKind {
    None,
    Auth,
    RateLimit,
    Server,
    Malformed,
    Network,
}

/// Result of one push attempt sequence. Never causes the caller to abort.
#[derive(Debug, Clone)]
pub struct DeliveryOutcome {
    pub succeeded: bool,
    pub http_status: Option<u16>,
    pub error_kind: DeliveryErrorKind,
    pub error_message: Option<String>,
    pub attempts: u32,
}

/// Client for pushing text messages to a LINE group.
#[derive(Debug, Clone)]
pub struct LineClient {
    access_token: String,
    api_base: String,
    backoff_base: Duration,
    client: reqwest::blocking::Client,
}

impl LineClient {
    pub fn new(access_token: String) -> Self {
        Self::with_api_base(access_token, LINE_API_BASE.to_string())
    }

    pub fn with_api_base(access_token: String, api_base: String) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::blocking::Client::new());
        Self {
            access_token,
            api_base,
            backoff_base: DEFAULT_BACKOFF_BASE,
            client,
        }
    }

    /// Override the backoff unit. Tests shrink this to keep the retry
    /// schedule observable without multi-second sleeps.
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    /// Push one text message, retrying with exponential backoff. Returns the
    /// last outcome after exhaustion instead of an error.
    pub fn push(&self, to: &str, text: &str) -> DeliveryOutcome {
        let mut outcome = DeliveryOutcome {
            succeeded: false,
            http_status: None,
            error_kind: DeliveryErrorKind::None,
            error_message: None,
            attempts: 0,
        };

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                thread::sleep(backoff_delay(self.backoff_base, attempt - 1));
            }

            match self.push_once(to, text) {
                Ok((status, body)) => {
                    if (200..300).contains(&status) {
                        info!("LINE push delivered to {} (attempt {})", to, attempt + 1);
                        return DeliveryOutcome {
                            succeeded: true,
                            http_status: Some(status),
                            error_kind: DeliveryErrorKind::None,
                            error_message: None,
                            attempts: attempt + 1,
                        };
                    }
                    let message = parse_error_body(&body);
                    warn!(
                        "LINE push attempt {} failed with {}: {}",
                        attempt + 1,
                        status,
                        message
                    );
                    outcome = DeliveryOutcome {
                        succeeded: false,
                        http_status: Some(status),
                        error_kind: classify_status(status),
                        error_message: Some(message),
                        attempts: attempt + 1,
                    };
                }
                Err(err) => {
                    warn!("LINE push attempt {} failed: {}", attempt + 1, err);
                    outcome = DeliveryOutcome {
                        succeeded: false,
                        http_status: None,
                        error_kind: DeliveryErrorKind::Network,
                        error_message: Some(err.to_string()),
                        attempts: attempt + 1,
                    };
                }
            }
        }

        outcome
    }

    fn push_once(&self, to: &str, text: &str) -> Result<(u16, String), reqwest::Error> {
        let url = format!("{}/v2/bot/message/push", self.api_base);
        let request = PushRequest {
            to: to.to_string(),
            messages: vec![TextMessage {
                message_type: "text".to_string(),
                text: text.to_string(),
            }],
        };
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.access_token)
            .json(&request)
            .send()?;
        let status = response.status().as_u16();
        let body = response.text()?;
        Ok((status, body))
    }
}

/// Delay before retry `retry_index` (0-indexed): `2^retry_index` units.
pub(crate) fn backoff_delay(base: Duration, retry_index: u32) -> Duration {
    base * 2u32.pow(retry_index)
}

fn classify_status(status: u16) -> DeliveryErrorKind {
    match status {
        401 | 403 => DeliveryErrorKind::Auth,
        429 => DeliveryErrorKind::RateLimit,
        status if status >= 500 => DeliveryErrorKind::Server,
        status if status >= 400 => DeliveryErrorKind::Malformed,
        _ => DeliveryErrorKind::Server,
    }
}

/// LINE error bodies are JSON with `message` and optional `details`; fall
/// back to the raw body when they are not.
fn parse_error_body(body: &str) -> String {
    match serde_json::from_str::<LineErrorBody>(body) {
        Ok(parsed) => {
            let details: Vec<String> = parsed
                .details
                .unwrap_or_default()
                .into_iter()
                .filter_map(|detail| detail.message)
                .collect();
            if details.is_empty() {
                parsed.message
            } else {
                format!("{} ({})", parsed.message, details.join("; "))
            }
        }
        Err(_) => body.trim().to_string(),
    }
}

// ============================================================================
// LINE wire types
// ============================================================================

#[derive(Debug, Clone, Serialize)]
struct PushRequest {
    to: String,
    messages: Vec<TextMessage>,
}

#[derive(Debug, Clone, Serialize)]
struct TextMessage {
    #[serde(rename = "type")]
    message_type: String,
    text: String,
}

#[derive(Debug, Clone, Deserialize)]
struct LineErrorBody {
    message: String,
    details: Option<Vec<LineErrorDetail>>,
}

#[derive(Debug, Clone, Deserialize)]
struct LineErrorDetail {
    message: Option<String>,
    #[allow(dead_code)]
    property: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_covers_the_taxonomy() {
        assert_eq!(classify_status(401), DeliveryErrorKind::Auth);
        assert_eq!(classify_status(403), DeliveryErrorKind::Auth);
        assert_eq!(classify_status(429), DeliveryErrorKind::RateLimit);
        assert_eq!(classify_status(500), DeliveryErrorKind::Server);
        assert_eq!(classify_status(503), DeliveryErrorKind::Server);
        assert_eq!(classify_status(400), DeliveryErrorKind::Malformed);
        assert_eq!(classify_status(404), DeliveryErrorKind::Malformed);
    }

    #[test]
    fn backoff_doubles_per_retry() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_delay(base, 0), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 2), Duration::from_secs(4));
    }

    #[test]
    fn error_body_parsed_with_details() {
        let body = r#"{"message":"The request body has 1 error(s)","details":[{"message":"May not be empty","property":"messages[0].text"}]}"#;
        assert_eq!(
            parse_error_body(body),
            "The request body has 1 error(s) (May not be empty)"
        );
    }

    #[test]
    fn error_body_without_details_uses_message() {
        assert_eq!(
            parse_error_body(r#"{"message":"Invalid reply token"}"#),
            "Invalid reply token"
        );
    }

    #[test]
    fn unparseable_error_body_falls_back_to_raw_text() {
        assert_eq!(parse_error_body("  <html>nope</html>\n"), "<html>nope</html>");
    }
}
