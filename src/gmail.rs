//! Gmail mailbox reader.
//!
//! Fetches messages newer than the watermark via the Gmail REST API and
//! normalizes them into [`InboundMessage`] records. The `after:` search
//! operator only has seconds granularity, so the strict
//! `received_at > watermark` bound is enforced client-side.

use std::sync::OnceLock;
use std::time::Duration;

use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};

const GMAIL_API_BASE: &str = "https://gmail.googleapis.com";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

static EMAIL_ADDRESS_RE: OnceLock<Regex> = OnceLock::new();

fn email_address_re() -> &'static Regex {
    EMAIL_ADDRESS_RE
        .get_or_init(|| Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}").unwrap())
}

/// One fetched mailbox entry. Immutable once constructed; lives only for the
/// duration of one run.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub id: String,
    pub from: String,
    pub subject: String,
    pub body_plain: String,
    pub body_html: String,
    /// Unix milliseconds.
    pub received_at: i64,
    pub thread_id: String,
}

impl InboundMessage {
    /// Best body text for extraction: plain part when present, HTML otherwise.
    pub fn body(&self) -> &str {
        if self.body_plain.trim().is_empty() {
            &self.body_html
        } else {
            &self.body_plain
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("gmail api returned {status}: {body}")]
    Api { status: u16, body: String },
}

/// Seam between the orchestrator and the mailbox provider.
pub trait Mailbox {
    fn fetch_since(
        &self,
        watermark_ms: i64,
        whitelist: &[String],
        limit: usize,
    ) -> Result<Vec<InboundMessage>, MailboxError>;
}

/// Gmail REST client for a single mailbox.
#[derive(Debug, Clone)]
pub struct GmailMailbox {
    access_token: String,
    api_base: String,
    client: reqwest::blocking::Client,
}

impl GmailMailbox {
    pub fn new(access_token: String) -> Self {
        Self::with_api_base(access_token, GMAIL_API_BASE.to_string())
    }

    pub fn with_api_base(access_token: String, api_base: String) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::blocking::Client::new());
        Self {
            access_token,
            api_base,
            client,
        }
    }

    fn list_message_ids(&self, query: &str, limit: usize) -> Result<Vec<MessageRef>, MailboxError> {
        let url = format!("{}/gmail/v1/users/me/messages", self.api_base);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.access_token)
            .query(&[("q", query), ("maxResults", &limit.to_string())])
            .send()?;

        let status = response.status();
        let body = response.text()?;
        if !status.is_success() {
            return Err(MailboxError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let list: MessageList =
            serde_json::from_str(&body).map_err(|err| MailboxError::Api {
                status: status.as_u16(),
                body: format!("unexpected list payload: {}", err),
            })?;
        Ok(list.messages.unwrap_or_default())
    }

    fn get_message(&self, id: &str) -> Result<GmailMessage, MailboxError> {
        let url = format!("{}/gmail/v1/users/me/messages/{}", self.api_base, id);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.access_token)
            .query(&[("format", "full")])
            .send()?;

        let status = response.status();
        let body = response.text()?;
        if !status.is_success() {
            return Err(MailboxError::Api {
                status: status.as_u16(),
                body,
            });
        }

        serde_json::from_str(&body).map_err(|err| MailboxError::Api {
            status: status.as_u16(),
            body: format!("unexpected message payload: {}", err),
        })
    }
}

impl Mailbox for GmailMailbox {
    fn fetch_since(
        &self,
        watermark_ms: i64,
        whitelist: &[String],
        limit: usize,
    ) -> Result<Vec<InboundMessage>, MailboxError> {
        let query = build_query(watermark_ms, whitelist);
        debug!("gmail query: {}", query);

        let refs = self.list_message_ids(&query, limit)?;
        let mut raw = Vec::with_capacity(refs.len());
        for message_ref in &refs {
            raw.push(self.get_message(&message_ref.id)?);
        }

        let messages = normalize_messages(raw, watermark_ms, whitelist, limit);
        debug!(
            "gmail returned {} candidate(s), {} after filtering",
            refs.len(),
            messages.len()
        );
        Ok(messages)
    }
}

/// Search query for messages newer than the watermark from whitelisted
/// senders. `after:` takes whole seconds, rounded down so a boundary message
/// is fetched and dropped by the strict filter rather than skipped.
pub(crate) fn build_query(watermark_ms: i64, whitelist: &[String]) -> String {
    let senders = whitelist.join(" OR ");
    let after_secs = watermark_ms / 1000;
    format!("from:({}) after:{} in:inbox", senders, after_secs)
}

/// Bare lower-cased address from a raw `From` header value.
pub(crate) fn sender_address(raw: &str) -> Option<String> {
    email_address_re()
        .find(raw)
        .map(|m| m.as_str().to_ascii_lowercase())
}

/// Filter, order, and cap raw API messages into run-ready records.
pub(crate) fn normalize_messages(
    raw: Vec<GmailMessage>,
    watermark_ms: i64,
    whitelist: &[String],
    limit: usize,
) -> Vec<InboundMessage> {
    let mut messages: Vec<InboundMessage> = raw
        .into_iter()
        .filter_map(|message| {
            let id = message.id.clone();
            match message.into_inbound() {
                Some(inbound) => Some(inbound),
                None => {
                    warn!("skipping gmail message {}: no usable metadata", id);
                    None
                }
            }
        })
        .filter(|message| message.received_at > watermark_ms)
        .filter(|message| match sender_address(&message.from) {
            Some(address) => whitelist.contains(&address),
            None => false,
        })
        .collect();

    messages.sort_by_key(|message| message.received_at);
    messages.truncate(limit);
    messages
}

// ============================================================================
// Gmail wire types
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct MessageList {
    pub messages: Option<Vec<MessageRef>>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct MessageRef {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GmailMessage {
    pub id: String,
    pub thread_id: Option<String>,
    /// Unix milliseconds, encoded as a decimal string by the API.
    pub internal_date: Option<String>,
    pub payload: Option<MessagePart>,
}

impl GmailMessage {
    fn into_inbound(self) -> Option<InboundMessage> {
        let received_at = self
            .internal_date
            .as_deref()
            .and_then(|value| value.parse::<i64>().ok())?;
        let payload = self.payload?;

        let from = payload.header_value("From").unwrap_or_default().to_string();
        let subject = payload
            .header_value("Subject")
            .unwrap_or("(no subject)")
            .to_string();

        let mut body_plain = None;
        let mut body_html = None;
        collect_bodies(&payload, &mut body_plain, &mut body_html);

        Some(InboundMessage {
            id: self.id,
            from,
            subject,
            body_plain: body_plain.unwrap_or_default(),
            body_html: body_html.unwrap_or_default(),
            received_at,
            thread_id: self.thread_id.unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MessagePart {
    pub mime_type: Option<String>,
    pub headers: Option<Vec<Header>>,
    pub body: Option<PartBody>,
    pub parts: Option<Vec<MessagePart>>,
}

impl MessagePart {
    fn header_value(&self, name: &str) -> Option<&str> {
        self.headers.as_ref().and_then(|headers| {
            headers
                .iter()
                .find(|header| header.name.eq_ignore_ascii_case(name))
                .map(|header| header.value.as_str())
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Header {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct PartBody {
    pub data: Option<String>,
}

/// Walk the MIME tree taking the first `text/plain` and `text/html` bodies.
fn collect_bodies(
    part: &MessagePart,
    plain: &mut Option<String>,
    html: &mut Option<String>,
) {
    let mime = part.mime_type.as_deref().unwrap_or("");
    if let Some(data) = part.body.as_ref().and_then(|body| body.data.as_deref()) {
        if mime.eq_ignore_ascii_case("text/plain") && plain.is_none() {
            *plain = decode_body(data);
        } else if mime.eq_ignore_ascii_case("text/html") && html.is_none() {
            *html = decode_body(data);
        }
    }
    if let Some(children) = part.parts.as_ref() {
        for child in children {
            if plain.is_some() && html.is_some() {
                return;
            }
            collect_bodies(child, plain, html);
        }
    }
}

/// Gmail body data is base64url, sometimes without padding.
fn decode_body(data: &str) -> Option<String> {
    let bytes = URL_SAFE
        .decode(data)
        .or_else(|_| URL_SAFE_NO_PAD.decode(data))
        .ok()?;
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn whitelist() -> Vec<String> {
        vec!["a@x.com".to_string(), "b@y.org".to_string()]
    }

    fn encoded(text: &str) -> String {
        URL_SAFE.encode(text.as_bytes())
    }

    fn message_json(id: &str, from: &str, internal_date: i64, body: &str) -> GmailMessage {
        let value = serde_json::json!({
            "id": id,
            "threadId": format!("t-{}", id),
            "internalDate": internal_date.to_string(),
            "payload": {
                "mimeType": "multipart/alternative",
                "headers": [
                    {"name": "From", "value": from},
                    {"name": "Subject", "value": "Weekly sync"}
                ],
                "parts": [
                    {
                        "mimeType": "text/plain",
                        "body": {"data": encoded(body)}
                    },
                    {
                        "mimeType": "text/html",
                        "body": {"data": encoded("<p>html</p>")}
                    }
                ]
            }
        });
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn query_includes_senders_and_floored_seconds() {
        let query = build_query(1_699_999_999_123, &whitelist());
        assert_eq!(query, "from:(a@x.com OR b@y.org) after:1699999999 in:inbox");
    }

    #[test]
    fn sender_address_handles_display_names() {
        assert_eq!(
            sender_address("Alice Example <A@X.com>").as_deref(),
            Some("a@x.com")
        );
        assert_eq!(sender_address("b@y.org").as_deref(), Some("b@y.org"));
        assert_eq!(sender_address("no address here"), None);
    }

    #[test]
    fn normalize_filters_watermark_and_whitelist() {
        let raw = vec![
            message_json("m2", "Alice <a@x.com>", 3000, "later"),
            message_json("m3", "b@z.net", 2500, "stranger"),
            message_json("m1", "a@x.com", 2000, "earlier"),
            message_json("m0", "a@x.com", 1000, "at watermark"),
        ];

        let messages = normalize_messages(raw, 1000, &whitelist(), 100);
        let ids: Vec<&str> = messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2"]);
        assert_eq!(messages[0].body_plain, "earlier");
        assert_eq!(messages[0].body_html, "<p>html</p>");
        assert_eq!(messages[0].subject, "Weekly sync");
    }

    #[test]
    fn normalize_caps_at_limit() {
        let raw = vec![
            message_json("m1", "a@x.com", 2000, "one"),
            message_json("m2", "a@x.com", 3000, "two"),
            message_json("m3", "a@x.com", 4000, "three"),
        ];

        let messages = normalize_messages(raw, 0, &whitelist(), 2);
        let ids: Vec<&str> = messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2"]);
    }

    #[test]
    fn body_prefers_plain_over_html() {
        let raw = message_json("m1", "a@x.com", 2000, "plain text");
        let inbound = normalize_messages(vec![raw], 0, &whitelist(), 10)
            .into_iter()
            .next()
            .unwrap();
        assert_eq!(inbound.body(), "plain text");

        let mut html_only = inbound.clone();
        html_only.body_plain = String::new();
        assert_eq!(html_only.body(), "<p>html</p>");
    }

    #[test]
    fn decode_body_accepts_unpadded_base64url() {
        let padded = URL_SAFE.encode("todo: ship it");
        let unpadded = padded.trim_end_matches('=').to_string();
        assert_eq!(decode_body(&padded).as_deref(), Some("todo: ship it"));
        assert_eq!(decode_body(&unpadded).as_deref(), Some("todo: ship it"));
    }
}
