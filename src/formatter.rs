//! Rendering of extracted items and run summaries into LINE-sized text.

use crate::gemini::{ExtractedItem, Priority};
use crate::runner::RunSummary;

/// Hard ceiling of a LINE text message, in characters.
pub const MAX_MESSAGE_LEN: usize = 5000;
pub const TRUNCATION_SUFFIX: &str = "\n…(truncated)";

/// A rendered text block. `truncated` marks a data-loss event the caller is
/// expected to log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub text: String,
    pub truncated: bool,
}

/// Render one message's extracted items. Pure and deterministic.
pub fn format_message(items: &[ExtractedItem], sender: &str, subject: &str) -> RenderedMessage {
    let mut text = String::new();
    text.push_str(&format!("📋 To-dos from {}\n", sender));
    text.push_str(&format!("Subject: {}\n\n", subject));

    for (index, item) in items.iter().enumerate() {
        match priority_marker(item.priority) {
            Some(marker) => {
                text.push_str(&format!("{}. {} {}\n", index + 1, marker, item.description))
            }
            None => text.push_str(&format!("{}. {}\n", index + 1, item.description)),
        }
    }

    text.push_str(&format!("\n{} item(s) extracted", items.len()));
    clamp(text)
}

/// Render the end-of-run notification.
pub fn format_run_summary(summary: &RunSummary) -> RenderedMessage {
    let mut text = String::new();
    text.push_str("📊 Run summary\n");
    text.push_str(&format!("Emails fetched: {}\n", summary.emails_fetched));
    text.push_str(&format!("Emails processed: {}\n", summary.emails_processed));
    text.push_str(&format!("Items extracted: {}\n", summary.items_extracted));
    text.push_str(&format!("Notifications sent: {}\n", summary.deliveries_sent));
    text.push_str(&format!("Elapsed: {}s\n", summary.elapsed.as_secs()));
    if summary.deadline_hit {
        text.push_str("⚠ Time budget reached before all messages were processed\n");
    }
    if !summary.errors.is_empty() {
        text.push_str("Errors:\n");
        for error in &summary.errors {
            text.push_str(&format!("- {}\n", error));
        }
    }
    text.push_str(if summary.success {
        "✅ Completed"
    } else {
        "❌ Completed with errors"
    });
    clamp(text)
}

fn priority_marker(priority: Option<Priority>) -> Option<&'static str> {
    match priority? {
        Priority::High => Some("🔴"),
        Priority::Medium => Some("🟡"),
        Priority::Low => Some("🟢"),
    }
}

/// Enforce the hard output length: over-long text is cut at a char boundary
/// and the fixed suffix appended.
fn clamp(text: String) -> RenderedMessage {
    let char_count = text.chars().count();
    if char_count <= MAX_MESSAGE_LEN {
        return RenderedMessage {
            text,
            truncated: false,
        };
    }

    let suffix_len = TRUNCATION_SUFFIX.chars().count();
    let keep = MAX_MESSAGE_LEN - suffix_len;
    let mut truncated: String = text.chars().take(keep).collect();
    truncated.push_str(TRUNCATION_SUFFIX);
    RenderedMessage {
        text: truncated,
        truncated: true,
    }
}
