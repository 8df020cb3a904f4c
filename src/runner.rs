//! Run orchestration: config → fetch → extract/format/push per message →
//! watermark advancement → summary dispatch, all under a wall-clock budget.

use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::config::{AppConfig, ConfigError, PropertyStore, KEY_LINE_ACCESS_TOKEN, KEY_LINE_GROUP_ID};
use crate::formatter::{format_message, format_run_summary};
use crate::gemini::GeminiExtractor;
use crate::gmail::{GmailMailbox, Mailbox, MailboxError};
use crate::line::{DeliveryOutcome, LineClient};

/// Stay well under the host's six-minute execution ceiling; new per-message
/// work stops once this budget is spent. Checked between messages, never
/// mid-message.
const DEFAULT_RUN_BUDGET: Duration = Duration::from_secs(330);

/// Aggregate counters for one run. Dispatched once as a final message, then
/// discarded.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub emails_fetched: usize,
    pub emails_processed: usize,
    pub items_extracted: usize,
    pub deliveries_sent: usize,
    pub errors: Vec<String>,
    pub elapsed: Duration,
    pub deadline_hit: bool,
    pub success: bool,
}

impl RunSummary {
    fn new() -> Self {
        Self {
            emails_fetched: 0,
            emails_processed: 0,
            items_extracted: 0,
            deliveries_sent: 0,
            errors: Vec::new(),
            elapsed: Duration::ZERO,
            deadline_hit: false,
            success: false,
        }
    }

    fn finalize(&mut self, started: Instant) {
        self.elapsed = started.elapsed();
        self.success = self.errors.is_empty() && !self.deadline_hit;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("mailbox fetch failed: {0}")]
    Mailbox(#[from] MailboxError),
}

/// Drives one end-to-end run. The real clients are built from the loaded
/// config; API base overrides exist so tests can point every collaborator at
/// a local server.
pub struct Runner {
    store: PropertyStore,
    budget: Duration,
    backoff_base: Option<Duration>,
    gmail_api_base: Option<String>,
    gemini_api_base: Option<String>,
    line_api_base: Option<String>,
}

impl Runner {
    pub fn new(store: PropertyStore) -> Self {
        Self {
            store,
            budget: DEFAULT_RUN_BUDGET,
            backoff_base: None,
            gmail_api_base: None,
            gemini_api_base: None,
            line_api_base: None,
        }
    }

    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = Some(base);
        self
    }

    pub fn with_gmail_api_base(mut self, base: String) -> Self {
        self.gmail_api_base = Some(base);
        self
    }

    pub fn with_gemini_api_base(mut self, base: String) -> Self {
        self.gemini_api_base = Some(base);
        self
    }

    pub fn with_line_api_base(mut self, base: String) -> Self {
        self.line_api_base = Some(base);
        self
    }

    /// Execute one run. Per-message failures are absorbed into the summary;
    /// only configuration and mailbox failures abort, each after a
    /// best-effort failure notice when LINE credentials are readable.
    pub fn run(&self) -> Result<RunSummary, RunError> {
        let started = Instant::now();

        let config = match AppConfig::load(&self.store) {
            Ok(config) => config,
            Err(err) => {
                error!("configuration load failed: {}", err);
                self.try_failure_notice(&format!("Run aborted: {}", err));
                return Err(err.into());
            }
        };

        let mailbox = match &self.gmail_api_base {
            Some(base) => GmailMailbox::with_api_base(config.gmail_access_token.clone(), base.clone()),
            None => GmailMailbox::new(config.gmail_access_token.clone()),
        };
        let extractor = match &self.gemini_api_base {
            Some(base) => GeminiExtractor::with_api_base(config.gemini_api_key.clone(), base.clone()),
            None => GeminiExtractor::new(config.gemini_api_key.clone()),
        };
        let mut line = match &self.line_api_base {
            Some(base) => LineClient::with_api_base(config.line_access_token.clone(), base.clone()),
            None => LineClient::new(config.line_access_token.clone()),
        };
        if let Some(base) = self.backoff_base {
            line = line.with_backoff_base(base);
        }

        self.run_with(&config, &mailbox, &extractor, &line, started)
    }

    /// The orchestration loop proper, generic over the mailbox seam.
    pub fn run_with<M: Mailbox>(
        &self,
        config: &AppConfig,
        mailbox: &M,
        extractor: &GeminiExtractor,
        line: &LineClient,
        started: Instant,
    ) -> Result<RunSummary, RunError> {
        let mut summary = RunSummary::new();

        info!(
            "run started: watermark={} whitelist={} cap={}",
            config.last_processed_time,
            config.sender_whitelist.len(),
            config.max_emails_per_run
        );

        let messages = match mailbox.fetch_since(
            config.last_processed_time,
            &config.sender_whitelist,
            config.max_emails_per_run,
        ) {
            Ok(messages) => messages,
            Err(err) => {
                error!("mailbox fetch failed: {}", err);
                let _ = line.push(
                    &config.line_group_id,
                    &format!("❌ Run aborted: mailbox fetch failed ({})", err),
                );
                return Err(err.into());
            }
        };

        summary.emails_fetched = messages.len();
        if messages.is_empty() {
            info!("no new messages since watermark");
            summary.finalize(started);
            self.dispatch_summary(config, line, &summary);
            return Ok(summary);
        }

        for message in &messages {
            if started.elapsed() > self.budget {
                warn!(
                    "time budget spent after {} of {} message(s); leaving the rest for the next run",
                    summary.emails_processed,
                    messages.len()
                );
                summary.deadline_hit = true;
                break;
            }

            let items = extractor.extract(
                message.body(),
                &message.id,
                &message.from,
                &message.subject,
            );
            summary.items_extracted += items.len();

            if !items.is_empty() {
                let rendered = format_message(&items, &message.from, &message.subject);
                if rendered.truncated {
                    warn!(
                        "notification for message {} exceeded the size limit and was truncated",
                        message.id
                    );
                    summary
                        .errors
                        .push(format!("notification for {} truncated", message.id));
                }

                let outcome = line.push(&config.line_group_id, &rendered.text);
                record_outcome(&mut summary, &message.id, &outcome);
            } else {
                info!("message {} produced no items; nothing to send", message.id);
            }

            // The watermark advances whether or not extraction or delivery
            // worked: a visited message is never reprocessed.
            if let Err(err) = AppConfig::advance_watermark(&self.store, message.received_at) {
                warn!("failed to persist watermark for {}: {}", message.id, err);
                summary
                    .errors
                    .push(format!("watermark write failed after {}: {}", message.id, err));
            }
            summary.emails_processed += 1;
        }

        summary.finalize(started);
        info!(
            "run finished: fetched={} processed={} items={} sent={} errors={} elapsed={:?}",
            summary.emails_fetched,
            summary.emails_processed,
            summary.items_extracted,
            summary.deliveries_sent,
            summary.errors.len(),
            summary.elapsed
        );
        self.dispatch_summary(config, line, &summary);
        Ok(summary)
    }

    fn dispatch_summary(&self, config: &AppConfig, line: &LineClient, summary: &RunSummary) {
        let rendered = format_run_summary(summary);
        let outcome = line.push(&config.line_group_id, &rendered.text);
        if !outcome.succeeded {
            warn!(
                "run summary delivery failed after {} attempt(s): {}",
                outcome.attempts,
                outcome.error_message.as_deref().unwrap_or("unknown error")
            );
        }
    }

    /// Best-effort failure notice for aborts that happen before a full config
    /// exists. Possible only when the LINE credentials themselves loaded.
    fn try_failure_notice(&self, text: &str) {
        let token = self.store.get(KEY_LINE_ACCESS_TOKEN).ok().flatten();
        let group = self.store.get(KEY_LINE_GROUP_ID).ok().flatten();
        let (token, group) = match (token, group) {
            (Some(token), Some(group)) if !token.is_empty() && !group.is_empty() => (token, group),
            _ => {
                warn!("no LINE credentials available; failure visible in logs only");
                return;
            }
        };

        let mut line = match &self.line_api_base {
            Some(base) => LineClient::with_api_base(token, base.clone()),
            None => LineClient::new(token),
        };
        if let Some(base) = self.backoff_base {
            line = line.with_backoff_base(base);
        }
        let _ = line.push(&group, text);
    }
}

fn record_outcome(summary: &mut RunSummary, message_id: &str, outcome: &DeliveryOutcome) {
    if outcome.succeeded {
        summary.deliveries_sent += 1;
        return;
    }
    let status = outcome
        .http_status
        .map(|code| code.to_string())
        .unwrap_or_else(|| "-".to_string());
    summary.errors.push(format!(
        "delivery failed for {} ({:?}, status {}, {} attempt(s)): {}",
        message_id,
        outcome.error_kind,
        status,
        outcome.attempts,
        outcome.error_message.as_deref().unwrap_or("unknown error")
    ));
}
