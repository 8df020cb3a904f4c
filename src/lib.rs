pub mod config;
pub mod formatter;
pub mod gemini;
pub mod gmail;
pub mod line;
pub mod runner;

pub use config::{AppConfig, ConfigError, PropertyStore};
pub use gemini::{ExtractedItem, GeminiExtractor, Priority};
pub use gmail::{GmailMailbox, InboundMessage, Mailbox, MailboxError};
pub use line::{DeliveryErrorKind, DeliveryOutcome, LineClient};
pub use runner::{RunError, RunSummary, Runner};
