//! Input/output DTOs and schema-bearing types
//!
//! Defines all data structures used in MCP tool contracts. Each type is
//! annotated with `JsonSchema` for automatic schema generation.

use chrono::{SecondsFormat, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::store::AccountEntry;

/// Metadata included in all tool responses
///
/// Provides timing information and current UTC timestamp.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Meta {
    /// Current UTC timestamp in RFC 3339 format with milliseconds
    pub now_utc: String,
    /// Tool execution duration in milliseconds
    pub duration_ms: u64,
}

impl Meta {
    /// Create metadata populated with current time and elapsed duration
    pub fn now(duration_ms: u64) -> Self {
        Self {
            now_utc: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            duration_ms,
        }
    }
}

/// Standard response envelope for all tools
///
/// Wraps tool-specific data with human-readable summary and execution metadata.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ToolEnvelope<T>
where
    T: JsonSchema,
{
    /// Human-readable summary of the operation outcome
    pub summary: String,
    /// Tool-specific data payload
    pub data: T,
    /// Execution metadata (timestamp, duration)
    pub meta: Meta,
}

/// Registered account (no credentials)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct AccountInfo {
    /// Account email address (lowercase)
    pub email: String,
    /// Whether calls without an `account` argument use this account
    pub is_default: bool,
    /// Registration time, RFC 3339
    pub added_at: String,
    /// Last successful operation, RFC 3339
    pub last_used_at: String,
}

impl From<&AccountEntry> for AccountInfo {
    fn from(entry: &AccountEntry) -> Self {
        Self {
            email: entry.email.clone(),
            is_default: entry.is_default,
            added_at: entry.added_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            last_used_at: entry.last_used_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

/// Returned by `list_accounts`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AccountList {
    pub accounts: Vec<AccountInfo>,
    /// Email of the default account, if one is configured
    pub default_account: Option<String>,
}

impl AccountList {
    pub fn from_entries(entries: &[AccountEntry]) -> Self {
        Self {
            default_account: entries
                .iter()
                .find(|e| e.is_default)
                .map(|e| e.email.clone()),
            accounts: entries.iter().map(AccountInfo::from).collect(),
        }
    }
}

/// Returned by `add_account`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AddAccountResult {
    pub account: AccountInfo,
    /// Scopes granted during consent
    pub scopes: Vec<String>,
    /// URL that was opened for consent
    pub authorization_url: String,
}

/// Returned by `remove_account`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RemoveAccountResult {
    pub email: String,
    pub removed: bool,
    /// The removed account was the default
    pub was_default: bool,
    /// Set when no default account remains
    pub warning: Option<String>,
}

/// Returned by `send_email`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SendResult {
    /// Account the message was sent from
    pub account: String,
    /// Gmail message id
    pub id: String,
    pub thread_id: Option<String>,
    pub label_ids: Vec<String>,
}

/// Search hit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct EmailSummary {
    /// Gmail message id
    pub id: String,
    pub thread_id: Option<String>,
    /// Subject header, empty if missing
    pub subject: String,
    /// From header, empty if missing
    pub from: String,
    /// Date header, empty if missing
    pub date: String,
    /// Gmail-generated preview text
    pub snippet: String,
    pub label_ids: Vec<String>,
}

/// Returned by `search_emails`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SearchResult {
    /// Account that was searched
    pub account: String,
    /// Hits in the order Gmail listed them
    pub messages: Vec<EmailSummary>,
    /// Pass as `page_token` to fetch the next page
    pub next_page_token: Option<String>,
    /// Gmail's estimate of the total number of matches
    pub result_size_estimate: u32,
}

/// Attachment metadata
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AttachmentInfo {
    /// Filename if present in Content-Disposition or Content-Type
    pub filename: Option<String>,
    /// MIME content type (e.g., `application/pdf`, `image/jpeg`)
    pub content_type: String,
    /// Attachment size in bytes
    pub size_bytes: usize,
    /// Part ID for MIME structure (e.g., `1`, `2`, `3.1`)
    pub part_id: String,
}

/// Full message returned by `read_email`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EmailMessage {
    /// Account the message was read from
    pub account: String,
    /// Gmail message id
    pub id: String,
    pub thread_id: Option<String>,
    pub label_ids: Vec<String>,
    pub date: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub cc: Option<String>,
    pub subject: Option<String>,
    /// Curated headers, or all headers with `include_all_headers=true`
    pub headers: Vec<(String, String)>,
    /// Plain text body (truncated to `body_max_chars`); derived from the
    /// HTML part when the message has no text/plain part
    pub body_text: Option<String>,
    /// Sanitized HTML body (if `include_html=true`, truncated)
    pub body_html: Option<String>,
    /// A body was cut at `body_max_chars`
    pub truncated: bool,
    pub attachments: Vec<AttachmentInfo>,
}

/// Returned by `manage_labels`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct LabelResult {
    pub account: String,
    /// Gmail message id
    pub id: String,
    /// Labels on the message after the change
    pub label_ids: Vec<String>,
}

/// Input: send a message
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct SendEmailInput {
    /// Account to send from (defaults to the default account)
    pub account: Option<String>,
    /// Recipients (`addr@domain` or `Name <addr@domain>`)
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    pub subject: String,
    /// Plain text body
    pub body: Option<String>,
    /// HTML body; sent as multipart/alternative when `body` is also set
    pub html_body: Option<String>,
}

/// Input: search messages
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct SearchEmailsInput {
    /// Account to search (defaults to the default account)
    pub account: Option<String>,
    /// Gmail search query (e.g., `from:alice is:unread`)
    #[serde(default)]
    pub query: String,
    /// Maximum messages to return (1..100, default 10)
    #[serde(default = "default_max_results")]
    pub max_results: u32,
    /// Token from a previous result's `next_page_token`
    pub page_token: Option<String>,
}

/// Input: read one message
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ReadEmailInput {
    /// Account to read from (defaults to the default account)
    pub account: Option<String>,
    /// Gmail message id
    pub message_id: String,
    /// Maximum body characters (100..50000, default 8000)
    #[serde(default = "default_body_max_chars")]
    pub body_max_chars: usize,
    /// Include sanitized HTML body
    #[serde(default)]
    pub include_html: bool,
    /// Include every header instead of the curated subset
    #[serde(default)]
    pub include_all_headers: bool,
}

/// Input: add/remove labels on a message
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ManageLabelsInput {
    /// Account owning the message (defaults to the default account)
    pub account: Option<String>,
    /// Gmail message id
    pub message_id: String,
    /// Label ids to add (e.g., `STARRED`, `UNREAD`, `Label_12`)
    #[serde(default)]
    pub add_labels: Vec<String>,
    /// Label ids to remove (e.g., `INBOX` to archive)
    #[serde(default)]
    pub remove_labels: Vec<String>,
}

/// Input: register an account through browser consent
#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
pub struct AddAccountInput {
    /// Make the new account the default (the first account always is)
    pub make_default: Option<bool>,
}

/// Input: identify a registered account
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct AccountEmailInput {
    /// Account email address
    pub email: String,
}

/// Default value for `max_results` in search
fn default_max_results() -> u32 {
    10
}

/// Default value for `body_max_chars` in read_email
fn default_body_max_chars() -> usize {
    8_000
}
