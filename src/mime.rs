//! Message parsing and MIME handling
//!
//! Parses RFC822 messages fetched with `format=raw` using `mailparse`,
//! extracts body text/HTML, and collects attachment metadata. HTML is
//! sanitized with `ammonia`; messages without a text/plain part get a text
//! body rendered from their HTML by `html2text`.

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use mailparse::{DispositionType, MailHeader, ParsedMail};

use crate::errors::{AppError, AppResult};
use crate::models::AttachmentInfo;

/// Column width for HTML-to-text rendering
const HTML_TEXT_WIDTH: usize = 100;

/// Parsed message representation
#[derive(Debug, Clone)]
pub struct ParsedMessage {
    /// Parsed Date header
    pub date: Option<String>,
    /// Parsed From header
    pub from: Option<String>,
    /// Parsed To header
    pub to: Option<String>,
    /// Parsed Cc header
    pub cc: Option<String>,
    /// Parsed Subject header
    pub subject: Option<String>,
    /// All headers as key-value pairs
    pub headers_all: Vec<(String, String)>,
    /// Plain text body, truncated
    pub body_text: Option<String>,
    /// Sanitized HTML body, truncated (only when requested)
    pub body_html_sanitized: Option<String>,
    /// Some body exceeded the character limit
    pub truncated: bool,
    /// Attachment metadata
    pub attachments: Vec<AttachmentInfo>,
}

/// Decode the `raw` field of a Gmail message (base64url, padding optional)
///
/// # Errors
///
/// - `MailApi` if the payload is not valid base64url
pub fn decode_raw(raw: &str) -> AppResult<Vec<u8>> {
    let trimmed = raw.trim();
    URL_SAFE_NO_PAD
        .decode(trimmed.trim_end_matches('='))
        .or_else(|_| URL_SAFE.decode(trimmed))
        .map_err(|e| AppError::MailApi {
            status: None,
            message: format!("raw message is not valid base64url: {e}"),
        })
}

/// Parse RFC822 message into structured representation
///
/// # Parameters
///
/// - `raw`: RFC822 message bytes
/// - `body_max_chars`: Maximum characters for body text/HTML
/// - `include_html`: Whether to include the sanitized HTML body
///
/// # Errors
///
/// - `Internal` if `mailparse` fails
pub fn parse_message(
    raw: &[u8],
    body_max_chars: usize,
    include_html: bool,
) -> AppResult<ParsedMessage> {
    let parsed = mailparse::parse_mail(raw)
        .map_err(|e| AppError::Internal(format!("failed to parse RFC822 message: {e}")))?;

    let headers = parse_all_headers(raw)?;
    let mut body_text = None;
    let mut body_html = None;
    let mut attachments = Vec::new();

    walk_parts(
        &parsed,
        "1".to_owned(),
        &mut body_text,
        &mut body_html,
        &mut attachments,
    )?;

    if body_text.is_none() {
        body_text = body_html.as_deref().and_then(html_to_text);
    }

    let mut truncated = false;
    let text = body_text.map(|t| {
        truncated |= t.chars().count() > body_max_chars;
        truncate_chars(t, body_max_chars)
    });
    let html = if include_html {
        body_html.map(|h| {
            let clean = ammonia::clean(&h);
            truncated |= clean.chars().count() > body_max_chars;
            truncate_chars(clean, body_max_chars)
        })
    } else {
        None
    };

    let header_map = to_header_map(&headers);
    Ok(ParsedMessage {
        date: header_map.get("date").cloned(),
        from: header_map.get("from").cloned(),
        to: header_map.get("to").cloned(),
        cc: header_map.get("cc").cloned(),
        subject: header_map.get("subject").cloned(),
        headers_all: headers,
        body_text: text,
        body_html_sanitized: html,
        truncated,
        attachments,
    })
}

/// Walk MIME part tree recursively
///
/// Keeps the first inline text/plain and text/html bodies; everything with
/// an attachment disposition or a filename is reported as an attachment.
fn walk_parts(
    part: &ParsedMail<'_>,
    part_id: String,
    body_text: &mut Option<String>,
    body_html: &mut Option<String>,
    attachments: &mut Vec<AttachmentInfo>,
) -> AppResult<()> {
    if part.subparts.is_empty() {
        let ctype = part.ctype.mimetype.to_ascii_lowercase();
        let disp = part.get_content_disposition();
        let filename = attachment_filename(part, &disp.params);
        let is_attachment = disp.disposition == DispositionType::Attachment || filename.is_some();

        if is_attachment {
            let raw_body = part
                .get_body_raw()
                .map_err(|e| AppError::Internal(format!("failed decoding attachment body: {e}")))?;
            attachments.push(AttachmentInfo {
                filename,
                content_type: ctype,
                size_bytes: raw_body.len(),
                part_id,
            });
            return Ok(());
        }

        if ctype == "text/plain"
            && body_text.is_none()
            && let Ok(text) = part.get_body()
        {
            *body_text = Some(text);
        }

        if ctype == "text/html"
            && body_html.is_none()
            && let Ok(html) = part.get_body()
        {
            *body_html = Some(html);
        }

        return Ok(());
    }

    for (idx, sub) in part.subparts.iter().enumerate() {
        let next_id = format!("{part_id}.{}", idx + 1);
        walk_parts(sub, next_id, body_text, body_html, attachments)?;
    }
    Ok(())
}

/// Render HTML as plain text; `None` when nothing readable remains
fn html_to_text(html: &str) -> Option<String> {
    let text = html2text::from_read(html.as_bytes(), HTML_TEXT_WIDTH).ok()?;
    let text = text
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n");
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_owned())
}

/// Extract attachment filename from part
///
/// Checks Content-Disposition parameter first, falls back to Content-Type
/// name parameter.
fn attachment_filename(
    part: &ParsedMail<'_>,
    disp_params: &BTreeMap<String, String>,
) -> Option<String> {
    disp_params
        .get("filename")
        .cloned()
        .or_else(|| part.ctype.params.get("name").cloned())
}

/// Return headers, either curated or all
///
/// If `include_all=true`, returns all headers. Otherwise, returns only
/// a safe subset (Date, From, To, Cc, Subject, Message-ID).
pub fn curated_headers(headers: &[(String, String)], include_all: bool) -> Vec<(String, String)> {
    if include_all {
        return headers.to_vec();
    }

    let allowed = ["date", "from", "to", "cc", "subject", "message-id"];
    headers
        .iter()
        .filter(|(k, _)| allowed.contains(&k.to_ascii_lowercase().as_str()))
        .cloned()
        .collect()
}

/// Parse all headers from raw message
fn parse_all_headers(raw: &[u8]) -> AppResult<Vec<(String, String)>> {
    let (headers, _) = mailparse::parse_headers(raw)
        .map_err(|e| AppError::Internal(format!("failed to parse message headers: {e}")))?;
    Ok(to_tuples(headers))
}

/// Convert mailparse headers to tuples
fn to_tuples(headers: Vec<MailHeader<'_>>) -> Vec<(String, String)> {
    headers
        .into_iter()
        .map(|h| (h.get_key(), h.get_value()))
        .collect()
}

/// First value for each header key, keyed lowercase
fn to_header_map(headers: &[(String, String)]) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for (k, v) in headers {
        let key = k.to_ascii_lowercase();
        map.entry(key).or_insert_with(|| v.clone());
    }
    map
}

/// Truncate string to maximum characters (Unicode-aware)
pub fn truncate_chars(input: String, max_chars: usize) -> String {
    match input.char_indices().nth(max_chars) {
        Some((idx, _)) => input[..idx].to_owned(),
        None => input,
    }
}
