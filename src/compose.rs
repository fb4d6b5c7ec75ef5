//! Outgoing message composition
//!
//! Validates send requests and renders them as RFC 5322 messages ready for
//! the Gmail `messages.send` endpoint, which takes the whole message as
//! URL-safe base64 without padding.

use std::sync::LazyLock;

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use regex::Regex;
use uuid::Uuid;

use crate::errors::{AppError, AppResult};

const CRLF: &str = "\r\n";
/// Raw bytes per RFC 2047 encoded word (60 base64 chars, under the 75 limit)
const ENCODED_WORD_BYTES: usize = 45;
const MAX_RECIPIENTS: usize = 100;

static ADDR_SPEC: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^[^\s@<>(),;:]+@[^\s@<>(),;:]+\.[^\s@<>(),;:.]+$"));

/// A message to send
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    pub body: Option<String>,
    pub html_body: Option<String>,
}

impl OutgoingMessage {
    fn plain(&self) -> Option<&str> {
        self.body.as_deref().filter(|b| !b.is_empty())
    }

    fn html(&self) -> Option<&str> {
        self.html_body.as_deref().filter(|b| !b.is_empty())
    }
}

/// Validate a message before anything touches the network
///
/// # Errors
///
/// - `InvalidRecipient` if `to` is empty or any address is malformed
/// - `InvalidInput` on CR/LF in headers or when no body is given
pub fn validate(message: &OutgoingMessage) -> AppResult<()> {
    if message.to.is_empty() {
        return Err(AppError::InvalidRecipient(
            "at least one `to` recipient is required".to_owned(),
        ));
    }
    let total = message.to.len() + message.cc.len() + message.bcc.len();
    if total > MAX_RECIPIENTS {
        return Err(AppError::InvalidRecipient(format!(
            "at most {MAX_RECIPIENTS} recipients are allowed, got {total}"
        )));
    }
    for (field, list) in [("to", &message.to), ("cc", &message.cc), ("bcc", &message.bcc)] {
        for recipient in list {
            validate_header_value(recipient, field)?;
            validate_recipient(recipient, field)?;
        }
    }
    validate_header_value(&message.subject, "subject")?;
    if message.plain().is_none() && message.html().is_none() {
        return Err(AppError::invalid(
            "either `body` or `html_body` must be provided",
        ));
    }
    Ok(())
}

fn validate_header_value(value: &str, field: &str) -> AppResult<()> {
    if value.contains(['\r', '\n']) {
        return Err(AppError::invalid(format!(
            "{field} must not contain line breaks"
        )));
    }
    Ok(())
}

/// Accepts `addr@domain` or `Display Name <addr@domain>`
fn validate_recipient(recipient: &str, field: &str) -> AppResult<()> {
    let recipient = recipient.trim();
    let addr = match (recipient.rfind('<'), recipient.strip_suffix('>')) {
        (Some(open), Some(inner)) => &inner[open + 1..],
        (None, None) => recipient,
        _ => {
            return Err(AppError::InvalidRecipient(format!(
                "{field} recipient '{recipient}' has unbalanced angle brackets"
            )));
        }
    };
    let pattern = ADDR_SPEC
        .as_ref()
        .map_err(|e| AppError::Internal(format!("address pattern: {e}")))?;
    if !pattern.is_match(addr.trim()) {
        return Err(AppError::InvalidRecipient(format!(
            "{field} recipient '{recipient}' is not an email address"
        )));
    }
    Ok(())
}

/// Render the message as RFC 5322 text with CRLF line endings
///
/// Plain-only and HTML-only messages are single-part. A message with both
/// bodies becomes `multipart/alternative`, plain part first.
///
/// # Errors
///
/// Same as [`validate`].
pub fn build_raw_message(message: &OutgoingMessage) -> AppResult<String> {
    validate(message)?;

    let mut out = String::new();
    push_header(&mut out, "To", &message.to.join(", "));
    if !message.cc.is_empty() {
        push_header(&mut out, "Cc", &message.cc.join(", "));
    }
    if !message.bcc.is_empty() {
        push_header(&mut out, "Bcc", &message.bcc.join(", "));
    }
    push_header(&mut out, "Subject", &encode_subject(&message.subject));
    push_header(&mut out, "MIME-Version", "1.0");

    match (message.plain(), message.html()) {
        (Some(text), Some(html)) => {
            let boundary = format!("b_{}", Uuid::new_v4().simple());
            push_header(
                &mut out,
                "Content-Type",
                &format!("multipart/alternative; boundary=\"{boundary}\""),
            );
            out.push_str(CRLF);
            push_part(&mut out, &boundary, "text/plain", text);
            push_part(&mut out, &boundary, "text/html", html);
            out.push_str(&format!("--{boundary}--{CRLF}"));
        }
        (Some(text), None) => {
            push_header(&mut out, "Content-Type", "text/plain; charset=\"UTF-8\"");
            out.push_str(CRLF);
            out.push_str(text);
        }
        (None, Some(html)) => {
            push_header(&mut out, "Content-Type", "text/html; charset=\"UTF-8\"");
            out.push_str(CRLF);
            out.push_str(html);
        }
        (None, None) => {
            return Err(AppError::invalid(
                "either `body` or `html_body` must be provided",
            ));
        }
    }
    Ok(out)
}

fn push_header(out: &mut String, name: &str, value: &str) {
    out.push_str(name);
    out.push_str(": ");
    out.push_str(value);
    out.push_str(CRLF);
}

fn push_part(out: &mut String, boundary: &str, content_type: &str, body: &str) {
    out.push_str(&format!("--{boundary}{CRLF}"));
    push_header(out, "Content-Type", &format!("{content_type}; charset=\"UTF-8\""));
    out.push_str(CRLF);
    out.push_str(body);
    out.push_str(CRLF);
}

/// RFC 2047 `B` encoding for non-ASCII subjects; ASCII passes through
///
/// Long subjects are split into several encoded words on character
/// boundaries and folded onto continuation lines.
pub fn encode_subject(subject: &str) -> String {
    if subject.is_ascii() {
        return subject.to_owned();
    }
    let mut words = Vec::new();
    let mut chunk = String::new();
    for ch in subject.chars() {
        if chunk.len() + ch.len_utf8() > ENCODED_WORD_BYTES {
            words.push(encoded_word(&chunk));
            chunk.clear();
        }
        chunk.push(ch);
    }
    if !chunk.is_empty() {
        words.push(encoded_word(&chunk));
    }
    words.join("\r\n ")
}

fn encoded_word(chunk: &str) -> String {
    format!("=?UTF-8?B?{}?=", STANDARD.encode(chunk.as_bytes()))
}

/// Transport encoding expected by `messages.send`
pub fn encode_raw(message: &str) -> String {
    URL_SAFE_NO_PAD.encode(message.as_bytes())
}

#[cfg(test)]
mod tests {
    use base64::Engine;
    use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};

    use super::{OutgoingMessage, build_raw_message, encode_raw, encode_subject, validate};
    use crate::errors::AppError;

    fn message() -> OutgoingMessage {
        OutgoingMessage {
            to: vec!["b@y.com".to_owned()],
            subject: "Hi".to_owned(),
            body: Some("Hello".to_owned()),
            ..OutgoingMessage::default()
        }
    }

    #[test]
    fn plain_message_has_expected_headers_and_exact_body() {
        let raw = build_raw_message(&message()).expect("build");
        let (head, body) = raw.split_once("\r\n\r\n").expect("header/body separator");

        assert!(head.contains("To: b@y.com"));
        assert!(head.contains("Subject: Hi"));
        assert!(head.contains("MIME-Version: 1.0"));
        assert!(head.contains("Content-Type: text/plain; charset=\"UTF-8\""));
        assert!(!head.contains("Cc:"));
        assert_eq!(body, "Hello");
    }

    #[test]
    fn two_recipients_share_one_to_line() {
        let mut msg = message();
        msg.to = vec!["a@x.com".to_owned(), "b@y.com".to_owned()];
        let raw = build_raw_message(&msg).expect("build");
        let (head, body) = raw.split_once("\r\n\r\n").expect("header/body separator");

        assert!(head.starts_with("To: a@x.com, b@y.com\r\n"));
        assert_eq!(head.matches("To:").count(), 1);
        assert!(head.contains("Subject: Hi\r\n"));
        assert_eq!(body, "Hello");
    }

    #[test]
    fn cc_and_bcc_are_rendered_when_present() {
        let mut msg = message();
        msg.cc = vec!["c@y.com".to_owned(), "Dee <d@y.com>".to_owned()];
        msg.bcc = vec!["e@y.com".to_owned()];
        let raw = build_raw_message(&msg).expect("build");

        assert!(raw.contains("Cc: c@y.com, Dee <d@y.com>\r\n"));
        assert!(raw.contains("Bcc: e@y.com\r\n"));
    }

    #[test]
    fn html_with_plain_is_multipart_alternative_plain_first() {
        let mut msg = message();
        msg.html_body = Some("<p>Hello</p>".to_owned());
        let raw = build_raw_message(&msg).expect("build");

        let marker = "boundary=\"";
        let start = raw.find(marker).expect("boundary parameter") + marker.len();
        let end = start + raw[start..].find('"').expect("closing quote");
        let boundary = &raw[start..end];
        assert!(raw.contains("Content-Type: multipart/alternative;"));

        let delimiter = format!("--{boundary}\r\n");
        let plain_at = raw.find(&delimiter).expect("first part");
        let html_at = raw[plain_at + 1..].find(&delimiter).expect("second part") + plain_at + 1;
        assert!(raw[plain_at..html_at].contains("text/plain"));
        assert!(raw[plain_at..html_at].contains("Hello"));
        assert!(raw[html_at..].contains("text/html"));
        assert!(raw[html_at..].contains("<p>Hello</p>"));
        assert!(raw.ends_with(&format!("--{boundary}--\r\n")));
    }

    #[test]
    fn html_only_is_single_html_part() {
        let mut msg = message();
        msg.body = None;
        msg.html_body = Some("<b>x</b>".to_owned());
        let raw = build_raw_message(&msg).expect("build");

        assert!(raw.contains("Content-Type: text/html; charset=\"UTF-8\""));
        assert!(!raw.contains("multipart"));
        assert!(raw.ends_with("\r\n\r\n<b>x</b>"));
    }

    #[test]
    fn recipient_validation() {
        let mut msg = message();
        msg.to.clear();
        assert!(matches!(validate(&msg), Err(AppError::InvalidRecipient(_))));

        msg.to = vec!["not-an-address".to_owned()];
        assert!(matches!(validate(&msg), Err(AppError::InvalidRecipient(_))));

        msg.to = vec!["Ann <ann@x.com".to_owned()];
        assert!(matches!(validate(&msg), Err(AppError::InvalidRecipient(_))));

        msg.to = vec!["ann@x.com".to_owned()];
        msg.bcc = vec!["bad@".to_owned()];
        assert!(matches!(validate(&msg), Err(AppError::InvalidRecipient(_))));
    }

    #[test]
    fn header_injection_is_rejected() {
        let mut msg = message();
        msg.subject = "Hi\r\nBcc: evil@x.com".to_owned();
        assert!(matches!(validate(&msg), Err(AppError::InvalidInput(_))));

        let mut msg = message();
        msg.to = vec!["a@x.com\nBcc: evil@x.com".to_owned()];
        assert!(matches!(validate(&msg), Err(AppError::InvalidInput(_))));
    }

    #[test]
    fn missing_body_is_rejected() {
        let mut msg = message();
        msg.body = None;
        assert!(matches!(validate(&msg), Err(AppError::InvalidInput(_))));
    }

    #[test]
    fn non_ascii_subject_is_encoded_word() {
        let encoded = encode_subject("Grüße");
        let inner = encoded
            .strip_prefix("=?UTF-8?B?")
            .and_then(|s| s.strip_suffix("?="))
            .expect("encoded word");
        let decoded = STANDARD.decode(inner).expect("base64");
        assert_eq!(String::from_utf8(decoded).expect("utf8"), "Grüße");
        assert_eq!(encode_subject("plain"), "plain");
    }

    #[test]
    fn long_non_ascii_subject_is_folded_into_words() {
        let subject = "é".repeat(60);
        let encoded = encode_subject(&subject);
        let words: Vec<&str> = encoded.split("\r\n ").collect();
        assert!(words.len() > 1);
        let mut rebuilt = String::new();
        for word in words {
            assert!(word.len() <= 75);
            let inner = &word["=?UTF-8?B?".len()..word.len() - 2];
            rebuilt.push_str(&String::from_utf8(STANDARD.decode(inner).expect("b64")).expect("utf8"));
        }
        assert_eq!(rebuilt, subject);
    }

    #[test]
    fn raw_encoding_is_url_safe_without_padding() {
        let encoded = encode_raw("Subject: ??>\r\n\r\n~~~");
        assert!(!encoded.contains(['+', '/', '=']));
        assert_eq!(
            URL_SAFE_NO_PAD.decode(&encoded).expect("decode"),
            b"Subject: ??>\r\n\r\n~~~"
        );
    }
}
