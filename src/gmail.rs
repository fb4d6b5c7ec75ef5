//! Gmail REST API client
//!
//! [`MailApi`] is the seam between the tool layer and Gmail. Every method
//! takes the access token to use for that single request; the client never
//! stores or refreshes tokens itself.

use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::errors::{AppError, AppResult};

/// Headers requested for search result summaries
pub const METADATA_HEADERS: [&str; 3] = ["Subject", "From", "Date"];

/// Response of `messages.send`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SentMessage {
    pub id: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub label_ids: Vec<String>,
}

/// Response of `messages.list`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageList {
    #[serde(default)]
    pub messages: Vec<MessageRef>,
    #[serde(default)]
    pub next_page_token: Option<String>,
    #[serde(default)]
    pub result_size_estimate: u32,
}

/// Message id from a list page
#[derive(Debug, Clone, Deserialize)]
pub struct MessageRef {
    pub id: String,
}

/// Message resource as returned by `messages.get` / `messages.modify`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GmailMessage {
    pub id: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub label_ids: Vec<String>,
    #[serde(default)]
    pub snippet: Option<String>,
    #[serde(default)]
    pub payload: Option<MessagePart>,
    /// Base64url message source (`format=raw` only)
    #[serde(default)]
    pub raw: Option<String>,
}

impl GmailMessage {
    /// Header value from the top-level payload, matched case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        extract_header(self.payload.as_ref().map(|p| p.headers.as_slice()), name)
    }
}

/// Top-level MIME part; only its headers are requested
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessagePart {
    #[serde(default)]
    pub headers: Vec<MessageHeader>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageHeader {
    pub name: String,
    pub value: String,
}

/// Response of `users.getProfile`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub email_address: String,
}

/// Parameters of `messages.list`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListQuery {
    pub query: String,
    pub max_results: u32,
    pub page_token: Option<String>,
}

#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    raw: &'a str,
}

/// Body of `messages.modify`
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModifyRequest {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub add_label_ids: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub remove_label_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: Option<String>,
}

/// Mail operations used by the tool layer
pub trait MailApi: Send + Sync {
    fn send<'a>(&'a self, access_token: &'a str, raw: &'a str)
    -> BoxFuture<'a, AppResult<SentMessage>>;

    fn list<'a>(
        &'a self,
        access_token: &'a str,
        query: &'a ListQuery,
    ) -> BoxFuture<'a, AppResult<MessageList>>;

    fn get_metadata<'a>(
        &'a self,
        access_token: &'a str,
        id: &'a str,
    ) -> BoxFuture<'a, AppResult<GmailMessage>>;

    fn get_raw<'a>(
        &'a self,
        access_token: &'a str,
        id: &'a str,
    ) -> BoxFuture<'a, AppResult<GmailMessage>>;

    fn modify<'a>(
        &'a self,
        access_token: &'a str,
        id: &'a str,
        request: &'a ModifyRequest,
    ) -> BoxFuture<'a, AppResult<GmailMessage>>;

    fn profile<'a>(&'a self, access_token: &'a str) -> BoxFuture<'a, AppResult<Profile>>;
}

/// Build the shared HTTP client with a per-request timeout
///
/// # Errors
///
/// Returns `Internal` if the TLS backend cannot be initialized.
pub fn build_http_client(timeout: Duration) -> AppResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| AppError::Internal(format!("failed to build HTTP client: {e}")))
}

/// Production [`MailApi`] backed by the Gmail REST API
#[derive(Debug, Clone)]
pub struct GmailClient {
    http: reqwest::Client,
    base_url: String,
}

impl GmailClient {
    /// `base_url` is the API root, e.g. `https://gmail.googleapis.com/gmail/v1`
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if `base_url` is not an absolute http(s) URL.
    pub fn new(http: reqwest::Client, base_url: &str) -> AppResult<Self> {
        let base_url = base_url.trim().trim_end_matches('/').to_owned();
        let parsed = reqwest::Url::parse(&base_url)
            .map_err(|e| AppError::invalid(format!("invalid Gmail API base URL: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(AppError::invalid(
                "Gmail API base URL must use http or https",
            ));
        }
        Ok(Self { http, base_url })
    }

    fn build_url(&self, segments: &[&str]) -> AppResult<reqwest::Url> {
        let mut url = reqwest::Url::parse(&self.base_url)
            .map_err(|e| AppError::Internal(format!("invalid base URL: {e}")))?;
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|()| AppError::Internal("base URL cannot be a base".to_owned()))?;
            path.extend(["users", "me"]).extend(segments);
        }
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        access_token: &str,
        segments: &[&str],
        query: &[(&str, &str)],
    ) -> AppResult<T> {
        let url = self.build_url(segments)?;
        let request = self
            .http
            .get(url)
            .query(query)
            .bearer_auth(access_token)
            .header(reqwest::header::ACCEPT, "application/json");
        execute(request).await
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        access_token: &str,
        segments: &[&str],
        body: &B,
    ) -> AppResult<T> {
        let url = self.build_url(segments)?;
        let request = self
            .http
            .post(url)
            .json(body)
            .bearer_auth(access_token)
            .header(reqwest::header::ACCEPT, "application/json");
        execute(request).await
    }
}

async fn execute<T: DeserializeOwned>(request: reqwest::RequestBuilder) -> AppResult<T> {
    let response = request.send().await.map_err(transport_error)?;
    let status = response.status();
    if status.is_success() {
        return response.json::<T>().await.map_err(|e| AppError::MailApi {
            status: Some(status.as_u16()),
            message: format!("unexpected response body: {e}"),
        });
    }
    let body = response.text().await.unwrap_or_default();
    Err(api_error(status.as_u16(), &body))
}

fn transport_error(error: reqwest::Error) -> AppError {
    if error.is_timeout() {
        AppError::OperationTimeout(format!("Gmail API request timed out: {error}"))
    } else {
        AppError::MailApi {
            status: None,
            message: format!("request failed: {error}"),
        }
    }
}

/// Map a non-2xx response, keeping the remote status
fn api_error(status: u16, body: &str) -> AppError {
    let message = match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(parsed) => match parsed.error.status {
            Some(code) => format!("{} ({code})", parsed.error.message),
            None => parsed.error.message,
        },
        Err(_) if body.trim().is_empty() => "empty error response".to_owned(),
        Err(_) => body.chars().take(300).collect(),
    };
    let message = if status == 401 {
        format!("{message}; the access token was rejected, the next call will refresh it")
    } else {
        message
    };
    AppError::MailApi {
        status: Some(status),
        message,
    }
}

impl MailApi for GmailClient {
    fn send<'a>(
        &'a self,
        access_token: &'a str,
        raw: &'a str,
    ) -> BoxFuture<'a, AppResult<SentMessage>> {
        async move {
            self.post_json(access_token, &["messages", "send"], &SendRequest { raw })
                .await
        }
        .boxed()
    }

    fn list<'a>(
        &'a self,
        access_token: &'a str,
        query: &'a ListQuery,
    ) -> BoxFuture<'a, AppResult<MessageList>> {
        async move {
            let max_results = query.max_results.to_string();
            let mut params = vec![("maxResults", max_results.as_str())];
            if !query.query.is_empty() {
                params.push(("q", query.query.as_str()));
            }
            if let Some(token) = query.page_token.as_deref() {
                params.push(("pageToken", token));
            }
            self.get_json(access_token, &["messages"], &params).await
        }
        .boxed()
    }

    fn get_metadata<'a>(
        &'a self,
        access_token: &'a str,
        id: &'a str,
    ) -> BoxFuture<'a, AppResult<GmailMessage>> {
        async move {
            let mut params = vec![("format", "metadata")];
            params.extend(METADATA_HEADERS.iter().map(|h| ("metadataHeaders", *h)));
            self.get_json(access_token, &["messages", id], &params).await
        }
        .boxed()
    }

    fn get_raw<'a>(
        &'a self,
        access_token: &'a str,
        id: &'a str,
    ) -> BoxFuture<'a, AppResult<GmailMessage>> {
        async move {
            self.get_json(access_token, &["messages", id], &[("format", "raw")])
                .await
        }
        .boxed()
    }

    fn modify<'a>(
        &'a self,
        access_token: &'a str,
        id: &'a str,
        request: &'a ModifyRequest,
    ) -> BoxFuture<'a, AppResult<GmailMessage>> {
        async move {
            self.post_json(access_token, &["messages", id, "modify"], request)
                .await
        }
        .boxed()
    }

    fn profile<'a>(&'a self, access_token: &'a str) -> BoxFuture<'a, AppResult<Profile>> {
        async move { self.get_json(access_token, &["profile"], &[]).await }.boxed()
    }
}

/// Case-insensitive header lookup
pub fn extract_header<'a>(headers: Option<&'a [MessageHeader]>, name: &str) -> Option<&'a str> {
    headers?
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}
