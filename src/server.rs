//! MCP server implementation with tool handlers
//!
//! Implements the `ServerHandler` trait and registers 8 MCP tools. Mail tools
//! resolve an account, make sure its access token is valid, and only then
//! talk to Gmail. Account tools drive the registry and the consent flow.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::try_join_all;
use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{ErrorData, ServerCapabilities, ServerInfo};
use rmcp::{Json, ServerHandler, tool, tool_handler, tool_router};
use secrecy::ExposeSecret;

use crate::compose::{self, OutgoingMessage};
use crate::config::{SCOPE_MODIFY, ServerConfig};
use crate::consent::ConsentFlow;
use crate::errors::{AppError, AppResult};
use crate::gmail::{GmailMessage, ListQuery, MailApi, ModifyRequest};
use crate::mime;
use crate::models::{
    AccountEmailInput, AccountInfo, AccountList, AddAccountInput, AddAccountResult,
    EmailMessage, EmailSummary, LabelResult, ManageLabelsInput, Meta, ReadEmailInput,
    RemoveAccountResult, SearchEmailsInput, SearchResult, SendEmailInput, SendResult,
    ToolEnvelope,
};
use crate::refresh::TokenRefreshGuard;
use crate::registry::{AccountRegistry, normalize_email};
use crate::selector;
use crate::store::CredentialRecord;

/// Maximum messages per search result page
const MAX_SEARCH_RESULTS: u32 = 100;
/// Maximum attachments to return per message
const MAX_ATTACHMENTS: usize = 50;
/// Maximum labels per `manage_labels` call
const MAX_LABELS: usize = 50;

/// Gmail MCP server
///
/// Cheap to clone: every component sits behind an `Arc`.
#[derive(Clone)]
pub struct GmailMcpServer {
    /// Server config (timeouts, modify flag, OAuth client identity)
    config: Arc<ServerConfig>,
    /// Known accounts and their credentials
    registry: Arc<AccountRegistry>,
    /// Refreshes expired access tokens before use
    guard: Arc<TokenRefreshGuard>,
    /// Gmail REST API
    mail: Arc<dyn MailApi>,
    /// Interactive authorization for `add_account`
    consent: Arc<dyn ConsentFlow>,
    /// Tool router for dispatching MCP tool calls
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl GmailMcpServer {
    /// Create a new MCP server instance
    pub fn new(
        config: ServerConfig,
        registry: Arc<AccountRegistry>,
        guard: Arc<TokenRefreshGuard>,
        mail: Arc<dyn MailApi>,
        consent: Arc<dyn ConsentFlow>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            registry,
            guard,
            mail,
            consent,
            tool_router: Self::tool_router(),
        }
    }

    /// Tool: Send an email
    #[tool(
        name = "send_email",
        description = "Send an email from a Gmail account. Uses the default account when `account` is omitted. Provide `body`, `html_body`, or both."
    )]
    async fn send_email(
        &self,
        Parameters(input): Parameters<SendEmailInput>,
    ) -> Result<Json<ToolEnvelope<SendResult>>, ErrorData> {
        let started = Instant::now();
        let result = self
            .bounded("send_email", self.send_email_impl(input))
            .await
            .map(|data| (format!("Message sent from {}", data.account), data));
        finalize_tool(started, result)
    }

    /// Tool: Search messages
    ///
    /// Accepts Gmail search syntax and returns summaries in Gmail's order.
    #[tool(
        name = "search_emails",
        description = "Search messages with Gmail query syntax (e.g. `from:alice is:unread newer_than:7d`). Paginate with `page_token`."
    )]
    async fn search_emails(
        &self,
        Parameters(input): Parameters<SearchEmailsInput>,
    ) -> Result<Json<ToolEnvelope<SearchResult>>, ErrorData> {
        let started = Instant::now();
        let result = self
            .bounded("search_emails", self.search_emails_impl(input))
            .await
            .map(|data| {
                (
                    format!("{} message(s) found in {}", data.messages.len(), data.account),
                    data,
                )
            });
        finalize_tool(started, result)
    }

    /// Tool: Read one message
    #[tool(
        name = "read_email",
        description = "Read a message: headers, text body, optional sanitized HTML, attachment metadata"
    )]
    async fn read_email(
        &self,
        Parameters(input): Parameters<ReadEmailInput>,
    ) -> Result<Json<ToolEnvelope<EmailMessage>>, ErrorData> {
        let started = Instant::now();
        let result = self
            .bounded("read_email", self.read_email_impl(input))
            .await
            .map(|data| ("Message retrieved".to_owned(), data));
        finalize_tool(started, result)
    }

    /// Tool: Add or remove labels
    ///
    /// Requires the account to have been authorized with the modify scope.
    #[tool(
        name = "manage_labels",
        description = "Add or remove label ids on a message (e.g. add STARRED, remove UNREAD or INBOX)"
    )]
    async fn manage_labels(
        &self,
        Parameters(input): Parameters<ManageLabelsInput>,
    ) -> Result<Json<ToolEnvelope<LabelResult>>, ErrorData> {
        let started = Instant::now();
        let result = self
            .bounded("manage_labels", self.manage_labels_impl(input))
            .await
            .map(|data| ("Labels updated".to_owned(), data));
        finalize_tool(started, result)
    }

    /// Tool: List registered accounts
    #[tool(
        name = "list_accounts",
        description = "List registered Gmail accounts and which one is the default"
    )]
    async fn list_accounts(&self) -> Result<Json<ToolEnvelope<AccountList>>, ErrorData> {
        let started = Instant::now();
        let data = self.list_accounts_impl().await;
        let summary = match &data.default_account {
            Some(default) => format!("{} account(s), default {default}", data.accounts.len()),
            None => format!("{} account(s), no default", data.accounts.len()),
        };
        finalize_tool(started, Ok((summary, data)))
    }

    /// Tool: Register an account through browser consent
    ///
    /// Blocks until the user completes consent or the consent timeout hits.
    #[tool(
        name = "add_account",
        description = "Add a Gmail account. Opens the browser for Google consent and waits for it to complete. The first account becomes the default."
    )]
    async fn add_account(
        &self,
        Parameters(input): Parameters<AddAccountInput>,
    ) -> Result<Json<ToolEnvelope<AddAccountResult>>, ErrorData> {
        let started = Instant::now();
        let limit = self.config.consent_timeout() + self.config.operation_timeout();
        let result = bounded(limit, "add_account", self.add_account_impl(input))
            .await
            .map(|data| (format!("Account {} added", data.account.email), data));
        finalize_tool(started, result)
    }

    /// Tool: Remove an account and its stored credential
    #[tool(
        name = "remove_account",
        description = "Remove a Gmail account and delete its stored credential"
    )]
    async fn remove_account(
        &self,
        Parameters(input): Parameters<AccountEmailInput>,
    ) -> Result<Json<ToolEnvelope<RemoveAccountResult>>, ErrorData> {
        let started = Instant::now();
        let result = self
            .bounded("remove_account", self.remove_account_impl(input))
            .await
            .map(|data| (format!("Account {} removed", data.email), data));
        finalize_tool(started, result)
    }

    /// Tool: Choose the default account
    #[tool(
        name = "set_default_account",
        description = "Make a registered account the default for calls without an `account` argument"
    )]
    async fn set_default_account(
        &self,
        Parameters(input): Parameters<AccountEmailInput>,
    ) -> Result<Json<ToolEnvelope<AccountInfo>>, ErrorData> {
        let started = Instant::now();
        let result = self
            .bounded("set_default_account", self.set_default_account_impl(input))
            .await
            .map(|data| (format!("{} is now the default account", data.email), data));
        finalize_tool(started, result)
    }
}

/// MCP server handler implementation
///
/// Provides server info and capabilities to MCP client.
#[tool_handler(router = self.tool_router)]
impl ServerHandler for GmailMcpServer {
    fn get_info(&self) -> ServerInfo {
        let mut info = ServerInfo::default();
        info.instructions = Some(
            "Gmail MCP server with multiple accounts. Mail tools take an optional `account`; without it the default account is used. Register accounts with add_account and pick the default with set_default_account.".to_owned(),
        );
        info.capabilities = ServerCapabilities::builder().enable_tools().build();
        info
    }
}

/// Tool implementation methods
///
/// Private methods handle the actual business logic for each tool, separated
/// from the public `#[tool]` methods that handle response formatting. The
/// account-management methods are shared with the `accounts` CLI.
impl GmailMcpServer {
    /// Run `op` with a valid credential for the selected account
    ///
    /// Errors after selection are annotated with the account. The account's
    /// `last_used_at` advances only when `op` succeeds.
    async fn with_account<T, F, Fut>(&self, explicit: Option<&str>, op: F) -> AppResult<T>
    where
        F: FnOnce(CredentialRecord) -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let email = selector::select(&self.registry, explicit).await?;
        let result = async {
            let credential = self.guard.ensure_valid(&self.registry, &email).await?;
            op(credential).await
        }
        .await
        .map_err(|e| e.for_account(&email));

        match &result {
            Ok(_) => self.registry.touch(&email).await,
            Err(e) => tracing::warn!(account = %email, kind = e.kind(), error = %e, "mail operation failed"),
        }
        result
    }

    async fn bounded<T>(&self, what: &str, fut: impl Future<Output = AppResult<T>>) -> AppResult<T> {
        bounded(self.config.operation_timeout(), what, fut).await
    }

    async fn send_email_impl(&self, input: SendEmailInput) -> AppResult<SendResult> {
        let message = OutgoingMessage {
            to: input.to,
            cc: input.cc,
            bcc: input.bcc,
            subject: input.subject,
            body: input.body,
            html_body: input.html_body,
        };
        let raw = compose::encode_raw(&compose::build_raw_message(&message)?);

        self.with_account(input.account.as_deref(), |credential| async move {
            let sent = self.mail.send(&credential.access_token, &raw).await?;
            tracing::info!(account = %credential.account_email, id = %sent.id, "message sent");
            Ok(SendResult {
                account: credential.account_email,
                id: sent.id,
                thread_id: sent.thread_id,
                label_ids: sent.label_ids,
            })
        })
        .await
    }

    async fn search_emails_impl(&self, input: SearchEmailsInput) -> AppResult<SearchResult> {
        validate_range(input.max_results, 1, MAX_SEARCH_RESULTS, "max_results")?;
        validate_no_controls(&input.query, "query")?;
        validate_chars(input.query.chars().count(), 0, 2_048, "query length")?;
        if let Some(token) = &input.page_token {
            validate_no_controls(token, "page_token")?;
        }
        let query = ListQuery {
            query: input.query.trim().to_owned(),
            max_results: input.max_results,
            page_token: input.page_token.filter(|t| !t.is_empty()),
        };

        self.with_account(input.account.as_deref(), |credential| async move {
            let token = credential.access_token.as_str();
            let list = self.mail.list(token, &query).await?;
            let fetched = try_join_all(
                list.messages
                    .iter()
                    .map(|m| self.mail.get_metadata(token, &m.id)),
            )
            .await?;

            Ok(SearchResult {
                messages: fetched.into_iter().map(summarize).collect(),
                next_page_token: list.next_page_token,
                result_size_estimate: list.result_size_estimate,
                account: credential.account_email,
            })
        })
        .await
    }

    async fn read_email_impl(&self, input: ReadEmailInput) -> AppResult<EmailMessage> {
        validate_message_id(&input.message_id)?;
        validate_chars(input.body_max_chars, 100, 50_000, "body_max_chars")?;

        self.with_account(input.account.as_deref(), |credential| async move {
            let message = self
                .mail
                .get_raw(&credential.access_token, &input.message_id)
                .await?;
            let raw = message.raw.as_deref().ok_or_else(|| AppError::MailApi {
                status: None,
                message: "message response did not include the raw source".to_owned(),
            })?;
            let bytes = mime::decode_raw(raw)?;
            let parsed = mime::parse_message(&bytes, input.body_max_chars, input.include_html)?;

            let mut attachments = parsed.attachments;
            attachments.truncate(MAX_ATTACHMENTS);
            Ok(EmailMessage {
                account: credential.account_email,
                id: message.id,
                thread_id: message.thread_id,
                label_ids: message.label_ids,
                date: parsed.date,
                from: parsed.from,
                to: parsed.to,
                cc: parsed.cc,
                subject: parsed.subject,
                headers: mime::curated_headers(&parsed.headers_all, input.include_all_headers),
                body_text: parsed.body_text,
                body_html: parsed.body_html_sanitized,
                truncated: parsed.truncated,
                attachments,
            })
        })
        .await
    }

    async fn manage_labels_impl(&self, input: ManageLabelsInput) -> AppResult<LabelResult> {
        require_modify_enabled(&self.config)?;
        validate_message_id(&input.message_id)?;
        validate_label_changes(&input.add_labels, &input.remove_labels)?;
        let request = ModifyRequest {
            add_label_ids: input.add_labels,
            remove_label_ids: input.remove_labels,
        };

        self.with_account(input.account.as_deref(), |credential| async move {
            if !credential.has_scope(SCOPE_MODIFY) {
                return Err(AppError::invalid(format!(
                    "account {} was authorized without the gmail.modify scope; remove it and add it again with GMAIL_MCP_ENABLE_MODIFY=true",
                    credential.account_email
                )));
            }
            let message = self
                .mail
                .modify(&credential.access_token, &input.message_id, &request)
                .await?;
            Ok(LabelResult {
                account: credential.account_email,
                id: message.id,
                label_ids: message.label_ids,
            })
        })
        .await
    }

    async fn list_accounts_impl(&self) -> AccountList {
        AccountList::from_entries(&self.registry.list().await)
    }

    pub(crate) async fn add_account_impl(&self, input: AddAccountInput) -> AppResult<AddAccountResult> {
        let grant = self.consent.authorize().await?;
        let profile = self.mail.profile(&grant.access_token).await?;
        let email = normalize_email(&profile.email_address);
        if self.registry.contains(&email).await {
            return Err(AppError::DuplicateAccount(email));
        }

        let record = CredentialRecord {
            account_email: email,
            client_id: self.config.oauth.client_id.clone(),
            client_secret: self.config.oauth.client_secret.expose_secret().to_owned(),
            refresh_token: grant.refresh_token,
            access_token: grant.access_token,
            expires_at: grant.expires_at,
            scopes: grant.scopes.clone(),
        };
        let entry = self.registry.add(record, input.make_default).await?;
        tracing::info!(account = %entry.email, is_default = entry.is_default, "account added");
        Ok(AddAccountResult {
            account: AccountInfo::from(&entry),
            scopes: grant.scopes,
            authorization_url: grant.authorization_url,
        })
    }

    pub(crate) async fn remove_account_impl(
        &self,
        input: AccountEmailInput,
    ) -> AppResult<RemoveAccountResult> {
        validate_account_email(&input.email)?;
        let outcome = self.registry.remove(&input.email).await?;
        let warning = outcome.was_default.then(|| {
            "the removed account was the default; calls without `account` fail until set_default_account is used".to_owned()
        });
        Ok(RemoveAccountResult {
            email: outcome.entry.email,
            removed: true,
            was_default: outcome.was_default,
            warning,
        })
    }

    pub(crate) async fn set_default_account_impl(
        &self,
        input: AccountEmailInput,
    ) -> AppResult<AccountInfo> {
        validate_account_email(&input.email)?;
        let entry = self.registry.set_default(&input.email).await?;
        Ok(AccountInfo::from(&entry))
    }
}

/// Bound a future by `limit`
async fn bounded<T>(
    limit: Duration,
    what: &str,
    fut: impl Future<Output = AppResult<T>>,
) -> AppResult<T> {
    tokio::time::timeout(limit, fut).await.map_err(|_| {
        AppError::OperationTimeout(format!("{what} did not finish within {} ms", limit.as_millis()))
    })?
}

/// Calculate elapsed milliseconds
fn duration_ms(started: Instant) -> u64 {
    started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64
}

/// Build a standardized MCP tool response envelope from business logic output
fn finalize_tool<T>(
    started: Instant,
    result: AppResult<(String, T)>,
) -> Result<Json<ToolEnvelope<T>>, ErrorData>
where
    T: schemars::JsonSchema,
{
    match result {
        Ok((summary, data)) => Ok(Json(ToolEnvelope {
            summary,
            data,
            meta: Meta::now(duration_ms(started)),
        })),
        Err(e) => Err(e.to_error_data()),
    }
}

/// Search hit from a metadata response; missing headers become empty strings
fn summarize(message: GmailMessage) -> EmailSummary {
    let header = |name: &str| message.header(name).unwrap_or_default().to_owned();
    EmailSummary {
        subject: header("Subject"),
        from: header("From"),
        date: header("Date"),
        snippet: message.snippet.clone().unwrap_or_default(),
        id: message.id.clone(),
        thread_id: message.thread_id.clone(),
        label_ids: message.label_ids.clone(),
    }
}

fn validate_account_email(email: &str) -> AppResult<()> {
    if email.trim().is_empty() {
        return Err(AppError::invalid("email must not be empty"));
    }
    validate_no_controls(email, "email")
}

/// Gmail ids are opaque URL-safe tokens
fn validate_message_id(message_id: &str) -> AppResult<()> {
    if message_id.is_empty() || message_id.len() > 256 {
        return Err(AppError::InvalidInput(
            "message_id must be 1..256 characters".to_owned(),
        ));
    }
    if !message_id
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-')
    {
        return Err(AppError::InvalidInput(
            "message_id must match [A-Za-z0-9_-]+".to_owned(),
        ));
    }
    Ok(())
}

/// Reject control characters in user-provided values
fn validate_no_controls(value: &str, field: &str) -> AppResult<()> {
    if value.chars().any(char::is_control) {
        return Err(AppError::InvalidInput(format!(
            "{field} must not contain control characters"
        )));
    }
    Ok(())
}

/// Validate numeric value in range
fn validate_chars(value: usize, min: usize, max: usize, field: &str) -> AppResult<()> {
    validate_range(value, min, max, field)
}

fn validate_range<N>(value: N, min: N, max: N, field: &str) -> AppResult<()>
where
    N: PartialOrd + std::fmt::Display,
{
    if value < min || value > max {
        return Err(AppError::InvalidInput(format!(
            "{field} must be in range {min}..{max}"
        )));
    }
    Ok(())
}

fn validate_label_changes(add: &[String], remove: &[String]) -> AppResult<()> {
    if add.is_empty() && remove.is_empty() {
        return Err(AppError::invalid(
            "at least one of add_labels or remove_labels must be non-empty",
        ));
    }
    if add.len() + remove.len() > MAX_LABELS {
        return Err(AppError::invalid(format!(
            "at most {MAX_LABELS} label changes per call"
        )));
    }
    for (field, labels) in [("add_labels", add), ("remove_labels", remove)] {
        for label in labels {
            validate_label(label).map_err(|_| {
                AppError::InvalidInput(format!(
                    "{field} contains invalid label '{label}'; labels are 1..128 characters without control characters"
                ))
            })?;
        }
    }
    if let Some(both) = add.iter().find(|l| remove.contains(l)) {
        return Err(AppError::invalid(format!(
            "label '{both}' cannot be both added and removed"
        )));
    }
    Ok(())
}

fn validate_label(label: &str) -> AppResult<()> {
    if label.trim().is_empty() || label.chars().count() > 128 {
        return Err(AppError::InvalidInput("invalid label".to_owned()));
    }
    validate_no_controls(label, "label")
}

fn require_modify_enabled(config: &ServerConfig) -> AppResult<()> {
    if !config.enable_modify {
        return Err(AppError::InvalidInput(
            "label changes are disabled; set GMAIL_MCP_ENABLE_MODIFY=true and re-add the account"
                .to_owned(),
        ));
    }
    Ok(())
}
