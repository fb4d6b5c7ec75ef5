//! Application error model with MCP error mapping
//!
//! Defines a typed error hierarchy using `thiserror` for internal error
//! handling, and maps each variant to the appropriate MCP `ErrorData` type.
//! Every mapped error carries a stable `kind` discriminator, the account it
//! concerns (when one was resolved) and a hint telling the caller what to do
//! next.

use rmcp::model::ErrorData;
use serde_json::{Map, Value, json};
use thiserror::Error;

/// Application error type
///
/// Covers every failure the Gmail MCP server surfaces. Each variant maps to
/// an MCP error code in [`ErrorData`] via [`AppError::to_error_data`].
#[derive(Debug, Error)]
pub enum AppError {
    /// No account argument and no default account configured
    #[error("no account specified and no default account is configured")]
    NoAccountSpecified,
    /// Account argument does not name a registered account
    #[error("unknown account '{0}'")]
    UnknownAccount(String),
    /// A default account was required but none is set
    #[error("no default account is configured")]
    NoDefault,
    /// `add` called for an already-registered email
    #[error("account '{0}' is already registered")]
    DuplicateAccount(String),
    /// Local persistence failure (I/O, serialization)
    #[error("storage error: {0}")]
    Storage(String),
    /// Persisted credential data could not be parsed
    #[error("corrupt credential data: {0}")]
    CorruptCredential(String),
    /// Token refresh kept failing transiently after all retries
    #[error("token refresh for '{account}' failed after retries: {message}")]
    RefreshTransient { account: String, message: String },
    /// Refresh token revoked or otherwise unusable; consent must be redone
    #[error("account '{account}' must be re-authorized: {message}")]
    ReauthenticationRequired { account: String, message: String },
    /// Recipient list empty or malformed
    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),
    /// Invalid user input (validation failed, malformed request)
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Tool call, HTTP request or consent wait exceeded its time bound
    #[error("operation timed out: {0}")]
    OperationTimeout(String),
    /// Gmail API returned an error; remote status preserved when known
    #[error("gmail api error{}: {message}", status_suffix(.status))]
    MailApi {
        status: Option<u16>,
        message: String,
    },
    /// Interactive consent flow failed or was denied
    #[error("authorization failed: {0}")]
    Consent(String),
    /// Internal error (unexpected failure, external crate error)
    #[error("internal error: {0}")]
    Internal(String),
    /// Any other error, annotated with the account it happened on
    #[error("{account}: {source}")]
    Scoped {
        account: String,
        #[source]
        source: Box<AppError>,
    },
}

impl AppError {
    /// Convenience constructor for `InvalidInput`
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Attach the resolved account to an error that does not already name one
    pub fn for_account(self, account: &str) -> Self {
        if self.account().is_some() {
            return self;
        }
        Self::Scoped {
            account: account.to_owned(),
            source: Box::new(self),
        }
    }

    /// Innermost error, skipping account annotations
    pub fn root(&self) -> &AppError {
        match self {
            Self::Scoped { source, .. } => source.root(),
            other => other,
        }
    }

    /// Account this error concerns, if one was resolved
    pub fn account(&self) -> Option<&str> {
        match self {
            Self::Scoped { account, .. }
            | Self::RefreshTransient { account, .. }
            | Self::ReauthenticationRequired { account, .. } => Some(account),
            Self::UnknownAccount(email) | Self::DuplicateAccount(email) => Some(email),
            _ => None,
        }
    }

    /// Stable discriminator exposed to MCP clients
    pub fn kind(&self) -> &'static str {
        match self.root() {
            Self::NoAccountSpecified => "no_account_specified",
            Self::UnknownAccount(_) => "unknown_account",
            Self::NoDefault => "no_default",
            Self::DuplicateAccount(_) => "duplicate_account",
            Self::Storage(_) => "storage",
            Self::CorruptCredential(_) => "corrupt_credential",
            Self::RefreshTransient { .. } => "refresh_transient",
            Self::ReauthenticationRequired { .. } => "reauthentication_required",
            Self::InvalidRecipient(_) => "invalid_recipient",
            Self::InvalidInput(_) => "invalid_input",
            Self::OperationTimeout(_) => "operation_timeout",
            Self::MailApi { .. } => "mail_api",
            Self::Consent(_) => "consent",
            Self::Internal(_) | Self::Scoped { .. } => "internal",
        }
    }

    /// What the caller should do next
    pub fn hint(&self) -> &'static str {
        match self.root() {
            Self::NoAccountSpecified | Self::NoDefault => {
                "pass an `account` argument or configure one with set_default_account"
            }
            Self::UnknownAccount(_) => {
                "call list_accounts to see registered accounts, or add_account to register it"
            }
            Self::DuplicateAccount(_) => "remove_account first if you want to re-authorize it",
            Self::Storage(_) => "check permissions and free space of the data directory",
            Self::CorruptCredential(_) | Self::ReauthenticationRequired { .. } => {
                "remove the account and run add_account again"
            }
            Self::RefreshTransient { .. } | Self::OperationTimeout(_) => "retry later",
            Self::InvalidRecipient(_) | Self::InvalidInput(_) => "fix the arguments and retry",
            Self::MailApi { status: Some(401 | 403), .. } => {
                "retry; if it persists, remove and re-add the account"
            }
            Self::MailApi { .. } => "inspect the remote status and retry later",
            Self::Consent(_) => "run add_account again and complete the browser consent",
            Self::Internal(_) | Self::Scoped { .. } => "retry; report the issue if it persists",
        }
    }

    /// Convert to MCP `ErrorData`
    ///
    /// # Mappings
    ///
    /// - input and resolution failures → `invalid_params`
    /// - unknown account / no default → `resource_not_found`
    /// - duplicate, re-auth, consent → `invalid_request`
    /// - everything else → `internal_error`
    pub fn to_error_data(&self) -> ErrorData {
        let mut data = Map::new();
        data.insert("kind".to_owned(), json!(self.kind()));
        data.insert("hint".to_owned(), json!(self.hint()));
        if let Some(account) = self.account() {
            data.insert("account".to_owned(), json!(account));
        }
        if let Self::MailApi {
            status: Some(status),
            ..
        } = self.root()
        {
            data.insert("status".to_owned(), json!(status));
        }
        let data = Some(Value::Object(data));
        let msg = self.to_string();

        match self.root() {
            Self::NoAccountSpecified | Self::InvalidRecipient(_) | Self::InvalidInput(_) => {
                ErrorData::invalid_params(msg, data)
            }
            Self::UnknownAccount(_) | Self::NoDefault => ErrorData::resource_not_found(msg, data),
            Self::DuplicateAccount(_) | Self::ReauthenticationRequired { .. } | Self::Consent(_) => {
                ErrorData::invalid_request(msg, data)
            }
            _ => ErrorData::internal_error(msg, data),
        }
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

/// Type alias for fallible return values
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::AppError;

    #[test]
    fn for_account_wraps_once_and_keeps_kind() {
        let err = AppError::MailApi {
            status: Some(404),
            message: "not found".to_owned(),
        }
        .for_account("a@x.com")
        .for_account("b@y.com");

        assert_eq!(err.account(), Some("a@x.com"));
        assert_eq!(err.kind(), "mail_api");
        assert!(err.to_string().contains("HTTP 404"));
    }

    #[test]
    fn reauth_error_data_names_account_and_next_step() {
        let err = AppError::ReauthenticationRequired {
            account: "a@x.com".to_owned(),
            message: "invalid_grant".to_owned(),
        };
        let data = err.to_error_data().data.expect("data must be present");

        assert_eq!(data["kind"], "reauthentication_required");
        assert_eq!(data["account"], "a@x.com");
        assert!(data["hint"].as_str().unwrap_or_default().contains("add_account"));
    }

    #[test]
    fn resolution_errors_have_no_account() {
        let data = AppError::NoAccountSpecified
            .to_error_data()
            .data
            .expect("data must be present");
        assert_eq!(data["kind"], "no_account_specified");
        assert!(data.get("account").is_none());
    }
}
