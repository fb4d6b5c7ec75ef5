//! Configuration module for OAuth client identity and server settings
//!
//! All configuration is loaded from environment variables prefixed with
//! `GMAIL_MCP_`. The OAuth client identity comes either from
//! `GMAIL_MCP_CLIENT_ID`/`GMAIL_MCP_CLIENT_SECRET` or from a client secrets
//! JSON file downloaded from the Google Cloud console.

use std::env;
use std::env::VarError;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::errors::{AppError, AppResult};

/// Default Google authorization endpoint
pub const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
/// Default Google token endpoint
pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
/// Default Gmail REST API base
pub const GMAIL_API_BASE_URL: &str = "https://gmail.googleapis.com/gmail/v1";

/// Read-only mailbox access
pub const SCOPE_READONLY: &str = "https://www.googleapis.com/auth/gmail.readonly";
/// Send-only access
pub const SCOPE_SEND: &str = "https://www.googleapis.com/auth/gmail.send";
/// Label modification (no permanent deletion)
pub const SCOPE_MODIFY: &str = "https://www.googleapis.com/auth/gmail.modify";

/// OAuth application identity shared by every account of this installation
#[derive(Debug, Clone)]
pub struct OAuthClientConfig {
    /// OAuth client id
    pub client_id: String,
    /// OAuth client secret, kept out of `Debug` output
    pub client_secret: SecretString,
    /// Authorization endpoint used by the consent flow
    pub auth_url: String,
    /// Token endpoint used for code exchange and refresh
    pub token_url: String,
    /// Loopback port for the consent callback
    pub redirect_port: u16,
    /// Scopes requested during consent
    pub scopes: Vec<String>,
}

impl OAuthClientConfig {
    /// Loopback redirect URI registered for the consent callback
    pub fn redirect_uri(&self) -> String {
        format!("http://127.0.0.1:{}/callback", self.redirect_port)
    }
}

/// Server-wide configuration
///
/// Cloned into MCP tool handlers via `Arc` for shared access.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// OAuth client identity and endpoints
    pub oauth: OAuthClientConfig,
    /// Directory holding the account index and credential files
    pub data_dir: PathBuf,
    /// Gmail REST API base URL
    pub api_base_url: String,
    /// Whether the modify scope is requested (needed by `manage_labels`)
    pub enable_modify: bool,
    /// Upper bound for a single tool invocation in milliseconds
    pub operation_timeout_ms: u64,
    /// Per-request HTTP timeout in milliseconds
    pub http_timeout_ms: u64,
    /// How long `add_account` waits for the browser consent, in seconds
    pub consent_timeout_secs: u64,
    /// Token refresh attempts before a transient failure is surfaced
    pub refresh_max_attempts: u32,
    /// First backoff delay between refresh attempts in milliseconds
    pub refresh_base_delay_ms: u64,
}

impl ServerConfig {
    /// Load all configuration from environment variables
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if required environment variables are missing
    /// or malformed, or if the client secrets file cannot be read.
    ///
    /// # Example Environment
    ///
    /// ```text
    /// GMAIL_MCP_CLIENT_ID=1234.apps.googleusercontent.com
    /// GMAIL_MCP_CLIENT_SECRET=GOCSPX-...
    /// GMAIL_MCP_REDIRECT_PORT=8765
    /// GMAIL_MCP_ENABLE_MODIFY=true
    /// ```
    pub fn load_from_env() -> AppResult<Self> {
        let secrets_file = optional_env("GMAIL_MCP_CLIENT_SECRETS_FILE")?;
        let (client_id, client_secret, file_auth_url, file_token_url) = match secrets_file {
            Some(path) => {
                let secrets = read_client_secrets(Path::new(&path))?;
                (
                    secrets.client_id,
                    secrets.client_secret,
                    secrets.auth_uri,
                    secrets.token_uri,
                )
            }
            None => (
                required_env("GMAIL_MCP_CLIENT_ID")?,
                required_env("GMAIL_MCP_CLIENT_SECRET")?,
                None,
                None,
            ),
        };

        let enable_modify = parse_bool_env("GMAIL_MCP_ENABLE_MODIFY", true)?;
        let oauth = OAuthClientConfig {
            client_id,
            client_secret: SecretString::new(client_secret.into()),
            auth_url: optional_env("GMAIL_MCP_AUTH_URL")?
                .or(file_auth_url)
                .unwrap_or_else(|| GOOGLE_AUTH_URL.to_owned()),
            token_url: optional_env("GMAIL_MCP_TOKEN_URL")?
                .or(file_token_url)
                .unwrap_or_else(|| GOOGLE_TOKEN_URL.to_owned()),
            redirect_port: parse_u16_env("GMAIL_MCP_REDIRECT_PORT", 8765)?,
            scopes: requested_scopes(enable_modify),
        };

        let data_dir = data_dir_from_env()?;

        let refresh_max_attempts = parse_u32_env("GMAIL_MCP_REFRESH_MAX_ATTEMPTS", 3)?;
        if refresh_max_attempts == 0 {
            return Err(AppError::invalid(
                "GMAIL_MCP_REFRESH_MAX_ATTEMPTS must be at least 1",
            ));
        }

        Ok(Self {
            oauth,
            data_dir,
            api_base_url: optional_env("GMAIL_MCP_API_BASE_URL")?
                .unwrap_or_else(|| GMAIL_API_BASE_URL.to_owned()),
            enable_modify,
            operation_timeout_ms: parse_u64_env("GMAIL_MCP_OPERATION_TIMEOUT_MS", 60_000)?,
            http_timeout_ms: parse_u64_env("GMAIL_MCP_HTTP_TIMEOUT_MS", 30_000)?,
            consent_timeout_secs: parse_u64_env("GMAIL_MCP_CONSENT_TIMEOUT_SECS", 300)?,
            refresh_max_attempts,
            refresh_base_delay_ms: parse_u64_env("GMAIL_MCP_REFRESH_BASE_DELAY_MS", 1_000)?,
        })
    }

    /// Bound applied to one tool invocation
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// Bound applied to each HTTP request
    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    /// Bound applied to the browser consent wait
    pub fn consent_timeout(&self) -> Duration {
        Duration::from_secs(self.consent_timeout_secs)
    }
}

/// Scopes requested during consent
///
/// Read and send are always requested; modify only when label management is
/// enabled. The unrestricted `https://mail.google.com/` scope is never used.
pub fn requested_scopes(enable_modify: bool) -> Vec<String> {
    let mut scopes = vec![SCOPE_READONLY.to_owned(), SCOPE_SEND.to_owned()];
    if enable_modify {
        scopes.push(SCOPE_MODIFY.to_owned());
    }
    scopes
}

/// Default data directory outside the project tree
/// Data directory from `GMAIL_MCP_DATA_DIR`, or the platform default
///
/// Needs no OAuth settings, so read-only commands can use it alone.
pub fn data_dir_from_env() -> AppResult<PathBuf> {
    match optional_env("GMAIL_MCP_DATA_DIR")? {
        Some(dir) => Ok(PathBuf::from(dir)),
        None => default_data_dir(),
    }
}

fn default_data_dir() -> AppResult<PathBuf> {
    dirs::config_dir()
        .map(|dir| dir.join("gmail-mcp-rs"))
        .ok_or_else(|| {
            AppError::invalid("cannot determine a config directory; set GMAIL_MCP_DATA_DIR")
        })
}

/// Google client secrets file (`credentials.json` from the Cloud console)
#[derive(Debug, Deserialize)]
struct ClientSecretsFile {
    installed: Option<ClientSecrets>,
    web: Option<ClientSecrets>,
}

#[derive(Debug, Deserialize)]
struct ClientSecrets {
    client_id: String,
    client_secret: String,
    auth_uri: Option<String>,
    token_uri: Option<String>,
}

fn read_client_secrets(path: &Path) -> AppResult<ClientSecrets> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        AppError::InvalidInput(format!(
            "cannot read client secrets file {}: {e}",
            path.display()
        ))
    })?;
    parse_client_secrets(&raw)
}

fn parse_client_secrets(raw: &str) -> AppResult<ClientSecrets> {
    let file: ClientSecretsFile = serde_json::from_str(raw)
        .map_err(|e| AppError::InvalidInput(format!("malformed client secrets file: {e}")))?;
    file.installed.or(file.web).ok_or_else(|| {
        AppError::invalid("client secrets file has neither an `installed` nor a `web` section")
    })
}

/// Read a required environment variable, returning error if missing or empty
fn required_env(key: &str) -> AppResult<String> {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(AppError::InvalidInput(format!(
            "missing required environment variable {key}"
        ))),
    }
}

/// Read an optional environment variable; empty values count as unset
fn optional_env(key: &str) -> AppResult<Option<String>> {
    match env::var(key) {
        Ok(v) if v.trim().is_empty() => Ok(None),
        Ok(v) => Ok(Some(v.trim().to_owned())),
        Err(VarError::NotPresent) => Ok(None),
        Err(VarError::NotUnicode(_)) => Err(AppError::InvalidInput(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

/// Parse a boolean environment variable with flexible values
///
/// Accepts: `1`, `true`, `yes`, `y`, `on` (truthy) or `0`, `false`, `no`,
/// `n`, `off` (falsy). Case-insensitive. Returns `default` if unset.
///
/// # Errors
///
/// Returns `InvalidInput` if the variable is set to an unrecognized value.
fn parse_bool_env(key: &str, default: bool) -> AppResult<bool> {
    match env::var(key) {
        Ok(v) => parse_bool_value(&v).ok_or_else(|| {
            AppError::InvalidInput(format!("invalid boolean environment variable {key}: '{v}'"))
        }),
        Err(VarError::NotPresent) => Ok(default),
        Err(VarError::NotUnicode(_)) => Err(AppError::InvalidInput(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

fn parse_bool_value(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a numeric environment variable with default fallback
///
/// Returns `default` if unset.
///
/// # Errors
///
/// Returns `InvalidInput` if the variable is set but does not parse.
fn parse_num_env<T: std::str::FromStr>(key: &str, default: T, type_name: &str) -> AppResult<T> {
    match env::var(key) {
        Ok(v) => v.trim().parse::<T>().map_err(|_| {
            AppError::InvalidInput(format!(
                "invalid {type_name} environment variable {key}: '{v}'"
            ))
        }),
        Err(VarError::NotPresent) => Ok(default),
        Err(VarError::NotUnicode(_)) => Err(AppError::InvalidInput(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

fn parse_u16_env(key: &str, default: u16) -> AppResult<u16> {
    parse_num_env(key, default, "u16")
}

fn parse_u32_env(key: &str, default: u32) -> AppResult<u32> {
    parse_num_env(key, default, "u32")
}

fn parse_u64_env(key: &str, default: u64) -> AppResult<u64> {
    parse_num_env(key, default, "u64")
}

#[cfg(test)]
mod tests {
    use super::{
        SCOPE_MODIFY, SCOPE_READONLY, SCOPE_SEND, parse_bool_value, parse_client_secrets,
        requested_scopes,
    };

    #[test]
    fn parse_bool_value_accepts_common_truthy_and_falsy_values() {
        for truthy in ["1", "true", "TRUE", " yes ", "Y", "on"] {
            assert_eq!(parse_bool_value(truthy), Some(true));
        }

        for falsy in ["0", "false", "FALSE", " no ", "N", "off"] {
            assert_eq!(parse_bool_value(falsy), Some(false));
        }
    }

    #[test]
    fn parse_bool_value_rejects_unrecognized_values() {
        for invalid in ["", "2", "maybe", "enabled", "disabled"] {
            assert_eq!(parse_bool_value(invalid), None);
        }
    }

    #[test]
    fn scopes_never_include_full_mailbox_access() {
        let with_modify = requested_scopes(true);
        assert_eq!(with_modify, vec![SCOPE_READONLY, SCOPE_SEND, SCOPE_MODIFY]);
        assert!(!with_modify.iter().any(|s| s == "https://mail.google.com/"));

        let without_modify = requested_scopes(false);
        assert_eq!(without_modify, vec![SCOPE_READONLY, SCOPE_SEND]);
    }

    #[test]
    fn client_secrets_accepts_installed_and_web_sections() {
        let installed = r#"{"installed":{"client_id":"id-1","client_secret":"s-1","token_uri":"https://t"}}"#;
        let parsed = parse_client_secrets(installed).expect("installed section must parse");
        assert_eq!(parsed.client_id, "id-1");
        assert_eq!(parsed.token_uri.as_deref(), Some("https://t"));

        let web = r#"{"web":{"client_id":"id-2","client_secret":"s-2"}}"#;
        let parsed = parse_client_secrets(web).expect("web section must parse");
        assert_eq!(parsed.client_secret, "s-2");
        assert!(parsed.auth_uri.is_none());
    }

    #[test]
    fn client_secrets_without_known_section_is_rejected() {
        let err = parse_client_secrets(r#"{"other":{}}"#).expect_err("must fail");
        assert!(err.to_string().contains("installed"));
    }
}
