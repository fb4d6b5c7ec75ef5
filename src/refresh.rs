//! Token refresh guard
//!
//! Guarantees that a credential handed to the Gmail client carries an
//! access token that has not reached its expiry. Per request the guard
//! moves `Valid → Refreshing → Valid | ReauthRequired`:
//!
//! - a token is refreshed when `now >= expires_at` (inclusive) or empty;
//! - transient failures (network, timeout, 5xx, 429) are retried with
//!   bounded exponential backoff, then surfaced as `RefreshTransient`;
//! - terminal failures (`invalid_grant` and other 4xx) surface at once as
//!   `ReauthenticationRequired`; the guard never starts a consent flow.
//!
//! Refreshes are serialized per account: a caller that waited for another
//! caller's refresh reuses its outcome (the fresh token, or the failure)
//! instead of issuing a second exchange.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::ServerConfig;
use crate::errors::{AppError, AppResult};
use crate::registry::{AccountRegistry, normalize_email};
use crate::store::CredentialRecord;

/// Lifetime assumed when the token endpoint omits `expires_in`
const DEFAULT_TOKEN_LIFETIME_SECS: u64 = 3_600;
/// Tokens are treated as expired this long before their real expiry
const MAX_EXPIRY_SKEW_SECS: u64 = 60;
/// Largest lifetime `TimeDelta` can represent
const MAX_TOKEN_LIFETIME_SECS: u64 = i64::MAX as u64 / 1_000;

/// New access token issued by the token endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    pub expires_in: Duration,
    /// Present when the provider rotates refresh tokens
    pub refresh_token: Option<String>,
    /// Space-separated scopes as granted, when reported
    pub scope: Option<String>,
}

/// Classified refresh failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RefreshFailure {
    /// Worth retrying: network failure, timeout, 5xx, throttling
    #[error("{0}")]
    Transient(String),
    /// Refresh token unusable; only re-consent helps
    #[error("{0}")]
    Terminal(String),
}

/// OAuth token endpoint able to exchange a refresh token
pub trait TokenEndpoint: Send + Sync {
    fn refresh<'a>(
        &'a self,
        credential: &'a CredentialRecord,
    ) -> BoxFuture<'a, Result<TokenGrant, RefreshFailure>>;
}

/// Standard OAuth 2.0 token endpoint reached over HTTPS
#[derive(Debug, Clone)]
pub struct GoogleTokenEndpoint {
    http: reqwest::Client,
    token_url: String,
}

impl GoogleTokenEndpoint {
    pub fn new(http: reqwest::Client, token_url: impl Into<String>) -> Self {
        Self {
            http,
            token_url: token_url.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OAuthErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

impl TokenEndpoint for GoogleTokenEndpoint {
    fn refresh<'a>(
        &'a self,
        credential: &'a CredentialRecord,
    ) -> BoxFuture<'a, Result<TokenGrant, RefreshFailure>> {
        async move {
            let form = [
                ("grant_type", "refresh_token"),
                ("refresh_token", credential.refresh_token.as_str()),
                ("client_id", credential.client_id.as_str()),
                ("client_secret", credential.client_secret.as_str()),
            ];
            let response = self
                .http
                .post(&self.token_url)
                .header(reqwest::header::ACCEPT, "application/json")
                .form(&form)
                .send()
                .await
                .map_err(|e| RefreshFailure::Transient(format!("token request failed: {e}")))?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(classify_failure(status.as_u16(), &body));
            }

            let token: TokenResponse = response.json().await.map_err(|e| {
                RefreshFailure::Transient(format!("unreadable token response: {e}"))
            })?;
            Ok(TokenGrant {
                access_token: token.access_token,
                expires_in: Duration::from_secs(
                    token.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS),
                ),
                refresh_token: token.refresh_token.filter(|t| !t.is_empty()),
                scope: token.scope,
            })
        }
        .boxed()
    }
}

/// Classify a non-2xx token endpoint response
///
/// 5xx, 408 and 429 are transient; every other status (notably 400/401
/// with `invalid_grant`) is terminal.
pub fn classify_failure(status: u16, body: &str) -> RefreshFailure {
    let detail = match serde_json::from_str::<OAuthErrorBody>(body) {
        Ok(err) => match err.error_description {
            Some(desc) if !desc.is_empty() => format!("{}: {desc}", err.error),
            _ => err.error,
        },
        Err(_) => body.chars().take(200).collect(),
    };
    let message = format!("token endpoint returned HTTP {status}: {detail}");
    if status >= 500 || status == 408 || status == 429 {
        RefreshFailure::Transient(message)
    } else {
        RefreshFailure::Terminal(message)
    }
}

/// Bounded exponential backoff for transient refresh failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            max_attempts: config.refresh_max_attempts.max(1),
            base_delay: Duration::from_millis(config.refresh_base_delay_ms),
        }
    }

    /// Delay after failed attempt `attempt` (1-based): base, 2×base, 4×base…
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

/// Most recent failed refresh of an account, replayed to callers that
/// queued behind it
#[derive(Debug, Clone)]
enum FailedRefresh {
    Reauth(String),
    Transient(String),
}

impl FailedRefresh {
    fn from_error(error: &AppError) -> Option<Self> {
        match error {
            AppError::ReauthenticationRequired { message, .. } => {
                Some(Self::Reauth(message.clone()))
            }
            AppError::RefreshTransient { message, .. } => Some(Self::Transient(message.clone())),
            _ => None,
        }
    }

    fn to_error(&self, email: &str) -> AppError {
        match self {
            Self::Reauth(message) => reauth_required(email, message),
            Self::Transient(message) => AppError::RefreshTransient {
                account: email.to_owned(),
                message: message.clone(),
            },
        }
    }
}

/// Per-account refresh serialization
#[derive(Debug, Default)]
struct RefreshSlot {
    /// Refreshes completed on this slot; bumped while `last_failure` is held
    finished: AtomicU64,
    last_failure: Mutex<Option<FailedRefresh>>,
}

/// Ensures access tokens are valid before use
pub struct TokenRefreshGuard {
    endpoint: Arc<dyn TokenEndpoint>,
    policy: RetryPolicy,
    /// Slots exist only while a refresh is pending; accounts never contend
    slots: Mutex<HashMap<String, Arc<RefreshSlot>>>,
}

impl TokenRefreshGuard {
    pub fn new(endpoint: Arc<dyn TokenEndpoint>, policy: RetryPolicy) -> Self {
        Self {
            endpoint,
            policy,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Return a credential whose access token is not expired
    ///
    /// Callers that wait on another caller's refresh receive its outcome,
    /// success or failure, instead of starting their own exchange.
    ///
    /// # Errors
    ///
    /// - `UnknownAccount` if the account is not registered
    /// - `ReauthenticationRequired` if the refresh token is missing or
    ///   rejected
    /// - `RefreshTransient` if every attempt failed transiently
    /// - `Storage` if the refreshed credential cannot be persisted
    /// - `Internal` if the token endpoint reported an unusable lifetime
    pub async fn ensure_valid(
        &self,
        registry: &AccountRegistry,
        email: &str,
    ) -> AppResult<CredentialRecord> {
        let email = normalize_email(email);
        let current = registry.credential(&email).await?;
        if !current.is_usable() {
            return Err(reauth_required(&email, "no refresh token is stored"));
        }
        if !current.needs_refresh(Utc::now()) {
            return Ok(current);
        }

        let slot = self.acquire_slot(&email).await;
        let result = self.refresh_serialized(registry, &email, &slot).await;
        self.release_slot(&email, slot).await;
        result
    }

    async fn refresh_serialized(
        &self,
        registry: &AccountRegistry,
        email: &str,
        slot: &RefreshSlot,
    ) -> AppResult<CredentialRecord> {
        let seen = slot.finished.load(Ordering::Acquire);
        let mut last_failure = slot.last_failure.lock().await;

        let current = registry.credential(email).await?;
        if !current.needs_refresh(Utc::now()) {
            tracing::debug!(account = %email, "token already refreshed by a concurrent call");
            return Ok(current);
        }
        if slot.finished.load(Ordering::Acquire) != seen
            && let Some(failure) = last_failure.as_ref()
        {
            tracing::debug!(account = %email, "concurrent refresh failed; sharing its outcome");
            return Err(failure.to_error(email));
        }

        let result = self.refresh_and_store(registry, email, current).await;
        *last_failure = result.as_ref().err().and_then(FailedRefresh::from_error);
        slot.finished.fetch_add(1, Ordering::AcqRel);
        result
    }

    async fn refresh_and_store(
        &self,
        registry: &AccountRegistry,
        email: &str,
        current: CredentialRecord,
    ) -> AppResult<CredentialRecord> {
        let grant = self.refresh_with_retry(email, &current).await?;
        let updated = apply_grant(current, grant)?;
        registry.update_credential(updated.clone()).await?;
        tracing::info!(account = %email, expires_at = %updated.expires_at, "access token refreshed");
        Ok(updated)
    }

    async fn acquire_slot(&self, email: &str) -> Arc<RefreshSlot> {
        let mut slots = self.slots.lock().await;
        Arc::clone(slots.entry(email.to_owned()).or_default())
    }

    /// Drop the slot once no other caller holds it
    async fn release_slot(&self, email: &str, slot: Arc<RefreshSlot>) {
        let mut slots = self.slots.lock().await;
        let idle = slots
            .get(email)
            .is_some_and(|held| Arc::ptr_eq(held, &slot) && Arc::strong_count(&slot) == 2);
        if idle {
            slots.remove(email);
        }
    }

    async fn refresh_with_retry(
        &self,
        email: &str,
        credential: &CredentialRecord,
    ) -> AppResult<TokenGrant> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.endpoint.refresh(credential).await {
                Ok(grant) => return Ok(grant),
                Err(RefreshFailure::Terminal(message)) => {
                    tracing::warn!(account = %email, error = %message, "refresh token rejected; re-authorization required");
                    return Err(reauth_required(email, &message));
                }
                Err(RefreshFailure::Transient(message)) => {
                    if attempt >= self.policy.max_attempts {
                        tracing::error!(account = %email, attempts = attempt, error = %message, "token refresh failed");
                        return Err(AppError::RefreshTransient {
                            account: email.to_owned(),
                            message,
                        });
                    }
                    let delay = self.policy.delay_after(attempt);
                    tracing::warn!(
                        account = %email,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "token refresh failed transiently, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

fn reauth_required(email: &str, message: &str) -> AppError {
    AppError::ReauthenticationRequired {
        account: email.to_owned(),
        message: message.to_owned(),
    }
}

/// Install a grant into a credential
///
/// # Errors
///
/// `Internal` if the reported lifetime does not fit a timestamp.
fn apply_grant(mut credential: CredentialRecord, grant: TokenGrant) -> AppResult<CredentialRecord> {
    let lifetime = grant.expires_in.as_secs().min(MAX_TOKEN_LIFETIME_SECS);
    let skew = MAX_EXPIRY_SKEW_SECS.min(lifetime / 2);
    let expires_at = i64::try_from(lifetime - skew)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .and_then(|valid_for| Utc::now().checked_add_signed(valid_for))
        .ok_or_else(|| {
            AppError::Internal(format!(
                "token endpoint reported an unusable lifetime of {}s",
                grant.expires_in.as_secs()
            ))
        })?;
    credential.access_token = grant.access_token;
    credential.expires_at = expires_at;
    if let Some(refresh_token) = grant.refresh_token {
        credential.refresh_token = refresh_token;
    }
    if let Some(scope) = grant.scope {
        credential.scopes = scope.split_whitespace().map(str::to_owned).collect();
    }
    Ok(credential)
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use chrono::Utc;
    use futures::FutureExt;
    use futures::future::BoxFuture;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::{
        GoogleTokenEndpoint, RefreshFailure, RetryPolicy, TokenEndpoint, TokenGrant,
        TokenRefreshGuard, apply_grant, classify_failure,
    };
    use crate::errors::AppError;
    use crate::registry::AccountRegistry;
    use crate::store::tests::record;
    use crate::store::{CredentialRecord, CredentialStore};

    /// Token endpoint replaying scripted outcomes and counting calls
    struct ScriptedEndpoint {
        calls: AtomicUsize,
        delay: Duration,
        script: std::sync::Mutex<VecDeque<Result<TokenGrant, RefreshFailure>>>,
    }

    impl ScriptedEndpoint {
        fn new(delay: Duration, script: Vec<Result<TokenGrant, RefreshFailure>>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay,
                script: std::sync::Mutex::new(script.into()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl TokenEndpoint for ScriptedEndpoint {
        fn refresh<'a>(
            &'a self,
            _credential: &'a CredentialRecord,
        ) -> BoxFuture<'a, Result<TokenGrant, RefreshFailure>> {
            async move {
                let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::time::sleep(self.delay).await;
                self.script
                    .lock()
                    .expect("script lock")
                    .pop_front()
                    .unwrap_or_else(|| Ok(grant(&format!("fresh-{n}"))))
            }
            .boxed()
        }
    }

    fn grant(token: &str) -> TokenGrant {
        TokenGrant {
            access_token: token.to_owned(),
            expires_in: Duration::from_secs(3_600),
            refresh_token: None,
            scope: None,
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
        }
    }

    async fn registry_with(dir: &tempfile::TempDir, rec: CredentialRecord) -> AccountRegistry {
        let reg = AccountRegistry::load(CredentialStore::new(dir.path()))
            .await
            .expect("registry must load");
        reg.add(rec, None).await.expect("add");
        reg
    }

    fn expired(email: &str) -> CredentialRecord {
        let mut rec = record(email);
        rec.expires_at = Utc::now() - chrono::Duration::minutes(5);
        rec
    }

    #[tokio::test]
    async fn valid_token_is_returned_without_refresh() {
        let dir = tempfile::tempdir().expect("tempdir");
        let reg = registry_with(&dir, record("a@x.com")).await;
        let endpoint = ScriptedEndpoint::new(Duration::ZERO, vec![]);
        let guard = TokenRefreshGuard::new(endpoint.clone(), fast_policy());

        let cred = guard.ensure_valid(&reg, "a@x.com").await.expect("valid");
        assert_eq!(cred.access_token, "access-a@x.com");
        assert_eq!(endpoint.calls(), 0);
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_and_persisted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let reg = registry_with(&dir, expired("a@x.com")).await;
        let endpoint = ScriptedEndpoint::new(Duration::ZERO, vec![Ok(grant("new-token"))]);
        let guard = TokenRefreshGuard::new(endpoint.clone(), fast_policy());

        let cred = guard.ensure_valid(&reg, "a@x.com").await.expect("refreshed");
        assert_eq!(cred.access_token, "new-token");
        assert!(cred.expires_at > Utc::now());
        assert_eq!(endpoint.calls(), 1);

        let on_disk = CredentialStore::new(dir.path())
            .load("a@x.com")
            .await
            .expect("load")
            .expect("present");
        assert_eq!(on_disk.access_token, "new-token");
    }

    #[tokio::test]
    async fn token_expiring_exactly_now_is_refreshed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut rec = record("a@x.com");
        rec.expires_at = Utc::now();
        let reg = registry_with(&dir, rec).await;
        let endpoint = ScriptedEndpoint::new(Duration::ZERO, vec![]);
        let guard = TokenRefreshGuard::new(endpoint.clone(), fast_policy());

        guard.ensure_valid(&reg, "a@x.com").await.expect("refreshed");
        assert_eq!(endpoint.calls(), 1);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let dir = tempfile::tempdir().expect("tempdir");
        let reg = registry_with(&dir, expired("a@x.com")).await;
        let endpoint = ScriptedEndpoint::new(Duration::from_millis(50), vec![]);
        let guard = TokenRefreshGuard::new(endpoint.clone(), fast_policy());

        let (first, second) = tokio::join!(
            guard.ensure_valid(&reg, "a@x.com"),
            guard.ensure_valid(&reg, "a@x.com"),
        );

        assert_eq!(endpoint.calls(), 1);
        assert_eq!(first.expect("first").access_token, "fresh-1");
        assert_eq!(second.expect("second").access_token, "fresh-1");
    }

    #[tokio::test]
    async fn different_accounts_refresh_independently() {
        let dir = tempfile::tempdir().expect("tempdir");
        let reg = registry_with(&dir, expired("a@x.com")).await;
        reg.add(expired("b@x.com"), None).await.expect("add");
        let endpoint = ScriptedEndpoint::new(Duration::from_millis(10), vec![]);
        let guard = TokenRefreshGuard::new(endpoint.clone(), fast_policy());

        let (a, b) = tokio::join!(
            guard.ensure_valid(&reg, "a@x.com"),
            guard.ensure_valid(&reg, "b@x.com"),
        );
        a.expect("a");
        b.expect("b");
        assert_eq!(endpoint.calls(), 2);
    }

    #[tokio::test]
    async fn invalid_grant_requires_reauthentication_without_retry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let reg = registry_with(&dir, expired("a@x.com")).await;
        let endpoint = ScriptedEndpoint::new(
            Duration::ZERO,
            vec![Err(classify_failure(
                400,
                r#"{"error":"invalid_grant","error_description":"Token has been expired or revoked."}"#,
            ))],
        );
        let guard = TokenRefreshGuard::new(endpoint.clone(), fast_policy());

        let err = guard
            .ensure_valid(&reg, "a@x.com")
            .await
            .expect_err("must require re-auth");
        assert!(matches!(err, AppError::ReauthenticationRequired { ref account, .. } if account == "a@x.com"));
        assert!(err.to_string().contains("invalid_grant"));
        assert_eq!(endpoint.calls(), 1);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_up_to_the_bound() {
        let dir = tempfile::tempdir().expect("tempdir");
        let reg = registry_with(&dir, expired("a@x.com")).await;
        let transient = || Err(RefreshFailure::Transient("HTTP 503".to_owned()));
        let endpoint =
            ScriptedEndpoint::new(Duration::ZERO, vec![transient(), transient(), transient()]);
        let guard = TokenRefreshGuard::new(endpoint.clone(), fast_policy());

        let err = guard
            .ensure_valid(&reg, "a@x.com")
            .await
            .expect_err("must give up");
        assert!(matches!(err, AppError::RefreshTransient { .. }));
        assert_eq!(endpoint.calls(), 3);

        let stored = reg.credential("a@x.com").await.expect("credential");
        assert_eq!(stored.access_token, "access-a@x.com");
    }

    #[tokio::test]
    async fn transient_failure_then_success_recovers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let reg = registry_with(&dir, expired("a@x.com")).await;
        let endpoint = ScriptedEndpoint::new(
            Duration::ZERO,
            vec![
                Err(RefreshFailure::Transient("connection reset".to_owned())),
                Ok(grant("second-try")),
            ],
        );
        let guard = TokenRefreshGuard::new(endpoint.clone(), fast_policy());

        let cred = guard.ensure_valid(&reg, "a@x.com").await.expect("recovered");
        assert_eq!(cred.access_token, "second-try");
        assert_eq!(endpoint.calls(), 2);
    }

    #[tokio::test]
    async fn concurrent_callers_share_a_rejected_refresh() {
        let dir = tempfile::tempdir().expect("tempdir");
        let reg = registry_with(&dir, expired("a@x.com")).await;
        let endpoint = ScriptedEndpoint::new(
            Duration::from_millis(30),
            vec![Err(classify_failure(400, r#"{"error":"invalid_grant"}"#))],
        );
        let guard = TokenRefreshGuard::new(endpoint.clone(), fast_policy());

        let (first, second) = tokio::join!(
            guard.ensure_valid(&reg, "a@x.com"),
            guard.ensure_valid(&reg, "a@x.com"),
        );

        assert_eq!(endpoint.calls(), 1);
        for result in [first, second] {
            let err = result.expect_err("both callers must see the rejection");
            assert!(matches!(err, AppError::ReauthenticationRequired { ref account, .. } if account == "a@x.com"));
        }
    }

    #[tokio::test]
    async fn concurrent_callers_share_exhausted_retries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let reg = registry_with(&dir, expired("a@x.com")).await;
        let transient = || Err(RefreshFailure::Transient("HTTP 503".to_owned()));
        let endpoint = ScriptedEndpoint::new(
            Duration::from_millis(10),
            vec![transient(), transient(), transient()],
        );
        let guard = TokenRefreshGuard::new(endpoint.clone(), fast_policy());

        let (first, second) = tokio::join!(
            guard.ensure_valid(&reg, "a@x.com"),
            guard.ensure_valid(&reg, "a@x.com"),
        );

        assert_eq!(endpoint.calls(), 3);
        assert!(matches!(first, Err(AppError::RefreshTransient { .. })));
        assert!(matches!(second, Err(AppError::RefreshTransient { .. })));
    }

    #[tokio::test]
    async fn later_call_retries_after_a_failed_refresh() {
        let dir = tempfile::tempdir().expect("tempdir");
        let reg = registry_with(&dir, expired("a@x.com")).await;
        let endpoint = ScriptedEndpoint::new(
            Duration::ZERO,
            vec![Err(RefreshFailure::Terminal("HTTP 401: invalid_client".to_owned()))],
        );
        let guard = TokenRefreshGuard::new(endpoint.clone(), fast_policy());

        guard
            .ensure_valid(&reg, "a@x.com")
            .await
            .expect_err("first call fails");
        let cred = guard.ensure_valid(&reg, "a@x.com").await.expect("second call refreshes");
        assert_eq!(cred.access_token, "fresh-2");
        assert_eq!(endpoint.calls(), 2);
    }

    #[tokio::test]
    async fn refresh_slots_are_dropped_when_idle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let reg = registry_with(&dir, expired("a@x.com")).await;
        let endpoint = ScriptedEndpoint::new(Duration::from_millis(10), vec![]);
        let guard = TokenRefreshGuard::new(endpoint, fast_policy());

        let (first, second) = tokio::join!(
            guard.ensure_valid(&reg, "a@x.com"),
            guard.ensure_valid(&reg, "a@x.com"),
        );
        first.expect("first");
        second.expect("second");
        assert!(guard.slots.lock().await.is_empty());
    }

    #[test]
    fn absurd_lifetime_is_an_error() {
        let mut huge = grant("new-access");
        huge.expires_in = Duration::from_secs(10_000_000_000_000_000);

        let err = apply_grant(record("a@x.com"), huge).expect_err("must not panic");
        assert!(matches!(err, AppError::Internal(_)));
    }

    #[tokio::test]
    async fn absurd_lifetime_leaves_stored_credential_untouched() {
        let dir = tempfile::tempdir().expect("tempdir");
        let reg = registry_with(&dir, expired("a@x.com")).await;
        let mut huge = grant("new-access");
        huge.expires_in = Duration::from_secs(u64::MAX);
        let endpoint = ScriptedEndpoint::new(Duration::ZERO, vec![Ok(huge)]);
        let guard = TokenRefreshGuard::new(endpoint, fast_policy());

        let err = guard.ensure_valid(&reg, "a@x.com").await.expect_err("unusable grant");
        assert_eq!(err.kind(), "internal");
        let stored = reg.credential("a@x.com").await.expect("credential");
        assert_eq!(stored.access_token, "access-a@x.com");
    }

    #[tokio::test]
    async fn rotated_refresh_token_is_kept() {
        let dir = tempfile::tempdir().expect("tempdir");
        let reg = registry_with(&dir, expired("a@x.com")).await;
        let mut rotated = grant("new-access");
        rotated.refresh_token = Some("new-refresh".to_owned());
        rotated.scope = Some("scope-a scope-b".to_owned());
        let endpoint = ScriptedEndpoint::new(Duration::ZERO, vec![Ok(rotated)]);
        let guard = TokenRefreshGuard::new(endpoint, fast_policy());

        let cred = guard.ensure_valid(&reg, "a@x.com").await.expect("refreshed");
        assert_eq!(cred.refresh_token, "new-refresh");
        assert_eq!(cred.scopes, vec!["scope-a", "scope-b"]);
    }

    #[test]
    fn backoff_doubles_from_base() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        };
        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after(3), Duration::from_secs(4));
    }

    #[test]
    fn classify_failure_separates_transient_from_terminal() {
        assert!(matches!(
            classify_failure(503, "Service Unavailable"),
            RefreshFailure::Transient(_)
        ));
        assert!(matches!(
            classify_failure(429, r#"{"error":"rate_limit_exceeded"}"#),
            RefreshFailure::Transient(_)
        ));
        assert!(matches!(
            classify_failure(400, r#"{"error":"invalid_grant"}"#),
            RefreshFailure::Terminal(_)
        ));
        assert!(matches!(
            classify_failure(401, r#"{"error":"invalid_client"}"#),
            RefreshFailure::Terminal(_)
        ));
    }

    #[tokio::test]
    async fn google_endpoint_parses_success_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=refresh-a%40x.com"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                r#"{"access_token":"ya29.new","expires_in":3599,"token_type":"Bearer","scope":"s1 s2"}"#,
                "application/json",
            ))
            .expect(1)
            .mount(&server)
            .await;

        let endpoint =
            GoogleTokenEndpoint::new(reqwest::Client::new(), format!("{}/token", server.uri()));
        let grant = endpoint
            .refresh(&record("a@x.com"))
            .await
            .expect("refresh must succeed");
        assert_eq!(grant.access_token, "ya29.new");
        assert_eq!(grant.expires_in, Duration::from_secs(3599));
        assert_eq!(grant.scope.as_deref(), Some("s1 s2"));
        assert!(grant.refresh_token.is_none());
    }

    #[tokio::test]
    async fn google_endpoint_classifies_error_responses() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/revoked"))
            .respond_with(ResponseTemplate::new(400).set_body_raw(
                r#"{"error":"invalid_grant","error_description":"Bad Request"}"#,
                "application/json",
            ))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/down"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let revoked =
            GoogleTokenEndpoint::new(reqwest::Client::new(), format!("{}/revoked", server.uri()));
        assert!(matches!(
            revoked.refresh(&record("a@x.com")).await,
            Err(RefreshFailure::Terminal(ref m)) if m.contains("invalid_grant")
        ));

        let down =
            GoogleTokenEndpoint::new(reqwest::Client::new(), format!("{}/down", server.uri()));
        assert!(matches!(
            down.refresh(&record("a@x.com")).await,
            Err(RefreshFailure::Transient(_))
        ));
    }
}
