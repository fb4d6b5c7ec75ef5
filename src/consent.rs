//! Interactive OAuth consent
//!
//! Runs the authorization-code flow with PKCE against a loopback redirect:
//! a one-shot axum server on `127.0.0.1:<redirect_port>` receives the
//! callback, the CSRF state is checked, and the code is exchanged for an
//! access/refresh token pair. `access_type=offline` and `prompt=consent`
//! are always requested so Google issues a refresh token even for accounts
//! that consented before.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Html;
use axum::routing::get;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use oauth2::basic::BasicClient;
use oauth2::url::Url;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, PkceCodeChallenge,
    PkceCodeVerifier, RedirectUrl, Scope, TokenResponse, TokenUrl,
};
use secrecy::ExposeSecret;
use serde::Deserialize;
use tokio::sync::{Mutex, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config::OAuthClientConfig;
use crate::errors::{AppError, AppResult};

const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(3_600);

const SUCCESS_HTML: &str = r#"<!DOCTYPE html>
<html><head><meta charset="utf-8"><title>Gmail MCP: authorized</title></head>
<body><h1>Authorization complete</h1>
<p>The account is connected. You can close this tab.</p></body></html>"#;

const ERROR_HTML: &str = r#"<!DOCTYPE html>
<html><head><meta charset="utf-8"><title>Gmail MCP: authorization failed</title></head>
<body><h1>Authorization failed</h1>
<p>The account was not connected. Close this tab and try again.</p></body></html>"#;

/// Tokens obtained from a completed consent
#[derive(Clone, PartialEq, Eq)]
pub struct ConsentGrant {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub scopes: Vec<String>,
    /// URL the user was sent to
    pub authorization_url: String,
}

impl std::fmt::Debug for ConsentGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsentGrant")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("scopes", &self.scopes)
            .field("authorization_url", &self.authorization_url)
            .finish()
    }
}

/// Interactive authorization producing a fresh token pair
pub trait ConsentFlow: Send + Sync {
    fn authorize(&self) -> BoxFuture<'_, AppResult<ConsentGrant>>;
}

/// Browser consent with a loopback redirect listener
#[derive(Debug, Clone)]
pub struct LoopbackConsentFlow {
    oauth: OAuthClientConfig,
    timeout: Duration,
}

impl LoopbackConsentFlow {
    pub fn new(oauth: OAuthClientConfig, timeout: Duration) -> Self {
        Self { oauth, timeout }
    }

    fn client(&self) -> AppResult<BasicClient> {
        let auth_url = AuthUrl::new(self.oauth.auth_url.clone())
            .map_err(|e| AppError::invalid(format!("invalid authorization URL: {e}")))?;
        let token_url = TokenUrl::new(self.oauth.token_url.clone())
            .map_err(|e| AppError::invalid(format!("invalid token URL: {e}")))?;
        let redirect = RedirectUrl::new(self.oauth.redirect_uri())
            .map_err(|e| AppError::invalid(format!("invalid redirect URI: {e}")))?;
        Ok(BasicClient::new(
            ClientId::new(self.oauth.client_id.clone()),
            Some(ClientSecret::new(
                self.oauth.client_secret.expose_secret().to_owned(),
            )),
            auth_url,
            Some(token_url),
        )
        .set_redirect_uri(redirect))
    }

    /// Authorization URL with PKCE (S256), CSRF state and offline access
    fn authorization_request(
        &self,
        client: &BasicClient,
    ) -> (Url, CsrfToken, PkceCodeVerifier) {
        let (challenge, verifier) = PkceCodeChallenge::new_random_sha256();
        let (url, state) = client
            .authorize_url(CsrfToken::new_random)
            .add_scopes(self.oauth.scopes.iter().cloned().map(Scope::new))
            .add_extra_param("access_type", "offline")
            .add_extra_param("prompt", "consent")
            .set_pkce_challenge(challenge)
            .url();
        (url, state, verifier)
    }

    async fn run(&self) -> AppResult<ConsentGrant> {
        let client = self.client()?;
        let (url, csrf, verifier) = self.authorization_request(&client);

        let addr = format!("127.0.0.1:{}", self.oauth.redirect_port);
        let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
            AppError::Consent(format!(
                "cannot listen on {addr} for the OAuth callback (is the port in use?): {e}"
            ))
        })?;

        let (tx, rx) = oneshot::channel();
        let state = Arc::new(CallbackState {
            expected_state: csrf.secret().clone(),
            sender: Mutex::new(Some(tx)),
        });
        let shutdown = CancellationToken::new();
        let server = {
            let shutdown = shutdown.clone();
            let app = callback_router(state);
            tokio::spawn(async move {
                let result = axum::serve(listener, app)
                    .with_graceful_shutdown(async move { shutdown.cancelled().await })
                    .await;
                if let Err(e) = result {
                    tracing::warn!(error = %e, "consent callback server error");
                }
            })
        };

        tracing::info!(
            %url,
            redirect_uri = %self.oauth.redirect_uri(),
            "waiting for browser consent"
        );
        if let Err(e) = webbrowser::open(url.as_str()) {
            tracing::error!(%url, error = %e, "could not open a browser; open the URL manually");
        }

        let received = tokio::time::timeout(self.timeout, rx).await;
        shutdown.cancel();
        if let Err(e) = server.await {
            tracing::warn!(error = %e, "consent callback server task failed");
        }

        let params = match received {
            Ok(Ok(params)) => params,
            Ok(Err(_)) => {
                return Err(AppError::Consent(
                    "callback listener stopped before consent completed".to_owned(),
                ));
            }
            Err(_) => {
                return Err(AppError::OperationTimeout(format!(
                    "consent was not completed within {}s",
                    self.timeout.as_secs()
                )));
            }
        };
        let code = authorization_code(params)?;

        let token = client
            .exchange_code(AuthorizationCode::new(code))
            .set_pkce_verifier(verifier)
            .request_async(oauth2::reqwest::async_http_client)
            .await
            .map_err(|e| AppError::Consent(format!("authorization code exchange failed: {e}")))?;

        let refresh_token = token
            .refresh_token()
            .map(|t| t.secret().clone())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                AppError::Consent(
                    "no refresh token was issued; revoke the app's access in the Google account and retry"
                        .to_owned(),
                )
            })?;
        let lifetime = token.expires_in().unwrap_or(DEFAULT_TOKEN_LIFETIME);
        let expires_at = Utc::now()
            + chrono::Duration::from_std(lifetime)
                .map_err(|e| AppError::Internal(format!("token lifetime out of range: {e}")))?;
        let scopes = match token.scopes() {
            Some(granted) => granted.iter().map(|s| s.as_str().to_owned()).collect(),
            None => self.oauth.scopes.clone(),
        };

        tracing::info!(scopes = scopes.len(), "consent completed");
        Ok(ConsentGrant {
            access_token: token.access_token().secret().clone(),
            refresh_token,
            expires_at,
            scopes,
            authorization_url: url.to_string(),
        })
    }
}

impl ConsentFlow for LoopbackConsentFlow {
    fn authorize(&self) -> BoxFuture<'_, AppResult<ConsentGrant>> {
        self.run().boxed()
    }
}

/// Query parameters of the OAuth redirect
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

struct CallbackState {
    expected_state: String,
    /// Taken by the first callback with a matching state
    sender: Mutex<Option<oneshot::Sender<CallbackParams>>>,
}

fn callback_router(state: Arc<CallbackState>) -> Router {
    Router::new()
        .route("/callback", get(handle_callback))
        .with_state(state)
}

async fn handle_callback(
    State(state): State<Arc<CallbackState>>,
    Query(params): Query<CallbackParams>,
) -> (StatusCode, Html<&'static str>) {
    if params.state.as_deref() != Some(state.expected_state.as_str()) {
        tracing::warn!("ignoring OAuth callback with mismatched state");
        return (StatusCode::BAD_REQUEST, Html(ERROR_HTML));
    }
    let Some(sender) = state.sender.lock().await.take() else {
        return (StatusCode::CONFLICT, Html(ERROR_HTML));
    };
    let page = if params.error.is_some() || params.code.is_none() {
        ERROR_HTML
    } else {
        SUCCESS_HTML
    };
    if sender.send(params).is_err() {
        tracing::warn!("OAuth callback arrived after the consent wait ended");
        return (StatusCode::GONE, Html(ERROR_HTML));
    }
    (StatusCode::OK, Html(page))
}

/// Authorization code from a state-checked callback
fn authorization_code(params: CallbackParams) -> AppResult<String> {
    if let Some(error) = params.error {
        let detail = params
            .error_description
            .map(|d| format!(" ({d})"))
            .unwrap_or_default();
        return Err(AppError::Consent(format!("consent was denied: {error}{detail}")));
    }
    params
        .code
        .filter(|c| !c.is_empty())
        .ok_or_else(|| AppError::Consent("callback did not include an authorization code".to_owned()))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use secrecy::SecretString;
    use tokio::sync::{Mutex, oneshot};
    use tower::ServiceExt;

    use super::{
        CallbackParams, CallbackState, LoopbackConsentFlow, authorization_code, callback_router,
    };
    use crate::config::OAuthClientConfig;
    use crate::errors::AppError;

    fn flow() -> LoopbackConsentFlow {
        LoopbackConsentFlow::new(
            OAuthClientConfig {
                client_id: "client-id".to_owned(),
                client_secret: SecretString::from("client-secret".to_owned()),
                auth_url: "https://accounts.example.com/auth".to_owned(),
                token_url: "https://accounts.example.com/token".to_owned(),
                redirect_port: 8765,
                scopes: vec!["scope-a".to_owned(), "scope-b".to_owned()],
            },
            Duration::from_secs(5),
        )
    }

    fn state() -> (Arc<CallbackState>, oneshot::Receiver<CallbackParams>) {
        let (tx, rx) = oneshot::channel();
        let state = Arc::new(CallbackState {
            expected_state: "expected".to_owned(),
            sender: Mutex::new(Some(tx)),
        });
        (state, rx)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .body(Body::empty())
            .expect("request")
    }

    #[test]
    fn authorization_url_requests_offline_access_with_pkce() {
        let flow = flow();
        let client = flow.client().expect("client");
        let (url, csrf, _verifier) = flow.authorization_request(&client);
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        let param = |name: &str| {
            pairs
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str())
        };

        assert_eq!(param("access_type"), Some("offline"));
        assert_eq!(param("prompt"), Some("consent"));
        assert_eq!(param("code_challenge_method"), Some("S256"));
        assert_eq!(param("client_id"), Some("client-id"));
        assert_eq!(param("redirect_uri"), Some("http://127.0.0.1:8765/callback"));
        assert_eq!(param("scope"), Some("scope-a scope-b"));
        assert_eq!(param("state"), Some(csrf.secret().as_str()));
    }

    #[tokio::test]
    async fn callback_with_matching_state_delivers_code() {
        let (state, rx) = state();
        let response = callback_router(state)
            .oneshot(get("/callback?code=abc&state=expected"))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let params = rx.await.expect("params delivered");
        assert_eq!(authorization_code(params).expect("code"), "abc");
    }

    #[tokio::test]
    async fn callback_with_wrong_state_is_rejected_and_keeps_waiting() {
        let (state, mut rx) = state();
        let response = callback_router(Arc::clone(&state))
            .oneshot(get("/callback?code=abc&state=forged"))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(rx.try_recv().is_err());
        assert!(state.sender.lock().await.is_some());
    }

    #[tokio::test]
    async fn second_callback_is_refused() {
        let (state, _rx) = state();
        let app = callback_router(state);
        let first = app
            .clone()
            .oneshot(get("/callback?code=abc&state=expected"))
            .await
            .expect("response");
        let second = app
            .oneshot(get("/callback?code=def&state=expected"))
            .await
            .expect("response");

        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(second.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn denied_consent_maps_to_consent_error() {
        let (state, rx) = state();
        callback_router(state)
            .oneshot(get(
                "/callback?error=access_denied&error_description=user+said+no&state=expected",
            ))
            .await
            .expect("response");

        let err = authorization_code(rx.await.expect("params")).expect_err("denied");
        assert!(matches!(err, AppError::Consent(ref m) if m.contains("access_denied")));
        assert!(err.to_string().contains("user said no"));
    }

    #[test]
    fn missing_code_is_an_error() {
        let err = authorization_code(CallbackParams::default()).expect_err("no code");
        assert_eq!(err.kind(), "consent");
    }
}
