//! Session state for the Basalt backend.
//!
//! A [`SessionStore`] owns the current principal and its cached token, and
//! transparently re-authenticates when the token nears the end of its
//! lifetime. Concurrent callers that hit an expired token share a single
//! refresh attempt; every waiter sees the same outcome.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::RwLock;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

pub struct SessionDefaults;

impl SessionDefaults {
    /// How long an installed token is served from cache before the store
    /// re-authenticates. The backend issues tokens with a one hour lifetime;
    /// refreshing at fifty minutes keeps a safety window for in-flight
    /// requests.
    pub const REFRESH_MARGIN: Duration = Duration::from_secs(50 * 60);
    /// Connect timeout for the dedicated auth client.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    /// Overall deadline for one authentication request.
    pub const AUTH_TIMEOUT: Duration = Duration::from_secs(15);
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Cache lifetime applied to freshly installed tokens.
    pub refresh_margin: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            refresh_margin: SessionDefaults::REFRESH_MARGIN,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RefresherOptions {
    pub connect_timeout: Duration,
    /// Per-request deadline covering send, response, and body read.
    pub request_timeout: Duration,
}

impl Default for RefresherOptions {
    fn default() -> Self {
        Self {
            connect_timeout: SessionDefaults::CONNECT_TIMEOUT,
            request_timeout: SessionDefaults::AUTH_TIMEOUT,
        }
    }
}

/// Identity a session authenticates as.
///
/// The variant decides which endpoint re-authentication goes through:
/// admins use a fixed path, record principals the path of their collection.
#[derive(Debug, Clone)]
pub enum Principal {
    Admin {
        email: String,
        password: SecretString,
    },
    Record {
        collection: String,
        identity: String,
        password: SecretString,
    },
}

impl Principal {
    pub fn admin(email: impl Into<String>, password: SecretString) -> Self {
        Self::Admin {
            email: email.into(),
            password,
        }
    }

    pub fn record(
        collection: impl Into<String>,
        identity: impl Into<String>,
        password: SecretString,
    ) -> Self {
        Self::Record {
            collection: collection.into(),
            identity: identity.into(),
            password,
        }
    }

    /// Backend path used to (re-)authenticate this principal.
    pub fn auth_path(&self) -> String {
        match self {
            Self::Admin { .. } => "/api/admins/auth-with-password".to_string(),
            Self::Record { collection, .. } => {
                format!("/api/collections/{collection}/auth-with-password")
            }
        }
    }

    /// Short label for log lines. Never contains credentials.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Admin { .. } => "admin",
            Self::Record { .. } => "record",
        }
    }

    fn login_body(&self) -> serde_json::Value {
        match self {
            Self::Admin { email, password } => json!({
                "identity": email,
                "password": password.expose_secret(),
            }),
            Self::Record {
                identity, password, ..
            } => json!({
                "identity": identity,
                "password": password.expose_secret(),
            }),
        }
    }
}

/// Errors raised while obtaining or refreshing a session token.
///
/// The type is `Clone` so a single failed refresh can be reported to every
/// caller that was waiting on it.
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    /// The backend refused the credentials.
    #[error("authentication rejected ({status}): {message}")]
    Rejected { status: StatusCode, message: String },
    /// The auth request never produced a response.
    #[error("auth transport error: {0}")]
    Transport(String),
    /// The response body did not carry a usable token.
    #[error("malformed auth response: {0}")]
    Decode(String),
}

/// Source of fresh tokens for a [`SessionStore`].
///
/// Implementations must not call back into the store's `token`; the store
/// awaits the refresher while a refresh slot is held.
#[async_trait]
pub trait CredentialRefresher: Send + Sync {
    /// Obtains a new bearer token for `principal`.
    async fn refresh(&self, principal: &Principal) -> Result<SecretString, AuthError>;
}

/// Password-based [`CredentialRefresher`] that replays the principal's stored
/// credentials against the backend's `auth-with-password` endpoints.
#[derive(Debug, Clone)]
pub struct PasswordRefresher {
    http: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
}

impl PasswordRefresher {
    pub fn new(base_url: impl Into<String>) -> Result<Self, AuthError> {
        Self::with_options(base_url, RefresherOptions::default())
    }

    pub fn with_options(
        base_url: impl Into<String>,
        options: RefresherOptions,
    ) -> Result<Self, AuthError> {
        let http = reqwest::Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(|err| AuthError::Transport(err.to_string()))?;
        let base_url = base_url.into();
        Ok(Self {
            http,
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            request_timeout: options.request_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl CredentialRefresher for PasswordRefresher {
    async fn refresh(&self, principal: &Principal) -> Result<SecretString, AuthError> {
        let endpoint = format!("{}{}", self.base_url, principal.auth_path());
        let response = self
            .http
            .post(&endpoint)
            .timeout(self.request_timeout)
            .json(&principal.login_body())
            .send()
            .await
            .map_err(|err| AuthError::Transport(err.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| AuthError::Transport(err.to_string()))?;
        if !status.is_success() {
            return Err(AuthError::Rejected {
                status,
                message: summarize_error_body(&body),
            });
        }
        parse_auth_response(&body)
    }
}

struct Credential {
    token: SecretString,
    refresh_at: Instant,
}

impl Credential {
    fn is_fresh(&self, now: Instant) -> bool {
        now < self.refresh_at
    }
}

type TokenOutcome = Result<String, AuthError>;
type SharedRefresh = Shared<BoxFuture<'static, TokenOutcome>>;

struct SessionState {
    principal: Option<Principal>,
    credential: Option<Credential>,
    /// In-flight refresh shared by every waiter. `None` while idle.
    refresh: Option<SharedRefresh>,
    /// Bumped by `set`, `clear`, and `authenticate` so a refresh that was
    /// started against older state cannot install its result afterwards.
    epoch: u64,
}

struct SessionInner {
    refresher: Arc<dyn CredentialRefresher>,
    refresh_margin: Duration,
    state: RwLock<SessionState>,
}

/// Cached credentials plus the machinery to renew them.
///
/// Cloning is cheap; clones share the same session state.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<SessionInner>,
}

impl SessionStore {
    pub fn new(refresher: Arc<dyn CredentialRefresher>, options: SessionOptions) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                refresher,
                refresh_margin: options.refresh_margin,
                state: RwLock::new(SessionState {
                    principal: None,
                    credential: None,
                    refresh: None,
                    epoch: 0,
                }),
            }),
        }
    }

    /// Store wired to a [`PasswordRefresher`] for `base_url`.
    pub fn with_password_auth(
        base_url: impl Into<String>,
        options: SessionOptions,
    ) -> Result<Self, AuthError> {
        Ok(Self::new(Arc::new(PasswordRefresher::new(base_url)?), options))
    }

    /// Current token.
    ///
    /// Returns the cached token while it is inside its refresh margin,
    /// re-authenticates through the refresher once it is not, and returns an
    /// empty string when no principal is installed. Concurrent callers during
    /// a refresh all wait on the same attempt and observe its outcome.
    pub async fn token(&self) -> Result<String, AuthError> {
        if let Some(token) = self.cached() {
            return Ok(token);
        }
        let refresh = {
            let mut state = self.inner.state.write();
            // Re-check under the write lock: another caller may have finished
            // a refresh while we waited for it.
            let Some(principal) = state.principal.clone() else {
                return Ok(String::new());
            };
            if let Some(credential) = &state.credential {
                if credential.is_fresh(Instant::now()) {
                    return Ok(credential.token.expose_secret().clone());
                }
            }
            match &state.refresh {
                Some(inflight) => inflight.clone(),
                None => {
                    let refresh = self.start_refresh(principal, state.epoch);
                    state.refresh = Some(refresh.clone());
                    refresh
                }
            }
        };
        refresh.await
    }

    /// Installs `token` for `principal`, replacing whatever was cached.
    ///
    /// The token is served from cache for the configured refresh margin
    /// starting now.
    pub fn set(&self, token: SecretString, principal: Principal) {
        let mut state = self.inner.state.write();
        state.epoch += 1;
        state.refresh = None;
        state.principal = Some(principal);
        state.credential = Some(Credential {
            token,
            refresh_at: Instant::now() + self.inner.refresh_margin,
        });
    }

    /// Drops the principal and any cached token. Subsequent [`Self::token`]
    /// calls yield an empty token until a new principal is installed.
    pub fn clear(&self) {
        let mut state = self.inner.state.write();
        state.epoch += 1;
        state.refresh = None;
        state.principal = None;
        state.credential = None;
    }

    /// Installs `principal` and logs it in immediately, returning the new
    /// token.
    pub async fn authenticate(&self, principal: Principal) -> Result<String, AuthError> {
        {
            let mut state = self.inner.state.write();
            state.epoch += 1;
            state.refresh = None;
            state.principal = Some(principal);
            state.credential = None;
        }
        self.token().await
    }

    pub fn principal(&self) -> Option<Principal> {
        self.inner.state.read().principal.clone()
    }

    /// Whether a token is currently cached and inside its refresh margin.
    pub fn is_authenticated(&self) -> bool {
        self.inner
            .state
            .read()
            .credential
            .as_ref()
            .is_some_and(|credential| credential.is_fresh(Instant::now()))
    }

    fn cached(&self) -> Option<String> {
        let state = self.inner.state.read();
        if state.principal.is_none() {
            return Some(String::new());
        }
        let credential = state.credential.as_ref()?;
        credential
            .is_fresh(Instant::now())
            .then(|| credential.token.expose_secret().clone())
    }

    fn start_refresh(&self, principal: Principal, epoch: u64) -> SharedRefresh {
        let refresher = Arc::clone(&self.inner.refresher);
        let margin = self.inner.refresh_margin;
        let inner = Arc::downgrade(&self.inner);
        async move {
            debug!(principal = principal.kind(), "refreshing session token");
            let outcome = refresher.refresh(&principal).await;
            let Some(inner) = inner.upgrade() else {
                return outcome.map(|token| token.expose_secret().clone());
            };
            let mut state = inner.state.write();
            if state.epoch != epoch {
                // The session was replaced or cleared while we were talking
                // to the backend. Hand the outcome to the waiters but leave
                // the newer state alone.
                return outcome.map(|token| token.expose_secret().clone());
            }
            state.refresh = None;
            match outcome {
                Ok(token) => {
                    let exposed = token.expose_secret().clone();
                    state.credential = Some(Credential {
                        token,
                        refresh_at: Instant::now() + margin,
                    });
                    debug!("session token refreshed");
                    Ok(exposed)
                }
                Err(err) => {
                    state.credential = None;
                    warn!(error = %err, "session token refresh failed");
                    Err(err)
                }
            }
        }
        .boxed()
        .shared()
    }
}

fn parse_auth_response(body: &str) -> Result<SecretString, AuthError> {
    #[derive(Deserialize)]
    struct AuthResponse {
        #[serde(default)]
        token: Option<String>,
    }

    let parsed: AuthResponse =
        serde_json::from_str(body).map_err(|err| AuthError::Decode(err.to_string()))?;
    match parsed.token {
        Some(token) if !token.is_empty() => Ok(SecretString::new(token)),
        _ => Err(AuthError::Decode("auth response missing token".to_string())),
    }
}

const ERROR_BODY_SNIPPET_LEN: usize = 220;

fn summarize_error_body(body: &str) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        message: Option<String>,
        error: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.message.or(parsed.error) {
            if !message.is_empty() {
                return message;
            }
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "empty error body".to_string();
    }
    let snippet: String = trimmed.chars().take(ERROR_BODY_SNIPPET_LEN).collect();
    snippet
}
