//! Authorized HTTP transport.
//!
//! [`AuthTransport`] is the single place requests to the backend are built.
//! It resolves paths against the configured base URL and stamps the current
//! session token on every request except the authentication endpoints
//! themselves.

use std::time::Duration;

use reqwest::{header, Method};

use crate::session::{AuthError, SessionStore};

/// Path fragment shared by the login endpoints. Requests whose path contains
/// it are sent without a token so a stale session can never block a login.
const AUTH_BOOTSTRAP_FRAGMENT: &str = "auth-with-";

pub struct TransportDefaults;

impl TransportDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
}

#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Connect timeout for the underlying client. No overall request timeout
    /// is set here; the realtime stream stays open indefinitely and unary
    /// callers apply their own deadlines.
    pub connect_timeout: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            connect_timeout: TransportDefaults::CONNECT_TIMEOUT,
        }
    }
}

#[derive(Clone)]
pub struct AuthTransport {
    http: reqwest::Client,
    base_url: String,
    session: SessionStore,
}

impl AuthTransport {
    pub fn new(base_url: impl Into<String>, session: SessionStore) -> Result<Self, AuthError> {
        Self::with_options(base_url, session, TransportOptions::default())
    }

    pub fn with_options(
        base_url: impl Into<String>,
        session: SessionStore,
        options: TransportOptions,
    ) -> Result<Self, AuthError> {
        let http = reqwest::Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(|err| AuthError::Transport(err.to_string()))?;
        let base_url = base_url.into();
        Ok(Self {
            http,
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            session,
        })
    }

    /// Builds a request for `path` with the session token already applied.
    ///
    /// The token goes into the `Authorization` header exactly as issued by
    /// the backend, without a scheme prefix. Anonymous sessions produce no
    /// header at all. A failed token refresh aborts the request here; nothing
    /// is sent with a dead token.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
    ) -> Result<reqwest::RequestBuilder, AuthError> {
        let mut builder = self.http.request(method, self.endpoint(path));
        if !is_auth_bootstrap(path) {
            let token = self.session.token().await?;
            if !token.is_empty() {
                builder = builder.header(header::AUTHORIZATION, token);
            }
        }
        Ok(builder)
    }

    /// Absolute URL for `path`.
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn session(&self) -> &SessionStore {
        &self.session
    }
}

fn is_auth_bootstrap(path: &str) -> bool {
    path.contains(AUTH_BOOTSTRAP_FRAGMENT)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use secrecy::SecretString;

    use super::*;
    use crate::session::{CredentialRefresher, Principal, SessionOptions};

    struct RejectingRefresher;

    #[async_trait]
    impl CredentialRefresher for RejectingRefresher {
        async fn refresh(&self, _principal: &Principal) -> Result<SecretString, AuthError> {
            Err(AuthError::Rejected {
                status: reqwest::StatusCode::UNAUTHORIZED,
                message: "token expired".to_string(),
            })
        }
    }

    fn fresh_session(token: &str) -> SessionStore {
        let session = SessionStore::new(Arc::new(RejectingRefresher), SessionOptions::default());
        session.set(
            SecretString::new(token.to_string()),
            Principal::admin("admin@example.com", SecretString::new("pw".into())),
        );
        session
    }

    fn anonymous_session() -> SessionStore {
        SessionStore::new(Arc::new(RejectingRefresher), SessionOptions::default())
    }

    #[test]
    fn bootstrap_paths_match_on_the_fragment() {
        assert!(is_auth_bootstrap("/api/admins/auth-with-password"));
        assert!(is_auth_bootstrap("/api/collections/users/auth-with-password"));
        assert!(!is_auth_bootstrap("/api/collections/users/records"));
        assert!(!is_auth_bootstrap("/api/realtime"));
    }

    #[test]
    fn endpoint_joins_base_and_path() {
        let transport =
            AuthTransport::new("https://basalt.example.com/", anonymous_session()).unwrap();
        assert_eq!(
            transport.endpoint("/api/realtime"),
            "https://basalt.example.com/api/realtime"
        );
    }

    #[tokio::test]
    async fn token_is_stamped_verbatim() {
        let transport = AuthTransport::new("http://localhost:8090", fresh_session("tok-123"))
            .unwrap();
        let request = transport
            .request(Method::GET, "/api/collections/posts/records")
            .await
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(
            request.headers().get(header::AUTHORIZATION).unwrap(),
            "tok-123"
        );
    }

    #[tokio::test]
    async fn anonymous_requests_carry_no_header() {
        let transport = AuthTransport::new("http://localhost:8090", anonymous_session()).unwrap();
        let request = transport
            .request(Method::GET, "/api/collections/posts/records")
            .await
            .unwrap()
            .build()
            .unwrap();
        assert!(request.headers().get(header::AUTHORIZATION).is_none());
    }

    #[tokio::test]
    async fn login_requests_skip_the_session_entirely() {
        // Even with a live token cached, a login request goes out bare.
        let session = anonymous_session();
        session.set(
            SecretString::new("live".to_string()),
            Principal::admin("admin@example.com", SecretString::new("pw".into())),
        );
        let transport = AuthTransport::with_options(
            "http://localhost:8090",
            session,
            TransportOptions::default(),
        )
        .unwrap();
        let request = transport
            .request(Method::POST, "/api/admins/auth-with-password")
            .await
            .unwrap()
            .build()
            .unwrap();
        assert!(request.headers().get(header::AUTHORIZATION).is_none());
    }

    #[tokio::test]
    async fn refresh_failure_aborts_the_request() {
        let session = SessionStore::new(
            Arc::new(RejectingRefresher),
            SessionOptions {
                refresh_margin: Duration::ZERO,
            },
        );
        session.set(
            SecretString::new("stale".to_string()),
            Principal::admin("admin@example.com", SecretString::new("pw".into())),
        );
        let transport = AuthTransport::new("http://localhost:8090", session).unwrap();
        let err = transport
            .request(Method::GET, "/api/collections/posts/records")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Rejected { .. }));
    }
}
