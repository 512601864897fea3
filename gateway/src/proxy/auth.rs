use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

/// Verified identity attached to a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    #[serde(alias = "userId", alias = "sub")]
    pub subject: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub organization_id: Option<String>,
    #[serde(default)]
    pub session_id: String,
}

impl Principal {
    pub fn has_any_role(&self, required: &[String]) -> bool {
        required.iter().any(|r| self.roles.contains(r))
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthError {
    #[error("invalid token")]
    InvalidToken,
    #[error("auth service unavailable: {0}")]
    Unavailable(String),
}

/// Token verification collaborator.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Principal, AuthError>;
}

/// Verifies tokens against a remote endpoint: `GET verify_url` with the
/// bearer token, JSON principal on 2xx.
pub struct HttpAuthenticator {
    client: reqwest::Client,
    verify_url: String,
    timeout: Duration,
}

impl HttpAuthenticator {
    pub fn new(verify_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .no_proxy()
                .build()
                .unwrap_or_default(),
            verify_url: verify_url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Authenticator for HttpAuthenticator {
    async fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        let resp = self
            .client
            .get(&self.verify_url)
            .bearer_auth(token)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                warn!("auth: verify request failed, url={}, error={}", self.verify_url, e);
                AuthError::Unavailable(e.to_string())
            })?;

        let status = resp.status();
        if status.is_success() {
            return resp
                .json::<Principal>()
                .await
                .map_err(|e| AuthError::Unavailable(format!("malformed principal: {}", e)));
        }
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(AuthError::InvalidToken);
        }
        Err(AuthError::Unavailable(format!("verify returned {}", status)))
    }
}

/// Fixed token table, for development and tests.
#[derive(Default)]
pub struct StaticAuthenticator {
    tokens: HashMap<String, Principal>,
}

impl StaticAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, principal: Principal) -> Self {
        self.tokens.insert(token.into(), principal);
        self
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        self.tokens.get(token).cloned().ok_or(AuthError::InvalidToken)
    }
}

/// Rejects every token. Used when no verifier is configured, so routes that
/// require auth fail closed.
pub struct DenyAllAuthenticator;

#[async_trait]
impl Authenticator for DenyAllAuthenticator {
    async fn verify(&self, _token: &str) -> Result<Principal, AuthError> {
        Err(AuthError::InvalidToken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn principal(roles: &[&str]) -> Principal {
        Principal {
            subject: "u-1".into(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
            organization_id: Some("org-9".into()),
            session_id: "s-1".into(),
        }
    }

    #[tokio::test]
    async fn test_static_authenticator() {
        let auth = StaticAuthenticator::new().with_token("good", principal(&["admin"]));
        assert_eq!(auth.verify("good").await.unwrap().subject, "u-1");
        assert!(matches!(auth.verify("bad").await, Err(AuthError::InvalidToken)));
    }

    #[tokio::test]
    async fn test_deny_all() {
        assert!(DenyAllAuthenticator.verify("anything").await.is_err());
    }

    #[test]
    fn test_roles() {
        let p = principal(&["reader", "writer"]);
        assert!(p.has_any_role(&["admin".into(), "writer".into()]));
        assert!(!p.has_any_role(&["admin".into()]));
    }

    #[test]
    fn test_principal_json_aliases() {
        let p: Principal =
            serde_json::from_str(r#"{"userId":"42","roles":["a"],"sessionId":"s"}"#).unwrap();
        assert_eq!(p.subject, "42");
        assert_eq!(p.organization_id, None);
        assert_eq!(p.session_id, "s");
    }

    #[tokio::test]
    async fn test_http_authenticator_unreachable() {
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let auth = HttpAuthenticator::new(
            format!("http://127.0.0.1:{}/verify", port),
            Duration::from_millis(500),
        );
        assert!(matches!(
            auth.verify("t").await,
            Err(AuthError::Unavailable(_))
        ));
    }
}
