//! Bearer tokens for the push channel
//!
//! A [`TokenProvider`] wraps a [`TokenSource`] and applies the acquisition
//! policy: silent first, interactive only when the silent attempt reports that
//! user interaction is required, and an empty token when both fail.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::AuthConfig;
use crate::io::HttpClient;
use crate::oauth::OAuthTokenSource;

/// Bearer token; empty means "proceed unauthenticated"
#[derive(Clone, Default, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            write!(f, "AccessToken(<empty>)")
        } else {
            write!(f, "AccessToken(<redacted, {} bytes>)", self.0.len())
        }
    }
}

/// Token acquisition failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// Silent acquisition is impossible without the user (expired session, consent)
    #[error("Interaction required: {0}")]
    InteractionRequired(String),

    #[error("Token acquisition failed: {0}")]
    Failed(String),

    #[error("HTTP error during token acquisition: {0}")]
    Http(String),

    /// The hub rejected the token we presented
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
}

/// Something that can produce bearer tokens
#[async_trait]
#[cfg_attr(test, mockall::automock)]
pub trait TokenSource: Send + Sync {
    /// Cached or refresh-token based acquisition, never prompts the user
    async fn acquire_silent(&self) -> Result<AccessToken, AuthError>;

    /// Acquisition that may involve the user
    async fn acquire_interactive(&self) -> Result<AccessToken, AuthError>;
}

/// Source for hubs that do not require authentication
#[derive(Debug, Default, Clone)]
pub struct NoAuth;

#[async_trait]
impl TokenSource for NoAuth {
    async fn acquire_silent(&self) -> Result<AccessToken, AuthError> {
        Ok(AccessToken::empty())
    }

    async fn acquire_interactive(&self) -> Result<AccessToken, AuthError> {
        Ok(AccessToken::empty())
    }
}

/// Fixed token, typically injected through configuration or the environment
#[derive(Debug, Clone)]
pub struct StaticTokenSource {
    token: AccessToken,
}

impl StaticTokenSource {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: AccessToken::new(token),
        }
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn acquire_silent(&self) -> Result<AccessToken, AuthError> {
        Ok(self.token.clone())
    }

    async fn acquire_interactive(&self) -> Result<AccessToken, AuthError> {
        Err(AuthError::Failed(
            "A static token cannot be renewed interactively".to_string(),
        ))
    }
}

/// Obtains tokens for each connection attempt
#[derive(Clone)]
pub struct TokenProvider {
    source: Arc<dyn TokenSource>,
}

impl TokenProvider {
    pub fn new(source: Arc<dyn TokenSource>) -> Self {
        Self { source }
    }

    /// Provider that always yields an empty token
    pub fn anonymous() -> Self {
        Self::new(Arc::new(NoAuth))
    }

    /// Build the provider described by the auth configuration
    pub fn from_config(config: &AuthConfig, http: Arc<dyn HttpClient>) -> Self {
        match config {
            AuthConfig::None => Self::anonymous(),
            AuthConfig::Static { token, .. } => match token {
                Some(token) => Self::new(Arc::new(StaticTokenSource::new(token.clone()))),
                None => {
                    warn!("Static auth configured without a token, connecting anonymously");
                    Self::anonymous()
                }
            },
            AuthConfig::OAuth {
                authority,
                client_id,
                scopes,
                refresh_token,
                ..
            } => Self::new(Arc::new(OAuthTokenSource::new(
                authority.clone(),
                client_id.clone(),
                scopes.clone(),
                refresh_token.clone(),
                http,
            ))),
        }
    }

    /// Silent acquisition with a single interactive fallback
    pub async fn try_get_token(&self) -> Result<AccessToken, AuthError> {
        debug!("Acquiring access token silently");
        match self.source.acquire_silent().await {
            Ok(token) => {
                debug!("Access token acquired silently");
                Ok(token)
            }
            Err(AuthError::InteractionRequired(reason)) => {
                info!(
                    "Silent token acquisition needs interaction ({}), trying interactive acquisition",
                    reason
                );
                let token = self.source.acquire_interactive().await?;
                info!("Interactive token acquisition succeeded");
                Ok(token)
            }
            Err(e) => Err(e),
        }
    }

    /// Like [`try_get_token`](Self::try_get_token) but never fails
    ///
    /// Failures are logged and turned into an empty token.
    pub async fn get_token(&self) -> AccessToken {
        match self.try_get_token().await {
            Ok(token) => token,
            Err(e) => {
                warn!("Failed to acquire access token, continuing without one: {}", e);
                AccessToken::empty()
            }
        }
    }
}

impl std::fmt::Debug for TokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenProvider").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn silent_success_skips_interactive() {
        let mut source = MockTokenSource::new();
        source
            .expect_acquire_silent()
            .times(1)
            .returning(|| Box::pin(async { Ok(AccessToken::new("silent")) }));
        source.expect_acquire_interactive().never();

        let provider = TokenProvider::new(Arc::new(source));
        assert_eq!(provider.get_token().await, AccessToken::new("silent"));
    }

    #[tokio::test]
    async fn interaction_required_falls_back_once() {
        let mut source = MockTokenSource::new();
        source.expect_acquire_silent().times(1).returning(|| {
            Box::pin(async { Err(AuthError::InteractionRequired("expired".to_string())) })
        });
        source
            .expect_acquire_interactive()
            .times(1)
            .returning(|| Box::pin(async { Ok(AccessToken::new("interactive")) }));

        let provider = TokenProvider::new(Arc::new(source));
        assert_eq!(
            provider.try_get_token().await.unwrap(),
            AccessToken::new("interactive")
        );
    }

    #[tokio::test]
    async fn other_silent_failures_do_not_prompt() {
        let mut source = MockTokenSource::new();
        source.expect_acquire_silent().times(1).returning(|| {
            Box::pin(async { Err(AuthError::Http("connection refused".to_string())) })
        });
        source.expect_acquire_interactive().never();

        let provider = TokenProvider::new(Arc::new(source));
        let err = provider.try_get_token().await.unwrap_err();
        assert_eq!(err, AuthError::Http("connection refused".to_string()));
    }

    #[tokio::test]
    async fn both_failing_yields_empty_token() {
        let mut source = MockTokenSource::new();
        source.expect_acquire_silent().returning(|| {
            Box::pin(async { Err(AuthError::InteractionRequired("no account".to_string())) })
        });
        source.expect_acquire_interactive().times(1).returning(|| {
            Box::pin(async { Err(AuthError::Failed("user cancelled".to_string())) })
        });

        let provider = TokenProvider::new(Arc::new(source));
        assert!(provider.get_token().await.is_empty());
    }

    #[tokio::test]
    async fn anonymous_provider_yields_empty_token() {
        assert!(TokenProvider::anonymous().get_token().await.is_empty());
    }

    #[tokio::test]
    async fn static_source_returns_token_but_cannot_prompt() {
        let source = StaticTokenSource::new("abc");
        assert_eq!(source.acquire_silent().await.unwrap().as_str(), "abc");
        assert!(source.acquire_interactive().await.is_err());
    }

    #[test]
    fn debug_output_redacts_token() {
        let token = AccessToken::new("super-secret");
        let rendered = format!("{:?}", token);
        assert!(!rendered.contains("super-secret"));
        assert_eq!(format!("{:?}", AccessToken::empty()), "AccessToken(<empty>)");
    }
}
