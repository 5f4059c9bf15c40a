//! OAuth 2.0 token source
//!
//! Silent acquisition serves a cached access token while it is fresh and
//! otherwise redeems the refresh token. Interactive acquisition runs the
//! device-authorization grant: the user is shown a code and a URL, and the
//! token endpoint is polled until they complete sign-in elsewhere.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::auth::{AccessToken, AuthError, TokenSource};
use crate::io::{HttpClient, HttpResponse};

const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";
const OFFLINE_ACCESS: &str = "offline_access";

/// Tokens are renewed this long before they actually expire
const EXPIRY_SKEW_SECONDS: i64 = 60;

/// Added to the polling interval on `slow_down`
const SLOW_DOWN_STEP: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeviceCodeResponse {
    device_code: String,
    user_code: String,
    verification_uri: String,
    expires_in: u64,
    #[serde(default = "default_poll_interval")]
    interval: u64,
    #[serde(default)]
    message: Option<String>,
}

fn default_poll_interval() -> u64 {
    5
}

#[derive(Debug, Default)]
struct TokenCache {
    access_token: Option<(AccessToken, DateTime<Utc>)>,
    refresh_token: Option<String>,
}

impl TokenCache {
    fn fresh_token(&self, now: DateTime<Utc>) -> Option<AccessToken> {
        self.access_token
            .as_ref()
            .filter(|(_, expires_at)| {
                *expires_at - chrono::Duration::seconds(EXPIRY_SKEW_SECONDS) > now
            })
            .map(|(token, _)| token.clone())
    }

    fn store(&mut self, response: TokenResponse, now: DateTime<Utc>) -> AccessToken {
        let token = AccessToken::new(response.access_token);
        let expires_at = now + chrono::Duration::seconds(response.expires_in.unwrap_or(3600));
        self.access_token = Some((token.clone(), expires_at));
        if let Some(refresh_token) = response.refresh_token {
            self.refresh_token = Some(refresh_token);
        }
        token
    }
}

/// OAuth 2.0 source backed by an identity provider's v2.0 endpoints
pub struct OAuthTokenSource {
    authority: String,
    client_id: String,
    scope: String,
    http: Arc<dyn HttpClient>,
    cache: Mutex<TokenCache>,
}

impl OAuthTokenSource {
    pub fn new(
        authority: String,
        client_id: String,
        scopes: Vec<String>,
        refresh_token: Option<String>,
        http: Arc<dyn HttpClient>,
    ) -> Self {
        let mut scopes = scopes;
        if !scopes.iter().any(|s| s == OFFLINE_ACCESS) {
            scopes.push(OFFLINE_ACCESS.to_string());
        }
        Self {
            authority: authority.trim_end_matches('/').to_string(),
            client_id,
            scope: scopes.join(" "),
            http,
            cache: Mutex::new(TokenCache {
                access_token: None,
                refresh_token,
            }),
        }
    }

    fn token_url(&self) -> String {
        format!("{}/oauth2/v2.0/token", self.authority)
    }

    fn device_code_url(&self) -> String {
        format!("{}/oauth2/v2.0/devicecode", self.authority)
    }

    async fn post(&self, url: &str, params: &[(&str, &str)]) -> Result<HttpResponse, AuthError> {
        self.http
            .post_form(url, params)
            .await
            .map_err(|e| AuthError::Http(e.to_string()))
    }
}

impl std::fmt::Debug for OAuthTokenSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthTokenSource")
            .field("authority", &self.authority)
            .field("client_id", &self.client_id)
            .field("scope", &self.scope)
            .finish()
    }
}

/// Map an OAuth error code onto the acquisition failure kind
fn map_oauth_error(response: &HttpResponse) -> AuthError {
    match serde_json::from_str::<ErrorResponse>(&response.body) {
        Ok(error) => {
            let description = error
                .error_description
                .unwrap_or_else(|| error.error.clone());
            match error.error.as_str() {
                "invalid_grant" | "interaction_required" | "login_required"
                | "consent_required" => AuthError::InteractionRequired(description),
                other => AuthError::Failed(format!("{}: {}", other, description)),
            }
        }
        Err(_) => AuthError::Failed(format!(
            "Token endpoint returned status {}: {}",
            response.status, response.body
        )),
    }
}

fn parse_token(response: &HttpResponse) -> Result<TokenResponse, AuthError> {
    serde_json::from_str(&response.body)
        .map_err(|e| AuthError::Failed(format!("Malformed token response: {}", e)))
}

#[async_trait]
impl TokenSource for OAuthTokenSource {
    async fn acquire_silent(&self) -> Result<AccessToken, AuthError> {
        let mut cache = self.cache.lock().await;
        if let Some(token) = cache.fresh_token(Utc::now()) {
            debug!("Using cached access token");
            return Ok(token);
        }

        let Some(refresh_token) = cache.refresh_token.clone() else {
            return Err(AuthError::InteractionRequired(
                "No refresh token available".to_string(),
            ));
        };

        debug!("Redeeming refresh token at {}", self.token_url());
        let response = self
            .post(
                &self.token_url(),
                &[
                    ("grant_type", "refresh_token"),
                    ("client_id", &self.client_id),
                    ("scope", &self.scope),
                    ("refresh_token", &refresh_token),
                ],
            )
            .await?;

        if !response.is_success() {
            let error = map_oauth_error(&response);
            if matches!(error, AuthError::InteractionRequired(_)) {
                cache.refresh_token = None;
            }
            return Err(error);
        }

        Ok(cache.store(parse_token(&response)?, Utc::now()))
    }

    async fn acquire_interactive(&self) -> Result<AccessToken, AuthError> {
        // Held for the whole flow so concurrent callers never prompt twice.
        let mut cache = self.cache.lock().await;

        let response = self
            .post(
                &self.device_code_url(),
                &[("client_id", &self.client_id), ("scope", &self.scope)],
            )
            .await?;
        if !response.is_success() {
            return Err(map_oauth_error(&response));
        }
        let device: DeviceCodeResponse = serde_json::from_str(&response.body)
            .map_err(|e| AuthError::Failed(format!("Malformed device code response: {}", e)))?;

        match &device.message {
            Some(message) => info!("{}", message),
            None => info!(
                "To sign in, open {} and enter the code {}",
                device.verification_uri, device.user_code
            ),
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(device.expires_in);
        let mut interval = Duration::from_secs(device.interval);

        loop {
            tokio::time::sleep(interval).await;
            if tokio::time::Instant::now() >= deadline {
                return Err(AuthError::Failed("Device code expired".to_string()));
            }

            let response = self
                .post(
                    &self.token_url(),
                    &[
                        ("grant_type", DEVICE_CODE_GRANT),
                        ("client_id", &self.client_id),
                        ("device_code", &device.device_code),
                    ],
                )
                .await?;

            if response.is_success() {
                info!("Device sign-in completed");
                return Ok(cache.store(parse_token(&response)?, Utc::now()));
            }

            let error: ErrorResponse = serde_json::from_str(&response.body).map_err(|_| {
                AuthError::Failed(format!(
                    "Token endpoint returned status {}: {}",
                    response.status, response.body
                ))
            })?;
            match error.error.as_str() {
                "authorization_pending" => debug!("Waiting for device sign-in"),
                "slow_down" => {
                    interval += SLOW_DOWN_STEP;
                    debug!("Device polling slowed down to {:?}", interval);
                }
                other => {
                    warn!("Device sign-in failed: {}", other);
                    return Err(AuthError::Failed(format!(
                        "{}: {}",
                        other,
                        error.error_description.unwrap_or_default()
                    )));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MockHttpClient;

    fn response(status: u16, body: &str) -> HttpResponse {
        HttpResponse {
            status,
            body: body.to_string(),
        }
    }

    fn source(http: MockHttpClient, refresh_token: Option<&str>) -> OAuthTokenSource {
        OAuthTokenSource::new(
            "https://login.example.com/tenant/".to_string(),
            "client-id".to_string(),
            vec!["api://backend/ReadWrite".to_string()],
            refresh_token.map(str::to_string),
            Arc::new(http),
        )
    }

    #[tokio::test]
    async fn silent_without_refresh_token_requires_interaction() {
        let mut http = MockHttpClient::new();
        http.expect_post_form().never();

        let err = source(http, None).acquire_silent().await.unwrap_err();
        assert!(matches!(err, AuthError::InteractionRequired(_)));
    }

    #[tokio::test]
    async fn silent_redeems_refresh_token_then_uses_cache() {
        let mut http = MockHttpClient::new();
        http.expect_post_form()
            .times(1)
            .withf(|url, params| {
                url == "https://login.example.com/tenant/oauth2/v2.0/token"
                    && params.contains(&("grant_type", "refresh_token"))
                    && params.contains(&("refresh_token", "r1"))
                    && params.contains(&("scope", "api://backend/ReadWrite offline_access"))
            })
            .returning(|_, _| {
                Box::pin(async {
                    Ok(response(
                        200,
                        r#"{"access_token":"a1","expires_in":3600,"refresh_token":"r2"}"#,
                    ))
                })
            });

        let source = source(http, Some("r1"));
        assert_eq!(source.acquire_silent().await.unwrap().as_str(), "a1");
        assert_eq!(source.acquire_silent().await.unwrap().as_str(), "a1");
        assert_eq!(
            source.cache.lock().await.refresh_token.as_deref(),
            Some("r2")
        );
    }

    #[tokio::test]
    async fn expired_refresh_token_requires_interaction() {
        let mut http = MockHttpClient::new();
        http.expect_post_form().returning(|_, _| {
            Box::pin(async {
                Ok(response(
                    400,
                    r#"{"error":"invalid_grant","error_description":"AADSTS70008: expired"}"#,
                ))
            })
        });

        let source = source(http, Some("stale"));
        let err = source.acquire_silent().await.unwrap_err();
        assert_eq!(
            err,
            AuthError::InteractionRequired("AADSTS70008: expired".to_string())
        );
        assert!(source.cache.lock().await.refresh_token.is_none());
    }

    #[tokio::test]
    async fn other_oauth_errors_are_failures() {
        let mut http = MockHttpClient::new();
        http.expect_post_form().returning(|_, _| {
            Box::pin(async { Ok(response(400, r#"{"error":"invalid_client"}"#)) })
        });

        let err = source(http, Some("r1")).acquire_silent().await.unwrap_err();
        assert!(matches!(err, AuthError::Failed(_)));
    }

    #[tokio::test]
    async fn transport_errors_are_http_failures() {
        let mut http = MockHttpClient::new();
        http.expect_post_form().returning(|_, _| {
            Box::pin(async { Err(crate::HubError::Http("timeout".to_string())) })
        });

        let err = source(http, Some("r1")).acquire_silent().await.unwrap_err();
        assert!(matches!(err, AuthError::Http(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn device_flow_polls_until_authorized() {
        let mut http = MockHttpClient::new();
        let mut sequence = mockall::Sequence::new();
        http.expect_post_form()
            .times(1)
            .in_sequence(&mut sequence)
            .withf(|url, _| url.ends_with("/oauth2/v2.0/devicecode"))
            .returning(|_, _| {
                Box::pin(async {
                    Ok(response(
                        200,
                        r#"{"device_code":"dc","user_code":"ABCD-EFGH",
                            "verification_uri":"https://microsoft.com/devicelogin",
                            "expires_in":900,"interval":1}"#,
                    ))
                })
            });
        http.expect_post_form()
            .times(1)
            .in_sequence(&mut sequence)
            .withf(|_, params| params.contains(&("grant_type", DEVICE_CODE_GRANT)))
            .returning(|_, _| {
                Box::pin(async { Ok(response(400, r#"{"error":"authorization_pending"}"#)) })
            });
        http.expect_post_form()
            .times(1)
            .in_sequence(&mut sequence)
            .withf(|_, params| params.contains(&("device_code", "dc")))
            .returning(|_, _| {
                Box::pin(async {
                    Ok(response(
                        200,
                        r#"{"access_token":"device-token","expires_in":3600,"refresh_token":"r9"}"#,
                    ))
                })
            });

        let source = source(http, None);
        assert_eq!(
            source.acquire_interactive().await.unwrap().as_str(),
            "device-token"
        );
        assert_eq!(
            source.cache.lock().await.refresh_token.as_deref(),
            Some("r9")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn device_flow_declined_fails() {
        let mut http = MockHttpClient::new();
        let mut sequence = mockall::Sequence::new();
        http.expect_post_form()
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_, _| {
                Box::pin(async {
                    Ok(response(
                        200,
                        r#"{"device_code":"dc","user_code":"X","verification_uri":"https://v",
                            "expires_in":60,"interval":1}"#,
                    ))
                })
            });
        http.expect_post_form()
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_, _| {
                Box::pin(async {
                    Ok(response(
                        400,
                        r#"{"error":"authorization_declined","error_description":"user said no"}"#,
                    ))
                })
            });

        let err = source(http, None).acquire_interactive().await.unwrap_err();
        assert_eq!(
            err,
            AuthError::Failed("authorization_declined: user said no".to_string())
        );
    }

    #[test]
    fn cache_treats_nearly_expired_token_as_stale() {
        let now = Utc::now();
        let cache = TokenCache {
            access_token: Some((AccessToken::new("a"), now + chrono::Duration::seconds(30))),
            refresh_token: None,
        };
        assert!(cache.fresh_token(now).is_none());

        let cache = TokenCache {
            access_token: Some((AccessToken::new("a"), now + chrono::Duration::seconds(600))),
            refresh_token: None,
        };
        assert_eq!(cache.fresh_token(now), Some(AccessToken::new("a")));
    }
}
