//! I/O traits and implementations for the hub client
//!
//! This module provides trait abstractions for frame reading, frame writing,
//! opening push transports and issuing HTTP requests. These traits enable
//! mockall-based testing without real network operations.
//!
//! The default implementations use `tokio-tungstenite` WebSockets and
//! `reqwest`.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::auth::{AccessToken, AuthError};
use crate::error::{HubError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const MAX_NEGOTIATE_REDIRECTS: usize = 5;

/// Transport pair containing a reader and writer
pub struct TransportPair {
    /// Reader for receiving frames
    pub reader: Box<dyn FrameReader>,
    /// Writer for sending frames
    pub writer: Box<dyn FrameWriter>,
}

// ============================================================================
// FrameReader trait and implementations
// ============================================================================

/// Trait for reading text frames from a push transport
#[async_trait]
#[cfg_attr(test, mockall::automock)]
pub trait FrameReader: Send {
    /// Read the next text frame
    ///
    /// Returns `Ok(Some(frame))` for a frame, `Ok(None)` once the transport
    /// has closed, or an error if reading failed.
    async fn read_frame(&mut self) -> Result<Option<String>>;
}

/// WebSocket implementation of FrameReader
pub struct WsFrameReader {
    read: SplitStream<WsStream>,
}

#[async_trait]
impl FrameReader for WsFrameReader {
    async fn read_frame(&mut self) -> Result<Option<String>> {
        loop {
            match self.read.next().await {
                None => return Ok(None),
                Some(Ok(Message::Text(text))) => return Ok(Some(text.as_str().to_owned())),
                Some(Ok(Message::Close(frame))) => {
                    debug!("WebSocket closed by server: {:?}", frame);
                    return Ok(None);
                }
                Some(Ok(Message::Binary(data))) => {
                    debug!("Ignoring {} byte binary frame", data.len());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(HubError::WebSocket(e.to_string())),
            }
        }
    }
}

// ============================================================================
// FrameWriter trait and implementations
// ============================================================================

/// Trait for writing text frames to a push transport
#[async_trait]
#[cfg_attr(test, mockall::automock)]
pub trait FrameWriter: Send {
    /// Write one text frame and flush it
    async fn write_frame(&mut self, frame: &str) -> Result<()>;

    /// Close the transport
    async fn shutdown(&mut self) -> Result<()>;
}

/// WebSocket implementation of FrameWriter
pub struct WsFrameWriter {
    write: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameWriter for WsFrameWriter {
    async fn write_frame(&mut self, frame: &str) -> Result<()> {
        self.write
            .send(Message::text(frame.to_owned()))
            .await
            .map_err(|e| HubError::SendError(e.to_string()))
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.write
            .close()
            .await
            .map_err(|e| HubError::WebSocket(e.to_string()))
    }
}

// ============================================================================
// TransportFactory trait and implementations
// ============================================================================

/// Trait for opening push transports
#[async_trait]
#[cfg_attr(test, mockall::automock)]
pub trait TransportFactory: Send + Sync {
    /// Open a transport to the hub at `hub_url`, authenticating with `token`
    ///
    /// The hub protocol handshake is not part of this call.
    async fn connect(&self, hub_url: &str, token: &AccessToken) -> Result<TransportPair>;
}

/// Body of a successful `/negotiate` call
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiateResponse {
    #[serde(default)]
    pub connection_id: Option<String>,
    #[serde(default)]
    pub connection_token: Option<String>,
    #[serde(default)]
    pub negotiate_version: u32,
    #[serde(default)]
    pub available_transports: Vec<AvailableTransport>,
    /// Redirect to another endpoint (e.g. a managed hub service)
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl NegotiateResponse {
    /// Identifier to pass as `id` on the transport URL
    pub fn connection_identifier(&self) -> Option<&str> {
        self.connection_token
            .as_deref()
            .or(self.connection_id.as_deref())
    }

    pub fn supports_websockets(&self) -> bool {
        self.available_transports
            .iter()
            .any(|t| t.transport == "WebSockets")
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailableTransport {
    pub transport: String,
    #[serde(default)]
    pub transfer_formats: Vec<String>,
}

/// WebSocket implementation of TransportFactory
pub struct WebSocketTransportFactory {
    http: Arc<dyn HttpClient>,
    skip_negotiation: bool,
}

impl WebSocketTransportFactory {
    /// Create a new WebSocket transport factory
    pub fn new(http: Arc<dyn HttpClient>, skip_negotiation: bool) -> Self {
        Self {
            http,
            skip_negotiation,
        }
    }

    /// Run `/negotiate`, following redirects
    ///
    /// Returns the URL to open and the token to present there.
    async fn negotiate(&self, hub_url: &str, token: &AccessToken) -> Result<(String, AccessToken)> {
        let mut url = hub_url.to_string();
        let mut token = token.clone();

        for _ in 0..MAX_NEGOTIATE_REDIRECTS {
            let negotiate_url = negotiate_url(&url)?;
            debug!("Negotiating with {}", negotiate_url);
            let response = self
                .http
                .post_empty(&negotiate_url, token.as_str())
                .await?;

            if response.status == StatusCode::UNAUTHORIZED.as_u16() {
                return Err(AuthError::Unauthorized(format!(
                    "Negotiation rejected by {}",
                    url
                ))
                .into());
            }
            if !(200..300).contains(&response.status) {
                return Err(HubError::Handshake(format!(
                    "Negotiation failed with status {}: {}",
                    response.status, response.body
                )));
            }

            let mut negotiated: NegotiateResponse = serde_json::from_str(&response.body)?;
            if let Some(error) = negotiated.error.take() {
                return Err(HubError::Handshake(error));
            }

            if let Some(redirect) = negotiated.url.take() {
                debug!("Negotiation redirected to {}", redirect);
                url = redirect;
                if let Some(redirect_token) = negotiated.access_token.take() {
                    token = AccessToken::new(redirect_token);
                }
                continue;
            }

            if !negotiated.supports_websockets() {
                return Err(HubError::Handshake(
                    "Server does not offer the WebSockets transport".to_string(),
                ));
            }

            let mut ws_url = to_ws_url(&url)?;
            if let Some(id) = negotiated.connection_identifier() {
                ws_url.query_pairs_mut().append_pair("id", id);
            }
            return Ok((ws_url.to_string(), token));
        }

        Err(HubError::Handshake(format!(
            "Negotiation exceeded {} redirects",
            MAX_NEGOTIATE_REDIRECTS
        )))
    }
}

#[async_trait]
impl TransportFactory for WebSocketTransportFactory {
    async fn connect(&self, hub_url: &str, token: &AccessToken) -> Result<TransportPair> {
        let (ws_url, token) = if self.skip_negotiation {
            (to_ws_url(hub_url)?.to_string(), token.clone())
        } else {
            self.negotiate(hub_url, token).await?
        };

        debug!("Opening WebSocket to {}", ws_url);
        let mut request = ws_url
            .as_str()
            .into_client_request()
            .map_err(|e| HubError::ConnectionFailed(format!("Invalid hub URL {}: {}", ws_url, e)))?;
        if !token.is_empty() {
            let value = HeaderValue::from_str(&format!("Bearer {}", token.as_str()))
                .map_err(|e| AuthError::Failed(format!("Token is not a valid header: {}", e)))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (stream, _) = connect_async(request).await.map_err(map_ws_connect_error)?;
        debug!("WebSocket established to {}", ws_url);

        let (write, read) = stream.split();
        Ok(TransportPair {
            reader: Box::new(WsFrameReader { read }),
            writer: Box::new(WsFrameWriter { write }),
        })
    }
}

fn map_ws_connect_error(e: tokio_tungstenite::tungstenite::Error) -> HubError {
    use tokio_tungstenite::tungstenite::Error;
    match e {
        Error::Http(response) if response.status() == StatusCode::UNAUTHORIZED => {
            AuthError::Unauthorized("WebSocket upgrade rejected".to_string()).into()
        }
        Error::Http(response) => HubError::Handshake(format!(
            "WebSocket upgrade failed with status {}",
            response.status()
        )),
        other => HubError::ConnectionFailed(other.to_string()),
    }
}

/// `{hub}/negotiate?negotiateVersion=1`, keeping any query already on the hub URL
pub fn negotiate_url(hub_url: &str) -> Result<String> {
    let mut url = reqwest::Url::parse(hub_url)
        .map_err(|e| HubError::Config(format!("Invalid hub URL {}: {}", hub_url, e)))?;
    let path = format!("{}/negotiate", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.query_pairs_mut().append_pair("negotiateVersion", "1");
    Ok(url.to_string())
}

/// Map an http(s) hub URL onto the matching ws(s) URL
pub fn to_ws_url(hub_url: &str) -> Result<reqwest::Url> {
    let mut url = reqwest::Url::parse(hub_url)
        .map_err(|e| HubError::Config(format!("Invalid hub URL {}: {}", hub_url, e)))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(HubError::Config(format!(
                "Unsupported hub URL scheme: {}",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| HubError::Config(format!("Cannot use {} scheme for {}", scheme, hub_url)))?;
    Ok(url)
}

// ============================================================================
// HttpClient trait and implementations
// ============================================================================

/// HTTP response from a request
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Abstraction over HTTP client for dependency injection
///
/// An empty `bearer` sends no `Authorization` header.
#[async_trait]
#[cfg_attr(test, mockall::automock)]
pub trait HttpClient: Send + Sync {
    /// Send a POST request with form-encoded body
    async fn post_form(&self, url: &str, params: &[(&str, &str)]) -> Result<HttpResponse>;

    /// Send a POST request with a JSON body
    async fn post_json(&self, url: &str, bearer: &str, body: &Value) -> Result<HttpResponse>;

    /// Send a POST request without a body
    async fn post_empty(&self, url: &str, bearer: &str) -> Result<HttpResponse>;
}

/// Production HTTP client using reqwest
#[derive(Default)]
pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    async fn finish(
        url: &str,
        request: reqwest::RequestBuilder,
        bearer: &str,
    ) -> Result<HttpResponse> {
        let request = if bearer.is_empty() {
            request
        } else {
            request.bearer_auth(bearer)
        };
        let response = request
            .send()
            .await
            .map_err(|e| HubError::Http(format!("POST {} failed: {}", url, e)))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| HubError::Http(format!("Reading response body: {}", e)))?;

        debug!("POST {} -> {} ({} bytes)", url, status, body.len());
        Ok(HttpResponse { status, body })
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn post_form(&self, url: &str, params: &[(&str, &str)]) -> Result<HttpResponse> {
        debug!("POST {} (form)", url);
        Self::finish(url, self.client.post(url).form(params), "").await
    }

    async fn post_json(&self, url: &str, bearer: &str, body: &Value) -> Result<HttpResponse> {
        debug!("POST {} (json)", url);
        Self::finish(url, self.client.post(url).json(body), bearer).await
    }

    async fn post_empty(&self, url: &str, bearer: &str) -> Result<HttpResponse> {
        debug!("POST {}", url);
        Self::finish(url, self.client.post(url), bearer).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A URL that will always refuse connections (port 1 is reserved and unbound)
    const UNREACHABLE_URL: &str = "http://127.0.0.1:1/test";

    #[test]
    fn ws_url_follows_http_scheme() {
        assert_eq!(
            to_ws_url("http://localhost:5000/purchaseOrderHub")
                .unwrap()
                .as_str(),
            "ws://localhost:5000/purchaseOrderHub"
        );
        assert_eq!(
            to_ws_url("https://api.example.com/purchaseOrderHub")
                .unwrap()
                .as_str(),
            "wss://api.example.com/purchaseOrderHub"
        );
        assert!(to_ws_url("ftp://example.com/hub").is_err());
    }

    #[test]
    fn negotiate_url_appends_path_and_version() {
        assert_eq!(
            negotiate_url("https://api.example.com/purchaseOrderHub").unwrap(),
            "https://api.example.com/purchaseOrderHub/negotiate?negotiateVersion=1"
        );
    }

    #[test]
    fn negotiate_response_prefers_connection_token() {
        let response: NegotiateResponse = serde_json::from_str(
            r#"{
                "connectionId": "abc",
                "connectionToken": "tok",
                "negotiateVersion": 1,
                "availableTransports": [
                    {"transport": "WebSockets", "transferFormats": ["Text", "Binary"]},
                    {"transport": "LongPolling", "transferFormats": ["Text"]}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(response.connection_identifier(), Some("tok"));
        assert!(response.supports_websockets());
    }

    #[tokio::test]
    async fn negotiation_unauthorized_is_auth_error() {
        let mut http = MockHttpClient::new();
        http.expect_post_empty().returning(|_, _| {
            Box::pin(async {
                Ok(HttpResponse {
                    status: 401,
                    body: String::new(),
                })
            })
        });

        let factory = WebSocketTransportFactory::new(Arc::new(http), false);
        let err = factory
            .negotiate("http://localhost:5000/hub", &AccessToken::empty())
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::Auth(AuthError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn negotiation_builds_ws_url_with_id() {
        let mut http = MockHttpClient::new();
        http.expect_post_empty()
            .withf(|url, bearer| {
                url == "http://localhost:5000/hub/negotiate?negotiateVersion=1" && bearer == "t0k"
            })
            .returning(|_, _| {
                Box::pin(async {
                    Ok(HttpResponse {
                        status: 200,
                        body: r#"{"connectionToken":"c1","negotiateVersion":1,
                                 "availableTransports":[{"transport":"WebSockets","transferFormats":["Text"]}]}"#
                            .to_string(),
                    })
                })
            });

        let factory = WebSocketTransportFactory::new(Arc::new(http), false);
        let (url, token) = factory
            .negotiate("http://localhost:5000/hub", &AccessToken::new("t0k"))
            .await
            .unwrap();
        assert_eq!(url, "ws://localhost:5000/hub?id=c1");
        assert_eq!(token.as_str(), "t0k");
    }

    #[tokio::test]
    async fn negotiation_follows_redirect_with_new_token() {
        let mut http = MockHttpClient::new();
        http.expect_post_empty()
            .withf(|url, _| url.starts_with("http://localhost:5000/"))
            .returning(|_, _| {
                Box::pin(async {
                    Ok(HttpResponse {
                        status: 200,
                        body: r#"{"url":"https://hub.example.net/client/?hub=po","accessToken":"redirected"}"#
                            .to_string(),
                    })
                })
            });
        http.expect_post_empty()
            .withf(|url, bearer| url.starts_with("https://hub.example.net/") && bearer == "redirected")
            .returning(|_, _| {
                Box::pin(async {
                    Ok(HttpResponse {
                        status: 200,
                        body: r#"{"connectionId":"x","availableTransports":[{"transport":"WebSockets"}]}"#
                            .to_string(),
                    })
                })
            });

        let factory = WebSocketTransportFactory::new(Arc::new(http), false);
        let (url, token) = factory
            .negotiate("http://localhost:5000/hub", &AccessToken::new("original"))
            .await
            .unwrap();
        assert_eq!(url, "wss://hub.example.net/client/?hub=po&id=x");
        assert_eq!(token.as_str(), "redirected");
    }

    #[tokio::test]
    async fn negotiation_without_websockets_fails() {
        let mut http = MockHttpClient::new();
        http.expect_post_empty().returning(|_, _| {
            Box::pin(async {
                Ok(HttpResponse {
                    status: 200,
                    body: r#"{"connectionId":"x","availableTransports":[{"transport":"LongPolling"}]}"#
                        .to_string(),
                })
            })
        });

        let factory = WebSocketTransportFactory::new(Arc::new(http), false);
        let err = factory
            .negotiate("http://localhost:5000/hub", &AccessToken::empty())
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::Handshake(_)));
    }

    #[tokio::test]
    async fn post_form_connection_refused_returns_http_error() {
        let client = ReqwestHttpClient::default();
        let err = client
            .post_form(UNREACHABLE_URL, &[("key", "value")])
            .await
            .unwrap_err();

        match &err {
            HubError::Http(msg) => {
                assert!(
                    msg.starts_with("POST http://127.0.0.1:1/test failed:"),
                    "{msg}"
                );
            }
            other => panic!("expected HubError::Http, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn websocket_connect_refused_is_connection_failure() {
        let factory = WebSocketTransportFactory::new(Arc::new(ReqwestHttpClient::default()), true);
        let result = factory
            .connect(UNREACHABLE_URL, &AccessToken::empty())
            .await;
        assert!(matches!(result, Err(HubError::ConnectionFailed(_))));
    }
}
