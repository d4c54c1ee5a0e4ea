//! HTTP to WebSocket upgrade handshake

use std::fmt;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::{Role, WebSocketConfig};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, warn};

use super::connection_pool::ConnectionPool;
use super::WEBSOCKET_VERSION;
use crate::config::Config;
use crate::relay::{Connection, RelayOptions};
use crate::RelayError;

/// Reason an upgrade request was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Request method is not GET
    MethodNotAllowed,
    /// A required upgrade token is missing from a header
    MissingToken {
        /// Header that lacked the token
        header: &'static str,
        /// Token expected in it
        token: &'static str,
    },
    /// `Sec-WebSocket-Version` is not 13
    UnsupportedVersion,
    /// `Sec-WebSocket-Key` is missing
    MissingKey,
    /// Connection limit reached
    AtCapacity,
}

impl Rejection {
    /// HTTP status sent back to the client
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::MissingToken { .. } | Self::UnsupportedVersion | Self::MissingKey => {
                StatusCode::BAD_REQUEST
            }
            Self::AtCapacity => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MethodNotAllowed => write!(f, "request method is not GET"),
            Self::MissingToken { header, token } => {
                write!(f, "'{token}' token not found in '{header}' header")
            }
            Self::UnsupportedVersion => write!(
                f,
                "unsupported version: {WEBSOCKET_VERSION} not found in 'Sec-WebSocket-Version' header"
            ),
            Self::MissingKey => write!(f, "'Sec-WebSocket-Key' header is missing or blank"),
            Self::AtCapacity => write!(f, "connection limit reached"),
        }
    }
}

impl From<Rejection> for RelayError {
    fn from(rejection: Rejection) -> Self {
        Self::Handshake(rejection.to_string())
    }
}

/// Performs the upgrade handshake and starts a relay per transport
///
/// Holds the single transport configuration every connection uses.
#[derive(Debug, Clone)]
pub struct Upgrader {
    websocket_config: WebSocketConfig,
    relay_options: RelayOptions,
    pool: ConnectionPool,
}

impl Upgrader {
    /// Create an upgrader from the process configuration
    #[must_use]
    pub fn new(config: &Config, pool: ConnectionPool) -> Self {
        Self {
            websocket_config: config.websocket_config(),
            relay_options: config.relay_options(),
            pool,
        }
    }

    /// Check that a request asks for a WebSocket upgrade
    ///
    /// Returns the `Sec-WebSocket-Accept` value for the response.
    ///
    /// # Errors
    ///
    /// Returns the rejection to report to the client
    pub fn validate_request<B>(request: &Request<B>) -> Result<String, Rejection> {
        if request.method() != Method::GET {
            return Err(Rejection::MethodNotAllowed);
        }

        let headers = request.headers();

        if !header_has_token(headers, &header::CONNECTION, "upgrade") {
            return Err(Rejection::MissingToken {
                header: "Connection",
                token: "upgrade",
            });
        }

        if !header_has_token(headers, &header::UPGRADE, "websocket") {
            return Err(Rejection::MissingToken {
                header: "Upgrade",
                token: "websocket",
            });
        }

        if !header_has_token(headers, &header::SEC_WEBSOCKET_VERSION, WEBSOCKET_VERSION) {
            return Err(Rejection::UnsupportedVersion);
        }

        let key = headers
            .get(header::SEC_WEBSOCKET_KEY)
            .map(HeaderValue::as_bytes)
            .filter(|key| !key.iter().all(u8::is_ascii_whitespace))
            .ok_or(Rejection::MissingKey)?;

        Ok(derive_accept_key(key))
    }

    /// Answer one HTTP request
    ///
    /// Valid upgrade requests get `101 Switching Protocols` and a relay is
    /// started on the upgraded transport in the background; anything else
    /// gets an error response and never reaches the relay.
    pub fn upgrade<B>(&self, mut request: Request<B>) -> Response<Full<Bytes>>
    where
        B: Send + 'static,
    {
        let accept_key = match Self::validate_request(&request) {
            Ok(key) => key,
            Err(rejection) => {
                debug!("Handshake rejected: {}", rejection);
                return Self::rejection_response(&rejection);
            }
        };

        let Some(guard) = self.pool.try_acquire() else {
            warn!(
                "Connection limit reached ({}), refusing upgrade",
                self.pool.max_connections()
            );
            return Self::rejection_response(&Rejection::AtCapacity);
        };

        let on_upgrade = hyper::upgrade::on(&mut request);
        let websocket_config = self.websocket_config;
        let relay_options = self.relay_options;

        tokio::spawn(async move {
            let upgraded = match on_upgrade.await {
                Ok(upgraded) => upgraded,
                Err(e) => {
                    warn!("Upgrade failed: {}", e);
                    return;
                }
            };

            debug!("Connection made");
            let ws = WebSocketStream::from_raw_socket(
                TokioIo::new(upgraded),
                Role::Server,
                Some(websocket_config),
            )
            .await;

            let handle = Connection::accept(ws, &relay_options);
            if let Err(e) = handle.wait().await {
                error!("Relay task failed: {}", e);
            }
            drop(guard);
        });

        Self::switching_protocols(&accept_key)
    }

    /// Build the `101 Switching Protocols` response
    ///
    /// # Panics
    ///
    /// Panics if response builder fails (should never happen with a
    /// derived accept key)
    #[must_use]
    pub fn switching_protocols(accept_key: &str) -> Response<Full<Bytes>> {
        Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(header::CONNECTION, "Upgrade")
            .header(header::UPGRADE, "websocket")
            .header(header::SEC_WEBSOCKET_ACCEPT, accept_key)
            .body(Full::new(Bytes::new()))
            .expect("Failed to build response")
    }

    /// Build the error response for a refused handshake
    ///
    /// # Panics
    ///
    /// Panics if response builder fails (should never happen)
    #[must_use]
    pub fn rejection_response(rejection: &Rejection) -> Response<Full<Bytes>> {
        Response::builder()
            .status(rejection.status())
            .header(header::SEC_WEBSOCKET_VERSION, WEBSOCKET_VERSION)
            .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(Full::new(Bytes::from(format!(
                "{}: {rejection}",
                rejection.status()
            ))))
            .expect("Failed to build response")
    }
}

/// Whether a comma-separated header contains `token` (case-insensitive)
fn header_has_token(headers: &HeaderMap, name: &header::HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|part| part.trim().eq_ignore_ascii_case(token))
}
