use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reqwest::cookie::CookieStore;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, http::header::COOKIE, Message},
};
use tracing::{debug, warn};
use url::Url;

use crate::api::SessionCookies;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid socket endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("socket handshake failed for {url}: {reason}")]
    Handshake { url: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Frame(String),
    Closed { reason: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    Text(String),
    Close,
}

pub struct TransportLink {
    pub outbound: mpsc::UnboundedSender<TransportCommand>,
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self, url: &Url) -> Result<TransportLink, TransportError>;
}

#[derive(Default)]
pub struct WebSocketConnector {
    cookies: Option<Arc<SessionCookies>>,
}

impl WebSocketConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cookies(cookies: Arc<SessionCookies>) -> Self {
        Self {
            cookies: Some(cookies),
        }
    }

    fn cookie_header(&self, url: &Url) -> Option<reqwest::header::HeaderValue> {
        let cookies = self.cookies.as_ref()?;
        // HttpOnly cookies are only released for http(s) urls.
        let mut lookup = url.clone();
        let scheme = if url.scheme() == "wss" { "https" } else { "http" };
        lookup.set_scheme(scheme).ok()?;
        cookies.cookies(&lookup)
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, url: &Url) -> Result<TransportLink, TransportError> {
        let handshake_error = |reason: String| TransportError::Handshake {
            url: url.to_string(),
            reason,
        };

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|err| handshake_error(err.to_string()))?;
        if let Some(cookie) = self.cookie_header(url) {
            request.headers_mut().insert(COOKIE, cookie);
        }

        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|err| handshake_error(err.to_string()))?;
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<TransportCommand>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<TransportEvent>();

        tokio::spawn(async move {
            let reason = loop {
                tokio::select! {
                    command = outbound_rx.recv() => match command {
                        Some(TransportCommand::Text(text)) => {
                            if let Err(err) = ws_write.send(Message::Text(text)).await {
                                warn!(error = %err, "failed to write socket frame");
                                break Some(err.to_string());
                            }
                        }
                        Some(TransportCommand::Close) | None => {
                            if let Err(err) = ws_write.send(Message::Close(None)).await {
                                debug!(error = %err, "failed to send close frame");
                            }
                            break Some("closed by client".to_string());
                        }
                    },
                    frame = ws_read.next() => match frame {
                        Some(Ok(Message::Text(text))) => {
                            if inbound_tx.send(TransportEvent::Frame(text)).is_err() {
                                break None;
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            break frame.map(|frame| format!("{} {}", frame.code, frame.reason));
                        }
                        Some(Ok(Message::Binary(bytes))) => {
                            debug!(len = bytes.len(), "ignoring binary socket frame");
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => break Some(err.to_string()),
                        None => break None,
                    },
                }
            };
            let _ = inbound_tx.send(TransportEvent::Closed { reason });
        });

        Ok(TransportLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
