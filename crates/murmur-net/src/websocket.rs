//! WebSocket transport built on `tokio-tungstenite`.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, COOKIE};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

use crate::error::TransportError;
use crate::transport::{Connector, TransportEvent, TransportLink};

/// Opens `ws://` / `wss://` links, optionally presenting a session cookie.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: Url,
    cookie: Option<String>,
}

impl WsConnector {
    pub fn new(url: Url, cookie: Option<String>) -> Result<Self, TransportError> {
        match url.scheme() {
            "ws" => Ok(Self { url, cookie }),
            "wss" => {
                // Fails only when a provider is already installed.
                let _ = rustls::crypto::ring::default_provider().install_default();
                Ok(Self { url, cookie })
            }
            other => Err(TransportError::InvalidEndpoint(format!(
                "unsupported scheme '{other}'"
            ))),
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<TransportLink, TransportError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::InvalidEndpoint(e.to_string()))?;

        if let Some(cookie) = &self.cookie {
            let value = HeaderValue::from_str(cookie)
                .map_err(|e| TransportError::InvalidEndpoint(format!("bad cookie: {e}")))?;
            request.headers_mut().insert(COOKIE, value);
        }

        let (ws_stream, response) = connect_async(request)
            .await
            .map_err(|e| TransportError::Refused(e.to_string()))?;
        debug!(url = %self.url, status = %response.status(), "WebSocket handshake complete");

        let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<TransportEvent>();

        let pump = tokio::spawn(async move {
            pump_websocket(ws_stream, out_rx, in_tx).await;
        });

        Ok(TransportLink::new(out_tx, in_rx, Some(pump)))
    }
}

/// Shuttle frames between the socket and the link channels until either
/// side goes away.
async fn pump_websocket(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut out_rx: mpsc::UnboundedReceiver<String>,
    in_tx: mpsc::UnboundedSender<TransportEvent>,
) {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    loop {
        tokio::select! {
            outgoing = out_rx.recv() => {
                match outgoing {
                    Some(text) => {
                        if let Err(e) = ws_sender.send(Message::Text(text)).await {
                            warn!(error = %e, "WebSocket write failed");
                            let _ = in_tx.send(TransportEvent::Error(e.to_string()));
                            break;
                        }
                    }
                    None => {
                        let _ = ws_sender.send(Message::Close(None)).await;
                        break;
                    }
                }
            }

            incoming = ws_receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if in_tx.send(TransportEvent::Text(text)).is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => {
                            if in_tx.send(TransportEvent::Text(text)).is_err() {
                                break;
                            }
                        }
                        Err(_) => {
                            let _ = in_tx.send(TransportEvent::Error(
                                "binary frame is not UTF-8".into(),
                            ));
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        debug!(frame = ?frame, "WebSocket closed by server");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let _ = in_tx.send(TransportEvent::Error(e.to_string()));
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    let _ = in_tx.send(TransportEvent::Closed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_http_scheme() {
        let url = Url::parse("http://localhost:8080/ws").unwrap();
        assert!(matches!(
            WsConnector::new(url, None),
            Err(TransportError::InvalidEndpoint(_))
        ));
    }

    #[test]
    fn test_accepts_ws_and_wss() {
        for raw in ["ws://localhost:8080/ws", "wss://forum.example/ws"] {
            let url = Url::parse(raw).unwrap();
            let connector = WsConnector::new(url, Some("session=abc".into())).unwrap();
            assert_eq!(connector.url().path(), "/ws");
        }
    }

    #[tokio::test]
    async fn test_refused_connection_is_transport_error() {
        // Port 9 (discard) on loopback is not expected to accept WebSocket upgrades.
        let url = Url::parse("ws://127.0.0.1:9/ws").unwrap();
        let connector = WsConnector::new(url, None).unwrap();
        assert!(matches!(
            connector.connect().await,
            Err(TransportError::Refused(_))
        ));
    }

    #[tokio::test]
    async fn test_wss_attempts_a_tls_handshake() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            // Accept and hang up before any handshake.
            let _ = listener.accept().await;
        });

        let url = Url::parse(&format!("wss://127.0.0.1:{port}/ws")).unwrap();
        let connector = WsConnector::new(url, None).unwrap();
        match connector.connect().await {
            Err(TransportError::Refused(reason)) => {
                assert!(!reason.contains("not compiled in"), "{reason}");
            }
            Err(other) => panic!("unexpected error {other:?}"),
            Ok(_) => panic!("handshake succeeded against a closed socket"),
        }
    }
}
