//! JSON over WebSocket text frames
//!
//! The transport is handed out in `Pending` and connects in the background,
//! publishing `Connected` once the upgrade completes and `Disconnected` when
//! the connect fails, the peer closes, or any read/write fails.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use super::{ConnectionState, Transport, TransportFactory};
use crate::error::TransportError;
use crate::stream::{Publisher, Subscription};

/// Raw transport over a single WebSocket connection
pub struct WebSocketTransport {
    outgoing: mpsc::UnboundedSender<Value>,
    incoming: Publisher<Value>,
    state: Publisher<ConnectionState>,
    task: JoinHandle<()>,
}

impl WebSocketTransport {
    /// Start connecting to `url` (`ws://host:port/path`)
    pub fn connect(url: String) -> Self {
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let incoming = Publisher::new();
        let state = Publisher::replaying(Some(ConnectionState::Pending));

        let task = tokio::spawn(run(url, outgoing_rx, incoming.clone(), state.clone()));

        Self {
            outgoing,
            incoming,
            state,
            task,
        }
    }
}

async fn run(
    url: String,
    mut outgoing: mpsc::UnboundedReceiver<Value>,
    incoming: Publisher<Value>,
    state: Publisher<ConnectionState>,
) {
    let socket = match tokio_tungstenite::connect_async(url.as_str()).await {
        Ok((socket, _response)) => socket,
        Err(e) => {
            let err = TransportError::ConnectFailed {
                endpoint: url,
                reason: e.to_string(),
            };
            tracing::warn!("{}", err);
            state.publish(ConnectionState::Disconnected);
            return;
        }
    };

    tracing::info!("Connected to {}", url);
    state.publish(ConnectionState::Connected);

    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<Value>(&text) {
                            Ok(value) => incoming.publish(value),
                            Err(e) => tracing::warn!("Dropping non-JSON frame from {}: {}", url, e),
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!("Connection to {} closed by peer: {:?}", url, frame);
                        break;
                    }
                    Some(Ok(other)) => tracing::trace!("Ignoring frame: {:?}", other),
                    Some(Err(e)) => {
                        tracing::warn!("Read from {} failed: {}", url, e);
                        break;
                    }
                    None => {
                        tracing::info!("Connection to {} ended", url);
                        break;
                    }
                }
            }

            payload = outgoing.recv() => {
                let Some(payload) = payload else {
                    let _ = sink.close().await;
                    break;
                };
                if let Err(e) = sink.send(Message::Text(payload.to_string())).await {
                    tracing::warn!("Write to {} failed: {}", url, e);
                    break;
                }
            }
        }
    }

    state.publish(ConnectionState::Disconnected);
}

impl Transport for WebSocketTransport {
    fn send(&self, payload: Value) -> Result<(), TransportError> {
        self.outgoing
            .send(payload)
            .map_err(|_| TransportError::Closed)
    }

    fn incoming(&self) -> Subscription<Value> {
        self.incoming.subscribe()
    }

    fn connection_state(&self) -> Subscription<ConnectionState> {
        self.state.subscribe()
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Opens a new [`WebSocketTransport`] per connection attempt
#[derive(Debug, Clone)]
pub struct WebSocketTransportFactory {
    url: String,
}

impl WebSocketTransportFactory {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl TransportFactory for WebSocketTransportFactory {
    async fn create(&self) -> Result<Arc<dyn Transport>, TransportError> {
        tracing::debug!("Opening transport to {}", self.url);
        Ok(Arc::new(WebSocketTransport::connect(self.url.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    async fn next_state(sub: &mut Subscription<ConnectionState>) -> ConnectionState {
        sub.recv().await.unwrap()
    }

    #[tokio::test]
    async fn test_exchanges_json_text_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let transport = WebSocketTransport::connect(format!("ws://{}/ws", addr));
        let mut states = transport.connection_state();
        let mut incoming = transport.incoming();
        assert_eq!(next_state(&mut states).await, ConnectionState::Pending);

        let (tcp, _) = listener.accept().await.unwrap();
        let check_path = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            assert_eq!(req.uri().path(), "/ws");
            Ok(resp)
        };
        let mut server = tokio_tungstenite::accept_hdr_async(tcp, check_path)
            .await
            .unwrap();
        assert_eq!(next_state(&mut states).await, ConnectionState::Connected);

        transport.send(json!({"Varient": "GetPublicKey"})).unwrap();
        let frame = server.next().await.unwrap().unwrap();
        assert_eq!(
            serde_json::from_str::<Value>(frame.to_text().unwrap()).unwrap(),
            json!({"Varient": "GetPublicKey"})
        );

        server.send(Message::Text("not json".into())).await.unwrap();
        server
            .send(Message::Text(r#"{"variant":"KeyReceived"}"#.into()))
            .await
            .unwrap();
        assert_eq!(incoming.recv().await.unwrap(), json!({"variant": "KeyReceived"}));

        server.close(None).await.unwrap();
        assert_eq!(next_state(&mut states).await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_failure_reports_disconnected() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = WebSocketTransportFactory::new(format!("ws://{}/ws", addr))
            .create()
            .await
            .unwrap();
        let mut states = transport.connection_state();
        assert_eq!(next_state(&mut states).await, ConnectionState::Pending);
        assert_eq!(next_state(&mut states).await, ConnectionState::Disconnected);
        assert!(transport.send(json!(1)).is_err());
    }
}
