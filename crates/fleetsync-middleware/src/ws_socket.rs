//! WebSocket implementation of the outward socket.
//!
//! [`WsOutwardSocket`] connects to an external dashboard, then:
//!
//! 1. **Forwards** every `ContextUpdated` notification from the [`EventBus`]
//!    as a JSON text frame.
//! 2. **Sends** frames queued through [`OutwardSocket::send`].
//! 3. **Announces** `socket_connected` / `socket_disconnected` on the
//!    lifecycle topic.
//!
//! The JWT, when configured, travels as a bearer `Authorization` header on
//! the upgrade request.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use fleetsync_types::{FleetError, LifecycleEvent};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tracing::{debug, info, warn};

use crate::adapter::{OutwardSocket, SocketTarget};
use crate::bus::{EventBus, Topic};

const SOURCE: &str = "fleetsync-middleware::ws_socket";

/// How long `disconnect` waits for the close handshake before aborting.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

struct Connection {
    tx: mpsc::UnboundedSender<String>,
    task: JoinHandle<()>,
}

/// Outward socket backed by `tokio-tungstenite`.
pub struct WsOutwardSocket {
    bus: Arc<EventBus>,
    connection: Mutex<Option<Connection>>,
    connected: Arc<AtomicBool>,
}

impl WsOutwardSocket {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            connection: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl OutwardSocket for WsOutwardSocket {
    async fn connect(&self, target: &SocketTarget) -> Result<(), FleetError> {
        let mut slot = self.connection.lock().await;
        if slot.is_some() && self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }

        let url = target.url();
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| FleetError::Connection(format!("invalid socket url {url}: {e}")))?;
        if let Some(jwt) = &target.jwt {
            let value = HeaderValue::from_str(&format!("Bearer {jwt}"))
                .map_err(|e| FleetError::InvalidConfig(format!("jwt is not a valid header value: {e}")))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (stream, _response) = connect_async(request)
            .await
            .map_err(|e| FleetError::Connection(format!("socket connect to {url}: {e}")))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let bus_rx = self.bus.subscribe_to(Topic::Context);
        self.connected.store(true, Ordering::SeqCst);
        let task = tokio::spawn(run_connection(
            stream,
            rx,
            bus_rx,
            Arc::clone(&self.bus),
            Arc::clone(&self.connected),
        ));
        *slot = Some(Connection { tx, task });

        info!(%url, "outward socket connected");
        self.bus.lifecycle(SOURCE, LifecycleEvent::SocketConnected);
        Ok(())
    }

    async fn send(&self, frame: String) -> Result<(), FleetError> {
        let slot = self.connection.lock().await;
        match slot.as_ref() {
            Some(conn) if self.connected.load(Ordering::SeqCst) => conn
                .tx
                .send(frame)
                .map_err(|_| FleetError::Unavailable("outward socket closed".to_string())),
            _ => Err(FleetError::Unavailable("outward socket not connected".to_string())),
        }
    }

    async fn disconnect(&self) -> Result<(), FleetError> {
        let Some(conn) = self.connection.lock().await.take() else {
            return Ok(());
        };
        let Connection { tx, mut task } = conn;
        // Closing the queue makes the connection task send a Close frame.
        drop(tx);
        if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
            warn!("outward socket did not close in time; aborting");
            task.abort();
            self.connected.store(false, Ordering::SeqCst);
            self.bus.lifecycle(SOURCE, LifecycleEvent::SocketDisconnected);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

async fn run_connection<S>(
    stream: tokio_tungstenite::WebSocketStream<S>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    mut bus_rx: crate::bus::TopicReceiver,
    bus: Arc<EventBus>,
    connected: Arc<AtomicBool>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut ws_tx, mut ws_rx) = stream.split();

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                match frame {
                    Some(text) => {
                        if ws_tx.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            event = bus_rx.recv() => {
                match event {
                    Ok(event) => {
                        let Ok(json) = serde_json::to_string(&event) else { continue };
                        if ws_tx.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(lagged_by = n, "outward socket lagged behind context updates");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(other)) => debug!(?other, "ignoring inbound socket frame"),
                }
            }
        }
    }

    connected.store(false, Ordering::SeqCst);
    info!("outward socket disconnected");
    bus.lifecycle(SOURCE, LifecycleEvent::SocketDisconnected);
}
