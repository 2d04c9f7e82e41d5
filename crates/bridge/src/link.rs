//! WebSocket link to the protocol helper.
//!
//! Implements request-response with UUID correlation, ping/pong
//! keepalive, and routing of push events to per-device channels.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use atvlink_protocol::{DeviceEvent, DeviceId};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::constants::{LINK_CONNECT_TIMEOUT, MessageType, WS_MAX_MESSAGE_SIZE, WS_REQUEST_TIMEOUT};
use crate::envelope::Message;
use crate::error::BridgeError;

pub(crate) type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<Message>>>>;
pub(crate) type RouteMap = Arc<Mutex<HashMap<DeviceId, mpsc::Sender<DeviceEvent>>>>;

/// First message sent on a new link.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloRequest {
    pub client: String,
    pub version: String,
}

/// Helper's answer to [`HelloRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WelcomeResponse {
    pub version: String,
}

/// One WebSocket link shared by every device session.
pub struct BridgeLink {
    write_tx: mpsc::Sender<tungstenite::Message>,
    pending: PendingMap,
    routes: RouteMap,
    closed: Arc<AtomicBool>,
    read_handle: tokio::task::JoinHandle<()>,
    write_handle: tokio::task::JoinHandle<()>,
    ping_handle: tokio::task::JoinHandle<()>,
    cancel: CancellationToken,
}

impl BridgeLink {
    /// Connects to the helper and performs the hello exchange, giving up
    /// after [`LINK_CONNECT_TIMEOUT`].
    pub async fn connect(url: &str) -> Result<Arc<Self>, BridgeError> {
        tokio::time::timeout(LINK_CONNECT_TIMEOUT, Self::open(url))
            .await
            .map_err(|_| BridgeError::Timeout)?
    }

    async fn open(url: &str) -> Result<Arc<Self>, BridgeError> {
        let mut ws_config = tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
        let (ws_stream, _) =
            tokio_tungstenite::connect_async_with_config(url, Some(ws_config), false).await?;
        let (write, read) = ws_stream.split();

        let (write_tx, write_rx) = mpsc::channel::<tungstenite::Message>(256);
        let link = Self::spawn(write_tx, write_rx, read, write);

        let hello = HelloRequest {
            client: client_name(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        };
        let resp = link.request(MessageType::Hello, None, Some(&hello)).await?;
        if resp.msg_type != MessageType::Welcome {
            return Err(BridgeError::UnexpectedResponse(format!("{:?}", resp.msg_type)));
        }
        if let Ok(Some(welcome)) = resp.parse_payload::<WelcomeResponse>() {
            info!(url, helper_version = %welcome.version, "protocol helper link up");
        }
        Ok(link)
    }

    /// Starts the pumps over an already-split stream.
    pub(crate) fn spawn<R, W>(
        write_tx: mpsc::Sender<tungstenite::Message>,
        write_rx: mpsc::Receiver<tungstenite::Message>,
        read: R,
        write: W,
    ) -> Arc<Self>
    where
        R: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>>
            + Unpin
            + Send
            + 'static,
        W: futures_util::SinkExt<tungstenite::Message, Error = tungstenite::Error>
            + Unpin
            + Send
            + 'static,
    {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let routes: RouteMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();

        let write_handle = tokio::spawn(crate::pumps::write::write_pump(
            write,
            write_rx,
            cancel.clone(),
        ));
        let read_handle = tokio::spawn(crate::pumps::read::read_pump(
            read,
            pending.clone(),
            routes.clone(),
            closed.clone(),
            write_tx.clone(),
            cancel.clone(),
        ));
        let ping_handle = tokio::spawn(crate::pumps::ping::ping_pump(
            write_tx.clone(),
            routes.clone(),
            cancel.clone(),
        ));

        Arc::new(Self {
            write_tx,
            pending,
            routes,
            closed,
            read_handle,
            write_handle,
            ping_handle,
            cancel,
        })
    }

    /// Sends a request and waits for the response with the default timeout.
    pub async fn request<T: Serialize>(
        &self,
        msg_type: MessageType,
        device: Option<&DeviceId>,
        payload: Option<&T>,
    ) -> Result<Message, BridgeError> {
        self.request_with_timeout(msg_type, device, payload, WS_REQUEST_TIMEOUT)
            .await
    }

    /// Sends a request and waits up to `timeout` for the response.
    pub async fn request_with_timeout<T: Serialize>(
        &self,
        msg_type: MessageType,
        device: Option<&DeviceId>,
        payload: Option<&T>,
        timeout: Duration,
    ) -> Result<Message, BridgeError> {
        if self.is_closed() {
            return Err(BridgeError::Closed);
        }

        let id = uuid::Uuid::new_v4().to_string();
        let mut msg = Message::new(&id, msg_type, payload)?;
        if let Some(device) = device {
            msg = msg.for_device(device);
        }
        let json = serde_json::to_string(&msg)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        if self
            .write_tx
            .send(tungstenite::Message::Text(json.into()))
            .await
            .is_err()
        {
            self.pending.lock().await.remove(&id);
            return Err(BridgeError::Closed);
        }

        let result = tokio::time::timeout(timeout, rx).await;

        // Clean up pending entry on any exit path.
        self.pending.lock().await.remove(&id);

        match result {
            Ok(Ok(resp)) => {
                if let Some(err) = &resp.error {
                    return Err(BridgeError::Remote {
                        code: err.code,
                        message: err.message.clone(),
                    });
                }
                Ok(resp)
            }
            Ok(Err(_)) => Err(BridgeError::Closed),
            Err(_) => Err(BridgeError::Timeout),
        }
    }

    /// Routes push events for `device` to `events`, replacing any previous route.
    pub async fn register_device(&self, device: &DeviceId, events: mpsc::Sender<DeviceEvent>) {
        self.routes.lock().await.insert(device.clone(), events);
    }

    /// Stops routing events for `device`. Dropping the sender closes the
    /// session's event channel.
    pub async fn unregister_device(&self, device: &DeviceId) {
        if self.routes.lock().await.remove(device).is_some() {
            debug!(device = %device, "event route removed");
        }
    }

    /// Returns true once the read pump has exited.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Gracefully closes the link.
    pub async fn close(&self) {
        self.cancel.cancel();
        let _ = self.write_tx.send(tungstenite::Message::Close(None)).await;
    }
}

impl Drop for BridgeLink {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.read_handle.abort();
        self.write_handle.abort();
        self.ping_handle.abort();
    }
}

/// Name this driver announces to the helper.
fn client_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .map(|h| format!("atvlink@{h}"))
        .unwrap_or_else(|| "atvlink".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{sink, stream};

    fn idle_link() -> (Arc<BridgeLink>, mpsc::Receiver<tungstenite::Message>) {
        let (out_tx, out_rx) = mpsc::channel::<tungstenite::Message>(16);
        let sink = Box::pin(sink::unfold(out_tx, |tx, msg: tungstenite::Message| async move {
            let _ = tx.send(msg).await;
            Ok::<_, tungstenite::Error>(tx)
        }));
        let read = stream::pending::<Result<tungstenite::Message, tungstenite::Error>>();
        let (write_tx, write_rx) = mpsc::channel(16);
        (BridgeLink::spawn(write_tx, write_rx, read, sink), out_rx)
    }

    #[tokio::test]
    async fn request_tags_device_and_times_out() {
        tokio::time::pause();
        let (link, mut out) = idle_link();

        let l = link.clone();
        let handle = tokio::spawn(async move {
            l.request_with_timeout::<()>(
                MessageType::Disconnect,
                Some(&DeviceId::new("tv-1")),
                None,
                Duration::from_secs(1),
            )
            .await
        });

        let sent = out.recv().await.unwrap();
        let tungstenite::Message::Text(text) = sent else {
            panic!("expected text frame");
        };
        let msg: Message = serde_json::from_str(&text).unwrap();
        assert_eq!(msg.msg_type, MessageType::Disconnect);
        assert_eq!(msg.device, Some(DeviceId::new("tv-1")));

        tokio::time::advance(Duration::from_secs(2)).await;
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(BridgeError::Timeout)));
        assert!(link.pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn register_and_unregister_routes() {
        let (link, _out) = idle_link();
        let (tx, mut rx) = mpsc::channel(4);
        let id = DeviceId::new("tv-1");

        link.register_device(&id, tx).await;
        assert_eq!(link.routes.lock().await.len(), 1);

        link.unregister_device(&id).await;
        assert!(rx.recv().await.is_none(), "channel closes once unrouted");
    }
}
