//! Link read pump: dispatches responses and push events.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use atvlink_protocol::DeviceEvent;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::constants::{MessageType, WS_MAX_MESSAGE_SIZE, WS_PONG_WAIT};
use crate::envelope::Message;
use crate::link::{PendingMap, RouteMap};

/// Reads messages from the WebSocket and dispatches them.
///
/// Any incoming frame resets the read deadline; if nothing arrives within
/// [`WS_PONG_WAIT`] the link is considered dead. On exit every routed
/// device receives `ConnectionLost` and pending requests fail.
pub(crate) async fn read_pump<S>(
    mut read: S,
    pending: PendingMap,
    routes: RouteMap,
    closed: Arc<AtomicBool>,
    write_tx: mpsc::Sender<tungstenite::Message>,
    cancel: CancellationToken,
) where
    S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    let pong_deadline = tokio::time::sleep(WS_PONG_WAIT);
    tokio::pin!(pong_deadline);

    let reason = loop {
        tokio::select! {
            _ = cancel.cancelled() => break "link closed locally",

            () = &mut pong_deadline => {
                warn!("pong timeout, protocol helper link dead");
                break "keepalive timeout";
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        pong_deadline.as_mut().reset(tokio::time::Instant::now() + WS_PONG_WAIT);

                        match msg {
                            tungstenite::Message::Text(text) => {
                                handle_text_message(&text, &pending, &routes).await;
                            }
                            tungstenite::Message::Ping(data) => {
                                trace!("received ping, sending pong");
                                let _ = write_tx.send(tungstenite::Message::Pong(data)).await;
                            }
                            tungstenite::Message::Pong(_) => {
                                trace!("received pong");
                            }
                            tungstenite::Message::Close(_) => {
                                debug!("received close frame");
                                break "closed by helper";
                            }
                            _ => {}
                        }
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "link read error");
                        break "read error";
                    }
                    None => {
                        debug!("link stream ended");
                        break "stream ended";
                    }
                }
            }
        }
    };

    closed.store(true, Ordering::Release);
    // Dropping the senders fails every waiting request with `Closed`.
    pending.lock().await.clear();

    let routes: Vec<_> = routes.lock().await.drain().collect();
    for (device, tx) in routes {
        debug!(device = %device, reason, "notifying session of link loss");
        let _ = tx
            .send(DeviceEvent::ConnectionLost(format!("protocol helper: {reason}")))
            .await;
    }
}

/// Handles a text message from the link.
async fn handle_text_message(text: &str, pending: &PendingMap, routes: &RouteMap) {
    if text.len() > WS_MAX_MESSAGE_SIZE {
        warn!(bytes = text.len(), "message too large, dropping");
        return;
    }

    let msg: Message = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            warn!(error = %e, "failed to parse link message");
            return;
        }
    };

    trace!(msg_type = ?msg.msg_type, id = %msg.id, "received message");

    if msg.msg_type != MessageType::Event {
        let mut map = pending.lock().await;
        if let Some(tx) = map.remove(&msg.id) {
            let _ = tx.send(msg);
        } else {
            debug!(id = %msg.id, "response for unknown or expired request");
        }
        return;
    }

    let Some(device) = msg.device.clone() else {
        warn!(id = %msg.id, "push event without device, dropping");
        return;
    };
    let event = match msg.parse_payload::<DeviceEvent>() {
        Ok(Some(event)) => event,
        Ok(None) => {
            warn!(device = %device, "push event without payload");
            return;
        }
        Err(e) => {
            warn!(device = %device, error = %e, "unparseable push event");
            return;
        }
    };

    let guard = routes.lock().await;
    let Some(tx) = guard.get(&device) else {
        trace!(device = %device, "no session for push event, dropping");
        return;
    };
    match tx.try_send(event) {
        Ok(()) => {}
        Err(TrySendError::Full(event)) => {
            warn!(device = %device, ?event, "session event queue full, dropping event");
        }
        Err(TrySendError::Closed(_)) => {
            trace!(device = %device, "session event channel closed");
        }
    }
}
