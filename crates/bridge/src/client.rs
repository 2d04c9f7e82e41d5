//! `DeviceProtocolClient` backed by the protocol helper link.

use std::sync::Arc;
use std::time::Duration;

use atvlink_discovery::Scanner;
use atvlink_protocol::constants::PIN_TIMEOUT;
use atvlink_protocol::{
    CapabilitySet, Credential, DeviceConnection, DeviceDescriptor, DeviceEvent, DeviceId,
    DeviceProtocolClient, PairingHandle, PinMode, PinVerdict, PowerState, ProtocolCredential,
    ProtocolError, ProtocolFuture, ProtocolKind, RemoteCommand,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use crate::constants::MessageType;
use crate::error::BridgeError;
use crate::link::BridgeLink;

/// Extra time the link allows on top of the pairing PIN window.
const PIN_REQUEST_SLACK: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConnectRequest<'a> {
    device: &'a DeviceDescriptor,
    credential: &'a Credential,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectedResponse {
    #[serde(default)]
    capabilities: CapabilitySet,
    #[serde(default)]
    power_state: PowerState,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PairBeginRequest<'a> {
    device: &'a DeviceDescriptor,
    protocol: ProtocolKind,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum WirePinMode {
    Device,
    Host,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PairStartedResponse {
    session: String,
    pin_mode: WirePinMode,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PairPinRequest<'a> {
    session: &'a str,
    pin: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PairResultResponse {
    accepted: bool,
    #[serde(default)]
    credential: Option<String>,
}

#[derive(Debug, Serialize)]
struct PairCloseRequest<'a> {
    session: &'a str,
}

fn expect_payload<T: for<'de> Deserialize<'de>>(
    resp: &crate::envelope::Message,
    expected: MessageType,
) -> Result<T, BridgeError> {
    if resp.msg_type != expected {
        return Err(BridgeError::UnexpectedResponse(format!(
            "expected {expected:?}, got {:?}",
            resp.msg_type
        )));
    }
    resp.parse_payload::<T>()?
        .ok_or_else(|| BridgeError::UnexpectedResponse(format!("empty {expected:?} payload")))
}

/// Protocol client that delegates the device codec to the helper process.
///
/// The link is opened lazily and reopened on the next call after it drops.
pub struct BridgeClient {
    url: String,
    link: Mutex<Option<Arc<BridgeLink>>>,
    scanner: Scanner,
}

impl BridgeClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            link: Mutex::new(None),
            scanner: Scanner::new(),
        }
    }

    /// Uses a custom scanner for discovery.
    pub fn with_scanner(mut self, scanner: Scanner) -> Self {
        self.scanner = scanner;
        self
    }

    async fn live_link(&self) -> Option<Arc<BridgeLink>> {
        self.link
            .lock()
            .await
            .as_ref()
            .filter(|link| !link.is_closed())
            .cloned()
    }

    async fn link(&self) -> Result<Arc<BridgeLink>, BridgeError> {
        if let Some(link) = self.live_link().await {
            return Ok(link);
        }
        // Opened without the lock held; sessions racing here each open one
        // and the losers close theirs.
        debug!(url = %self.url, "opening protocol helper link");
        let opened = BridgeLink::connect(&self.url).await?;

        let mut guard = self.link.lock().await;
        if let Some(existing) = guard.as_ref().filter(|link| !link.is_closed()).cloned() {
            drop(guard);
            opened.close().await;
            return Ok(existing);
        }
        *guard = Some(opened.clone());
        Ok(opened)
    }

    /// Closes the helper link, if open.
    pub async fn close(&self) {
        if let Some(link) = self.link.lock().await.take() {
            link.close().await;
            info!("protocol helper link closed");
        }
    }
}

impl DeviceProtocolClient for BridgeClient {
    fn discover(&self, timeout: Duration) -> ProtocolFuture<'_, mpsc::Receiver<DeviceDescriptor>> {
        Box::pin(async move {
            self.scanner
                .scan_stream(timeout)
                .map_err(|e| ProtocolError::Unreachable(e.to_string()))
        })
    }

    fn pair(
        &self,
        device: &DeviceDescriptor,
        protocol: ProtocolKind,
    ) -> ProtocolFuture<'_, Box<dyn PairingHandle>> {
        let device = device.clone();
        Box::pin(async move {
            let link = self.link().await?;
            Ok(Box::new(BridgePairing {
                link,
                device,
                protocol,
                session: None,
            }) as Box<dyn PairingHandle>)
        })
    }

    fn connect(
        &self,
        device: &DeviceDescriptor,
        credential: &Credential,
        events: mpsc::Sender<DeviceEvent>,
    ) -> ProtocolFuture<'_, Arc<dyn DeviceConnection>> {
        let device = device.clone();
        let credential = credential.clone();
        Box::pin(async move {
            let link = self.link().await?;
            link.register_device(&device.id, events).await;

            let req = ConnectRequest {
                device: &device,
                credential: &credential,
            };
            let opened = match link
                .request(MessageType::Connect, Some(&device.id), Some(&req))
                .await
            {
                Ok(resp) => expect_payload::<ConnectedResponse>(&resp, MessageType::Connected),
                Err(e) => Err(e),
            };
            let info = match opened {
                Ok(info) => info,
                Err(e) => {
                    link.unregister_device(&device.id).await;
                    return Err(e.into());
                }
            };

            Ok(Arc::new(BridgeConnection {
                link,
                device: device.id,
                capabilities: info.capabilities,
                power_state: info.power_state,
            }) as Arc<dyn DeviceConnection>)
        })
    }
}

/// A device session opened through the helper.
struct BridgeConnection {
    link: Arc<BridgeLink>,
    device: DeviceId,
    capabilities: CapabilitySet,
    power_state: PowerState,
}

impl DeviceConnection for BridgeConnection {
    fn send(&self, command: &RemoteCommand) -> ProtocolFuture<'_, ()> {
        let command = command.clone();
        Box::pin(async move {
            let resp = self
                .link
                .request(MessageType::Command, Some(&self.device), Some(&command))
                .await?;
            if resp.msg_type != MessageType::Ack {
                return Err(ProtocolError::Rejected(format!(
                    "unexpected reply {:?}",
                    resp.msg_type
                )));
            }
            Ok(())
        })
    }

    fn capabilities(&self) -> CapabilitySet {
        self.capabilities.clone()
    }

    fn power_state(&self) -> PowerState {
        self.power_state
    }

    fn close(&self) -> ProtocolFuture<'_, ()> {
        Box::pin(async move {
            let result = self
                .link
                .request::<()>(MessageType::Disconnect, Some(&self.device), None)
                .await;
            self.link.unregister_device(&self.device).await;
            match result {
                Ok(_) | Err(BridgeError::Closed) => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
    }
}

/// Pairing handshake for one protocol, driven through the helper.
struct BridgePairing {
    link: Arc<BridgeLink>,
    device: DeviceDescriptor,
    protocol: ProtocolKind,
    session: Option<String>,
}

impl PairingHandle for BridgePairing {
    fn begin(&mut self) -> ProtocolFuture<'_, PinMode> {
        Box::pin(async move {
            let req = PairBeginRequest {
                device: &self.device,
                protocol: self.protocol,
            };
            let resp = self
                .link
                .request(MessageType::PairBegin, Some(&self.device.id), Some(&req))
                .await?;
            let started: PairStartedResponse = expect_payload(&resp, MessageType::PairStarted)?;
            self.session = Some(started.session);
            Ok(match started.pin_mode {
                WirePinMode::Device => PinMode::DeviceDisplaysPin,
                WirePinMode::Host => PinMode::HostProvidesPin,
            })
        })
    }

    fn verify_pin(&mut self, pin: &str) -> ProtocolFuture<'_, PinVerdict> {
        let pin = pin.to_string();
        Box::pin(async move {
            let Some(session) = self.session.as_deref() else {
                return Err(ProtocolError::Pairing("pairing not started".into()));
            };
            let req = PairPinRequest {
                session,
                pin: &pin,
            };
            let resp = self
                .link
                .request_with_timeout(
                    MessageType::PairPin,
                    Some(&self.device.id),
                    Some(&req),
                    PIN_TIMEOUT + PIN_REQUEST_SLACK,
                )
                .await?;
            let result: PairResultResponse = expect_payload(&resp, MessageType::PairResult)?;
            if !result.accepted {
                return Ok(PinVerdict::Rejected);
            }
            let secret = result
                .credential
                .ok_or_else(|| ProtocolError::Pairing("accepted without credential".into()))?;
            Ok(PinVerdict::Accepted(ProtocolCredential {
                protocol: self.protocol,
                secret,
            }))
        })
    }

    fn close(&mut self) -> ProtocolFuture<'_, ()> {
        Box::pin(async move {
            let Some(session) = self.session.take() else {
                return Ok(());
            };
            let req = PairCloseRequest { session: &session };
            if let Err(e) = self
                .link
                .request(MessageType::PairClose, Some(&self.device.id), Some(&req))
                .await
            {
                warn!(device = %self.device.id, error = %e, "pairing close failed");
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::LINK_CONNECT_TIMEOUT;
    use crate::envelope::Message;

    #[tokio::test(start_paused = true)]
    async fn stalled_helper_times_out_without_serializing_callers() {
        // Accepts TCP but never answers the upgrade.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let client = BridgeClient::new(url);

        let started = tokio::time::Instant::now();
        let (a, b) = tokio::join!(client.link(), client.link());
        assert!(matches!(a, Err(BridgeError::Timeout)));
        assert!(matches!(b, Err(BridgeError::Timeout)));
        assert!(started.elapsed() < LINK_CONNECT_TIMEOUT * 2);
        assert!(client.live_link().await.is_none());
        drop(listener);
    }

    #[test]
    fn expect_payload_checks_type() {
        let msg = Message::new("1", MessageType::Ack, Some(&serde_json::json!({}))).unwrap();
        let err = expect_payload::<serde_json::Value>(&msg, MessageType::Connected).unwrap_err();
        assert!(matches!(err, BridgeError::UnexpectedResponse(_)));
    }

    #[test]
    fn connected_response_defaults() {
        let msg = Message::new("1", MessageType::Connected, Some(&serde_json::json!({}))).unwrap();
        let info: ConnectedResponse = expect_payload(&msg, MessageType::Connected).unwrap();
        assert!(info.capabilities.is_empty());
        assert_eq!(info.power_state, PowerState::Unknown);
    }

    #[test]
    fn pair_started_parses_pin_mode() {
        let payload = serde_json::json!({"session": "s1", "pinMode": "host"});
        let msg = Message::new("1", MessageType::PairStarted, Some(&payload)).unwrap();
        let started: PairStartedResponse = expect_payload(&msg, MessageType::PairStarted).unwrap();
        assert_eq!(started.session, "s1");
        assert!(matches!(started.pin_mode, WirePinMode::Host));
    }

    #[test]
    fn connect_request_shape() {
        let device = DeviceDescriptor::new("tv-1", "Living Room");
        let mut credential = Credential::new();
        credential.insert(ProtocolCredential {
            protocol: ProtocolKind::Companion,
            secret: "abc".into(),
        });
        let json = serde_json::to_value(ConnectRequest {
            device: &device,
            credential: &credential,
        })
        .unwrap();
        assert_eq!(json["device"]["id"], "tv-1");
        assert_eq!(json["credential"][0]["protocol"], "companion");
    }
}
