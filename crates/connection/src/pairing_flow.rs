//! Interactive pairing, one protocol after the other.
//!
//! The flow runs inside the session task. PINs typed by the user arrive on
//! a channel and are only accepted while the current step is
//! [`PairingStep::AwaitingUserPin`]; every wait is bounded and cancellable.

use std::sync::Arc;
use std::time::Duration;

use atvlink_protocol::constants::CLOSE_TIMEOUT;
use atvlink_protocol::{
    Credential, DeviceDescriptor, DeviceId, DeviceProtocolClient, PairingHandle, PinMode,
    PinVerdict, ProtocolCredential, ProtocolError, ProtocolKind,
};
use rand::Rng;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, sleep_until, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::DriverError;
use crate::types::{DriverEvent, EventSink, PairingSettings, PairingStep, PinOutcome};

/// A PIN typed by the user, with the channel its outcome is reported on.
pub(crate) struct PinSubmission {
    pub pin: String,
    pub reply: oneshot::Sender<Result<PinOutcome, DriverError>>,
}

pub(crate) struct PairingFlow {
    client: Arc<dyn DeviceProtocolClient>,
    descriptor: DeviceDescriptor,
    settings: PairingSettings,
    handshake_timeout: Duration,
    pins: mpsc::Receiver<PinSubmission>,
    step: watch::Sender<Option<PairingStep>>,
    events: EventSink,
    cancel: CancellationToken,
}

impl PairingFlow {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<dyn DeviceProtocolClient>,
        descriptor: DeviceDescriptor,
        settings: PairingSettings,
        handshake_timeout: Duration,
        pins: mpsc::Receiver<PinSubmission>,
        step: watch::Sender<Option<PairingStep>>,
        events: EventSink,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            descriptor,
            settings,
            handshake_timeout,
            pins,
            step,
            events,
            cancel,
        }
    }

    /// Pairs every selected protocol and returns the combined credential.
    pub async fn run(mut self) -> Result<Credential, DriverError> {
        let protocols = select_protocols(&self.settings.protocols, &self.descriptor);
        if protocols.is_empty() {
            let err = DriverError::PairingFailed("device offers no pairable protocol".into());
            self.set_step(PairingStep::Failed {
                reason: err.to_string(),
            });
            return Err(err);
        }

        let mut credential = Credential::new();
        for (i, &protocol) in protocols.iter().enumerate() {
            let next = protocols.get(i + 1).copied();
            match self.pair_protocol(protocol, next).await {
                Ok(part) => {
                    info!(device = %self.descriptor.id, %protocol, "protocol paired");
                    credential.insert(part);
                }
                Err(err) => {
                    self.set_step(PairingStep::Failed {
                        reason: err.to_string(),
                    });
                    return Err(err);
                }
            }
        }
        self.set_step(PairingStep::Succeeded);
        Ok(credential)
    }

    async fn pair_protocol(
        &mut self,
        protocol: ProtocolKind,
        next: Option<ProtocolKind>,
    ) -> Result<ProtocolCredential, DriverError> {
        self.set_step(PairingStep::Started { protocol });

        let opened = tokio::select! {
            _ = self.cancel.cancelled() => return Err(DriverError::Cancelled),
            r = timeout(self.handshake_timeout, self.client.pair(&self.descriptor, protocol)) => r,
        };
        let mut handle = match opened {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => return Err(pairing_error(e)),
            Err(_) => return Err(DriverError::PairingFailed("pairing handshake timed out".into())),
        };

        // The handshake is released whether or not it produced a secret.
        let result = self.exchange(handle.as_mut(), protocol, next).await;
        match timeout(CLOSE_TIMEOUT, handle.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "closing pairing handshake failed"),
            Err(_) => warn!(device = %self.descriptor.id, "closing pairing handshake timed out"),
        }
        result
    }

    async fn exchange(
        &mut self,
        handle: &mut dyn PairingHandle,
        protocol: ProtocolKind,
        next: Option<ProtocolKind>,
    ) -> Result<ProtocolCredential, DriverError> {
        let began = tokio::select! {
            _ = self.cancel.cancelled() => return Err(DriverError::Cancelled),
            r = timeout(self.handshake_timeout, handle.begin()) => r,
        };
        let mode = match began {
            Ok(Ok(mode)) => mode,
            Ok(Err(e)) => return Err(pairing_error(e)),
            Err(_) => return Err(DriverError::PairingFailed("pairing handshake timed out".into())),
        };
        debug!(device = %self.descriptor.id, %protocol, ?mode, "pairing started");

        match mode {
            PinMode::DeviceDisplaysPin => self.device_pin(handle, protocol, next).await,
            PinMode::HostProvidesPin => self.host_pin(handle, protocol).await,
        }
    }

    /// The device shows a PIN; the user submits it to us.
    async fn device_pin(
        &mut self,
        handle: &mut dyn PairingHandle,
        protocol: ProtocolKind,
        next: Option<ProtocolKind>,
    ) -> Result<ProtocolCredential, DriverError> {
        let max_attempts = self.settings.max_pin_attempts.max(1);
        let mut attempts_left = max_attempts;
        loop {
            self.set_step(PairingStep::AwaitingUserPin {
                protocol,
                attempts_left,
            });
            let deadline = Instant::now() + self.settings.pin_timeout;
            let PinSubmission { pin, reply } = tokio::select! {
                _ = self.cancel.cancelled() => return Err(DriverError::Cancelled),
                _ = sleep_until(deadline) => return Err(DriverError::PairingExpired),
                submission = self.pins.recv() => match submission {
                    Some(submission) => submission,
                    None => return Err(DriverError::Cancelled),
                },
            };

            self.set_step(PairingStep::Verifying { protocol });
            let verified = tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = reply.send(Err(DriverError::Cancelled));
                    return Err(DriverError::Cancelled);
                }
                r = timeout(self.handshake_timeout, handle.verify_pin(&pin)) => r,
            };

            match verified {
                Ok(Ok(PinVerdict::Accepted(part))) => {
                    let outcome = match next {
                        Some(protocol) => PinOutcome::NextProtocol(protocol),
                        None => PinOutcome::Paired,
                    };
                    let _ = reply.send(Ok(outcome));
                    return Ok(part);
                }
                Ok(Ok(PinVerdict::Rejected)) => {
                    attempts_left -= 1;
                    if attempts_left == 0 {
                        let err = DriverError::PairingFailed(format!(
                            "PIN rejected {max_attempts} times"
                        ));
                        let _ = reply.send(Err(err.clone()));
                        return Err(err);
                    }
                    debug!(device = %self.descriptor.id, %protocol, attempts_left, "PIN rejected");
                    let _ = reply.send(Ok(PinOutcome::Retry { attempts_left }));
                }
                Ok(Err(e)) => {
                    let err = pairing_error(e);
                    let _ = reply.send(Err(err.clone()));
                    return Err(err);
                }
                Err(_) => {
                    let err = DriverError::PairingFailed("PIN verification timed out".into());
                    let _ = reply.send(Err(err.clone()));
                    return Err(err);
                }
            }
        }
    }

    /// We pick a PIN; the user types it on the device.
    async fn host_pin(
        &mut self,
        handle: &mut dyn PairingHandle,
        protocol: ProtocolKind,
    ) -> Result<ProtocolCredential, DriverError> {
        let max_attempts = self.settings.max_pin_attempts.max(1);
        let mut attempts_left = max_attempts;
        loop {
            let pin = format!("{:04}", rand::thread_rng().gen_range(1000..=9999));
            self.events.emit(DriverEvent::PairingPin {
                device: self.descriptor.id.clone(),
                protocol,
                pin: pin.clone(),
            });
            self.set_step(PairingStep::Verifying { protocol });

            let verified = tokio::select! {
                _ = self.cancel.cancelled() => return Err(DriverError::Cancelled),
                r = timeout(self.settings.pin_timeout, handle.verify_pin(&pin)) => r,
            };
            match verified {
                Ok(Ok(PinVerdict::Accepted(part))) => return Ok(part),
                Ok(Ok(PinVerdict::Rejected)) => {
                    attempts_left -= 1;
                    if attempts_left == 0 {
                        return Err(DriverError::PairingFailed(format!(
                            "PIN rejected {max_attempts} times"
                        )));
                    }
                }
                Ok(Err(e)) => return Err(pairing_error(e)),
                Err(_) => return Err(DriverError::PairingExpired),
            }
        }
    }

    fn set_step(&self, step: PairingStep) {
        self.events.emit(DriverEvent::PairingStep {
            device: self.device_id(),
            step: step.clone(),
        });
        self.step.send_replace(Some(step));
    }

    fn device_id(&self) -> DeviceId {
        self.descriptor.id.clone()
    }
}

/// Configured protocols the device advertises, in configured order.
///
/// A descriptor without service information (rebuilt from storage) is
/// assumed to offer every configured protocol.
fn select_protocols(configured: &[ProtocolKind], descriptor: &DeviceDescriptor) -> Vec<ProtocolKind> {
    let mut selected: Vec<ProtocolKind> = Vec::new();
    for &protocol in configured {
        if (descriptor.services.is_empty() || descriptor.offers(protocol))
            && !selected.contains(&protocol)
        {
            selected.push(protocol);
        }
    }
    selected
}

fn pairing_error(err: ProtocolError) -> DriverError {
    match err {
        ProtocolError::Pairing(msg) => DriverError::PairingFailed(msg),
        other => DriverError::PairingFailed(other.to_string()),
    }
}
