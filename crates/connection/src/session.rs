//! Per-device session actor.
//!
//! Each registered device runs one task that owns its whole state: the
//! lifecycle state machine, the command dispatcher, the live connection and
//! any pairing in progress. The registry talks to it through a bounded
//! control channel and reads its status from a `watch` snapshot.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use atvlink_protocol::constants::{CLOSE_TIMEOUT, DEVICE_EVENT_CAPACITY};
use atvlink_protocol::{
    AppInfo, Credential, DeviceConnection, DeviceDescriptor, DeviceEvent, DeviceId,
    DeviceProtocolClient, PlaybackInfo, PowerState, ProtocolError, RemoteCommand,
};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until, timeout, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command::Command;
use crate::device::DeviceRecord;
use crate::dispatcher::{
    AdmitContext, CommandDispatcher, DispatchContext, Finished, OutcomeSender, Verdict,
};
use crate::error::DriverError;
use crate::media::{PlayerState, player_state};
use crate::pairing_flow::{PairingFlow, PinSubmission};
use crate::reconnection::Backoff;
use crate::sound_output::SoundOutputRouter;
use crate::store::ConfigStore;
use crate::types::{
    DeviceSnapshot, DriverEvent, DriverSettings, EventSink, PairingStep, PinOutcome, SessionState,
};
use crate::wake::WakeCoordinator;

const CONTROL_CAPACITY: usize = 32;

/// Requests from the registry to a session.
pub(crate) enum Control {
    Enable,
    Disable {
        reply: oneshot::Sender<()>,
    },
    Submit {
        command: Command,
        outcome: OutcomeSender,
        reply: oneshot::Sender<Result<(), DriverError>>,
    },
    SubmitPin {
        pin: String,
        reply: oneshot::Sender<Result<PinOutcome, DriverError>>,
    },
    StartPairing {
        reply: oneshot::Sender<Result<(), DriverError>>,
    },
    CancelPairing {
        reply: oneshot::Sender<Result<(), DriverError>>,
    },
}

/// Registry-side handle of a running session.
#[derive(Clone)]
pub(crate) struct SessionHandle {
    pub control: mpsc::Sender<Control>,
    pub status: watch::Receiver<DeviceSnapshot>,
    pub cancel: CancellationToken,
}

type PhaseFuture = Pin<Box<dyn Future<Output = PhaseOutcome> + Send>>;

/// The long-running step a session is waiting on, if any.
struct Phase {
    fut: PhaseFuture,
    cancel: CancellationToken,
}

enum PhaseOutcome {
    Discovered(Result<Option<DeviceDescriptor>, ProtocolError>),
    Paired(Result<Credential, DriverError>),
    Connected(Result<Established, ProtocolError>),
}

struct Established {
    conn: Arc<dyn DeviceConnection>,
    events: mpsc::Receiver<DeviceEvent>,
    /// Fresh discovery result when the address was looked up first.
    refreshed: Option<DeviceDescriptor>,
}

struct PairingControl {
    pins: mpsc::Sender<PinSubmission>,
    step: watch::Receiver<Option<PairingStep>>,
}

pub(crate) struct SessionActor {
    record: DeviceRecord,
    state: SessionState,
    enabled: bool,
    client: Arc<dyn DeviceProtocolClient>,
    store: Arc<dyn ConfigStore>,
    router: Arc<SoundOutputRouter>,
    settings: DriverSettings,
    events: EventSink,
    status: watch::Sender<DeviceSnapshot>,
    power_tx: watch::Sender<PowerState>,
    power_rx: watch::Receiver<PowerState>,
    control: mpsc::Receiver<Control>,
    cancel: CancellationToken,
    backoff: Backoff,
    connect_failures: u32,
    retry_at: Option<Instant>,
    phase: Option<Phase>,
    conn: Option<Arc<dyn DeviceConnection>>,
    device_events: Option<mpsc::Receiver<DeviceEvent>>,
    descriptor: Option<DeviceDescriptor>,
    dispatcher: CommandDispatcher,
    pairing: Option<PairingControl>,
    playback: Option<PlaybackInfo>,
    screensaver: bool,
    volume: Option<u8>,
    apps: Vec<AppInfo>,
    last_error: Option<String>,
}

/// Starts a session task for `record` in the `Disconnected` state.
pub(crate) fn spawn(
    record: DeviceRecord,
    client: Arc<dyn DeviceProtocolClient>,
    store: Arc<dyn ConfigStore>,
    router: Arc<SoundOutputRouter>,
    settings: DriverSettings,
    events: EventSink,
) -> (SessionHandle, JoinHandle<()>) {
    let (control_tx, control_rx) = mpsc::channel(CONTROL_CAPACITY);
    let (status_tx, status_rx) = watch::channel(DeviceSnapshot::initial(record.clone()));
    let (power_tx, power_rx) = watch::channel(PowerState::Unknown);
    let cancel = CancellationToken::new();

    let dispatcher = CommandDispatcher::new(
        settings.command_timeout,
        settings.timeouts_before_reconnect,
        WakeCoordinator::new(settings.wake_grace),
    );
    let actor = SessionActor {
        record,
        state: SessionState::Disconnected,
        enabled: false,
        client,
        store,
        router,
        backoff: Backoff::new(settings.reconnect.clone()),
        settings,
        events,
        status: status_tx,
        power_tx,
        power_rx,
        control: control_rx,
        cancel: cancel.clone(),
        connect_failures: 0,
        retry_at: None,
        phase: None,
        conn: None,
        device_events: None,
        descriptor: None,
        dispatcher,
        pairing: None,
        playback: None,
        screensaver: false,
        volume: None,
        apps: Vec::new(),
        last_error: None,
    };
    let handle = SessionHandle {
        control: control_tx,
        status: status_rx,
        cancel,
    };
    (handle, tokio::spawn(actor.run()))
}

impl SessionActor {
    async fn run(mut self) {
        debug!(device = %self.record.id, "session started");
        loop {
            self.publish();
            let retry_at = self.retry_at;
            let connect_deadline = self.dispatcher.next_connect_deadline();

            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,

                msg = self.control.recv() => match msg {
                    Some(msg) => self.handle_control(msg).await,
                    None => break,
                },

                outcome = next_phase(&mut self.phase) => self.handle_phase(outcome).await,

                event = next_event(&mut self.device_events) => self.handle_device_event(event).await,

                finished = self.dispatcher.completion() => self.handle_finished(finished).await,

                _ = sleep_opt(retry_at) => self.retry_elapsed(),

                _ = sleep_opt(connect_deadline) => {
                    let failed = self.dispatcher.expire_connect_waits(Instant::now());
                    self.complete_all(failed);
                }

                _ = next_step(&mut self.pairing) => {}
            }
        }

        self.enabled = false;
        self.teardown(DriverError::Cancelled).await;
        self.set_state(SessionState::Disconnected);
        self.publish();
        debug!(device = %self.record.id, "session stopped");
    }

    // --- control ---

    async fn handle_control(&mut self, msg: Control) {
        match msg {
            Control::Enable => self.enable(),
            Control::Disable { reply } => {
                self.enabled = false;
                self.teardown(DriverError::Cancelled).await;
                self.set_state(SessionState::Disconnected);
                let _ = reply.send(());
            }
            Control::Submit {
                command,
                outcome,
                reply,
            } => {
                let is_power_on = command.kind.is_power_on();
                let ctx = AdmitContext {
                    state: self.state,
                    capabilities: &self.record.capabilities,
                    power_on_wait: self.settings.power_on_connect_timeout,
                };
                match self.dispatcher.admit(command, outcome, &ctx) {
                    Ok(()) => {
                        let _ = reply.send(Ok(()));
                        if is_power_on && !self.enabled && self.state == SessionState::Disconnected
                        {
                            info!(device = %self.record.id, "power-on requested, enabling session");
                            self.enable();
                        }
                        self.start_next();
                    }
                    Err((err, _outcome)) => {
                        let _ = reply.send(Err(err));
                    }
                }
            }
            Control::SubmitPin { pin, reply } => self.forward_pin(pin, reply),
            Control::StartPairing { reply } => {
                let result = self.restart_pairing().await;
                let _ = reply.send(result);
            }
            Control::CancelPairing { reply } => {
                if self.state != SessionState::Pairing {
                    let _ = reply.send(Err(DriverError::PairingNotInProgress));
                    return;
                }
                info!(device = %self.record.id, "pairing cancelled");
                self.enabled = false;
                self.teardown(DriverError::Cancelled).await;
                self.set_state(SessionState::Disconnected);
                let _ = reply.send(Ok(()));
            }
        }
    }

    fn enable(&mut self) {
        self.enabled = true;
        if matches!(self.state, SessionState::Disconnected | SessionState::Error) {
            self.last_error = None;
            self.begin();
        }
    }

    /// Picks the first step for a session that is not running.
    fn begin(&mut self) {
        if self.record.is_paired() && self.record.address.is_some() {
            self.start_connecting();
        } else {
            self.start_discovery();
        }
    }

    fn forward_pin(
        &mut self,
        pin: String,
        reply: oneshot::Sender<Result<PinOutcome, DriverError>>,
    ) {
        let Some(pairing) = self.pairing.as_ref() else {
            let _ = reply.send(Err(DriverError::PairingNotInProgress));
            return;
        };
        let awaiting = matches!(
            *pairing.step.borrow(),
            Some(PairingStep::AwaitingUserPin { .. })
        );
        if !awaiting {
            let _ = reply.send(Err(DriverError::PairingNotInProgress));
            return;
        }
        if let Err(e) = pairing.pins.try_send(PinSubmission { pin, reply }) {
            let submission = match e {
                TrySendError::Full(s) | TrySendError::Closed(s) => s,
            };
            let _ = submission.reply.send(Err(DriverError::PairingNotInProgress));
        }
    }

    /// Drops the stored credential and pairs again.
    async fn restart_pairing(&mut self) -> Result<(), DriverError> {
        if self.state == SessionState::Pairing {
            return Ok(());
        }
        info!(device = %self.record.id, "re-pairing requested");
        self.teardown(DriverError::Cancelled).await;
        if self.record.credential.take().is_some() {
            self.save_record();
            self.events.emit(DriverEvent::DeviceUpdated {
                device: self.record.clone(),
            });
        }
        self.backoff.reset();
        self.connect_failures = 0;
        self.last_error = None;
        self.enabled = true;
        self.start_discovery();
        Ok(())
    }

    // --- phases ---

    fn start_phase<F, Fut>(&mut self, make: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = PhaseOutcome> + Send + 'static,
    {
        if let Some(old) = self.phase.take() {
            old.cancel.cancel();
        }
        let cancel = self.cancel.child_token();
        self.phase = Some(Phase {
            fut: Box::pin(make(cancel.clone())),
            cancel,
        });
    }

    fn start_discovery(&mut self) {
        self.set_state(SessionState::Discovering);
        let client = Arc::clone(&self.client);
        let id = self.record.id.clone();
        let window = self.settings.discovery_timeout;
        self.start_phase(move |cancel| async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => Ok(None),
                r = lookup(client.as_ref(), &id, window) => r,
            };
            PhaseOutcome::Discovered(result)
        });
    }

    fn start_pairing(&mut self, descriptor: DeviceDescriptor) {
        self.set_state(SessionState::Pairing);
        let (pins_tx, pins_rx) = mpsc::channel(1);
        let (step_tx, step_rx) = watch::channel(None);
        self.pairing = Some(PairingControl {
            pins: pins_tx,
            step: step_rx,
        });

        let client = Arc::clone(&self.client);
        let pairing = self.settings.pairing.clone();
        let handshake_timeout = self.settings.connect_timeout;
        let events = self.events.clone();
        self.start_phase(move |cancel| {
            let flow = PairingFlow::new(
                client,
                descriptor,
                pairing,
                handshake_timeout,
                pins_rx,
                step_tx,
                events,
                cancel,
            );
            async move { PhaseOutcome::Paired(flow.run().await) }
        });
    }

    fn start_connecting(&mut self) {
        let Some(credential) = self.record.credential().cloned() else {
            self.start_discovery();
            return;
        };
        self.set_state(SessionState::Connecting);

        let mut descriptor = self
            .descriptor
            .clone()
            .unwrap_or_else(|| self.record.descriptor());
        if descriptor.address.is_none() {
            descriptor.address = self.record.address;
        }
        let rediscover_after = self.settings.rediscover_after;
        let refresh = descriptor.address.is_none()
            || (rediscover_after > 0 && self.connect_failures >= rediscover_after);

        let client = Arc::clone(&self.client);
        let id = self.record.id.clone();
        let discovery_timeout = self.settings.discovery_timeout;
        let connect_timeout = self.settings.connect_timeout;
        debug!(device = %id, refresh, address = ?descriptor.address, "connecting");

        self.start_phase(move |cancel| async move {
            let mut descriptor = descriptor;
            let mut refreshed = None;
            if refresh {
                let found = tokio::select! {
                    _ = cancel.cancelled() => Ok(None),
                    r = lookup(client.as_ref(), &id, discovery_timeout) => r,
                };
                match found {
                    Ok(Some(found)) => {
                        if found.address.is_some() {
                            descriptor.address = found.address;
                        }
                        descriptor.services = found.services.clone();
                        refreshed = Some(found);
                    }
                    Ok(None) => debug!(device = %id, "address refresh found nothing"),
                    Err(e) => debug!(device = %id, error = %e, "address refresh failed"),
                }
            }

            let (tx, rx) = mpsc::channel(DEVICE_EVENT_CAPACITY);
            let result = tokio::select! {
                _ = cancel.cancelled() => Err(ProtocolError::ConnectionLost("cancelled".into())),
                r = timeout(connect_timeout, client.connect(&descriptor, &credential, tx)) => {
                    r.unwrap_or(Err(ProtocolError::Timeout))
                }
            };
            PhaseOutcome::Connected(result.map(|conn| Established {
                conn,
                events: rx,
                refreshed,
            }))
        });
    }

    async fn handle_phase(&mut self, outcome: PhaseOutcome) {
        match outcome {
            PhaseOutcome::Discovered(Ok(Some(found))) => {
                info!(device = %self.record.id, address = ?found.address, "device discovered");
                self.apply_discovered(&found);
                if self.record.is_paired() {
                    self.start_connecting();
                } else {
                    self.start_pairing(found);
                }
            }
            PhaseOutcome::Discovered(Ok(None)) => {
                warn!(device = %self.record.id, "device not found on the network");
                self.schedule_retry("device not found".into());
            }
            PhaseOutcome::Discovered(Err(e)) => {
                warn!(device = %self.record.id, error = %e, "discovery failed");
                self.schedule_retry(e.to_string());
            }
            PhaseOutcome::Paired(Ok(credential)) => {
                info!(device = %self.record.id, "pairing succeeded");
                self.pairing = None;
                self.record.credential = Some(credential);
                self.save_record();
                self.events.emit(DriverEvent::DeviceUpdated {
                    device: self.record.clone(),
                });
                self.start_connecting();
            }
            PhaseOutcome::Paired(Err(DriverError::Cancelled)) => {
                self.pairing = None;
                self.enabled = false;
                self.set_state(SessionState::Disconnected);
            }
            PhaseOutcome::Paired(Err(e)) => {
                warn!(device = %self.record.id, error = %e, "pairing failed");
                self.pairing = None;
                self.enter_error(e.to_string());
            }
            PhaseOutcome::Connected(Ok(established)) => self.on_connected(established),
            PhaseOutcome::Connected(Err(ProtocolError::AuthenticationFailed(reason))) => {
                warn!(device = %self.record.id, %reason, "device rejected stored credential");
                self.enter_error(format!("authentication failed: {reason}"));
            }
            PhaseOutcome::Connected(Err(e)) => {
                self.connect_failures = self.connect_failures.saturating_add(1);
                warn!(
                    device = %self.record.id,
                    error = %e,
                    failures = self.connect_failures,
                    "connect failed"
                );
                self.schedule_retry(e.to_string());
            }
        }
    }

    fn on_connected(&mut self, established: Established) {
        let Established {
            conn,
            events,
            refreshed,
        } = established;
        if let Some(found) = refreshed {
            self.apply_discovered(&found);
        }

        let capabilities = conn.capabilities();
        if !capabilities.is_empty() && capabilities != self.record.capabilities {
            self.record.capabilities = capabilities;
            self.save_record();
            self.events.emit(DriverEvent::CapabilitiesUpdated {
                device: self.record.id.clone(),
                capabilities: self.record.capabilities.clone(),
            });
        }
        let power = conn.power_state();

        self.conn = Some(conn);
        self.device_events = Some(events);
        self.backoff.reset();
        self.connect_failures = 0;
        self.retry_at = None;
        self.last_error = None;
        self.set_state(SessionState::Connected);
        self.set_power(power);
        info!(device = %self.record.id, "device connected");

        self.dispatcher.clear_deadlines();
        self.start_next();
    }

    /// Updates the stored address from a discovery result.
    fn apply_discovered(&mut self, found: &DeviceDescriptor) {
        let mut changed = false;
        if found.address.is_some() && found.address != self.record.address {
            info!(
                device = %self.record.id,
                old = ?self.record.address,
                new = ?found.address,
                "device address changed"
            );
            self.record.address = found.address;
            changed = true;
        }
        if self.record.capabilities.is_empty() && !found.capabilities.is_empty() {
            self.record.capabilities = found.capabilities.clone();
            changed = true;
        }
        self.descriptor = Some(found.clone());
        if changed {
            self.save_record();
            self.events.emit(DriverEvent::DeviceUpdated {
                device: self.record.clone(),
            });
        }
    }

    fn retry_elapsed(&mut self) {
        self.retry_at = None;
        if self.state != SessionState::Reconnecting {
            return;
        }
        if self.record.is_paired() {
            self.start_connecting();
        } else {
            self.start_discovery();
        }
    }

    fn schedule_retry(&mut self, reason: String) {
        let delay = self.backoff.next_delay();
        let attempt = self.backoff.attempt();
        self.retry_at = Some(Instant::now() + delay);
        info!(
            device = %self.record.id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            %reason,
            "reconnect scheduled"
        );
        self.last_error = Some(reason);
        self.set_state(SessionState::Reconnecting);
        self.events.emit(DriverEvent::Reconnecting {
            device: self.record.id.clone(),
            attempt,
            next_retry: delay,
        });
    }

    /// Stops automatic recovery until the user intervenes.
    fn enter_error(&mut self, reason: String) {
        self.retry_at = None;
        self.last_error = Some(reason);
        let failed = self.dispatcher.cancel_all(DriverError::NotConnected);
        self.complete_all(failed);
        self.set_state(SessionState::Error);
    }

    // --- live connection ---

    async fn handle_device_event(&mut self, event: Option<DeviceEvent>) {
        let id = self.record.id.clone();
        match event {
            None => self.lose_connection("device event channel closed").await,
            Some(DeviceEvent::ConnectionLost(reason)) => self.lose_connection(&reason).await,
            Some(DeviceEvent::PowerStateChanged(power)) => self.set_power(power),
            Some(DeviceEvent::CapabilitiesChanged(capabilities)) => {
                if capabilities != self.record.capabilities {
                    debug!(device = %id, ?capabilities, "capabilities changed");
                    self.record.capabilities = capabilities.clone();
                    self.save_record();
                    self.events.emit(DriverEvent::CapabilitiesUpdated {
                        device: id,
                        capabilities,
                    });
                }
            }
            Some(DeviceEvent::PlaybackUpdated(info)) => {
                self.playback = Some(info);
                self.events.emit(DriverEvent::Playback {
                    device: id,
                    playback: self.playback.clone(),
                    player: self.player(),
                });
            }
            Some(DeviceEvent::VolumeChanged(level)) => {
                self.volume = Some(level);
                self.events.emit(DriverEvent::VolumeChanged { device: id, level });
            }
            Some(DeviceEvent::AppListChanged(apps)) => {
                self.apps = apps.clone();
                self.events.emit(DriverEvent::AppListChanged { device: id, apps });
            }
            Some(DeviceEvent::OutputDevicesChanged(outputs)) => {
                self.set_preferred_outputs(outputs);
            }
            Some(DeviceEvent::ScreensaverChanged(active)) => {
                debug!(device = %id, active, "screensaver changed");
                self.screensaver = active;
            }
        }
    }

    fn set_power(&mut self, power: PowerState) {
        let previous = self.power_tx.send_replace(power);
        if previous == power {
            return;
        }
        if power.is_standby() {
            self.screensaver = false;
        }
        if power.is_standby() && self.playback.take().is_some() {
            self.events.emit(DriverEvent::Playback {
                device: self.record.id.clone(),
                playback: None,
                player: self.player(),
            });
        }
        debug!(device = %self.record.id, ?power, "power state changed");
        self.events.emit(DriverEvent::PowerChanged {
            device: self.record.id.clone(),
            power,
            player: self.player(),
        });
    }

    fn set_preferred_outputs(&mut self, outputs: Vec<DeviceId>) {
        self.router.commit(&self.record.id, outputs.clone());
        if outputs == self.record.preferred_outputs {
            return;
        }
        self.record.preferred_outputs = outputs.clone();
        self.save_record();
        self.events.emit(DriverEvent::OutputsChanged {
            device: self.record.id.clone(),
            outputs,
        });
    }

    async fn lose_connection(&mut self, reason: &str) {
        if self.state != SessionState::Connected {
            return;
        }
        warn!(device = %self.record.id, %reason, "connection lost");
        let failed = self
            .dispatcher
            .leave_connected(reason, self.settings.power_on_connect_timeout);
        self.complete_all(failed);
        self.close_connection().await;
        self.playback = None;
        self.screensaver = false;
        self.power_tx.send_replace(PowerState::Unknown);
        self.schedule_retry(reason.to_string());
    }

    /// Closes the live connection, bounded by the close timeout.
    async fn close_connection(&mut self) {
        self.device_events = None;
        let Some(conn) = self.conn.take() else {
            return;
        };
        close_bounded(&self.record.id, conn).await;
    }

    // --- commands ---

    fn start_next(&mut self) {
        if self.state != SessionState::Connected {
            return;
        }
        let Some(conn) = self.conn.as_ref() else {
            return;
        };
        self.dispatcher.start_next(DispatchContext {
            conn,
            power: &self.power_rx,
            capabilities: &self.record.capabilities,
            apps: &self.apps,
            playback: self.playback.as_ref().map(|p| p.state),
            screensaver: self.screensaver,
        });
    }

    async fn handle_finished(&mut self, finished: Finished) {
        let Finished {
            command,
            outcome,
            result,
            verdict,
            unsupported,
        } = finished;

        if let Some(capability) = unsupported
            && self.record.capabilities.remove(capability)
        {
            info!(device = %self.record.id, %capability, "device does not support capability");
            self.save_record();
            self.events.emit(DriverEvent::CapabilitiesUpdated {
                device: self.record.id.clone(),
                capabilities: self.record.capabilities.clone(),
            });
        }
        if result.is_ok()
            && let RemoteCommand::SetOutputDevices(outputs) = &command.kind
        {
            self.set_preferred_outputs(outputs.clone());
        }

        self.complete(command, outcome, result);
        match verdict {
            Verdict::Continue => self.start_next(),
            Verdict::Reconnect(reason) => self.lose_connection(&reason).await,
        }
    }

    fn complete(&self, command: Command, outcome: OutcomeSender, result: Result<(), DriverError>) {
        match &result {
            Ok(()) => debug!(
                device = %self.record.id,
                command = command.kind.name(),
                correlation = %command.correlation,
                "command completed"
            ),
            Err(e) => warn!(
                device = %self.record.id,
                command = command.kind.name(),
                correlation = %command.correlation,
                error = %e,
                "command failed"
            ),
        }
        self.events.emit(DriverEvent::CommandCompleted {
            device: self.record.id.clone(),
            correlation: command.correlation,
            command: command.kind.name(),
            result: result.clone(),
        });
        let _ = outcome.send(result);
    }

    fn complete_all(&self, failed: Vec<(Command, OutcomeSender, DriverError)>) {
        for (command, outcome, err) in failed {
            self.complete(command, outcome, Err(err));
        }
    }

    // --- teardown ---

    /// Cancels every wait, fails pending commands and closes the link.
    async fn teardown(&mut self, err: DriverError) {
        self.retry_at = None;
        self.drain_phase().await;
        self.pairing = None;
        let failed = self.dispatcher.cancel_all(err);
        self.complete_all(failed);
        self.close_connection().await;
        self.playback = None;
        self.screensaver = false;
        self.power_tx.send_replace(PowerState::Unknown);
    }

    async fn drain_phase(&mut self) {
        let Some(phase) = self.phase.take() else {
            return;
        };
        phase.cancel.cancel();
        match timeout(CLOSE_TIMEOUT * 2, phase.fut).await {
            Ok(PhaseOutcome::Connected(Ok(established))) => {
                close_bounded(&self.record.id, established.conn).await;
            }
            Ok(_) => {}
            Err(_) => warn!(device = %self.record.id, "session step did not stop in time"),
        }
    }

    // --- status ---

    fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        info!(device = %self.record.id, from = %self.state, to = %state, "session state changed");
        self.state = state;
        self.events.emit(DriverEvent::StateChanged {
            device: self.record.id.clone(),
            state,
        });
        self.publish();
    }

    fn player(&self) -> PlayerState {
        player_state(self.state, *self.power_rx.borrow(), self.playback.as_ref())
    }

    fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            device: self.record.clone(),
            state: self.state,
            enabled: self.enabled,
            power: *self.power_rx.borrow(),
            player: self.player(),
            playback: self.playback.clone(),
            volume: self.volume,
            retry_attempt: self.backoff.attempt(),
            pairing: self
                .pairing
                .as_ref()
                .and_then(|p| p.step.borrow().clone()),
            queue_depth: self.dispatcher.depth(),
            last_error: self.last_error.clone(),
        }
    }

    fn publish(&self) {
        let snapshot = self.snapshot();
        self.status.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }

    fn save_record(&self) {
        if let Err(e) = self.store.save_device(&self.record) {
            warn!(device = %self.record.id, error = %e, "failed to persist device");
        }
    }
}

async fn close_bounded(id: &DeviceId, conn: Arc<dyn DeviceConnection>) {
    match timeout(CLOSE_TIMEOUT, conn.close()).await {
        Ok(Ok(())) => debug!(device = %id, "connection closed"),
        Ok(Err(e)) => debug!(device = %id, error = %e, "close failed"),
        Err(_) => warn!(device = %id, "close timed out"),
    }
}

/// Scans for `id` until it shows up or the window closes.
async fn lookup(
    client: &dyn DeviceProtocolClient,
    id: &DeviceId,
    window: Duration,
) -> Result<Option<DeviceDescriptor>, ProtocolError> {
    let deadline = Instant::now() + window;
    let mut candidates = match timeout_at(deadline, client.discover(window)).await {
        Ok(result) => result?,
        Err(_) => return Ok(None),
    };
    loop {
        match timeout_at(deadline, candidates.recv()).await {
            Ok(Some(candidate)) if candidate.matches(id) => return Ok(Some(candidate)),
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => return Ok(None),
        }
    }
}

async fn next_phase(phase: &mut Option<Phase>) -> PhaseOutcome {
    let Some(current) = phase.as_mut() else {
        return std::future::pending().await;
    };
    let outcome = (&mut current.fut).await;
    *phase = None;
    outcome
}

async fn next_event(events: &mut Option<mpsc::Receiver<DeviceEvent>>) -> Option<DeviceEvent> {
    match events.as_mut() {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_step(pairing: &mut Option<PairingControl>) {
    match pairing.as_mut() {
        Some(p) => {
            if p.step.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending().await,
    }
}

async fn sleep_opt(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}
