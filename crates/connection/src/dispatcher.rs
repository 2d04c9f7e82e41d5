//! Per-device command queue with a single command in flight.
//!
//! Commands are admitted against the session state and the device
//! capabilities, queued in FIFO order and sent one at a time. Timeouts and
//! connection-level failures are reported back to the session as a
//! [`Verdict`] so it can decide whether to reconnect.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use atvlink_protocol::{
    AppInfo, Capability, CapabilitySet, DeviceConnection, PlaybackState, PowerState,
    ProtocolError, RemoteCommand,
};
use tokio::sync::{oneshot, watch};
use tokio::time::{Instant, timeout};
use tracing::{debug, info};

use crate::command::Command;
use crate::error::DriverError;
use crate::types::SessionState;
use crate::wake::{WakeCoordinator, WakeOutcome};

/// Pause between dismissing the screensaver and resuming playback; a
/// select sent sooner is swallowed by the device.
const SCREENSAVER_EXIT_DELAY: Duration = Duration::from_secs(1);

pub(crate) type OutcomeSender = oneshot::Sender<Result<(), DriverError>>;

type SendFuture =
    Pin<Box<dyn Future<Output = (Result<(), ProtocolError>, Option<WakeOutcome>)> + Send>>;

struct QueueEntry {
    command: Command,
    outcome: OutcomeSender,
    /// Set while the session is not connected; a power-on waiting for a
    /// session fails once this passes.
    connect_deadline: Option<Instant>,
}

struct InFlight {
    command: Command,
    outcome: OutcomeSender,
    fut: SendFuture,
}

/// What the session should do after a completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Verdict {
    Continue,
    Reconnect(String),
}

/// A finished command, handed back to the session.
pub(crate) struct Finished {
    pub command: Command,
    pub outcome: OutcomeSender,
    pub result: Result<(), DriverError>,
    pub verdict: Verdict,
    /// Capability the device turned out not to support.
    pub unsupported: Option<Capability>,
}

/// Inputs for admission.
pub(crate) struct AdmitContext<'a> {
    pub state: SessionState,
    pub capabilities: &'a CapabilitySet,
    pub power_on_wait: Duration,
}

/// Inputs for starting the next command.
pub(crate) struct DispatchContext<'a> {
    pub conn: &'a Arc<dyn DeviceConnection>,
    pub power: &'a watch::Receiver<PowerState>,
    pub capabilities: &'a CapabilitySet,
    pub apps: &'a [AppInfo],
    pub playback: Option<PlaybackState>,
    pub screensaver: bool,
}

pub(crate) struct CommandDispatcher {
    queue: VecDeque<QueueEntry>,
    in_flight: Option<InFlight>,
    consecutive_timeouts: u32,
    command_timeout: Duration,
    timeouts_before_reconnect: u32,
    wake: WakeCoordinator,
}

impl CommandDispatcher {
    pub fn new(
        command_timeout: Duration,
        timeouts_before_reconnect: u32,
        wake: WakeCoordinator,
    ) -> Self {
        Self {
            queue: VecDeque::new(),
            in_flight: None,
            consecutive_timeouts: 0,
            command_timeout,
            timeouts_before_reconnect: timeouts_before_reconnect.max(1),
            wake,
        }
    }

    /// Checks preconditions and queues the command.
    ///
    /// On error nothing is queued and nothing is sent.
    pub fn admit(
        &mut self,
        command: Command,
        outcome: OutcomeSender,
        ctx: &AdmitContext<'_>,
    ) -> Result<(), (DriverError, OutcomeSender)> {
        let connected = ctx.state == SessionState::Connected;
        let waits_for_session = !connected && command.kind.is_power_on();
        if !connected && (!waits_for_session || ctx.state == SessionState::Error) {
            return Err((DriverError::NotConnected, outcome));
        }

        // Capabilities are not known before the first connect.
        let required = command.kind.required_capability();
        let capabilities_known = connected || !ctx.capabilities.is_empty();
        if capabilities_known && !ctx.capabilities.contains(required) {
            return Err((DriverError::UnsupportedFeature(required), outcome));
        }

        if let Err(reason) = command.kind.validate() {
            return Err((DriverError::InvalidCommand(reason), outcome));
        }

        let connect_deadline = waits_for_session.then(|| Instant::now() + ctx.power_on_wait);
        debug!(
            command = command.kind.name(),
            correlation = %command.correlation,
            queued = self.queue.len(),
            "command admitted"
        );
        self.queue.push_back(QueueEntry {
            command,
            outcome,
            connect_deadline,
        });
        Ok(())
    }

    /// Starts the next queued command if nothing is in flight.
    pub fn start_next(&mut self, ctx: DispatchContext<'_>) {
        if self.in_flight.is_some() {
            return;
        }
        let Some(entry) = self.queue.pop_front() else {
            return;
        };

        let power = *ctx.power.borrow();
        let steps = screensaver_exit(
            &entry.command.kind,
            ctx.screensaver,
            ctx.playback,
            ctx.capabilities,
        )
        .unwrap_or_else(|| vec![resolve(&entry.command.kind, power, ctx.apps)]);
        let needs_wake = steps
            .first()
            .is_some_and(|first| self.wake.needs_wake(power, first, ctx.capabilities));
        let step_count = steps.len();

        let conn = Arc::clone(ctx.conn);
        let mut power_rx = ctx.power.clone();
        let wake = self.wake.clone();
        let command_timeout = self.command_timeout;
        let fut = Box::pin(async move {
            let mut woke = None;
            if needs_wake {
                match wake.wake(conn.as_ref(), &mut power_rx).await {
                    Ok(outcome) => woke = Some(outcome),
                    Err(e) => return (Err(e), None),
                }
            }
            let mut result = Ok(());
            for (i, step) in steps.iter().enumerate() {
                if i > 0 {
                    tokio::time::sleep(SCREENSAVER_EXIT_DELAY).await;
                }
                result = match timeout(command_timeout, conn.send(step)).await {
                    Ok(result) => result,
                    Err(_) => Err(ProtocolError::Timeout),
                };
                if result.is_err() {
                    break;
                }
            }
            (result, woke)
        });

        debug!(
            command = entry.command.kind.name(),
            correlation = %entry.command.correlation,
            wake = needs_wake,
            steps = step_count,
            "dispatching command"
        );
        self.in_flight = Some(InFlight {
            command: entry.command,
            outcome: entry.outcome,
            fut,
        });
    }

    /// Resolves when the in-flight command finishes. Pending forever when
    /// nothing is in flight. Cancel safe.
    pub async fn completion(&mut self) -> Finished {
        let Some(flight) = self.in_flight.as_mut() else {
            return std::future::pending().await;
        };
        let (result, woke) = (&mut flight.fut).await;
        let Some(flight) = self.in_flight.take() else {
            return std::future::pending().await;
        };
        if let Some(woke) = woke {
            debug!(?woke, correlation = %flight.command.correlation, "wake finished");
        }
        self.finish(flight.command, flight.outcome, result)
    }

    fn finish(
        &mut self,
        command: Command,
        outcome: OutcomeSender,
        result: Result<(), ProtocolError>,
    ) -> Finished {
        let mut verdict = Verdict::Continue;
        let mut unsupported = None;
        let result = match result {
            Ok(()) => {
                self.consecutive_timeouts = 0;
                Ok(())
            }
            Err(ProtocolError::Timeout) => {
                self.consecutive_timeouts += 1;
                if self.consecutive_timeouts >= self.timeouts_before_reconnect {
                    info!(
                        timeouts = self.consecutive_timeouts,
                        "consecutive command timeouts, reconnecting"
                    );
                    verdict = Verdict::Reconnect(format!(
                        "{} consecutive command timeouts",
                        self.consecutive_timeouts
                    ));
                    self.consecutive_timeouts = 0;
                }
                Err(DriverError::CommandTimeout)
            }
            Err(e) if e.is_connection_level() => {
                self.consecutive_timeouts = 0;
                verdict = Verdict::Reconnect(e.to_string());
                Err(DriverError::ConnectionLost(e.to_string()))
            }
            Err(ProtocolError::NotSupported(_)) => {
                self.consecutive_timeouts = 0;
                let capability = command.kind.required_capability();
                unsupported = Some(capability);
                Err(DriverError::UnsupportedFeature(capability))
            }
            Err(e) => {
                self.consecutive_timeouts = 0;
                Err(DriverError::Device(e.to_string()))
            }
        };
        Finished {
            command,
            outcome,
            result,
            verdict,
            unsupported,
        }
    }

    /// Fails everything that cannot survive leaving the connected state.
    ///
    /// The in-flight command and queued non-power commands fail with
    /// `ConnectionLost`; queued power-ons keep waiting until `power_on_wait`.
    pub fn leave_connected(
        &mut self,
        reason: &str,
        power_on_wait: Duration,
    ) -> Vec<(Command, OutcomeSender, DriverError)> {
        let mut failed = Vec::new();
        if let Some(flight) = self.in_flight.take() {
            failed.push((
                flight.command,
                flight.outcome,
                DriverError::ConnectionLost(reason.to_string()),
            ));
        }
        let deadline = Instant::now() + power_on_wait;
        let mut kept = VecDeque::with_capacity(self.queue.len());
        for mut entry in self.queue.drain(..) {
            if entry.command.kind.is_power_on() {
                entry.connect_deadline.get_or_insert(deadline);
                kept.push_back(entry);
            } else {
                failed.push((
                    entry.command,
                    entry.outcome,
                    DriverError::ConnectionLost(reason.to_string()),
                ));
            }
        }
        self.queue = kept;
        self.consecutive_timeouts = 0;
        failed
    }

    /// Fails every pending and in-flight command with `err`.
    pub fn cancel_all(&mut self, err: DriverError) -> Vec<(Command, OutcomeSender, DriverError)> {
        let mut failed = Vec::new();
        if let Some(flight) = self.in_flight.take() {
            failed.push((flight.command, flight.outcome, err.clone()));
        }
        for entry in self.queue.drain(..) {
            failed.push((entry.command, entry.outcome, err.clone()));
        }
        self.consecutive_timeouts = 0;
        failed
    }

    /// Fails queued power-ons whose wait for a session has run out.
    pub fn expire_connect_waits(
        &mut self,
        now: Instant,
    ) -> Vec<(Command, OutcomeSender, DriverError)> {
        let mut failed = Vec::new();
        let mut kept = VecDeque::with_capacity(self.queue.len());
        for entry in self.queue.drain(..) {
            match entry.connect_deadline {
                Some(deadline) if deadline <= now => {
                    failed.push((entry.command, entry.outcome, DriverError::NotConnected));
                }
                _ => kept.push_back(entry),
            }
        }
        self.queue = kept;
        failed
    }

    pub fn next_connect_deadline(&self) -> Option<Instant> {
        self.queue.iter().filter_map(|e| e.connect_deadline).min()
    }

    /// The session is connected again; queued commands no longer expire.
    pub fn clear_deadlines(&mut self) {
        for entry in &mut self.queue {
            entry.connect_deadline = None;
        }
    }

    pub fn depth(&self) -> usize {
        self.queue.len() + usize::from(self.in_flight.is_some())
    }
}

/// Turns a hub command into what goes on the wire.
///
/// Toggle follows the known power state; app names resolve through the
/// device's app list, falling back to the given string as an identifier.
fn resolve(kind: &RemoteCommand, power: PowerState, apps: &[AppInfo]) -> RemoteCommand {
    match kind {
        RemoteCommand::PowerToggle => {
            if power.is_active() {
                RemoteCommand::PowerOff
            } else {
                RemoteCommand::PowerOn
            }
        }
        RemoteCommand::LaunchApp(app) => {
            let identifier = apps
                .iter()
                .find(|a| a.name.eq_ignore_ascii_case(app) || a.identifier == *app)
                .map(|a| a.identifier.clone())
                .unwrap_or_else(|| app.clone());
            RemoteCommand::LaunchApp(identifier)
        }
        other => other.clone(),
    }
}

/// Play/pause while the screensaver runs only dismisses it. A paused item
/// also needs a select before it resumes.
fn screensaver_exit(
    kind: &RemoteCommand,
    screensaver: bool,
    playback: Option<PlaybackState>,
    capabilities: &CapabilitySet,
) -> Option<Vec<RemoteCommand>> {
    if !matches!(kind, RemoteCommand::PlayPause)
        || !screensaver
        || playback == Some(PlaybackState::Playing)
        || !capabilities.contains(Capability::Navigation)
    {
        return None;
    }
    let mut steps = vec![RemoteCommand::Back];
    if playback == Some(PlaybackState::Paused) {
        steps.push(RemoteCommand::Select);
    }
    Some(steps)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatcher() -> CommandDispatcher {
        CommandDispatcher::new(
            Duration::from_secs(5),
            2,
            WakeCoordinator::new(Duration::from_secs(3)),
        )
    }

    fn admit(
        d: &mut CommandDispatcher,
        kind: RemoteCommand,
        state: SessionState,
        caps: &CapabilitySet,
    ) -> Result<oneshot::Receiver<Result<(), DriverError>>, DriverError> {
        let (tx, rx) = oneshot::channel();
        let ctx = AdmitContext {
            state,
            capabilities: caps,
            power_on_wait: Duration::from_secs(20),
        };
        d.admit(Command::new(kind), tx, &ctx)
            .map(|()| rx)
            .map_err(|(e, _)| e)
    }

    #[test]
    fn not_connected_rejects_all_but_power_on() {
        let mut d = dispatcher();
        let caps = CapabilitySet::all();
        assert_eq!(
            admit(&mut d, RemoteCommand::Play, SessionState::Reconnecting, &caps).unwrap_err(),
            DriverError::NotConnected
        );
        assert!(admit(&mut d, RemoteCommand::PowerOn, SessionState::Reconnecting, &caps).is_ok());
        assert_eq!(
            admit(&mut d, RemoteCommand::PowerOn, SessionState::Error, &caps).unwrap_err(),
            DriverError::NotConnected
        );
        assert_eq!(d.depth(), 1);
        assert!(d.next_connect_deadline().is_some());
    }

    #[test]
    fn unsupported_and_invalid_are_not_queued() {
        let mut d = dispatcher();
        let caps: CapabilitySet = [Capability::Navigation].into_iter().collect();
        assert_eq!(
            admit(&mut d, RemoteCommand::VolumeUp, SessionState::Connected, &caps).unwrap_err(),
            DriverError::UnsupportedFeature(Capability::Volume)
        );

        let caps = CapabilitySet::all();
        assert!(matches!(
            admit(&mut d, RemoteCommand::SetVolume(101), SessionState::Connected, &caps),
            Err(DriverError::InvalidCommand(_))
        ));
        assert_eq!(d.depth(), 0);
    }

    #[test]
    fn power_on_checked_against_known_capabilities() {
        let mut d = dispatcher();
        let caps: CapabilitySet = [Capability::AudioSink].into_iter().collect();
        assert_eq!(
            admit(&mut d, RemoteCommand::PowerOn, SessionState::Disconnected, &caps).unwrap_err(),
            DriverError::UnsupportedFeature(Capability::Power)
        );
        assert!(
            admit(&mut d, RemoteCommand::PowerOn, SessionState::Disconnected, &CapabilitySet::new())
                .is_ok()
        );
    }

    #[test]
    fn timeouts_reach_threshold() {
        let mut d = dispatcher();
        let (tx, _rx) = oneshot::channel();
        let first = d.finish(Command::new(RemoteCommand::Play), tx, Err(ProtocolError::Timeout));
        assert_eq!(first.result, Err(DriverError::CommandTimeout));
        assert_eq!(first.verdict, Verdict::Continue);

        let (tx, _rx) = oneshot::channel();
        let second = d.finish(Command::new(RemoteCommand::Play), tx, Err(ProtocolError::Timeout));
        assert!(matches!(second.verdict, Verdict::Reconnect(_)));
    }

    #[test]
    fn ack_resets_timeout_counter() {
        let mut d = dispatcher();
        for result in [Err(ProtocolError::Timeout), Ok(()), Err(ProtocolError::Timeout)] {
            let (tx, _rx) = oneshot::channel();
            let finished = d.finish(Command::new(RemoteCommand::Play), tx, result);
            assert_eq!(finished.verdict, Verdict::Continue);
        }
    }

    #[test]
    fn failure_mapping() {
        let mut d = dispatcher();
        let (tx, _rx) = oneshot::channel();
        let lost = d.finish(
            Command::new(RemoteCommand::Play),
            tx,
            Err(ProtocolError::ConnectionLost("eof".into())),
        );
        assert!(matches!(lost.result, Err(DriverError::ConnectionLost(_))));
        assert!(matches!(lost.verdict, Verdict::Reconnect(_)));

        let (tx, _rx) = oneshot::channel();
        let unsupported = d.finish(
            Command::new(RemoteCommand::Seek(10)),
            tx,
            Err(ProtocolError::NotSupported("seek".into())),
        );
        assert_eq!(unsupported.unsupported, Some(Capability::Seek));

        let (tx, _rx) = oneshot::channel();
        let rejected = d.finish(
            Command::new(RemoteCommand::Play),
            tx,
            Err(ProtocolError::Rejected("busy".into())),
        );
        assert!(matches!(rejected.result, Err(DriverError::Device(_))));
        assert_eq!(rejected.verdict, Verdict::Continue);
    }

    #[test]
    fn leaving_connected_keeps_power_on() {
        let mut d = dispatcher();
        let caps = CapabilitySet::all();
        admit(&mut d, RemoteCommand::Play, SessionState::Connected, &caps).unwrap();
        admit(&mut d, RemoteCommand::PowerOn, SessionState::Connected, &caps).unwrap();
        admit(&mut d, RemoteCommand::Home, SessionState::Connected, &caps).unwrap();

        let failed = d.leave_connected("link closed", Duration::from_secs(20));
        assert_eq!(failed.len(), 2);
        assert!(
            failed
                .iter()
                .all(|(_, _, e)| matches!(e, DriverError::ConnectionLost(_)))
        );
        assert_eq!(d.depth(), 1);
        assert!(d.next_connect_deadline().is_some());

        d.clear_deadlines();
        assert!(d.next_connect_deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_power_on_fails_not_connected() {
        let mut d = dispatcher();
        admit(
            &mut d,
            RemoteCommand::PowerOn,
            SessionState::Connecting,
            &CapabilitySet::all(),
        )
        .unwrap();
        assert!(d.expire_connect_waits(Instant::now()).is_empty());

        tokio::time::advance(Duration::from_secs(21)).await;
        let failed = d.expire_connect_waits(Instant::now());
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].2, DriverError::NotConnected);
        assert_eq!(d.depth(), 0);
    }

    #[test]
    fn toggle_and_app_resolution() {
        let apps = vec![AppInfo {
            name: "Music".into(),
            identifier: "com.apple.TVMusic".into(),
        }];
        assert_eq!(
            resolve(&RemoteCommand::PowerToggle, PowerState::On, &apps),
            RemoteCommand::PowerOff
        );
        assert_eq!(
            resolve(&RemoteCommand::PowerToggle, PowerState::Standby, &apps),
            RemoteCommand::PowerOn
        );
        assert_eq!(
            resolve(&RemoteCommand::LaunchApp("music".into()), PowerState::On, &apps),
            RemoteCommand::LaunchApp("com.apple.TVMusic".into())
        );
        assert_eq!(
            resolve(&RemoteCommand::LaunchApp("com.netflix".into()), PowerState::On, &apps),
            RemoteCommand::LaunchApp("com.netflix".into())
        );
    }

    #[test]
    fn play_pause_dismisses_screensaver() {
        let caps = CapabilitySet::all();
        let exit = |playback| screensaver_exit(&RemoteCommand::PlayPause, true, playback, &caps);

        assert_eq!(exit(None), Some(vec![RemoteCommand::Back]));
        assert_eq!(
            exit(Some(PlaybackState::Paused)),
            Some(vec![RemoteCommand::Back, RemoteCommand::Select])
        );
        assert_eq!(exit(Some(PlaybackState::Playing)), None);

        assert_eq!(
            screensaver_exit(&RemoteCommand::PlayPause, false, None, &caps),
            None
        );
        assert_eq!(
            screensaver_exit(&RemoteCommand::Play, true, None, &caps),
            None
        );
        let no_nav: CapabilitySet = [Capability::Transport].into_iter().collect();
        assert_eq!(
            screensaver_exit(&RemoteCommand::PlayPause, true, None, &no_nav),
            None
        );
    }
}
