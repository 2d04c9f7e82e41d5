//! Wakes a device from standby before a non-power command.

use std::time::Duration;

use atvlink_protocol::{
    Capability, CapabilitySet, DeviceConnection, PowerState, ProtocolError, RemoteCommand,
};
use tokio::sync::watch;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, warn};

/// How a wake attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeOutcome {
    /// The device reported itself on within the grace period.
    Confirmed,
    /// No confirmation arrived; the command is sent anyway.
    Unconfirmed,
}

#[derive(Debug, Clone)]
pub struct WakeCoordinator {
    grace: Duration,
}

impl WakeCoordinator {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// True when `command` must be preceded by a power-on.
    pub fn needs_wake(
        &self,
        power: PowerState,
        command: &RemoteCommand,
        capabilities: &CapabilitySet,
    ) -> bool {
        power.is_standby() && !command.is_power() && capabilities.contains(Capability::Power)
    }

    /// Sends exactly one power-on and waits up to the grace period for the
    /// device to report itself on.
    ///
    /// Only a connection-level failure is returned as an error.
    pub async fn wake(
        &self,
        conn: &dyn DeviceConnection,
        power: &mut watch::Receiver<PowerState>,
    ) -> Result<WakeOutcome, ProtocolError> {
        let deadline = Instant::now() + self.grace;

        match timeout_at(deadline, conn.send(&RemoteCommand::PowerOn)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_connection_level() => return Err(e),
            Ok(Err(e)) => warn!(error = %e, "wake power-on rejected"),
            Err(_) => {
                debug!("wake power-on not acknowledged within grace period");
                return Ok(WakeOutcome::Unconfirmed);
            }
        }

        match timeout_at(deadline, power.wait_for(|p| p.is_active())).await {
            Ok(Ok(_)) => Ok(WakeOutcome::Confirmed),
            _ => {
                debug!("device did not confirm power-on");
                Ok(WakeOutcome::Unconfirmed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use atvlink_protocol::ProtocolFuture;

    struct StubConnection {
        power_ons: AtomicU32,
        result: Mutex<Option<ProtocolError>>,
    }

    impl StubConnection {
        fn new() -> Self {
            Self {
                power_ons: AtomicU32::new(0),
                result: Mutex::new(None),
            }
        }
    }

    impl DeviceConnection for StubConnection {
        fn send(&self, command: &RemoteCommand) -> ProtocolFuture<'_, ()> {
            if command.is_power_on() {
                self.power_ons.fetch_add(1, Ordering::SeqCst);
            }
            let result = self.result.lock().unwrap().clone();
            Box::pin(async move {
                match result {
                    Some(e) => Err(e),
                    None => Ok(()),
                }
            })
        }

        fn capabilities(&self) -> CapabilitySet {
            CapabilitySet::all()
        }

        fn power_state(&self) -> PowerState {
            PowerState::Standby
        }

        fn close(&self) -> ProtocolFuture<'_, ()> {
            Box::pin(async { Ok(()) })
        }
    }

    #[test]
    fn wake_only_from_standby_for_non_power_commands() {
        let wake = WakeCoordinator::new(Duration::from_secs(3));
        let caps = CapabilitySet::all();
        assert!(wake.needs_wake(PowerState::Standby, &RemoteCommand::Play, &caps));
        assert!(!wake.needs_wake(PowerState::On, &RemoteCommand::Play, &caps));
        assert!(!wake.needs_wake(PowerState::Unknown, &RemoteCommand::Play, &caps));
        assert!(!wake.needs_wake(PowerState::Standby, &RemoteCommand::PowerOff, &caps));

        let no_power: CapabilitySet = [Capability::Transport].into_iter().collect();
        assert!(!wake.needs_wake(PowerState::Standby, &RemoteCommand::Play, &no_power));
    }

    #[tokio::test(start_paused = true)]
    async fn confirmed_when_device_reports_on() {
        let wake = WakeCoordinator::new(Duration::from_secs(3));
        let conn = StubConnection::new();
        let (tx, mut rx) = watch::channel(PowerState::Standby);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            let _ = tx.send(PowerState::On);
        });

        let outcome = wake.wake(&conn, &mut rx).await.unwrap();
        assert_eq!(outcome, WakeOutcome::Confirmed);
        assert_eq!(conn.power_ons.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unconfirmed_after_grace() {
        let wake = WakeCoordinator::new(Duration::from_secs(3));
        let conn = StubConnection::new();
        let (_tx, mut rx) = watch::channel(PowerState::Standby);

        let started = Instant::now();
        let outcome = wake.wake(&conn, &mut rx).await.unwrap();
        assert_eq!(outcome, WakeOutcome::Unconfirmed);
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert_eq!(conn.power_ons.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connection_loss_is_an_error() {
        let wake = WakeCoordinator::new(Duration::from_secs(3));
        let conn = StubConnection::new();
        *conn.result.lock().unwrap() = Some(ProtocolError::ConnectionLost("eof".into()));
        let (_tx, mut rx) = watch::channel(PowerState::Standby);

        let err = wake.wake(&conn, &mut rx).await.unwrap_err();
        assert!(err.is_connection_level());
    }
}
