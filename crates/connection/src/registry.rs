//! Device registry: the hub-facing entry point of the session core.
//!
//! Owns one session task per registered device. The map from device id to
//! session is the only state shared across devices; its lock is held for
//! insert, remove and lookup only, never across an await.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use atvlink_protocol::{DeviceDescriptor, DeviceId, DeviceProtocolClient, RemoteCommand};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::command::{Command, CommandReceipt};
use crate::device::DeviceRecord;
use crate::error::DriverError;
use crate::session::{self, Control, SessionHandle};
use crate::sound_output::{OutputCandidate, SoundOutputRouter};
use crate::store::ConfigStore;
use crate::types::{DeviceSnapshot, DriverEvent, DriverSettings, EventSink, PinOutcome};

/// Upper bound for a session task to wind down after cancellation.
const SESSION_STOP_TIMEOUT: Duration = Duration::from_secs(5);

struct SessionEntry {
    handle: SessionHandle,
    task: JoinHandle<()>,
}

/// Registry of devices and their sessions.
pub struct DeviceRegistry {
    client: Arc<dyn DeviceProtocolClient>,
    store: Arc<dyn ConfigStore>,
    settings: DriverSettings,
    sessions: Mutex<HashMap<DeviceId, SessionEntry>>,
    router: Arc<SoundOutputRouter>,
    events: EventSink,
    events_rx: Mutex<Option<mpsc::Receiver<DriverEvent>>>,
}

impl DeviceRegistry {
    pub fn new(
        client: Arc<dyn DeviceProtocolClient>,
        store: Arc<dyn ConfigStore>,
        settings: DriverSettings,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(settings.event_capacity.max(1));
        Self {
            client,
            store,
            router: Arc::new(SoundOutputRouter::new(settings.sound_output_enabled)),
            settings,
            sessions: Mutex::new(HashMap::new()),
            events: EventSink::new(events_tx),
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&self) -> Option<mpsc::Receiver<DriverEvent>> {
        self.events_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn sound_output(&self) -> &SoundOutputRouter {
        &self.router
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<DeviceId, SessionEntry>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle(&self, id: &DeviceId) -> Result<SessionHandle, DriverError> {
        self.sessions()
            .get(id)
            .map(|entry| entry.handle.clone())
            .ok_or_else(|| DriverError::UnknownDevice(id.clone()))
    }

    /// Registers a discovered device. Its session starts `Disconnected`.
    pub fn add_device(&self, descriptor: &DeviceDescriptor) -> Result<DeviceRecord, DriverError> {
        let record = DeviceRecord::from_descriptor(descriptor);
        self.insert(record.clone(), true)?;
        info!(device = %record.id, name = %record.name, "device added");
        Ok(record)
    }

    /// Registers a record, optionally persisting it first.
    fn insert(&self, record: DeviceRecord, persist: bool) -> Result<(), DriverError> {
        let mut sessions = self.sessions();
        if sessions.contains_key(&record.id) {
            return Err(DriverError::DuplicateDevice(record.id));
        }
        if persist {
            self.store.save_device(&record)?;
        }
        let id = record.id.clone();
        let (handle, task) = session::spawn(
            record,
            Arc::clone(&self.client),
            Arc::clone(&self.store),
            Arc::clone(&self.router),
            self.settings.clone(),
            self.events.clone(),
        );
        sessions.insert(id, SessionEntry { handle, task });
        Ok(())
    }

    /// Tears down a device's session and forgets the device.
    ///
    /// Unknown ids are a no-op. The stored record and routes are dropped
    /// before the session winds down, so the id can be registered again
    /// while this is still waiting.
    pub async fn remove_device(&self, id: &DeviceId) {
        let Some(entry) = self.sessions().remove(id) else {
            return;
        };
        entry.handle.cancel.cancel();
        self.router.purge(id);
        if let Err(e) = self.store.delete_device(id) {
            warn!(device = %id, error = %e, "failed to delete stored device");
        }
        stop_session(id, entry.task).await;
        info!(device = %id, "device removed");
    }

    /// Registers every persisted device and restores its output routing.
    pub fn load_from_store(&self) -> Result<usize, DriverError> {
        let records = self.store.load_devices()?;
        let mut loaded = 0;
        for record in records {
            let id = record.id.clone();
            let outputs = record.preferred_outputs.clone();
            match self.insert(record, false) {
                Ok(()) => {
                    self.router.restore(&id, outputs);
                    loaded += 1;
                }
                Err(DriverError::DuplicateDevice(_)) => {
                    debug!(device = %id, "stored device already registered");
                }
                Err(e) => return Err(e),
            }
        }
        info!(count = loaded, "devices loaded from store");
        Ok(loaded)
    }

    /// Submits a command. Returns once the command is admitted to the
    /// device queue; the receipt resolves with the device outcome.
    ///
    /// Output routing changes are validated the same way as through
    /// [`set_outputs`](Self::set_outputs).
    pub async fn submit(&self, id: &DeviceId, command: Command) -> Result<CommandReceipt, DriverError> {
        let handle = self.handle(id)?;
        if let RemoteCommand::SetOutputDevices(outputs) = &command.kind {
            self.validate_outputs(id, outputs)?;
        }
        let correlation = command.correlation.clone();
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let (reply_tx, reply_rx) = oneshot::channel();
        handle
            .control
            .send(Control::Submit {
                command,
                outcome: outcome_tx,
                reply: reply_tx,
            })
            .await
            .map_err(|_| DriverError::UnknownDevice(id.clone()))?;
        reply_rx
            .await
            .map_err(|_| DriverError::UnknownDevice(id.clone()))??;
        Ok(CommandReceipt {
            correlation,
            outcome: outcome_rx,
        })
    }

    pub async fn submit_command(
        &self,
        id: &DeviceId,
        kind: RemoteCommand,
    ) -> Result<CommandReceipt, DriverError> {
        self.submit(id, Command::new(kind)).await
    }

    /// Submits a command and waits for its outcome.
    pub async fn execute(&self, id: &DeviceId, kind: RemoteCommand) -> Result<(), DriverError> {
        self.submit_command(id, kind).await?.wait().await
    }

    /// Status of every registered device, sorted by id.
    pub fn list_devices(&self) -> Vec<DeviceSnapshot> {
        let mut snapshots: Vec<DeviceSnapshot> = self
            .sessions()
            .values()
            .map(|entry| entry.handle.status.borrow().clone())
            .collect();
        snapshots.sort_by(|a, b| a.device.id.cmp(&b.device.id));
        snapshots
    }

    pub fn device(&self, id: &DeviceId) -> Option<DeviceSnapshot> {
        self.sessions()
            .get(id)
            .map(|entry| entry.handle.status.borrow().clone())
    }

    /// Subscribes to status snapshots of one device.
    pub fn watch_device(&self, id: &DeviceId) -> Result<watch::Receiver<DeviceSnapshot>, DriverError> {
        Ok(self.handle(id)?.status)
    }

    pub async fn enable_device(&self, id: &DeviceId) -> Result<(), DriverError> {
        self.handle(id)?
            .control
            .send(Control::Enable)
            .await
            .map_err(|_| DriverError::UnknownDevice(id.clone()))
    }

    /// Disconnects a device and keeps it registered. Returns once the
    /// session is `Disconnected`.
    pub async fn disable_device(&self, id: &DeviceId) -> Result<(), DriverError> {
        let handle = self.handle(id)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        handle
            .control
            .send(Control::Disable { reply: reply_tx })
            .await
            .map_err(|_| DriverError::UnknownDevice(id.clone()))?;
        reply_rx
            .await
            .map_err(|_| DriverError::UnknownDevice(id.clone()))
    }

    fn ids(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self.sessions().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Enables every registered device, e.g. when the hub leaves standby.
    pub async fn enable_all(&self) {
        for id in self.ids() {
            if let Err(e) = self.enable_device(&id).await {
                debug!(device = %id, error = %e, "enable skipped");
            }
        }
    }

    /// Disables every registered device, e.g. when the hub enters standby.
    pub async fn disable_all(&self) {
        for id in self.ids() {
            if let Err(e) = self.disable_device(&id).await {
                debug!(device = %id, error = %e, "disable skipped");
            }
        }
    }

    /// Drops the device's credential and starts pairing it again.
    pub async fn start_pairing(&self, id: &DeviceId) -> Result<(), DriverError> {
        let handle = self.handle(id)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        handle
            .control
            .send(Control::StartPairing { reply: reply_tx })
            .await
            .map_err(|_| DriverError::UnknownDevice(id.clone()))?;
        reply_rx
            .await
            .map_err(|_| DriverError::UnknownDevice(id.clone()))?
    }

    /// Submits a PIN for the pairing waiting on the user.
    pub async fn submit_pairing_pin(
        &self,
        id: &DeviceId,
        pin: impl Into<String>,
    ) -> Result<PinOutcome, DriverError> {
        let handle = self.handle(id)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        handle
            .control
            .send(Control::SubmitPin {
                pin: pin.into(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| DriverError::UnknownDevice(id.clone()))?;
        reply_rx
            .await
            .map_err(|_| DriverError::PairingNotInProgress)?
    }

    pub async fn cancel_pairing(&self, id: &DeviceId) -> Result<(), DriverError> {
        let handle = self.handle(id)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        handle
            .control
            .send(Control::CancelPairing { reply: reply_tx })
            .await
            .map_err(|_| DriverError::UnknownDevice(id.clone()))?;
        reply_rx
            .await
            .map_err(|_| DriverError::UnknownDevice(id.clone()))?
    }

    /// Routes the primary device's audio to `outputs`.
    ///
    /// Validation failures leave the committed routing untouched. The new
    /// routing is committed once the primary device acknowledged it.
    pub async fn set_outputs(
        &self,
        primary: &DeviceId,
        outputs: Vec<DeviceId>,
    ) -> Result<(), DriverError> {
        self.execute(primary, RemoteCommand::SetOutputDevices(outputs))
            .await
    }

    fn validate_outputs(&self, primary: &DeviceId, outputs: &[DeviceId]) -> Result<(), DriverError> {
        let candidates: HashMap<DeviceId, OutputCandidate> = self
            .sessions()
            .iter()
            .map(|(id, entry)| {
                let snapshot = entry.handle.status.borrow();
                (
                    id.clone(),
                    OutputCandidate {
                        state: snapshot.state,
                        capabilities: snapshot.device.capabilities.clone(),
                    },
                )
            })
            .collect();
        self.router
            .validate(primary, outputs, |id| candidates.get(id).cloned())
    }

    /// Stops every session. Devices stay in the store.
    pub async fn shutdown(&self) {
        let entries: Vec<(DeviceId, SessionEntry)> = self.sessions().drain().collect();
        for (_, entry) in &entries {
            entry.handle.cancel.cancel();
        }
        for (id, entry) in entries {
            stop_session(&id, entry.task).await;
        }
        info!("device registry shut down");
    }
}

/// Waits for a cancelled session task, aborting it if it does not stop in time.
async fn stop_session(id: &DeviceId, mut task: JoinHandle<()>) {
    if timeout(SESSION_STOP_TIMEOUT, &mut task).await.is_err() {
        warn!(device = %id, "session did not stop in time, aborting");
        task.abort();
    }
}

impl Drop for DeviceRegistry {
    fn drop(&mut self) {
        for entry in self.sessions().values() {
            entry.handle.cancel.cancel();
        }
    }
}
