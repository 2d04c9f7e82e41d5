#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use atvlink_connection::{
    DeviceRecord, DeviceRegistry, DeviceSnapshot, DriverEvent, DriverSettings, MemoryStore,
    PairingSettings, PairingStep, ReconnectConfig, SessionState,
};
use atvlink_protocol::{
    CapabilitySet, Credential, DeviceConnection, DeviceDescriptor, DeviceEvent, DeviceId,
    DeviceProtocolClient, PairingHandle, PinMode, PinVerdict, PowerState, ProtocolCredential,
    ProtocolError, ProtocolFuture, ProtocolKind, RemoteCommand, ServiceEndpoint,
};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

pub const CORRECT_PIN: &str = "1234";

/// How the fake device answers one command.
#[derive(Debug, Clone)]
pub enum SendBehavior {
    Ack,
    Hang,
    Fail(ProtocolError),
    Delay(Duration),
}

/// Shared state of the fake protocol stack.
pub struct MockState {
    pub candidates: Mutex<Vec<DeviceDescriptor>>,
    pub capabilities: Mutex<HashMap<DeviceId, CapabilitySet>>,
    pub power: Mutex<PowerState>,
    pub auto_wake: AtomicBool,
    pub pin_mode: Mutex<PinMode>,
    pub connect_script: Mutex<VecDeque<Result<(), ProtocolError>>>,
    pub send_script: Mutex<HashMap<DeviceId, VecDeque<SendBehavior>>>,
    pub sent: Mutex<Vec<(DeviceId, RemoteCommand)>>,
    pub connected_to: Mutex<Vec<DeviceDescriptor>>,
    pub in_flight: Mutex<HashMap<DeviceId, (u32, u32)>>,
    pub event_senders: Mutex<HashMap<DeviceId, mpsc::Sender<DeviceEvent>>>,
    pub host_pins: Mutex<Vec<String>>,
    pub connect_calls: AtomicU32,
    pub discover_calls: AtomicU32,
    pub pair_calls: AtomicU32,
    pub closed_connections: AtomicU32,
    pub closed_pairings: AtomicU32,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            candidates: Mutex::new(Vec::new()),
            capabilities: Mutex::new(HashMap::new()),
            power: Mutex::new(PowerState::On),
            auto_wake: AtomicBool::new(true),
            pin_mode: Mutex::new(PinMode::DeviceDisplaysPin),
            connect_script: Mutex::new(VecDeque::new()),
            send_script: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
            connected_to: Mutex::new(Vec::new()),
            in_flight: Mutex::new(HashMap::new()),
            event_senders: Mutex::new(HashMap::new()),
            host_pins: Mutex::new(Vec::new()),
            connect_calls: AtomicU32::new(0),
            discover_calls: AtomicU32::new(0),
            pair_calls: AtomicU32::new(0),
            closed_connections: AtomicU32::new(0),
            closed_pairings: AtomicU32::new(0),
        }
    }
}

impl MockState {
    pub fn script_sends(&self, id: &str, behaviors: impl IntoIterator<Item = SendBehavior>) {
        self.send_script
            .lock()
            .unwrap()
            .entry(DeviceId::new(id))
            .or_default()
            .extend(behaviors);
    }

    pub fn script_connects(&self, results: impl IntoIterator<Item = Result<(), ProtocolError>>) {
        self.connect_script.lock().unwrap().extend(results);
    }

    pub fn set_capabilities(&self, id: &str, capabilities: CapabilitySet) {
        self.capabilities
            .lock()
            .unwrap()
            .insert(DeviceId::new(id), capabilities);
    }

    pub fn sent_to(&self, id: &str) -> Vec<RemoteCommand> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(device, _)| device.as_str() == id)
            .map(|(_, command)| command.clone())
            .collect()
    }

    pub fn max_in_flight(&self, id: &str) -> u32 {
        self.in_flight
            .lock()
            .unwrap()
            .get(&DeviceId::new(id))
            .map(|(_, max)| *max)
            .unwrap_or(0)
    }

    /// Pushes an event on the device's live connection.
    pub fn push(&self, id: &str, event: DeviceEvent) {
        let sender = self
            .event_senders
            .lock()
            .unwrap()
            .get(&DeviceId::new(id))
            .cloned()
            .expect("device has no live connection");
        sender.try_send(event).expect("event channel full");
    }

    /// Drops the device side of the event channel.
    pub fn drop_link(&self, id: &str) {
        self.event_senders.lock().unwrap().remove(&DeviceId::new(id));
    }

    fn capabilities_of(&self, id: &DeviceId) -> CapabilitySet {
        self.capabilities
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .unwrap_or_else(CapabilitySet::all)
    }

    fn enter(&self, id: &DeviceId) {
        let mut map = self.in_flight.lock().unwrap();
        let entry = map.entry(id.clone()).or_insert((0, 0));
        entry.0 += 1;
        entry.1 = entry.1.max(entry.0);
    }

    fn leave(&self, id: &DeviceId) {
        if let Some(entry) = self.in_flight.lock().unwrap().get_mut(id) {
            entry.0 -= 1;
        }
    }
}

struct InFlightGuard {
    state: Arc<MockState>,
    id: DeviceId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.state.leave(&self.id);
    }
}

pub struct MockClient {
    pub state: Arc<MockState>,
}

impl DeviceProtocolClient for MockClient {
    fn discover(&self, _timeout: Duration) -> ProtocolFuture<'_, mpsc::Receiver<DeviceDescriptor>> {
        self.state.discover_calls.fetch_add(1, Ordering::SeqCst);
        let candidates = self.state.candidates.lock().unwrap().clone();
        Box::pin(async move {
            let (tx, rx) = mpsc::channel(candidates.len().max(1));
            for candidate in candidates {
                let _ = tx.try_send(candidate);
            }
            Ok(rx)
        })
    }

    fn pair(
        &self,
        _device: &DeviceDescriptor,
        protocol: ProtocolKind,
    ) -> ProtocolFuture<'_, Box<dyn PairingHandle>> {
        self.state.pair_calls.fetch_add(1, Ordering::SeqCst);
        let handle: Box<dyn PairingHandle> = Box::new(MockPairing {
            state: Arc::clone(&self.state),
            protocol,
        });
        Box::pin(async move { Ok(handle) })
    }

    fn connect(
        &self,
        device: &DeviceDescriptor,
        _credential: &Credential,
        events: mpsc::Sender<DeviceEvent>,
    ) -> ProtocolFuture<'_, Arc<dyn DeviceConnection>> {
        self.state.connect_calls.fetch_add(1, Ordering::SeqCst);
        self.state.connected_to.lock().unwrap().push(device.clone());
        let scripted = self
            .state
            .connect_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()));
        let state = Arc::clone(&self.state);
        let id = device.id.clone();
        Box::pin(async move {
            scripted?;
            state.event_senders.lock().unwrap().insert(id.clone(), events);
            let conn: Arc<dyn DeviceConnection> = Arc::new(MockConnection { state, id });
            Ok::<_, ProtocolError>(conn)
        })
    }
}

pub struct MockConnection {
    state: Arc<MockState>,
    id: DeviceId,
}

impl DeviceConnection for MockConnection {
    fn send(&self, command: &RemoteCommand) -> ProtocolFuture<'_, ()> {
        let command = command.clone();
        Box::pin(async move {
            self.state
                .sent
                .lock()
                .unwrap()
                .push((self.id.clone(), command.clone()));
            let behavior = self
                .state
                .send_script
                .lock()
                .unwrap()
                .get_mut(&self.id)
                .and_then(|script| script.pop_front())
                .unwrap_or(SendBehavior::Ack);

            self.state.enter(&self.id);
            let _guard = InFlightGuard {
                state: Arc::clone(&self.state),
                id: self.id.clone(),
            };

            let result = match behavior {
                SendBehavior::Ack => Ok(()),
                SendBehavior::Hang => std::future::pending().await,
                SendBehavior::Fail(e) => Err(e),
                SendBehavior::Delay(d) => {
                    tokio::time::sleep(d).await;
                    Ok(())
                }
            };

            if result.is_ok()
                && command.is_power_on()
                && self.state.auto_wake.load(Ordering::SeqCst)
            {
                *self.state.power.lock().unwrap() = PowerState::On;
                let sender = self.state.event_senders.lock().unwrap().get(&self.id).cloned();
                if let Some(sender) = sender {
                    let _ = sender.try_send(DeviceEvent::PowerStateChanged(PowerState::On));
                }
            }
            result
        })
    }

    fn capabilities(&self) -> CapabilitySet {
        self.state.capabilities_of(&self.id)
    }

    fn power_state(&self) -> PowerState {
        *self.state.power.lock().unwrap()
    }

    fn close(&self) -> ProtocolFuture<'_, ()> {
        self.state.closed_connections.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }
}

pub struct MockPairing {
    state: Arc<MockState>,
    protocol: ProtocolKind,
}

impl PairingHandle for MockPairing {
    fn begin(&mut self) -> ProtocolFuture<'_, PinMode> {
        let mode = *self.state.pin_mode.lock().unwrap();
        Box::pin(async move { Ok(mode) })
    }

    fn verify_pin(&mut self, pin: &str) -> ProtocolFuture<'_, PinVerdict> {
        let pin = pin.to_string();
        let mode = *self.state.pin_mode.lock().unwrap();
        let protocol = self.protocol;
        let state = Arc::clone(&self.state);
        Box::pin(async move {
            let accepted = match mode {
                PinMode::DeviceDisplaysPin => pin == CORRECT_PIN,
                PinMode::HostProvidesPin => {
                    state.host_pins.lock().unwrap().push(pin);
                    true
                }
            };
            if accepted {
                Ok(PinVerdict::Accepted(ProtocolCredential {
                    protocol,
                    secret: format!("{protocol}-secret"),
                }))
            } else {
                Ok(PinVerdict::Rejected)
            }
        })
    }

    fn close(&mut self) -> ProtocolFuture<'_, ()> {
        self.state.closed_pairings.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }
}

/// Settings with deterministic backoff.
pub fn settings() -> DriverSettings {
    DriverSettings {
        reconnect: ReconnectConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
            backoff_factor: 2.0,
            jitter: 0.0,
        },
        discovery_timeout: Duration::from_secs(1),
        pairing: PairingSettings {
            protocols: vec![ProtocolKind::Companion],
            ..PairingSettings::default()
        },
        ..DriverSettings::default()
    }
}

pub fn address(id: &str) -> std::net::IpAddr {
    let last = id.bytes().fold(0u8, |acc, b| acc.wrapping_add(b)).max(1);
    std::net::IpAddr::from([10, 0, 0, last])
}

/// A discovered, unpaired device offering AirPlay and Companion.
pub fn descriptor(id: &str) -> DeviceDescriptor {
    let mut desc = DeviceDescriptor::new(id, format!("TV {id}"));
    desc.address = Some(address(id));
    desc.services = vec![
        ServiceEndpoint {
            protocol: ProtocolKind::AirPlay,
            port: 7000,
        },
        ServiceEndpoint {
            protocol: ProtocolKind::Companion,
            port: 49153,
        },
    ];
    desc.capabilities = CapabilitySet::all();
    desc
}

/// A stored device that is paired and has a known address.
pub fn paired_record(id: &str) -> DeviceRecord {
    let mut record = DeviceRecord::from_descriptor(&descriptor(id));
    record.credential = Some(Credential::from(vec![ProtocolCredential {
        protocol: ProtocolKind::Companion,
        secret: "stored-secret".into(),
    }]));
    record
}

pub struct Harness {
    pub state: Arc<MockState>,
    pub store: Arc<MemoryStore>,
    pub registry: DeviceRegistry,
    pub events: mpsc::Receiver<DriverEvent>,
}

impl Harness {
    pub fn new(settings: DriverSettings, records: Vec<DeviceRecord>) -> Self {
        Self::with_state(Arc::new(MockState::default()), settings, records)
    }

    pub fn with_state(
        state: Arc<MockState>,
        settings: DriverSettings,
        records: Vec<DeviceRecord>,
    ) -> Self {
        let store = Arc::new(MemoryStore::with_devices(records));
        let client = Arc::new(MockClient {
            state: Arc::clone(&state),
        });
        let registry = DeviceRegistry::new(client, store.clone(), settings);
        registry.load_from_store().unwrap();
        let events = registry.take_events().unwrap();
        Self {
            state,
            store,
            registry,
            events,
        }
    }

    pub fn watch(&self, id: &str) -> watch::Receiver<DeviceSnapshot> {
        self.registry.watch_device(&DeviceId::new(id)).unwrap()
    }

    /// Enables a stored, paired device and waits until it is connected.
    pub async fn connect(&self, id: &str) -> watch::Receiver<DeviceSnapshot> {
        let mut rx = self.watch(id);
        self.registry.enable_device(&DeviceId::new(id)).await.unwrap();
        wait_for_state(&mut rx, SessionState::Connected).await;
        rx
    }

    /// Session states reported for `id`, in order, up to and including `last`.
    pub async fn states_until(&mut self, id: &str, last: SessionState) -> Vec<SessionState> {
        let mut states = Vec::new();
        loop {
            let event = timeout(Duration::from_secs(300), self.events.recv())
                .await
                .expect("timed out waiting for events")
                .expect("event stream closed");
            if let DriverEvent::StateChanged { device, state } = event
                && device.as_str() == id
            {
                states.push(state);
                if state == last {
                    return states;
                }
            }
        }
    }

    /// Waits for the first event matching `pred`.
    pub async fn next_event<F>(&mut self, mut pred: F) -> DriverEvent
    where
        F: FnMut(&DriverEvent) -> bool,
    {
        loop {
            let event = timeout(Duration::from_secs(300), self.events.recv())
                .await
                .expect("timed out waiting for events")
                .expect("event stream closed");
            if pred(&event) {
                return event;
            }
        }
    }
}

pub async fn wait_until<F>(rx: &mut watch::Receiver<DeviceSnapshot>, pred: F) -> DeviceSnapshot
where
    F: FnMut(&DeviceSnapshot) -> bool,
{
    timeout(Duration::from_secs(300), rx.wait_for(pred))
        .await
        .expect("timed out waiting for snapshot")
        .expect("session gone")
        .clone()
}

pub async fn wait_for_state(
    rx: &mut watch::Receiver<DeviceSnapshot>,
    state: SessionState,
) -> DeviceSnapshot {
    wait_until(rx, |s| s.state == state).await
}

pub async fn wait_for_pin_prompt(
    rx: &mut watch::Receiver<DeviceSnapshot>,
    protocol: ProtocolKind,
    attempts: u32,
) -> DeviceSnapshot {
    wait_until(rx, |s| {
        s.pairing
            == Some(PairingStep::AwaitingUserPin {
                protocol,
                attempts_left: attempts,
            })
    })
    .await
}

/// Yields until `pred` holds, letting spawned tasks run.
pub async fn eventually<F>(mut pred: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..1000 {
        if pred() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}
