use std::time::Duration;

/// Time allowed for a single command to be acknowledged by the device.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait for a woken device to report an active power state.
pub const WAKE_GRACE: Duration = Duration::from_secs(3);

/// Time allowed for a protocol handshake.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Upper bound for closing a connection or aborting a pairing handshake.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Discovery window used when scanning for a specific device.
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a pairing waits for the user to enter or read a PIN.
pub const PIN_TIMEOUT: Duration = Duration::from_secs(120);

/// How long a queued power-on waits for the session to connect.
pub const POWER_ON_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// Rejected PINs tolerated per protocol before pairing fails.
pub const MAX_PIN_ATTEMPTS: u32 = 3;

/// Consecutive command timeouts that mark the link as dead.
pub const TIMEOUTS_BEFORE_RECONNECT: u32 = 2;

/// Capacity of the per-connection push event channel.
pub const DEVICE_EVENT_CAPACITY: usize = 64;

/// Highest accepted absolute volume level.
pub const MAX_VOLUME: u8 = 100;
