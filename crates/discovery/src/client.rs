use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use atvlink_protocol::{DeviceDescriptor, ProtocolKind};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::DiscoveryError;
use crate::types::{BROWSED_SERVICES, RecordMerger, ServiceRecord, usable_address};

/// Scans the local network for media devices via mDNS/DNS-SD.
#[derive(Debug, Clone)]
pub struct Scanner {
    tv_only: bool,
}

impl Scanner {
    /// Creates a scanner that only reports TV-class devices.
    pub fn new() -> Self {
        Self { tv_only: true }
    }

    /// Also report speakers and other AirPlay receivers.
    pub fn include_all_models(mut self) -> Self {
        self.tv_only = false;
        self
    }

    /// Performs a one-time scan and returns every device found.
    pub async fn discover(&self, timeout: Duration) -> Result<Vec<DeviceDescriptor>, DiscoveryError> {
        let mut rx = self.scan_stream(timeout)?;
        let mut found: HashMap<String, DeviceDescriptor> = HashMap::new();
        while let Some(descriptor) = rx.recv().await {
            found.insert(descriptor.id.to_string(), descriptor);
        }
        let mut all: Vec<_> = found.into_values().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    /// Starts a scan and streams descriptors as they are resolved.
    ///
    /// A host may be reported more than once as records for further
    /// protocols arrive. The channel closes when `timeout` elapses.
    pub fn scan_stream(
        &self,
        timeout: Duration,
    ) -> Result<mpsc::Receiver<DeviceDescriptor>, DiscoveryError> {
        let daemon = ServiceDaemon::new()
            .map_err(|e| DiscoveryError::Mdns(format!("failed to create mDNS daemon: {e}")))?;

        let deadline = Instant::now() + timeout;
        let (record_tx, mut record_rx) = mpsc::channel::<(ProtocolKind, ServiceInfo)>(32);

        for (protocol, service) in BROWSED_SERVICES {
            let service_type = format!("{service}.local.");
            let receiver = daemon
                .browse(&service_type)
                .map_err(|e| DiscoveryError::Mdns(format!("failed to browse {service}: {e}")))?;

            // recv is blocking; one forwarding thread per browsed service.
            let tx = record_tx.clone();
            let std_deadline = deadline.into_std();
            tokio::task::spawn_blocking(move || {
                while std::time::Instant::now() < std_deadline {
                    match receiver.recv_timeout(Duration::from_millis(100)) {
                        Ok(ServiceEvent::ServiceResolved(info)) => {
                            if tx.blocking_send((protocol, info)).is_err() {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(_) if receiver.is_disconnected() => break,
                        Err(_) => {}
                    }
                }
            });
        }
        drop(record_tx);

        let (out_tx, out_rx) = mpsc::channel(16);
        let mut merger = RecordMerger::new(self.tv_only);
        tokio::spawn(async move {
            loop {
                let next = tokio::time::timeout_at(deadline, record_rx.recv()).await;
                let Ok(Some((protocol, info))) = next else {
                    break;
                };
                let record = service_record(protocol, &info);
                debug!(host = %record.host, %protocol, "mDNS service resolved");
                if let Some(descriptor) = merger.add(record)
                    && out_tx.send(descriptor).await.is_err()
                {
                    break;
                }
            }
            if let Err(e) = daemon.shutdown() {
                warn!(error = %e, "mDNS daemon shutdown failed");
            }
        });

        Ok(out_rx)
    }
}

impl Default for Scanner {
    fn default() -> Self {
        Self::new()
    }
}

/// Converts a resolved mDNS service into a `ServiceRecord`.
fn service_record(protocol: ProtocolKind, info: &ServiceInfo) -> ServiceRecord {
    let properties = info
        .get_properties()
        .iter()
        .map(|p| (p.key().to_string(), p.val_str().to_string()))
        .collect();

    let fullname = info.get_fullname();
    let instance = fullname
        .strip_suffix(info.get_type())
        .map(|s| s.trim_end_matches('.'))
        .unwrap_or(fullname)
        .to_string();

    let mut ips: Vec<IpAddr> = info
        .get_addresses()
        .iter()
        .copied()
        .filter(usable_address)
        .collect();
    ips.sort();

    ServiceRecord {
        protocol,
        instance,
        host: info.get_hostname().to_string(),
        port: info.get_port(),
        ips,
        properties,
    }
}
