//! Sound output routing between a primary device and audio sinks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use atvlink_protocol::{Capability, CapabilitySet, DeviceId};
use tracing::debug;

use crate::error::DriverError;
use crate::types::SessionState;

/// What the router needs to know about a registered device.
#[derive(Debug, Clone)]
pub struct OutputCandidate {
    pub state: SessionState,
    pub capabilities: CapabilitySet,
}

/// Tracks which outputs each primary device plays through.
///
/// Routes are only committed after the primary device acknowledged them.
#[derive(Debug)]
pub struct SoundOutputRouter {
    enabled: AtomicBool,
    routes: Mutex<HashMap<DeviceId, Vec<DeviceId>>>,
}

impl SoundOutputRouter {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            routes: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Checks a routing request without changing anything.
    ///
    /// `lookup` returns the candidate for a registered device, `None` for an
    /// unknown one.
    pub fn validate<F>(
        &self,
        primary: &DeviceId,
        outputs: &[DeviceId],
        lookup: F,
    ) -> Result<(), DriverError>
    where
        F: Fn(&DeviceId) -> Option<OutputCandidate>,
    {
        if !self.is_enabled() {
            return Err(DriverError::FeatureDisabled);
        }

        let primary_info =
            lookup(primary).ok_or_else(|| DriverError::UnknownDevice(primary.clone()))?;
        let mut candidates = Vec::with_capacity(outputs.len());
        for output in outputs {
            let info = lookup(output).ok_or_else(|| DriverError::UnknownDevice(output.clone()))?;
            candidates.push(info);
        }

        if !primary_info.capabilities.contains(Capability::OutputRouting) {
            return Err(DriverError::UnsupportedFeature(Capability::OutputRouting));
        }
        if candidates
            .iter()
            .any(|c| !c.capabilities.contains(Capability::AudioSink))
        {
            return Err(DriverError::UnsupportedFeature(Capability::AudioSink));
        }

        if !candidates
            .iter()
            .any(|c| c.state == SessionState::Connected)
        {
            return Err(DriverError::NoOutputAvailable);
        }
        Ok(())
    }

    /// Records an acknowledged route.
    pub fn commit(&self, primary: &DeviceId, outputs: Vec<DeviceId>) {
        debug!(device = %primary, outputs = outputs.len(), "output route committed");
        let mut routes = self.lock();
        if outputs.is_empty() {
            routes.remove(primary);
        } else {
            routes.insert(primary.clone(), outputs);
        }
    }

    /// Restores a route loaded from storage without validation.
    pub fn restore(&self, primary: &DeviceId, outputs: Vec<DeviceId>) {
        if !outputs.is_empty() {
            self.lock().insert(primary.clone(), outputs);
        }
    }

    pub fn outputs(&self, primary: &DeviceId) -> Vec<DeviceId> {
        self.lock().get(primary).cloned().unwrap_or_default()
    }

    /// Drops a device from every route, as primary and as output.
    pub fn purge(&self, id: &DeviceId) {
        let mut routes = self.lock();
        routes.remove(id);
        for outputs in routes.values_mut() {
            outputs.retain(|o| o != id);
        }
        routes.retain(|_, outputs| !outputs.is_empty());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<DeviceId, Vec<DeviceId>>> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
