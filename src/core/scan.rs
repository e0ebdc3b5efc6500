//! Scan session handling.
//!
//! At most one session exists at a time. Configuring a scan creates the
//! session with its service filter; the sink is bound when a subscriber
//! starts consuming; stopping leaves the session (and its sink) in place so
//! scanning can be toggled back on without reconfiguration.

use log::{debug, error, warn};

use crate::ids::ServiceId;
use crate::sink::EventSink;
use crate::types::DiscoveredDevice;

pub struct ScanSession {
    filter: ServiceId,
    sink: Option<Box<dyn EventSink<DiscoveredDevice>>>,
    active: bool,
}

impl ScanSession {
    pub fn new(filter: ServiceId) -> Self {
        Self {
            filter,
            sink: None,
            active: false,
        }
    }

    pub fn filter(&self) -> ServiceId {
        self.filter
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    pub fn attach_sink(&mut self, sink: Box<dyn EventSink<DiscoveredDevice>>) {
        self.sink = Some(sink);
    }

    /// Forwards one peripheral sighting to the subscriber. Sightings that
    /// race a stop request are dropped. A sighting with no attached sink
    /// means the stack was told to scan before a subscriber started
    /// consuming, which the coordinator never does.
    pub fn handle_discovery(&self, device: DiscoveredDevice) {
        if !self.active {
            debug!("Dropping discovery of {}: scanning is stopped", device.id);
            return;
        }
        let Some(sink) = self.sink.as_ref() else {
            debug_assert!(false, "discovery delivered before a sink was attached");
            error!(
                "Dropping discovery of {}: no sink attached to the scan session",
                device.id
            );
            return;
        };

        if !sink.push(device) {
            warn!("Scan subscriber is gone; dropping discovery event");
        }
    }
}
