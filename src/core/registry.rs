//! Connection registry and per-device state machine.
//!
//! States move `Disconnected → Connecting → Connected → Disconnecting →
//! Disconnected`, with `Connecting → Disconnected` on failure. A device
//! becomes "Connected" for subscribers only once service discovery has
//! finished; the link-level connected callback alone emits nothing, because
//! a caller needs the GATT topology, not merely a radio link.

use std::collections::HashMap;

use log::warn;

use crate::ids::DeviceId;
use crate::sink::EventSink;
use crate::types::{
    ConnectRequest, ConnectionFailure, ConnectionState, ConnectionUpdate, GenericFailure,
};

/// One tracked device: its lifecycle state and the discovery request it was
/// connected with.
pub struct DeviceConnection {
    pub state: ConnectionState,
    pub request: ConnectRequest,
}

pub struct ConnectionRegistry {
    connections: HashMap<DeviceId, DeviceConnection>,
    sink: Option<Box<dyn EventSink<ConnectionUpdate>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: HashMap::new(),
            sink: None,
        }
    }

    pub fn set_sink(&mut self, sink: Box<dyn EventSink<ConnectionUpdate>>) {
        self.sink = Some(sink);
    }

    pub fn clear_sink(&mut self) {
        self.sink = None;
    }

    pub fn state_of(&self, device: &DeviceId) -> Option<ConnectionState> {
        self.connections.get(device).map(|c| c.state)
    }

    pub fn tracked_devices(&self) -> Vec<DeviceId> {
        self.connections.keys().cloned().collect()
    }

    pub fn reset(&mut self) {
        self.connections.clear();
        self.sink = None;
    }

    /// Registers (or overwrites) the entry for a connect request and moves
    /// it to Connecting. Overwriting an in-flight attempt is caller misuse;
    /// the entry is replaced so only one attempt is ever tracked.
    pub fn begin_connect(&mut self, device: DeviceId, request: ConnectRequest) {
        if let Some(existing) = self.connections.get(&device) {
            if existing.state == ConnectionState::Connecting {
                warn!("Connect requested for {device} while an attempt is already in flight");
            }
        }
        self.connections.insert(
            device,
            DeviceConnection {
                state: ConnectionState::Connecting,
                request,
            },
        );
    }

    /// Marks a disconnect request. The transition to Disconnected is
    /// reported later by the stack's connection-change callback.
    pub fn begin_disconnect(&mut self, device: &DeviceId) {
        if let Some(conn) = self.connections.get_mut(device) {
            if conn.state == ConnectionState::Connected {
                conn.state = ConnectionState::Disconnecting;
            }
        }
    }

    /// Link-level connected callback. No event is emitted: subscribers hear
    /// about the device once discovery completes.
    pub fn mark_link_up(&mut self, device: &DeviceId) {
        match self.connections.get_mut(device) {
            Some(conn) => conn.state = ConnectionState::Connected,
            None => warn!("Link up for untracked device {device}"),
        }
    }

    /// Discovery finished: emits exactly one Connected event, aggregating
    /// any per-service resolution errors into a single failure.
    pub fn complete_discovery(&mut self, device: &DeviceId, errors: &[String]) {
        if let Some(conn) = self.connections.get_mut(device) {
            conn.state = ConnectionState::Connected;
        } else {
            warn!("Discovery completed for untracked device {device}");
        }

        let failure = if errors.is_empty() {
            None
        } else {
            Some(GenericFailure::new(
                ConnectionFailure::Unknown,
                errors.join("\n"),
            ))
        };

        self.emit(ConnectionUpdate {
            device_id: device.clone(),
            state: ConnectionState::Connected,
            failure,
        });
    }

    /// The link went down, or a connect attempt failed. Emits one
    /// Disconnected event, with a FailedToConnect failure when the stack
    /// reported an underlying error.
    pub fn connection_dropped(&mut self, device: &DeviceId, error: Option<&str>) {
        if let Some(conn) = self.connections.get_mut(device) {
            conn.state = ConnectionState::Disconnected;
        }

        self.emit(ConnectionUpdate {
            device_id: device.clone(),
            state: ConnectionState::Disconnected,
            failure: error
                .map(|message| GenericFailure::new(ConnectionFailure::FailedToConnect, message)),
        });
    }

    fn emit(&self, update: ConnectionUpdate) {
        let Some(sink) = self.sink.as_ref() else {
            warn!(
                "No event channel set up to report a connection update for {}",
                update.device_id
            );
            return;
        };
        if !sink.push(update) {
            warn!("Connection-state subscriber is gone; dropping event");
        }
    }
}
