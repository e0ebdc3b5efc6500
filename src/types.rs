//! Shared domain types: adapter and connection states, discovery plans,
//! events delivered on the three streams, and the failure codes attached to
//! them.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;

use crate::ids::{CharacteristicAddress, CharacteristicId, DeviceId, ServiceId};

/// Power/authorization state of the radio, owned by the underlying stack.
/// The coordinator only observes and forwards it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AdapterState {
    Unknown,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

/// Lifecycle state of one logical device connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Which services (and characteristics within them) to resolve after the
/// link comes up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryPlan {
    /// Discover everything the peripheral exposes.
    All,
    /// Discover only the listed services, each with its own characteristic
    /// filter.
    Services(HashMap<ServiceId, CharacteristicFilter>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CharacteristicFilter {
    All,
    Only(Vec<CharacteristicId>),
}

/// Parameters of one connect request as tracked by the registry.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub plan: DiscoveryPlan,
    pub timeout: Option<Duration>,
}

/// A failure payload attached to an event or call result. The code is one of
/// the per-stream enums below; the message carries the underlying stack
/// error text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenericFailure<C> {
    pub code: C,
    pub message: String,
}

impl<C> GenericFailure<C> {
    pub fn new(code: C, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionFailure {
    Unknown,
    FailedToConnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ValueUpdateFailure {
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WriteFailure {
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MtuFailure {
    Unknown,
}

/// One peripheral sighting delivered on the scan stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredDevice {
    pub id: DeviceId,
    /// Advertised or cached name; empty when unavailable.
    pub name: String,
    pub rssi: i16,
    /// Advertised service data. Keys are unique per sighting; order carries
    /// no meaning.
    pub service_data: Vec<(ServiceId, Vec<u8>)>,
}

/// One event on the connection-state stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionUpdate {
    pub device_id: DeviceId,
    pub state: ConnectionState,
    pub failure: Option<GenericFailure<ConnectionFailure>>,
}

/// One event on the characteristic value-update stream. Produced identically
/// for explicit reads and for notification pushes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValueUpdate {
    pub address: CharacteristicAddress,
    pub value: Option<Vec<u8>>,
    pub failure: Option<GenericFailure<ValueUpdateFailure>>,
}

/// Result of a write: success or failure, never both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteResult {
    pub address: CharacteristicAddress,
    pub failure: Option<GenericFailure<WriteFailure>>,
}

/// Result of a maximum-write-length query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MtuResult {
    pub device_id: DeviceId,
    pub mtu: Option<usize>,
    pub failure: Option<GenericFailure<MtuFailure>>,
}
