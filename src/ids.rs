//! Identifier types for devices, services, and characteristics.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Platform-opaque identifier of a peripheral.
///
/// Not a UUID on every platform (BlueZ uses object paths, Windows uses
/// address-derived ids), so this wraps the stack's string form. An empty
/// string means the identifier is missing or unresolvable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// UUID of a GATT service. The nil UUID stands for "missing".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceId(pub Uuid);

impl ServiceId {
    pub fn is_missing(&self) -> bool {
        self.0.is_nil()
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// UUID of a GATT characteristic. The nil UUID stands for "missing".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CharacteristicId(pub Uuid);

impl CharacteristicId {
    pub fn is_missing(&self) -> bool {
        self.0.is_nil()
    }
}

impl fmt::Display for CharacteristicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The (device, service, characteristic) triple uniquely identifying a
/// characteristic instance on a specific peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CharacteristicAddress {
    pub device_id: DeviceId,
    pub service_id: ServiceId,
    pub characteristic_id: CharacteristicId,
}

impl CharacteristicAddress {
    pub fn new(
        device_id: DeviceId,
        service_id: ServiceId,
        characteristic_id: CharacteristicId,
    ) -> Self {
        Self {
            device_id,
            service_id,
            characteristic_id,
        }
    }

    /// True when all three identifiers are present. Operations that take an
    /// address require this before touching the stack.
    pub fn is_fully_qualified(&self) -> bool {
        !self.device_id.is_empty()
            && !self.service_id.is_missing()
            && !self.characteristic_id.is_missing()
    }
}

impl fmt::Display for CharacteristicAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.device_id, self.service_id, self.characteristic_id
        )
    }
}
