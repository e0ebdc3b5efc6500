//! BLE session coordinator library.
//!
//! Sits between a central-role BLE stack and a consumer of typed async
//! events: one scan session, N device connections, and per-characteristic
//! notification subscriptions over a single radio. Callers drive the
//! [`Coordinator`] imperatively; outcomes of asynchronous work arrive on
//! three event streams (adapter state, connection state, characteristic
//! value updates) through [`sink::EventSink`] handles.

pub mod core;
pub mod error;
pub mod ids;
pub mod sink;
pub mod stack;
pub mod types;

pub use crate::core::Coordinator;
pub use crate::error::CoordinatorError;
pub use crate::ids::{CharacteristicAddress, CharacteristicId, DeviceId, ServiceId};
pub use crate::stack::{BleStack, BluestStack, ConnectionChange, StackEvent, WriteMode};
pub use crate::types::{
    AdapterState, CharacteristicFilter, ConnectionFailure, ConnectionState, ConnectionUpdate,
    DiscoveredDevice, DiscoveryPlan, GenericFailure, MtuFailure, MtuResult, ValueUpdate,
    ValueUpdateFailure, WriteFailure, WriteResult,
};
