//! Interface boundary to the underlying central-role BLE stack.
//!
//! The coordinator drives the stack through [`BleStack`] and receives its
//! callbacks as [`StackEvent`] values on a single channel, so every callback
//! lands on the one task that drains it. The stack keeps only the sender
//! half; once the coordinator is torn down the receiver is gone and sends
//! fail silently, which is what makes a dangling callback harmless.

mod backend;

pub use backend::BluestStack;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::ids::{CharacteristicAddress, DeviceId, ServiceId};
use crate::types::{AdapterState, DiscoveredDevice, DiscoveryPlan};

/// Link-level outcome reported by the stack for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionChange {
    /// The link is up. Not yet "usable": service discovery follows.
    Connected,
    Disconnected { error: Option<String> },
    FailedToConnect { error: Option<String> },
}

/// One callback from the stack, multiplexing the four callback channels.
/// Order within a channel is preserved; order across channels is not
/// specified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackEvent {
    AdapterChanged(AdapterState),
    Discovery(DiscoveredDevice),
    ConnectionChange {
        device_id: DeviceId,
        change: ConnectionChange,
    },
    /// Service/characteristic discovery finished for a connected device.
    /// `errors` carries one description per service or characteristic that
    /// failed to resolve; empty means a clean discovery.
    DiscoveryComplete {
        device_id: DeviceId,
        errors: Vec<String>,
    },
    /// A characteristic value arrived, from an explicit read or an active
    /// notification subscription. The stack does not distinguish the two.
    ValueUpdate {
        address: CharacteristicAddress,
        value: Option<Vec<u8>>,
        error: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    WithResponse,
    WithoutResponse,
}

/// The central-role BLE stack the coordinator delegates to.
///
/// An `Err` return means the stack rejected the request synchronously;
/// accepted requests resolve later through [`StackEvent`]s, except where a
/// method's own completion is its result (notifications, writes, MTU).
#[async_trait]
pub trait BleStack: Send + Sync {
    /// Registers the channel all stack callbacks are delivered on. Replaces
    /// any previously registered sender.
    fn set_event_sender(&self, events: mpsc::UnboundedSender<StackEvent>);

    /// Current radio state, for replay to a freshly attached subscriber.
    async fn adapter_state(&self) -> AdapterState;

    /// Starts scanning restricted to peripherals advertising the given
    /// service. Sightings arrive as [`StackEvent::Discovery`].
    async fn start_scan(&self, filter: ServiceId) -> Result<()>;

    async fn stop_scan(&self) -> Result<()>;

    /// Initiates a connection and the subsequent discovery described by
    /// `plan`. The timeout, when given, is enforced by the stack.
    async fn connect(
        &self,
        device: &DeviceId,
        plan: &DiscoveryPlan,
        timeout: Option<Duration>,
    ) -> Result<()>;

    async fn disconnect(&self, device: &DeviceId) -> Result<()>;

    /// Subscribes to value-change notifications. The `Ok` return is the
    /// completion: notifications for `address` flow as
    /// [`StackEvent::ValueUpdate`] until disabled or disconnected.
    async fn enable_notifications(&self, address: &CharacteristicAddress) -> Result<()>;

    async fn disable_notifications(&self, address: &CharacteristicAddress) -> Result<()>;

    /// Requests a read. The value (or read failure) arrives as
    /// [`StackEvent::ValueUpdate`].
    async fn read(&self, address: &CharacteristicAddress) -> Result<()>;

    /// Writes a value. For [`WriteMode::WithResponse`] the `Ok` return means
    /// the peripheral acknowledged the write; for
    /// [`WriteMode::WithoutResponse`] it means the stack accepted it.
    async fn write(
        &self,
        address: &CharacteristicAddress,
        value: &[u8],
        mode: WriteMode,
    ) -> Result<()>;

    /// Largest payload a single write can carry on the connection to
    /// `device`.
    async fn max_write_len(&self, device: &DeviceId) -> Result<usize>;
}
