//! Characteristic operation routing.
//!
//! Correlates inbound value updates from the stack to the process-wide
//! value-update sink and keeps the set of active notification
//! subscriptions. Reads and notifications produce identical events; the
//! router does not distinguish them.

use std::collections::HashSet;

use log::{debug, warn};

use crate::ids::{CharacteristicAddress, DeviceId};
use crate::sink::EventSink;
use crate::types::{GenericFailure, ValueUpdate, ValueUpdateFailure};

pub struct OperationRouter {
    sink: Option<Box<dyn EventSink<ValueUpdate>>>,
    subscriptions: HashSet<CharacteristicAddress>,
}

impl OperationRouter {
    pub fn new() -> Self {
        Self {
            sink: None,
            subscriptions: HashSet::new(),
        }
    }

    pub fn set_sink(&mut self, sink: Box<dyn EventSink<ValueUpdate>>) {
        self.sink = Some(sink);
    }

    pub fn clear_sink(&mut self) {
        self.sink = None;
    }

    pub fn subscribed(&mut self, address: CharacteristicAddress) {
        self.subscriptions.insert(address);
    }

    pub fn unsubscribed(&mut self, address: &CharacteristicAddress) {
        self.subscriptions.remove(address);
    }

    pub fn is_subscribed(&self, address: &CharacteristicAddress) -> bool {
        self.subscriptions.contains(address)
    }

    /// Drops every subscription for a device. Called on disconnect so stale
    /// addresses can never route again.
    pub fn clear_device(&mut self, device: &DeviceId) {
        self.subscriptions
            .retain(|address| address.device_id != *device);
    }

    pub fn reset(&mut self) {
        self.sink = None;
        self.subscriptions.clear();
    }

    /// Value (or value error) from the stack. With no sink the event is
    /// dropped without error: hardware may notify before anyone listens.
    pub fn handle_value_update(
        &self,
        address: CharacteristicAddress,
        value: Option<Vec<u8>>,
        error: Option<String>,
    ) {
        let update = ValueUpdate {
            address,
            value,
            failure: error
                .map(|message| GenericFailure::new(ValueUpdateFailure::Unknown, message)),
        };

        let Some(sink) = self.sink.as_ref() else {
            debug!(
                "No value-update subscriber; dropping update for {}",
                update.address
            );
            return;
        };
        if !sink.push(update) {
            warn!("Value-update subscriber is gone; dropping event");
        }
    }

    /// Reports a read that could not even be handed to the stack. Reads have
    /// no completion channel of their own, so the failure travels on the
    /// value-update stream like any other result.
    pub fn report_read_failure(&self, address: CharacteristicAddress, message: String) {
        if self.sink.is_none() {
            warn!("No subscription to report a characteristic read failure: {message}");
            return;
        }
        self.handle_value_update(address, None, Some(message));
    }
}
