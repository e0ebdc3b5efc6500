//! The coordinator facade.
//!
//! Owns the single stack handle plus the scan session, connection registry,
//! and operation router, and turns stack callbacks into events on the three
//! subscriber streams. All state lives behind `&mut self`; operations and
//! callback processing are meant to be serialized onto one task, so the
//! coordinator itself takes no locks.

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio::sync::mpsc;

use crate::core::registry::ConnectionRegistry;
use crate::core::router::OperationRouter;
use crate::core::scan::ScanSession;
use crate::error::CoordinatorError;
use crate::ids::{CharacteristicAddress, DeviceId, ServiceId};
use crate::sink::EventSink;
use crate::stack::{BleStack, ConnectionChange, StackEvent, WriteMode};
use crate::types::{
    AdapterState, ConnectRequest, ConnectionUpdate, DiscoveredDevice, DiscoveryPlan,
    GenericFailure, MtuFailure, MtuResult, ValueUpdate, WriteFailure, WriteResult,
};

pub struct Coordinator {
    stack: Option<Arc<dyn BleStack>>,
    events: Option<mpsc::UnboundedReceiver<StackEvent>>,
    adapter_state: AdapterState,
    adapter_sink: Option<Box<dyn EventSink<AdapterState>>>,
    scan: Option<ScanSession>,
    registry: ConnectionRegistry,
    router: OperationRouter,
}

impl Coordinator {
    pub fn new() -> Self {
        Self {
            stack: None,
            events: None,
            adapter_state: AdapterState::Unknown,
            adapter_sink: None,
            scan: None,
            registry: ConnectionRegistry::new(),
            router: OperationRouter::new(),
        }
    }

    /// Binds the coordinator to a stack and wires up its callback channel.
    /// Exactly one stack handle may be held at a time; a second initialize
    /// before `deinitialize` fails and leaves the first handle untouched.
    pub fn initialize(&mut self, stack: Arc<dyn BleStack>) -> Result<(), CoordinatorError> {
        if self.stack.is_some() {
            return Err(CoordinatorError::AlreadyInitialized);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        stack.set_event_sender(tx);
        self.events = Some(rx);
        self.stack = Some(stack);
        info!("Coordinator initialized");
        Ok(())
    }

    /// Stops scanning, requests disconnect of every tracked device, and
    /// drops the stack handle together with all session state. Dropping the
    /// event receiver closes the callback channel, so anything the stack
    /// still sends afterwards vanishes instead of reaching dropped state.
    pub async fn deinitialize(&mut self) -> Result<(), CoordinatorError> {
        let stack = self.stack.take().ok_or(CoordinatorError::NotInitialized)?;

        if let Err(e) = stack.stop_scan().await {
            warn!("Failed to stop scan during teardown: {e:#}");
        }
        for device in self.registry.tracked_devices() {
            if let Err(e) = stack.disconnect(&device).await {
                warn!("Failed to request disconnect of {device} during teardown: {e:#}");
            }
        }

        self.events = None;
        self.scan = None;
        self.registry.reset();
        self.router.reset();
        self.adapter_sink = None;
        self.adapter_state = AdapterState::Unknown;
        info!("Coordinator deinitialized");
        Ok(())
    }

    fn require_stack(&self) -> Result<Arc<dyn BleStack>, CoordinatorError> {
        self.stack.clone().ok_or(CoordinatorError::NotInitialized)
    }

    // -- subscriber streams --------------------------------------------

    /// Attaches the adapter-state sink and immediately replays the current
    /// state so a late subscriber does not wait for the next change.
    pub async fn set_adapter_sink(&mut self, sink: Box<dyn EventSink<AdapterState>>) {
        let state = match self.stack.as_ref() {
            Some(stack) => stack.adapter_state().await,
            None => AdapterState::Unknown,
        };
        self.adapter_state = state;
        if !sink.push(state) {
            warn!("Adapter-state subscriber is gone already");
        }
        self.adapter_sink = Some(sink);
    }

    pub fn clear_adapter_sink(&mut self) {
        self.adapter_sink = None;
    }

    pub fn set_connection_sink(&mut self, sink: Box<dyn EventSink<ConnectionUpdate>>) {
        self.registry.set_sink(sink);
    }

    pub fn clear_connection_sink(&mut self) {
        self.registry.clear_sink();
    }

    pub fn set_value_sink(&mut self, sink: Box<dyn EventSink<ValueUpdate>>) {
        self.router.set_sink(sink);
    }

    pub fn clear_value_sink(&mut self) {
        self.router.clear_sink();
    }

    // -- scanning ------------------------------------------------------

    /// Creates (or replaces) the scan session for the given service filter.
    /// The underlying stack cannot be reconfigured mid-scan, so this fails
    /// while a scan is active.
    pub fn configure_scan(&mut self, filter: ServiceId) -> Result<(), CoordinatorError> {
        self.require_stack()?;

        if filter.is_missing() {
            return Err(CoordinatorError::InvalidArgument(
                "a service filter is required".into(),
            ));
        }
        if self.scan.as_ref().is_some_and(ScanSession::is_active) {
            return Err(CoordinatorError::InternalInconsistency(
                "cannot reconfigure while a scan is active".into(),
            ));
        }

        self.scan = Some(ScanSession::new(filter));
        Ok(())
    }

    /// Binds the subscriber's sink to the configured session and starts the
    /// radio scanning. Starting without a configured session is protocol
    /// misuse by the caller.
    pub async fn start_scanning(
        &mut self,
        sink: Box<dyn EventSink<DiscoveredDevice>>,
    ) -> Result<(), CoordinatorError> {
        let stack = self.require_stack()?;

        let Some(scan) = self.scan.as_mut() else {
            return Err(CoordinatorError::InternalInconsistency(
                "a scan has not been configured yet, but a subscriber started consuming".into(),
            ));
        };
        scan.attach_sink(sink);

        let filter = scan.filter();
        stack
            .start_scan(filter)
            .await
            .map_err(|e| CoordinatorError::Unknown(format!("{e:#}")))?;
        scan.set_active(true);
        info!("Scanning started with service filter {filter}");
        Ok(())
    }

    /// Stops the radio scan. Always succeeds; the session and its sink stay
    /// around so scanning can be resumed without reconfiguration.
    pub async fn stop_scanning(&mut self) -> Result<(), CoordinatorError> {
        if let Some(stack) = self.stack.as_ref() {
            if let Err(e) = stack.stop_scan().await {
                warn!("Failed to stop scan: {e:#}");
            }
        }
        if let Some(scan) = self.scan.as_mut() {
            scan.set_active(false);
        }
        Ok(())
    }

    // -- connections ---------------------------------------------------

    /// Requests a connection. The result arrives later on the
    /// connection-state stream; the `Ok` here only acknowledges the request.
    /// A synchronous stack rejection is still reported through the stream,
    /// as a Disconnected event with a FailedToConnect failure.
    pub async fn connect(
        &mut self,
        device: &DeviceId,
        plan: DiscoveryPlan,
        timeout: Option<Duration>,
    ) -> Result<(), CoordinatorError> {
        let stack = self.require_stack()?;
        if device.is_empty() {
            return Err(CoordinatorError::InvalidArgument(
                "a device id is required".into(),
            ));
        }

        self.registry.begin_connect(
            device.clone(),
            ConnectRequest {
                plan: plan.clone(),
                timeout,
            },
        );

        if let Err(e) = stack.connect(device, &plan, timeout).await {
            warn!("Stack rejected connect to {device}: {e:#}");
            let message = format!("{e:#}");
            self.registry.connection_dropped(device, Some(&message));
        }
        Ok(())
    }

    /// Requests a disconnect. Fire-and-forget: the eventual state change is
    /// reported via the connection-state stream.
    pub async fn disconnect(&mut self, device: &DeviceId) -> Result<(), CoordinatorError> {
        let stack = self.require_stack()?;
        if device.is_empty() {
            return Err(CoordinatorError::InvalidArgument(
                "a device id is required".into(),
            ));
        }

        self.registry.begin_disconnect(device);
        if let Err(e) = stack.disconnect(device).await {
            warn!("Stack rejected disconnect of {device}: {e:#}");
        }
        Ok(())
    }

    // -- characteristic operations -------------------------------------

    pub async fn enable_notifications(
        &mut self,
        address: &CharacteristicAddress,
    ) -> Result<(), CoordinatorError> {
        let stack = self.require_stack()?;
        Self::require_qualified(address)?;

        stack
            .enable_notifications(address)
            .await
            .map_err(|e| CoordinatorError::Unknown(format!("{e:#}")))?;
        self.router.subscribed(address.clone());
        Ok(())
    }

    pub async fn disable_notifications(
        &mut self,
        address: &CharacteristicAddress,
    ) -> Result<(), CoordinatorError> {
        let stack = self.require_stack()?;
        Self::require_qualified(address)?;

        stack
            .disable_notifications(address)
            .await
            .map_err(|e| CoordinatorError::Unknown(format!("{e:#}")))?;
        self.router.unsubscribed(address);
        Ok(())
    }

    /// Requests a read. There is no completion channel for reads: the value,
    /// or the failure, arrives on the value-update stream. Even an address
    /// that fails validation reports there rather than failing this call.
    pub async fn read(&mut self, address: &CharacteristicAddress) -> Result<(), CoordinatorError> {
        let stack = self.require_stack()?;

        if !address.is_fully_qualified() {
            self.router.report_read_failure(
                address.clone(),
                "characteristic, service, and device ids are required".into(),
            );
            return Ok(());
        }

        if let Err(e) = stack.read(address).await {
            self.router
                .report_read_failure(address.clone(), format!("{e:#}"));
        }
        Ok(())
    }

    /// Writes with response. The returned `WriteResult` carries either the
    /// acknowledged address or a failure, never both.
    pub async fn write_with_response(
        &mut self,
        address: &CharacteristicAddress,
        value: &[u8],
    ) -> Result<WriteResult, CoordinatorError> {
        self.write(address, value, WriteMode::WithResponse).await
    }

    /// Writes without response. The stack accepting the write is the whole
    /// result; there is nothing further to wait for.
    pub async fn write_without_response(
        &mut self,
        address: &CharacteristicAddress,
        value: &[u8],
    ) -> Result<WriteResult, CoordinatorError> {
        self.write(address, value, WriteMode::WithoutResponse).await
    }

    async fn write(
        &mut self,
        address: &CharacteristicAddress,
        value: &[u8],
        mode: WriteMode,
    ) -> Result<WriteResult, CoordinatorError> {
        let stack = self.require_stack()?;
        Self::require_qualified(address)?;

        let failure = match stack.write(address, value, mode).await {
            Ok(()) => None,
            Err(e) => Some(GenericFailure::new(WriteFailure::Unknown, format!("{e:#}"))),
        };
        Ok(WriteResult {
            address: address.clone(),
            failure,
        })
    }

    /// Queries the largest payload a single write can carry on the
    /// connection to `device`.
    pub async fn query_max_write_len(
        &mut self,
        device: &DeviceId,
    ) -> Result<MtuResult, CoordinatorError> {
        let stack = self.require_stack()?;
        if device.is_empty() {
            return Err(CoordinatorError::InvalidArgument(
                "a device id is required".into(),
            ));
        }

        let result = match stack.max_write_len(device).await {
            Ok(mtu) => MtuResult {
                device_id: device.clone(),
                mtu: Some(mtu),
                failure: None,
            },
            Err(e) => MtuResult {
                device_id: device.clone(),
                mtu: None,
                failure: Some(GenericFailure::new(MtuFailure::Unknown, format!("{e:#}"))),
            },
        };
        Ok(result)
    }

    // -- callback processing -------------------------------------------

    /// Waits for the next stack callback and routes it. Returns false once
    /// the coordinator is deinitialized or the stack dropped its sender.
    pub async fn process_next(&mut self) -> bool {
        let Some(events) = self.events.as_mut() else {
            return false;
        };
        match events.recv().await {
            Some(event) => {
                self.handle_stack_event(event);
                true
            }
            None => false,
        }
    }

    /// Routes one callback to the matching session, registry, or router.
    pub fn handle_stack_event(&mut self, event: StackEvent) {
        match event {
            StackEvent::AdapterChanged(state) => {
                self.adapter_state = state;
                if let Some(sink) = self.adapter_sink.as_ref() {
                    if !sink.push(state) {
                        warn!("Adapter-state subscriber is gone; dropping event");
                    }
                }
            }
            StackEvent::Discovery(device) => match self.scan.as_ref() {
                Some(scan) => scan.handle_discovery(device),
                None => {
                    debug_assert!(false, "discovery delivered with no scan session");
                    warn!("Dropping discovery of {}: no scan session", device.id);
                }
            },
            StackEvent::ConnectionChange { device_id, change } => match change {
                ConnectionChange::Connected => self.registry.mark_link_up(&device_id),
                ConnectionChange::Disconnected { error }
                | ConnectionChange::FailedToConnect { error } => {
                    self.router.clear_device(&device_id);
                    self.registry
                        .connection_dropped(&device_id, error.as_deref());
                }
            },
            StackEvent::DiscoveryComplete { device_id, errors } => {
                self.registry.complete_discovery(&device_id, &errors);
            }
            StackEvent::ValueUpdate {
                address,
                value,
                error,
            } => {
                self.router.handle_value_update(address, value, error);
            }
        }
    }

    /// Whether an address is currently subscribed for notifications.
    pub fn is_subscribed(&self, address: &CharacteristicAddress) -> bool {
        self.router.is_subscribed(address)
    }

    fn require_qualified(address: &CharacteristicAddress) -> Result<(), CoordinatorError> {
        if address.is_fully_qualified() {
            Ok(())
        } else {
            Err(CoordinatorError::InvalidArgument(
                "characteristic, service, and device ids are required".into(),
            ))
        }
    }
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}
