//! Concrete [`BleStack`] over the `bluest` cross-platform central API.
//!
//! Long-running work (scanning, connecting, notification streams) runs on
//! spawned tasks that report back through the registered event sender.
//! Devices seen while scanning and characteristics resolved at discovery are
//! cached so later operations can address them by identifier.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use bluest::{Adapter, AdapterEvent, Characteristic, Device};
use futures_util::StreamExt;
use log::{debug, error, info};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::ids::{CharacteristicAddress, CharacteristicId, DeviceId, ServiceId};
use crate::stack::{BleStack, ConnectionChange, StackEvent, WriteMode};
use crate::types::{AdapterState, CharacteristicFilter, DiscoveredDevice, DiscoveryPlan};

struct Shared {
    events: Mutex<Option<mpsc::UnboundedSender<StackEvent>>>,
    adapter_state: Mutex<AdapterState>,
    /// Devices seen while scanning, keyed by their platform id.
    devices: Mutex<HashMap<DeviceId, Device>>,
    /// Characteristic handles resolved during discovery.
    characteristics: Mutex<HashMap<CharacteristicAddress, Characteristic>>,
    notify_tasks: Mutex<HashMap<CharacteristicAddress, CancellationToken>>,
    scan_token: Mutex<Option<CancellationToken>>,
}

impl Shared {
    /// Delivers one event to the coordinator. The sender half is all the
    /// stack holds; once the coordinator is torn down the send fails and
    /// the event vanishes.
    fn send(&self, event: StackEvent) {
        let guard = self.events.lock().unwrap();
        if let Some(tx) = guard.as_ref() {
            if tx.send(event).is_err() {
                debug!("Coordinator receiver is gone; dropping stack event");
            }
        }
    }
}

pub struct BluestStack {
    adapter: Adapter,
    shared: Arc<Shared>,
}

impl BluestStack {
    pub async fn new() -> Result<Self> {
        let adapter = Adapter::default()
            .await
            .ok_or_else(|| anyhow!("no Bluetooth adapter found"))?;
        adapter.wait_available().await?;
        info!("Bluetooth adapter is available");

        let shared = Arc::new(Shared {
            events: Mutex::new(None),
            adapter_state: Mutex::new(AdapterState::PoweredOn),
            devices: Mutex::new(HashMap::new()),
            characteristics: Mutex::new(HashMap::new()),
            notify_tasks: Mutex::new(HashMap::new()),
            scan_token: Mutex::new(None),
        });

        let watcher_adapter = adapter.clone();
        let watcher_shared = shared.clone();
        tokio::spawn(async move {
            Self::watch_adapter(watcher_adapter, watcher_shared).await;
        });

        Ok(Self { adapter, shared })
    }

    async fn watch_adapter(adapter: Adapter, shared: Arc<Shared>) {
        let mut events = match adapter.events().await {
            Ok(events) => events,
            Err(e) => {
                error!("Failed to subscribe to adapter events: {e}");
                return;
            }
        };

        while let Some(event) = events.next().await {
            let state = match event {
                Ok(AdapterEvent::Available) => AdapterState::PoweredOn,
                Ok(AdapterEvent::Unavailable) => AdapterState::PoweredOff,
                Err(e) => {
                    error!("Adapter event stream failed: {e}");
                    break;
                }
            };
            info!("Adapter state changed: {state:?}");
            *shared.adapter_state.lock().unwrap() = state;
            shared.send(StackEvent::AdapterChanged(state));
        }
    }

    fn device(&self, id: &DeviceId) -> Result<Device> {
        self.shared
            .devices
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!("device {id} has not been discovered"))
    }

    fn characteristic(&self, address: &CharacteristicAddress) -> Result<Characteristic> {
        self.shared
            .characteristics
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .ok_or_else(|| anyhow!("characteristic {address} has not been discovered"))
    }

    async fn scan_task(
        adapter: Adapter,
        shared: Arc<Shared>,
        filter: ServiceId,
        token: CancellationToken,
    ) {
        info!("Starting bluetooth scan with service filter {filter}");
        let services = [filter.0];
        let mut stream = match adapter.scan(&services).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to start scan: {e}");
                return;
            }
        };

        loop {
            tokio::select! {
                next = stream.next() => match next {
                    Some(found) => {
                        let device = found.device;
                        let id = DeviceId::new(device.id().to_string());
                        let name = found
                            .adv_data
                            .local_name
                            .clone()
                            .or_else(|| device.name().ok())
                            .unwrap_or_default();
                        let service_data = found
                            .adv_data
                            .service_data
                            .iter()
                            .map(|(uuid, bytes)| (ServiceId(*uuid), bytes.to_vec()))
                            .collect();
                        debug!("Found device {id} (rssi {:?})", found.rssi);

                        shared.devices.lock().unwrap().insert(id.clone(), device);
                        shared.send(StackEvent::Discovery(DiscoveredDevice {
                            id,
                            name,
                            rssi: found.rssi.unwrap_or(0),
                            service_data,
                        }));
                    }
                    None => {
                        info!("Bluetooth scan stream has ended");
                        break;
                    }
                },
                _ = token.cancelled() => break,
            }
        }
    }

    /// Brings the link up and resolves the requested GATT topology. Returns
    /// the per-service resolution errors; a hard failure (link never came
    /// up, discovery call failed outright) is an `Err`.
    async fn establish(
        adapter: &Adapter,
        shared: &Shared,
        device_id: &DeviceId,
        device: &Device,
        plan: &DiscoveryPlan,
    ) -> Result<Vec<String>> {
        if !device.is_connected().await {
            adapter
                .connect_device(device)
                .await
                .context("failed to connect")?;
        }
        info!("Link to {device_id} established, discovering services");

        let services = device
            .discover_services()
            .await
            .context("service discovery failed")?;

        let mut errors = Vec::new();
        match plan {
            DiscoveryPlan::All => {
                for service in &services {
                    let service_id = ServiceId(service.uuid());
                    match service.discover_characteristics().await {
                        Ok(characteristics) => {
                            Self::cache_characteristics(
                                shared,
                                device_id,
                                service_id,
                                characteristics,
                            );
                        }
                        Err(e) => errors.push(format!("service {service_id}: {e}")),
                    }
                }
            }
            DiscoveryPlan::Services(wanted) => {
                for (service_id, filter) in wanted {
                    let Some(service) = services.iter().find(|s| s.uuid() == service_id.0) else {
                        errors.push(format!("service {service_id} not found"));
                        continue;
                    };
                    match service.discover_characteristics().await {
                        Ok(characteristics) => {
                            let characteristics = match filter {
                                CharacteristicFilter::All => characteristics,
                                CharacteristicFilter::Only(ids) => {
                                    for id in ids {
                                        if !characteristics.iter().any(|c| c.uuid() == id.0) {
                                            errors.push(format!(
                                                "characteristic {id} not found in service {service_id}"
                                            ));
                                        }
                                    }
                                    characteristics
                                        .into_iter()
                                        .filter(|c| ids.iter().any(|id| id.0 == c.uuid()))
                                        .collect()
                                }
                            };
                            Self::cache_characteristics(
                                shared,
                                device_id,
                                *service_id,
                                characteristics,
                            );
                        }
                        Err(e) => errors.push(format!("service {service_id}: {e}")),
                    }
                }
            }
        }
        Ok(errors)
    }

    fn cache_characteristics(
        shared: &Shared,
        device_id: &DeviceId,
        service_id: ServiceId,
        characteristics: Vec<Characteristic>,
    ) {
        let mut cache = shared.characteristics.lock().unwrap();
        for characteristic in characteristics {
            let address = CharacteristicAddress::new(
                device_id.clone(),
                service_id,
                CharacteristicId(characteristic.uuid()),
            );
            cache.insert(address, characteristic);
        }
    }

    async fn notify_task(
        characteristic: Characteristic,
        shared: Arc<Shared>,
        address: CharacteristicAddress,
        token: CancellationToken,
        ready: oneshot::Sender<Result<()>>,
    ) {
        let mut stream = match characteristic.notify().await {
            Ok(stream) => {
                let _ = ready.send(Ok(()));
                stream
            }
            Err(e) => {
                let _ = ready.send(Err(e.into()));
                return;
            }
        };

        debug!("Listening for notifications on {address}");
        loop {
            tokio::select! {
                next = stream.next() => match next {
                    Some(Ok(value)) => shared.send(StackEvent::ValueUpdate {
                        address: address.clone(),
                        value: Some(value.to_vec()),
                        error: None,
                    }),
                    Some(Err(e)) => {
                        shared.send(StackEvent::ValueUpdate {
                            address: address.clone(),
                            value: None,
                            error: Some(e.to_string()),
                        });
                        break;
                    }
                    None => break,
                },
                _ = token.cancelled() => break,
            }
        }
        debug!("Notification stream for {address} ended");
    }
}

#[async_trait]
impl BleStack for BluestStack {
    fn set_event_sender(&self, events: mpsc::UnboundedSender<StackEvent>) {
        *self.shared.events.lock().unwrap() = Some(events);
    }

    async fn adapter_state(&self) -> AdapterState {
        *self.shared.adapter_state.lock().unwrap()
    }

    async fn start_scan(&self, filter: ServiceId) -> Result<()> {
        if let Some(previous) = self.shared.scan_token.lock().unwrap().take() {
            previous.cancel();
        }
        let token = CancellationToken::new();
        *self.shared.scan_token.lock().unwrap() = Some(token.clone());

        let adapter = self.adapter.clone();
        let shared = self.shared.clone();
        tokio::spawn(async move {
            Self::scan_task(adapter, shared, filter, token).await;
        });
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        if let Some(token) = self.shared.scan_token.lock().unwrap().take() {
            info!("Stopping bluetooth scan");
            token.cancel();
        }
        Ok(())
    }

    async fn connect(
        &self,
        device: &DeviceId,
        plan: &DiscoveryPlan,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let handle = self.device(device)?;
        let adapter = self.adapter.clone();
        let shared = self.shared.clone();
        let device_id = device.clone();
        let plan = plan.clone();

        tokio::spawn(async move {
            let attempt = Self::establish(&adapter, &shared, &device_id, &handle, &plan);
            let outcome = match timeout {
                Some(limit) => match tokio::time::timeout(limit, attempt).await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow!("connect attempt timed out after {limit:?}")),
                },
                None => attempt.await,
            };

            match outcome {
                Ok(errors) => {
                    shared.send(StackEvent::ConnectionChange {
                        device_id: device_id.clone(),
                        change: ConnectionChange::Connected,
                    });
                    shared.send(StackEvent::DiscoveryComplete { device_id, errors });
                }
                Err(e) => {
                    shared.send(StackEvent::ConnectionChange {
                        device_id,
                        change: ConnectionChange::FailedToConnect {
                            error: Some(format!("{e:#}")),
                        },
                    });
                }
            }
        });
        Ok(())
    }

    async fn disconnect(&self, device: &DeviceId) -> Result<()> {
        let handle = self.device(device)?;

        // Stop routing notifications for the device before the link drops.
        self.shared.notify_tasks.lock().unwrap().retain(|address, token| {
            if address.device_id == *device {
                token.cancel();
                false
            } else {
                true
            }
        });

        let adapter = self.adapter.clone();
        let shared = self.shared.clone();
        let device_id = device.clone();
        tokio::spawn(async move {
            let error = match adapter.disconnect_device(&handle).await {
                Ok(()) => None,
                Err(e) => Some(e.to_string()),
            };
            shared
                .characteristics
                .lock()
                .unwrap()
                .retain(|address, _| address.device_id != device_id);
            shared.send(StackEvent::ConnectionChange {
                device_id,
                change: ConnectionChange::Disconnected { error },
            });
        });
        Ok(())
    }

    async fn enable_notifications(&self, address: &CharacteristicAddress) -> Result<()> {
        let characteristic = self.characteristic(address)?;

        let token = CancellationToken::new();
        if let Some(previous) = self
            .shared
            .notify_tasks
            .lock()
            .unwrap()
            .insert(address.clone(), token.clone())
        {
            previous.cancel();
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        let shared = self.shared.clone();
        let task_address = address.clone();
        tokio::spawn(async move {
            Self::notify_task(characteristic, shared, task_address, token, ready_tx).await;
        });

        match ready_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.shared.notify_tasks.lock().unwrap().remove(address);
                Err(e)
            }
            Err(_) => {
                self.shared.notify_tasks.lock().unwrap().remove(address);
                Err(anyhow!("notification task exited before subscribing"))
            }
        }
    }

    async fn disable_notifications(&self, address: &CharacteristicAddress) -> Result<()> {
        if let Some(token) = self.shared.notify_tasks.lock().unwrap().remove(address) {
            token.cancel();
        }
        Ok(())
    }

    async fn read(&self, address: &CharacteristicAddress) -> Result<()> {
        let characteristic = self.characteristic(address)?;
        let shared = self.shared.clone();
        let address = address.clone();
        tokio::spawn(async move {
            match characteristic.read().await {
                Ok(value) => shared.send(StackEvent::ValueUpdate {
                    address,
                    value: Some(value.to_vec()),
                    error: None,
                }),
                Err(e) => shared.send(StackEvent::ValueUpdate {
                    address,
                    value: None,
                    error: Some(e.to_string()),
                }),
            }
        });
        Ok(())
    }

    async fn write(
        &self,
        address: &CharacteristicAddress,
        value: &[u8],
        mode: WriteMode,
    ) -> Result<()> {
        let characteristic = self.characteristic(address)?;
        match mode {
            WriteMode::WithResponse => characteristic.write(value).await?,
            WriteMode::WithoutResponse => characteristic.write_without_response(value).await?,
        }
        Ok(())
    }

    async fn max_write_len(&self, device: &DeviceId) -> Result<usize> {
        let characteristic = {
            let cache = self.shared.characteristics.lock().unwrap();
            cache
                .iter()
                .find(|(address, _)| address.device_id == *device)
                .map(|(_, characteristic)| characteristic.clone())
        };
        let characteristic = characteristic.ok_or_else(|| {
            anyhow!("no discovered characteristics for device {device}; is it connected?")
        })?;
        Ok(characteristic.max_write_len_async().await?)
    }
}
