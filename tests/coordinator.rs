//! End-to-end coordinator behavior against a scripted in-memory stack.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use ble_coordinator::{
    AdapterState, BleStack, CharacteristicAddress, CharacteristicId, ConnectionChange,
    ConnectionFailure, ConnectionState, Coordinator, CoordinatorError, DeviceId, DiscoveredDevice,
    DiscoveryPlan, ServiceId, StackEvent, WriteMode,
};

/// Which calls the coordinator made on the stack, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    StartScan(ServiceId),
    StopScan,
    Connect(DeviceId),
    Disconnect(DeviceId),
    EnableNotifications(CharacteristicAddress),
    DisableNotifications(CharacteristicAddress),
    Read(CharacteristicAddress),
    Write(CharacteristicAddress, Vec<u8>, WriteMode),
    MaxWriteLen(DeviceId),
}

#[derive(Default)]
struct FakeState {
    sender: Option<mpsc::UnboundedSender<StackEvent>>,
    calls: Vec<Call>,
    /// Method name -> error message for calls that should be rejected.
    failures: HashMap<&'static str, String>,
    mtu: usize,
}

/// A stack whose behavior is scripted by the test: records every call and
/// fails the ones the test marked as failing.
#[derive(Clone)]
struct FakeStack {
    state: Arc<Mutex<FakeState>>,
}

impl FakeStack {
    fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState {
                mtu: 23,
                ..FakeState::default()
            })),
        }
    }

    fn fail(&self, method: &'static str, message: &str) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert(method, message.into());
    }

    fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    fn sender(&self) -> mpsc::UnboundedSender<StackEvent> {
        self.state.lock().unwrap().sender.clone().unwrap()
    }

    fn record(&self, call: Call, method: &'static str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);
        match state.failures.get(method) {
            Some(message) => Err(anyhow!("{message}")),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl BleStack for FakeStack {
    fn set_event_sender(&self, events: mpsc::UnboundedSender<StackEvent>) {
        self.state.lock().unwrap().sender = Some(events);
    }

    async fn adapter_state(&self) -> AdapterState {
        AdapterState::PoweredOn
    }

    async fn start_scan(&self, filter: ServiceId) -> Result<()> {
        self.record(Call::StartScan(filter), "start_scan")
    }

    async fn stop_scan(&self) -> Result<()> {
        self.record(Call::StopScan, "stop_scan")
    }

    async fn connect(
        &self,
        device: &DeviceId,
        _plan: &DiscoveryPlan,
        _timeout: Option<Duration>,
    ) -> Result<()> {
        self.record(Call::Connect(device.clone()), "connect")
    }

    async fn disconnect(&self, device: &DeviceId) -> Result<()> {
        self.record(Call::Disconnect(device.clone()), "disconnect")
    }

    async fn enable_notifications(&self, address: &CharacteristicAddress) -> Result<()> {
        self.record(
            Call::EnableNotifications(address.clone()),
            "enable_notifications",
        )
    }

    async fn disable_notifications(&self, address: &CharacteristicAddress) -> Result<()> {
        self.record(
            Call::DisableNotifications(address.clone()),
            "disable_notifications",
        )
    }

    async fn read(&self, address: &CharacteristicAddress) -> Result<()> {
        self.record(Call::Read(address.clone()), "read")
    }

    async fn write(
        &self,
        address: &CharacteristicAddress,
        value: &[u8],
        mode: WriteMode,
    ) -> Result<()> {
        self.record(Call::Write(address.clone(), value.to_vec(), mode), "write")
    }

    async fn max_write_len(&self, device: &DeviceId) -> Result<usize> {
        self.record(Call::MaxWriteLen(device.clone()), "max_write_len")?;
        Ok(self.state.lock().unwrap().mtu)
    }
}

fn service(n: u128) -> ServiceId {
    ServiceId(Uuid::from_u128(n))
}

fn address(device: &str) -> CharacteristicAddress {
    CharacteristicAddress::new(
        DeviceId::new(device),
        service(0x180f),
        CharacteristicId(Uuid::from_u128(0x2a19)),
    )
}

async fn initialized() -> (Coordinator, FakeStack) {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut coordinator = Coordinator::new();
    let stack = FakeStack::new();
    coordinator.initialize(Arc::new(stack.clone())).unwrap();
    (coordinator, stack)
}

#[tokio::test]
async fn initialize_twice_fails_and_keeps_the_first_stack() {
    let (mut coordinator, stack) = initialized().await;

    let second = FakeStack::new();
    let err = coordinator.initialize(Arc::new(second.clone())).unwrap_err();
    assert!(matches!(err, CoordinatorError::AlreadyInitialized));

    // The first stack still receives operations.
    coordinator.configure_scan(service(1)).unwrap();
    coordinator
        .start_scanning(Box::new(mpsc::unbounded_channel::<DiscoveredDevice>().0))
        .await
        .unwrap();
    assert_eq!(stack.calls(), vec![Call::StartScan(service(1))]);
    assert!(second.calls().is_empty());
    assert!(second.state.lock().unwrap().sender.is_none());
}

#[tokio::test]
async fn operations_before_initialize_fail_fast() {
    let mut coordinator = Coordinator::new();

    assert!(matches!(
        coordinator.configure_scan(service(1)),
        Err(CoordinatorError::NotInitialized)
    ));
    assert!(matches!(
        coordinator
            .connect(&DeviceId::new("d"), DiscoveryPlan::All, None)
            .await,
        Err(CoordinatorError::NotInitialized)
    ));
    assert!(matches!(
        coordinator.deinitialize().await,
        Err(CoordinatorError::NotInitialized)
    ));

    // stopScanning is the exception: it always succeeds.
    coordinator.stop_scanning().await.unwrap();
}

#[tokio::test]
async fn scan_events_flow_only_between_start_and_stop() {
    let (mut coordinator, stack) = initialized().await;

    coordinator.configure_scan(service(0x51)).unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    coordinator.start_scanning(Box::new(tx)).await.unwrap();

    stack
        .sender()
        .send(StackEvent::Discovery(DiscoveredDevice {
            id: DeviceId::new("P"),
            name: String::new(),
            rssi: -60,
            service_data: vec![(service(0x51), vec![0xAA, 0xBB])],
        }))
        .unwrap();
    assert!(coordinator.process_next().await);

    let event = rx.try_recv().unwrap();
    assert_eq!(event.id, DeviceId::new("P"));
    assert_eq!(event.rssi, -60);
    assert_eq!(event.service_data, vec![(service(0x51), vec![0xAA, 0xBB])]);
    assert!(rx.try_recv().is_err());

    coordinator.stop_scanning().await.unwrap();
    assert_eq!(
        stack.calls(),
        vec![Call::StartScan(service(0x51)), Call::StopScan]
    );

    // A sighting racing the stop is not delivered.
    stack
        .sender()
        .send(StackEvent::Discovery(DiscoveredDevice {
            id: DeviceId::new("Q"),
            name: String::new(),
            rssi: -70,
            service_data: vec![],
        }))
        .unwrap();
    assert!(coordinator.process_next().await);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn configure_scan_rejects_reconfiguration_mid_scan() {
    let (mut coordinator, _stack) = initialized().await;

    coordinator.configure_scan(service(1)).unwrap();
    coordinator
        .start_scanning(Box::new(mpsc::unbounded_channel::<DiscoveredDevice>().0))
        .await
        .unwrap();

    assert!(matches!(
        coordinator.configure_scan(service(2)),
        Err(CoordinatorError::InternalInconsistency(_))
    ));

    // After stopping, reconfiguration replaces the session.
    coordinator.stop_scanning().await.unwrap();
    coordinator.configure_scan(service(2)).unwrap();
}

#[tokio::test]
async fn start_scanning_without_configuration_is_an_inconsistency() {
    let (mut coordinator, _stack) = initialized().await;
    let err = coordinator
        .start_scanning(Box::new(mpsc::unbounded_channel::<DiscoveredDevice>().0))
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::InternalInconsistency(_)));
}

#[tokio::test]
async fn clean_connect_yields_exactly_one_connected_event() {
    let (mut coordinator, stack) = initialized().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    coordinator.set_connection_sink(Box::new(tx));

    let d = DeviceId::new("d");
    coordinator
        .connect(&d, DiscoveryPlan::All, Some(Duration::from_secs(5)))
        .await
        .unwrap();

    stack
        .sender()
        .send(StackEvent::ConnectionChange {
            device_id: d.clone(),
            change: ConnectionChange::Connected,
        })
        .unwrap();
    assert!(coordinator.process_next().await);
    // Link up alone is not "usable": nothing is emitted yet.
    assert!(rx.try_recv().is_err());

    stack
        .sender()
        .send(StackEvent::DiscoveryComplete {
            device_id: d.clone(),
            errors: vec![],
        })
        .unwrap();
    assert!(coordinator.process_next().await);

    let event = rx.try_recv().unwrap();
    assert_eq!(event.device_id, d);
    assert_eq!(event.state, ConnectionState::Connected);
    assert!(event.failure.is_none());
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn failed_connect_yields_one_disconnected_event_with_failure() {
    let (mut coordinator, stack) = initialized().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    coordinator.set_connection_sink(Box::new(tx));

    let d = DeviceId::new("d");
    coordinator.connect(&d, DiscoveryPlan::All, None).await.unwrap();

    stack
        .sender()
        .send(StackEvent::ConnectionChange {
            device_id: d.clone(),
            change: ConnectionChange::FailedToConnect {
                error: Some("peer unreachable".into()),
            },
        })
        .unwrap();
    assert!(coordinator.process_next().await);

    let event = rx.try_recv().unwrap();
    assert_eq!(event.device_id, d);
    assert_eq!(event.state, ConnectionState::Disconnected);
    let failure = event.failure.unwrap();
    assert_eq!(failure.code, ConnectionFailure::FailedToConnect);
    assert_eq!(failure.message, "peer unreachable");
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn synchronously_rejected_connect_still_reports_through_the_stream() {
    let (mut coordinator, stack) = initialized().await;
    stack.fail("connect", "out of connection slots");

    let (tx, mut rx) = mpsc::unbounded_channel();
    coordinator.set_connection_sink(Box::new(tx));

    let d = DeviceId::new("d");
    // The call itself is an acknowledged success.
    coordinator.connect(&d, DiscoveryPlan::All, None).await.unwrap();

    let event = rx.try_recv().unwrap();
    assert_eq!(event.state, ConnectionState::Disconnected);
    let failure = event.failure.unwrap();
    assert_eq!(failure.code, ConnectionFailure::FailedToConnect);
    assert!(failure.message.contains("out of connection slots"));
}

#[tokio::test]
async fn disconnect_clears_subscriptions_and_reports_disconnected() {
    let (mut coordinator, stack) = initialized().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    coordinator.set_connection_sink(Box::new(tx));

    let d = DeviceId::new("d");
    let addr = address("d");
    coordinator.connect(&d, DiscoveryPlan::All, None).await.unwrap();
    stack
        .sender()
        .send(StackEvent::ConnectionChange {
            device_id: d.clone(),
            change: ConnectionChange::Connected,
        })
        .unwrap();
    stack
        .sender()
        .send(StackEvent::DiscoveryComplete {
            device_id: d.clone(),
            errors: vec![],
        })
        .unwrap();
    coordinator.process_next().await;
    coordinator.process_next().await;
    rx.try_recv().unwrap();

    coordinator.enable_notifications(&addr).await.unwrap();
    assert!(coordinator.is_subscribed(&addr));

    coordinator.disconnect(&d).await.unwrap();
    stack
        .sender()
        .send(StackEvent::ConnectionChange {
            device_id: d.clone(),
            change: ConnectionChange::Disconnected { error: None },
        })
        .unwrap();
    coordinator.process_next().await;

    assert!(!coordinator.is_subscribed(&addr));
    let event = rx.try_recv().unwrap();
    assert_eq!(event.state, ConnectionState::Disconnected);
    assert!(event.failure.is_none());
}

#[tokio::test]
async fn notification_toggling_tracks_the_subscription_set() {
    let (mut coordinator, stack) = initialized().await;
    let addr = address("d");

    coordinator.enable_notifications(&addr).await.unwrap();
    assert!(coordinator.is_subscribed(&addr));

    coordinator.disable_notifications(&addr).await.unwrap();
    assert!(!coordinator.is_subscribed(&addr));

    assert_eq!(
        stack.calls(),
        vec![
            Call::EnableNotifications(addr.clone()),
            Call::DisableNotifications(addr.clone()),
        ]
    );

    // A stack failure surfaces through the completion and leaves the set
    // untouched.
    stack.fail("enable_notifications", "subscribe failed");
    let err = coordinator.enable_notifications(&addr).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::Unknown(_)));
    assert!(!coordinator.is_subscribed(&addr));
}

#[tokio::test]
async fn notification_ops_validate_the_address() {
    let (mut coordinator, stack) = initialized().await;
    let unqualified = CharacteristicAddress::new(
        DeviceId::new("d"),
        ServiceId(Uuid::nil()),
        CharacteristicId(Uuid::from_u128(0x2a19)),
    );

    let err = coordinator
        .enable_notifications(&unqualified)
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::InvalidArgument(_)));
    assert!(stack.calls().is_empty());
}

#[tokio::test]
async fn failed_read_reports_on_the_value_stream_not_the_call() {
    let (mut coordinator, stack) = initialized().await;
    stack.fail("read", "device is not connected");

    let (tx, mut rx) = mpsc::unbounded_channel();
    coordinator.set_value_sink(Box::new(tx));

    let addr = address("d");
    coordinator.read(&addr).await.unwrap();

    let event = rx.try_recv().unwrap();
    assert_eq!(event.address, addr);
    assert!(event.value.is_none());
    assert!(
        event
            .failure
            .unwrap()
            .message
            .contains("device is not connected")
    );
}

#[tokio::test]
async fn read_with_unqualified_address_reports_on_the_value_stream() {
    let (mut coordinator, stack) = initialized().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    coordinator.set_value_sink(Box::new(tx));

    let unqualified = CharacteristicAddress::new(
        DeviceId::new(""),
        service(0x180f),
        CharacteristicId(Uuid::from_u128(0x2a19)),
    );
    coordinator.read(&unqualified).await.unwrap();

    let event = rx.try_recv().unwrap();
    assert!(event.failure.is_some());
    // Never handed to the stack.
    assert!(stack.calls().is_empty());
}

#[tokio::test]
async fn read_failure_with_no_subscriber_is_not_fatal() {
    let (mut coordinator, stack) = initialized().await;
    stack.fail("read", "nope");
    coordinator.read(&address("d")).await.unwrap();
}

#[tokio::test]
async fn value_updates_route_reads_and_notifications_identically() {
    let (mut coordinator, stack) = initialized().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    coordinator.set_value_sink(Box::new(tx));

    let addr = address("d");
    stack
        .sender()
        .send(StackEvent::ValueUpdate {
            address: addr.clone(),
            value: Some(vec![0x64]),
            error: None,
        })
        .unwrap();
    coordinator.process_next().await;

    let event = rx.try_recv().unwrap();
    assert_eq!(event.address, addr);
    assert_eq!(event.value.as_deref(), Some(&[0x64][..]));
    assert!(event.failure.is_none());
}

#[tokio::test]
async fn value_update_with_no_sink_is_dropped_silently() {
    let (mut coordinator, stack) = initialized().await;
    stack
        .sender()
        .send(StackEvent::ValueUpdate {
            address: address("d"),
            value: Some(vec![1]),
            error: None,
        })
        .unwrap();
    assert!(coordinator.process_next().await);
}

#[tokio::test]
async fn write_results_carry_the_address_and_at_most_one_failure() {
    let (mut coordinator, stack) = initialized().await;
    let addr = address("d");

    let ok = coordinator
        .write_without_response(&addr, &[1, 2, 3])
        .await
        .unwrap();
    assert_eq!(ok.address, addr);
    assert!(ok.failure.is_none());

    stack.fail("write", "characteristic not writable");
    let rejected = coordinator
        .write_without_response(&addr, &[4])
        .await
        .unwrap();
    assert_eq!(rejected.address, addr);
    assert!(
        rejected
            .failure
            .unwrap()
            .message
            .contains("characteristic not writable")
    );

    assert_eq!(
        stack.calls(),
        vec![
            Call::Write(addr.clone(), vec![1, 2, 3], WriteMode::WithoutResponse),
            Call::Write(addr.clone(), vec![4], WriteMode::WithoutResponse),
        ]
    );
}

#[tokio::test]
async fn write_with_response_resolves_through_the_call() {
    let (mut coordinator, stack) = initialized().await;
    let addr = address("d");

    let result = coordinator
        .write_with_response(&addr, &[0xCA, 0xFE])
        .await
        .unwrap();
    assert_eq!(result.address, addr);
    assert!(result.failure.is_none());
    assert_eq!(
        stack.calls(),
        vec![Call::Write(
            addr,
            vec![0xCA, 0xFE],
            WriteMode::WithResponse
        )]
    );
}

#[tokio::test]
async fn mtu_query_returns_size_or_failure() {
    let (mut coordinator, stack) = initialized().await;
    let d = DeviceId::new("d");

    let result = coordinator.query_max_write_len(&d).await.unwrap();
    assert_eq!(result.mtu, Some(23));
    assert!(result.failure.is_none());

    stack.fail("max_write_len", "device is not connected");
    let result = coordinator.query_max_write_len(&d).await.unwrap();
    assert!(result.mtu.is_none());
    assert!(
        result
            .failure
            .unwrap()
            .message
            .contains("device is not connected")
    );
}

#[tokio::test]
async fn adapter_sink_replays_current_state_and_forwards_changes() {
    let (mut coordinator, stack) = initialized().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    coordinator.set_adapter_sink(Box::new(tx)).await;

    // Replayed immediately on attach.
    assert_eq!(rx.try_recv().unwrap(), AdapterState::PoweredOn);

    stack
        .sender()
        .send(StackEvent::AdapterChanged(AdapterState::PoweredOff))
        .unwrap();
    coordinator.process_next().await;
    assert_eq!(rx.try_recv().unwrap(), AdapterState::PoweredOff);
}

#[tokio::test]
async fn deinitialize_tears_down_sessions_and_silences_callbacks() {
    let (mut coordinator, stack) = initialized().await;
    let d = DeviceId::new("d");

    coordinator.configure_scan(service(1)).unwrap();
    coordinator
        .start_scanning(Box::new(mpsc::unbounded_channel::<DiscoveredDevice>().0))
        .await
        .unwrap();
    coordinator.connect(&d, DiscoveryPlan::All, None).await.unwrap();

    let sender = stack.sender();
    coordinator.deinitialize().await.unwrap();

    let calls = stack.calls();
    assert!(calls.contains(&Call::StopScan));
    assert!(calls.contains(&Call::Disconnect(d.clone())));

    // The callback channel is closed: late callbacks go nowhere.
    assert!(
        sender
            .send(StackEvent::ConnectionChange {
                device_id: d,
                change: ConnectionChange::Disconnected { error: None },
            })
            .is_err()
    );
    assert!(!coordinator.process_next().await);

    // A fresh initialize works again.
    coordinator.initialize(Arc::new(FakeStack::new())).unwrap();
}
