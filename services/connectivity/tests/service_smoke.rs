//! Composition-root smoke test: simulated devices through the whole plane.

use connectivity::{
    AdapterSettings, ConnectivityService, InMemoryRegistry, SessionState,
};
use std::sync::Arc;
use std::time::Duration;
use types::{
    BusMessage, ConnectionConfig, DataPointAccess, DeviceRecord, DeviceType, ModbusConfig,
    RegisterDataType, RegisterKind, RegisterSpec, WordOrder,
};

fn sim_modbus_record() -> DeviceRecord {
    DeviceRecord {
        id: 21,
        device_id: "bat-1".to_string(),
        site_id: 9,
        device_type: DeviceType::BatteryStorage,
        connection: ConnectionConfig::Modbus(ModbusConfig {
            host: "127.0.0.1".to_string(),
            port: 502,
            unit_id: 1,
            serial: None,
            registers: vec![
                RegisterSpec {
                    name: "power".to_string(),
                    kind: RegisterKind::Holding,
                    address: 0,
                    length: None,
                    data_type: RegisterDataType::Int32,
                    scale: 1.0,
                    byte_order: WordOrder::Be,
                    unit: Some("W".to_string()),
                    bit_offset: None,
                    access: DataPointAccess::Read,
                    canonical: None,
                },
                RegisterSpec {
                    name: "soc".to_string(),
                    kind: RegisterKind::Holding,
                    address: 2,
                    length: None,
                    data_type: RegisterDataType::Uint16,
                    scale: 0.1,
                    byte_order: WordOrder::Be,
                    unit: Some("%".to_string()),
                    bit_offset: None,
                    access: DataPointAccess::Read,
                    canonical: None,
                },
            ],
            scan_interval_ms: 50,
            mock: true,
        }),
    }
}

#[tokio::test]
async fn simulated_device_flows_through_the_plane() {
    let bus = bus::MessageBus::new();
    let registry = Arc::new(InMemoryRegistry::new());
    registry.insert(sim_modbus_record());
    let service = ConnectivityService::new(bus.clone(), registry, AdapterSettings::default());

    let (_h, mut telemetry) = bus.subscribe_channel("devices/bat-1/telemetry");
    let adapter = service.add_device(sim_modbus_record()).await.unwrap();
    adapter.connect().await.unwrap();
    assert_eq!(adapter.state(), SessionState::Connected);

    let publication = tokio::time::timeout(Duration::from_secs(2), telemetry.recv())
        .await
        .expect("simulated telemetry")
        .unwrap();
    let BusMessage::Telemetry(t) = &*publication.message else {
        panic!("expected telemetry");
    };
    // `soc` is a declared alias; it mirrors into the canonical channel.
    assert!(t.readings.contains_key("power"));
    assert!(t.readings.contains_key("stateOfCharge"));
    assert_eq!(t.units["power"], "W");

    // Disconnect cancels the scan timer: nothing fires afterwards.
    adapter.disconnect().await.unwrap();
    while telemetry.try_recv().is_ok() {}
    let late = tokio::time::timeout(Duration::from_millis(300), telemetry.recv()).await;
    assert!(
        late.map(|v| v.is_none()).unwrap_or(true),
        "no telemetry may arrive after disconnect"
    );

    // Shutdown closes the bus behind it.
    service.shutdown().await;
    assert!(bus
        .publish(
            "devices/x/status",
            BusMessage::status("x", types::DeviceStatus::Online, None)
        )
        .is_err());
}

#[tokio::test]
async fn remove_device_finds_the_owning_manager() {
    let bus = bus::MessageBus::new();
    let registry = Arc::new(InMemoryRegistry::new());
    let service = ConnectivityService::new(bus, registry, AdapterSettings::default());

    service.add_device(sim_modbus_record()).await.unwrap();
    service.remove_device("bat-1").await.unwrap();
    let err = service.remove_device("bat-1").await.unwrap_err();
    assert_eq!(err.kind(), "AdapterNotFound");
}
