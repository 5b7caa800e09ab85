//! Adapter manager semantics: replace-on-add, remove, command wiring, and
//! the shutdown publish fence.

use connectivity::modbus::{MockModbusTransport, ModbusAdapter};
use connectivity::{
    AdapterManager, AdapterSettings, DeviceAdapter, ReconnectPolicy, SessionState,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use types::{
    BusMessage, ConnectionConfig, DataPointAccess, DeviceRecord, DeviceType, ModbusConfig,
    ProtocolFamily, RegisterDataType, RegisterKind, RegisterSpec, WordOrder,
};

fn modbus_record(device_id: &str) -> DeviceRecord {
    DeviceRecord {
        id: 1,
        device_id: device_id.to_string(),
        site_id: 7,
        device_type: DeviceType::SolarPv,
        connection: ConnectionConfig::Modbus(ModbusConfig {
            host: "127.0.0.1".to_string(),
            port: 502,
            unit_id: 1,
            serial: None,
            registers: vec![RegisterSpec {
                name: "power".to_string(),
                kind: RegisterKind::Holding,
                address: 0,
                length: None,
                data_type: RegisterDataType::Uint16,
                scale: 1.0,
                byte_order: WordOrder::Be,
                unit: Some("W".to_string()),
                bit_offset: None,
                access: DataPointAccess::ReadWrite,
                canonical: None,
            }],
            scan_interval_ms: 100,
            mock: true,
        }),
    }
}

fn settings() -> AdapterSettings {
    AdapterSettings {
        reconnect: ReconnectPolicy {
            jitter: 0.0,
            ..ReconnectPolicy::default()
        },
        ..AdapterSettings::default()
    }
}

/// Manager wired to scripted mock transports
fn mock_manager(bus: &bus::MessageBus) -> AdapterManager {
    AdapterManager::with_factory(
        ProtocolFamily::Modbus,
        bus.clone(),
        settings(),
        Arc::new(|record, bus, settings| {
            let types::ConnectionConfig::Modbus(config) = record.connection.clone() else {
                unreachable!("factory only sees modbus records");
            };
            let mock = Arc::new(MockModbusTransport::new());
            mock.set_words(0, &[42]);
            Ok(Arc::new(ModbusAdapter::with_mock(
                record, config, bus, settings, mock,
            )) as Arc<dyn DeviceAdapter>)
        }),
    )
    .auto_connect(false)
}

#[tokio::test]
async fn add_then_remove_restores_cardinality() {
    let bus = bus::MessageBus::new();
    let manager = mock_manager(&bus);
    assert!(manager.is_empty().await);

    manager.add_device(modbus_record("inv-1")).await.unwrap();
    assert_eq!(manager.len().await, 1);
    assert!(manager.get("inv-1").await.is_some());

    manager.remove_device("inv-1").await.unwrap();
    assert!(manager.is_empty().await);
    assert!(manager.get("inv-1").await.is_none());

    let err = manager.remove_device("inv-1").await.unwrap_err();
    assert_eq!(err.kind(), "AdapterNotFound");
}

#[tokio::test]
async fn add_with_same_id_replaces_and_disconnects_the_old_adapter() {
    let bus = bus::MessageBus::new();
    let manager = mock_manager(&bus);

    let first = manager.add_device(modbus_record("inv-1")).await.unwrap();
    first.connect().await.unwrap();
    assert!(first.is_connected());

    let second = manager.add_device(modbus_record("inv-1")).await.unwrap();
    assert_eq!(manager.len().await, 1);
    assert!(!Arc::ptr_eq(&first, &second));
    // The replaced adapter was fully torn down before construction of the
    // new one returned.
    assert_eq!(first.state(), SessionState::ShuttingDown);
    assert!(!first.is_connected());
}

#[tokio::test]
async fn wrong_family_is_rejected() {
    let bus = bus::MessageBus::new();
    let manager = mock_manager(&bus);
    let mut record = modbus_record("meter-1");
    record.connection = ConnectionConfig::Tcpip(types::TcpipConfig {
        host: "127.0.0.1".to_string(),
        port: 9000,
        poll_interval_ms: 1000,
        mock: true,
    });
    let err = manager.add_device(record).await.unwrap_err();
    assert_eq!(err.kind(), "Configuration");
}

#[tokio::test]
async fn bus_commands_are_dispatched_to_the_adapter() {
    let bus = bus::MessageBus::new();
    let (_h, mut responses) = bus.subscribe_channel("devices/inv-1/commands/response");
    let manager = mock_manager(&bus);
    let adapter = manager.add_device(modbus_record("inv-1")).await.unwrap();
    adapter.connect().await.unwrap();

    bus.publish(
        "devices/inv-1/commands",
        BusMessage::command("inv-1", "writeRegister", Some(json!({"name": "power", "value": 7.0}))),
    )
    .unwrap();

    let publication = tokio::time::timeout(Duration::from_secs(2), responses.recv())
        .await
        .expect("command response")
        .unwrap();
    let BusMessage::CommandResponse(r) = &*publication.message else {
        panic!("expected command response");
    };
    assert_eq!(r.command, "writeRegister");
    assert!(r.success);

    manager.shutdown().await;
}

#[tokio::test]
async fn shutdown_fences_all_publishes_for_managed_devices() {
    let bus = bus::MessageBus::new();
    let manager = mock_manager(&bus);
    let managed_ids = ["inv-1", "inv-2", "inv-3"];
    for id in managed_ids {
        let adapter = manager.add_device(modbus_record(id)).await.unwrap();
        adapter.connect().await.unwrap();
    }
    assert_eq!(manager.len().await, 3);

    // Subscribe after shutdown returns: anything arriving is a violation.
    manager.shutdown().await;
    let (_h, mut rx) = bus.subscribe_channel("devices/#");
    assert!(manager.is_empty().await);

    let late = tokio::time::timeout(Duration::from_millis(400), rx.recv()).await;
    assert!(
        late.is_err(),
        "no publish may happen after shutdown returned: {:?}",
        late.unwrap().map(|p| p.topic)
    );
}
