//! Composite gateway supervision: child failure domains are independent and
//! the composite status tracks per-child connectivity.

use connectivity::gateway::{GatewayAdapter, MockGatewayTransport};
use connectivity::modbus::{MockModbusTransport, ModbusAdapter};
use connectivity::{AdapterSettings, DeviceAdapter, ReconnectPolicy};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use types::{
    BusMessage, ConnectionConfig, DataPointAccess, DeviceRecord, DeviceStatus, DeviceType,
    GatewayConfig, ModbusConfig, RegisterDataType, RegisterKind, RegisterSpec, WordOrder,
};

fn fast_settings() -> AdapterSettings {
    AdapterSettings {
        reconnect: ReconnectPolicy {
            initial: Duration::from_millis(200),
            max: Duration::from_millis(500),
            multiplier: 2.0,
            jitter: 0.0,
            max_attempts: 5,
        },
        ..AdapterSettings::default()
    }
}

fn child_adapter(
    device_id: &str,
    bus: &bus::MessageBus,
    mock: Arc<MockModbusTransport>,
) -> Arc<dyn DeviceAdapter> {
    let config = ModbusConfig {
        host: "10.0.0.9".to_string(),
        port: 502,
        unit_id: 1,
        serial: None,
        registers: vec![RegisterSpec {
            name: "energy".to_string(),
            kind: RegisterKind::Holding,
            address: 0,
            length: None,
            data_type: RegisterDataType::Uint16,
            scale: 1.0,
            byte_order: WordOrder::Be,
            unit: Some("Wh".to_string()),
            bit_offset: None,
            access: DataPointAccess::Read,
            canonical: None,
        }],
        scan_interval_ms: 100,
        mock: true,
    };
    let record = DeviceRecord {
        id: 11,
        device_id: device_id.to_string(),
        site_id: 7,
        device_type: DeviceType::SmartMeter,
        connection: ConnectionConfig::Modbus(config.clone()),
    };
    Arc::new(ModbusAdapter::with_mock(
        &record,
        config,
        bus.clone(),
        fast_settings(),
        mock,
    ))
}

#[tokio::test]
async fn faulty_child_does_not_affect_siblings() {
    let bus = bus::MessageBus::new();
    let (_t, mut telemetry) = bus.subscribe_channel("devices/+/telemetry");
    let (_s, mut gateway_status) = bus.subscribe_channel("gateways/gw-1/status");

    let mock_x = Arc::new(MockModbusTransport::new());
    let mock_y = Arc::new(MockModbusTransport::new());
    let mock_z = Arc::new(MockModbusTransport::new());
    for mock in [&mock_x, &mock_y, &mock_z] {
        mock.set_words(0, &[500]);
    }
    // Y's wire is down: connects fail, and reads would too.
    mock_y.fail_connects(u32::MAX);
    mock_y.set_fail_reads(true);

    let children = vec![
        child_adapter("x", &bus, Arc::clone(&mock_x)),
        child_adapter("y", &bus, Arc::clone(&mock_y)),
        child_adapter("z", &bus, Arc::clone(&mock_z)),
    ];

    let config = GatewayConfig {
        host: "10.0.0.9".to_string(),
        port: 502,
        children: vec![],
        heartbeat_interval_secs: 1,
        mock: true,
    };
    let record = DeviceRecord {
        id: 10,
        device_id: "gw-1".to_string(),
        site_id: 7,
        device_type: DeviceType::Gateway,
        connection: ConnectionConfig::Gateway(config.clone()),
    };
    let gateway = GatewayAdapter::with_transport(
        &record,
        config,
        bus.clone(),
        fast_settings(),
        Arc::new(MockGatewayTransport::new()),
        children,
    );
    gateway.connect().await.unwrap();

    // Siblings keep publishing at their scan interval while Y is down.
    let mut counts: HashMap<String, usize> = HashMap::new();
    let window = tokio::time::Instant::now() + Duration::from_millis(1500);
    while tokio::time::Instant::now() < window {
        match tokio::time::timeout_at(window, telemetry.recv()).await {
            Ok(Some(publication)) => {
                *counts
                    .entry(publication.message.device_id().to_string())
                    .or_default() += 1;
            }
            _ => break,
        }
    }
    assert!(counts.get("x").copied().unwrap_or(0) >= 3, "x starved: {:?}", counts);
    assert!(counts.get("z").copied().unwrap_or(0) >= 3, "z starved: {:?}", counts);
    assert_eq!(counts.get("y"), None, "y must not publish telemetry");

    // Composite status converges on {x: online, y: offline, z: online}.
    let composite = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let publication = gateway_status.recv().await.expect("status stream");
            let BusMessage::Status(s) = &*publication.message else {
                continue;
            };
            let Some(children) = &s.children else {
                continue;
            };
            if children.get("x") == Some(&DeviceStatus::Online)
                && children.get("y") == Some(&DeviceStatus::Offline)
                && children.get("z") == Some(&DeviceStatus::Online)
            {
                return children.clone();
            }
        }
    })
    .await
    .expect("expected composite status with y offline");
    assert_eq!(composite.len(), 3);

    // Y heals; periodic retries bring it back without touching siblings.
    mock_y.fail_connects(0);
    mock_y.set_fail_reads(false);
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let publication = gateway_status.recv().await.expect("status stream");
            let BusMessage::Status(s) = &*publication.message else {
                continue;
            };
            if s.children
                .as_ref()
                .map(|c| c.get("y") == Some(&DeviceStatus::Online))
                .unwrap_or(false)
            {
                return;
            }
        }
    })
    .await
    .expect("y should recover");

    gateway.disconnect().await.unwrap();
    assert!(!gateway.is_connected());
}
