//! Modbus adapter end-to-end: telemetry emission, reconnect backoff, and
//! the register write path, all against the scripted mock transport.

use connectivity::modbus::{MockModbusTransport, ModbusAdapter};
use connectivity::{run_command, AdapterSettings, DeviceAdapter, ReconnectPolicy, SessionState};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use types::{
    BusMessage, ConnectionConfig, DataPointAccess, DeviceRecord, DeviceStatus, DeviceType,
    ModbusConfig, RegisterDataType, RegisterKind, RegisterSpec, WordOrder,
};

fn register(
    name: &str,
    address: u16,
    data_type: RegisterDataType,
    scale: f64,
    access: DataPointAccess,
) -> RegisterSpec {
    RegisterSpec {
        name: name.to_string(),
        kind: RegisterKind::Holding,
        address,
        length: None,
        data_type,
        scale,
        byte_order: WordOrder::Be,
        unit: None,
        bit_offset: None,
        access,
        canonical: None,
    }
}

fn config(scan_interval_ms: u64) -> ModbusConfig {
    ModbusConfig {
        host: "127.0.0.1".to_string(),
        port: 502,
        unit_id: 1,
        serial: None,
        registers: vec![
            register("power", 0, RegisterDataType::Uint16, 1.0, DataPointAccess::Read),
            register(
                "energy",
                2,
                RegisterDataType::Uint32,
                0.1,
                DataPointAccess::ReadWrite,
            ),
        ],
        scan_interval_ms,
        mock: true,
    }
}

fn record(config: &ModbusConfig) -> DeviceRecord {
    DeviceRecord {
        id: 1,
        device_id: "inv-1".to_string(),
        site_id: 7,
        device_type: DeviceType::SolarPv,
        connection: ConnectionConfig::Modbus(config.clone()),
    }
}

fn no_jitter_settings() -> AdapterSettings {
    AdapterSettings {
        reconnect: ReconnectPolicy {
            jitter: 0.0,
            ..ReconnectPolicy::default()
        },
        ..AdapterSettings::default()
    }
}

#[tokio::test]
async fn scripted_scans_emit_expected_telemetry() {
    let bus = bus::MessageBus::new();
    let (_h, mut telemetry) = bus.subscribe_channel("devices/inv-1/telemetry");

    let mock = Arc::new(MockModbusTransport::new());
    mock.set_words(0, &[100]);
    mock.set_words(2, &[0x0001, 0x0000]);

    let config = config(100);
    let adapter = ModbusAdapter::with_mock(
        &record(&config),
        config.clone(),
        bus.clone(),
        no_jitter_settings(),
        Arc::clone(&mock),
    );
    adapter.connect().await.unwrap();

    // First scan runs at connect time.
    let first = tokio::time::timeout(Duration::from_secs(2), telemetry.recv())
        .await
        .expect("first telemetry")
        .unwrap();
    let BusMessage::Telemetry(t) = &*first.message else {
        panic!("expected telemetry");
    };
    assert_eq!(t.readings["power"], 100.0);
    assert_eq!(t.readings["energy"], 6553.6);
    assert_eq!(t.device_id, "inv-1");

    // Second frame of the script.
    mock.set_words(0, &[110]);
    mock.set_words(2, &[0x0001, 0x0001]);
    let updated = loop {
        let publication = tokio::time::timeout(Duration::from_secs(2), telemetry.recv())
            .await
            .expect("subsequent telemetry")
            .unwrap();
        let BusMessage::Telemetry(t) = &*publication.message else {
            panic!("expected telemetry");
        };
        if t.readings["power"] == 110.0 {
            break t.clone();
        }
        // A scan raced the script update; its readings must be the old frame.
        assert_eq!(t.readings["power"], 100.0);
        assert_eq!(t.readings["energy"], 6553.6);
    };
    assert_eq!(updated.readings["energy"], 6553.7);

    adapter.disconnect().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn reconnect_backoff_doubles_then_resets_on_success() {
    let bus = bus::MessageBus::new();
    let (_h, mut status) = bus.subscribe_channel("devices/inv-1/status");

    let mock = Arc::new(MockModbusTransport::new());
    mock.fail_connects(3);
    mock.set_words(0, &[1]);
    mock.set_words(2, &[0, 0]);

    let config = config(60_000); // keep scans out of the way
    let adapter = ModbusAdapter::with_mock(
        &record(&config),
        config.clone(),
        bus.clone(),
        no_jitter_settings(),
        Arc::clone(&mock),
    );

    let started = tokio::time::Instant::now();
    assert!(adapter.connect().await.is_err());

    // Three failures, then success: attempts at t=0, 5, 15, 35.
    let mut error_count = 0;
    loop {
        let publication = tokio::time::timeout(Duration::from_secs(120), status.recv())
            .await
            .expect("status expected")
            .unwrap();
        let BusMessage::Status(s) = &*publication.message else {
            panic!("expected status");
        };
        match s.status {
            DeviceStatus::Error => error_count += 1,
            DeviceStatus::Online => break,
            DeviceStatus::Offline => {}
        }
    }
    assert_eq!(error_count, 3);
    assert_eq!(mock.connect_attempts(), 4);

    // 5 + 10 + 20 seconds of backoff before the successful attempt.
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_secs(35) && elapsed < Duration::from_secs(37),
        "unexpected backoff timing: {:?}",
        elapsed
    );

    // Counter resets once connected.
    assert_eq!(adapter.session().connection_attempts(), 0);
    assert_eq!(adapter.state(), SessionState::Connected);

    adapter.disconnect().await.unwrap();
}

#[tokio::test]
async fn write_path_enforces_register_declarations() {
    let bus = bus::MessageBus::new();
    let (_h, mut responses) = bus.subscribe_channel("devices/inv-1/commands/response");

    let mock = Arc::new(MockModbusTransport::new());
    mock.set_words(0, &[1]);
    mock.set_words(2, &[0, 0]);

    let config = config(10_000);
    let adapter: Arc<dyn DeviceAdapter> = Arc::new(ModbusAdapter::with_mock(
        &record(&config),
        config.clone(),
        bus.clone(),
        no_jitter_settings(),
        Arc::clone(&mock),
    ));
    adapter.connect().await.unwrap();

    // Read-only register refuses the write.
    run_command(
        &adapter,
        "writeRegister",
        json!({"name": "power", "value": 50.0}),
        Duration::from_secs(5),
    )
    .await
    .unwrap();
    // Unknown register.
    run_command(
        &adapter,
        "writeRegister",
        json!({"name": "bogus", "value": 1.0}),
        Duration::from_secs(5),
    )
    .await
    .unwrap();
    // Writable register: 6553.6 with scale 0.1 encodes as raw 65536.
    run_command(
        &adapter,
        "writeRegister",
        json!({"name": "energy", "value": 6553.6}),
        Duration::from_secs(5),
    )
    .await
    .unwrap();

    let mut outcomes = Vec::new();
    for _ in 0..3 {
        let publication = tokio::time::timeout(Duration::from_secs(2), responses.recv())
            .await
            .expect("command response")
            .unwrap();
        let BusMessage::CommandResponse(r) = &*publication.message else {
            panic!("expected command response");
        };
        outcomes.push((r.success, r.error.clone()));
    }
    assert_eq!(outcomes[0], (false, Some("ReadOnlyRegister".to_string())));
    assert_eq!(outcomes[1], (false, Some("UnknownRegister".to_string())));
    assert_eq!(outcomes[2], (true, None));
    assert_eq!(mock.written(), vec![(2, vec![0x0001, 0x0000])]);

    adapter.disconnect().await.unwrap();
}

#[tokio::test]
async fn short_reads_skip_the_register_and_keep_the_session() {
    let bus = bus::MessageBus::new();
    let (_h, mut telemetry) = bus.subscribe_channel("devices/inv-1/telemetry");

    let mock = Arc::new(MockModbusTransport::new());
    mock.set_words(0, &[100]);
    mock.set_words(2, &[0x0001, 0x0000]);
    mock.set_short_reads(true);

    let config = config(100);
    let adapter = ModbusAdapter::with_mock(
        &record(&config),
        config.clone(),
        bus.clone(),
        no_jitter_settings(),
        Arc::clone(&mock),
    );
    adapter.connect().await.unwrap();

    let publication = tokio::time::timeout(Duration::from_secs(2), telemetry.recv())
        .await
        .expect("telemetry still expected")
        .unwrap();
    let BusMessage::Telemetry(t) = &*publication.message else {
        panic!("expected telemetry");
    };
    // Both registers decode short; the scan still completes and the session
    // stays Connected.
    assert!(t.readings.is_empty());
    assert_eq!(adapter.state(), SessionState::Connected);

    adapter.disconnect().await.unwrap();
}
