//! Child address mapping
//!
//! Translates a gateway child's protocol-neutral datapoint map into the
//! concrete adapter's connection descriptor. Modbus-class children use their
//! address as the unit id on the gateway's port; TCP-class children use it
//! as a port offset from the gateway's base port.

use crate::error::{AdapterError, Result};
use types::{
    ChildDeviceSpec, ConnectionConfig, DataPointSpec, DeviceRecord, GatewayConfig, ModbusConfig,
    RegisterKind, RegisterSpec, SubProtocol, TcpipConfig, WordOrder,
};

/// Translate one datapoint into a register descriptor
pub fn register_from_datapoint(datapoint: &DataPointSpec) -> RegisterSpec {
    RegisterSpec {
        name: datapoint.name.clone(),
        kind: RegisterKind::Holding,
        address: datapoint.address,
        length: None,
        data_type: datapoint.data_type,
        scale: datapoint.scale,
        byte_order: WordOrder::Be,
        unit: datapoint.unit.clone(),
        bit_offset: None,
        access: datapoint.access,
        canonical: datapoint.canonical.clone(),
    }
}

/// Build the child's device record from the gateway's config
pub fn child_record(
    gateway: &DeviceRecord,
    config: &GatewayConfig,
    child: &ChildDeviceSpec,
) -> Result<DeviceRecord> {
    let connection = match child.sub_protocol {
        SubProtocol::ModbusGateway | SubProtocol::MbusGateway => {
            let unit_id = u8::try_from(child.address).map_err(|_| {
                AdapterError::Configuration(format!(
                    "child {}: address {} does not fit a modbus unit id",
                    child.device_id, child.address
                ))
            })?;
            ConnectionConfig::Modbus(ModbusConfig {
                host: config.host.clone(),
                port: config.port,
                unit_id,
                serial: None,
                registers: child.datapoints.iter().map(register_from_datapoint).collect(),
                scan_interval_ms: child.scan_interval_ms,
                mock: config.mock,
            })
        }
        SubProtocol::TcpipGateway | SubProtocol::MqttGateway => {
            ConnectionConfig::Tcpip(TcpipConfig {
                host: config.host.clone(),
                port: config.port + child.address,
                poll_interval_ms: child.scan_interval_ms,
                mock: config.mock,
            })
        }
    };

    Ok(DeviceRecord {
        id: gateway.id,
        device_id: child.device_id.clone(),
        site_id: gateway.site_id,
        device_type: child.device_type,
        connection,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use types::{DataPointAccess, DeviceType, RegisterDataType};

    fn gateway_record(config: GatewayConfig) -> DeviceRecord {
        DeviceRecord {
            id: 10,
            device_id: "gw-1".to_string(),
            site_id: 7,
            device_type: DeviceType::Gateway,
            connection: ConnectionConfig::Gateway(config),
        }
    }

    fn child(sub_protocol: SubProtocol, address: u16) -> ChildDeviceSpec {
        ChildDeviceSpec {
            device_id: "child-1".to_string(),
            device_type: DeviceType::SmartMeter,
            sub_protocol,
            address,
            datapoints: vec![DataPointSpec {
                name: "energy".to_string(),
                address: 100,
                data_type: RegisterDataType::Uint32,
                unit: Some("Wh".to_string()),
                scale: 0.1,
                access: DataPointAccess::Read,
                canonical: None,
            }],
            scan_interval_ms: 1000,
        }
    }

    fn config() -> GatewayConfig {
        GatewayConfig {
            host: "10.0.0.9".to_string(),
            port: 502,
            children: vec![],
            heartbeat_interval_secs: 60,
            mock: false,
        }
    }

    #[test]
    fn modbus_child_address_is_the_unit_id() {
        let config = config();
        let record = child_record(
            &gateway_record(config.clone()),
            &config,
            &child(SubProtocol::ModbusGateway, 3),
        )
        .unwrap();
        let ConnectionConfig::Modbus(m) = record.connection else {
            panic!("expected modbus child");
        };
        assert_eq!(m.unit_id, 3);
        assert_eq!(m.port, 502);
        assert_eq!(m.registers[0].name, "energy");
        assert_eq!(m.registers[0].scale, 0.1);
        assert_eq!(record.site_id, 7);
    }

    #[test]
    fn tcp_child_address_is_a_port_offset() {
        let config = config();
        let record = child_record(
            &gateway_record(config.clone()),
            &config,
            &child(SubProtocol::TcpipGateway, 4),
        )
        .unwrap();
        let ConnectionConfig::Tcpip(t) = record.connection else {
            panic!("expected tcpip child");
        };
        assert_eq!(t.port, 506);
    }

    #[test]
    fn oversized_unit_id_is_rejected() {
        let config = config();
        assert!(child_record(
            &gateway_record(config.clone()),
            &config,
            &child(SubProtocol::ModbusGateway, 300),
        )
        .is_err());
    }
}
