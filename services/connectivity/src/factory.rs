//! Adapter construction
//!
//! One dispatch point from a device record to a concrete adapter; used by
//! the per-family managers and by the composite gateway when it instantiates
//! children.

use crate::adapter::DeviceAdapter;
use crate::eebus::EebusAdapter;
use crate::error::Result;
use crate::gateway::GatewayAdapter;
use crate::modbus::ModbusAdapter;
use crate::ocpp::OcppAdapter;
use crate::session::AdapterSettings;
use crate::tcpip::TcpipAdapter;
use std::sync::Arc;
use types::{DeviceRecord, ProtocolFamily};

/// Build the adapter matching a record's protocol family
pub fn build_adapter(
    record: &DeviceRecord,
    bus: bus::MessageBus,
    settings: AdapterSettings,
) -> Result<Arc<dyn DeviceAdapter>> {
    let adapter: Arc<dyn DeviceAdapter> = match record.protocol() {
        ProtocolFamily::Modbus => Arc::new(ModbusAdapter::from_record(record, bus, settings)?),
        ProtocolFamily::Ocpp => Arc::new(OcppAdapter::from_record(record, bus, settings)?),
        ProtocolFamily::Eebus => Arc::new(EebusAdapter::from_record(record, bus, settings)?),
        ProtocolFamily::Tcpip => Arc::new(TcpipAdapter::from_record(record, bus, settings)?),
        ProtocolFamily::Gateway => Arc::new(GatewayAdapter::from_record(record, bus, settings)?),
    };
    Ok(adapter)
}
