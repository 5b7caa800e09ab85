//! Authoritative bus topic namespace
//!
//! Hierarchical slash-delimited routing keys. Subscriptions may use `+`
//! (single level) and a trailing `#` (multi level); published topics never
//! contain wildcards.

use crate::device::SiteId;

/// `devices/<id>/status`
pub fn device_status(device_id: &str) -> String {
    format!("devices/{}/status", device_id)
}

/// `devices/<id>/telemetry`
pub fn device_telemetry(device_id: &str) -> String {
    format!("devices/{}/telemetry", device_id)
}

/// `devices/<id>/commands`
pub fn device_commands(device_id: &str) -> String {
    format!("devices/{}/commands", device_id)
}

/// `devices/<id>/commands/response`
pub fn device_command_response(device_id: &str) -> String {
    format!("devices/{}/commands/response", device_id)
}

/// `devices/<id>/events`
pub fn device_events(device_id: &str) -> String {
    format!("devices/{}/events", device_id)
}

/// `gateways/<id>/status`
pub fn gateway_status(gateway_id: &str) -> String {
    format!("gateways/{}/status", gateway_id)
}

/// `gateways/<id>/telemetry`
pub fn gateway_telemetry(gateway_id: &str) -> String {
    format!("gateways/{}/telemetry", gateway_id)
}

/// `gateways/<id>/commands`
pub fn gateway_commands(gateway_id: &str) -> String {
    format!("gateways/{}/commands", gateway_id)
}

/// `sites/<id>/energy/readings`
pub fn site_energy_readings(site_id: SiteId) -> String {
    format!("sites/{}/energy/readings", site_id)
}

/// `vpp/events/<eventId>`
pub fn vpp_event(event_id: &str) -> String {
    format!("vpp/events/{}", event_id)
}

/// `vpp/events/<eventId>/responses/<siteId>`
pub fn vpp_event_response(event_id: &str, site_id: SiteId) -> String {
    format!("vpp/events/{}/responses/{}", event_id, site_id)
}
