//! Canonical telemetry channels
//!
//! Adapters publish whatever register/datapoint names a device exposes, and
//! additionally mirror well-known quantities into canonical channels so
//! downstream consumers never need per-model knowledge. The alias table below
//! is the declared mapping; descriptors may override it per register with an
//! explicit `canonical` field.

/// Canonical channel names
pub mod channel {
    pub const POWER: &str = "power";
    pub const ENERGY: &str = "energy";
    pub const VOLTAGE: &str = "voltage";
    pub const CURRENT: &str = "current";
    pub const FREQUENCY: &str = "frequency";
    pub const TEMPERATURE: &str = "temperature";
    pub const STATE_OF_CHARGE: &str = "stateOfCharge";
}

/// Default unit for a canonical channel
pub fn default_unit(channel_name: &str) -> Option<&'static str> {
    match channel_name {
        channel::POWER => Some("W"),
        channel::ENERGY => Some("Wh"),
        channel::VOLTAGE => Some("V"),
        channel::CURRENT => Some("A"),
        channel::FREQUENCY => Some("Hz"),
        channel::TEMPERATURE => Some("°C"),
        channel::STATE_OF_CHARGE => Some("%"),
        _ => None,
    }
}

/// Declared register/datapoint name → canonical channel mapping.
///
/// Exact matches only. Vendor-specific names not listed here must declare a
/// `canonical` override in their descriptor.
pub fn canonical_channel(name: &str) -> Option<&'static str> {
    match name {
        "power" | "active_power" | "output_power" | "ac_power" | "total_power" => {
            Some(channel::POWER)
        }
        "energy" | "total_energy" | "active_energy" | "energy_total" | "lifetime_energy" => {
            Some(channel::ENERGY)
        }
        "voltage" | "ac_voltage" | "grid_voltage" => Some(channel::VOLTAGE),
        "current" | "ac_current" | "grid_current" => Some(channel::CURRENT),
        "frequency" | "grid_frequency" => Some(channel::FREQUENCY),
        "temperature" | "internal_temperature" | "cell_temperature" => Some(channel::TEMPERATURE),
        "state_of_charge" | "soc" => Some(channel::STATE_OF_CHARGE),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_map_to_canonical_names() {
        assert_eq!(canonical_channel("active_power"), Some("power"));
        assert_eq!(canonical_channel("soc"), Some("stateOfCharge"));
        assert_eq!(canonical_channel("grid_frequency"), Some("frequency"));
    }

    #[test]
    fn unknown_names_are_not_guessed() {
        // No substring matching: "power_factor" is not power.
        assert_eq!(canonical_channel("power_factor"), None);
        assert_eq!(canonical_channel("apparent_power_l1"), None);
    }

    #[test]
    fn canonical_channels_have_units() {
        for ch in [
            channel::POWER,
            channel::ENERGY,
            channel::VOLTAGE,
            channel::CURRENT,
            channel::FREQUENCY,
            channel::TEMPERATURE,
            channel::STATE_OF_CHARGE,
        ] {
            assert!(default_unit(ch).is_some());
        }
    }
}
