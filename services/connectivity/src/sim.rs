//! Simulated device profiles
//!
//! Mock transports share one value model: a deterministic base curve per
//! device type plus seeded jitter, so simulated fleets look alive while every
//! test assertion stays reproducible for a given seed and tick.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use types::{telemetry::channel, DeviceType};

/// Deterministic telemetry generator for one simulated device
#[derive(Debug, Clone)]
pub struct SimProfile {
    device_type: DeviceType,
    seed: u64,
    /// Fractional jitter on top of the base curve; 0 for exact values
    jitter: f64,
}

impl SimProfile {
    pub fn new(device_type: DeviceType, seed: u64) -> Self {
        Self {
            device_type,
            seed,
            jitter: 0.05,
        }
    }

    pub fn without_jitter(device_type: DeviceType, seed: u64) -> Self {
        Self {
            device_type,
            seed,
            jitter: 0.0,
        }
    }

    /// Value of `channel_name` at simulation tick `tick`
    pub fn value(&self, channel_name: &str, tick: u64) -> f64 {
        let base = self.base_value(channel_name, tick);
        if self.jitter == 0.0 {
            return base;
        }
        let mut rng = StdRng::seed_from_u64(self.seed ^ tick.wrapping_mul(0x9e37_79b9));
        let spread = base.abs().max(1.0) * self.jitter;
        base + rng.gen_range(-spread..=spread)
    }

    fn base_value(&self, channel_name: &str, tick: u64) -> f64 {
        // One tick is one scan; curves repeat on a 24-step "day".
        let phase = (tick % 24) as f64 / 24.0;
        match (self.device_type, channel_name) {
            (DeviceType::SolarPv, channel::POWER) => {
                // Daylight bell between phases 0.25 and 0.75
                let daylight = (std::f64::consts::PI * (phase - 0.25) * 2.0).sin();
                (daylight.max(0.0) * 5000.0).round()
            }
            (DeviceType::SolarPv, channel::ENERGY) => tick as f64 * 120.0,
            (DeviceType::BatteryStorage, channel::POWER) => {
                // Charge in the first half of the cycle, discharge after
                if phase < 0.5 {
                    2500.0
                } else {
                    -2200.0
                }
            }
            (DeviceType::BatteryStorage, channel::STATE_OF_CHARGE) => {
                40.0 + 30.0 * (std::f64::consts::PI * phase * 2.0).sin().abs()
            }
            (DeviceType::EvCharger, channel::POWER) => 7400.0,
            (DeviceType::EvCharger, channel::ENERGY) => tick as f64 * 123.0,
            (DeviceType::SmartMeter, channel::POWER) => 800.0 + 300.0 * phase,
            (DeviceType::SmartMeter, channel::ENERGY) => tick as f64 * 95.0,
            (DeviceType::HeatPump, channel::POWER) => 1800.0,
            (DeviceType::HeatPump, channel::TEMPERATURE) => 38.0 + 4.0 * phase,
            (_, channel::VOLTAGE) => 230.0,
            (_, channel::CURRENT) => 6.5,
            (_, channel::FREQUENCY) => 50.0,
            (_, channel::TEMPERATURE) => 25.0,
            (_, channel::STATE_OF_CHARGE) => 50.0,
            (_, channel::ENERGY) => tick as f64 * 100.0,
            _ => 0.0,
        }
    }
}
