use serde::{Deserialize, Serialize};

use crate::alarm::Quantity;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AlarmThresholds {
    pub temp_high_c: f32,
    pub temp_low_c: f32,
    pub humidity_high_pct: f32,
    pub humidity_low_pct: f32,
    pub voc_index_high: f32,
    pub lux_low_lx: f32,
    pub battery_low_v: f32,
}

impl Default for AlarmThresholds {
    fn default() -> Self {
        Self {
            temp_high_c: 20.0,
            temp_low_c: 0.0,
            humidity_high_pct: 70.0,
            humidity_low_pct: 20.0,
            voc_index_high: 50.0,
            lux_low_lx: 50.0,
            battery_low_v: 3.3,
        }
    }
}

impl AlarmThresholds {
    pub fn threshold(&self, quantity: Quantity) -> f32 {
        match quantity {
            Quantity::TempHigh => self.temp_high_c,
            Quantity::TempLow => self.temp_low_c,
            Quantity::HumidityHigh => self.humidity_high_pct,
            Quantity::HumidityLow => self.humidity_low_pct,
            Quantity::VocHigh => self.voc_index_high,
            Quantity::LuxLow => self.lux_low_lx,
            Quantity::BatteryLow => self.battery_low_v,
        }
    }

    pub fn sanitize(&mut self) {
        self.temp_high_c = self.temp_high_c.clamp(-40.0, 85.0);
        self.temp_low_c = self.temp_low_c.clamp(-40.0, 85.0).min(self.temp_high_c);
        self.humidity_high_pct = self.humidity_high_pct.clamp(0.0, 100.0);
        self.humidity_low_pct = self
            .humidity_low_pct
            .clamp(0.0, 100.0)
            .min(self.humidity_high_pct);
        self.voc_index_high = self.voc_index_high.clamp(0.0, 500.0);
        self.lux_low_lx = self.lux_low_lx.max(0.0);
        self.battery_low_v = self.battery_low_v.clamp(0.0, 5.0);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub tb_host: String,
    pub tb_port: u16,
    pub device_token: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            tb_host: "192.168.1.100".to_string(),
            tb_port: 1883,
            device_token: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SensorConfig {
    pub poll_interval_ms: u64,
    pub voc_warmup_samples: u32,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            voc_warmup_samples: 40,
        }
    }
}

impl SensorConfig {
    pub fn sanitize(&mut self) {
        self.poll_interval_ms = self.poll_interval_ms.clamp(500, 60_000);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayPinConfig {
    pub light_pin: i32,
    pub vmc_pin: i32,
    pub heater_pin: i32,
    pub ac_pin: i32,
}

impl Default for RelayPinConfig {
    fn default() -> Self {
        Self {
            light_pin: 25,
            vmc_pin: 26,
            heater_pin: 27,
            ac_pin: 32,
        }
    }
}

impl RelayPinConfig {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();
        if self.light_pin < 0 {
            self.light_pin = defaults.light_pin;
        }
        if self.vmc_pin < 0 {
            self.vmc_pin = defaults.vmc_pin;
        }
        if self.heater_pin < 0 {
            self.heater_pin = defaults.heater_pin;
        }
        if self.ac_pin < 0 {
            self.ac_pin = defaults.ac_pin;
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub network: NetworkConfig,
    #[serde(default)]
    pub thresholds: AlarmThresholds,
    #[serde(default)]
    pub sensor: SensorConfig,
    #[serde(default)]
    pub relays: RelayPinConfig,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn default_thresholds_match_alarm_table() {
        let thresholds = AlarmThresholds::default();

        assert_eq!(thresholds.threshold(Quantity::TempHigh), 20.0);
        assert_eq!(thresholds.threshold(Quantity::TempLow), 0.0);
        assert_eq!(thresholds.threshold(Quantity::HumidityHigh), 70.0);
        assert_eq!(thresholds.threshold(Quantity::HumidityLow), 20.0);
        assert_eq!(thresholds.threshold(Quantity::VocHigh), 50.0);
        assert_eq!(thresholds.threshold(Quantity::LuxLow), 50.0);
        assert_eq!(thresholds.threshold(Quantity::BatteryLow), 3.3);
    }

    #[test]
    fn sanitize_keeps_low_thresholds_below_high() {
        let mut thresholds = AlarmThresholds {
            temp_low_c: 30.0,
            temp_high_c: 20.0,
            humidity_low_pct: 90.0,
            humidity_high_pct: 70.0,
            ..AlarmThresholds::default()
        };
        thresholds.sanitize();

        assert_eq!(thresholds.temp_low_c, 20.0);
        assert_eq!(thresholds.humidity_low_pct, 70.0);
    }

    #[test]
    fn negative_relay_pins_fall_back_to_defaults() {
        let mut pins = RelayPinConfig {
            light_pin: -1,
            vmc_pin: 4,
            heater_pin: -7,
            ac_pin: 33,
        };
        pins.sanitize();

        assert_eq!(pins.light_pin, RelayPinConfig::default().light_pin);
        assert_eq!(pins.vmc_pin, 4);
        assert_eq!(pins.heater_pin, RelayPinConfig::default().heater_pin);
        assert_eq!(pins.ac_pin, 33);
    }
}
