use serde::{Deserialize, Serialize};

pub const FIRMWARE_VERSION: u8 = 6;
pub const DEFAULT_DELAY_MS: u32 = 900_000;
pub const DEFAULT_ENABLED: bool = true;
pub const DEFAULT_DEEP_SLEEP: bool = false;

/// Size of the packed on-storage record: version, delay (LE u32), enabled, deep sleep.
pub const RECORD_LEN: usize = 7;

/// The durable configuration record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceConfig {
    pub firmware_version: u8,
    pub delay_ms: u32,
    pub enabled: bool,
    pub deep_sleep: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            firmware_version: FIRMWARE_VERSION,
            delay_ms: DEFAULT_DELAY_MS,
            enabled: DEFAULT_ENABLED,
            deep_sleep: DEFAULT_DEEP_SLEEP,
        }
    }
}

/// Outcome of comparing a loaded record against the running build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaCheck {
    Current(DeviceConfig),
    Unknown { found: u8 },
}

impl DeviceConfig {
    pub fn encode(&self) -> [u8; RECORD_LEN] {
        let mut out = [0_u8; RECORD_LEN];
        out[0] = self.firmware_version;
        out[1..5].copy_from_slice(&self.delay_ms.to_le_bytes());
        out[5] = u8::from(self.enabled);
        out[6] = u8::from(self.deep_sleep);
        out
    }

    /// Decodes whatever the storage region holds. Short input is padded with
    /// 0xFF the way an erased region reads back, so it never matches a real
    /// firmware version.
    pub fn decode(bytes: &[u8]) -> Self {
        let mut raw = [0xFF_u8; RECORD_LEN];
        if bytes.len() >= RECORD_LEN {
            raw.copy_from_slice(&bytes[..RECORD_LEN]);
        }

        Self {
            firmware_version: raw[0],
            delay_ms: u32::from_le_bytes([raw[1], raw[2], raw[3], raw[4]]),
            enabled: raw[5] != 0,
            deep_sleep: raw[6] != 0,
        }
    }

    pub fn check_schema(self, compiled_version: u8) -> SchemaCheck {
        if self.firmware_version == compiled_version {
            SchemaCheck::Current(self)
        } else {
            SchemaCheck::Unknown {
                found: self.firmware_version,
            }
        }
    }

    pub fn snapshot_view(&self) -> ConfigSnapshot {
        ConfigSnapshot {
            delay: self.delay_ms,
            deep_sleep: self.deep_sleep,
            enabled: self.enabled,
        }
    }
}

/// Externally readable view of the record. Field order is the wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub delay: u32,
    #[serde(rename = "deepSleep")]
    pub deep_sleep: bool,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    pub namespace: String,
    pub name: String,
    /// Input that ends a deep-sleep suspend early.
    pub wake_pin: u8,
    pub publish_heat_index: bool,
    pub rtc_enabled: bool,
    pub startup_delay_ms: u64,
    pub loop_interval_ms: u64,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            namespace: "worm".to_string(),
            name: "mindflayer".to_string(),
            wake_pin: 33,
            publish_heat_index: false,
            rtc_enabled: true,
            startup_delay_ms: 1_000,
            loop_interval_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            mqtt_host: "192.168.1.100".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub device: DeviceSettings,
    #[serde(default)]
    pub network: NetworkConfig,
}

impl DeviceSettings {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();
        if self.namespace.trim().is_empty() {
            self.namespace = defaults.namespace;
        }
        if self.name.trim().is_empty() {
            self.name = defaults.name;
        }
        self.loop_interval_ms = self.loop_interval_ms.max(10);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn record_survives_storage_layout() {
        let config = DeviceConfig {
            firmware_version: FIRMWARE_VERSION,
            delay_ms: 65_537,
            enabled: false,
            deep_sleep: true,
        };

        let bytes = config.encode();
        assert_eq!(bytes, [6, 0x01, 0x00, 0x01, 0x00, 0, 1]);
        assert_eq!(DeviceConfig::decode(&bytes), config);
    }

    #[test]
    fn short_record_reads_as_erased() {
        let decoded = DeviceConfig::decode(&[6, 1]);

        assert_eq!(decoded.firmware_version, 0xFF);
        assert_eq!(decoded.delay_ms, u32::MAX);
        assert_eq!(
            decoded.check_schema(FIRMWARE_VERSION),
            SchemaCheck::Unknown { found: 0xFF }
        );
    }

    #[test]
    fn foreign_version_is_unknown() {
        let mut config = DeviceConfig::default();
        assert_eq!(
            config.check_schema(FIRMWARE_VERSION),
            SchemaCheck::Current(config)
        );

        config.firmware_version = 5;
        assert_eq!(
            config.check_schema(FIRMWARE_VERSION),
            SchemaCheck::Unknown { found: 5 }
        );
    }

    #[test]
    fn snapshot_keeps_fixed_key_order() {
        let json = serde_json::to_string(&DeviceConfig::default().snapshot_view()).unwrap();
        assert_eq!(json, r#"{"delay":900000,"deepSleep":false,"enabled":true}"#);
    }

    #[test]
    fn runtime_config_fills_missing_sections() {
        let runtime: RuntimeConfig =
            serde_json::from_str(r#"{"network":{"wifi_ssid":"lab","wifi_pass":"","mqtt_host":"10.0.0.2","mqtt_port":1884,"mqtt_user":"","mqtt_pass":""}}"#)
                .unwrap();

        assert_eq!(runtime.device.namespace, "worm");
        assert_eq!(runtime.network.mqtt_port, 1884);
    }

    #[test]
    fn sanitize_restores_blank_names() {
        let mut settings = DeviceSettings {
            namespace: " ".to_string(),
            name: String::new(),
            loop_interval_ms: 0,
            ..DeviceSettings::default()
        };
        settings.sanitize();

        assert_eq!(settings.namespace, "worm");
        assert_eq!(settings.name, "mindflayer");
        assert_eq!(settings.loop_interval_ms, 10);
    }
}
