use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("mqtt port {0} is not in 1..=65535")]
    InvalidPort(u32),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FanConfig {
    pub tick_interval_ms: u32,
    pub backoff_ms: u32,
    pub boot_grace_ms: u32,
    pub connect_timeout_ms: u32,
    pub max_payload_bytes: usize,
    pub status_interval_ms: u32,
}

impl Default for FanConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 100,
            backoff_ms: 5_000,
            boot_grace_ms: 5_000,
            connect_timeout_ms: 3_000,
            max_payload_bytes: 512,
            status_interval_ms: 60_000,
        }
    }
}

impl FanConfig {
    pub fn sanitize(&mut self) {
        self.tick_interval_ms = self.tick_interval_ms.clamp(10, 1_000);
        self.backoff_ms = self.backoff_ms.max(1_000);
        self.connect_timeout_ms = self.connect_timeout_ms.clamp(500, 15_000);
        self.max_payload_bytes = self.max_payload_bytes.clamp(16, 4_096);
        if self.status_interval_ms != 0 {
            self.status_interval_ms = self.status_interval_ms.max(1_000);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub mqtt_host: String,
    pub mqtt_port: u32,
    pub mqtt_user: String,
    pub mqtt_pass: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            mqtt_host: String::new(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IrCaptureConfig {
    pub enabled: bool,
    pub rx_pin: i32,
    pub rmt_channel: u8,
    pub buffer_entries: usize,
    pub idle_timeout_ms: u8,
}

impl Default for IrCaptureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rx_pin: 14,
            rmt_channel: 4,
            buffer_entries: 1_024,
            idle_timeout_ms: 15,
        }
    }
}

impl IrCaptureConfig {
    pub fn sanitize(&mut self) {
        if self.rx_pin < 0 {
            self.rx_pin = 14;
        }

        if self.rmt_channel > 7 {
            self.rmt_channel = 4;
        }

        self.buffer_entries = self.buffer_entries.clamp(64, 1_024);
        self.idle_timeout_ms = self.idle_timeout_ms.clamp(5, 50);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RuntimeConfig {
    pub fan: FanConfig,
    pub network: NetworkConfig,
    pub ir: IrCaptureConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionCredentials {
    pub host: String,
    pub port: u16,
    pub credentials: Option<Credentials>,
}

impl ConnectionCredentials {
    // `Ok(None)` means messaging is switched off: no host or a zero port.
    pub fn from_network(network: &NetworkConfig) -> Result<Option<Self>, ConfigError> {
        let host = network.mqtt_host.trim();
        if host.is_empty() || network.mqtt_port == 0 {
            return Ok(None);
        }

        let port = u16::try_from(network.mqtt_port)
            .map_err(|_| ConfigError::InvalidPort(network.mqtt_port))?;

        let credentials = if network.mqtt_user.is_empty() {
            None
        } else {
            Some(Credentials {
                username: network.mqtt_user.clone(),
                password: network.mqtt_pass.clone(),
            })
        };

        Ok(Some(Self {
            host: host.to_string(),
            port,
            credentials,
        }))
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn network(host: &str, port: u32, user: &str, pass: &str) -> NetworkConfig {
        NetworkConfig {
            mqtt_host: host.to_string(),
            mqtt_port: port,
            mqtt_user: user.to_string(),
            mqtt_pass: pass.to_string(),
            ..NetworkConfig::default()
        }
    }

    #[test]
    fn empty_host_disables_messaging() {
        assert_eq!(
            ConnectionCredentials::from_network(&network("", 1883, "", "")),
            Ok(None)
        );
        assert_eq!(
            ConnectionCredentials::from_network(&network("   ", 1883, "u", "p")),
            Ok(None)
        );
    }

    #[test]
    fn zero_port_disables_messaging() {
        assert_eq!(
            ConnectionCredentials::from_network(&network("broker", 0, "", "")),
            Ok(None)
        );
    }

    #[test]
    fn port_above_u16_is_rejected() {
        assert_eq!(
            ConnectionCredentials::from_network(&network("broker", 70_000, "", "")),
            Err(ConfigError::InvalidPort(70_000))
        );
    }

    #[test]
    fn credentials_follow_username() {
        let anonymous = ConnectionCredentials::from_network(&network("broker", 1883, "", "secret"))
            .unwrap()
            .unwrap();
        assert!(!anonymous.has_credentials());

        let login = ConnectionCredentials::from_network(&network("broker", 1883, "fan", ""))
            .unwrap()
            .unwrap();
        assert_eq!(
            login.credentials,
            Some(Credentials {
                username: "fan".to_string(),
                password: String::new(),
            })
        );
    }

    #[test]
    fn runtime_config_fills_missing_sections() {
        let runtime: RuntimeConfig =
            serde_json::from_str(r#"{"network":{"mqtt_host":"10.0.0.2"}}"#).unwrap();

        assert_eq!(runtime.network.mqtt_host, "10.0.0.2");
        assert_eq!(runtime.network.mqtt_port, 1883);
        assert_eq!(runtime.fan, FanConfig::default());
        assert_eq!(runtime.ir, IrCaptureConfig::default());
    }

    #[test]
    fn sanitize_clamps_timing() {
        let mut fan = FanConfig {
            tick_interval_ms: 0,
            backoff_ms: 10,
            boot_grace_ms: 0,
            connect_timeout_ms: 60_000,
            max_payload_bytes: 1,
            status_interval_ms: 5,
        };
        fan.sanitize();

        assert_eq!(fan.tick_interval_ms, 10);
        assert_eq!(fan.backoff_ms, 1_000);
        assert_eq!(fan.boot_grace_ms, 0);
        assert_eq!(fan.connect_timeout_ms, 15_000);
        assert_eq!(fan.max_payload_bytes, 16);
        assert_eq!(fan.status_interval_ms, 1_000);
    }
}
