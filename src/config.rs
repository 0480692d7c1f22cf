use serde::Deserialize;
use std::env;
use std::time::Duration;

use crate::protocol::DEVICE_PORT;
use crate::transport::RetryPolicy;
use crate::tuya::DeviceIdentity;

/// Timeouts and retry behavior for a [`DeviceClient`](crate::DeviceClient).
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// How long to wait for a reply once connected.
    pub response_timeout: Duration,
    pub connect_timeout: Duration,
    pub port: u16,
    pub retry: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(1),
            port: DEVICE_PORT,
            retry: RetryPolicy::default(),
        }
    }
}

/// Command-line configuration: the known devices plus client settings.
#[derive(Debug, Clone)]
pub struct Config {
    pub client: ClientConfig,
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub name: String,
    pub identity: DeviceIdentity,
}

// One entry of the devices file
#[derive(Deserialize)]
struct RawDevice {
    #[serde(flatten)]
    identity: DeviceIdentity,
    #[serde(default)]
    name: Option<String>,
}

fn env_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let devices_file = env_or_default("DEVICES_FILE", "devices.json".to_string());
        let devices = load_devices(&devices_file)?;

        let defaults = ClientConfig::default();
        let config = Self {
            client: ClientConfig {
                response_timeout: Duration::from_secs(env_or_default(
                    "TUYA_RESPONSE_TIMEOUT_SECS",
                    defaults.response_timeout.as_secs(),
                )),
                connect_timeout: Duration::from_millis(env_or_default(
                    "TUYA_CONNECT_TIMEOUT_MS",
                    defaults.connect_timeout.as_millis() as u64,
                )),
                port: env_or_default("TUYA_PORT", defaults.port),
                retry: RetryPolicy {
                    max_retries: env_or_default("TUYA_MAX_RETRIES", defaults.retry.max_retries),
                    backoff_factor: env_or_default(
                        "TUYA_BACKOFF_FACTOR",
                        defaults.retry.backoff_factor,
                    ),
                    min_backoff: Duration::from_millis(env_or_default(
                        "TUYA_MIN_BACKOFF_MS",
                        defaults.retry.min_backoff.as_millis() as u64,
                    )),
                },
            },
            devices,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        if self.devices.is_empty() {
            return Err("No devices found in devices file".into());
        }
        if self.client.response_timeout.is_zero() {
            return Err("TUYA_RESPONSE_TIMEOUT_SECS must be > 0".into());
        }
        if self.client.connect_timeout.is_zero() {
            return Err("TUYA_CONNECT_TIMEOUT_MS must be > 0".into());
        }
        if self.client.retry.backoff_factor < 1.0 {
            return Err("TUYA_BACKOFF_FACTOR must be >= 1.0".into());
        }
        Ok(())
    }

    /// Look a device up by name or id. With no selector, a single configured
    /// device is chosen implicitly.
    pub fn device(&self, selector: Option<&str>) -> Result<&DeviceConfig, String> {
        match selector {
            Some(s) => self
                .devices
                .iter()
                .find(|d| d.name == s || d.identity.id == s)
                .ok_or_else(|| format!("No device named {s}")),
            None if self.devices.len() == 1 => Ok(&self.devices[0]),
            None => Err(format!(
                "{} devices configured; pick one with --device",
                self.devices.len()
            )),
        }
    }
}

fn load_devices(path: &str) -> Result<Vec<DeviceConfig>, String> {
    let content =
        std::fs::read_to_string(path).map_err(|e| format!("Failed to read {path}: {e}"))?;
    parse_devices(&content).map_err(|e| format!("Failed to parse {path}: {e}"))
}

fn parse_devices(content: &str) -> Result<Vec<DeviceConfig>, String> {
    let raw_devices: Vec<RawDevice> = serde_json::from_str(content).map_err(|e| e.to_string())?;

    raw_devices
        .into_iter()
        .map(|raw| {
            if raw.identity.key.len() != 16 {
                return Err(format!(
                    "Device {} key must be 16 characters",
                    raw.identity.id
                ));
            }
            let name = raw.name.unwrap_or_else(|| raw.identity.id.clone());
            Ok(DeviceConfig {
                name,
                identity: raw.identity,
            })
        })
        .collect()
}
