use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use url::Url;

use crate::error::ConfigError;

const DEFAULT_MQTT_PORT: u16 = 1883;

#[derive(Debug, Clone)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
    /// Token written before each read; `None` when the device streams on its own
    pub trigger: Option<Vec<u8>>,
    pub settle_delay: Duration,
    pub read_timeout: Duration,
}

#[derive(Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub topic: String,
    pub keep_alive: Duration,
}

impl std::fmt::Debug for MqttConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("client_id", &self.client_id)
            .field("topic", &self.topic)
            .field("keep_alive", &self.keep_alive)
            .finish()
    }
}

/// Identity carried in every outbound message's `_meta`
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceMetadata {
    pub device_id: String,
    pub location: Option<String>,
    pub location_detail: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RecorderConfig {
    pub enabled: bool,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub serial: SerialConfig,
    pub mqtt: MqttConfig,
    pub device: DeviceMetadata,
    pub recorder: RecorderConfig,
    pub poll_interval: Duration,
    pub max_storage_failures: u32,
}

impl GatewayConfig {
    pub fn new() -> Result<Self, ConfigError> {
        // Load environment variables
        dotenv::dotenv().ok();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let serial = SerialConfig {
            port: get("SERIAL_PORT").unwrap_or_else(|| "/dev/ttyACM0".into()),
            baud_rate: parse_or("SERIAL_BAUD", get("SERIAL_BAUD"), 115_200)?,
            trigger: get("SERIAL_TRIGGER").map(String::into_bytes),
            settle_delay: Duration::from_millis(parse_or(
                "SERIAL_SETTLE_MS",
                get("SERIAL_SETTLE_MS"),
                100,
            )?),
            read_timeout: Duration::from_secs(parse_or(
                "SERIAL_READ_TIMEOUT_SECS",
                get("SERIAL_READ_TIMEOUT_SECS"),
                10,
            )?),
        };

        let broker = get("MQTT_URL").ok_or(ConfigError::Missing("MQTT_URL"))?;
        let (host, port, username, password) = parse_broker_url(&broker)?;
        let client_id = get("MQTT_CLIENT_ID").unwrap_or_else(|| "RPI_001".into());

        let mqtt = MqttConfig {
            host,
            port,
            username,
            password,
            topic: get("MQTT_TOPIC").unwrap_or_else(|| "gateway-data".into()),
            keep_alive: Duration::from_secs(parse_or(
                "MQTT_KEEP_ALIVE_SECS",
                get("MQTT_KEEP_ALIVE_SECS"),
                30,
            )?),
            client_id: client_id.clone(),
        };

        let device = DeviceMetadata {
            device_id: get("DEVICE_ID").unwrap_or(client_id),
            location: get("DEVICE_LOCATION"),
            location_detail: get("DEVICE_LOCATION_DETAIL"),
        };

        let recorder = RecorderConfig {
            enabled: parse_bool("CSV_ENABLED", get("CSV_ENABLED"), false)?,
            path: get("CSV_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("sensor_data.csv")),
        };

        Ok(GatewayConfig {
            serial,
            mqtt,
            device,
            recorder,
            poll_interval: Duration::from_millis(parse_or(
                "POLL_INTERVAL_MS",
                get("POLL_INTERVAL_MS"),
                1000,
            )?),
            max_storage_failures: parse_or(
                "MAX_STORAGE_FAILURES",
                get("MAX_STORAGE_FAILURES"),
                10,
            )?,
        })
    }
}

fn invalid(key: &'static str, value: &str, reason: impl Display) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_or<T>(key: &'static str, value: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match value {
        Some(v) => v.parse().map_err(|e| invalid(key, &v, e)),
        None => Ok(default),
    }
}

fn parse_bool(
    key: &'static str,
    value: Option<String>,
    default: bool,
) -> Result<bool, ConfigError> {
    let Some(v) = value else {
        return Ok(default);
    };
    match v.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, &v, "expected true or false")),
    }
}

/// Split `mqtt://[user[:pass]@]host[:port]` into its connection parts
fn parse_broker_url(
    raw: &str,
) -> Result<(String, u16, Option<String>, Option<String>), ConfigError> {
    let url = Url::parse(raw).map_err(|e| invalid("MQTT_URL", raw, e))?;

    if !matches!(url.scheme(), "mqtt" | "tcp") {
        return Err(invalid(
            "MQTT_URL",
            raw,
            format!("unsupported scheme '{}'", url.scheme()),
        ));
    }

    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| invalid("MQTT_URL", raw, "missing host"))?
        .to_string();
    let port = url.port().unwrap_or(DEFAULT_MQTT_PORT);
    let username = Some(url.username())
        .filter(|u| !u.is_empty())
        .map(str::to_string);
    let password = url.password().map(str::to_string);

    Ok((host, port, username, password))
}
