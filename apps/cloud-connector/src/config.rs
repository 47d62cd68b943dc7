use crate::error::ConnectorError;
use crate::ordered::OrderedEntries;
use crate::policy::{PolicyScope, SendPolicy};
use crate::tsdb::{StoreTarget, TimescaleSettings};
use dotenvy::dotenv;
use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "config.json";
const DEFAULT_DB_POOL_SIZE: u32 = 5;
const DEFAULT_MOTE_TIMEOUT_MS: u64 = 3000;
const DEFAULT_AWS_PORT: u16 = 8883;
const DEFAULT_MQTT_PORT: u16 = 1883;

#[derive(Clone, Debug)]
pub struct Config {
    pub config_path: PathBuf,
    pub store: StoreTarget,
    pub db_pool_size: u32,
    pub read_interval: Duration,
    pub devices: Vec<DeviceConfig>,
    pub clouds: Vec<CloudConfig>,
    pub http_bind: Option<SocketAddr>,
    pub otlp_endpoint: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DeviceConfig {
    pub name: String,
    pub kind: DeviceKind,
}

#[derive(Clone, Debug, PartialEq)]
pub enum DeviceKind {
    Sim,
    Mote {
        address: IpAddr,
        port: Option<u16>,
        timeout: Duration,
    },
}

#[derive(Clone, Debug)]
pub struct CloudConfig {
    /// The configuration key; also the identity stored with readings.
    pub name: String,
    pub kind: CloudKind,
    pub policy: SendPolicy,
    pub scope: PolicyScope,
}

#[derive(Clone, Debug, PartialEq)]
pub enum CloudKind {
    Aws {
        host: String,
        port: u16,
        ca_path: PathBuf,
        cert_path: PathBuf,
        key_path: PathBuf,
        client_id: Option<String>,
        topic_prefix: Option<String>,
    },
    Mqtt {
        host: String,
        port: u16,
        username: Option<String>,
        password: Option<String>,
        client_id: Option<String>,
        topic_prefix: Option<String>,
    },
    TheThings {
        base_url: Option<String>,
        tokens: HashMap<String, String>,
    },
    PubNub {
        base_url: Option<String>,
        publish_key: String,
        subscribe_key: String,
        channel: Option<String>,
    },
}

/// Values taken from the process environment that take precedence over the
/// JSON document.
#[derive(Clone, Debug, Default)]
pub struct EnvOverrides {
    pub database_url: Option<String>,
    pub http_bind: Option<String>,
    pub read_interval_secs: Option<String>,
    pub db_pool_size: Option<String>,
    pub otlp_endpoint: Option<String>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        Self {
            database_url: non_empty_env("CLOUD_CONNECTOR_DATABASE_URL"),
            http_bind: non_empty_env("CLOUD_CONNECTOR_HTTP_BIND"),
            read_interval_secs: non_empty_env("CLOUD_CONNECTOR_READ_INTERVAL_SECS"),
            db_pool_size: non_empty_env("CLOUD_CONNECTOR_DB_POOL_SIZE"),
            otlp_endpoint: non_empty_env("OTEL_EXPORTER_OTLP_ENDPOINT"),
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn config_path() -> PathBuf {
    non_empty_env("CLOUD_CONNECTOR_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

impl Config {
    pub fn from_env() -> Result<Self, ConnectorError> {
        dotenv().ok();
        Self::load(&config_path(), EnvOverrides::from_env())
    }

    pub fn load(path: &Path, overrides: EnvOverrides) -> Result<Self, ConnectorError> {
        let contents = std::fs::read(path).map_err(|err| {
            ConnectorError::config(format!("unable to read {}: {err}", path.display()))
        })?;
        let mut config = Self::from_slice(contents, overrides)?;
        config.config_path = path.to_path_buf();
        Ok(config)
    }

    pub fn from_slice(mut bytes: Vec<u8>, overrides: EnvOverrides) -> Result<Self, ConnectorError> {
        let raw: RawConfig = simd_json::serde::from_slice(&mut bytes)
            .map_err(|err| ConnectorError::config(format!("invalid configuration document: {err}")))?;
        Self::from_raw(raw, overrides)
    }

    fn from_raw(raw: RawConfig, overrides: EnvOverrides) -> Result<Self, ConnectorError> {
        let store = match (overrides.database_url, raw.tsdb) {
            (Some(url), _) => StoreTarget::Url(url),
            (None, Some(tsdb)) => StoreTarget::Settings(tsdb.timescale.into_settings()),
            (None, None) => {
                return Err(ConnectorError::config(
                    "tsdb section is required (or set CLOUD_CONNECTOR_DATABASE_URL)",
                ))
            }
        };

        let db_pool_size = match overrides.db_pool_size {
            Some(value) => value.parse::<u32>().map_err(|err| {
                ConnectorError::config(format!("CLOUD_CONNECTOR_DB_POOL_SIZE={value}: {err}"))
            })?,
            None => DEFAULT_DB_POOL_SIZE,
        };

        let raw_devices = raw.devices.unwrap_or_default();
        let read_interval_secs = match overrides.read_interval_secs {
            Some(value) => Some(value.parse::<f64>().map_err(|err| {
                ConnectorError::config(format!("CLOUD_CONNECTOR_READ_INTERVAL_SECS={value}: {err}"))
            })?),
            None => raw_devices.read_interval,
        };

        let devices = raw_devices
            .entries
            .into_iter()
            .map(|(key, device)| device.into_config(key))
            .collect::<Result<Vec<_>, _>>()?;

        // Without devices the runner never ticks, so the interval is moot.
        let read_interval = match read_interval_secs {
            Some(secs) => positive_seconds("devices.read_interval", secs)?,
            None if devices.is_empty() => Duration::ZERO,
            None => {
                return Err(ConnectorError::config(
                    "devices.read_interval is required when devices are configured",
                ))
            }
        };

        let clouds = raw
            .cloud
            .into_inner()
            .into_iter()
            .map(|(key, value)| parse_cloud(key, value))
            .collect::<Result<Vec<_>, _>>()?;

        let http_bind = overrides
            .http_bind
            .or(raw.http.and_then(|http| http.bind))
            .map(|bind| {
                bind.parse::<SocketAddr>()
                    .map_err(|err| ConnectorError::config(format!("http bind {bind}: {err}")))
            })
            .transpose()?;

        Ok(Self {
            config_path: PathBuf::from(DEFAULT_CONFIG_PATH),
            store,
            db_pool_size,
            read_interval,
            devices,
            clouds,
            http_bind,
            otlp_endpoint: overrides.otlp_endpoint,
        })
    }
}

fn seconds(field: &str, value: f64) -> Result<Duration, ConnectorError> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| ConnectorError::config(format!("{field} must be a non-negative number of seconds, got {value}")))
}

fn positive_seconds(field: &str, value: f64) -> Result<Duration, ConnectorError> {
    let duration = seconds(field, value)?;
    if duration.is_zero() {
        return Err(ConnectorError::config(format!("{field} must be positive")));
    }
    Ok(duration)
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    tsdb: Option<RawTsdb>,
    #[serde(default)]
    devices: Option<RawDevices>,
    #[serde(default)]
    cloud: OrderedEntries<serde_json::Value>,
    #[serde(default)]
    http: Option<RawHttp>,
}

#[derive(Debug, Deserialize)]
struct RawTsdb {
    timescale: RawTimescale,
}

#[derive(Debug, Deserialize)]
struct RawTimescale {
    host: String,
    #[serde(default = "default_pg_port")]
    port: u16,
    user: String,
    #[serde(default)]
    password: String,
    database: String,
}

fn default_pg_port() -> u16 {
    5432
}

impl RawTimescale {
    fn into_settings(self) -> TimescaleSettings {
        TimescaleSettings {
            host: self.host,
            port: self.port,
            user: self.user,
            password: self.password,
            database: self.database,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawHttp {
    #[serde(default)]
    bind: Option<String>,
}

/// The `devices` object mixes the `read_interval` scalar with one entry per
/// device, in polling order.
#[derive(Debug, Default)]
struct RawDevices {
    read_interval: Option<f64>,
    entries: Vec<(String, RawDevice)>,
}

impl<'de> Deserialize<'de> for RawDevices {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DevicesVisitor;

        impl<'de> Visitor<'de> for DevicesVisitor {
            type Value = RawDevices;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a devices object")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut devices = RawDevices::default();
                while let Some(key) = map.next_key::<String>()? {
                    if key == "read_interval" {
                        if devices.read_interval.is_some() {
                            return Err(de::Error::duplicate_field("read_interval"));
                        }
                        // Any JSON number; integers are the common case.
                        let seconds: serde_json::Number = map.next_value()?;
                        devices.read_interval = seconds.as_f64();
                    } else {
                        let device: RawDevice = map.next_value()?;
                        devices.entries.push((key, device));
                    }
                }
                Ok(devices)
            }
        }

        deserializer.deserialize_map(DevicesVisitor)
    }
}

#[derive(Debug, Deserialize)]
struct RawDevice {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    ipv6: Option<String>,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

impl RawDevice {
    fn into_config(self, key: String) -> Result<DeviceConfig, ConnectorError> {
        let name = self.name.unwrap_or(key);
        let kind = match self.kind.to_ascii_lowercase().as_str() {
            "sim" => DeviceKind::Sim,
            "mote" => {
                let ipv6 = self.ipv6.ok_or_else(|| {
                    ConnectorError::config(format!("device {name}: mote requires ipv6"))
                })?;
                let address = ipv6
                    .trim_start_matches('[')
                    .trim_end_matches(']')
                    .parse::<IpAddr>()
                    .map_err(|err| ConnectorError::config(format!("device {name}: ipv6 {ipv6}: {err}")))?;
                DeviceKind::Mote {
                    address,
                    port: self.port,
                    timeout: Duration::from_millis(self.timeout_ms.unwrap_or(DEFAULT_MOTE_TIMEOUT_MS)),
                }
            }
            other => {
                return Err(ConnectorError::config(format!(
                    "device {name}: unknown device type {other}"
                )))
            }
        };
        Ok(DeviceConfig { name, kind })
    }
}

#[derive(Debug, Deserialize)]
struct RawStrategy {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    parameters: Option<serde_json::Value>,
    #[serde(default)]
    scope: PolicyScope,
}

#[derive(Debug, Deserialize)]
struct VariationParameters {
    time_low: f64,
    time_high: f64,
    #[serde(default)]
    variability: HashMap<String, f64>,
}

#[derive(Debug, Deserialize)]
struct TimeLimitParameters {
    #[serde(alias = "min_interval")]
    seconds: f64,
}

#[derive(Debug, Deserialize)]
struct MessageLimitParameters {
    messages_per_day: f64,
}

impl RawStrategy {
    fn into_policy(self, cloud: &str) -> Result<(SendPolicy, PolicyScope), ConnectorError> {
        let policy = match self.kind.as_str() {
            "All" => SendPolicy::all(),
            "Variation" => {
                let params: VariationParameters = strategy_parameters(cloud, &self.kind, self.parameters)?;
                SendPolicy::variation(
                    seconds("variation time_low", params.time_low)?,
                    seconds("variation time_high", params.time_high)?,
                    params.variability,
                )?
            }
            "TimeLimit" => {
                let params: TimeLimitParameters = strategy_parameters(cloud, &self.kind, self.parameters)?;
                SendPolicy::time_limit(seconds("time limit seconds", params.seconds)?)
            }
            "MessageLimit" => {
                let params: MessageLimitParameters =
                    strategy_parameters(cloud, &self.kind, self.parameters)?;
                SendPolicy::message_limit(params.messages_per_day)?
            }
            other => {
                return Err(ConnectorError::config(format!(
                    "cloud {cloud}: unknown strategy type {other}"
                )))
            }
        };
        Ok((policy, self.scope))
    }
}

fn strategy_parameters<T>(
    cloud: &str,
    kind: &str,
    parameters: Option<serde_json::Value>,
) -> Result<T, ConnectorError>
where
    T: serde::de::DeserializeOwned,
{
    let parameters = parameters.ok_or_else(|| {
        ConnectorError::config(format!("cloud {cloud}: strategy {kind} requires parameters"))
    })?;
    serde_json::from_value(parameters).map_err(|err| {
        ConnectorError::config(format!("cloud {cloud}: strategy {kind} parameters: {err}"))
    })
}

#[derive(Debug, Deserialize)]
struct RawAws {
    host: String,
    #[serde(default)]
    port: Option<u16>,
    ca_path: PathBuf,
    cert_path: PathBuf,
    key_path: PathBuf,
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    topic_prefix: Option<String>,
    #[serde(default)]
    strategy: Option<RawStrategy>,
}

#[derive(Debug, Deserialize)]
struct RawMqtt {
    host: String,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    topic_prefix: Option<String>,
    #[serde(default)]
    strategy: Option<RawStrategy>,
}

#[derive(Debug, Deserialize)]
struct RawTheThings {
    #[serde(default)]
    base_url: Option<String>,
    tokens: HashMap<String, String>,
    #[serde(default)]
    strategy: Option<RawStrategy>,
}

#[derive(Debug, Deserialize)]
struct RawPubNub {
    #[serde(default)]
    base_url: Option<String>,
    publish_key: String,
    subscribe_key: String,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    strategy: Option<RawStrategy>,
}

fn cloud_entry<T>(name: &str, value: serde_json::Value) -> Result<T, ConnectorError>
where
    T: serde::de::DeserializeOwned,
{
    serde_json::from_value(value)
        .map_err(|err| ConnectorError::config(format!("cloud {name}: {err}")))
}

fn parse_cloud(name: String, value: serde_json::Value) -> Result<CloudConfig, ConnectorError> {
    let (kind, strategy) = match name.as_str() {
        "aws" => {
            let raw: RawAws = cloud_entry(&name, value)?;
            (
                CloudKind::Aws {
                    host: raw.host,
                    port: raw.port.unwrap_or(DEFAULT_AWS_PORT),
                    ca_path: raw.ca_path,
                    cert_path: raw.cert_path,
                    key_path: raw.key_path,
                    client_id: raw.client_id,
                    topic_prefix: raw.topic_prefix,
                },
                raw.strategy,
            )
        }
        "mqtt" => {
            let raw: RawMqtt = cloud_entry(&name, value)?;
            (
                CloudKind::Mqtt {
                    host: raw.host,
                    port: raw.port.unwrap_or(DEFAULT_MQTT_PORT),
                    username: raw.username,
                    password: raw.password,
                    client_id: raw.client_id,
                    topic_prefix: raw.topic_prefix,
                },
                raw.strategy,
            )
        }
        "thethingsio" => {
            let raw: RawTheThings = cloud_entry(&name, value)?;
            (
                CloudKind::TheThings {
                    base_url: raw.base_url,
                    tokens: raw.tokens,
                },
                raw.strategy,
            )
        }
        "pubnub" => {
            let raw: RawPubNub = cloud_entry(&name, value)?;
            (
                CloudKind::PubNub {
                    base_url: raw.base_url,
                    publish_key: raw.publish_key,
                    subscribe_key: raw.subscribe_key,
                    channel: raw.channel,
                },
                raw.strategy,
            )
        }
        other => {
            return Err(ConnectorError::config(format!("unknown cloud kind {other}")));
        }
    };

    let (policy, scope) = match strategy {
        Some(strategy) => strategy.into_policy(&name)?,
        None => (SendPolicy::all(), PolicyScope::default()),
    };
    Ok(CloudConfig {
        name,
        kind,
        policy,
        scope,
    })
}
