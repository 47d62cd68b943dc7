//! Turns validated configuration into live devices and sinks.

use crate::config::{CloudConfig, CloudKind, DeviceConfig, DeviceKind};
use crate::device::{Device, MoteDevice, MoteSettings, SimDevice};
use crate::error::ConnectorError;
use crate::sink::{
    pubnub, thethings, CloudSink, MqttSink, MqttSinkSettings, MqttTls, PubNubSink, SinkAdapter,
    TheThingsSink,
};
use std::path::Path;

pub async fn build_devices(configs: &[DeviceConfig]) -> Result<Vec<Box<dyn Device>>, ConnectorError> {
    let mut devices: Vec<Box<dyn Device>> = Vec::with_capacity(configs.len());
    for config in configs {
        let device: Box<dyn Device> = match &config.kind {
            DeviceKind::Sim => Box::new(SimDevice::new(config.name.clone())),
            DeviceKind::Mote {
                address,
                port,
                timeout,
            } => {
                let mut settings = MoteSettings::new(*address);
                if let Some(port) = port {
                    settings.port = *port;
                }
                settings.timeout = *timeout;
                let mote = MoteDevice::connect(config.name.clone(), settings)
                    .await
                    .map_err(|err| {
                        ConnectorError::config(format!("device {}: {err}", config.name))
                    })?;
                Box::new(mote)
            }
        };
        tracing::info!(device = %config.name, kind = ?config.kind, "device registered");
        devices.push(device);
    }
    Ok(devices)
}

/// Builds sinks in configuration order. MQTT sinks start connecting in the
/// background, so this must run inside the tokio runtime.
pub fn build_sinks(configs: &[CloudConfig]) -> Result<Vec<SinkAdapter>, ConnectorError> {
    configs
        .iter()
        .map(|config| {
            let sink = build_sink(config)?;
            tracing::info!(
                sink = %config.name,
                policy = ?config.policy.kind(),
                scope = ?config.scope,
                "cloud sink registered"
            );
            Ok(SinkAdapter::new(sink, config.policy.fresh(), config.scope))
        })
        .collect()
}

fn build_sink(config: &CloudConfig) -> Result<Box<dyn CloudSink>, ConnectorError> {
    let name = config.name.as_str();
    let sink: Box<dyn CloudSink> = match &config.kind {
        CloudKind::Aws {
            host,
            port,
            ca_path,
            cert_path,
            key_path,
            client_id,
            topic_prefix,
        } => {
            let mut settings = MqttSinkSettings::new(name, host.clone(), *port);
            settings.tls = Some(MqttTls {
                ca: read_credential(name, ca_path)?,
                client_cert: read_credential(name, cert_path)?,
                client_key: read_credential(name, key_path)?,
            });
            apply_mqtt_overrides(&mut settings, client_id, topic_prefix);
            Box::new(MqttSink::connect(settings))
        }
        CloudKind::Mqtt {
            host,
            port,
            username,
            password,
            client_id,
            topic_prefix,
        } => {
            let mut settings = MqttSinkSettings::new(name, host.clone(), *port);
            settings.username = username.clone();
            settings.password = password.clone();
            apply_mqtt_overrides(&mut settings, client_id, topic_prefix);
            Box::new(MqttSink::connect(settings))
        }
        CloudKind::TheThings { base_url, tokens } => {
            let base_url = base_url.as_deref().unwrap_or(thethings::DEFAULT_BASE_URL);
            Box::new(
                TheThingsSink::new(name, base_url, tokens.clone())
                    .map_err(|err| ConnectorError::config(format!("cloud {name}: {err}")))?,
            )
        }
        CloudKind::PubNub {
            base_url,
            publish_key,
            subscribe_key,
            channel,
        } => {
            let base_url = base_url.as_deref().unwrap_or(pubnub::DEFAULT_BASE_URL);
            let channel = channel.as_deref().unwrap_or(pubnub::DEFAULT_CHANNEL);
            Box::new(
                PubNubSink::new(name, base_url, publish_key.clone(), subscribe_key.clone(), channel)
                    .map_err(|err| ConnectorError::config(format!("cloud {name}: {err}")))?,
            )
        }
    };
    Ok(sink)
}

fn apply_mqtt_overrides(
    settings: &mut MqttSinkSettings,
    client_id: &Option<String>,
    topic_prefix: &Option<String>,
) {
    if let Some(client_id) = client_id {
        settings.client_id = client_id.clone();
    }
    if let Some(prefix) = topic_prefix {
        settings.topic_prefix = prefix.trim_end_matches('/').to_string();
    }
}

fn read_credential(cloud: &str, path: &Path) -> Result<Vec<u8>, ConnectorError> {
    std::fs::read(path).map_err(|err| {
        ConnectorError::config(format!("cloud {cloud}: unable to read {}: {err}", path.display()))
    })
}
