use super::CloudSink;
use crate::error::TransmissionError;
use crate::reading::Reading;
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS, TlsConfiguration, Transport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;

pub const DEFAULT_TOPIC_PREFIX: &str = "motes";
pub const DEFAULT_RETRIES: u32 = 7;
pub const DEFAULT_RETRY_WAIT: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct MqttTls {
    pub ca: Vec<u8>,
    pub client_cert: Vec<u8>,
    pub client_key: Vec<u8>,
}

impl std::fmt::Debug for MqttTls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttTls").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct MqttSinkSettings {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: Option<MqttTls>,
    pub keepalive: Duration,
    pub topic_prefix: String,
    pub retries: u32,
    pub retry_wait: Duration,
}

impl MqttSinkSettings {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        let name = name.into();
        Self {
            client_id: format!("cloud-connector-{}-{}", name, std::process::id()),
            name,
            host: host.into(),
            port,
            username: None,
            password: None,
            tls: None,
            keepalive: Duration::from_secs(60),
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            retries: DEFAULT_RETRIES,
            retry_wait: DEFAULT_RETRY_WAIT,
        }
    }
}

/// Publishes readings as JSON to `<prefix>/<device>` on an MQTT broker
/// (AWS IoT or a plain broker).
pub struct MqttSink {
    name: String,
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    topic_prefix: String,
    retries: u32,
    retry_wait: Duration,
    poller: JoinHandle<()>,
}

impl MqttSink {
    pub fn connect(settings: MqttSinkSettings) -> Self {
        let mut options =
            MqttOptions::new(settings.client_id.clone(), settings.host.clone(), settings.port);
        options.set_keep_alive(settings.keepalive);
        if let Some(username) = &settings.username {
            options.set_credentials(
                username.clone(),
                settings.password.clone().unwrap_or_default(),
            );
        }
        if let Some(tls) = settings.tls.clone() {
            options.set_transport(Transport::Tls(TlsConfiguration::Simple {
                ca: tls.ca,
                alpn: None,
                client_auth: Some((tls.client_cert, tls.client_key)),
            }));
        }

        let (client, mut eventloop) = AsyncClient::new(options, 32);
        let connected = Arc::new(AtomicBool::new(false));
        let poller_connected = connected.clone();
        let sink_name = settings.name.clone();
        let poller = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                        poller_connected.store(true, Ordering::Relaxed);
                        tracing::debug!(sink = %sink_name, code = ?ack.code, "MQTT connection returned result");
                    }
                    Ok(Event::Incoming(Incoming::Disconnect)) => {
                        poller_connected.store(false, Ordering::Relaxed);
                    }
                    Ok(_) => {}
                    Err(err) => {
                        if poller_connected.swap(false, Ordering::Relaxed) {
                            tracing::warn!(sink = %sink_name, error = %err, "MQTT connection lost");
                        } else {
                            tracing::debug!(sink = %sink_name, error = %err, "MQTT connect attempt failed");
                        }
                        sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });
        tracing::info!(sink = %settings.name, host = %settings.host, port = settings.port, tls = settings.tls.is_some(), "MQTT sink configured");

        Self {
            name: settings.name,
            client,
            connected,
            topic_prefix: settings.topic_prefix,
            retries: settings.retries.max(1),
            retry_wait: settings.retry_wait,
            poller,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl CloudSink for MqttSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn transmit(&self, reading: &Reading, device_name: &str) -> Result<(), TransmissionError> {
        let topic = format!("{}/{}", self.topic_prefix, device_name);
        let payload = serde_json::to_vec(reading)?;

        for attempt in 1..=self.retries {
            if self.is_connected() {
                self.client
                    .publish(topic.as_str(), QoS::AtLeastOnce, false, payload)
                    .await?;
                tracing::info!(sink = %self.name, topic = %topic, "sent reading");
                return Ok(());
            }
            tracing::error!(sink = %self.name, attempt, "not connected to MQTT broker");
            if attempt < self.retries {
                sleep(self.retry_wait).await;
            }
        }
        Err(TransmissionError::NotConnected(self.name.clone()))
    }

    async fn close(&self) {
        if let Err(err) = self.client.disconnect().await {
            tracing::debug!(sink = %self.name, error = %err, "MQTT disconnect failed");
        }
        self.poller.abort();
    }
}

impl Drop for MqttSink {
    fn drop(&mut self) {
        self.poller.abort();
    }
}
