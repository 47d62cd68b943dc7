use super::coap::{self, Message, CODE_EMPTY, TYPE_ACK, TYPE_CON, TYPE_RST};
use super::{round2, Device};
use crate::error::DeviceReadError;
use crate::reading::Reading;
use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::time::Instant;

const TEMPERATURE_PATH: &str = "s/t";
const HUMIDITY_PATH: &str = "s/h";
const LIGHT_PATH: &str = "s/l";
const MAX_DATAGRAM: usize = 1152;

#[derive(Debug, Clone)]
pub struct MoteSettings {
    pub address: IpAddr,
    pub port: u16,
    pub timeout: Duration,
}

impl MoteSettings {
    pub fn new(address: IpAddr) -> Self {
        Self {
            address,
            port: coap::DEFAULT_PORT,
            timeout: Duration::from_secs(3),
        }
    }
}

/// OpenMote environment sensor queried over CoAP.
#[derive(Debug)]
pub struct MoteDevice {
    name: String,
    settings: MoteSettings,
    socket: Mutex<Option<UdpSocket>>,
    next_message_id: AtomicU16,
}

impl MoteDevice {
    pub async fn connect(
        name: impl Into<String>,
        settings: MoteSettings,
    ) -> Result<Self, DeviceReadError> {
        let name = name.into();
        let local: SocketAddr = match settings.address {
            IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            IpAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(local).await?;
        socket
            .connect(SocketAddr::new(settings.address, settings.port))
            .await?;
        tracing::debug!(device = %name, address = %settings.address, port = settings.port, "mote socket ready");
        Ok(Self {
            name,
            settings,
            socket: Mutex::new(Some(socket)),
            next_message_id: AtomicU16::new(rand::random()),
        })
    }

    async fn get_resource(&self, path: &str) -> Result<Vec<u8>, DeviceReadError> {
        let guard = self.socket.lock().await;
        let socket = guard.as_ref().ok_or(DeviceReadError::Closed)?;

        let message_id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
        let token: [u8; 4] = rand::random();
        let request = coap::encode_get(message_id, &token, path);
        tracing::debug!(device = %self.name, address = %self.settings.address, path, "requesting mote resource");
        socket.send(&request).await?;

        let deadline = Instant::now() + self.settings.timeout;
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let len = match tokio::time::timeout_at(deadline, socket.recv(&mut buf)).await {
                Ok(received) => received?,
                Err(_) => {
                    tracing::error!(device = %self.name, path, "CoAP timeout");
                    return Err(DeviceReadError::Timeout(self.settings.timeout));
                }
            };
            let message = match coap::decode(&buf[..len]) {
                Ok(message) => message,
                Err(err) => {
                    tracing::debug!(device = %self.name, error = %err, "ignoring undecodable datagram");
                    continue;
                }
            };
            if message.kind == TYPE_RST && message.message_id == message_id {
                return Err(DeviceReadError::Malformed("request reset by mote".to_string()));
            }
            if message.token != token {
                continue;
            }
            if message.kind == TYPE_ACK && message.code == CODE_EMPTY {
                // Separate response follows.
                continue;
            }
            if message.kind == TYPE_CON {
                socket.send(&coap::encode_empty_ack(message.message_id)).await?;
            }
            return content(message);
        }
    }

    async fn read_measurement(
        &self,
        path: &str,
        convert: fn(&[u8]) -> Result<f64, DeviceReadError>,
    ) -> Result<f64, DeviceReadError> {
        let payload = self.get_resource(path).await?;
        let value = convert(&payload)?;
        tracing::debug!(device = %self.name, path, value, "read mote value");
        Ok(value)
    }
}

fn content(message: Message) -> Result<Vec<u8>, DeviceReadError> {
    if message.code_class() != 2 {
        return Err(DeviceReadError::Status {
            class: message.code_class(),
            detail: message.code_detail(),
        });
    }
    Ok(message.payload)
}

fn two_bytes(raw: &[u8]) -> Result<(u8, u8), DeviceReadError> {
    match raw {
        [first, second, ..] => Ok((*first, *second)),
        _ => Err(DeviceReadError::Malformed(format!(
            "expected two bytes, got {}",
            raw.len()
        ))),
    }
}

/// Celsius from the SHT21 raw word.
pub(crate) fn temperature_from_raw(raw: &[u8]) -> Result<f64, DeviceReadError> {
    let (high, low) = two_bytes(raw)?;
    let word = ((high as u32) << 8) + low as u32;
    Ok(round2(-46.86 + 175.72 * word as f64 / 65536.0))
}

/// Relative humidity from the SHT21 raw word.
pub(crate) fn humidity_from_raw(raw: &[u8]) -> Result<f64, DeviceReadError> {
    let (high, low) = two_bytes(raw)?;
    let word = ((high as u32) << 8) + low as u32;
    Ok(round2(-6.0 + 125.0 * word as f64 / 65536.0))
}

/// Lux from the MAX44009 exponent/mantissa pair.
pub(crate) fn light_from_raw(raw: &[u8]) -> Result<f64, DeviceReadError> {
    let (exponent, mantissa) = two_bytes(raw)?;
    Ok(round2(2f64.powi(exponent as i32) * mantissa as f64 * 0.045))
}

#[async_trait]
impl Device for MoteDevice {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_data(&self) -> Result<Reading, DeviceReadError> {
        let temperature = self
            .read_measurement(TEMPERATURE_PATH, temperature_from_raw)
            .await?;
        let humidity = self.read_measurement(HUMIDITY_PATH, humidity_from_raw).await?;
        let light = self.read_measurement(LIGHT_PATH, light_from_raw).await?;
        Ok(Reading::new()
            .with("temperature", temperature)
            .with("humidity", humidity)
            .with("light", light))
    }

    async fn close(&self) -> Result<(), DeviceReadError> {
        if self.socket.lock().await.take().is_some() {
            tracing::debug!(device = %self.name, "mote socket closed");
        }
        Ok(())
    }
}
