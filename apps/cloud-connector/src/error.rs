use thiserror::Error;

/// Failures that abort startup or a whole cycle.
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("time-series store unreachable: {0}")]
    ConnectionTimeout(String),
    #[error("time-series store error: {0}")]
    Store(#[from] sqlx::Error),
    #[error("cycle failed: {0}")]
    Cycle(String),
}

impl ConnectorError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}

/// A single device could not be read this cycle.
#[derive(Debug, Error)]
pub enum DeviceReadError {
    #[error("device i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("device did not answer within {0:?}")]
    Timeout(std::time::Duration),
    #[error("malformed device response: {0}")]
    Malformed(String),
    #[error("device answered with code {class}.{detail:02}")]
    Status { class: u8, detail: u8 },
    #[error("device connection is closed")]
    Closed,
}

/// A single cloud destination failed to take a reading.
#[derive(Debug, Error)]
pub enum TransmissionError {
    #[error("not connected to {0}")]
    NotConnected(String),
    #[error("publish failed: {0}")]
    Publish(#[from] rumqttc::ClientError),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("destination rejected reading with status {0}")]
    Rejected(reqwest::StatusCode),
    #[error("device <{0}> is not registered on this destination")]
    UnknownDevice(String),
    #[error("failed to encode reading: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("invalid destination url: {0}")]
    Url(String),
    #[error("transmission panicked")]
    Panicked,
}
