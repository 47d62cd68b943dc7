use super::CloudSink;
use crate::error::TransmissionError;
use crate::reading::Reading;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://api.thethings.io/v2/things";

#[derive(Serialize)]
struct ThingValue<'a> {
    key: &'a str,
    value: f64,
}

#[derive(Serialize)]
struct ThingWrite<'a> {
    values: Vec<ThingValue<'a>>,
}

/// thethings.io REST writer; each device writes with its own thing token.
pub struct TheThingsSink {
    name: String,
    client: Client,
    base_url: String,
    tokens: HashMap<String, String>,
}

impl TheThingsSink {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        tokens: HashMap<String, String>,
    ) -> Result<Self, TransmissionError> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            name: name.into(),
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tokens,
        })
    }
}

#[async_trait]
impl CloudSink for TheThingsSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn transmit(&self, reading: &Reading, device_name: &str) -> Result<(), TransmissionError> {
        let Some(token) = self.tokens.get(device_name) else {
            tracing::warn!(sink = %self.name, device = device_name, "device not found on thethings.io");
            return Err(TransmissionError::UnknownDevice(device_name.to_string()));
        };

        let payload = ThingWrite {
            values: reading
                .iter()
                .map(|(key, value)| ThingValue { key, value })
                .collect(),
        };
        let url = format!("{}/{}", self.base_url, token);
        tracing::debug!(sink = %self.name, device = device_name, "sending data to thethings.io");
        let response = self
            .client
            .post(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransmissionError::Rejected(status));
        }
        tracing::info!(sink = %self.name, device = device_name, status = %status, "sent to thethings.io");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::spawn_http_capture;
    use axum::http::StatusCode;

    #[tokio::test]
    async fn posts_values_to_device_token() {
        let capture = spawn_http_capture(StatusCode::CREATED).await;
        let tokens = HashMap::from([("sim01".to_string(), "tok-1".to_string())]);
        let sink = TheThingsSink::new("thethingsio", capture.base_url(), tokens).unwrap();

        sink.transmit(&Reading::new().with("temperature", 21.5), "sim01")
            .await
            .unwrap();

        let requests = capture.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].path, "/tok-1");
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(
            body,
            serde_json::json!({"values": [{"key": "temperature", "value": 21.5}]})
        );
    }

    #[tokio::test]
    async fn unknown_device_is_an_error() {
        let sink = TheThingsSink::new("thethingsio", "http://127.0.0.1:1", HashMap::new()).unwrap();
        let result = sink.transmit(&Reading::new().with("t", 1.0), "ghost").await;
        assert!(matches!(result, Err(TransmissionError::UnknownDevice(device)) if device == "ghost"));
    }

    #[tokio::test]
    async fn error_status_is_rejected() {
        let capture = spawn_http_capture(StatusCode::UNAUTHORIZED).await;
        let tokens = HashMap::from([("sim01".to_string(), "bad".to_string())]);
        let sink = TheThingsSink::new("thethingsio", capture.base_url(), tokens).unwrap();
        let result = sink.transmit(&Reading::new().with("t", 1.0), "sim01").await;
        assert!(matches!(result, Err(TransmissionError::Rejected(status)) if status == 401));
    }
}
