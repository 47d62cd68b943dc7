use super::CloudSink;
use crate::error::TransmissionError;
use crate::reading::Reading;
use async_trait::async_trait;
use reqwest::{Client, Url};
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://ps.pndsn.com";
pub const DEFAULT_CHANNEL: &str = "iot_data";

/// PubNub REST publisher.
pub struct PubNubSink {
    name: String,
    client: Client,
    base_url: Url,
    publish_key: String,
    subscribe_key: String,
    channel: String,
}

impl PubNubSink {
    pub fn new(
        name: impl Into<String>,
        base_url: &str,
        publish_key: impl Into<String>,
        subscribe_key: impl Into<String>,
        channel: impl Into<String>,
    ) -> Result<Self, TransmissionError> {
        let base_url = Url::parse(base_url).map_err(|err| TransmissionError::Url(err.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(TransmissionError::Url(format!("{base_url} cannot be a base url")));
        }
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            name: name.into(),
            client,
            base_url,
            publish_key: publish_key.into(),
            subscribe_key: subscribe_key.into(),
            channel: channel.into(),
        })
    }

    fn publish_url(&self, message: &str) -> Result<Url, TransmissionError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| TransmissionError::Url(self.base_url.to_string()))?
            .pop_if_empty()
            .extend([
                "publish",
                self.publish_key.as_str(),
                self.subscribe_key.as_str(),
                "0",
                self.channel.as_str(),
                "0",
                message,
            ]);
        Ok(url)
    }
}

#[async_trait]
impl CloudSink for PubNubSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn transmit(&self, reading: &Reading, device_name: &str) -> Result<(), TransmissionError> {
        let message = serde_json::to_string(reading)?;
        let url = self.publish_url(&message)?;
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransmissionError::Rejected(status));
        }
        let body = response.text().await.unwrap_or_default();
        tracing::info!(sink = %self.name, device = device_name, channel = %self.channel, response = %body, "published to PubNub");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::spawn_http_capture;
    use axum::http::StatusCode;

    #[test]
    fn publish_url_escapes_message() {
        let sink = PubNubSink::new("pubnub", "https://ps.pndsn.com/", "pub-c", "sub-c", "iot_data")
            .unwrap();
        let url = sink.publish_url(r#"{"temp":25.0}"#).unwrap();
        assert_eq!(
            url.as_str(),
            "https://ps.pndsn.com/publish/pub-c/sub-c/0/iot_data/0/%7B%22temp%22:25.0%7D"
        );
    }

    #[tokio::test]
    async fn publishes_reading_on_channel() {
        let capture = spawn_http_capture(StatusCode::OK).await;
        let sink = PubNubSink::new("pubnub", &capture.base_url(), "pub", "sub", DEFAULT_CHANNEL)
            .unwrap();

        sink.transmit(&Reading::new().with("humidity", 0.5), "sim01")
            .await
            .unwrap();

        let requests = capture.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, "GET");
        assert!(requests[0].path.starts_with("/publish/pub/sub/0/iot_data/0/"));
    }
}
